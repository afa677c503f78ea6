//! The interface the core drives against remote worker agents.
//!
//! A worker agent hosts a container runtime and a volume daemon. The
//! core never talks to either directly; it goes through these traits,
//! which the in-process [`mem`](crate::mem) agent also implements for
//! tests and local development.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use gantry_types::VersionResult;

use crate::error::WorkerError;
use crate::tarball::Encoding;

/// Handle to a named directory tree produced by a leaf step. The
/// worker named here is authoritative for the volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub worker: String,
    pub volume: String,
    /// Set for get outputs: lets a destination worker record the cache
    /// identity after replication so later fetches short-circuit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_cache_key: Option<String>,
}

impl Artifact {
    #[must_use]
    pub fn new(worker: impl Into<String>, volume: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            volume: volume.into(),
            resource_cache_key: None,
        }
    }
}

/// Lifecycle state of a worker. Only running workers receive work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Running,
    Stalled,
    Landing,
    Retiring,
}

/// A base resource type installed on a worker, importable as a
/// container image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResourceType {
    pub resource_type: String,
    /// Path of the type's image on the worker.
    pub image_path: String,
    pub version: String,
    pub privileged: bool,
}

/// Snapshot of a worker used by placement.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub name: String,
    pub platform: String,
    pub tags: Vec<String>,
    /// `None` for shared workers, `Some` for team-owned ones.
    pub team_id: Option<i64>,
    pub state: WorkerState,
    pub resource_types: Vec<WorkerResourceType>,
    pub build_containers: usize,
    pub active_tasks: usize,
    /// The worker can serve and accept direct peer streams.
    pub p2p_streaming: bool,
}

/// How a new volume gets its initial content.
#[derive(Debug, Clone)]
pub enum VolumeStrategy {
    Empty,
    /// Copy-on-write child of an existing volume on the same worker.
    CowOf { parent: String },
    /// Import from a path on the worker (base resource type images).
    Import { path: String },
}

#[derive(Debug, Clone)]
pub struct VolumeSpec {
    pub strategy: VolumeStrategy,
    pub privileged: bool,
}

/// A process launch request.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub path: String,
    pub args: Vec<String>,
    pub dir: Option<String>,
    pub user: Option<String>,
    pub env: Vec<(String, String)>,
    /// JSON request piped to stdin (resource protocol).
    pub stdin: Option<Bytes>,
    /// Collect stdout as the protocol response instead of relaying it
    /// to the log sink.
    pub capture_stdout: bool,
}

/// Receives a process's log output line by line.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Log destinations for a running process.
#[derive(Clone)]
pub struct ProcessIo {
    pub stdout: LogSink,
    pub stderr: LogSink,
}

impl ProcessIo {
    /// Discard all output.
    #[must_use]
    pub fn discard() -> Self {
        Self {
            stdout: Arc::new(|_| {}),
            stderr: Arc::new(|_| {}),
        }
    }
}

impl std::fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProcessIo")
    }
}

/// Terminal state of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub status: i32,
    /// Captured protocol response; empty unless `capture_stdout`.
    pub stdout: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Polite stop; the process gets a grace period.
    Terminate,
    /// Immediate stop.
    Kill,
}

/// A spawned process inside a container.
#[async_trait]
pub trait Process: Send + Sync {
    /// Wait for the process to exit.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] if the worker connection drops.
    async fn wait(&self) -> Result<ProcessExit, WorkerError>;

    /// Deliver a signal.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] if the worker connection drops.
    async fn signal(&self, signal: ProcessSignal) -> Result<(), WorkerError>;
}

/// A volume mounted into a container at a path.
#[derive(Clone)]
pub struct Mount {
    pub volume: Arc<dyn Volume>,
    pub path: String,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mount({} -> {})", self.volume.handle(), self.path)
    }
}

/// Runtime-level container creation request: the image is already
/// resolved to a rootfs URL and the mounts to concrete volumes.
#[derive(Debug, Clone)]
pub struct ContainerCreateSpec {
    pub rootfs_url: String,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    pub user: Option<String>,
}

/// A created (or re-attached) container.
#[async_trait]
pub trait Container: Send + Sync {
    fn handle(&self) -> &str;

    /// The volumes mounted at creation, for locating output volumes
    /// after re-attach.
    fn mounts(&self) -> Vec<Mount>;

    /// Spawn a process inside the container.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] if the spawn fails.
    async fn run(&self, spec: ProcessSpec, io: ProcessIo) -> Result<Arc<dyn Process>, WorkerError>;
}

/// A mountable directory tree on a worker.
#[async_trait]
pub trait Volume: Send + Sync {
    fn handle(&self) -> &str;
    fn worker(&self) -> &str;

    /// Mount path of the volume on its worker.
    fn path(&self) -> String;

    /// Create a copy-on-write child on the same worker.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] if the volume daemon rejects the child.
    async fn cow(&self, privileged: bool) -> Result<Arc<dyn Volume>, WorkerError>;

    /// Produce a framed tar stream of `path` (`"."` for the whole
    /// volume).
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] on stream failure.
    async fn stream_out(&self, path: &str, encoding: Encoding) -> Result<Bytes, WorkerError>;

    /// Expand a framed tar stream into `path`. Implementations enforce
    /// the archive path rules (relative, no `..`).
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::UnsafeArchivePath`] for escaping entries,
    /// other [`WorkerError`] values on stream failure.
    async fn stream_in(
        &self,
        path: &str,
        encoding: Encoding,
        content: Bytes,
    ) -> Result<(), WorkerError>;

    /// Read a single file out of the volume.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stream`] when the file does not exist.
    async fn stream_file(&self, path: &str) -> Result<Bytes, WorkerError>;

    /// URL a peer worker can PUT a framed tar stream to, landing in
    /// `path` of this volume.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the worker does not advertise
    /// peer-to-peer streaming.
    async fn stream_in_p2p_url(&self, path: &str) -> Result<String, WorkerError>;

    /// Mark this volume as the initialized cache for a fetched
    /// resource version.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] on failure to record.
    async fn initialize_resource_cache(
        &self,
        cache_key: &str,
        result: Option<VersionResult>,
    ) -> Result<(), WorkerError>;

    /// Record that this volume replicates a cache that originated on
    /// `source_worker`, so later fetches of the same version on this
    /// worker short-circuit.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] on failure to record.
    async fn initialize_streamed_resource_cache(
        &self,
        cache_key: &str,
        source_worker: &str,
    ) -> Result<(), WorkerError>;
}

/// One worker agent: container runtime plus volume daemon.
#[async_trait]
pub trait WorkerAgent: Send + Sync {
    fn name(&self) -> &str;
    fn info(&self) -> WorkerInfo;

    /// # Errors
    ///
    /// Returns [`WorkerError`] if the volume daemon rejects the spec.
    async fn create_volume(&self, spec: VolumeSpec) -> Result<Arc<dyn Volume>, WorkerError>;

    /// # Errors
    ///
    /// Returns [`WorkerError`] on agent failure.
    async fn find_volume(&self, handle: &str) -> Result<Option<Arc<dyn Volume>>, WorkerError>;

    /// Locate the initialized cache volume for a resource cache key,
    /// along with the version result recorded at initialization.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] on agent failure.
    async fn find_initialized_cache(
        &self,
        cache_key: &str,
    ) -> Result<Option<(Arc<dyn Volume>, Option<VersionResult>)>, WorkerError>;

    /// Find or create the imported image volume for a base resource
    /// type, keyed by the type's version.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] if the import fails.
    async fn find_or_create_base_type_volume(
        &self,
        resource_type: &WorkerResourceType,
    ) -> Result<Arc<dyn Volume>, WorkerError>;

    /// # Errors
    ///
    /// Returns [`WorkerError`] if the runtime rejects the spec.
    async fn create_container(
        &self,
        handle: &str,
        spec: ContainerCreateSpec,
    ) -> Result<Arc<dyn Container>, WorkerError>;

    /// # Errors
    ///
    /// Returns [`WorkerError`] on agent failure.
    async fn find_container(
        &self,
        handle: &str,
    ) -> Result<Option<Arc<dyn Container>>, WorkerError>;

    /// Push a framed tar stream of a local volume directly to a peer's
    /// stream-in URL.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] if the transfer fails.
    async fn stream_p2p(
        &self,
        volume: &str,
        path: &str,
        url: &str,
        encoding: Encoding,
    ) -> Result<(), WorkerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traits_are_object_safe() {
        fn _agent(_: &dyn WorkerAgent) {}
        fn _volume(_: &dyn Volume) {}
        fn _container(_: &dyn Container) {}
        fn _process(_: &dyn Process) {}
    }

    #[test]
    fn artifact_serde_omits_missing_cache_key() {
        let artifact = Artifact::new("w1", "vol-1");
        let json = serde_json::to_value(&artifact).unwrap();
        assert!(json.get("resource_cache_key").is_none());
        assert_eq!(json["worker"], "w1");
    }
}
