//! In-process worker agent.
//!
//! Volumes are flat byte-tree maps and containers run scripted
//! handlers registered per process path. Implements the full
//! [`WorkerAgent`] surface (COW volumes, tar streaming, peer-to-peer
//! URLs, resource cache initialization) so the engine and its tests
//! exercise the same code paths a remote agent would.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gantry_types::VersionResult;

use crate::error::WorkerError;
use crate::registry::WorkerRegistry;
use crate::runtime::{
    Container, ContainerCreateSpec, Mount, Process, ProcessExit, ProcessIo, ProcessSignal,
    ProcessSpec, Volume, VolumeSpec, VolumeStrategy, WorkerAgent, WorkerInfo,
    WorkerResourceType, WorkerState,
};
use crate::tarball::{self, Encoding};

const P2P_SCHEME: &str = "mem+p2p";

/// Exit status reported when a scripted process is terminated.
const TERMINATED_EXIT_STATUS: i32 = 143;

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, WorkerError> {
    mutex.lock().map_err(|_| WorkerError::LockPoisoned)
}

/// A set of in-process workers that can stream volumes to each other.
#[derive(Clone)]
pub struct MemCluster {
    shared: Arc<ClusterShared>,
}

struct ClusterShared {
    workers: RwLock<HashMap<String, Arc<MemWorker>>>,
    registry: Arc<WorkerRegistry>,
}

impl Default for MemCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCluster {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ClusterShared {
                workers: RwLock::new(HashMap::new()),
                registry: Arc::new(WorkerRegistry::new()),
            }),
        }
    }

    /// The registry all cluster workers are registered in.
    #[must_use]
    pub fn registry(&self) -> Arc<WorkerRegistry> {
        self.shared.registry.clone()
    }

    /// Create a worker and register it.
    pub fn add_worker(&self, config: MemWorkerConfig) -> Arc<MemWorker> {
        let worker = Arc::new_cyclic(|self_ref| MemWorker {
            config,
            self_ref: self_ref.clone(),
            cluster: Arc::downgrade(&self.shared),
            volumes: Mutex::new(HashMap::new()),
            caches: Mutex::new(HashMap::new()),
            base_images: Mutex::new(HashMap::new()),
            containers: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
        });
        if let Ok(mut workers) = self.shared.workers.write() {
            workers.insert(worker.name().to_string(), worker.clone());
        }
        self.shared.registry.register(worker.clone());
        worker
    }

    fn worker(&self, name: &str) -> Option<Arc<MemWorker>> {
        self.shared
            .workers
            .read()
            .ok()
            .and_then(|workers| workers.get(name).cloned())
    }
}

/// Static configuration of one in-process worker.
#[derive(Debug, Clone)]
pub struct MemWorkerConfig {
    pub name: String,
    pub platform: String,
    pub tags: Vec<String>,
    pub team_id: Option<i64>,
    pub resource_types: Vec<WorkerResourceType>,
    pub state: WorkerState,
    pub p2p_streaming: bool,
    /// Baseline counts reported to placement, on top of live ones.
    pub seed_build_containers: usize,
    pub seed_active_tasks: usize,
}

impl MemWorkerConfig {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            platform: "linux".to_string(),
            tags: Vec::new(),
            team_id: None,
            resource_types: Vec::new(),
            state: WorkerState::Running,
            p2p_streaming: false,
            seed_build_containers: 0,
            seed_active_tasks: 0,
        }
    }
}

/// Outcome of a scripted process handler.
#[derive(Debug, Clone, Default)]
pub struct HandlerResult {
    pub exit_status: i32,
    pub stdout: Vec<u8>,
    pub stderr_lines: Vec<String>,
    /// Simulated run time before the exit is observable; lets tests
    /// exercise cancellation mid-flight.
    pub delay: Option<Duration>,
}

impl HandlerResult {
    #[must_use]
    pub fn exit(status: i32) -> Self {
        Self {
            exit_status: status,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn stdout_json(value: &serde_json::Value) -> Self {
        Self {
            exit_status: 0,
            stdout: value.to_string().into_bytes(),
            ..Self::default()
        }
    }
}

/// What a scripted handler sees: the process spec plus the container's
/// environment and mounts.
pub struct ProcessCtx {
    pub spec: ProcessSpec,
    pub env: Vec<(String, String)>,
    mounts: Vec<(String, Arc<MemVolume>)>,
}

impl ProcessCtx {
    fn mount_for<'a>(&'a self, container_path: &str) -> Option<(&'a Arc<MemVolume>, String)> {
        self.mounts
            .iter()
            .filter(|(mount_path, _)| {
                container_path == mount_path
                    || container_path.starts_with(&format!("{mount_path}/"))
            })
            .max_by_key(|(mount_path, _)| mount_path.len())
            .map(|(mount_path, volume)| {
                let rel = container_path
                    .strip_prefix(mount_path)
                    .unwrap_or(container_path)
                    .trim_start_matches('/')
                    .to_string();
                (volume, rel)
            })
    }

    /// Write a file through a container path into the backing volume.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stream`] when no mount covers the path.
    pub fn write_file(
        &self,
        container_path: &str,
        content: impl Into<Bytes>,
    ) -> Result<(), WorkerError> {
        let (volume, rel) = self.mount_for(container_path).ok_or_else(|| {
            WorkerError::Stream(format!("no mount covers '{container_path}'"))
        })?;
        lock(&volume.contents)?.insert(rel, content.into());
        Ok(())
    }

    /// Read a file through a container path.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stream`] when the file does not exist.
    pub fn read_file(&self, container_path: &str) -> Result<Bytes, WorkerError> {
        let (volume, rel) = self.mount_for(container_path).ok_or_else(|| {
            WorkerError::Stream(format!("no mount covers '{container_path}'"))
        })?;
        lock(&volume.contents)?
            .get(&rel)
            .cloned()
            .ok_or_else(|| WorkerError::Stream(format!("no such file '{container_path}'")))
    }

    /// Container paths with mounted volumes, sorted.
    #[must_use]
    pub fn mount_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.mounts.iter().map(|(p, _)| p.clone()).collect();
        paths.sort();
        paths
    }
}

/// Scripted behavior for one process path (e.g. `/opt/resource/in`).
pub type ProcessHandler =
    Arc<dyn Fn(&ProcessCtx) -> Result<HandlerResult, WorkerError> + Send + Sync>;

struct CacheRecord {
    volume: String,
    result: Option<VersionResult>,
}

/// One in-process worker.
pub struct MemWorker {
    config: MemWorkerConfig,
    self_ref: Weak<MemWorker>,
    cluster: Weak<ClusterShared>,
    volumes: Mutex<HashMap<String, Arc<MemVolume>>>,
    caches: Mutex<HashMap<String, CacheRecord>>,
    base_images: Mutex<HashMap<String, String>>,
    containers: Mutex<HashMap<String, Arc<MemContainer>>>,
    handlers: Mutex<HashMap<String, ProcessHandler>>,
}

impl MemWorker {
    /// Containers currently hosted by this worker, for inspection in
    /// tests and tooling.
    #[must_use]
    pub fn containers(&self) -> Vec<Arc<MemContainer>> {
        self.containers
            .lock()
            .map(|containers| containers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Script the behavior of a process path on this worker.
    pub fn set_handler(
        &self,
        path: &str,
        handler: impl Fn(&ProcessCtx) -> Result<HandlerResult, WorkerError> + Send + Sync + 'static,
    ) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.insert(path.to_string(), Arc::new(handler));
        }
    }

    fn new_volume(&self, contents: BTreeMap<String, Bytes>, privileged: bool) -> Arc<MemVolume> {
        let volume = Arc::new(MemVolume {
            handle: Uuid::new_v4().to_string(),
            worker_name: self.config.name.clone(),
            worker: self.self_ref.clone(),
            privileged: AtomicBool::new(privileged),
            contents: Mutex::new(contents),
        });
        if let Ok(mut volumes) = self.volumes.lock() {
            volumes.insert(volume.handle.clone(), volume.clone());
        }
        volume
    }

    fn get_volume(&self, handle: &str) -> Result<Arc<MemVolume>, WorkerError> {
        lock(&self.volumes)?
            .get(handle)
            .cloned()
            .ok_or_else(|| WorkerError::VolumeNotFound {
                worker: self.config.name.clone(),
                handle: handle.to_string(),
            })
    }
}

#[async_trait]
impl WorkerAgent for MemWorker {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn info(&self) -> WorkerInfo {
        let live_containers = self.containers.lock().map(|c| c.len()).unwrap_or(0);
        WorkerInfo {
            name: self.config.name.clone(),
            platform: self.config.platform.clone(),
            tags: self.config.tags.clone(),
            team_id: self.config.team_id,
            state: self.config.state,
            resource_types: self.config.resource_types.clone(),
            build_containers: self.config.seed_build_containers + live_containers,
            active_tasks: self.config.seed_active_tasks,
            p2p_streaming: self.config.p2p_streaming,
        }
    }

    async fn create_volume(&self, spec: VolumeSpec) -> Result<Arc<dyn Volume>, WorkerError> {
        let contents = match &spec.strategy {
            VolumeStrategy::Empty => BTreeMap::new(),
            VolumeStrategy::CowOf { parent } => {
                let parent = self.get_volume(parent)?;
                let cloned = lock(&parent.contents)?.clone();
                cloned
            }
            VolumeStrategy::Import { path } => {
                // Simulated image import: record where the bits came from.
                let mut contents = BTreeMap::new();
                contents.insert(
                    "rootfs/.imported-from".to_string(),
                    Bytes::from(path.clone().into_bytes()),
                );
                contents
            }
        };
        Ok(self.new_volume(contents, spec.privileged))
    }

    async fn find_volume(&self, handle: &str) -> Result<Option<Arc<dyn Volume>>, WorkerError> {
        Ok(lock(&self.volumes)?
            .get(handle)
            .cloned()
            .map(|v| v as Arc<dyn Volume>))
    }

    async fn find_initialized_cache(
        &self,
        cache_key: &str,
    ) -> Result<Option<(Arc<dyn Volume>, Option<VersionResult>)>, WorkerError> {
        let record = match lock(&self.caches)?.get(cache_key) {
            Some(record) => (record.volume.clone(), record.result.clone()),
            None => return Ok(None),
        };
        let volume: Arc<dyn Volume> = self.get_volume(&record.0)?;
        Ok(Some((volume, record.1)))
    }

    async fn find_or_create_base_type_volume(
        &self,
        resource_type: &WorkerResourceType,
    ) -> Result<Arc<dyn Volume>, WorkerError> {
        let key = format!(
            "{}@{}",
            resource_type.resource_type, resource_type.version
        );
        if let Some(handle) = lock(&self.base_images)?.get(&key).cloned() {
            return Ok(self.get_volume(&handle)? as Arc<dyn Volume>);
        }
        let volume = self
            .create_volume(VolumeSpec {
                strategy: VolumeStrategy::Import {
                    path: resource_type.image_path.clone(),
                },
                privileged: resource_type.privileged,
            })
            .await?;
        lock(&self.base_images)?.insert(key, volume.handle().to_string());
        Ok(volume)
    }

    async fn create_container(
        &self,
        handle: &str,
        spec: ContainerCreateSpec,
    ) -> Result<Arc<dyn Container>, WorkerError> {
        let mut mounts = Vec::with_capacity(spec.mounts.len());
        for mount in &spec.mounts {
            // Only volumes of this worker can be mounted.
            let volume = self.get_volume(mount.volume.handle())?;
            mounts.push((mount.path.clone(), volume));
        }
        let container = Arc::new(MemContainer {
            handle: handle.to_string(),
            rootfs_url: spec.rootfs_url,
            env: spec.env,
            user: spec.user,
            mounts,
            worker: self.self_ref.clone(),
        });
        lock(&self.containers)?.insert(handle.to_string(), container.clone());
        Ok(container)
    }

    async fn find_container(
        &self,
        handle: &str,
    ) -> Result<Option<Arc<dyn Container>>, WorkerError> {
        Ok(lock(&self.containers)?
            .get(handle)
            .cloned()
            .map(|c| c as Arc<dyn Container>))
    }

    async fn stream_p2p(
        &self,
        volume: &str,
        path: &str,
        url: &str,
        encoding: Encoding,
    ) -> Result<(), WorkerError> {
        let (dest_worker, dest_volume, dest_path) = parse_p2p_url(url)?;
        let cluster = self
            .cluster
            .upgrade()
            .ok_or_else(|| WorkerError::Stream("cluster shut down".to_string()))?;
        let dest = MemCluster { shared: cluster }
            .worker(&dest_worker)
            .ok_or(WorkerError::WorkerNotFound(dest_worker))?;

        let source = self.get_volume(volume)?;
        let content = source.stream_out(path, encoding).await?;
        let dest_volume = dest.get_volume(&dest_volume)?;
        dest_volume.stream_in(&dest_path, encoding, content).await
    }
}

fn parse_p2p_url(url: &str) -> Result<(String, String, String), WorkerError> {
    let rest = url
        .strip_prefix(&format!("{P2P_SCHEME}://"))
        .ok_or_else(|| WorkerError::Stream(format!("unrecognized p2p url '{url}'")))?;
    let mut parts = rest.splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(worker), Some(volume), path) => Ok((
            worker.to_string(),
            volume.to_string(),
            path.unwrap_or(".").to_string(),
        )),
        _ => Err(WorkerError::Stream(format!("unrecognized p2p url '{url}'"))),
    }
}

/// An in-memory volume: a flat map of relative path to bytes.
pub struct MemVolume {
    handle: String,
    worker_name: String,
    worker: Weak<MemWorker>,
    privileged: AtomicBool,
    contents: Mutex<BTreeMap<String, Bytes>>,
}

impl MemVolume {
    /// Whether the volume was created privileged.
    #[must_use]
    pub fn is_privileged(&self) -> bool {
        self.privileged.load(Ordering::SeqCst)
    }

    fn subtree(&self, path: &str) -> Result<BTreeMap<String, Bytes>, WorkerError> {
        let contents = lock(&self.contents)?;
        if path.is_empty() || path == "." {
            return Ok(contents.clone());
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut subtree = BTreeMap::new();
        for (entry, bytes) in contents.iter() {
            if let Some(rel) = entry.strip_prefix(&prefix) {
                subtree.insert(rel.to_string(), bytes.clone());
            } else if entry == path {
                subtree.insert(
                    entry.rsplit('/').next().unwrap_or(entry.as_str()).to_string(),
                    bytes.clone(),
                );
            }
        }
        Ok(subtree)
    }
}

#[async_trait]
impl Volume for MemVolume {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn worker(&self) -> &str {
        &self.worker_name
    }

    fn path(&self) -> String {
        format!("/volumes/{}", self.handle)
    }

    async fn cow(&self, privileged: bool) -> Result<Arc<dyn Volume>, WorkerError> {
        let worker = self
            .worker
            .upgrade()
            .ok_or_else(|| WorkerError::WorkerNotFound(self.worker_name.clone()))?;
        let contents = lock(&self.contents)?.clone();
        Ok(worker.new_volume(contents, privileged))
    }

    async fn stream_out(&self, path: &str, encoding: Encoding) -> Result<Bytes, WorkerError> {
        let archive = tarball::pack(&self.subtree(path)?)?;
        Ok(Bytes::from(tarball::encode(encoding, &archive)?))
    }

    async fn stream_in(
        &self,
        path: &str,
        encoding: Encoding,
        content: Bytes,
    ) -> Result<(), WorkerError> {
        let archive = tarball::decode(encoding, &content)?;
        let entries = tarball::unpack(&archive)?;
        let base = path.trim_matches('/');
        let mut contents = lock(&self.contents)?;
        for (entry, bytes) in entries {
            let dest = if base.is_empty() || base == "." {
                entry
            } else {
                format!("{base}/{entry}")
            };
            contents.insert(dest, bytes);
        }
        Ok(())
    }

    async fn stream_file(&self, path: &str) -> Result<Bytes, WorkerError> {
        lock(&self.contents)?
            .get(path)
            .cloned()
            .ok_or_else(|| WorkerError::Stream(format!("no such file '{path}'")))
    }

    async fn stream_in_p2p_url(&self, path: &str) -> Result<String, WorkerError> {
        let worker = self
            .worker
            .upgrade()
            .ok_or_else(|| WorkerError::WorkerNotFound(self.worker_name.clone()))?;
        if !worker.config.p2p_streaming {
            return Err(WorkerError::Stream(format!(
                "worker '{}' does not advertise p2p streaming",
                self.worker_name
            )));
        }
        Ok(format!(
            "{P2P_SCHEME}://{}/{}/{}",
            self.worker_name, self.handle, path
        ))
    }

    async fn initialize_resource_cache(
        &self,
        cache_key: &str,
        result: Option<VersionResult>,
    ) -> Result<(), WorkerError> {
        let worker = self
            .worker
            .upgrade()
            .ok_or_else(|| WorkerError::WorkerNotFound(self.worker_name.clone()))?;
        lock(&worker.caches)?.insert(
            cache_key.to_string(),
            CacheRecord {
                volume: self.handle.clone(),
                result,
            },
        );
        Ok(())
    }

    async fn initialize_streamed_resource_cache(
        &self,
        cache_key: &str,
        source_worker: &str,
    ) -> Result<(), WorkerError> {
        tracing::debug!(
            cache_key,
            source_worker,
            worker = self.worker_name,
            "recording streamed resource cache"
        );
        self.initialize_resource_cache(cache_key, None).await
    }
}

/// An in-memory container: scripted processes over mounted volumes.
pub struct MemContainer {
    handle: String,
    rootfs_url: String,
    env: Vec<(String, String)>,
    user: Option<String>,
    mounts: Vec<(String, Arc<MemVolume>)>,
    worker: Weak<MemWorker>,
}

impl MemContainer {
    /// The rootfs URL the container was created with.
    #[must_use]
    pub fn rootfs_url(&self) -> &str {
        &self.rootfs_url
    }

    /// The user the container runs as.
    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }
}

#[async_trait]
impl Container for MemContainer {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn mounts(&self) -> Vec<Mount> {
        self.mounts
            .iter()
            .map(|(path, volume)| Mount {
                volume: volume.clone() as Arc<dyn Volume>,
                path: path.clone(),
            })
            .collect()
    }

    async fn run(
        &self,
        spec: ProcessSpec,
        io: ProcessIo,
    ) -> Result<Arc<dyn Process>, WorkerError> {
        let worker = self
            .worker
            .upgrade()
            .ok_or_else(|| WorkerError::Stream("worker shut down".to_string()))?;
        let handler = lock(&worker.handlers)?.get(&spec.path).cloned();

        let capture_stdout = spec.capture_stdout;
        let ctx = ProcessCtx {
            spec,
            env: self.env.clone(),
            mounts: self.mounts.clone(),
        };
        let result = match handler {
            Some(handler) => handler(&ctx)?,
            // Unscripted processes succeed silently.
            None => HandlerResult::default(),
        };

        for line in &result.stderr_lines {
            (io.stderr)(line);
        }
        let stdout = if capture_stdout {
            Bytes::from(result.stdout)
        } else {
            if !result.stdout.is_empty() {
                for line in String::from_utf8_lossy(&result.stdout).lines() {
                    (io.stdout)(line);
                }
            }
            Bytes::new()
        };

        Ok(Arc::new(MemProcess {
            exit: ProcessExit {
                status: result.exit_status,
                stdout,
            },
            delay: result.delay.unwrap_or(Duration::ZERO),
            terminated: CancellationToken::new(),
        }))
    }
}

struct MemProcess {
    exit: ProcessExit,
    delay: Duration,
    terminated: CancellationToken,
}

#[async_trait]
impl Process for MemProcess {
    async fn wait(&self) -> Result<ProcessExit, WorkerError> {
        if self.delay > Duration::ZERO {
            tokio::select! {
                () = tokio::time::sleep(self.delay) => {}
                () = self.terminated.cancelled() => {
                    return Ok(ProcessExit {
                        status: TERMINATED_EXIT_STATUS,
                        stdout: Bytes::new(),
                    });
                }
            }
        }
        Ok(self.exit.clone())
    }

    async fn signal(&self, _signal: ProcessSignal) -> Result<(), WorkerError> {
        self.terminated.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_with_worker() -> (MemCluster, Arc<MemWorker>) {
        let cluster = MemCluster::new();
        let worker = cluster.add_worker(MemWorkerConfig::named("w1"));
        (cluster, worker)
    }

    async fn empty_volume(worker: &Arc<MemWorker>) -> Arc<dyn Volume> {
        worker
            .create_volume(VolumeSpec {
                strategy: VolumeStrategy::Empty,
                privileged: false,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn cow_volume_diverges_from_parent() {
        let (_cluster, worker) = cluster_with_worker();
        let parent = empty_volume(&worker).await;
        parent
            .stream_in(
                ".",
                Encoding::Raw,
                Bytes::from(
                    tarball::pack(
                        &[("a.txt".to_string(), Bytes::from_static(b"one"))]
                            .into_iter()
                            .collect(),
                    )
                    .unwrap(),
                ),
            )
            .await
            .unwrap();

        let child = parent.cow(false).await.unwrap();
        assert_eq!(child.stream_file("a.txt").await.unwrap(), "one");

        // Writing to the child leaves the parent untouched.
        child
            .stream_in(
                ".",
                Encoding::Raw,
                Bytes::from(
                    tarball::pack(
                        &[("a.txt".to_string(), Bytes::from_static(b"two"))]
                            .into_iter()
                            .collect(),
                    )
                    .unwrap(),
                ),
            )
            .await
            .unwrap();
        assert_eq!(parent.stream_file("a.txt").await.unwrap(), "one");
        assert_eq!(child.stream_file("a.txt").await.unwrap(), "two");
    }

    #[tokio::test]
    async fn stream_between_workers_via_registry() {
        let cluster = MemCluster::new();
        let w1 = cluster.add_worker(MemWorkerConfig::named("w1"));
        let w2 = cluster.add_worker(MemWorkerConfig::named("w2"));

        let src = empty_volume(&w1).await;
        src.stream_in(
            ".",
            Encoding::Zstd,
            Bytes::from(
                tarball::encode(
                    Encoding::Zstd,
                    &tarball::pack(
                        &[("dir/file".to_string(), Bytes::from_static(b"payload"))]
                            .into_iter()
                            .collect(),
                    )
                    .unwrap(),
                )
                .unwrap(),
            ),
        )
        .await
        .unwrap();

        let dst = empty_volume(&w2).await;
        let content = src.stream_out(".", Encoding::Gzip).await.unwrap();
        dst.stream_in(".", Encoding::Gzip, content).await.unwrap();
        assert_eq!(dst.stream_file("dir/file").await.unwrap(), "payload");
    }

    #[tokio::test]
    async fn p2p_url_roundtrip() {
        let cluster = MemCluster::new();
        let w1 = cluster.add_worker(MemWorkerConfig::named("w1"));
        let w2 = cluster.add_worker(MemWorkerConfig {
            p2p_streaming: true,
            ..MemWorkerConfig::named("w2")
        });

        let src = empty_volume(&w1).await;
        src.stream_in(
            ".",
            Encoding::Raw,
            Bytes::from(
                tarball::pack(
                    &[("f".to_string(), Bytes::from_static(b"x"))]
                        .into_iter()
                        .collect(),
                )
                .unwrap(),
            ),
        )
        .await
        .unwrap();

        let dst = empty_volume(&w2).await;
        let url = dst.stream_in_p2p_url(".").await.unwrap();
        assert!(url.starts_with("mem+p2p://w2/"));

        w1.stream_p2p(src.handle(), ".", &url, Encoding::Zstd)
            .await
            .unwrap();
        assert_eq!(dst.stream_file("f").await.unwrap(), "x");
    }

    #[tokio::test]
    async fn p2p_url_requires_capability() {
        let (_cluster, worker) = cluster_with_worker();
        let volume = empty_volume(&worker).await;
        assert!(volume.stream_in_p2p_url(".").await.is_err());
    }

    #[tokio::test]
    async fn scripted_process_writes_outputs_and_captures_stdout() {
        let (_cluster, worker) = cluster_with_worker();
        let out = empty_volume(&worker).await;

        worker.set_handler("/opt/resource/in", |ctx: &ProcessCtx| {
            ctx.write_file("/tmp/build/get/ref", "abc123")?;
            Ok(HandlerResult::stdout_json(
                &serde_json::json!({"version": {"ref": "abc123"}}),
            ))
        });

        let container = worker
            .create_container(
                "c1",
                ContainerCreateSpec {
                    rootfs_url: "raw:///img".into(),
                    env: vec![],
                    mounts: vec![Mount {
                        volume: out.clone(),
                        path: "/tmp/build/get".into(),
                    }],
                    user: None,
                },
            )
            .await
            .unwrap();

        let process = container
            .run(
                ProcessSpec {
                    path: "/opt/resource/in".into(),
                    capture_stdout: true,
                    ..ProcessSpec::default()
                },
                ProcessIo::discard(),
            )
            .await
            .unwrap();
        let exit = process.wait().await.unwrap();
        assert_eq!(exit.status, 0);
        assert!(String::from_utf8_lossy(&exit.stdout).contains("abc123"));
        assert_eq!(out.stream_file("ref").await.unwrap(), "abc123");
    }

    #[tokio::test]
    async fn delayed_process_observes_termination() {
        let (_cluster, worker) = cluster_with_worker();
        worker.set_handler("sleep", |_ctx| {
            Ok(HandlerResult {
                delay: Some(Duration::from_secs(60)),
                ..HandlerResult::default()
            })
        });
        let container = worker
            .create_container(
                "c1",
                ContainerCreateSpec {
                    rootfs_url: String::new(),
                    env: vec![],
                    mounts: vec![],
                    user: None,
                },
            )
            .await
            .unwrap();

        let process = container
            .run(
                ProcessSpec {
                    path: "sleep".into(),
                    ..ProcessSpec::default()
                },
                ProcessIo::discard(),
            )
            .await
            .unwrap();
        process.signal(ProcessSignal::Terminate).await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(1), process.wait())
            .await
            .expect("terminated process must exit promptly")
            .unwrap();
        assert_eq!(exit.status, TERMINATED_EXIT_STATUS);
    }

    #[tokio::test]
    async fn initialized_cache_is_discoverable() {
        let (_cluster, worker) = cluster_with_worker();
        let volume = empty_volume(&worker).await;
        volume
            .initialize_resource_cache(
                "key-1",
                Some(VersionResult {
                    version: gantry_types::Version::from_pairs([("ref", "a")]),
                    metadata: vec![],
                }),
            )
            .await
            .unwrap();

        let (found, result) = worker
            .find_initialized_cache("key-1")
            .await
            .unwrap()
            .expect("cache should be recorded");
        assert_eq!(found.handle(), volume.handle());
        assert_eq!(result.unwrap().version.get("ref"), Some("a"));

        assert!(worker.find_initialized_cache("other").await.unwrap().is_none());
    }
}
