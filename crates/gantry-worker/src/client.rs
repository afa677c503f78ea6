//! Driving steps on workers: pick a worker, resolve the image, provision
//! the container and its volumes, run the process, collect outputs.
//!
//! All leaf steps follow the same shape; the resource leaves add
//! protocol framing (JSON over stdin/stdout) and cache handling on top.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use gantry_state::StateBackend;
use gantry_types::{ContainerMetadata, ContainerOwner, Version, VersionResult};

use crate::error::WorkerError;
use crate::image::{fetch_image_for_container, ImageSpec};
use crate::placement::{select_worker, PlacementChain, WorkerSpec};
use crate::registry::WorkerRegistry;
use crate::runtime::{
    Artifact, Container, ContainerCreateSpec, Mount, Process, ProcessExit, ProcessIo,
    ProcessSignal, ProcessSpec, Volume, VolumeSpec, VolumeStrategy, WorkerAgent,
};
use crate::streamer::Streamer;

/// Directory resource fetches land in.
pub const GET_ARTIFACT_DIR: &str = "/tmp/build/get";
/// Directory put inputs are mounted under.
pub const PUT_ARTIFACT_DIR: &str = "/tmp/build/put";
/// Working directory of task processes.
pub const TASK_WORK_DIR: &str = "/tmp/build";

/// An artifact to mount into the container.
#[derive(Debug, Clone)]
pub struct InputMount {
    pub artifact: Artifact,
    /// Absolute container path.
    pub dest: String,
}

/// A named empty volume to mount for collecting outputs.
#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub name: String,
    /// Absolute container path.
    pub path: String,
}

/// Step-level container requirements, before image and volume
/// resolution.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: ImageSpec,
    pub inputs: Vec<InputMount>,
    pub outputs: Vec<OutputSpec>,
    pub env: Vec<(String, String)>,
    pub team_id: i64,
    pub user: Option<String>,
}

/// Result of one step process on a worker.
#[derive(Debug)]
pub struct StepRun {
    pub worker: String,
    pub exit: ProcessExit,
    /// Output name to artifact, in spec order.
    pub outputs: Vec<(String, Artifact)>,
}

/// Result of a resource fetch.
#[derive(Debug)]
pub struct GetRun {
    pub worker: String,
    pub exit_status: i32,
    pub version_result: Option<VersionResult>,
    pub artifact: Option<Artifact>,
    /// The fetch short-circuited on an initialized cache volume.
    pub from_cache: bool,
}

/// Drives step containers against the worker pool.
pub struct StepClient {
    registry: Arc<WorkerRegistry>,
    streamer: Streamer,
    state: Arc<dyn StateBackend>,
    chain: PlacementChain,
    /// How long a terminated process gets before it is killed.
    grace: Duration,
}

impl StepClient {
    #[must_use]
    pub fn new(
        registry: Arc<WorkerRegistry>,
        streamer: Streamer,
        state: Arc<dyn StateBackend>,
        chain: PlacementChain,
        grace: Duration,
    ) -> Self {
        Self {
            registry,
            streamer,
            state,
            chain,
            grace,
        }
    }

    /// Pick a worker for a step.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::NoCompatibleWorkers`] when nothing fits.
    pub fn select(
        &self,
        spec: &WorkerSpec,
        inputs: &[Artifact],
    ) -> Result<Arc<dyn WorkerAgent>, WorkerError> {
        select_worker(&self.registry.list(), spec, inputs, &self.chain)
    }

    /// Run a process for a step: select a worker, resolve the image,
    /// provision the container, execute, collect outputs.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Aborted`] on cancellation, other
    /// [`WorkerError`] values on placement or runtime failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_step(
        &self,
        cancel: &CancellationToken,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        worker_spec: &WorkerSpec,
        spec: ContainerSpec,
        process: ProcessSpec,
        io: ProcessIo,
        on_selected: &mut (dyn FnMut(&str) + Send),
    ) -> Result<StepRun, WorkerError> {
        let input_artifacts: Vec<Artifact> =
            spec.inputs.iter().map(|input| input.artifact.clone()).collect();
        let worker = self.select(worker_spec, &input_artifacts)?;
        on_selected(worker.name());
        self.run_step_on(cancel, &worker, owner, metadata, spec, process, io)
            .await
    }

    /// Fetch a resource version, short-circuiting on an initialized
    /// cache volume for the same cache key on the selected worker.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::MalformedResponse`] when `/opt/resource/in`
    /// prints an unparsable response, other [`WorkerError`] values on
    /// placement or runtime failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_get_step(
        &self,
        cancel: &CancellationToken,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        worker_spec: &WorkerSpec,
        image: ImageSpec,
        cache_key: &str,
        request: &serde_json::Value,
        requested_version: Option<&Version>,
        team_id: i64,
        env: Vec<(String, String)>,
        io: ProcessIo,
        on_selected: &mut (dyn FnMut(&str) + Send),
    ) -> Result<GetRun, WorkerError> {
        let worker = self.select(worker_spec, &[])?;
        on_selected(worker.name());

        if let Some((volume, recorded)) = worker.find_initialized_cache(cache_key).await? {
            tracing::debug!(
                worker = worker.name(),
                cache_key,
                "resource cache hit, skipping fetch"
            );
            let version_result = recorded.or_else(|| {
                requested_version.map(|version| VersionResult {
                    version: version.clone(),
                    metadata: vec![],
                })
            });
            let mut artifact = Artifact::new(worker.name(), volume.handle());
            artifact.resource_cache_key = Some(cache_key.to_string());
            return Ok(GetRun {
                worker: worker.name().to_string(),
                exit_status: 0,
                version_result,
                artifact: Some(artifact),
                from_cache: true,
            });
        }

        let spec = ContainerSpec {
            image,
            inputs: vec![],
            outputs: vec![OutputSpec {
                name: "resource".to_string(),
                path: GET_ARTIFACT_DIR.to_string(),
            }],
            env,
            team_id,
            user: None,
        };
        let process = ProcessSpec {
            path: "/opt/resource/in".to_string(),
            args: vec![GET_ARTIFACT_DIR.to_string()],
            stdin: Some(Bytes::from(request.to_string())),
            capture_stdout: true,
            ..ProcessSpec::default()
        };

        let run = self
            .run_step_on(cancel, &worker, owner, metadata, spec, process, io)
            .await?;

        if run.exit.status != 0 {
            return Ok(GetRun {
                worker: run.worker,
                exit_status: run.exit.status,
                version_result: None,
                artifact: None,
                from_cache: false,
            });
        }

        let version_result: VersionResult = parse_response(&run.exit.stdout)?;
        let (_, mut artifact) = run
            .outputs
            .into_iter()
            .next()
            .ok_or_else(|| WorkerError::Stream("get produced no output volume".to_string()))?;
        artifact.resource_cache_key = Some(cache_key.to_string());

        let volume = self.registry.volume_for_artifact(&artifact).await?;
        volume
            .initialize_resource_cache(cache_key, Some(version_result.clone()))
            .await?;

        Ok(GetRun {
            worker: run.worker,
            exit_status: 0,
            version_result: Some(version_result),
            artifact: Some(artifact),
            from_cache: false,
        })
    }

    /// Push a resource version. Returns the emitted version on exit 0.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::MalformedResponse`] when
    /// `/opt/resource/out` prints an unparsable response, other
    /// [`WorkerError`] values on placement or runtime failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_put_step(
        &self,
        cancel: &CancellationToken,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        worker_spec: &WorkerSpec,
        spec: ContainerSpec,
        request: &serde_json::Value,
        io: ProcessIo,
        on_selected: &mut (dyn FnMut(&str) + Send),
    ) -> Result<(String, i32, Option<VersionResult>), WorkerError> {
        let process = ProcessSpec {
            path: "/opt/resource/out".to_string(),
            args: vec![PUT_ARTIFACT_DIR.to_string()],
            stdin: Some(Bytes::from(request.to_string())),
            capture_stdout: true,
            ..ProcessSpec::default()
        };
        let run = self
            .run_step(
                cancel,
                owner,
                metadata,
                worker_spec,
                spec,
                process,
                io,
                on_selected,
            )
            .await?;
        if run.exit.status != 0 {
            return Ok((run.worker, run.exit.status, None));
        }
        let version_result: VersionResult = parse_response(&run.exit.stdout)?;
        Ok((run.worker, 0, Some(version_result)))
    }

    /// Discover new versions. Returns the version list (oldest first)
    /// on exit 0.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::MalformedResponse`] when
    /// `/opt/resource/check` prints an unparsable response, other
    /// [`WorkerError`] values on placement or runtime failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_check_step(
        &self,
        cancel: &CancellationToken,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        worker_spec: &WorkerSpec,
        image: ImageSpec,
        request: &serde_json::Value,
        team_id: i64,
        io: ProcessIo,
        on_selected: &mut (dyn FnMut(&str) + Send),
    ) -> Result<(String, i32, Vec<Version>), WorkerError> {
        let spec = ContainerSpec {
            image,
            inputs: vec![],
            outputs: vec![],
            env: vec![],
            team_id,
            user: None,
        };
        let process = ProcessSpec {
            path: "/opt/resource/check".to_string(),
            stdin: Some(Bytes::from(request.to_string())),
            capture_stdout: true,
            ..ProcessSpec::default()
        };
        let run = self
            .run_step(
                cancel,
                owner,
                metadata,
                worker_spec,
                spec,
                process,
                io,
                on_selected,
            )
            .await?;
        if run.exit.status != 0 {
            return Ok((run.worker, run.exit.status, vec![]));
        }
        let versions: Vec<Version> = parse_response(&run.exit.stdout)?;
        Ok((run.worker, 0, versions))
    }

    async fn run_step_on(
        &self,
        cancel: &CancellationToken,
        worker: &Arc<dyn WorkerAgent>,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        spec: ContainerSpec,
        process: ProcessSpec,
        io: ProcessIo,
    ) -> Result<StepRun, WorkerError> {
        let (container, outputs) = self.provision(worker, owner, metadata, spec).await?;

        if cancel.is_cancelled() {
            return Err(WorkerError::Aborted);
        }
        let spawned = container.run(process, io).await?;
        let exit = self.await_exit(cancel, spawned.as_ref()).await?;

        let outputs = outputs
            .into_iter()
            .map(|(name, volume)| {
                (
                    name,
                    Artifact::new(worker.name(), volume.handle()),
                )
            })
            .collect();

        Ok(StepRun {
            worker: worker.name().to_string(),
            exit,
            outputs,
        })
    }

    /// Find-or-create the container row, then attach to or create the
    /// runtime container with input and output volumes mounted.
    async fn provision(
        &self,
        worker: &Arc<dyn WorkerAgent>,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        spec: ContainerSpec,
    ) -> Result<(Arc<dyn Container>, Vec<(String, Arc<dyn Volume>)>), WorkerError> {
        let row = self
            .state
            .find_or_create_container(owner, worker.name(), metadata)?;

        if let Some(existing) = worker.find_container(&row.handle).await? {
            tracing::debug!(
                worker = worker.name(),
                handle = row.handle,
                "attaching to existing container"
            );
            let outputs = spec
                .outputs
                .iter()
                .filter_map(|output| {
                    existing
                        .mounts()
                        .into_iter()
                        .find(|mount| mount.path == output.path)
                        .map(|mount| (output.name.clone(), mount.volume))
                })
                .collect();
            return Ok((existing, outputs));
        }

        let image = fetch_image_for_container(&self.streamer, worker, &spec.image).await?;

        let mut mounts = Vec::new();
        for input in &spec.inputs {
            let volume = self.input_volume(worker, &input.artifact).await?;
            mounts.push(Mount {
                volume,
                path: input.dest.clone(),
            });
        }

        let mut outputs = Vec::with_capacity(spec.outputs.len());
        for output in &spec.outputs {
            let volume = worker
                .create_volume(VolumeSpec {
                    strategy: VolumeStrategy::Empty,
                    privileged: false,
                })
                .await?;
            self.state.record_volume(volume.handle(), worker.name())?;
            mounts.push(Mount {
                volume: volume.clone(),
                path: output.path.clone(),
            });
            outputs.push((output.name.clone(), volume));
        }

        let mut env: Vec<(String, String)> = image
            .metadata
            .env
            .iter()
            .filter_map(|pair| {
                pair.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();
        env.extend(spec.env.iter().cloned());

        let user = spec.user.clone().or_else(|| {
            if image.metadata.user.is_empty() {
                None
            } else {
                Some(image.metadata.user.clone())
            }
        });

        let container = worker
            .create_container(
                &row.handle,
                ContainerCreateSpec {
                    rootfs_url: image.url,
                    env,
                    mounts,
                    user,
                },
            )
            .await?;
        Ok((container, outputs))
    }

    /// Reuse an input artifact already on the worker via COW, or
    /// replicate it from its authoritative worker.
    async fn input_volume(
        &self,
        worker: &Arc<dyn WorkerAgent>,
        artifact: &Artifact,
    ) -> Result<Arc<dyn Volume>, WorkerError> {
        if artifact.worker == worker.name() {
            let source = worker.find_volume(&artifact.volume).await?.ok_or_else(|| {
                WorkerError::VolumeNotFound {
                    worker: artifact.worker.clone(),
                    handle: artifact.volume.clone(),
                }
            })?;
            let cow = source.cow(false).await?;
            self.state.record_volume(cow.handle(), worker.name())?;
            return Ok(cow);
        }
        let volume = worker
            .create_volume(VolumeSpec {
                strategy: VolumeStrategy::Empty,
                privileged: false,
            })
            .await?;
        self.state.record_volume(volume.handle(), worker.name())?;
        self.streamer.stream(artifact, &volume).await?;
        Ok(volume)
    }

    /// Wait for the process, honoring cancellation: signal, grace
    /// period, then force-kill.
    async fn await_exit(
        &self,
        cancel: &CancellationToken,
        process: &dyn Process,
    ) -> Result<ProcessExit, WorkerError> {
        tokio::select! {
            exit = process.wait() => exit,
            () = cancel.cancelled() => {
                tracing::info!("cancelling step process");
                if let Err(err) = process.signal(ProcessSignal::Terminate).await {
                    tracing::warn!("failed to signal process: {err}");
                }
                if tokio::time::timeout(self.grace, process.wait()).await.is_err() {
                    tracing::warn!(
                        grace_secs = self.grace.as_secs(),
                        "grace period elapsed, force-killing"
                    );
                    if let Err(err) = process.signal(ProcessSignal::Kill).await {
                        tracing::warn!("failed to kill process: {err}");
                    }
                    let _ = process.wait().await;
                }
                Err(WorkerError::Aborted)
            }
        }
    }
}

fn parse_response<T: serde::de::DeserializeOwned>(stdout: &[u8]) -> Result<T, WorkerError> {
    serde_json::from_slice(stdout).map_err(|err| {
        WorkerError::MalformedResponse(format!(
            "{err} (response: {:.120})",
            String::from_utf8_lossy(stdout)
        ))
    })
}
