//! Worker client error types.

/// Errors produced while placing, provisioning, or driving work on
/// workers.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Every registered worker was rejected by the step's filters.
    #[error("no workers satisfy the step requirements ({reasons})")]
    NoCompatibleWorkers { reasons: String },

    /// The requested base resource type is not installed on the worker.
    #[error("unsupported resource type '{0}'")]
    UnsupportedResourceType(String),

    /// `metadata.json` inside an image artifact did not parse.
    #[error("malformed image metadata: {0}")]
    MalformedMetadata(String),

    /// A resource process wrote a response the protocol can't parse.
    #[error("malformed resource response: {0}")]
    MalformedResponse(String),

    /// An unknown placement strategy name in configuration.
    #[error("invalid placement strategy '{0}'")]
    InvalidPlacementStrategy(String),

    #[error("worker '{0}' not registered")]
    WorkerNotFound(String),

    #[error("volume '{handle}' not found on worker '{worker}'")]
    VolumeNotFound { worker: String, handle: String },

    #[error("container '{handle}' not found on worker '{worker}'")]
    ContainerNotFound { worker: String, handle: String },

    /// Archive entries must be relative and must not escape the
    /// destination directory.
    #[error("unsafe archive entry path '{0}'")]
    UnsafeArchivePath(String),

    /// Volume streaming failed mid-transfer.
    #[error("artifact stream: {0}")]
    Stream(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("worker state lock poisoned")]
    LockPoisoned,

    /// The process was cancelled before completion.
    #[error("process aborted")]
    Aborted,

    /// Anything else from the infrastructure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<gantry_state::StateError> for WorkerError {
    fn from(err: gantry_state::StateError) -> Self {
        Self::Other(anyhow::Error::new(err))
    }
}
