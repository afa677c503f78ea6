//! Step error model.
//!
//! A step that runs to completion returns `Ok` regardless of whether
//! the underlying work succeeded; `Err` means the step *errored*
//! (infrastructure failure or cancellation). The categories drive retry
//! and reporting behavior: user-config errors are never retried,
//! transient ones are retried by the `retry` combinator, cancellation
//! is never retried but still runs cleanup hooks.

use gantry_worker::WorkerError;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The plan or its configuration is wrong; surfaced to the build
    /// log and never retried.
    #[error("{0}")]
    UserConfig(String),

    /// Something the plan references was deleted mid-build.
    #[error("{0} not found")]
    NotFound(String),

    /// An image artifact carried an unparsable `metadata.json`.
    #[error("malformed image metadata: {0}")]
    MalformedMetadata(String),

    /// Infrastructure failure; a retry attempt may succeed.
    #[error(transparent)]
    Transient(#[from] anyhow::Error),

    /// The enclosing context was cancelled.
    #[error("step aborted")]
    Aborted,
}

impl StepError {
    pub fn user_config(message: impl Into<String>) -> Self {
        Self::UserConfig(message.into())
    }
}

impl From<WorkerError> for StepError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Aborted => Self::Aborted,
            WorkerError::MalformedMetadata(message) => Self::MalformedMetadata(message),
            WorkerError::UnsupportedResourceType(_)
            | WorkerError::MalformedResponse(_)
            | WorkerError::InvalidPlacementStrategy(_)
            | WorkerError::UnsafeArchivePath(_) => Self::UserConfig(err.to_string()),
            other => Self::Transient(anyhow::Error::new(other)),
        }
    }
}

impl From<gantry_state::StateError> for StepError {
    fn from(err: gantry_state::StateError) -> Self {
        match err {
            gantry_state::StateError::NotFound(what) => Self::NotFound(what),
            other => Self::Transient(anyhow::Error::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_abort_maps_to_aborted() {
        assert!(matches!(
            StepError::from(WorkerError::Aborted),
            StepError::Aborted
        ));
    }

    #[test]
    fn unsupported_type_is_user_config() {
        let err = StepError::from(WorkerError::UnsupportedResourceType("svn".into()));
        assert!(matches!(err, StepError::UserConfig(_)));
        assert!(err.to_string().contains("svn"));
    }

    #[test]
    fn metadata_error_stays_typed() {
        let err = StepError::from(WorkerError::MalformedMetadata("metadata.json: eof".into()));
        assert!(matches!(err, StepError::MalformedMetadata(_)));
    }

    #[test]
    fn stream_errors_are_transient() {
        let err = StepError::from(WorkerError::Stream("reset".into()));
        assert!(matches!(err, StepError::Transient(_)));
    }

    #[test]
    fn state_not_found_maps_through() {
        let err = StepError::from(gantry_state::StateError::NotFound("pipeline".into()));
        assert!(matches!(err, StepError::NotFound(_)));
        assert_eq!(err.to_string(), "pipeline not found");
    }
}
