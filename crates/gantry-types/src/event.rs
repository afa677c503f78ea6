//! The build event stream contract.
//!
//! Leaves emit events through their delegate; the engine guarantees
//! per-step ordering `Initialize` < `SelectedWorker` < `Start` <
//! `Finish` | `Error`. Times are epoch seconds.

use serde::{Deserialize, Serialize};

use crate::plan::{PlanId, StepKind};
use crate::version::VersionResult;

/// Which plan node an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub id: PlanId,
}

/// Which side of the process a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Initialize {
        origin: Origin,
        time: i64,
        step: StepKind,
    },
    Start {
        origin: Origin,
        time: i64,
        step: StepKind,
    },
    Finish {
        origin: Origin,
        time: i64,
        step: StepKind,
        exit_status: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version_result: Option<VersionResult>,
    },
    SelectedWorker {
        origin: Origin,
        time: i64,
        worker: String,
    },
    Error {
        origin: Origin,
        time: i64,
        message: String,
    },
    Log {
        origin: Origin,
        time: i64,
        stream: LogStream,
        payload: String,
    },
}

impl Event {
    /// The plan node this event belongs to.
    #[must_use]
    pub fn origin(&self) -> &Origin {
        match self {
            Self::Initialize { origin, .. }
            | Self::Start { origin, .. }
            | Self::Finish { origin, .. }
            | Self::SelectedWorker { origin, .. }
            | Self::Error { origin, .. }
            | Self::Log { origin, .. } => origin,
        }
    }
}
