//! Step delegates: the capability record a leaf drives for event
//! emission and log streaming.
//!
//! Per step, events are emitted in order `Initialize` <
//! `SelectedWorker` < `Start` < `Finish` | `Error`. The sink is a
//! plain function value, so tests supply a recording fake and the real
//! system plugs in event persistence.

use std::sync::{Arc, Mutex};

use gantry_types::{Event, LogStream, Origin, PlanId, StepKind, VersionResult};
use gantry_worker::runtime::LogSink;

use crate::clock::Clock;

/// Receives every emitted build event.
pub type EventSink = Arc<dyn Fn(Event) + Send + Sync>;

/// Hands out per-step delegates wired to one build's event sink.
#[derive(Clone)]
pub struct DelegateFactory {
    sink: EventSink,
    clock: Arc<dyn Clock>,
}

impl DelegateFactory {
    #[must_use]
    pub fn new(sink: EventSink, clock: Arc<dyn Clock>) -> Self {
        Self { sink, clock }
    }

    /// A sink that drops every event (local tooling).
    #[must_use]
    pub fn discard(clock: Arc<dyn Clock>) -> Self {
        Self::new(Arc::new(|_| {}), clock)
    }

    #[must_use]
    pub fn delegate(&self, plan_id: &PlanId) -> StepDelegate {
        StepDelegate {
            origin: Origin {
                id: plan_id.clone(),
            },
            sink: self.sink.clone(),
            clock: self.clock.clone(),
        }
    }
}

/// Event emission surface for one step.
#[derive(Clone)]
pub struct StepDelegate {
    origin: Origin,
    sink: EventSink,
    clock: Arc<dyn Clock>,
}

impl StepDelegate {
    fn time(&self) -> i64 {
        self.clock.now().timestamp()
    }

    pub fn initializing(&self, step: StepKind) {
        tracing::debug!(plan = %self.origin.id, %step, "initializing");
        (self.sink)(Event::Initialize {
            origin: self.origin.clone(),
            time: self.time(),
            step,
        });
    }

    pub fn selected_worker(&self, worker: &str) {
        tracing::debug!(plan = %self.origin.id, worker, "selected worker");
        (self.sink)(Event::SelectedWorker {
            origin: self.origin.clone(),
            time: self.time(),
            worker: worker.to_string(),
        });
    }

    pub fn starting(&self, step: StepKind) {
        tracing::debug!(plan = %self.origin.id, %step, "starting");
        (self.sink)(Event::Start {
            origin: self.origin.clone(),
            time: self.time(),
            step,
        });
    }

    pub fn finished(
        &self,
        step: StepKind,
        exit_status: i32,
        version_result: Option<VersionResult>,
    ) {
        tracing::debug!(plan = %self.origin.id, %step, exit_status, "finished");
        (self.sink)(Event::Finish {
            origin: self.origin.clone(),
            time: self.time(),
            step,
            exit_status,
            version_result,
        });
    }

    pub fn errored(&self, message: &str) {
        tracing::warn!(plan = %self.origin.id, message, "step errored");
        (self.sink)(Event::Error {
            origin: self.origin.clone(),
            time: self.time(),
            message: message.to_string(),
        });
    }

    /// Log sink relaying process stdout as build log events.
    #[must_use]
    pub fn stdout(&self) -> LogSink {
        self.log_sink(LogStream::Stdout)
    }

    /// Log sink relaying process stderr as build log events.
    #[must_use]
    pub fn stderr(&self) -> LogSink {
        self.log_sink(LogStream::Stderr)
    }

    fn log_sink(&self, stream: LogStream) -> LogSink {
        let origin = self.origin.clone();
        let sink = self.sink.clone();
        let clock = self.clock.clone();
        Arc::new(move |line: &str| {
            (sink)(Event::Log {
                origin: origin.clone(),
                time: clock.now().timestamp(),
                stream,
                payload: line.to_string(),
            });
        })
    }
}

/// An event sink that records everything, for tests and tooling.
#[must_use]
pub fn recording_sink() -> (EventSink, Arc<Mutex<Vec<Event>>>) {
    let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let sink: EventSink = Arc::new(move |event| {
        if let Ok(mut events) = sink_events.lock() {
            events.push(event);
        }
    });
    (sink, events)
}
