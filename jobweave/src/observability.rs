//! Observability hooks (C7, §4.7): a single typed event callback plus
//! duration/counter signals. No transport — this crate only emits; a host
//! attaches metrics/tracing externally (§10.2).
//!
//! Shaped directly on `kernel/jobs/events.rs`'s `JobEvent` enum: one flat
//! enum of lifecycle facts rather than per-event-type taps, since callers
//! here want "a single typed event callback", not seesaw's generic
//! `EventTap<E: Event>` fan-out.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

/// Severity attached to an [`Event`], mirroring the `tracing` levels the
/// crate's own internal logging uses (§10.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// The kind of lifecycle fact being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkerStarted,
    WorkerStopped,
    WorkerError,
    JobCreated,
    JobAttemptStarted,
    JobCompleted,
    JobFailed,
    JobReaped,
    ChainCreated,
    ChainCompleted,
    BlockerResolved,
    LeaseLost,
    AdapterError,
}

/// A single observability fact: `{type, level, message, data, error?}` (§4.7).
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub level: Level,
    pub message: String,
    pub data: serde_json::Value,
    pub error: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType, level: Level, message: impl Into<String>) -> Self {
        Self {
            event_type,
            level,
            message: message.into(),
            data: serde_json::Value::Null,
            error: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_error(mut self, error: impl std::fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Which duration histogram an [`Observer::on_duration`] sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationMetric {
    /// Wall time from chain start to chain completion.
    JobChain,
    /// Wall time from a job's creation to its completion.
    Job,
    /// Wall time of a single attempt (acquire to complete/reschedule).
    JobAttempt,
}

/// Which per-type gauge a [`Observer::on_gauge`] delta applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GaugeMetric {
    /// Jobs of a type that are pending/blocked (not yet running).
    Idle,
    /// Jobs of a type currently running.
    Processing,
}

/// Pure callback sink for lifecycle events and metrics (§4.7). Transports
/// (Prometheus, OpenTelemetry, a log sink) attach by implementing this and
/// handing an `Arc<dyn Observer>` to the worker/core helper.
pub trait Observer: Send + Sync + 'static {
    fn on_event(&self, event: Event);

    /// Delta-encoded so per-type gauges compose across concurrent workers
    /// without needing a shared counter (§4.7): `+1` when a job of `type_name`
    /// enters the gauge's state, `-1` when it leaves.
    fn on_gauge(&self, metric: GaugeMetric, type_name: &str, delta: i64) {
        let _ = (metric, type_name, delta);
    }

    fn on_duration(&self, metric: DurationMetric, type_name: &str, duration: Duration) {
        let _ = (metric, type_name, duration);
    }
}

/// An [`Observer`] that discards everything. The default when a caller
/// doesn't wire one in.
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn on_event(&self, _event: Event) {}
}

pub(crate) fn job_event(
    observer: &Arc<dyn Observer>,
    event_type: EventType,
    level: Level,
    message: impl Into<String>,
    job_id: Uuid,
    type_name: &str,
) {
    observer.on_event(
        Event::new(event_type, level, message).with_data(serde_json::json!({
            "job_id": job_id,
            "type_name": type_name,
        })),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_builder_attaches_data_and_error() {
        let event = Event::new(EventType::JobFailed, Level::Warn, "handler failed")
            .with_data(serde_json::json!({"job_id": "abc"}))
            .with_error("boom");
        assert_eq!(event.message, "handler failed");
        assert_eq!(event.error.as_deref(), Some("boom"));
        assert_eq!(event.data["job_id"], "abc");
    }

    #[test]
    fn noop_observer_accepts_all_calls_without_panicking() {
        let observer: Arc<dyn Observer> = Arc::new(NoopObserver);
        observer.on_event(Event::new(EventType::WorkerStarted, Level::Info, "started"));
        observer.on_gauge(GaugeMetric::Idle, "greet", 1);
        observer.on_duration(DurationMetric::Job, "greet", Duration::from_millis(5));
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: std::sync::Mutex<Vec<EventType>>,
    }

    impl Observer for RecordingObserver {
        fn on_event(&self, event: Event) {
            self.events.lock().unwrap().push(event.event_type);
        }
    }

    #[test]
    fn custom_observer_receives_events() {
        let observer = RecordingObserver::default();
        observer.on_event(Event::new(EventType::ChainCompleted, Level::Info, "done"));
        assert_eq!(observer.events.lock().unwrap().as_slice(), &[EventType::ChainCompleted]);
    }
}
