#![forbid(unsafe_code)]

// Events reported by workers to the coordinator.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Operation,
    Error,
}

/// One observed outcome from one worker. Immutable once reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub worker_id: String,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp_ms: u64,
}

impl Event {
    /// A timed operation. `error` is set when the operation failed or timed out.
    pub fn operation(
        worker_id: &str,
        operation: &str,
        duration: Duration,
        error: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            worker_id: worker_id.to_string(),
            kind: EventKind::Operation,
            operation: Some(operation.to_string()),
            duration_ms: Some(duration.as_millis() as u64),
            error,
            timestamp_ms: now_ms(),
        }
    }

    pub fn error(worker_id: &str, error: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            worker_id: worker_id.to_string(),
            kind: EventKind::Error,
            operation: None,
            duration_ms: None,
            error: Some(error.into()),
            timestamp_ms: now_ms(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Sink for worker events. Reports are fire-and-forget: implementations must
/// not block and must not fail the caller.
pub trait EventReporter: Send + Sync {
    fn report_event(&self, test_id: &str, event: Event);
}

/// Collects every report in memory.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingReporter {
    pub events: std::sync::Mutex<Vec<(String, Event)>>,
}

#[cfg(test)]
impl RecordingReporter {
    pub fn take(&self) -> Vec<(String, Event)> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

#[cfg(test)]
impl EventReporter for RecordingReporter {
    fn report_event(&self, test_id: &str, event: Event) {
        self.events.lock().unwrap().push((test_id.to_string(), event));
    }
}

/// Wall-clock unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
