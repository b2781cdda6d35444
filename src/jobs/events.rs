//! Asynchronous job events pushed to the client between responses.

use chrono::Utc;
use crossbeam_channel::Sender;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Progress,
    Result,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub job_id: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub data: Value,
}

impl JobEvent {
    fn new(kind: EventKind, job_id: &str, data: Value) -> Self {
        Self {
            kind,
            job_id: job_id.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            data,
        }
    }

    pub fn progress(job_id: &str, percent: f64, message: Option<&str>) -> Self {
        Self::new(
            EventKind::Progress,
            job_id,
            json!({ "percent": percent, "message": message }),
        )
    }

    pub fn result(job_id: &str, data: Value) -> Self {
        Self::new(EventKind::Result, job_id, data)
    }

    pub fn error(job_id: &str, error: &str) -> Self {
        Self::new(EventKind::Error, job_id, Value::String(error.to_string()))
    }

    pub fn cancelled(job_id: &str) -> Self {
        Self::new(EventKind::Cancelled, job_id, Value::Null)
    }
}

/// Destination for job events. Emission must not block for long; the
/// scheduler calls it from worker threads.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: JobEvent);
}

impl EventSink for Sender<JobEvent> {
    fn emit(&self, event: JobEvent) {
        if self.send(event).is_err() {
            trace!("Event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_event_shape() {
        let event = JobEvent::progress("j1", 40.0, Some("page 2/5"));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["jobId"], "j1");
        assert_eq!(value["data"]["percent"], 40.0);
        assert_eq!(value["data"]["message"], "page 2/5");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_error_and_cancelled_events() {
        let error = serde_json::to_value(JobEvent::error("j", "disk full")).unwrap();
        assert_eq!(error["type"], "error");
        assert_eq!(error["data"], "disk full");

        let cancelled = serde_json::to_value(JobEvent::cancelled("j")).unwrap();
        assert_eq!(cancelled["type"], "cancelled");
        assert!(cancelled["data"].is_null());
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (tx, rx) = crossbeam_channel::unbounded::<JobEvent>();
        drop(rx);
        tx.emit(JobEvent::cancelled("j"));
    }
}
