//! Job records and the state machine that governs them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Cooperative cancellation flag shared between the scheduler and a running
/// handler.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a handler invocation ended.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Done(Value),
    Failed(String),
    Cancelled,
}

/// A job record. Owned by the scheduler; callers only ever see snapshots.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub priority: Priority,
    pub state: JobState,
    pub progress: f64,
    pub message: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancel: CancellationToken,
}

impl Job {
    pub fn new(job_type: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            priority,
            state: JobState::Pending,
            progress: 0.0,
            message: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancel: CancellationToken::new(),
        }
    }

    /// `pending -> running`. Returns false if the job is in any other state.
    pub fn mark_running(&mut self) -> bool {
        if self.state != JobState::Pending {
            return false;
        }
        self.state = JobState::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// `running -> done | failed | cancelled`. Returns false unless running.
    pub fn finish(&mut self, outcome: JobOutcome) -> bool {
        if self.state != JobState::Running {
            return false;
        }
        match outcome {
            JobOutcome::Done(value) => {
                self.state = JobState::Done;
                self.progress = 100.0;
                self.result = Some(value);
            }
            JobOutcome::Failed(error) => {
                self.state = JobState::Failed;
                self.error = Some(error);
            }
            JobOutcome::Cancelled => {
                self.state = JobState::Cancelled;
            }
        }
        self.completed_at = Some(Utc::now());
        true
    }

    /// `pending -> cancelled`. Returns false unless pending.
    pub fn cancel_pending(&mut self) -> bool {
        if self.state != JobState::Pending {
            return false;
        }
        self.state = JobState::Cancelled;
        self.cancel.cancel();
        self.completed_at = Some(Utc::now());
        true
    }

    /// Record a progress report. Non-finite percentages keep the previous
    /// value; everything else is clamped to `[0, 100]`.
    pub fn record_progress(&mut self, percent: f64, message: Option<String>) -> f64 {
        if percent.is_finite() {
            self.progress = percent.clamp(0.0, 100.0);
        }
        if message.is_some() {
            self.message = message;
        }
        self.progress
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.id.clone(),
            job_type: self.job_type.clone(),
            state: self.state,
            progress: self.progress,
            message: self.message.clone(),
            created_at: self.created_at.timestamp_millis(),
            started_at: self.started_at.map(|t| t.timestamp_millis()),
            completed_at: self.completed_at.map(|t| t.timestamp_millis()),
        }
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.id.clone(),
            job_type: self.job_type.clone(),
            state: self.state,
            progress: self.progress,
        }
    }

    pub fn result(&self) -> JobResult {
        match self.state {
            JobState::Done => JobResult {
                success: true,
                data: Some(self.result.clone().unwrap_or(Value::Null)),
                error: None,
            },
            JobState::Failed => JobResult {
                success: false,
                data: None,
                error: Some(self.error.clone().unwrap_or_default()),
            },
            state => JobResult {
                success: false,
                data: None,
                error: Some(format!("Job not complete: {state}")),
            },
        }
    }
}

/// Read-only snapshot for `jobs.status`. Timestamps are ms since epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub state: JobState,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub state: JobState,
    pub progress: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CancelOutcome {
    pub fn cancelled() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    pub fn refused(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
        }
    }
}

/// Job counts by state, for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobCounts {
    pub fn record(&mut self, state: JobState) {
        match state {
            JobState::Pending => self.pending += 1,
            JobState::Running => self.running += 1,
            JobState::Done => self.done += 1,
            JobState::Failed => self.failed += 1,
            JobState::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.done + self.failed + self.cancelled
    }
}
