//! Job scheduling: job table, state machine, worker pool and cancellation.
//!
//! `start` validates the job type, records a `pending` job and enqueues it.
//! A fixed pool of worker threads pops jobs, moves them to `running`, invokes
//! the registered handler and records the terminal state. Handler errors and
//! panics are both contained at the worker boundary.
//!
//! Lock order: the job table before the work queue. Neither lock is held
//! while a handler runs or while an event is emitted.

pub mod context;
pub mod events;
pub mod job;
pub mod queue;

use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use context::JobContext;
pub use events::{EventKind, EventSink, JobEvent};
pub use job::{
    CancelOutcome, CancellationToken, Job, JobCounts, JobOutcome, JobResult, JobState, JobStatus,
    JobSummary, Priority,
};
pub use queue::WorkQueue;

use crate::registry::{HandlerError, HandlerRegistry};
use crate::resources::ResourceManager;

pub const DEFAULT_MAX_WORKERS: usize = 4;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

pub(crate) struct Shared {
    jobs: Mutex<HashMap<String, Job>>,
    queue: WorkQueue,
    registry: Arc<HandlerRegistry>,
    resources: Arc<ResourceManager>,
    events: Arc<dyn EventSink>,
}

/// Owner of every job record and the worker pool that executes them.
pub struct JobScheduler {
    shared: Arc<Shared>,
    workers: usize,
}

impl JobScheduler {
    pub fn new(
        max_workers: usize,
        registry: Arc<HandlerRegistry>,
        resources: Arc<ResourceManager>,
        events: Arc<dyn EventSink>,
    ) -> io::Result<Self> {
        let workers = max_workers.max(1);
        let shared = Arc::new(Shared {
            jobs: Mutex::new(HashMap::new()),
            queue: WorkQueue::new(),
            registry,
            resources,
            events,
        });

        for i in 0..workers {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("ai-engine-worker-{i}"))
                .spawn(move || worker_loop(i, shared))?;
        }
        info!(workers, "Job scheduler started");

        Ok(Self { shared, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.shared.registry
    }

    /// Submit a job. Fails without creating a record if no handler is
    /// registered for `job_type`.
    pub fn start(&self, job_type: &str, payload: Value, priority: Priority) -> Result<String, JobError> {
        if !self.shared.registry.has_handler(job_type) {
            return Err(JobError::UnknownJobType(job_type.to_string()));
        }

        let job = Job::new(job_type, priority);
        let job_id = job.id.clone();

        let mut jobs = self.shared.jobs.lock();
        if !self
            .shared
            .queue
            .push(job_id.clone(), job_type.to_string(), payload, priority)
        {
            return Err(JobError::ShuttingDown);
        }
        jobs.insert(job_id.clone(), job);
        drop(jobs);

        info!(job_id = %job_id, job_type = %job_type, ?priority, "Job queued");
        Ok(job_id)
    }

    pub fn status(&self, job_id: &str) -> Result<JobStatus, JobError> {
        self.with_job(job_id, Job::status)
    }

    pub fn result(&self, job_id: &str) -> Result<JobResult, JobError> {
        self.with_job(job_id, Job::result)
    }

    /// Request cancellation.
    ///
    /// Pending jobs are withdrawn from the queue and become `cancelled`.
    /// Running jobs are refused and left to reach their natural terminal
    /// state; only [`shutdown`](Self::shutdown) signals running handlers.
    pub fn cancel(&self, job_id: &str) -> Result<CancelOutcome, JobError> {
        let mut jobs = self.shared.jobs.lock();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        match job.state {
            JobState::Pending => {
                self.shared.queue.remove(job_id);
                job.cancel_pending();
                info!(job_id = %job_id, "Cancelled pending job");
                Ok(CancelOutcome::cancelled())
            }
            JobState::Running => {
                debug!(job_id = %job_id, "Refusing to cancel running job");
                Ok(CancelOutcome::refused("Job is already running, cannot interrupt"))
            }
            state => Ok(CancelOutcome::refused(format!("Job already {state}"))),
        }
    }

    /// Every job, oldest first.
    pub fn list(&self) -> Vec<JobSummary> {
        let jobs = self.shared.jobs.lock();
        let mut all: Vec<&Job> = jobs.values().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all.into_iter().map(Job::summary).collect()
    }

    pub fn counts(&self) -> JobCounts {
        let jobs = self.shared.jobs.lock();
        let mut counts = JobCounts::default();
        for job in jobs.values() {
            counts.record(job.state);
        }
        counts
    }

    /// Stop accepting work and cancel everything still queued. Running jobs
    /// are signalled but not waited for.
    pub fn shutdown(&self) {
        let mut jobs = self.shared.jobs.lock();
        let drained = self.shared.queue.close();
        for queued in &drained {
            if let Some(job) = jobs.get_mut(&queued.job_id) {
                job.cancel_pending();
            }
        }
        let mut running = 0;
        for job in jobs.values().filter(|j| j.state == JobState::Running) {
            job.cancel.cancel();
            running += 1;
        }
        drop(jobs);
        info!(cancelled = drained.len(), running, "Job scheduler stopped");
    }

    fn with_job<T>(&self, job_id: &str, f: impl FnOnce(&Job) -> T) -> Result<T, JobError> {
        let jobs = self.shared.jobs.lock();
        jobs.get(job_id)
            .map(f)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.shared.queue.close();
    }
}

fn worker_loop(worker: usize, shared: Arc<Shared>) {
    debug!(worker, "Worker started");
    while let Some(queued) = shared.queue.pop() {
        run_job(&shared, queued.job_id, &queued.job_type, queued.payload);
    }
    debug!(worker, "Worker stopped");
}

fn run_job(shared: &Arc<Shared>, job_id: String, job_type: &str, payload: Value) {
    let cancel = {
        let mut jobs = shared.jobs.lock();
        let Some(job) = jobs.get_mut(&job_id) else {
            return;
        };
        if !job.mark_running() {
            debug!(job_id = %job_id, state = %job.state, "Skipping job that is no longer pending");
            return;
        }
        job.cancel.clone()
    };

    info!(job_id = %job_id, job_type = %job_type, "Job started");

    let outcome = match shared.registry.get_handler(job_type) {
        Ok(handler) => {
            let ctx = JobContext::new(job_id.clone(), cancel.clone(), shared.clone());
            match panic::catch_unwind(AssertUnwindSafe(|| handler.execute(payload, &ctx))) {
                Ok(Ok(value)) => JobOutcome::Done(value),
                Ok(Err(HandlerError::Cancelled)) if cancel.is_cancelled() => JobOutcome::Cancelled,
                Ok(Err(e)) => JobOutcome::Failed(e.to_string()),
                Err(panic) => JobOutcome::Failed(format!("handler panicked: {}", panic_message(&*panic))),
            }
        }
        // The handler was unregistered after the job was accepted.
        Err(e) => JobOutcome::Failed(e.to_string()),
    };

    let event = {
        let mut jobs = shared.jobs.lock();
        let Some(job) = jobs.get_mut(&job_id) else {
            return;
        };
        if !job.finish(outcome.clone()) {
            warn!(job_id = %job_id, state = %job.state, "Job left running state unexpectedly");
            return;
        }
        match outcome {
            JobOutcome::Done(value) => {
                info!(job_id = %job_id, "Job completed");
                JobEvent::result(&job_id, value)
            }
            JobOutcome::Failed(message) => {
                error!(job_id = %job_id, error = %message, "Job failed");
                JobEvent::error(&job_id, &message)
            }
            JobOutcome::Cancelled => {
                info!(job_id = %job_id, "Job cancelled by handler");
                JobEvent::cancelled(&job_id)
            }
        }
    };
    shared.events.emit(event);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
