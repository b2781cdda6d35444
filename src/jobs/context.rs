use std::sync::Arc;

use tracing::trace;

use super::Shared;
use super::events::JobEvent;
use super::job::CancellationToken;
use crate::registry::HandlerError;
use crate::resources::ResourceManager;

/// Capabilities handed to a handler for the duration of one job.
pub struct JobContext {
    job_id: String,
    cancel: CancellationToken,
    shared: Arc<Shared>,
}

impl JobContext {
    pub(super) fn new(job_id: String, cancel: CancellationToken, shared: Arc<Shared>) -> Self {
        Self {
            job_id,
            cancel,
            shared,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Report progress. The job record is updated first and the event is
    /// emitted straight away, so a status query issued after this returns
    /// sees the new value.
    pub fn progress(&self, percent: f64, message: impl Into<Option<String>>) {
        let message = message.into();
        let recorded = {
            let mut jobs = self.shared.jobs.lock();
            match jobs.get_mut(&self.job_id) {
                Some(job) if !job.state.is_terminal() => {
                    job.record_progress(percent, message.clone())
                }
                _ => {
                    trace!(job_id = %self.job_id, "Ignoring progress for finished job");
                    return;
                }
            }
        };
        self.shared
            .events
            .emit(JobEvent::progress(&self.job_id, recorded, message.as_deref()));
    }

    /// True once cancellation has been requested for this job.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(HandlerError::Cancelled)` once cancellation has been requested;
    /// meant for `?` at handler checkpoints.
    pub fn check_cancelled(&self) -> Result<(), HandlerError> {
        if self.is_cancelled() {
            Err(HandlerError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.shared.resources
    }
}
