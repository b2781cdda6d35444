//! Job handler registry.
//!
//! Maps a job type name (e.g. `"ocr.extract"`) to the handler that performs the
//! work. The registry only stores and looks up handlers; execution belongs to
//! [`crate::jobs::JobScheduler`].
//!
//! Handlers are normally registered once at startup, but runtime registration is
//! allowed, so the table sits behind a lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::jobs::JobContext;
use crate::resources::ResourceError;

/// Failure raised by a handler while executing a job.
///
/// The `Display` text becomes the job's captured error verbatim.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The handler observed a cancellation request and stopped early.
    #[error("job cancelled")]
    Cancelled,

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}

pub type HandlerResult = Result<Value, HandlerError>;

/// A unit of work for one job type.
///
/// Implementations must tolerate concurrent invocation: the scheduler may run
/// several jobs of the same type on different workers at once.
pub trait JobHandler: Send + Sync {
    fn execute(&self, payload: Value, ctx: &JobContext) -> HandlerResult;
}

impl<F> JobHandler for F
where
    F: Fn(Value, &JobContext) -> HandlerResult + Send + Sync,
{
    fn execute(&self, payload: Value, ctx: &JobContext) -> HandlerResult {
        self(payload, ctx)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No handler registered for job type: {0}")]
    NotFound(String),
}

/// Registry of job handlers keyed by job type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing (with a warning) any existing one.
    pub fn register<H>(&self, job_type: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        let job_type = job_type.into();
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&job_type) {
            warn!(job_type = %job_type, "Overwriting handler for job type");
        }
        info!(job_type = %job_type, "Registered handler");
        handlers.insert(job_type, Arc::new(handler));
    }

    /// Closure-friendly variant of [`register`](Self::register); lets the
    /// compiler infer the closure signature.
    pub fn register_fn<F>(&self, job_type: impl Into<String>, handler: F)
    where
        F: Fn(Value, &JobContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(job_type, handler);
    }

    /// Remove a handler. Returns `true` if one was registered.
    pub fn unregister(&self, job_type: &str) -> bool {
        let removed = self.handlers.write().remove(job_type).is_some();
        if removed {
            info!(job_type = %job_type, "Unregistered handler");
        }
        removed
    }

    pub fn has_handler(&self, job_type: &str) -> bool {
        self.handlers.read().contains_key(job_type)
    }

    pub fn get_handler(&self, job_type: &str) -> Result<Arc<dyn JobHandler>, RegistryError> {
        self.handlers
            .read()
            .get(job_type)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(job_type.to_string()))
    }

    /// Registered job types, sorted for stable output.
    pub fn list_job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
        info!("Cleared all job handlers");
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}
