//! Built-in job handlers.
//!
//! | Job type | Payload | Result |
//! |----------|---------|--------|
//! | `engine.echo` | any | the payload |
//! | `engine.sleep` | `{steps?, intervalMs?}` | `{steps}` |
//! | `engine.warmup` | `{models: [id, ...]}` | `{loaded: [id, ...]}` |
//!
//! Domain handlers (OCR, embeddings, transcription) register against the same
//! [`HandlerRegistry`] from the embedding application.

use std::thread;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::jobs::JobContext;
use crate::registry::{HandlerRegistry, HandlerResult, JobHandler};

pub const ECHO: &str = "engine.echo";
pub const SLEEP: &str = "engine.sleep";
pub const WARMUP: &str = "engine.warmup";

pub fn register_builtin(registry: &HandlerRegistry) {
    registry.register_fn(ECHO, |payload, _ctx| Ok(payload));
    registry.register(SLEEP, Sleep);
    registry.register(WARMUP, Warmup);
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SleepPayload {
    steps: u32,
    interval_ms: u64,
}

impl Default for SleepPayload {
    fn default() -> Self {
        Self {
            steps: 5,
            interval_ms: 100,
        }
    }
}

/// Sleeps in steps, reporting progress after each and stopping at the next
/// step boundary once the engine signals shutdown.
struct Sleep;

impl JobHandler for Sleep {
    fn execute(&self, payload: Value, ctx: &JobContext) -> HandlerResult {
        let payload: SleepPayload = if payload.is_null() {
            SleepPayload::default()
        } else {
            serde_json::from_value(payload)?
        };
        let steps = payload.steps.max(1);

        for step in 1..=steps {
            ctx.check_cancelled()?;
            thread::sleep(Duration::from_millis(payload.interval_ms));
            let percent = f64::from(step) * 100.0 / f64::from(steps);
            ctx.progress(percent, format!("step {step}/{steps}"));
        }
        Ok(json!({ "steps": steps }))
    }
}

#[derive(Debug, Deserialize)]
struct WarmupPayload {
    models: Vec<String>,
}

/// Loads each listed resource in turn, failing on the first that cannot be
/// loaded.
struct Warmup;

impl JobHandler for Warmup {
    fn execute(&self, payload: Value, ctx: &JobContext) -> HandlerResult {
        let payload: WarmupPayload = serde_json::from_value(payload)?;
        let total = payload.models.len().max(1);

        let mut loaded = Vec::with_capacity(payload.models.len());
        for (i, id) in payload.models.iter().enumerate() {
            ctx.check_cancelled()?;
            ctx.resources().ensure_loaded(id, None)?;
            debug!(job_id = %ctx.job_id(), resource = %id, "Warmed model");
            loaded.push(id.clone());
            ctx.progress((i + 1) as f64 * 100.0 / total as f64, format!("loaded {id}"));
        }
        Ok(json!({ "loaded": loaded }))
    }
}
