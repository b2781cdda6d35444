//! Request dispatch for the stdio engine.
//!
//! The [`Dispatcher`] reads one request per line, routes it to the scheduler,
//! cache or resource manager and queues exactly one response on the output
//! channel. Job events reach the same channel from worker threads.

use std::io::BufRead;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

use super::protocol::{Outbound, Request, Response, RpcError, parse_request};
use crate::cache::Cache;
use crate::config::EngineConfig;
use crate::handlers;
use crate::jobs::{EventSink, JobScheduler, Priority};
use crate::monitor::ProcessMonitor;
use crate::registry::HandlerRegistry;
use crate::resources::{DirectoryLoader, ResourceDescriptor, ResourceError, ResourceLoader, ResourceManager};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Deserialize)]
struct StartParams {
    #[serde(rename = "type")]
    job_type: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    priority: Priority,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobIdParams {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct KeyParams {
    key: String,
}

#[derive(Debug, Deserialize)]
struct CacheSetParams {
    key: String,
    value: Value,
    #[serde(default)]
    ttl: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CacheClearParams {
    #[serde(default)]
    prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelIdParams {
    model_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelLoadParams {
    model_id: String,
    #[serde(default)]
    options: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelRegisterParams {
    model_id: String,
    name: String,
    #[serde(rename = "type")]
    category: String,
    size: u64,
    #[serde(default)]
    cost: Option<u64>,
    #[serde(default)]
    options: Option<Map<String, Value>>,
}

/// Deserialize params, treating absent params as an empty object.
fn params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    let params = if params.is_null() {
        Value::Object(Map::new())
    } else {
        params
    };
    serde_json::from_value(params).map_err(RpcError::invalid_params)
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(RpcError::internal)
}

/// Engine front end: owns the scheduler, cache and resource manager.
pub struct Dispatcher {
    jobs: Arc<JobScheduler>,
    resources: Arc<ResourceManager>,
    cache: Arc<Cache>,
    out: Sender<Outbound>,
    monitor: ProcessMonitor,
    start_time: Instant,
    total_requests: AtomicU64,
    shutdown: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        jobs: Arc<JobScheduler>,
        resources: Arc<ResourceManager>,
        cache: Arc<Cache>,
        out: Sender<Outbound>,
    ) -> Self {
        Self {
            jobs,
            resources,
            cache,
            out,
            monitor: ProcessMonitor::new(),
            start_time: Instant::now(),
            total_requests: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Build a complete engine from configuration: working directories,
    /// resource catalog, built-in handlers and the worker pool.
    pub fn from_config(config: &EngineConfig, out: Sender<Outbound>) -> Result<Self> {
        config.validate()?;

        let cache = Cache::open(&config.cache_dir, config.cache_default_ttl_secs)
            .context("opening cache directory")?;
        let loader: Arc<dyn ResourceLoader> =
            Arc::new(DirectoryLoader::new(&config.model_dir).context("opening model directory")?);
        let resources = Arc::new(ResourceManager::with_catalog(
            config.max_budget_bytes,
            loader,
            config.catalog(),
        ));

        let registry = Arc::new(HandlerRegistry::new());
        handlers::register_builtin(&registry);

        let events: Arc<dyn EventSink> = Arc::new(out.clone());
        let jobs = JobScheduler::new(config.max_workers, registry, resources.clone(), events)
            .context("starting worker pool")?;

        Ok(Self::new(Arc::new(jobs), resources, Arc::new(cache), out))
    }

    pub fn jobs(&self) -> &Arc<JobScheduler> {
        &self.jobs
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Read requests until EOF or a shutdown request, answering each on the
    /// output channel.
    pub fn serve<R: BufRead>(&self, mut reader: R) -> std::io::Result<()> {
        info!(version = VERSION, "Engine ready, reading requests from stdin");
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                info!("Input closed");
                break;
            }

            let response = match std::str::from_utf8(&buf) {
                Ok(line) => self.handle_line(line),
                Err(e) => Some(Response::failure(Value::Null, RpcError::parse_error(e))),
            };
            if let Some(response) = response
                && self.out.send(Outbound::Response(response)).is_err()
            {
                warn!("Output channel closed, stopping");
                break;
            }

            if self.is_shutting_down() {
                info!("Shutdown requested, stopping");
                break;
            }
        }
        Ok(())
    }

    /// Handle one raw line. Blank lines produce no response.
    pub fn handle_line(&self, line: &str) -> Option<Response> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let response = match parse_request(line) {
            Ok(request) => self.handle_request(request),
            Err((id, error)) => {
                warn!(code = error.code, message = %error.message, "Rejected request");
                Response::failure(id, error)
            }
        };
        Some(response)
    }

    pub fn handle_request(&self, request: Request) -> Response {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let Request { id, method, params: raw } = request;
        debug!(method = %method, id = %id, "Handling request");

        let routed = panic::catch_unwind(AssertUnwindSafe(|| self.route(&method, raw)));
        match routed {
            Ok(Ok(result)) => Response::success(id, result),
            Ok(Err(error)) => {
                debug!(method = %method, code = error.code, message = %error.message, "Request failed");
                Response::failure(id, error)
            }
            Err(_) => {
                error!(method = %method, "Request handler panicked");
                Response::failure(id, RpcError::internal(format!("{method} panicked")))
            }
        }
    }

    fn route(&self, method: &str, raw: Value) -> Result<Value, RpcError> {
        match method {
            "engine.health" => self.health(),
            "engine.shutdown" => {
                info!("Shutdown requested by client");
                self.request_shutdown();
                Ok(json!({ "success": true }))
            }

            "jobs.start" => {
                let p: StartParams = params(raw)?;
                let job_id = self.jobs.start(&p.job_type, p.payload, p.priority)?;
                Ok(json!({ "jobId": job_id }))
            }
            "jobs.status" => {
                let p: JobIdParams = params(raw)?;
                to_value(self.jobs.status(&p.job_id)?)
            }
            "jobs.result" => {
                let p: JobIdParams = params(raw)?;
                to_value(self.jobs.result(&p.job_id)?)
            }
            "jobs.cancel" => {
                let p: JobIdParams = params(raw)?;
                to_value(self.jobs.cancel(&p.job_id)?)
            }
            "jobs.list" => to_value(self.jobs.list()),
            "jobs.types" => to_value(self.jobs.registry().list_job_types()),

            "cache.get" => {
                let p: KeyParams = params(raw)?;
                Ok(match self.cache.get(&p.key)? {
                    Some(entry) => json!({
                        "found": true,
                        "value": entry.value,
                        "expiresAt": entry.expires_at,
                    }),
                    None => json!({ "found": false }),
                })
            }
            "cache.set" => {
                let p: CacheSetParams = params(raw)?;
                self.cache.set(&p.key, p.value, p.ttl)?;
                Ok(json!({ "success": true }))
            }
            "cache.delete" => {
                let p: KeyParams = params(raw)?;
                let existed = self.cache.delete(&p.key)?;
                Ok(json!({ "success": true, "existed": existed }))
            }
            "cache.clear" => {
                let p: CacheClearParams = params(raw)?;
                let cleared = self.cache.clear(p.prefix.as_deref())?;
                Ok(json!({ "success": true, "cleared": cleared }))
            }
            "cache.prune" => {
                let pruned = self.cache.prune()?;
                Ok(json!({ "success": true, "pruned": pruned }))
            }
            "cache.stats" => to_value(self.cache.stats()?),

            "models.list" | "resources.list" => to_value(self.resources.list_resources()),
            "models.load" | "resources.load" => {
                let p: ModelLoadParams = params(raw)?;
                Ok(self.load_model(&p.model_id, p.options.as_ref()))
            }
            "models.unload" | "resources.unload" => {
                let p: ModelIdParams = params(raw)?;
                Ok(json!({ "success": self.resources.unload_resource(&p.model_id) }))
            }
            "models.status" | "resources.status" => {
                let p: ModelIdParams = params(raw)?;
                to_value(self.resources.get_status(&p.model_id)?)
            }
            "models.register" | "resources.register" => {
                let p: ModelRegisterParams = params(raw)?;
                self.resources.register(ResourceDescriptor {
                    id: p.model_id,
                    name: p.name,
                    category: p.category,
                    size_bytes: p.size,
                    cost_bytes: p.cost.unwrap_or(crate::resources::DEFAULT_COST_BYTES),
                    default_options: p.options.unwrap_or_default(),
                })?;
                Ok(json!({ "success": true }))
            }

            _ => Err(RpcError::method_not_found(method)),
        }
    }

    /// `models.load` always answers with a result object; failures are
    /// reported as `success: false` with a reason.
    fn load_model(&self, id: &str, options: Option<&Map<String, Value>>) -> Value {
        let started = Instant::now();
        let outcome = self.resources.load(id, options);
        let load_time = started.elapsed().as_millis() as u64;

        let error = match outcome {
            Ok(_) => return json!({ "success": true, "loadTime": load_time }),
            Err(e) => e,
        };

        let mut result = json!({
            "success": false,
            "loadTime": load_time,
            "reason": error.to_string(),
        });
        if let ResourceError::BudgetExceeded {
            used,
            required,
            max,
            suggest_unload,
            ..
        } = error
        {
            result["budget"] = json!({
                "used": used,
                "required": required,
                "max": max,
                "suggestUnload": suggest_unload,
            });
        }
        result
    }

    fn health(&self) -> Result<Value, RpcError> {
        Ok(json!({
            "status": "ok",
            "version": VERSION,
            "uptime": self.uptime_secs(),
            "memory": {
                "used": self.monitor.memory_usage(),
                "total": self.monitor.total_memory(),
            },
            "jobs": self.jobs.counts(),
            "workers": self.jobs.workers(),
            "budget": self.resources.budget(),
            "requests": self.total_requests.load(Ordering::Relaxed),
            "build": {
                "timestamp": option_env!("VERGEN_BUILD_TIMESTAMP"),
                "target": option_env!("VERGEN_CARGO_TARGET_TRIPLE"),
            },
        }))
    }

    /// Stop the scheduler, release every resource and prune the cache.
    pub fn shutdown(&self) {
        self.request_shutdown();
        self.jobs.shutdown();
        let unloaded = self.resources.unload_all();
        match self.cache.prune() {
            Ok(pruned) => info!(unloaded, pruned, "Engine stopped"),
            Err(e) => warn!(unloaded, error = %e, "Engine stopped; cache prune failed"),
        }
    }
}
