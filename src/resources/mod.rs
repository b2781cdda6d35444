//! Budgeted resource lifecycle.
//!
//! The [`ResourceManager`] tracks every known resource (a model, in practice)
//! and arbitrates which may be resident at once under a fixed capacity budget:
//!
//! - a resource's cost counts against the budget iff it is loaded
//! - the admission check runs before the load side effect, never after
//! - a failed load or unload leaves the budget counter untouched
//!
//! Two locks are involved. `transitions` serialises every load, unload and
//! registration, so the check-then-act sequence is atomic with respect to
//! other transitions. `table` guards the records and the counter and is only
//! held briefly, so listings and status reads stay responsive while a slow
//! load side effect runs.

pub mod catalog;
pub mod loader;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use catalog::{DEFAULT_BUDGET_BYTES, DEFAULT_COST_BYTES};
pub use loader::{DirectoryLoader, LocalModel, ResourceHandle, ResourceLoader};

use crate::monitor::format_bytes;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Unknown model: {0}")]
    Unknown(String),

    #[error(
        "Loading {id} would exceed the memory budget: {used} bytes in use + {required} bytes required > {max} bytes max"
    )]
    BudgetExceeded {
        id: String,
        used: u64,
        required: u64,
        max: u64,
        /// Loaded resources, least recently used first, whose release would
        /// make room.
        suggest_unload: Vec<String>,
    },

    #[error("Failed to load model {id}: {reason}")]
    LoadFailed { id: String, reason: String },

    #[error("Failed to unload model {id}: {reason}")]
    UnloadFailed { id: String, reason: String },

    #[error("Model {0} is loaded; unload it before re-registering")]
    AlreadyLoaded(String),
}

/// Static description of a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDescriptor {
    pub id: String,
    pub name: String,
    pub category: String,
    /// Declared nominal size in bytes.
    pub size_bytes: u64,
    /// Budget charged while loaded.
    pub cost_bytes: u64,
    pub default_options: Map<String, Value>,
}

/// Listing entry returned by [`ResourceManager::list_resources`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub category: String,
    pub loaded: bool,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub loaded: bool,
    /// Budget currently charged for this resource.
    pub memory_usage: u64,
    /// Milliseconds since epoch.
    pub last_used: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetSnapshot {
    pub used: u64,
    pub max: u64,
}

struct ResourceRecord {
    descriptor: Arc<ResourceDescriptor>,
    loaded: bool,
    charged: u64,
    handle: Option<ResourceHandle>,
    last_used: Option<DateTime<Utc>>,
    last_used_at: Option<Instant>,
}

impl ResourceRecord {
    fn new(descriptor: ResourceDescriptor) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            loaded: false,
            charged: 0,
            handle: None,
            last_used: None,
            last_used_at: None,
        }
    }

    fn touch(&mut self) {
        self.last_used = Some(Utc::now());
        self.last_used_at = Some(Instant::now());
    }
}

#[derive(Default)]
struct ResourceTable {
    records: BTreeMap<String, ResourceRecord>,
    used: u64,
}

impl ResourceTable {
    /// Loaded resources in least-recently-used order whose combined cost is at
    /// least `needed`.
    fn eviction_candidates(&self, needed: u64) -> Vec<String> {
        let mut loaded: Vec<&ResourceRecord> = self.records.values().filter(|r| r.loaded).collect();
        loaded.sort_by_key(|r| r.last_used_at);

        let mut freed = 0u64;
        let mut picked = Vec::new();
        for record in loaded {
            if freed >= needed {
                break;
            }
            freed += record.charged;
            picked.push(record.descriptor.id.clone());
        }
        picked
    }
}

/// Owner of every resource record, loaded handle and the budget counter.
pub struct ResourceManager {
    table: Mutex<ResourceTable>,
    transitions: Mutex<()>,
    max_budget: u64,
    loader: Arc<dyn ResourceLoader>,
}

impl ResourceManager {
    /// Create a manager with an empty catalog.
    pub fn new(max_budget: u64, loader: Arc<dyn ResourceLoader>) -> Self {
        info!(budget = %format_bytes(max_budget), "Resource budget configured");
        Self {
            table: Mutex::new(ResourceTable::default()),
            transitions: Mutex::new(()),
            max_budget,
            loader,
        }
    }

    /// Create a manager pre-populated with `catalog`.
    pub fn with_catalog(
        max_budget: u64,
        loader: Arc<dyn ResourceLoader>,
        catalog: impl IntoIterator<Item = ResourceDescriptor>,
    ) -> Self {
        let manager = Self::new(max_budget, loader);
        {
            let mut table = manager.table.lock();
            for descriptor in catalog {
                table
                    .records
                    .insert(descriptor.id.clone(), ResourceRecord::new(descriptor));
            }
        }
        manager
    }

    pub fn max_budget(&self) -> u64 {
        self.max_budget
    }

    pub fn budget(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            used: self.table.lock().used,
            max: self.max_budget,
        }
    }

    /// Register (or replace) a resource description at runtime.
    pub fn register(&self, descriptor: ResourceDescriptor) -> Result<(), ResourceError> {
        let _transition = self.transitions.lock();
        let mut table = self.table.lock();
        if let Some(existing) = table.records.get(&descriptor.id)
            && existing.loaded
        {
            return Err(ResourceError::AlreadyLoaded(descriptor.id));
        }
        info!(resource = %descriptor.id, cost = %format_bytes(descriptor.cost_bytes), "Registered model");
        table
            .records
            .insert(descriptor.id.clone(), ResourceRecord::new(descriptor));
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.table.lock().records.contains_key(id)
    }

    /// Snapshot of every known resource, ordered by id.
    pub fn list_resources(&self) -> Vec<ResourceInfo> {
        self.table
            .lock()
            .records
            .values()
            .map(|r| ResourceInfo {
                id: r.descriptor.id.clone(),
                name: r.descriptor.name.clone(),
                category: r.descriptor.category.clone(),
                loaded: r.loaded,
                size: r.descriptor.size_bytes,
            })
            .collect()
    }

    pub fn get_status(&self, id: &str) -> Result<ResourceStatus, ResourceError> {
        let table = self.table.lock();
        let record = table
            .records
            .get(id)
            .ok_or_else(|| ResourceError::Unknown(id.to_string()))?;
        Ok(ResourceStatus {
            loaded: record.loaded,
            memory_usage: record.charged,
            last_used: record.last_used.map(|t| t.timestamp_millis()),
        })
    }

    /// Load a resource, returning its handle.
    ///
    /// Already-loaded resources return their existing handle. Caller options
    /// are merged over the catalog defaults.
    pub fn load(
        &self,
        id: &str,
        options: Option<&Map<String, Value>>,
    ) -> Result<ResourceHandle, ResourceError> {
        let _transition = self.transitions.lock();

        let (descriptor, effective) = {
            let mut table = self.table.lock();
            let used = table.used;
            let record = table
                .records
                .get_mut(id)
                .ok_or_else(|| ResourceError::Unknown(id.to_string()))?;

            if record.loaded
                && let Some(handle) = record.handle.clone()
            {
                debug!(resource = %id, "Model already loaded");
                record.touch();
                return Ok(handle);
            }

            let cost = record.descriptor.cost_bytes;
            if used.saturating_add(cost) > self.max_budget {
                let needed = used.saturating_add(cost) - self.max_budget;
                let suggest_unload = table.eviction_candidates(needed);
                warn!(
                    resource = %id,
                    used = %format_bytes(used),
                    required = %format_bytes(cost),
                    max = %format_bytes(self.max_budget),
                    "Refusing load: budget would be exceeded"
                );
                return Err(ResourceError::BudgetExceeded {
                    id: id.to_string(),
                    used,
                    required: cost,
                    max: self.max_budget,
                    suggest_unload,
                });
            }

            let mut effective = record.descriptor.default_options.clone();
            if let Some(options) = options {
                for (key, value) in options {
                    effective.insert(key.clone(), value.clone());
                }
            }
            (record.descriptor.clone(), effective)
        };

        let started = Instant::now();
        let handle = self.loader.load(&descriptor, &effective).map_err(|e| {
            error!(resource = %id, error = %format!("{e:#}"), "Failed to load model");
            ResourceError::LoadFailed {
                id: id.to_string(),
                reason: format!("{e:#}"),
            }
        })?;

        let mut table = self.table.lock();
        let cost = descriptor.cost_bytes;
        table.used += cost;
        let used = table.used;
        if let Some(record) = table.records.get_mut(id) {
            record.loaded = true;
            record.charged = cost;
            record.handle = Some(handle.clone());
            record.touch();
        }
        info!(
            resource = %id,
            cost = %format_bytes(cost),
            total = %format_bytes(used),
            max = %format_bytes(self.max_budget),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Loaded model"
        );
        Ok(handle)
    }

    /// Boolean form of [`load`](Self::load); failures are logged.
    pub fn load_resource(&self, id: &str, options: Option<&Map<String, Value>>) -> bool {
        match self.load(id, options) {
            Ok(_) => true,
            Err(e) => {
                debug!(resource = %id, error = %e, "load_resource failed");
                false
            }
        }
    }

    /// Unload a resource. Unloading an unloaded resource is a no-op.
    pub fn unload(&self, id: &str) -> Result<(), ResourceError> {
        let _transition = self.transitions.lock();

        let (descriptor, handle) = {
            let table = self.table.lock();
            let record = table
                .records
                .get(id)
                .ok_or_else(|| ResourceError::Unknown(id.to_string()))?;
            if !record.loaded {
                debug!(resource = %id, "Model not loaded");
                return Ok(());
            }
            (record.descriptor.clone(), record.handle.clone())
        };

        if let Some(handle) = &handle {
            self.loader.unload(&descriptor, handle).map_err(|e| {
                error!(resource = %id, error = %format!("{e:#}"), "Failed to unload model");
                ResourceError::UnloadFailed {
                    id: id.to_string(),
                    reason: format!("{e:#}"),
                }
            })?;
        }

        let (freed, used) = {
            let mut table = self.table.lock();
            let freed = match table.records.get_mut(id) {
                Some(record) => {
                    let freed = record.charged;
                    record.loaded = false;
                    record.charged = 0;
                    record.handle = None;
                    freed
                }
                None => 0,
            };
            table.used = table.used.saturating_sub(freed);
            (freed, table.used)
        };

        drop(handle);
        self.loader.reclaim();

        info!(
            resource = %id,
            freed = %format_bytes(freed),
            total = %format_bytes(used),
            "Unloaded model"
        );
        Ok(())
    }

    /// Boolean form of [`unload`](Self::unload); failures are logged.
    pub fn unload_resource(&self, id: &str) -> bool {
        match self.unload(id) {
            Ok(()) => true,
            Err(e) => {
                debug!(resource = %id, error = %e, "unload_resource failed");
                false
            }
        }
    }

    fn loaded_ids(&self) -> Vec<String> {
        self.table
            .lock()
            .records
            .values()
            .filter(|r| r.loaded)
            .map(|r| r.descriptor.id.clone())
            .collect()
    }

    /// Unload everything that is loaded. Returns how many were unloaded;
    /// individual failures are logged and the sweep continues.
    pub fn unload_all(&self) -> usize {
        let mut unloaded = 0;
        for id in self.loaded_ids() {
            match self.unload(&id) {
                Ok(()) => unloaded += 1,
                Err(e) => warn!(resource = %id, error = %e, "Unload failed during sweep"),
            }
        }
        unloaded
    }

    /// Unload resources unused for longer than `max_idle`.
    pub fn unload_idle(&self, max_idle: Duration) -> Vec<String> {
        let idle: Vec<String> = {
            let table = self.table.lock();
            table
                .records
                .values()
                .filter(|r| r.loaded)
                .filter(|r| r.last_used_at.is_some_and(|t| t.elapsed() > max_idle))
                .map(|r| r.descriptor.id.clone())
                .collect()
        };

        idle.into_iter()
            .filter(|id| match self.unload(id) {
                Ok(()) => {
                    info!(resource = %id, idle_secs = max_idle.as_secs(), "Unloaded idle model");
                    true
                }
                Err(e) => {
                    warn!(resource = %id, error = %e, "Idle unload failed");
                    false
                }
            })
            .collect()
    }

    /// Handle of a loaded resource, stamping its last-used time.
    pub fn get(&self, id: &str) -> Option<ResourceHandle> {
        let mut table = self.table.lock();
        let record = table.records.get_mut(id).filter(|r| r.loaded)?;
        record.touch();
        record.handle.clone()
    }

    /// Return the resource's handle, loading it first if needed.
    ///
    /// Budget refusals and side-effect failures both surface as
    /// [`ResourceError::LoadFailed`].
    pub fn ensure_loaded(
        &self,
        id: &str,
        options: Option<&Map<String, Value>>,
    ) -> Result<ResourceHandle, ResourceError> {
        if let Some(handle) = self.get(id) {
            return Ok(handle);
        }
        self.load(id, options).map_err(|e| match e {
            ResourceError::Unknown(id) => ResourceError::Unknown(id),
            ResourceError::LoadFailed { .. } => e,
            other => ResourceError::LoadFailed {
                id: id.to_string(),
                reason: other.to_string(),
            },
        })
    }

    /// [`ensure_loaded`](Self::ensure_loaded) and downcast to the loader's
    /// concrete handle type.
    pub fn ensure_loaded_as<T>(
        &self,
        id: &str,
        options: Option<&Map<String, Value>>,
    ) -> Result<Arc<T>, ResourceError>
    where
        T: Send + Sync + 'static,
    {
        self.ensure_loaded(id, options)?
            .downcast::<T>()
            .map_err(|_| ResourceError::LoadFailed {
                id: id.to_string(),
                reason: "loaded handle has an unexpected type".to_string(),
            })
    }
}
