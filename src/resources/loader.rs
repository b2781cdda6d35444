//! Load/unload side effects for resources.
//!
//! The [`ResourceManager`](super::ResourceManager) owns bookkeeping and budget;
//! a [`ResourceLoader`] owns the concrete work of bringing a resource into
//! memory and releasing it. The manager never looks inside a handle.

use std::any::Any;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::debug;

use super::ResourceDescriptor;
use crate::monitor::ProcessMonitor;

/// Opaque handle to a loaded resource instance.
pub type ResourceHandle = Arc<dyn Any + Send + Sync>;

/// Concrete load/unload side effects.
///
/// Loaders are called with the manager's transition lock held, so they must
/// not call back into the manager.
pub trait ResourceLoader: Send + Sync {
    fn load(&self, resource: &ResourceDescriptor, options: &Map<String, Value>)
    -> Result<ResourceHandle>;

    fn unload(&self, _resource: &ResourceDescriptor, _handle: &ResourceHandle) -> Result<()> {
        Ok(())
    }

    /// Memory reclamation hook, run after a handle has been released.
    fn reclaim(&self) {}
}

/// A resource materialised as a directory under the model store.
#[derive(Debug, Clone)]
pub struct LocalModel {
    pub id: String,
    pub path: PathBuf,
    pub options: Map<String, Value>,
}

/// Default loader: prepares `<model_dir>/<category>/<id>` and hands out a
/// [`LocalModel`]. Real inference runtimes plug in behind the same trait.
#[derive(Debug, Clone)]
pub struct DirectoryLoader {
    model_dir: PathBuf,
    monitor: ProcessMonitor,
}

impl DirectoryLoader {
    pub fn new(model_dir: &Path) -> Result<Self> {
        fs::create_dir_all(model_dir)
            .with_context(|| format!("creating model directory {}", model_dir.display()))?;
        Ok(Self {
            model_dir: model_dir.to_path_buf(),
            monitor: ProcessMonitor::new(),
        })
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Storage path for a resource; ids like `org/model` are flattened.
    pub fn resource_path(&self, resource: &ResourceDescriptor) -> PathBuf {
        self.model_dir
            .join(path_component(&resource.category))
            .join(path_component(&resource.id))
    }
}

/// Map an arbitrary name onto a single safe path component.
fn path_component(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.chars().all(|c| c == '.') {
        // "", "." and ".." would not stay inside the model directory.
        format!("_{safe}")
    } else {
        safe
    }
}

impl ResourceLoader for DirectoryLoader {
    fn load(
        &self,
        resource: &ResourceDescriptor,
        options: &Map<String, Value>,
    ) -> Result<ResourceHandle> {
        let path = self.resource_path(resource);
        fs::create_dir_all(&path)
            .with_context(|| format!("preparing storage for {}", resource.id))?;
        Ok(Arc::new(LocalModel {
            id: resource.id.clone(),
            path,
            options: options.clone(),
        }))
    }

    fn reclaim(&self) {
        debug!(rss = %self.monitor.memory_usage_human(), "Memory after release");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> ResourceDescriptor {
        ResourceDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            category: "embeddings".to_string(),
            size_bytes: 1,
            cost_bytes: 1,
            default_options: Map::new(),
        }
    }

    #[test]
    fn test_directory_loader_creates_storage() {
        let tmp = tempfile::TempDir::new().unwrap();
        let loader = DirectoryLoader::new(&tmp.path().join("models")).unwrap();

        let mut options = Map::new();
        options.insert("device".into(), Value::String("cpu".into()));
        let handle = loader
            .load(&descriptor("sentence-transformers/all-MiniLM-L6-v2"), &options)
            .unwrap();

        let model = handle.downcast::<LocalModel>().expect("LocalModel handle");
        assert!(model.path.is_dir());
        assert!(model.path.ends_with("embeddings/sentence-transformers_all-MiniLM-L6-v2"));
        assert_eq!(model.options["device"], "cpu");
    }

    #[test]
    fn test_resource_path_flattens_separators() {
        let tmp = tempfile::TempDir::new().unwrap();
        let loader = DirectoryLoader::new(tmp.path()).unwrap();
        let path = loader.resource_path(&descriptor("../escape/attempt"));
        assert!(path.starts_with(tmp.path()));
        assert_eq!(path.file_name().unwrap(), ".._escape_attempt");

        let mut dots = descriptor("..");
        dots.category = "../..".to_string();
        let path = loader.resource_path(&dots);
        assert_eq!(path, tmp.path().join(".._..").join("_.."));
    }
}
