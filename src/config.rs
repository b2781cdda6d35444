//! Engine configuration.
//!
//! Precedence, lowest to highest: built-in defaults, the TOML file given with
//! `--config`, `AI_ENGINE_*` environment variables, command-line flags.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::jobs::DEFAULT_MAX_WORKERS;
use crate::resources::catalog::{self, DEFAULT_BUDGET_BYTES, DEFAULT_COST_BYTES};
use crate::resources::ResourceDescriptor;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Catalog entry added or adjusted by the config file.
///
/// ```toml
/// [[resources]]
/// id = "whisper-medium"
/// cost_bytes = 2_500_000_000
///
/// [[resources]]
/// id = "clip-vit-b32"
/// name = "CLIP ViT-B/32"
/// type = "embeddings"
/// size_bytes = 350_000_000
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceOverride {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type", alias = "category")]
    pub category: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub cost_bytes: Option<u64>,
    #[serde(default)]
    pub default_options: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_workers: usize,
    pub max_budget_bytes: u64,
    pub cache_dir: PathBuf,
    pub model_dir: PathBuf,
    /// Default cache TTL; unset means entries never expire unless `set` asks.
    pub cache_default_ttl_secs: Option<u64>,
    /// Unload resources idle this long. 0 disables the reaper.
    pub idle_unload_secs: u64,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub resources: Vec<ResourceOverride>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            max_budget_bytes: DEFAULT_BUDGET_BYTES,
            cache_dir: std::env::temp_dir().join("ai-engine-cache"),
            model_dir: default_model_dir(),
            cache_default_ttl_secs: None,
            idle_unload_secs: 0,
            log_level: "info".to_string(),
            log_dir: None,
            resources: Vec::new(),
        }
    }
}

pub fn default_model_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "ai-engine", "ai-engine").map_or_else(
        || std::env::temp_dir().join("ai-engine-models"),
        |dirs| dirs.cache_dir().join("models"),
    )
}

impl EngineConfig {
    /// Defaults, overlaid with `path` when given, overlaid with the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay `AI_ENGINE_*` variables (a `.env` file is honoured too).
    /// Unparseable values are ignored.
    pub fn apply_env(&mut self) {
        if let Ok(val) = dotenvy::var("AI_ENGINE_MAX_WORKERS")
            && let Ok(n) = val.parse()
        {
            self.max_workers = n;
        }

        if let Ok(val) = dotenvy::var("AI_ENGINE_MAX_BUDGET_BYTES")
            && let Ok(bytes) = val.parse()
        {
            self.max_budget_bytes = bytes;
        }

        if let Ok(path) = dotenvy::var("AI_ENGINE_CACHE_DIR")
            && !path.is_empty()
        {
            self.cache_dir = PathBuf::from(path);
        }

        if let Ok(path) = dotenvy::var("AI_ENGINE_MODEL_DIR")
            && !path.is_empty()
        {
            self.model_dir = PathBuf::from(path);
        }

        if let Ok(val) = dotenvy::var("AI_ENGINE_CACHE_TTL_SECS")
            && let Ok(secs) = val.parse()
        {
            self.cache_default_ttl_secs = Some(secs);
        }

        if let Ok(val) = dotenvy::var("AI_ENGINE_IDLE_UNLOAD_SECS")
            && let Ok(secs) = val.parse()
        {
            self.idle_unload_secs = secs;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.max_budget_bytes == 0 {
            return Err(ConfigError::Invalid("max_budget_bytes must be positive".into()));
        }
        for resource in &self.resources {
            if resource.id.trim().is_empty() {
                return Err(ConfigError::Invalid("resource entries need a non-empty id".into()));
            }
        }
        Ok(())
    }

    pub fn idle_unload(&self) -> Option<Duration> {
        (self.idle_unload_secs > 0).then(|| Duration::from_secs(self.idle_unload_secs))
    }

    /// Built-in catalog with the `[[resources]]` entries applied.
    pub fn catalog(&self) -> Vec<ResourceDescriptor> {
        let mut descriptors = catalog::default_descriptors();
        for entry in &self.resources {
            match descriptors.iter_mut().find(|d| d.id == entry.id) {
                Some(existing) => entry.apply_to(existing),
                None => {
                    let mut descriptor = ResourceDescriptor {
                        id: entry.id.clone(),
                        name: entry.id.clone(),
                        category: "custom".to_string(),
                        size_bytes: 0,
                        cost_bytes: DEFAULT_COST_BYTES,
                        default_options: Map::new(),
                    };
                    entry.apply_to(&mut descriptor);
                    descriptors.push(descriptor);
                }
            }
        }
        descriptors
    }
}

impl ResourceOverride {
    fn apply_to(&self, descriptor: &mut ResourceDescriptor) {
        if let Some(name) = &self.name {
            descriptor.name = name.clone();
        }
        if let Some(category) = &self.category {
            descriptor.category = category.clone();
        }
        if let Some(size) = self.size_bytes {
            descriptor.size_bytes = size;
        }
        if let Some(cost) = self.cost_bytes {
            descriptor.cost_bytes = cost;
        }
        if let Some(options) = &self.default_options {
            descriptor.default_options = options.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const ENV_VARS: &[&str] = &[
        "AI_ENGINE_MAX_WORKERS",
        "AI_ENGINE_MAX_BUDGET_BYTES",
        "AI_ENGINE_CACHE_DIR",
        "AI_ENGINE_MODEL_DIR",
        "AI_ENGINE_CACHE_TTL_SECS",
        "AI_ENGINE_IDLE_UNLOAD_SECS",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            // SAFETY: env-mutating tests are serialised.
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.max_budget_bytes, 6 * 1024 * 1024 * 1024);
        assert!(config.idle_unload().is_none());
        assert!(config.validate().is_ok());
        assert_eq!(config.catalog().len(), catalog::DEFAULT_CATALOG.len());
    }

    #[test]
    fn test_from_file_partial() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("engine.toml");
        fs::write(
            &path,
            r#"
max_workers = 2
idle_unload_secs = 300

[[resources]]
id = "whisper-medium"
cost_bytes = 2500000000

[[resources]]
id = "clip-vit-b32"
name = "CLIP ViT-B/32"
type = "embeddings"
"#,
        )
        .unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.max_budget_bytes, DEFAULT_BUDGET_BYTES);
        assert_eq!(config.idle_unload(), Some(Duration::from_secs(300)));

        let catalog = config.catalog();
        let medium = catalog.iter().find(|d| d.id == "whisper-medium").unwrap();
        assert_eq!(medium.cost_bytes, 2_500_000_000);
        assert_eq!(medium.default_options["model_size"], "medium");

        let clip = catalog.iter().find(|d| d.id == "clip-vit-b32").unwrap();
        assert_eq!(clip.category, "embeddings");
        assert_eq!(clip.cost_bytes, DEFAULT_COST_BYTES);
    }

    #[test]
    fn test_from_file_errors() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            EngineConfig::from_file(&tmp.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));

        let bad = tmp.path().join("bad.toml");
        fs::write(&bad, "max_workers = \"many\"").unwrap();
        assert!(matches!(EngineConfig::from_file(&bad), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = EngineConfig {
            max_workers: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        // SAFETY: serialised with other env tests.
        unsafe {
            std::env::set_var("AI_ENGINE_MAX_WORKERS", "8");
            std::env::set_var("AI_ENGINE_CACHE_DIR", "/tmp/engine-cache-test");
            std::env::set_var("AI_ENGINE_CACHE_TTL_SECS", "60");
            std::env::set_var("AI_ENGINE_MAX_BUDGET_BYTES", "not-a-number");
        }

        let config = EngineConfig::load(None).unwrap();
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/engine-cache-test"));
        assert_eq!(config.cache_default_ttl_secs, Some(60));
        assert_eq!(config.max_budget_bytes, DEFAULT_BUDGET_BYTES);

        clear_env();
    }
}
