//! Disk-backed key/value cache with optional per-entry expiry.
//!
//! Each entry lives in its own JSON file named after a truncated SHA-256 of
//! the key. Expiry is an absolute timestamp (ms since epoch); expired entries
//! are treated as absent everywhere and removed lazily by `get`, `clear` and
//! `prune`.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

const ENTRY_EXTENSION: &str = "json";
const KEY_HASH_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize cache entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub created_at: i64,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|t| now_ms > t)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub directory: String,
    pub entries: usize,
    pub expired_entries: usize,
    pub total_size: u64,
}

pub struct Cache {
    dir: PathBuf,
    default_ttl_secs: Option<u64>,
}

impl Cache {
    /// Open (creating if necessary) a cache rooted at `dir`.
    pub fn open(dir: &Path, default_ttl_secs: Option<u64>) -> Result<Self, CacheError> {
        fs::create_dir_all(dir).map_err(|e| CacheError::io(dir, e))?;
        info!(dir = %dir.display(), ?default_ttl_secs, "Cache directory ready");
        Ok(Self {
            dir: dir.to_path_buf(),
            default_ttl_secs,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir
            .join(format!("{}.{ENTRY_EXTENSION}", &digest[..KEY_HASH_LEN]))
    }

    /// Look up a live entry. Expired entries are deleted and reported absent;
    /// unreadable entries are reported absent.
    pub fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.key_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(&path, e)),
        };

        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read cache entry");
                return Ok(None);
            }
        };

        if entry.is_expired(Utc::now().timestamp_millis()) {
            debug!(key = %key, "Cache entry expired");
            remove_quietly(&path);
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Store `value` under `key`.
    ///
    /// `ttl_secs`: `None` uses the default TTL, `Some(0)` never expires.
    pub fn set(&self, key: &str, value: Value, ttl_secs: Option<u64>) -> Result<(), CacheError> {
        let now = Utc::now().timestamp_millis();
        let ttl = ttl_secs.or(self.default_ttl_secs).filter(|&t| t > 0);
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            created_at: now,
            expires_at: ttl.map(|t| now.saturating_add((t as i64).saturating_mul(1000))),
        };
        let bytes = serde_json::to_vec(&entry)?;

        let path = self.key_path(key);
        let temp_path = path.with_extension("json.tmp");
        let write = || -> io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&temp_path, &path)
        };
        write().map_err(|e| {
            remove_quietly(&temp_path);
            CacheError::io(&path, e)
        })
    }

    /// Remove an entry. Returns whether one existed.
    pub fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let path = self.key_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::io(&path, e)),
        }
    }

    /// Remove every entry, or only those whose key starts with `prefix`.
    /// Corrupted entries are always removed and counted.
    pub fn clear(&self, prefix: Option<&str>) -> Result<usize, CacheError> {
        let mut cleared = 0;
        for path in self.entry_paths()? {
            if let Some(prefix) = prefix {
                match read_entry(&path) {
                    Some(entry) if !entry.key.starts_with(prefix) => continue,
                    _ => {}
                }
            }
            if fs::remove_file(&path).is_ok() {
                cleared += 1;
            }
        }
        info!(cleared, prefix = prefix.unwrap_or(""), "Cleared cache entries");
        Ok(cleared)
    }

    /// Remove expired and corrupted entries.
    pub fn prune(&self) -> Result<usize, CacheError> {
        let now = Utc::now().timestamp_millis();
        let mut pruned = 0;
        for path in self.entry_paths()? {
            let stale = match read_entry(&path) {
                Some(entry) => entry.is_expired(now),
                None => true,
            };
            if stale && fs::remove_file(&path).is_ok() {
                pruned += 1;
            }
        }
        if pruned > 0 {
            info!(pruned, "Pruned expired cache entries");
        }
        Ok(pruned)
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let now = Utc::now().timestamp_millis();
        let mut stats = CacheStats {
            directory: self.dir.display().to_string(),
            entries: 0,
            expired_entries: 0,
            total_size: 0,
        };
        for path in self.entry_paths()? {
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            stats.entries += 1;
            stats.total_size += meta.len();
            if read_entry(&path).is_some_and(|e| e.is_expired(now)) {
                stats.expired_entries += 1;
            }
        }
        Ok(stats)
    }

    fn entry_paths(&self) -> Result<Vec<PathBuf>, CacheError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| CacheError::io(&self.dir, e))?;
        Ok(entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == ENTRY_EXTENSION))
            .collect())
    }
}

fn read_entry(path: &Path) -> Option<CacheEntry> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        debug!(path = %path.display(), error = %e, "Failed to remove cache file");
    }
}
