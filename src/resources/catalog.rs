//! Built-in resource catalog.
//!
//! | ID | Category | Size | Cost |
//! |----|----------|------|------|
//! | easyocr-en | ocr | 100 MB | 500 MB |
//! | easyocr-multilingual | ocr | 200 MB | 800 MB |
//! | sentence-transformers/all-MiniLM-L6-v2 | embeddings | 90 MB | 300 MB |
//! | sentence-transformers/all-mpnet-base-v2 | embeddings | 420 MB | 500 MB |
//! | nsfw-classifier | nsfw | 150 MB | 400 MB |
//! | whisper-tiny | whisper | 75 MB | 150 MB |
//! | whisper-base | whisper | 150 MB | 300 MB |
//! | whisper-small | whisper | 500 MB | 1 GB |
//! | whisper-medium | whisper | 1.5 GB | 3 GB |
//!
//! Costs are conservative estimates of accelerator memory while resident. They
//! are policy parameters, not measurements; the config file can override them.

use serde_json::{Map, Value, json};

use super::ResourceDescriptor;

/// Default budget: 6 GiB of accelerator memory.
pub const DEFAULT_BUDGET_BYTES: u64 = 6 * 1024 * 1024 * 1024;

/// Cost charged for resources registered without an estimate.
pub const DEFAULT_COST_BYTES: u64 = 500_000_000;

/// Static description of a built-in resource.
#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    pub id: &'static str,
    pub name: &'static str,
    pub category: &'static str,
    /// Declared on-disk size in bytes.
    pub size_bytes: u64,
    /// Estimated budget cost while loaded.
    pub cost_bytes: u64,
}

impl CatalogEntry {
    pub fn descriptor(&self) -> ResourceDescriptor {
        ResourceDescriptor {
            id: self.id.to_string(),
            name: self.name.to_string(),
            category: self.category.to_string(),
            size_bytes: self.size_bytes,
            cost_bytes: self.cost_bytes,
            default_options: default_options(self.id),
        }
    }
}

/// Load options a built-in resource starts from; callers may override them.
fn default_options(id: &str) -> Map<String, Value> {
    let options: Vec<(&str, Value)> = match id {
        "easyocr-en" => vec![("lang_list", json!(["en"]))],
        "easyocr-multilingual" => {
            vec![("lang_list", json!(["en", "es", "fr", "de", "it", "pt"]))]
        }
        "whisper-tiny" => vec![("model_size", json!("tiny"))],
        "whisper-base" => vec![("model_size", json!("base"))],
        "whisper-small" => vec![("model_size", json!("small"))],
        "whisper-medium" => vec![("model_size", json!("medium"))],
        _ => Vec::new(),
    };
    options
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

pub static DEFAULT_CATALOG: &[CatalogEntry] = &[
    // === OCR ===
    CatalogEntry {
        id: "easyocr-en",
        name: "EasyOCR English",
        category: "ocr",
        size_bytes: 100_000_000,
        cost_bytes: 500_000_000,
    },
    CatalogEntry {
        id: "easyocr-multilingual",
        name: "EasyOCR Multilingual",
        category: "ocr",
        size_bytes: 200_000_000,
        cost_bytes: 800_000_000,
    },
    // === Embeddings ===
    CatalogEntry {
        id: "sentence-transformers/all-MiniLM-L6-v2",
        name: "MiniLM-L6 Embeddings",
        category: "embeddings",
        size_bytes: 90_000_000,
        cost_bytes: 300_000_000,
    },
    CatalogEntry {
        id: "sentence-transformers/all-mpnet-base-v2",
        name: "MPNet Base Embeddings",
        category: "embeddings",
        size_bytes: 420_000_000,
        cost_bytes: 500_000_000,
    },
    // === Classification ===
    CatalogEntry {
        id: "nsfw-classifier",
        name: "NSFW Image Classifier",
        category: "nsfw",
        size_bytes: 150_000_000,
        cost_bytes: 400_000_000,
    },
    // === Transcription ===
    CatalogEntry {
        id: "whisper-tiny",
        name: "Whisper Tiny",
        category: "whisper",
        size_bytes: 75_000_000,
        cost_bytes: 150_000_000,
    },
    CatalogEntry {
        id: "whisper-base",
        name: "Whisper Base",
        category: "whisper",
        size_bytes: 150_000_000,
        cost_bytes: 300_000_000,
    },
    CatalogEntry {
        id: "whisper-small",
        name: "Whisper Small",
        category: "whisper",
        size_bytes: 500_000_000,
        cost_bytes: 1_000_000_000,
    },
    CatalogEntry {
        id: "whisper-medium",
        name: "Whisper Medium",
        category: "whisper",
        size_bytes: 1_500_000_000,
        cost_bytes: 3_000_000_000,
    },
];

/// Look up a built-in entry by id.
pub fn find(id: &str) -> Option<&'static CatalogEntry> {
    DEFAULT_CATALOG.iter().find(|e| e.id == id)
}

/// Descriptors for every built-in resource.
pub fn default_descriptors() -> Vec<ResourceDescriptor> {
    DEFAULT_CATALOG.iter().map(CatalogEntry::descriptor).collect()
}
