//! Per-target build cache index.
//!
//! Maps `(entry type, name)` to the fingerprints of everything that went
//! into the last successful build of that unit: primary input mtime and
//! content hash, platform-configuration layer hashes and the secondary-input
//! set with their output hashes. A unit is reused only when all of them
//! match; mtimes alone are never trusted.

use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SecondaryFingerprint {
    pub type_name: String,
    pub name: String,
    pub output_hash: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub input_mtime_ns: u64,
    pub input_hash: u64,
    pub platform_hash: u64,
    pub secondary: Vec<SecondaryFingerprint>,
    pub output_hash: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheIndex {
    pub entries: FxHashMap<String, CacheEntry>,
}

pub fn cache_key(type_name: &str, name: &str) -> String {
    format!("{}:{}", type_name, name)
}

impl CacheIndex {
    pub fn load(path: &Path) -> CacheIndex {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|error| {
                tracing::warn!(path = %path.display(), %error, "cache index unreadable, rebuilding");
                CacheIndex::default()
            }),
            Err(_) => CacheIndex::default(),
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self).expect("cache index serializes");
        std::fs::write(path, text)
    }

    pub fn get(&self, type_name: &str, name: &str) -> Option<&CacheEntry> {
        self.entries.get(&cache_key(type_name, name))
    }

    pub fn put(&mut self, type_name: &str, name: &str, entry: CacheEntry) {
        self.entries.insert(cache_key(type_name, name), entry);
    }
}
