//! Persistent key/value cache for resolution results

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ExperimentError, Result};

/// Key/value store that survives process restarts
pub trait ResolutionCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn put(&self, key: &str, value: &str) -> Result<()>;
}

/// Cache backed by a JSON object on disk
pub struct JsonFileCache {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl JsonFileCache {
    /// Open the cache at `path`, starting empty if the file does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let content = std::fs::read(&path)?;
            serde_json::from_slice(&content)
                .map_err(|e| ExperimentError::Cache(format!("{}: {}", path.display(), e)))?
        } else {
            BTreeMap::new()
        };

        debug!("Opened cache {} with {} entries", path.display(), entries.len());
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let serialized = serde_json::to_vec_pretty(entries)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write atomically
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, &serialized)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl ResolutionCache for JsonFileCache {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write();
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries)
    }
}

/// Volatile cache, for dry runs and tests
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResolutionCache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_cache_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.json");

        let cache = JsonFileCache::open(&path).unwrap();
        assert_eq!(cache.get("subnet_for_target_10.0.0.1"), None);
        cache.put("subnet_for_target_10.0.0.1", "subnet-a").unwrap();

        let reopened = JsonFileCache::open(&path).unwrap();
        assert_eq!(
            reopened.get("subnet_for_target_10.0.0.1").as_deref(),
            Some("subnet-a")
        );
    }

    #[test]
    fn test_file_cache_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, b"not json").unwrap();

        assert!(matches!(
            JsonFileCache::open(&path),
            Err(ExperimentError::Cache(_))
        ));
    }

    #[test]
    fn test_memory_cache() {
        let cache = MemoryCache::new();
        cache.put("k", "v").unwrap();
        assert_eq!(cache.get("k").as_deref(), Some("v"));
    }
}
