//! Translation caches: named key -> row dictionaries maintained outside the
//! engine. The engine only reads snapshots, one per cache per execution.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::RegexBuilder;

use crate::error::{EngineError, Result};
use crate::value::CellValue;

/// Immutable view of one cache. Row index 0 is conventionally the key.
pub type CacheSnapshot = Arc<HashMap<String, Vec<CellValue>>>;

pub const MATCH_KEYS_LIMIT: usize = 1000;

pub trait TranslationCache: Send + Sync {
    fn snapshot(&self, cache: &str, cache_type: Option<&str>) -> Option<CacheSnapshot>;

    fn exists(&self, cache: &str) -> bool;

    fn cache_names(&self) -> Vec<String>;

    /// Keys whose row matches `pattern` (case-insensitive) in any of
    /// `columns` (default: column 1). Sorted, at most 1000.
    fn match_keys(&self, cache: &str, pattern: &str, columns: &[usize]) -> Result<Vec<String>> {
        let Some(snapshot) = self.snapshot(cache, None) else {
            return Ok(Vec::new());
        };
        let re = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| EngineError::binding(format!("invalid match pattern `{}`: {}", pattern, e)))?;
        let columns = if columns.is_empty() { &[1][..] } else { columns };
        let mut keys: Vec<String> = snapshot
            .iter()
            .filter(|(_, row)| {
                columns
                    .iter()
                    .filter_map(|&i| row.get(i))
                    .any(|v| !v.is_null() && re.is_match(&v.display()))
            })
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys.truncate(MATCH_KEYS_LIMIT);
        Ok(keys)
    }
}

/// In-process cache store. `put` swaps in a new snapshot; snapshots handed
/// out earlier stay unchanged.
#[derive(Default)]
pub struct MemoryTranslationCache {
    caches: RwLock<HashMap<String, CacheSnapshot>>,
}

impl MemoryTranslationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a cache with rows keyed by their first cell.
    pub fn put(&self, cache: &str, rows: Vec<Vec<CellValue>>) {
        let map: HashMap<String, Vec<CellValue>> = rows
            .into_iter()
            .filter_map(|row| row.first().map(|k| (k.key_string(), row.clone())))
            .collect();
        self.caches.write().insert(cache.to_string(), Arc::new(map));
    }

    pub fn remove(&self, cache: &str) {
        self.caches.write().remove(cache);
    }
}

impl TranslationCache for MemoryTranslationCache {
    fn snapshot(&self, cache: &str, _cache_type: Option<&str>) -> Option<CacheSnapshot> {
        self.caches.read().get(cache).cloned()
    }

    fn exists(&self, cache: &str) -> bool {
        self.caches.read().contains_key(cache)
    }

    fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().keys().cloned().collect();
        names.sort();
        names
    }
}
