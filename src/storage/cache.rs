//! In-process read-through cache for the structured store, keyed by `(table,
//! id)` with a configurable TTL. Uses a `Mutex` rather than a `RefCell` since
//! this cache is shared across concurrent worker tasks.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use crate::config::CacheConfig;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    inserted_at: Instant,
}

/// Best-effort, per-process cache. No strong consistency across processes; a
/// miss always falls through to the store. Disabled entirely by
/// `CacheConfig::enabled = false`, in which case every call is a no-op.
pub struct Cache {
    entries: Mutex<HashMap<(String, String), Entry>>,
    enabled: bool,
    ttl: Duration,
}

impl Cache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            enabled: config.enabled,
            ttl: Duration::from_secs(config.ttl_seconds),
        }
    }

    /// A cache that never stores anything, for callers that want the same
    /// `StructuredStore` API without the caching layer (tests, `migrate`).
    pub fn disabled() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            enabled: false,
            ttl: Duration::from_secs(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the cached value for `(table, id)` if present and not expired.
    /// Expired entries are evicted lazily, on this read.
    pub fn get(&self, table: &str, id: &str) -> Option<Value> {
        if !self.enabled {
            return None;
        }
        let key = (table.to_string(), id.to_string());
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        match entries.get(&key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                debug!(table, id, "cache hit");
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(&key);
                debug!(table, id, "cache entry expired");
                None
            }
            None => None,
        }
    }

    pub fn put(&self, table: &str, id: &str, value: Value) {
        if !self.enabled {
            return;
        }
        let key = (table.to_string(), id.to_string());
        self.entries.lock().expect("cache mutex poisoned").insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Invalidates a single key. Every write path calls this after the mutation
    /// commits.
    pub fn invalidate(&self, table: &str, id: &str) {
        if !self.enabled {
            return;
        }
        self.entries
            .lock()
            .expect("cache mutex poisoned")
            .remove(&(table.to_string(), id.to_string()));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
