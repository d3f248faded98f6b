// In-memory cache backend

use crate::cache::{select_most_recent, CacheBackend, CacheEntry, CacheError, CachedBlob, WriteClock};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Process-local backend; write timestamps are strictly increasing
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<BTreeMap<String, CachedBlob>>,
    clock: WriteClock,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert with an explicit timestamp, leaving existing keys untouched
    pub fn insert_at(&self, key: &str, bytes: Vec<u8>, written_at: DateTime<Utc>) {
        let mut entries = self.entries.write();
        entries.entry(key.to_string()).or_insert_with(|| CachedBlob {
            entry: CacheEntry {
                key: key.to_string(),
                written_at,
                size: bytes.len() as u64,
            },
            bytes,
        });
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

#[async_trait::async_trait]
impl CacheBackend for MemoryCache {
    async fn fetch(&self, key: &str) -> Result<Option<CachedBlob>, CacheError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn fetch_by_prefix(&self, prefix: &str) -> Result<Option<CachedBlob>, CacheError> {
        let entries = self.entries.read();
        let best = select_most_recent(entries.values().map(|b| &b.entry), prefix);
        Ok(best.and_then(|e| entries.get(&e.key).cloned()))
    }

    async fn store(&self, key: &str, bytes: Vec<u8>) -> Result<(), CacheError> {
        let written_at = self.clock.next();
        self.insert_at(key, bytes, written_at);
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.read().contains_key(key))
    }
}
