// Cache Module
// Layered cache storage: backends, key rendering, path archives and resolution

pub mod archive;
pub mod filesystem;
pub mod key;
pub mod memory;
pub mod resolver;

pub use archive::{CacheArchiver, JsonArchiver};
pub use filesystem::FileSystemCache;
pub use key::CacheKeyRenderer;
pub use memory::MemoryCache;
pub use resolver::{CacheHit, CacheResolver, SaveOutcome};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid cache key '{0}'")]
    InvalidKey(String),

    #[error("cache key expression failed: {0}")]
    KeyExpression(String),

    #[error("refusing to restore path outside the workspace: {0}")]
    UnsafePath(PathBuf),

    #[error("corrupt cache archive: {0}")]
    CorruptArchive(String),
}

/// Metadata of one stored entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub written_at: DateTime<Utc>,
    pub size: u64,
}

/// An entry together with its content
#[derive(Debug, Clone, PartialEq)]
pub struct CachedBlob {
    pub entry: CacheEntry,
    pub bytes: Vec<u8>,
}

/// Storage collaborator for cache content.
///
/// Entries are append-only: `store` on an existing key leaves it untouched.
#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Option<CachedBlob>, CacheError>;

    /// The most recently written entry whose key starts with `prefix`
    async fn fetch_by_prefix(&self, prefix: &str) -> Result<Option<CachedBlob>, CacheError>;

    async fn store(&self, key: &str, bytes: Vec<u8>) -> Result<(), CacheError>;

    async fn contains(&self, key: &str) -> Result<bool, CacheError>;
}

/// Write timestamps that strictly increase within one backend, so writes in
/// the same clock tick still order by write sequence
#[derive(Debug, Default)]
pub struct WriteClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl WriteClock {
    pub fn next(&self) -> DateTime<Utc> {
        let mut last = self.last.lock();
        let mut now = Utc::now();
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + Duration::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }
}

/// Most recent entry under `prefix`; equal timestamps resolve to the
/// lexicographically greatest key
pub fn select_most_recent<'a, I>(entries: I, prefix: &str) -> Option<&'a CacheEntry>
where
    I: IntoIterator<Item = &'a CacheEntry>,
{
    entries
        .into_iter()
        .filter(|e| e.key.starts_with(prefix))
        .max_by(|a, b| a.written_at.cmp(&b.written_at).then_with(|| a.key.cmp(&b.key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_clock_is_strictly_increasing() {
        let clock = WriteClock::default();
        let stamps: Vec<_> = (0..100).map(|_| clock.next()).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }
    use chrono::TimeZone;

    fn entry(key: &str, secs: i64) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            written_at: Utc.timestamp_opt(secs, 0).unwrap(),
            size: 0,
        }
    }

    #[test]
    fn test_select_most_recent_by_prefix() {
        let entries = vec![entry("v1-abc", 10), entry("v1-xyz", 20), entry("v2-q", 30)];
        assert_eq!(select_most_recent(&entries, "v1-").unwrap().key, "v1-xyz");
        assert_eq!(select_most_recent(&entries, "v2-").unwrap().key, "v2-q");
        assert!(select_most_recent(&entries, "v3-").is_none());
    }

    #[test]
    fn test_equal_timestamps_pick_greatest_key() {
        let entries = vec![entry("v1-b", 10), entry("v1-c", 10), entry("v1-a", 10)];
        assert_eq!(select_most_recent(&entries, "v1-").unwrap().key, "v1-c");
    }
}
