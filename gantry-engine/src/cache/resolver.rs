// Cache Resolver
// Exact-then-prefix lookup and idempotent, serialized saves

use crate::cache::{CacheArchiver, CacheBackend, CacheEntry, CacheError};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// A restore match
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub entry: CacheEntry,
    /// Whether `entry.key` is the primary key itself
    pub exact: bool,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Stored,
    AlreadyPresent,
}

pub struct CacheResolver {
    backend: Arc<dyn CacheBackend>,
    archiver: Arc<dyn CacheArchiver>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CacheResolver {
    pub fn new(backend: Arc<dyn CacheBackend>, archiver: Arc<dyn CacheArchiver>) -> Self {
        Self {
            backend,
            archiver,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Exact match on `primary` first, then the most recent entry under each
    /// fallback prefix in order
    pub async fn resolve(&self, primary: &str, fallbacks: &[String]) -> Result<Option<CacheHit>, CacheError> {
        if let Some(blob) = self.backend.fetch(primary).await? {
            return Ok(Some(CacheHit {
                entry: blob.entry,
                exact: true,
                bytes: blob.bytes,
            }));
        }
        for prefix in fallbacks {
            if let Some(blob) = self.backend.fetch_by_prefix(prefix).await? {
                tracing::debug!(primary, prefix = %prefix, matched = %blob.entry.key, "cache prefix match");
                let exact = blob.entry.key == primary;
                return Ok(Some(CacheHit {
                    entry: blob.entry,
                    exact,
                    bytes: blob.bytes,
                }));
            }
        }
        Ok(None)
    }

    /// Resolve and unpack the match into `workspace`
    pub async fn restore(
        &self,
        primary: &str,
        fallbacks: &[String],
        workspace: &Path,
    ) -> Result<Option<CacheHit>, CacheError> {
        let Some(hit) = self.resolve(primary, fallbacks).await? else {
            return Ok(None);
        };
        let files = self.archiver.unpack(workspace, &hit.bytes).await?;
        tracing::info!(key = %hit.entry.key, exact = hit.exact, files, "cache restored");
        Ok(Some(hit))
    }

    /// Pack `paths` from `workspace` and store them under `primary`
    pub async fn save(&self, primary: &str, paths: &[String], workspace: &Path) -> Result<SaveOutcome, CacheError> {
        if self.backend.contains(primary).await? {
            return Ok(SaveOutcome::AlreadyPresent);
        }
        let bytes = self.archiver.pack(workspace, paths).await?;
        self.save_bytes(primary, bytes).await
    }

    /// Store under `primary` unless it exists; concurrent callers for one key
    /// are serialized and only the first stores
    pub async fn save_bytes(&self, primary: &str, bytes: Vec<u8>) -> Result<SaveOutcome, CacheError> {
        if primary.is_empty() {
            return Err(CacheError::InvalidKey(primary.to_string()));
        }
        if self.backend.contains(primary).await? {
            return Ok(SaveOutcome::AlreadyPresent);
        }

        let lock = self.key_lock(primary);
        let _guard = lock.lock().await;
        if self.backend.contains(primary).await? {
            return Ok(SaveOutcome::AlreadyPresent);
        }
        self.backend.store(primary, bytes).await?;
        tracing::info!(key = primary, "cache saved");
        Ok(SaveOutcome::Stored)
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachedBlob, JsonArchiver, MemoryCache};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn prefixes() -> Vec<String> {
        vec!["v1-".to_string(), "v2-".to_string()]
    }

    fn seeded() -> Arc<MemoryCache> {
        let cache = MemoryCache::new();
        cache.insert_at("v1-abc", b"T0".to_vec(), Utc.timestamp_opt(100, 0).unwrap());
        cache.insert_at("v1-xyz", b"T1".to_vec(), Utc.timestamp_opt(200, 0).unwrap());
        cache.insert_at("v2-q", b"T2".to_vec(), Utc.timestamp_opt(300, 0).unwrap());
        Arc::new(cache)
    }

    #[tokio::test]
    async fn test_exact_match_wins_over_fallbacks() {
        let resolver = CacheResolver::new(seeded(), Arc::new(JsonArchiver::new()));
        let hit = resolver.resolve("v1-abc", &prefixes()).await.unwrap().unwrap();
        assert!(hit.exact);
        assert_eq!(hit.entry.key, "v1-abc");
        assert_eq!(hit.bytes, b"T0");
    }

    #[tokio::test]
    async fn test_fallback_picks_most_recent_under_first_prefix() {
        let resolver = CacheResolver::new(seeded(), Arc::new(JsonArchiver::new()));
        let hit = resolver.resolve("v1-missing", &prefixes()).await.unwrap().unwrap();
        assert!(!hit.exact);
        assert_eq!(hit.entry.key, "v1-xyz");

        // v2- is newer but the first prefix with a match decides
        let hit = resolver
            .resolve("v3-missing", &["v9-".to_string(), "v2-".to_string()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.entry.key, "v2-q");

        assert!(resolver.resolve("v3-missing", &["v9-".to_string()]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let resolver = CacheResolver::new(Arc::new(MemoryCache::new()), Arc::new(JsonArchiver::new()));
        assert_eq!(resolver.save_bytes("k", b"first".to_vec()).await.unwrap(), SaveOutcome::Stored);
        assert_eq!(
            resolver.save_bytes("k", b"second".to_vec()).await.unwrap(),
            SaveOutcome::AlreadyPresent
        );
        let hit = resolver.resolve("k", &[]).await.unwrap().unwrap();
        assert_eq!(hit.bytes, b"first");
    }

    /// Backend that counts writes and yields between check and store
    #[derive(Default)]
    struct CountingBackend {
        inner: MemoryCache,
        stores: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CacheBackend for CountingBackend {
        async fn fetch(&self, key: &str) -> Result<Option<CachedBlob>, CacheError> {
            self.inner.fetch(key).await
        }

        async fn fetch_by_prefix(&self, prefix: &str) -> Result<Option<CachedBlob>, CacheError> {
            self.inner.fetch_by_prefix(prefix).await
        }

        async fn store(&self, key: &str, bytes: Vec<u8>) -> Result<(), CacheError> {
            self.stores.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.inner.store(key, bytes).await
        }

        async fn contains(&self, key: &str) -> Result<bool, CacheError> {
            tokio::task::yield_now().await;
            self.inner.contains(key).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_store_once() {
        let backend = Arc::new(CountingBackend::default());
        let resolver = Arc::new(CacheResolver::new(backend.clone(), Arc::new(JsonArchiver::new())));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let resolver = resolver.clone();
            tasks.spawn(async move { resolver.save_bytes("shared", vec![i as u8]).await.unwrap() });
        }
        let mut stored = 0;
        while let Some(outcome) = tasks.join_next().await {
            if outcome.unwrap() == SaveOutcome::Stored {
                stored += 1;
            }
        }
        assert_eq!(stored, 1);
        assert_eq!(backend.stores.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_save_and_restore_paths() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("target")).unwrap();
        std::fs::write(src.path().join("target/app"), "binary").unwrap();

        let resolver = CacheResolver::new(Arc::new(MemoryCache::new()), Arc::new(JsonArchiver::new()));
        let outcome = resolver
            .save("build-1", &["target".to_string()], src.path())
            .await
            .unwrap();
        assert_eq!(outcome, SaveOutcome::Stored);

        let dst = tempfile::tempdir().unwrap();
        let hit = resolver
            .restore("build-2", &["build-".to_string()], dst.path())
            .await
            .unwrap()
            .unwrap();
        assert!(!hit.exact);
        assert_eq!(std::fs::read_to_string(dst.path().join("target/app")).unwrap(), "binary");
    }
}
