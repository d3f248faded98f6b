// Filesystem cache backend
// One directory per key: entry.json metadata plus data.bin content

use crate::cache::{select_most_recent, CacheBackend, CacheEntry, CacheError, CachedBlob, WriteClock};

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const ENTRY_FILE: &str = "entry.json";
const DATA_FILE: &str = "data.bin";

pub struct FileSystemCache {
    root: PathBuf,
    clock: WriteClock,
}

impl FileSystemCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            clock: WriteClock::default(),
        }
    }

    /// `~/.gantry/cache`, or `.gantry/cache` when there is no home directory
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".gantry")
            .join("cache")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        self.root.join(hex::encode(Sha256::digest(key.as_bytes())))
    }

    async fn read_entry(dir: &Path) -> Result<Option<CacheEntry>, CacheError> {
        match tokio::fs::read(dir.join(ENTRY_FILE)).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn load(&self, entry: CacheEntry) -> Result<CachedBlob, CacheError> {
        let bytes = tokio::fs::read(self.entry_dir(&entry.key).join(DATA_FILE)).await?;
        Ok(CachedBlob { entry, bytes })
    }

    async fn list(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let mut entries = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            match Self::read_entry(&item.path()).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %item.path().display(), error = %e, "skipping unreadable cache entry");
                }
            }
        }
        Ok(entries)
    }
}

#[async_trait::async_trait]
impl CacheBackend for FileSystemCache {
    async fn fetch(&self, key: &str) -> Result<Option<CachedBlob>, CacheError> {
        match Self::read_entry(&self.entry_dir(key)).await? {
            Some(entry) if entry.key == key => Ok(Some(self.load(entry).await?)),
            _ => Ok(None),
        }
    }

    async fn fetch_by_prefix(&self, prefix: &str) -> Result<Option<CachedBlob>, CacheError> {
        let entries = self.list().await?;
        match select_most_recent(&entries, prefix) {
            Some(entry) => Ok(Some(self.load(entry.clone()).await?)),
            None => Ok(None),
        }
    }

    /// Content is staged in a hidden directory and renamed into place; a
    /// concurrent writer that loses the rename keeps the winner's entry
    async fn store(&self, key: &str, bytes: Vec<u8>) -> Result<(), CacheError> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey(key.to_string()));
        }
        let target = self.entry_dir(key);
        if tokio::fs::try_exists(target.join(ENTRY_FILE)).await? {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.root).await?;

        let staging = self.root.join(format!(
            ".staging-{}-{}",
            hex::encode(&Sha256::digest(key.as_bytes())[..8]),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        tokio::fs::create_dir_all(&staging).await?;
        let entry = CacheEntry {
            key: key.to_string(),
            written_at: self.clock.next(),
            size: bytes.len() as u64,
        };
        tokio::fs::write(staging.join(DATA_FILE), &bytes).await?;
        tokio::fs::write(staging.join(ENTRY_FILE), serde_json::to_vec_pretty(&entry)?).await?;

        if let Err(e) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            if tokio::fs::try_exists(target.join(ENTRY_FILE)).await? {
                tracing::debug!(key, "cache entry written concurrently, keeping existing");
                return Ok(());
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool, CacheError> {
        Ok(matches!(Self::read_entry(&self.entry_dir(key)).await?, Some(entry) if entry.key == key))
    }
}
