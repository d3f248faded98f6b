// Cache archives
// Packs declared workspace paths into a single blob and restores them

use crate::cache::CacheError;

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Converts a set of workspace-relative paths to bytes and back
#[async_trait::async_trait]
pub trait CacheArchiver: Send + Sync {
    async fn pack(&self, root: &Path, paths: &[String]) -> Result<Vec<u8>, CacheError>;

    /// Returns the number of files written
    async fn unpack(&self, root: &Path, bytes: &[u8]) -> Result<usize, CacheError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ArchivedFile {
    path: String,
    contents: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Archive {
    files: Vec<ArchivedFile>,
}

/// JSON archive with hex-encoded file contents. Missing paths are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonArchiver;

impl JsonArchiver {
    pub fn new() -> Self {
        Self
    }
}

/// Rejects absolute paths and anything that climbs out of the workspace
pub(crate) fn checked_relative(path: &str) -> Result<PathBuf, CacheError> {
    let candidate = Path::new(path);
    let safe = !path.is_empty()
        && candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if safe {
        Ok(candidate.to_path_buf())
    } else {
        Err(CacheError::UnsafePath(candidate.to_path_buf()))
    }
}

pub(crate) fn collect_files(root: &Path, relative: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let full = root.join(relative);
    let meta = match std::fs::metadata(&full) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        let mut children: Vec<_> = std::fs::read_dir(&full)?
            .filter_map(|entry| entry.ok().map(|e| e.file_name()))
            .collect();
        children.sort();
        for child in children {
            collect_files(root, &relative.join(child), out)?;
        }
    } else {
        out.push(relative.to_path_buf());
    }
    Ok(())
}

fn archive_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait::async_trait]
impl CacheArchiver for JsonArchiver {
    async fn pack(&self, root: &Path, paths: &[String]) -> Result<Vec<u8>, CacheError> {
        let mut relative = Vec::new();
        for path in paths {
            let checked = checked_relative(path)?;
            collect_files(root, &checked, &mut relative)?;
        }
        relative.sort();
        relative.dedup();

        let mut archive = Archive::default();
        for path in relative {
            let contents = tokio::fs::read(root.join(&path)).await?;
            archive.files.push(ArchivedFile {
                path: archive_path(&path),
                contents: hex::encode(contents),
            });
        }
        Ok(serde_json::to_vec(&archive)?)
    }

    async fn unpack(&self, root: &Path, bytes: &[u8]) -> Result<usize, CacheError> {
        let archive: Archive = serde_json::from_slice(bytes)?;
        for file in &archive.files {
            let relative = checked_relative(&file.path)?;
            let contents = hex::decode(&file.contents)
                .map_err(|e| CacheError::CorruptArchive(format!("{}: {}", file.path, e)))?;
            let target = root.join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, contents).await?;
        }
        Ok(archive.files.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_relative() {
        assert!(checked_relative("target/debug").is_ok());
        assert!(checked_relative("./node_modules").is_ok());
        assert!(matches!(checked_relative("../secrets"), Err(CacheError::UnsafePath(_))));
        assert!(matches!(checked_relative("/etc/passwd"), Err(CacheError::UnsafePath(_))));
        assert!(checked_relative("").is_err());
    }

    #[tokio::test]
    async fn test_pack_directory_and_restore_elsewhere() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("deps/nested")).unwrap();
        std::fs::write(src.path().join("deps/a.txt"), "alpha").unwrap();
        std::fs::write(src.path().join("deps/nested/b.bin"), [0u8, 159, 255]).unwrap();
        std::fs::write(src.path().join("lock.json"), "{}").unwrap();

        let archiver = JsonArchiver::new();
        let bytes = archiver
            .pack(src.path(), &["deps".to_string(), "lock.json".to_string(), "missing".to_string()])
            .await
            .unwrap();

        let dst = tempfile::tempdir().unwrap();
        let written = archiver.unpack(dst.path(), &bytes).await.unwrap();
        assert_eq!(written, 3);
        assert_eq!(std::fs::read_to_string(dst.path().join("deps/a.txt")).unwrap(), "alpha");
        assert_eq!(std::fs::read(dst.path().join("deps/nested/b.bin")).unwrap(), vec![0u8, 159, 255]);
        assert_eq!(std::fs::read_to_string(dst.path().join("lock.json")).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_unpack_rejects_escaping_paths() {
        let dst = tempfile::tempdir().unwrap();
        let bytes = br#"{"files":[{"path":"../evil","contents":"00"}]}"#;
        let err = JsonArchiver::new().unpack(dst.path(), bytes).await.unwrap_err();
        assert!(matches!(err, CacheError::UnsafePath(_)));
    }

    #[tokio::test]
    async fn test_unpack_rejects_bad_hex() {
        let dst = tempfile::tempdir().unwrap();
        let bytes = br#"{"files":[{"path":"x","contents":"zz"}]}"#;
        let err = JsonArchiver::new().unpack(dst.path(), bytes).await.unwrap_err();
        assert!(matches!(err, CacheError::CorruptArchive(_)));
    }
}
