//! File-system cache collaborator
//!
//! Uploads routed to the file cache are written to a staging file first and
//! promoted to their final path with a rename once complete, so readers
//! never observe a partial file.

use async_trait::async_trait;
use procgate_common::{GatewayError, Result};
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File};
use tracing::debug;

/// Logical-to-physical file cache
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Physical path for a logical name (URI path under the cache)
    fn map_logical_to_physical(&self, logical: &str) -> Option<PathBuf>;

    /// Open a cached file; `None` when it does not exist
    async fn open_cached_file(&self, path: &Path) -> Result<Option<File>>;

    /// Create a staging file for a new entry
    async fn create_staging(&self) -> Result<(PathBuf, File)>;

    /// Atomically move a staged file to its final path
    async fn stage_and_promote(&self, staged: &Path, final_path: &Path) -> Result<()>;
}

/// Cache rooted at one directory, staging under `<root>/.staging`
#[derive(Debug, Clone)]
pub struct DirectoryCache {
    root: PathBuf,
}

impl DirectoryCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(".staging")
    }
}

#[async_trait]
impl CacheStore for DirectoryCache {
    fn map_logical_to_physical(&self, logical: &str) -> Option<PathBuf> {
        let relative = Path::new(logical.trim_start_matches('/'));
        let mut physical = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => physical.push(part),
                Component::CurDir => {}
                // No escaping the root, no absolute or drive-prefixed names
                _ => return None,
            }
        }
        if physical == self.root || physical.starts_with(self.staging_dir()) {
            return None;
        }
        Some(physical)
    }

    async fn open_cached_file(&self, path: &Path) -> Result<Option<File>> {
        match File::open(path).await {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_staging(&self) -> Result<(PathBuf, File)> {
        let dir = self.staging_dir();
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.tmp", uuid::Uuid::new_v4()));
        let file = File::create(&path).await?;
        Ok((path, file))
    }

    async fn stage_and_promote(&self, staged: &Path, final_path: &Path) -> Result<()> {
        if !final_path.starts_with(&self.root) {
            return Err(GatewayError::Internal(format!(
                "cache path {} is outside {}",
                final_path.display(),
                self.root.display()
            )));
        }
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if let Err(e) = fs::rename(staged, final_path).await {
            let _ = fs::remove_file(staged).await;
            return Err(e.into());
        }
        debug!(path = %final_path.display(), "Promoted staged file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_logical_mapping_stays_under_root() {
        let cache = DirectoryCache::new("/var/cache/procgate");
        assert_eq!(
            cache.map_logical_to_physical("/docs/a.pdf"),
            Some(PathBuf::from("/var/cache/procgate/docs/a.pdf"))
        );
        assert_eq!(cache.map_logical_to_physical("../etc/passwd"), None);
        assert_eq!(cache.map_logical_to_physical("docs/../../x"), None);
        assert_eq!(cache.map_logical_to_physical(".staging/x.tmp"), None);
        assert_eq!(cache.map_logical_to_physical("/"), None);
    }

    #[tokio::test]
    async fn test_stage_and_promote() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::new(dir.path());

        let (staged, mut file) = cache.create_staging().await.unwrap();
        file.write_all(b"payload").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        let final_path = cache.map_logical_to_physical("up/1/report.txt").unwrap();
        assert!(cache.open_cached_file(&final_path).await.unwrap().is_none());
        cache.stage_and_promote(&staged, &final_path).await.unwrap();
        assert!(!staged.exists());

        let mut opened = cache.open_cached_file(&final_path).await.unwrap().unwrap();
        let mut content = String::new();
        opened.read_to_string(&mut content).await.unwrap();
        assert_eq!(content, "payload");
    }

    #[tokio::test]
    async fn test_promote_outside_root_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::new(dir.path().join("cache"));
        let (staged, _) = cache.create_staging().await.unwrap();
        let err = cache
            .stage_and_promote(&staged, &dir.path().join("elsewhere"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
    }
}
