//! Local-directory object-store backend (`vfs:///abs/path`).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;
use url::Url;

use crate::error::{Result, StorageError};
use super::ObjectStoreBackend;

/// URL scheme of the backend.
pub const SCHEME: &str = "vfs";

/// Stores objects as plain files under a base directory.
#[derive(Debug, Clone)]
pub struct VfsBackend {
    base: PathBuf,
}

impl VfsBackend {
    /// Open the backend addressed by `url`; the path must be absolute.
    pub fn open(url: &Url) -> Result<Self> {
        let path = url.path();
        if path.is_empty() || !path.starts_with('/') {
            return Err(StorageError::InvalidArgument(format!(
                "vfs destination must be an absolute path: {}",
                url
            )));
        }
        Ok(Self {
            base: PathBuf::from(path),
        })
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.base.join(key.trim_start_matches('/'))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStoreBackend for VfsBackend {
    fn kind(&self) -> &str {
        SCHEME
    }

    async fn exists(&self, key: &str) -> bool {
        fs::metadata(self.resolve(key)).await.is_ok()
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key);
        fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(format!("object {}", path.display()))
            } else {
                e.into()
            }
        })
    }

    async fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(key);
        Self::ensure_parent(&path).await?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn upload(&self, src: &Path, key: &str) -> Result<()> {
        let path = self.resolve(key);
        Self::ensure_parent(&path).await?;
        debug!(src = %src.display(), dst = %path.display(), "Uploading object");
        fs::copy(src, &path).await?;
        Ok(())
    }

    async fn download(&self, key: &str, dst: &Path) -> Result<()> {
        let path = self.resolve(key);
        if fs::metadata(&path).await.is_err() {
            return Err(StorageError::NotFound(format!("object {}", path.display())));
        }
        debug!(src = %path.display(), dst = %dst.display(), "Downloading object");
        fs::copy(&path, dst).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.resolve(key);
        let result = match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path).await,
            Ok(_) => fs::remove_file(&path).await,
            Err(_) => return Ok(()),
        };
        result.map_err(Into::into)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.resolve(prefix);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
