//! Filesystem blob store for raw inbound messages.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::BlobError;
use crate::store::traits::BlobStore;

/// Stores each blob as a file under a root directory.
///
/// Keys are relative paths; absolute paths and `..` are rejected.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a blob, creating parent directories.
    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BlobError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!(key, bytes = bytes.len(), "Blob written");
        Ok(())
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(key.to_string()))
            }
            Err(e) => Err(BlobError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        store.put("2026/10/msg-1.eml", b"raw bytes").await.unwrap();
        assert_eq!(store.get("2026/10/msg-1.eml").await.unwrap(), b"raw bytes");
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(matches!(
            store.get("nope.eml").await,
            Err(BlobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        for key in ["../etc/passwd", "/etc/passwd", "a/../../b", ""] {
            assert!(
                matches!(store.get(key).await, Err(BlobError::InvalidKey(_))),
                "{key}"
            );
        }
    }
}
