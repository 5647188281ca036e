//! Image Storage
//!
//! Byte storage for uploaded document and selfie images. `store` returns an
//! opaque path which is the only handle the core keeps; `fetch` re-reads by it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum ImageStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid image path: {0}")]
    InvalidPath(String),

    #[error("Image not found: {0}")]
    NotFound(String),
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Store image bytes under `key`, return the opaque path
    async fn store(
        &self,
        key: &str,
        content: &[u8],
        content_type: &str,
    ) -> Result<String, ImageStoreError>;

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, ImageStoreError>;

    async fn exists(&self, path: &str) -> Result<bool, ImageStoreError>;
}

/// Storage key for one image of a session
pub fn image_key(session_id: uuid::Uuid, name: &str) -> String {
    format!("verifications/{}/{}", session_id, name)
}

/// Local filesystem implementation
pub struct LocalImageStore {
    base_path: PathBuf,
}

impl LocalImageStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn path_from_ref(&self, path: &str) -> Result<PathBuf, ImageStoreError> {
        let resolved = path
            .strip_prefix("file://")
            .map(PathBuf::from)
            .ok_or_else(|| ImageStoreError::InvalidPath(format!("Expected file:// prefix: {}", path)))?;

        if !resolved.starts_with(&self.base_path) {
            return Err(ImageStoreError::InvalidPath(format!(
                "Path outside image root: {}",
                path
            )));
        }
        Ok(resolved)
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn store(
        &self,
        key: &str,
        content: &[u8],
        _content_type: &str,
    ) -> Result<String, ImageStoreError> {
        if key.split('/').any(|part| part == "..") {
            return Err(ImageStoreError::InvalidPath(key.to_string()));
        }
        let path = self.base_path.join(key);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(&path, content).await?;
        Ok(format!("file://{}", path.display()))
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, ImageStoreError> {
        let resolved = self.path_from_ref(path)?;

        if !tokio::fs::try_exists(&resolved).await? {
            return Err(ImageStoreError::NotFound(path.to_string()));
        }

        Ok(tokio::fs::read(resolved).await?)
    }

    async fn exists(&self, path: &str) -> Result<bool, ImageStoreError> {
        let resolved = self.path_from_ref(path)?;
        Ok(tokio::fs::try_exists(resolved).await?)
    }
}

/// In-memory image store
#[derive(Default, Clone)]
pub struct MemoryImageStore {
    images: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn store(
        &self,
        key: &str,
        content: &[u8],
        _content_type: &str,
    ) -> Result<String, ImageStoreError> {
        let path = format!("memory://{}", key);
        self.images
            .write()
            .await
            .insert(path.clone(), content.to_vec());
        Ok(path)
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, ImageStoreError> {
        self.images
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| ImageStoreError::NotFound(path.to_string()))
    }

    async fn exists(&self, path: &str) -> Result<bool, ImageStoreError> {
        Ok(self.images.read().await.contains_key(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_store_returns_rereadable_path() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalImageStore::new(temp_dir.path());

        let key = image_key(uuid::Uuid::new_v4(), "front.jpg");
        let path = store.store(&key, b"jpeg-bytes", "image/jpeg").await.unwrap();
        assert!(path.starts_with("file://"));
        assert!(store.exists(&path).await.unwrap());
        assert_eq!(store.fetch(&path).await.unwrap(), b"jpeg-bytes");
    }

    #[tokio::test]
    async fn test_local_store_rejects_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalImageStore::new(temp_dir.path());

        let result = store.store("../escape.jpg", b"x", "image/jpeg").await;
        assert!(matches!(result, Err(ImageStoreError::InvalidPath(_))));

        let result = store.fetch("file:///etc/passwd").await;
        assert!(matches!(result, Err(ImageStoreError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_memory_store_not_found() {
        let store = MemoryImageStore::new();
        let result = store.fetch("memory://missing").await;
        assert!(matches!(result, Err(ImageStoreError::NotFound(_))));
    }
}
