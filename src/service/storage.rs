//! Storage collaborator for uploaded receipt files.
//!
//! The pipeline only ever sees opaque keys, so any backing store works.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Store bytes, returning a new opaque key
    async fn put(&self, bytes: &[u8]) -> Result<String, StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Remove an object; missing objects are not an error
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Files under a local directory, one per key
pub struct LocalDirStorage {
    root: PathBuf,
}

impl LocalDirStorage {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        // keys are generated uuids; anything else could escape the root
        let id = Uuid::parse_str(key).map_err(|_| StorageError::InvalidKey(key.to_string()))?;
        Ok(self.root.join(id.to_string()))
    }
}

#[async_trait]
impl Storage for LocalDirStorage {
    async fn put(&self, bytes: &[u8]) -> Result<String, StorageError> {
        let key = Uuid::new_v4().to_string();
        let path = self.path_for(&key)?;
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(key = %key, size = bytes.len(), "stored receipt file");
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store for tests and local runs
#[derive(Default)]
pub struct MemoryStorage {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, bytes: &[u8]) -> Result<String, StorageError> {
        let key = Uuid::new_v4().to_string();
        self.objects.insert(key.clone(), bytes.to_vec());
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_storage_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalDirStorage::new(dir.path().join("receipts")).await.unwrap();

        let key = storage.put(b"receipt bytes").await.unwrap();
        assert_eq!(storage.get(&key).await.unwrap(), b"receipt bytes");

        storage.delete(&key).await.unwrap();
        assert!(matches!(storage.get(&key).await, Err(StorageError::NotFound(_))));
        // deleting twice is fine
        storage.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_storage_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalDirStorage::new(dir.path()).await.unwrap();
        assert!(matches!(
            storage.get("../etc/passwd").await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_storage() {
        let storage = MemoryStorage::new();
        let key = storage.put(b"abc").await.unwrap();
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.get(&key).await.unwrap(), b"abc");
        storage.delete(&key).await.unwrap();
        assert!(storage.is_empty());
    }
}
