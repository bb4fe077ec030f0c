use std::path::PathBuf;

use futures::StreamExt;
use sha1::{Digest, Sha1};

use crate::location::ContentId;
use crate::{ContentStream, LocalStorage, ObjectStore, StorageError};

/// Which backends held the bytes that [`ContentStore::remove`] deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovedFrom {
    pub disk: bool,
    pub remote: bool,
}

impl RemovedFrom {
    pub fn any(&self) -> bool {
        self.disk || self.remote
    }
}

/// The bytes of content records, wherever they live. Disk is always
/// consulted; the object store only when it is enabled.
#[derive(Debug, Clone)]
pub struct ContentStore {
    local: LocalStorage,
    remote: Option<ObjectStore>,
}

impl ContentStore {
    pub fn new(local: LocalStorage, remote: Option<ObjectStore>) -> Self {
        ContentStore { local, remote }
    }

    pub fn local(&self) -> &LocalStorage {
        &self.local
    }

    pub fn remote(&self) -> Option<&ObjectStore> {
        self.remote.as_ref()
    }

    pub fn path_for(&self, content_id: ContentId) -> PathBuf {
        self.local.path_for(content_id)
    }

    pub async fn exists(&self, content_id: ContentId) -> Result<bool, StorageError> {
        if self.local.exists(content_id).await? {
            return Ok(true);
        }
        match &self.remote {
            Some(remote) => remote.exists(content_id).await,
            None => Ok(false),
        }
    }

    /// Opens the bytes for reading, preferring the object store.
    pub async fn open_stream(
        &self,
        content_id: ContentId,
    ) -> Result<Option<ContentStream>, StorageError> {
        if let Some(remote) = &self.remote {
            if let Some(stream) = remote.open_stream(content_id).await? {
                return Ok(Some(stream));
            }
        }
        self.local.open_stream(content_id).await
    }

    /// SHA-1 hex digest and length of the stored bytes.
    pub async fn hash_and_length(&self, content_id: ContentId) -> Result<(String, u64), StorageError> {
        let Some(mut stream) = self.open_stream(content_id).await? else {
            return Err(StorageError::NotFound {
                path: self.path_for(content_id).display().to_string(),
            });
        };
        let mut hasher = Sha1::new();
        let mut length = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            length += chunk.len() as u64;
            hasher.update(&chunk);
        }
        Ok((format!("{:x}", hasher.finalize()), length))
    }

    /// Removes the bytes from every enabled backend.
    pub async fn remove(&self, content_id: ContentId) -> Result<RemovedFrom, StorageError> {
        let disk = self.local.remove(content_id).await?;
        let remote = match &self.remote {
            Some(remote) => remote.remove(content_id).await?,
            None => false,
        };
        Ok(RemovedFrom { disk, remote })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA1: &str = "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d";

    #[tokio::test]
    async fn test_hash_and_length_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(LocalStorage::new(dir.path()), None);
        store.local().put_bytes(3, b"hello").await.unwrap();

        let (sha1, length) = store.hash_and_length(3).await.unwrap();
        assert_eq!(sha1, HELLO_SHA1);
        assert_eq!(length, 5);
    }

    #[tokio::test]
    async fn test_hash_of_missing_content_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(LocalStorage::new(dir.path()), Some(ObjectStore::in_memory()));
        let err = store.hash_and_length(3).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_remote_copy_is_preferred_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let remote = ObjectStore::in_memory();
        let store = ContentStore::new(LocalStorage::new(dir.path()), Some(remote.clone()));
        remote.put_bytes(9, b"hello".to_vec()).await.unwrap();

        assert!(store.exists(9).await.unwrap());
        assert_eq!(store.hash_and_length(9).await.unwrap().0, HELLO_SHA1);

        let removed = store.remove(9).await.unwrap();
        assert_eq!(
            removed,
            RemovedFrom {
                disk: false,
                remote: true
            }
        );
        assert!(!store.exists(9).await.unwrap());
        assert!(!store.remove(9).await.unwrap().any());
    }
}
