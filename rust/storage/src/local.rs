use crate::config::StorageConfig;
use crate::location::{relative_path_for, ContentId};
use crate::{ContentStream, StorageError, STREAM_CHUNK_SIZE};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use librarian_config::Configurable;
use std::path::{Path, PathBuf};
use tokio_util::io::ReaderStream;

/// Content stored in a directory tree under `root`, one file per content id.
#[derive(Clone, Debug)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> LocalStorage {
        LocalStorage { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, content_id: ContentId) -> PathBuf {
        self.root.join(relative_path_for(content_id))
    }

    pub async fn exists(&self, content_id: ContentId) -> Result<bool, StorageError> {
        let path = self.path_for(content_id);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|err| StorageError::io(path.display().to_string(), err))
    }

    /// Opens the content for streaming. Absent content is `Ok(None)`.
    pub async fn open_stream(
        &self,
        content_id: ContentId,
    ) -> Result<Option<ContentStream>, StorageError> {
        let path = self.path_for(content_id);
        tracing::debug!("Reading from path: {}", path.display());
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StorageError::io(path.display().to_string(), err)),
        };
        let display = path.display().to_string();
        Ok(Some(
            ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE)
                .map_err(move |err| StorageError::io(display.clone(), err))
                .boxed(),
        ))
    }

    /// Removes the file for a content id. Returns whether a file was removed;
    /// a file that is already gone is not an error.
    pub async fn remove(&self, content_id: ContentId) -> Result<bool, StorageError> {
        self.remove_path(&self.path_for(content_id)).await
    }

    pub async fn remove_path(&self, path: &Path) -> Result<bool, StorageError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                tracing::debug!("Removed {}", path.display());
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::io(path.display().to_string(), err)),
        }
    }

    pub async fn put_bytes(&self, content_id: ContentId, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(content_id);
        tracing::debug!("Writing to path: {}", path.display());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::io(parent.display().to_string(), err))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|err| StorageError::io(path.display().to_string(), err))
    }
}

#[async_trait]
impl Configurable<StorageConfig, StorageError> for LocalStorage {
    async fn try_from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        if config.root.is_empty() {
            return Err(StorageError::InvalidStorageConfig(
                "storage root must not be empty".to_string(),
            ));
        }
        Ok(LocalStorage::new(&config.root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn read_all(mut stream: ContentStream) -> Vec<u8> {
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk.unwrap());
        }
        buf
    }

    #[tokio::test]
    async fn test_put_open_remove() {
        let tmp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp_dir.path());
        storage.put_bytes(0x1234, b"librarian").await.unwrap();

        assert!(tmp_dir.path().join("00/00/12/00001234").is_file());
        assert!(storage.exists(0x1234).await.unwrap());
        let stream = storage.open_stream(0x1234).await.unwrap().unwrap();
        assert_eq!(read_all(stream).await, b"librarian");

        assert!(storage.remove(0x1234).await.unwrap());
        assert!(!storage.exists(0x1234).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_content_is_not_an_error() {
        let tmp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp_dir.path());
        assert!(storage.open_stream(7).await.unwrap().is_none());
        assert!(!storage.remove(7).await.unwrap());
        assert!(!storage.exists(7).await.unwrap());
    }

    #[tokio::test]
    async fn test_large_content_streams_in_chunks() {
        let tmp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp_dir.path());
        let bytes = vec![7u8; STREAM_CHUNK_SIZE * 2 + 10];
        storage.put_bytes(9, &bytes).await.unwrap();
        let mut stream = storage.open_stream(9).await.unwrap().unwrap();
        let mut chunks = 0;
        let mut total = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            assert!(chunk.len() <= STREAM_CHUNK_SIZE);
            total += chunk.len();
            chunks += 1;
        }
        assert_eq!(total, bytes.len());
        assert!(chunks >= 3);
    }

    #[tokio::test]
    async fn test_filesystem_errors_propagate() {
        let tmp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp_dir.path());

        // A directory where the content file should be.
        std::fs::create_dir_all(storage.path_for(0x0101)).unwrap();
        let err = storage.remove(0x0101).await.unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }), "{err}");
        assert!(storage.path_for(0x0101).is_dir());

        // A file where a directory level should be.
        std::fs::create_dir_all(tmp_dir.path().join("00/00")).unwrap();
        std::fs::write(tmp_dir.path().join("00/00/02"), b"not a directory").unwrap();
        let err = storage.remove(0x0201).await.unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }), "{err}");
        assert!(!err.is_not_found());
        assert!(storage.open_stream(0x0201).await.is_err());
    }
}
