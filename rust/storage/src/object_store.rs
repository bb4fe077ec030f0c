use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use librarian_config::Configurable;
use object_store::path::Path;
use object_store::{ObjectStore as ObjectStoreTrait, PutPayload};

use crate::config::ObjectStoreConfig;
use crate::location::{container_index, location_for, ContentId};
use crate::{ContentStream, StorageError};

/// An object listed in a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub container: String,
    pub name: String,
    pub last_modified: DateTime<Utc>,
}

/// Content held in an object store, addressed by
/// [`location_for`](crate::location::location_for). Containers are the
/// first path segment of each object.
#[derive(Clone)]
pub struct ObjectStore {
    object_store: Arc<dyn ObjectStoreTrait>,
}

impl Debug for ObjectStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("object_store", &self.object_store.to_string())
            .finish()
    }
}

impl ObjectStore {
    pub fn new(object_store: Arc<dyn ObjectStoreTrait>) -> Self {
        ObjectStore { object_store }
    }

    pub fn in_memory() -> Self {
        ObjectStore::new(Arc::new(object_store::memory::InMemory::new()))
    }

    fn object_path(container: &str, name: &str) -> Path {
        Path::from(format!("{container}/{name}"))
    }

    fn content_path(content_id: ContentId) -> Path {
        let (container, name) = location_for(content_id);
        Self::object_path(&container, &name)
    }

    /// A HEAD request; "not found" is `Ok(false)`, anything else propagates.
    pub async fn exists(&self, content_id: ContentId) -> Result<bool, StorageError> {
        match self.object_store.head(&Self::content_path(content_id)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn open_stream(
        &self,
        content_id: ContentId,
    ) -> Result<Option<ContentStream>, StorageError> {
        let path = Self::content_path(content_id);
        tracing::debug!("Reading object: {}", path);
        match self.object_store.get(&path).await {
            Ok(result) => Ok(Some(result.into_stream().map_err(StorageError::from).boxed())),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Removes the object for a content id. Returns whether it existed.
    pub async fn remove(&self, content_id: ContentId) -> Result<bool, StorageError> {
        if !self.exists(content_id).await? {
            return Ok(false);
        }
        let (container, name) = location_for(content_id);
        self.delete_object(&container, &name).await
    }

    pub async fn delete_object(&self, container: &str, name: &str) -> Result<bool, StorageError> {
        let path = Self::object_path(container, name);
        match self.object_store.delete(&path).await {
            Ok(()) => {
                tracing::debug!("Deleted object {}", path);
                Ok(true)
            }
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Librarian containers present in the store, in ascending index order.
    pub async fn list_containers(&self) -> Result<Vec<(ContentId, String)>, StorageError> {
        let listing = self.object_store.list_with_delimiter(None).await?;
        let mut containers: Vec<(ContentId, String)> = listing
            .common_prefixes
            .iter()
            .filter_map(|prefix| {
                let name = prefix.as_ref();
                match container_index(name) {
                    Some(index) => Some((index, name.to_string())),
                    None => {
                        tracing::warn!("Ignoring unexpected container {}", name);
                        None
                    }
                }
            })
            .collect();
        containers.sort();
        Ok(containers)
    }

    /// Every object in a container, in the order the store lists them.
    pub async fn list_container(&self, container: &str) -> Result<Vec<StoredObject>, StorageError> {
        let prefix = Path::from(container);
        let container_prefix = format!("{container}/");
        let objects: Vec<object_store::ObjectMeta> =
            self.object_store.list(Some(&prefix)).try_collect().await?;
        Ok(objects
            .into_iter()
            .filter_map(|meta| {
                let name = meta
                    .location
                    .as_ref()
                    .strip_prefix(&container_prefix)?
                    .to_string();
                Some(StoredObject {
                    container: container.to_string(),
                    name,
                    last_modified: meta.last_modified,
                })
            })
            .collect())
    }

    pub async fn put_bytes(&self, content_id: ContentId, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.put_object_bytes(&Self::content_path(content_id), bytes)
            .await
    }

    pub async fn put_object(
        &self,
        container: &str,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), StorageError> {
        self.put_object_bytes(&Self::object_path(container, name), bytes)
            .await
    }

    async fn put_object_bytes(&self, path: &Path, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.object_store
            .put(path, PutPayload::from(bytes))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Configurable<ObjectStoreConfig, StorageError> for ObjectStore {
    async fn try_from_config(config: &ObjectStoreConfig) -> Result<Self, StorageError> {
        match config {
            ObjectStoreConfig::S3(s3_config) => {
                tracing::info!(
                    "Creating S3 object store with bucket: {}",
                    s3_config.bucket
                );
                let mut builder = object_store::aws::AmazonS3Builder::from_env()
                    .with_bucket_name(&s3_config.bucket)
                    .with_region(&s3_config.region)
                    .with_allow_http(s3_config.allow_http);
                if let Some(endpoint) = &s3_config.endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                let object_store = builder.build().map_err(|err| {
                    tracing::error!("Failed to create object store: {:?}", err);
                    StorageError::InvalidStorageConfig(err.to_string())
                })?;
                let object_store = object_store::limit::LimitStore::new(
                    object_store,
                    s3_config.max_concurrent_requests,
                );
                Ok(ObjectStore::new(Arc::new(object_store)))
            }
            ObjectStoreConfig::Memory => {
                tracing::info!("Creating in-memory object store");
                Ok(ObjectStore::in_memory())
            }
        }
    }
}

pub mod test_utils {
    use std::fmt::{Display, Formatter};

    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use futures::StreamExt;
    use object_store::path::Path;
    use object_store::{
        GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore,
        PutMultipartOpts, PutOptions, PutPayload, PutResult,
    };

    /// An object store whose every request fails with a generic error, like
    /// an unreachable or misbehaving backend.
    #[derive(Debug, Default)]
    pub struct FailingObjectStore;

    impl Display for FailingObjectStore {
        fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
            f.write_str("FailingObjectStore")
        }
    }

    fn failure() -> object_store::Error {
        object_store::Error::Generic {
            store: "FailingObjectStore",
            source: "backend unavailable".into(),
        }
    }

    #[async_trait]
    impl ObjectStore for FailingObjectStore {
        async fn put_opts(
            &self,
            _location: &Path,
            _payload: PutPayload,
            _opts: PutOptions,
        ) -> object_store::Result<PutResult> {
            Err(failure())
        }

        async fn put_multipart_opts(
            &self,
            _location: &Path,
            _opts: PutMultipartOpts,
        ) -> object_store::Result<Box<dyn MultipartUpload>> {
            Err(failure())
        }

        async fn get_opts(
            &self,
            _location: &Path,
            _options: GetOptions,
        ) -> object_store::Result<GetResult> {
            Err(failure())
        }

        async fn delete(&self, _location: &Path) -> object_store::Result<()> {
            Err(failure())
        }

        fn list(&self, _prefix: Option<&Path>) -> BoxStream<'static, object_store::Result<ObjectMeta>> {
            futures::stream::once(async { Err(failure()) }).boxed()
        }

        async fn list_with_delimiter(&self, _prefix: Option<&Path>) -> object_store::Result<ListResult> {
            Err(failure())
        }

        async fn copy(&self, _from: &Path, _to: &Path) -> object_store::Result<()> {
            Err(failure())
        }

        async fn copy_if_not_exists(&self, _from: &Path, _to: &Path) -> object_store::Result<()> {
            Err(failure())
        }
    }
}
