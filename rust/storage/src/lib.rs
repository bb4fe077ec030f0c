use bytes::Bytes;
use futures::stream::BoxStream;
use librarian_error::{ErrorCodes, LibrarianError};
use thiserror::Error;

pub mod config;
pub mod content;
pub mod local;
pub mod location;
pub mod object_store;

pub use content::{ContentStore, RemovedFrom};
pub use local::LocalStorage;
pub use location::ContentId;
pub use object_store::{ObjectStore, StoredObject};

/// Size of the reads used when streaming content off disk.
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// The bytes of one content record, in order.
pub type ContentStream = BoxStream<'static, Result<Bytes, StorageError>>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {path}")]
    NotFound { path: String },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Object store error: {source}")]
    ObjectStore {
        #[source]
        source: ::object_store::Error,
    },
    #[error("Invalid storage config: {0}")]
    InvalidStorageConfig(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound { path: path.into() },
            _ => StorageError::Io {
                path: path.into(),
                source,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

impl From<::object_store::Error> for StorageError {
    fn from(err: ::object_store::Error) -> Self {
        match err {
            ::object_store::Error::NotFound { path, source: _ } => StorageError::NotFound { path },
            source => StorageError::ObjectStore { source },
        }
    }
}

impl LibrarianError for StorageError {
    fn code(&self) -> ErrorCodes {
        match self {
            StorageError::NotFound { .. } => ErrorCodes::NotFound,
            StorageError::Io { source, .. } => source.code(),
            StorageError::ObjectStore { source } => match source {
                ::object_store::Error::PermissionDenied { .. }
                | ::object_store::Error::Unauthenticated { .. } => ErrorCodes::PermissionDenied,
                _ => ErrorCodes::Internal,
            },
            StorageError::InvalidStorageConfig(_) => ErrorCodes::InvalidArgument,
        }
    }
}
