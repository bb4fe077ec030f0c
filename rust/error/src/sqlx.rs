use crate::{ErrorCodes, LibrarianError};
use thiserror::Error;

/// Wraps `sqlx::Error` so that database failures carry an error code.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct WrappedSqlxError(#[from] pub sqlx::Error);

impl LibrarianError for WrappedSqlxError {
    fn code(&self) -> ErrorCodes {
        match &self.0 {
            sqlx::Error::RowNotFound => ErrorCodes::NotFound,
            sqlx::Error::PoolTimedOut => ErrorCodes::Unavailable,
            sqlx::Error::Io(err) => err.kind().into(),
            _ => ErrorCodes::Internal,
        }
    }
}

