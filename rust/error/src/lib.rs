// Standard error codes based on the error codes defined in the gRPC spec.
// https://grpc.github.io/grpc/core/md_doc_statuscodes.html
// Custom errors use these codes so that callers can handle them generically.
use std::error::Error;

#[cfg(feature = "sqlx")]
mod sqlx;
#[cfg(feature = "sqlx")]
pub use sqlx::*;

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ErrorCodes {
    // OK is returned on success, we use "Success" since Ok is a keyword in Rust.
    Success = 0,
    // CANCELLED indicates the operation was cancelled (typically by the caller).
    Cancelled = 1,
    // UNKNOWN indicates an unknown error.
    Unknown = 2,
    // INVALID_ARGUMENT indicates client specified an invalid argument.
    InvalidArgument = 3,
    // DEADLINE_EXCEEDED means operation expired before completion.
    DeadlineExceeded = 4,
    // NOT_FOUND means some requested entity (e.g., file or directory) was not found.
    NotFound = 5,
    // ALREADY_EXISTS means an entity that we attempted to create already exists.
    AlreadyExists = 6,
    // PERMISSION_DENIED indicates the caller does not have permission to execute the specified operation.
    PermissionDenied = 7,
    // RESOURCE_EXHAUSTED indicates some resource has been exhausted, such as disk space.
    ResourceExhausted = 8,
    // FAILED_PRECONDITION indicates the system is not in a state required for the operation's execution.
    FailedPrecondition = 9,
    // ABORTED indicates the operation was aborted.
    Aborted = 10,
    // OUT_OF_RANGE means operation was attempted past the valid range.
    OutOfRange = 11,
    // UNIMPLEMENTED indicates operation is not implemented or not supported/enabled.
    Unimplemented = 12,
    // INTERNAL errors are internal errors.
    Internal = 13,
    // UNAVAILABLE indicates service is currently unavailable.
    Unavailable = 14,
    // DATA_LOSS indicates unrecoverable data loss or corruption.
    DataLoss = 15,
}

impl ErrorCodes {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCodes::InvalidArgument => "InvalidArgumentError",
            ErrorCodes::NotFound => "NotFoundError",
            ErrorCodes::FailedPrecondition => "FailedPreconditionError",
            ErrorCodes::Internal => "InternalError",
            ErrorCodes::DataLoss => "DataLossError",
            _ => "LibrarianError",
        }
    }
}

impl From<std::io::ErrorKind> for ErrorCodes {
    fn from(kind: std::io::ErrorKind) -> Self {
        match kind {
            std::io::ErrorKind::NotFound => ErrorCodes::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorCodes::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => ErrorCodes::AlreadyExists,
            std::io::ErrorKind::InvalidInput => ErrorCodes::InvalidArgument,
            std::io::ErrorKind::TimedOut => ErrorCodes::DeadlineExceeded,
            std::io::ErrorKind::Interrupted => ErrorCodes::Aborted,
            _ => ErrorCodes::Internal,
        }
    }
}

pub trait LibrarianError: Error + Send {
    fn code(&self) -> ErrorCodes;
    fn boxed(self) -> Box<dyn LibrarianError>
    where
        Self: Sized + 'static,
    {
        Box::new(self)
    }
    fn should_trace_error(&self) -> bool {
        true
    }
}

impl Error for Box<dyn LibrarianError> {}

impl LibrarianError for Box<dyn LibrarianError> {
    fn code(&self) -> ErrorCodes {
        self.as_ref().code()
    }
}

impl LibrarianError for std::io::Error {
    fn code(&self) -> ErrorCodes {
        self.kind().into()
    }
}
