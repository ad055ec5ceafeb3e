//! Error taxonomy shared by storage and lock operations.
//!
//! Every fallible SDL operation fails with exactly one of four categories:
//!
//! - **InvalidArgument**: the caller passed a malformed value. Always caller-fixable.
//! - **NotConnected**: the backend connection is down or was closed.
//! - **RejectedByBackend**: the backend understood the request but declined it.
//! - **BackendError**: the backend failed to process a well-formed request.
//!
//! None of these are retried by the storage layer itself. A conditional write whose
//! precondition does not hold is not an error; it is reported through a `false` return.

use thiserror::Error;

/// SDL errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdlError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Rejected by backend: {0}")]
    RejectedByBackend(String),

    #[error("Backend error: {0}")]
    BackendError(String),
}

pub type SdlResult<T> = Result<T, SdlError>;

/// Fieldless view of an [`SdlError`], convenient for matching in callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotConnected,
    RejectedByBackend,
    BackendError,
}

impl SdlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SdlError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            SdlError::NotConnected(_) => ErrorKind::NotConnected,
            SdlError::RejectedByBackend(_) => ErrorKind::RejectedByBackend,
            SdlError::BackendError(_) => ErrorKind::BackendError,
        }
    }

    /// True when the request itself was malformed and retrying it unchanged is pointless.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, SdlError::InvalidArgument(_))
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        SdlError::InvalidArgument(msg.into())
    }

    pub(crate) fn wrong_type(key: &str) -> Self {
        SdlError::RejectedByBackend(format!(
            "WRONGTYPE operation against key {} holding the wrong kind of value",
            key
        ))
    }
}

impl From<sled::Error> for SdlError {
    fn from(e: sled::Error) -> Self {
        SdlError::BackendError(format!("Sled error: {}", e))
    }
}
