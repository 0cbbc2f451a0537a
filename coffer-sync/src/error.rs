//! Error types for the sync crate.
//!
//! The sync loop never throws per-payload problems: decrypt failures and
//! missing keys are contained upstream as error-marked payloads. What
//! escapes `sync()` is session-level: auth, transport, storage.

use std::fmt;

/// Failure from the HTTP collaborator.
#[derive(Debug)]
pub enum ApiError {
    /// Server 401. Surfaced as the `InvalidSession` event.
    Unauthorized,
    /// Could not reach the server.
    Transport(String),
    /// Any non-auth HTTP failure.
    Server { status: u16, message: String },
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "invalid session (401)"),
            Self::Transport(msg) => write!(f, "transport failure: {}", msg),
            Self::Server { status, message } => write!(f, "server error {}: {}", status, message),
        }
    }
}

impl std::error::Error for ApiError {}

/// Failure from the persistent store collaborator.
#[derive(Debug)]
pub struct StorageError(pub String);

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "storage error: {}", self.0)
    }
}

impl std::error::Error for StorageError {}

/// What `sync()` can return.
#[derive(Debug)]
pub enum SyncError {
    /// Server rejected the session; sync suspends until re-auth.
    AuthFailure,
    /// Transport or server failure; the round is abandoned, a fresh
    /// `sync()` may retry.
    Api(ApiError),
    Storage(StorageError),
    /// A malformed server record that could not even be shaped into a
    /// payload (distinct from contained decrypt failures).
    MalformedResponse(String),
    /// A protocol-layer failure outside the contained decrypt paths
    /// (e.g. encrypting for upload).
    Protocol(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthFailure => write!(f, "authentication failure"),
            Self::Api(e) => write!(f, "{}", e),
            Self::Storage(e) => write!(f, "{}", e),
            Self::MalformedResponse(msg) => write!(f, "malformed response: {}", msg),
            Self::Protocol(msg) => write!(f, "protocol failure: {}", msg),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ApiError> for SyncError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Unauthorized => Self::AuthFailure,
            other => Self::Api(other),
        }
    }
}

impl From<StorageError> for SyncError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}
