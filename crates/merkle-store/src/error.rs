//! Store error types.

use thiserror::Error;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by a [`NodeStore`](crate::NodeStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying medium failed to read or write.
    #[error("store i/o failure: {0}")]
    Io(String),
}
