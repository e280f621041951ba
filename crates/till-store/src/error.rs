//! Storage error types.

use thiserror::Error;

/// Errors from the storage kernel and repositories.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Could not take a row lock within the configured wait. The whole
    /// transaction should be abandoned and the operation retried.
    #[error("Timed out waiting for lock on {table}:{key}")]
    LockTimeout { table: &'static str, key: String },

    /// Unique constraint violated.
    #[error("Duplicate key in {table}: {key}")]
    DuplicateKey { table: &'static str, key: String },

    /// Row not found where one was required.
    #[error("Not found in {table}: {key}")]
    NotFound { table: &'static str, key: String },

    /// Record rejected by write-time validation.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// A lock-protected write was attempted without holding the row
    /// lock. Always a programming error in the calling code.
    #[error("Write to {table}:{key} without holding its lock")]
    LockNotHeld { table: &'static str, key: String },

    /// The store's internal state was poisoned by a panic elsewhere.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}
