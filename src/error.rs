//! Error types for storage backends.

use thiserror::Error;

/// Unified error type for storage operations.
///
/// Local stores never fail; everything here comes from the remote backend or
/// from records it handed back. Reconciliation treats all of these as
/// transient: the affected deltas stay in the cache and the next cycle
/// retries them.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A Redis command or connection failed.
    #[error("redis command failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stored key did not parse back into a counter identity.
    #[error("malformed counter key {key:?}")]
    MalformedKey { key: String },

    /// A stored value was not a counter.
    #[error("malformed counter value {value:?} for key {key:?}")]
    MalformedValue { key: String, value: String },

    /// The store was already closed.
    #[error("storage is closed")]
    Closed,
}
