//! Counter storage backends.
//!
//! Everything consumes one contract, [`UsageStorage`]:
//! - [`memory::InMemoryStorage`]: fixed windows, in-process.
//! - [`sliding::InMemorySlidingStorage`]: sliding windows built from small
//!   slide buckets, in-process.
//! - [`redis::RedisStorage`]: the shared authoritative backend, with an
//!   atomic carry-over script approximating a sliding window in O(1) state.
//! - [`async_batch::AsyncBatchStorage`] / [`async_batch::AsyncSlidingStorage`]:
//!   a local cache in front of any backend, reconciled by a periodic task so
//!   callers never wait on the network.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::key::LimitKey;
use crate::request::AddAndGetRequest;
use crate::window;

pub mod async_batch;
pub mod memory;
pub mod redis;
pub mod sliding;

pub use self::async_batch::{AsyncBatchStorage, AsyncSlidingStorage};
pub use self::memory::InMemoryStorage;
pub use self::redis::RedisStorage;
pub use self::sliding::InMemorySlidingStorage;

/// The storage contract every backend implements.
#[async_trait]
pub trait UsageStorage: Send + Sync {
    /// Atomically adds each request's cost to the counter its key identifies
    /// and returns the post-increment total per key.
    ///
    /// Atomic per request: no increment is lost under concurrent callers.
    /// Batch members are applied independently; there is no cross-key
    /// transaction.
    async fn add_and_get(
        &self,
        requests: &[AddAndGetRequest],
    ) -> Result<HashMap<LimitKey, i64>, StorageError>;

    /// Point-in-time snapshot of live counters, optionally filtered.
    /// Already-evicted buckets are never reported.
    async fn counters(
        &self,
        filter: &CounterFilter,
    ) -> Result<HashMap<LimitKey, i64>, StorageError>;

    /// Releases background resources. Not idempotent.
    async fn close(&self) -> Result<(), StorageError>;

    /// Single-request convenience over [`add_and_get`](Self::add_and_get).
    async fn add_and_get_one(
        &self,
        request: AddAndGetRequest,
    ) -> Result<(LimitKey, i64), StorageError> {
        let key = LimitKey::from_request(&request);
        let mut results = self.add_and_get(std::slice::from_ref(&request)).await?;
        let count = results.remove(&key).unwrap_or(0);
        Ok((key, count))
    }
}

/// Prefix filter over the identifying fields of a [`LimitKey`].
///
/// Filters narrow in order: resource, then limit name, then property. A
/// field left unset matches everything from that point on.
#[derive(Debug, Clone, Default)]
pub struct CounterFilter {
    resource: Option<String>,
    limit_name: Option<String>,
    property: Option<String>,
}

impl CounterFilter {
    /// Matches every counter.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn resource(resource: impl Into<String>) -> Self {
        Self { resource: Some(resource.into()), ..Self::default() }
    }

    pub fn limit_name(mut self, limit_name: impl Into<String>) -> Self {
        self.limit_name = Some(limit_name.into());
        self
    }

    pub fn property(mut self, property: impl Into<String>) -> Self {
        self.property = Some(property.into());
        self
    }

    pub fn matches(&self, key: &LimitKey) -> bool {
        self.resource.as_deref().is_none_or(|r| r == key.resource())
            && self.limit_name.as_deref().is_none_or(|l| l == key.limit_name())
            && self.property.as_deref().is_none_or(|p| p == key.property())
    }

    /// Identifying segments present in the filter, in key order, stopping at
    /// the first unset field. Used to build remote scan patterns.
    pub(crate) fn prefix_segments(&self) -> Vec<&str> {
        let mut segments = Vec::new();
        for segment in [&self.resource, &self.limit_name, &self.property] {
            match segment {
                Some(value) => segments.push(value.as_str()),
                None => break,
            }
        }
        segments
    }
}

/// Overwrites one cached counter's authoritative total, e.g. when seeding a
/// fresh cache from a backend snapshot.
#[derive(Debug, Clone)]
pub struct OverrideKeyRequest {
    limit_key: LimitKey,
    expiration: DateTime<Utc>,
    value: i64,
}

impl OverrideKeyRequest {
    /// Expiry defaults to the end of the key's own window.
    pub fn new(limit_key: LimitKey, value: i64) -> Self {
        let expiration = window::window_end(limit_key.window_start(), limit_key.window_length());
        Self { limit_key, expiration, value }
    }

    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn limit_key(&self) -> &LimitKey {
        &self.limit_key
    }

    pub fn expiration(&self) -> DateTime<Utc> {
        self.expiration
    }

    pub fn value(&self) -> i64 {
        self.value
    }
}
