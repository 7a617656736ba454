//! Fixed-window in-process storage.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::clock::{Clock, SystemClock};
use crate::counter::CounterCell;
use crate::error::StorageError;
use crate::key::LimitKey;
use crate::request::AddAndGetRequest;
use crate::storage::{CounterFilter, OverrideKeyRequest, UsageStorage};
use crate::window;

/// In-process fixed-window store: a two-level concurrent map of
/// `window_end → limit key → counter cell`.
///
/// Counters do not survive the process and are not shared across instances,
/// so on its own this is only suitable for purely local limits. It doubles
/// as the cache inside [`AsyncBatchStorage`].
///
/// Expired buckets are swept lazily after every mutating call; there is no
/// timer.
///
/// [`AsyncBatchStorage`]: crate::storage::AsyncBatchStorage
#[derive(Debug)]
pub struct InMemoryStorage {
    buckets: DashMap<DateTime<Utc>, DashMap<LimitKey, Arc<CounterCell>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { buckets: DashMap::new(), clock }
    }

    /// Overwrites the authoritative `total` of each addressed counter,
    /// creating the cell when absent.
    ///
    /// Only `total` is touched; deltas being written by concurrent callers
    /// are preserved.
    pub fn override_keys(&self, overrides: impl IntoIterator<Item = OverrideKeyRequest>) {
        for request in overrides {
            let bucket = self.buckets.entry(request.expiration()).or_default();
            let cell = bucket
                .entry(request.limit_key().clone())
                .or_insert_with(|| Arc::new(CounterCell::new()))
                .value()
                .clone();
            cell.set_total(request.value());
        }
        self.sweep();
    }

    /// Snapshot of every live `(window_end, key)` pair whose key is marked
    /// distributed. Reconciliation iterates this without holding map locks.
    pub(crate) fn distributed_keys(&self) -> Vec<(DateTime<Utc>, LimitKey)> {
        self.buckets
            .iter()
            .flat_map(|bucket| {
                let window_end = *bucket.key();
                bucket
                    .value()
                    .iter()
                    .filter(|entry| entry.key().is_distributed())
                    .map(|entry| (window_end, entry.key().clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub(crate) fn cell(&self, window_end: DateTime<Utc>, key: &LimitKey) -> Option<Arc<CounterCell>> {
        self.buckets
            .get(&window_end)
            .and_then(|bucket| bucket.get(key).map(|entry| entry.value().clone()))
    }

    /// Drops every bucket whose window end is no longer in the future.
    fn sweep(&self) {
        let now = self.clock.now();
        self.buckets.retain(|window_end, _| *window_end > now);
    }

    fn snapshot(&self, filter: &CounterFilter) -> HashMap<LimitKey, i64> {
        self.sweep();
        self.buckets
            .iter()
            .flat_map(|bucket| {
                bucket
                    .value()
                    .iter()
                    .filter(|entry| filter.matches(entry.key()))
                    .map(|entry| (entry.key().clone(), entry.value().value()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsageStorage for InMemoryStorage {
    async fn add_and_get(
        &self,
        requests: &[AddAndGetRequest],
    ) -> Result<HashMap<LimitKey, i64>, StorageError> {
        let mut results = HashMap::with_capacity(requests.len());
        for request in requests {
            let window_end = window::window_end(request.event_timestamp(), request.window_length());
            let key = LimitKey::from_request(request);
            let bucket = self.buckets.entry(window_end).or_default();
            let cell = bucket
                .entry(key.clone())
                .or_insert_with(|| Arc::new(CounterCell::new()))
                .value()
                .clone();
            results.insert(key, cell.add(request.cost()));
        }
        self.sweep();
        Ok(results)
    }

    async fn counters(
        &self,
        filter: &CounterFilter,
    ) -> Result<HashMap<LimitKey, i64>, StorageError> {
        Ok(self.snapshot(filter))
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
