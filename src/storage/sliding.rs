//! Sliding-window in-process storage built from small slide buckets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::clock::{Clock, SystemClock};
use crate::counter::CounterCell;
use crate::error::StorageError;
use crate::key::LimitKey;
use crate::request::AddAndGetRequest;
use crate::storage::{CounterFilter, UsageStorage};
use crate::window;

/// In-process sliding-window store.
///
/// Instead of one bucket per window, counters live in fine-grained slide
/// buckets and the reported total is the sum of every slide of the same
/// series inside the rolling horizon `(slide − window_length, slide]`. A
/// smaller slide size gives a smoother window at the cost of more cells and,
/// when wrapped for reconciliation, more synchronization traffic.
///
/// Caller contract: `retention` must be at least the longest window length
/// queried against this store. A shorter retention silently undercounts,
/// because slides that should still contribute have already been dropped.
#[derive(Debug)]
pub struct InMemorySlidingStorage {
    buckets: DashMap<DateTime<Utc>, DashMap<LimitKey, Arc<CounterCell>>>,
    clock: Arc<dyn Clock>,
    retention: Duration,
    slide_size: Duration,
}

impl InMemorySlidingStorage {
    pub fn new(retention: Duration, slide_size: Duration) -> Self {
        Self::with_clock(retention, slide_size, Arc::new(SystemClock))
    }

    pub fn with_clock(retention: Duration, slide_size: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { buckets: DashMap::new(), clock, retention, slide_size }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn slide_size(&self) -> Duration {
        self.slide_size
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Sum of every live slide of `key`'s series inside
    /// `(slide − window_length, slide]`.
    fn series_total(
        &self,
        current_slide: DateTime<Utc>,
        window_length: Duration,
        key: &LimitKey,
    ) -> i64 {
        let oldest = current_slide - window::chrono_duration(window_length);
        self.buckets
            .iter()
            .filter(|bucket| *bucket.key() > oldest)
            .flat_map(|bucket| {
                bucket
                    .value()
                    .iter()
                    .filter(|entry| entry.key().series() == key.series())
                    .map(|entry| entry.value().value())
                    .collect::<Vec<_>>()
            })
            .sum()
    }

    /// Snapshot of every live `(slide_start, key)` pair whose key is marked
    /// distributed.
    pub(crate) fn distributed_keys(&self) -> Vec<(DateTime<Utc>, LimitKey)> {
        self.buckets
            .iter()
            .flat_map(|bucket| {
                let slide_start = *bucket.key();
                bucket
                    .value()
                    .iter()
                    .filter(|entry| entry.key().is_distributed())
                    .map(|entry| (slide_start, entry.key().clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub(crate) fn cell(
        &self,
        slide_start: DateTime<Utc>,
        key: &LimitKey,
    ) -> Option<Arc<CounterCell>> {
        self.buckets
            .get(&slide_start)
            .and_then(|bucket| bucket.get(key).map(|entry| entry.value().clone()))
    }

    /// Drops slides older than the retention horizon.
    fn sweep(&self) {
        let oldest = self.clock.now() - window::chrono_duration(self.retention);
        self.buckets.retain(|slide_start, _| *slide_start >= oldest);
    }
}

#[async_trait]
impl UsageStorage for InMemorySlidingStorage {
    async fn add_and_get(
        &self,
        requests: &[AddAndGetRequest],
    ) -> Result<HashMap<LimitKey, i64>, StorageError> {
        let mut results = HashMap::with_capacity(requests.len());
        for request in requests {
            let slide = window::slide_start(request.event_timestamp(), self.slide_size);
            let key = LimitKey::from_request(request);
            let cell_key = key.clone().with_window_start(slide);
            let bucket = self.buckets.entry(slide).or_default();
            let cell = bucket
                .entry(cell_key.clone())
                .or_insert_with(|| Arc::new(CounterCell::new()))
                .value()
                .clone();
            cell.add(request.cost());
            drop(bucket);

            // Cells live at slide granularity, but results are keyed by the
            // request-derived key so callers can look their answer up.
            let total = self.series_total(slide, request.window_length(), &cell_key);
            results.insert(key, total);
        }
        self.sweep();
        Ok(results)
    }

    /// Reports the raw per-slide cells, not windowed sums; this is the
    /// diagnostic view of what the store actually holds.
    async fn counters(
        &self,
        filter: &CounterFilter,
    ) -> Result<HashMap<LimitKey, i64>, StorageError> {
        self.sweep();
        Ok(self
            .buckets
            .iter()
            .flat_map(|bucket| {
                bucket
                    .value()
                    .iter()
                    .filter(|entry| filter.matches(entry.key()))
                    .map(|entry| (entry.key().clone(), entry.value().value()))
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
