//! Local-cache-plus-periodic-reconciliation wrappers.
//!
//! Both wrappers answer every `add_and_get` from an in-process cache and
//! never touch the wrapped backend on the request path. A background task
//! periodically drains each distributed counter's accumulated delta to the
//! backend and folds the authoritative response back into the cache.
//!
//! The reconciliation protocol is subtract-then-overwrite: only the amount
//! actually sent is subtracted from the cell's delta, then the backend's
//! total overwrites the cell's total. Increments that arrive during the
//! round-trip stay in the delta and are never lost or double-counted. A
//! failed flush subtracts nothing, so the periodic schedule itself is the
//! retry mechanism; a backend outage spanning many periods means unbounded
//! local delta growth, which is an operational concern, not a handled error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::counter::CounterCell;
use crate::error::StorageError;
use crate::key::LimitKey;
use crate::request::AddAndGetRequest;
use crate::storage::{
    CounterFilter, InMemorySlidingStorage, InMemoryStorage, OverrideKeyRequest, UsageStorage,
};
use crate::window;

/// Fixed-window cache in front of any backend.
///
/// `add_and_get` is served entirely from memory. Counters marked
/// distributed are reconciled with the backend on a fixed period,
/// independent of request traffic.
pub struct AsyncBatchStorage {
    cache: Arc<InMemoryStorage>,
    backend: Arc<dyn UsageStorage>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncBatchStorage {
    /// `sync_period` is the time between reconciliation sweeps. There is no
    /// default: the right period is a deployment decision.
    pub fn builder(backend: Arc<dyn UsageStorage>, sync_period: Duration) -> AsyncBatchStorageBuilder {
        AsyncBatchStorageBuilder {
            backend,
            sync_period,
            first_sync_delay: Duration::ZERO,
            force_cache_init: false,
            cache: None,
        }
    }

    /// The cache's own view, including deltas not yet flushed. Diagnostics
    /// only; `counters` reports the backend's view.
    pub async fn cache_counters(&self) -> Result<HashMap<LimitKey, i64>, StorageError> {
        self.cache.counters(&CounterFilter::all()).await
    }
}

#[async_trait]
impl UsageStorage for AsyncBatchStorage {
    async fn add_and_get(
        &self,
        requests: &[AddAndGetRequest],
    ) -> Result<HashMap<LimitKey, i64>, StorageError> {
        self.cache.add_and_get(requests).await
    }

    async fn counters(
        &self,
        filter: &CounterFilter,
    ) -> Result<HashMap<LimitKey, i64>, StorageError> {
        self.backend.counters(filter).await
    }

    async fn close(&self) -> Result<(), StorageError> {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().expect("task lock poisoned").take();
        if let Some(task) = task {
            // Let an in-flight flush finish; it is not retried afterwards.
            let _ = task.await;
        }
        self.backend.close().await?;
        self.cache.close().await
    }
}

/// Builder for [`AsyncBatchStorage`].
pub struct AsyncBatchStorageBuilder {
    backend: Arc<dyn UsageStorage>,
    sync_period: Duration,
    first_sync_delay: Duration,
    force_cache_init: bool,
    cache: Option<Arc<InMemoryStorage>>,
}

impl AsyncBatchStorageBuilder {
    /// Initial offset before the first reconciliation sweep, measured from
    /// construction.
    pub fn first_sync_delay(mut self, delay: Duration) -> Self {
        self.first_sync_delay = delay;
        self
    }

    /// Seed the cache from the backend's current counters before serving,
    /// so a freshly started process does not under-count traffic already
    /// recorded elsewhere.
    pub fn force_cache_init(mut self, force: bool) -> Self {
        self.force_cache_init = force;
        self
    }

    /// Use a caller-constructed cache, e.g. one with an injected clock.
    pub fn cache(mut self, cache: Arc<InMemoryStorage>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Spawns the reconciliation task; must run inside a tokio runtime.
    pub async fn build(self) -> Result<AsyncBatchStorage, StorageError> {
        let cache = self.cache.unwrap_or_else(|| Arc::new(InMemoryStorage::new()));
        if self.force_cache_init {
            let counters = self.backend.counters(&CounterFilter::all()).await?;
            cache.override_keys(
                counters.into_iter().map(|(key, value)| OverrideKeyRequest::new(key, value)),
            );
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        // Anchor the schedule here, not at the task's first poll, so the
        // first sweep lands first_sync_delay after construction.
        let first_tick = tokio::time::Instant::now() + self.first_sync_delay;
        let task = tokio::spawn(run_fixed(
            cache.clone(),
            self.backend.clone(),
            self.sync_period,
            first_tick,
            shutdown_rx,
        ));
        Ok(AsyncBatchStorage {
            cache,
            backend: self.backend,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }
}

/// Sliding-window cache in front of any backend.
///
/// The cache's slide cells are each reconciled as their own backend bucket
/// (window length = slide size), so every process's slides add up to a
/// shared sliding total.
pub struct AsyncSlidingStorage {
    cache: Arc<InMemorySlidingStorage>,
    backend: Arc<dyn UsageStorage>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncSlidingStorage {
    /// `retention` must cover the longest window queried against this store;
    /// see [`InMemorySlidingStorage`].
    pub fn builder(
        backend: Arc<dyn UsageStorage>,
        sync_period: Duration,
        retention: Duration,
        slide_size: Duration,
    ) -> AsyncSlidingStorageBuilder {
        AsyncSlidingStorageBuilder {
            backend,
            sync_period,
            retention,
            slide_size,
            first_sync_delay: Duration::ZERO,
            cache: None,
        }
    }

    /// The cache's own per-slide view, including unflushed deltas.
    pub async fn cache_counters(&self) -> Result<HashMap<LimitKey, i64>, StorageError> {
        self.cache.counters(&CounterFilter::all()).await
    }
}

#[async_trait]
impl UsageStorage for AsyncSlidingStorage {
    async fn add_and_get(
        &self,
        requests: &[AddAndGetRequest],
    ) -> Result<HashMap<LimitKey, i64>, StorageError> {
        self.cache.add_and_get(requests).await
    }

    async fn counters(
        &self,
        filter: &CounterFilter,
    ) -> Result<HashMap<LimitKey, i64>, StorageError> {
        self.backend.counters(filter).await
    }

    async fn close(&self) -> Result<(), StorageError> {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().expect("task lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.backend.close().await?;
        self.cache.close().await
    }
}

/// Builder for [`AsyncSlidingStorage`].
pub struct AsyncSlidingStorageBuilder {
    backend: Arc<dyn UsageStorage>,
    sync_period: Duration,
    retention: Duration,
    slide_size: Duration,
    first_sync_delay: Duration,
    cache: Option<Arc<InMemorySlidingStorage>>,
}

impl AsyncSlidingStorageBuilder {
    pub fn first_sync_delay(mut self, delay: Duration) -> Self {
        self.first_sync_delay = delay;
        self
    }

    /// Use a caller-constructed cache. Its retention and slide size take
    /// precedence over the builder's.
    pub fn cache(mut self, cache: Arc<InMemorySlidingStorage>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Spawns the reconciliation task; must run inside a tokio runtime.
    pub async fn build(self) -> Result<AsyncSlidingStorage, StorageError> {
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(InMemorySlidingStorage::new(self.retention, self.slide_size)));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let first_tick = tokio::time::Instant::now() + self.first_sync_delay;
        let task = tokio::spawn(run_sliding(
            cache.clone(),
            self.backend.clone(),
            self.sync_period,
            first_tick,
            shutdown_rx,
        ));
        Ok(AsyncSlidingStorage {
            cache,
            backend: self.backend,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }
}

async fn run_fixed(
    cache: Arc<InMemoryStorage>,
    backend: Arc<dyn UsageStorage>,
    sync_period: Duration,
    first_tick: tokio::time::Instant,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticks = tokio::time::interval_at(first_tick, sync_period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticks.tick() => synchronize_fixed(&cache, backend.as_ref()).await,
            _ = shutdown.changed() => return,
        }
    }
}

async fn run_sliding(
    cache: Arc<InMemorySlidingStorage>,
    backend: Arc<dyn UsageStorage>,
    sync_period: Duration,
    first_tick: tokio::time::Instant,
    mut shutdown: watch::Receiver<bool>,
) {
    // Slides older than this are about to be (or already are) evicted
    // locally; reconciling them would race eviction for nothing.
    let stale_after = sync_period + cache.slide_size();
    let mut ticks = tokio::time::interval_at(first_tick, sync_period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticks.tick() => synchronize_sliding(&cache, backend.as_ref(), stale_after).await,
            _ = shutdown.changed() => return,
        }
    }
}

/// One reconciliation sweep over every distributed fixed-window counter.
/// Distinct cells flush in parallel; each cell's subtract-then-overwrite is
/// its own critical section.
async fn synchronize_fixed(cache: &InMemoryStorage, backend: &dyn UsageStorage) {
    let flushes = cache.distributed_keys().into_iter().map(|(window_end, key)| async move {
        let Some(cell) = cache.cell(window_end, &key) else {
            tracing::debug!(?key, "counter evicted before flush, skipping");
            return;
        };
        let flush = FlushTarget {
            key: &key,
            window_length: key.window_length(),
            bucket: key.window_start(),
            cell: &cell,
        };
        flush.reconcile(backend, || cache.cell(window_end, &key)).await;
    });
    futures::future::join_all(flushes).await;
}

/// One reconciliation sweep over every distributed slide cell young enough
/// to still matter. Each slide cell becomes its own backend bucket, keyed at
/// slide granularity.
async fn synchronize_sliding(
    cache: &InMemorySlidingStorage,
    backend: &dyn UsageStorage,
    stale_after: Duration,
) {
    let oldest = cache.now() - window::chrono_duration(stale_after);
    let flushes = cache
        .distributed_keys()
        .into_iter()
        .filter(|(slide_start, _)| *slide_start >= oldest)
        .map(|(slide_start, key)| async move {
            let Some(cell) = cache.cell(slide_start, &key) else {
                tracing::debug!(?key, "slide evicted before flush, skipping");
                return;
            };
            let flush = FlushTarget {
                key: &key,
                window_length: cache.slide_size(),
                bucket: slide_start,
                cell: &cell,
            };
            flush.reconcile(backend, || cache.cell(slide_start, &key)).await;
        });
    futures::future::join_all(flushes).await;
}

struct FlushTarget<'a> {
    key: &'a LimitKey,
    window_length: Duration,
    bucket: DateTime<Utc>,
    cell: &'a Arc<CounterCell>,
}

impl FlushTarget<'_> {
    /// Sends the cell's current delta to the backend, then folds the
    /// response back in. `lookup` re-reads the cache so a cell evicted
    /// during the round-trip is abandoned instead of corrected.
    async fn reconcile(
        &self,
        backend: &dyn UsageStorage,
        lookup: impl Fn() -> Option<Arc<CounterCell>>,
    ) {
        let delta = self.cell.delta();
        let request =
            AddAndGetRequest::builder(self.key.resource(), self.key.limit_name(), self.key.property())
                .window_length(self.window_length)
                .event_timestamp(self.bucket)
                .cost(delta)
                .distributed(true)
                .build();

        match backend.add_and_get(std::slice::from_ref(&request)).await {
            Ok(response) => {
                let still_cached =
                    lookup().map(|current| Arc::ptr_eq(&current, self.cell)).unwrap_or(false);
                if !still_cached {
                    tracing::debug!(key = ?self.key, "counter evicted during flush, abandoning");
                    return;
                }
                self.cell.subtract(delta);
                if let Some(total) = response.get(&LimitKey::from_request(&request)) {
                    self.cell.set_total(*total);
                }
            }
            Err(error) => {
                // Delta left untouched; the next cycle retries it together
                // with any new traffic.
                tracing::warn!(key = ?self.key, error = %error, "flush failed, keeping delta");
            }
        }
    }
}
