//! Shared test double: an in-process "remote" backend with controllable
//! failure and blocking behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use floodgate::{AddAndGetRequest, CounterFilter, LimitKey, StorageError, UsageStorage};
use tokio::sync::Notify;

/// Stand-in for a shared authoritative backend.
///
/// Counts calls, can simulate an outage, and can hold an in-flight
/// `add_and_get` open until the test releases it, to exercise the
/// flush-while-traffic-arrives window.
#[derive(Default)]
pub struct MockBackend {
    counters: Mutex<HashMap<LimitKey, i64>>,
    add_calls: AtomicUsize,
    failing: AtomicBool,
    closed: AtomicBool,
    gate_next: AtomicBool,
    in_gate: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-records traffic as if another process had already reconciled it.
    pub fn seed(&self, key: LimitKey, value: i64) {
        self.counters.lock().unwrap().insert(key, value);
    }

    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn value_of(&self, key: &LimitKey) -> Option<i64> {
        self.counters.lock().unwrap().get(key).copied()
    }

    pub fn stored_len(&self) -> usize {
        self.counters.lock().unwrap().len()
    }

    /// The next `add_and_get` call will block until [`release`] is called.
    ///
    /// [`release`]: MockBackend::release
    pub fn gate_next_call(&self) {
        self.gate_next.store(true, Ordering::SeqCst);
    }

    pub fn is_gated(&self) -> bool {
        self.in_gate.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl UsageStorage for MockBackend {
    async fn add_and_get(
        &self,
        requests: &[AddAndGetRequest],
    ) -> Result<HashMap<LimitKey, i64>, StorageError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            let cause = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "simulated outage");
            return Err(StorageError::Redis(cause.into()));
        }
        if self.gate_next.swap(false, Ordering::SeqCst) {
            self.in_gate.store(true, Ordering::SeqCst);
            self.entered.notify_waiters();
            self.release.notified().await;
            self.in_gate.store(false, Ordering::SeqCst);
        }

        let mut counters = self.counters.lock().unwrap();
        let mut results = HashMap::with_capacity(requests.len());
        for request in requests {
            let key = LimitKey::from_request(request);
            let count = counters.entry(key.clone()).or_insert(0);
            *count += request.cost();
            results.insert(key, *count);
        }
        Ok(results)
    }

    async fn counters(
        &self,
        filter: &CounterFilter,
    ) -> Result<HashMap<LimitKey, i64>, StorageError> {
        Ok(self
            .counters
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| filter.matches(key))
            .map(|(key, value)| (key.clone(), *value))
            .collect())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Lets spawned reconciliation work run to completion on the current-thread
/// test runtime.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}
