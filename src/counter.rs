//! The atomic `(delta, total)` pair backing every tracked counter.

use std::sync::atomic::{AtomicI64, Ordering};

/// One counter's locally-accumulated increments plus its last known
/// authoritative value.
///
/// `delta` holds traffic not yet flushed to a distributed backend; `total` is
/// the backend's last reported count. The current count as seen by this
/// process is always `delta + total`.
///
/// `total` is written only by the reconciliation path ([`set_total`]) and the
/// explicit key-override path; `delta` is written only by new traffic
/// ([`add`]) and by subtracting the exact amount just flushed ([`subtract`]).
/// Keeping the two writers on disjoint fields is what makes reconciliation
/// safe without a per-cell lock.
///
/// [`set_total`]: CounterCell::set_total
/// [`add`]: CounterCell::add
/// [`subtract`]: CounterCell::subtract
#[derive(Debug, Default)]
pub struct CounterCell {
    delta: AtomicI64,
    total: AtomicI64,
}

impl CounterCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cell seeded with an authoritative total and no pending delta.
    pub fn with_total(total: i64) -> Self {
        Self { delta: AtomicI64::new(0), total: AtomicI64::new(total) }
    }

    /// Adds `cost` to the pending delta and returns the post-increment value.
    pub fn add(&self, cost: i64) -> i64 {
        self.delta.fetch_add(cost, Ordering::SeqCst) + cost + self.total.load(Ordering::SeqCst)
    }

    /// Removes an amount known to have been flushed to the backend.
    ///
    /// Increments that raced with the flush stay in `delta` and are not
    /// double-counted, because only the flushed amount is removed.
    pub fn subtract(&self, cost: i64) {
        self.delta.fetch_sub(cost, Ordering::SeqCst);
    }

    /// Current count from this process's point of view.
    pub fn value(&self) -> i64 {
        self.delta.load(Ordering::SeqCst) + self.total.load(Ordering::SeqCst)
    }

    /// Pending, not-yet-flushed increments.
    pub fn delta(&self) -> i64 {
        self.delta.load(Ordering::SeqCst)
    }

    /// Overwrites the authoritative total with a reconciliation response.
    pub fn set_total(&self, total: i64) {
        self.total.store(total, Ordering::SeqCst);
    }
}
