//! Global atomic counters for Dockhand observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (the daemons do this once per tick).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations and no locking.
pub struct Metrics {
    runs_claimed: AtomicU64,
    runs_succeeded: AtomicU64,
    runs_failed: AtomicU64,
    runs_needs_review: AtomicU64,
    approvals_created: AtomicU64,
    schedules_fired: AtomicU64,
    items_reaped: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            runs_claimed: AtomicU64::new(0),
            runs_succeeded: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            runs_needs_review: AtomicU64::new(0),
            approvals_created: AtomicU64::new(0),
            schedules_fired: AtomicU64::new(0),
            items_reaped: AtomicU64::new(0),
        }
    }

    pub fn inc_runs_claimed(&self) {
        self.runs_claimed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_claimed", "counter incremented");
    }

    pub fn inc_runs_succeeded(&self) {
        self.runs_succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_succeeded", "counter incremented");
    }

    pub fn inc_runs_failed(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_failed", "counter incremented");
    }

    pub fn inc_runs_needs_review(&self) {
        self.runs_needs_review.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_needs_review", "counter incremented");
    }

    pub fn inc_approvals_created(&self) {
        self.approvals_created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "approvals_created", "counter incremented");
    }

    pub fn inc_schedules_fired(&self) {
        self.schedules_fired.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "schedules_fired", "counter incremented");
    }

    /// Add `n` reaped items.
    pub fn add_items_reaped(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.items_reaped.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "items_reaped", n, "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            runs_claimed = self.runs_claimed(),
            runs_succeeded = self.runs_succeeded(),
            runs_failed = self.runs_failed(),
            runs_needs_review = self.runs_needs_review(),
            approvals_created = self.approvals_created(),
            schedules_fired = self.schedules_fired(),
            items_reaped = self.items_reaped(),
        );
    }

    pub fn runs_claimed(&self) -> u64 {
        self.runs_claimed.load(Ordering::Relaxed)
    }

    pub fn runs_succeeded(&self) -> u64 {
        self.runs_succeeded.load(Ordering::Relaxed)
    }

    pub fn runs_failed(&self) -> u64 {
        self.runs_failed.load(Ordering::Relaxed)
    }

    pub fn runs_needs_review(&self) -> u64 {
        self.runs_needs_review.load(Ordering::Relaxed)
    }

    pub fn approvals_created(&self) -> u64 {
        self.approvals_created.load(Ordering::Relaxed)
    }

    pub fn schedules_fired(&self) -> u64 {
        self.schedules_fired.load(Ordering::Relaxed)
    }

    pub fn items_reaped(&self) -> u64 {
        self.items_reaped.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.runs_claimed.store(0, Ordering::Relaxed);
        self.runs_succeeded.store(0, Ordering::Relaxed);
        self.runs_failed.store(0, Ordering::Relaxed);
        self.runs_needs_review.store(0, Ordering::Relaxed);
        self.approvals_created.store(0, Ordering::Relaxed);
        self.schedules_fired.store(0, Ordering::Relaxed);
        self.items_reaped.store(0, Ordering::Relaxed);
    }
}
