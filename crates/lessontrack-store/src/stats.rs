//! Counters for conditions that are handled silently.
//!
//! The facade swallows durable failures so the UI keeps going; these
//! counters are how that data loss stays observable.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the resolver, facade and ephemeral adapter.
#[derive(Debug, Default)]
pub struct AccessStats {
    durable_failures: AtomicU64,
    fail_open_resolutions: AtomicU64,
    evicted_results: AtomicU64,
    discarded_local_entries: AtomicU64,
    rejected_writes: AtomicU64,
}

impl AccessStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_durable_failure(&self) {
        self.durable_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fail_open(&self) {
        self.fail_open_resolutions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evicted(&self, n: u64) {
        self.evicted_results.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self) {
        self.discarded_local_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Durable operations that failed and were turned into no-ops.
    pub fn durable_failures(&self) -> u64 {
        self.durable_failures.load(Ordering::Relaxed)
    }

    /// Resolutions that fell back to ephemeral because the probe failed.
    pub fn fail_open_resolutions(&self) -> u64 {
        self.fail_open_resolutions.load(Ordering::Relaxed)
    }

    /// Exercise results dropped from the local log by the size cap.
    pub fn evicted_results(&self) -> u64 {
        self.evicted_results.load(Ordering::Relaxed)
    }

    /// Local values that failed to parse and were treated as absent.
    pub fn discarded_local_entries(&self) -> u64 {
        self.discarded_local_entries.load(Ordering::Relaxed)
    }

    /// Writes refused because the input broke a record invariant.
    pub fn rejected_writes(&self) -> u64 {
        self.rejected_writes.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.durable_failures.store(0, Ordering::Relaxed);
        self.fail_open_resolutions.store(0, Ordering::Relaxed);
        self.evicted_results.store(0, Ordering::Relaxed);
        self.discarded_local_entries.store(0, Ordering::Relaxed);
        self.rejected_writes.store(0, Ordering::Relaxed);
    }
}

impl fmt::Display for AccessStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "durable_failures={} fail_open={} evicted={} discarded={} rejected={}",
            self.durable_failures(),
            self.fail_open_resolutions(),
            self.evicted_results(),
            self.discarded_local_entries(),
            self.rejected_writes(),
        )
    }
}
