//! Live counters shared by every segment of a store.

use super::MetricsSnapshot;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic statistics counters.
///
/// Segments bump these without holding any lock of their own; a
/// [`snapshot`](StoreMetrics::snapshot) is therefore only approximately
/// consistent across counters while the store is busy.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    heap_hits: AtomicU64,
    tier_hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    updates: AtomicU64,
    removals: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    faults: AtomicU64,
    fault_races_lost: AtomicU64,
    refusals: AtomicU64,
    rehashes: AtomicU64,
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl StoreMetrics {
    /// Creates a set of zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_heap_hit(&self) {
        bump(&self.heap_hits);
    }

    pub(crate) fn record_tier_hit(&self) {
        bump(&self.tier_hits);
    }

    pub(crate) fn record_miss(&self) {
        bump(&self.misses);
    }

    pub(crate) fn record_put(&self) {
        bump(&self.puts);
    }

    pub(crate) fn record_update(&self) {
        bump(&self.updates);
    }

    pub(crate) fn record_removal(&self) {
        bump(&self.removals);
    }

    pub(crate) fn record_eviction(&self) {
        bump(&self.evictions);
    }

    pub(crate) fn record_expiration(&self) {
        bump(&self.expirations);
    }

    pub(crate) fn record_fault(&self) {
        bump(&self.faults);
    }

    pub(crate) fn record_fault_race_lost(&self) {
        bump(&self.fault_races_lost);
    }

    pub(crate) fn record_refusal(&self) {
        bump(&self.refusals);
    }

    pub(crate) fn record_rehash(&self) {
        bump(&self.rehashes);
    }

    /// Copies every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            heap_hits: load(&self.heap_hits),
            tier_hits: load(&self.tier_hits),
            misses: load(&self.misses),
            puts: load(&self.puts),
            updates: load(&self.updates),
            removals: load(&self.removals),
            evictions: load(&self.evictions),
            expirations: load(&self.expirations),
            faults: load(&self.faults),
            fault_races_lost: load(&self.fault_races_lost),
            refusals: load(&self.refusals),
            rehashes: load(&self.rehashes),
        }
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        for counter in [
            &self.heap_hits,
            &self.tier_hits,
            &self.misses,
            &self.puts,
            &self.updates,
            &self.removals,
            &self.evictions,
            &self.expirations,
            &self.faults,
            &self.fault_races_lost,
            &self.refusals,
            &self.rehashes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let metrics = StoreMetrics::new();
        metrics.record_heap_hit();
        metrics.record_heap_hit();
        metrics.record_tier_hit();
        metrics.record_miss();
        metrics.record_rehash();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.heap_hits, 2);
        assert_eq!(snapshot.tier_hits, 1);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.rehashes, 1);
        assert_eq!(snapshot.requests(), 4);
    }

    #[test]
    fn test_reset() {
        let metrics = StoreMetrics::new();
        metrics.record_put();
        metrics.record_eviction();
        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }
}
