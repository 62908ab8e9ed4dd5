//! Store Metrics System
//!
//! Stores report their statistics as a `BTreeMap<String, f64>` through the
//! [`CacheMetrics`] trait.
//!
//! # Why BTreeMap over HashMap?
//!
//! BTreeMap is used instead of HashMap for deterministic ordering: metrics
//! always appear in the same order, which keeps logs readable and the
//! driver's reports comparable across runs. With a couple of dozen keys the
//! O(log n) lookup cost does not matter.
//!
//! # Hit accounting
//!
//! A read that finds its key is a hit. It is a *heap hit* when the element
//! was still in memory (resident or waiting in a placeholder) and a *tier
//! hit* when it had to be read back through a tier marker. A read that finds
//! nothing is a miss.

use std::collections::BTreeMap;

mod store;

pub use store::StoreMetrics;

/// A point-in-time copy of a store's counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Reads answered from memory
    pub heap_hits: u64,

    /// Reads answered through a tier marker
    pub tier_hits: u64,

    /// Reads that found no mapping
    pub misses: u64,

    /// Inserts of previously unmapped keys
    pub puts: u64,

    /// Writes that replaced an existing mapping
    pub updates: u64,

    /// Explicit removals
    pub removals: u64,

    /// Elements removed by the eviction sampler or an identity-checked evict
    pub evictions: u64,

    /// Elements removed because they had expired
    pub expirations: u64,

    /// Representation swaps installed by a fault
    pub faults: u64,

    /// Faults that lost the compare-and-swap race
    pub fault_races_lost: u64,

    /// Writes or faults refused by a pool
    pub refusals: u64,

    /// Bucket table doublings across all segments
    pub rehashes: u64,
}

impl MetricsSnapshot {
    /// Total reads, hit or miss.
    pub fn requests(&self) -> u64 {
        self.heap_hits + self.tier_hits + self.misses
    }

    /// Hits of either kind over all reads, 0.0 when nothing was read.
    pub fn hit_rate(&self) -> f64 {
        let requests = self.requests();
        if requests > 0 {
            (self.heap_hits + self.tier_hits) as f64 / requests as f64
        } else {
            0.0
        }
    }

    /// Misses over all lookups, or 0 with no lookups yet.
    pub fn miss_rate(&self) -> f64 {
        let requests = self.requests();
        if requests > 0 {
            self.misses as f64 / requests as f64
        } else {
            0.0
        }
    }

    /// Share of hits that needed the secondary tier.
    pub fn tier_hit_ratio(&self) -> f64 {
        let hits = self.heap_hits + self.tier_hits;
        if hits > 0 {
            self.tier_hits as f64 / hits as f64
        } else {
            0.0
        }
    }

    /// Convert the snapshot to a BTreeMap for reporting
    pub fn to_btreemap(&self) -> BTreeMap<String, f64> {
        let mut metrics = BTreeMap::new();

        // Counters
        metrics.insert("evictions".to_string(), self.evictions as f64);
        metrics.insert("expirations".to_string(), self.expirations as f64);
        metrics.insert("fault_races_lost".to_string(), self.fault_races_lost as f64);
        metrics.insert("faults".to_string(), self.faults as f64);
        metrics.insert("heap_hits".to_string(), self.heap_hits as f64);
        metrics.insert("misses".to_string(), self.misses as f64);
        metrics.insert("puts".to_string(), self.puts as f64);
        metrics.insert("refusals".to_string(), self.refusals as f64);
        metrics.insert("rehashes".to_string(), self.rehashes as f64);
        metrics.insert("removals".to_string(), self.removals as f64);
        metrics.insert("requests".to_string(), self.requests() as f64);
        metrics.insert("tier_hits".to_string(), self.tier_hits as f64);
        metrics.insert("updates".to_string(), self.updates as f64);

        // Rates (0.0 to 1.0)
        metrics.insert("hit_rate".to_string(), self.hit_rate());
        metrics.insert("miss_rate".to_string(), self.miss_rate());
        metrics.insert("tier_hit_ratio".to_string(), self.tier_hit_ratio());

        metrics
    }
}

/// Trait that every store implements for metrics reporting
///
/// The trait uses BTreeMap to ensure deterministic ordering of metrics.
pub trait CacheMetrics {
    /// Returns all metrics as key-value pairs in deterministic order
    fn metrics(&self) -> BTreeMap<String, f64>;

    /// Name identifying the store implementation
    fn algorithm_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_with_no_requests() {
        let snapshot = MetricsSnapshot::default();
        assert_eq!(snapshot.hit_rate(), 0.0);
        assert_eq!(snapshot.miss_rate(), 0.0);
        assert_eq!(snapshot.tier_hit_ratio(), 0.0);
    }

    #[test]
    fn test_rates() {
        let snapshot = MetricsSnapshot {
            heap_hits: 6,
            tier_hits: 2,
            misses: 2,
            ..Default::default()
        };
        assert_eq!(snapshot.requests(), 10);
        assert!((snapshot.hit_rate() - 0.8).abs() < f64::EPSILON);
        assert!((snapshot.miss_rate() - 0.2).abs() < f64::EPSILON);
        assert!((snapshot.tier_hit_ratio() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_btreemap_is_ordered() {
        let map = MetricsSnapshot::default().to_btreemap();
        let keys: Vec<_> = map.keys().cloned().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(map.contains_key("tier_hits"));
        assert!(map.contains_key("hit_rate"));
    }
}
