//! Pool Accounting
//!
//! Pools track the bytes a store consumes per region against a configured
//! maximum. The segment that installs or unlinks a representation updates the
//! pool while it holds its own write lock, so a segment's element count and the
//! bytes it charged never disagree. The pool itself is shared by every segment
//! (and possibly by several stores), so totals read at any other time are
//! approximate; a successful [`add`](PoolAccessor::add) or
//! [`replace`](PoolAccessor::replace) is the authoritative admission check.
//!
//! ```text
//!   Segment 0 ──┐
//!   Segment 1 ──┼──▶ BoundedPool(on-heap)   used / max
//!   Segment N ──┘
//!   TierFactory ───▶ BoundedPool(on-disk)   used / max
//! ```

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// The resource a pool accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolRegion {
    /// Memory held by resident elements, placeholders and markers
    OnHeap,
    /// Space held on the secondary tier
    OnDisk,
}

impl fmt::Display for PoolRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolRegion::OnHeap => f.write_str("on-heap"),
            PoolRegion::OnDisk => f.write_str("on-disk"),
        }
    }
}

/// Admission-control ledger consulted before a representation is installed.
pub trait PoolAccessor: Send + Sync + fmt::Debug {
    /// The region this accessor charges.
    fn region(&self) -> PoolRegion;

    /// Charges `bytes` to the pool.
    ///
    /// Returns the bytes added, or `None` if admitting them would exceed the
    /// maximum and `force` is not set.
    fn add(&self, bytes: u64, force: bool) -> Option<u64>;

    /// Releases `bytes` from the pool and returns the bytes actually freed.
    fn delete(&self, bytes: u64) -> u64;

    /// Swaps a charge of `old` bytes for one of `new` bytes.
    ///
    /// Returns the signed delta, or `None` if growing would exceed the maximum
    /// and `force` is not set. Shrinking always succeeds.
    fn replace(&self, old: u64, new: u64, force: bool) -> Option<i64>;

    /// Returns `true` if `bytes` fit without anything being evicted first.
    fn can_add_without_evicting(&self, bytes: u64) -> bool;

    /// Drops every charge.
    fn clear(&self);

    /// Bytes currently charged.
    fn size(&self) -> u64;

    /// Configured maximum.
    fn max_size(&self) -> u64;
}

/// A pool with a fixed byte budget backed by a single atomic counter.
///
/// # Example
///
/// ```
/// use tierstore::pool::{BoundedPool, PoolAccessor, PoolRegion};
///
/// let pool = BoundedPool::new(PoolRegion::OnHeap, 100);
/// assert_eq!(pool.add(60, false), Some(60));
/// assert_eq!(pool.add(60, false), None);
/// assert_eq!(pool.replace(60, 80, false), Some(20));
/// assert_eq!(pool.delete(80), 80);
/// assert_eq!(pool.size(), 0);
/// ```
pub struct BoundedPool {
    region: PoolRegion,
    max_size: u64,
    used: AtomicU64,
}

impl BoundedPool {
    /// Creates an empty pool for `region` that admits up to `max_size` bytes.
    pub fn new(region: PoolRegion, max_size: u64) -> Self {
        Self {
            region,
            max_size,
            used: AtomicU64::new(0),
        }
    }

    /// A pool that never refuses.
    pub fn unbounded(region: PoolRegion) -> Self {
        Self::new(region, u64::MAX)
    }
}

impl PoolAccessor for BoundedPool {
    #[inline]
    fn region(&self) -> PoolRegion {
        self.region
    }

    fn add(&self, bytes: u64, force: bool) -> Option<u64> {
        let max = self.max_size;
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.saturating_add(bytes);
                (force || next <= max).then_some(next)
            })
            .ok()
            .map(|_| bytes)
    }

    fn delete(&self, bytes: u64) -> u64 {
        let previous = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            })
            .unwrap_or(0);
        previous.min(bytes)
    }

    fn replace(&self, old: u64, new: u64, force: bool) -> Option<i64> {
        let max = self.max_size;
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.saturating_sub(old).saturating_add(new);
                (force || new <= old || next <= max).then_some(next)
            })
            .ok()
            .map(|_| new as i64 - old as i64)
    }

    fn can_add_without_evicting(&self, bytes: u64) -> bool {
        self.used.load(Ordering::Acquire).saturating_add(bytes) <= self.max_size
    }

    fn clear(&self) {
        self.used.store(0, Ordering::Release);
    }

    #[inline]
    fn size(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    #[inline]
    fn max_size(&self) -> u64 {
        self.max_size
    }
}

impl fmt::Debug for BoundedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedPool")
            .field("region", &self.region)
            .field("used", &self.size())
            .field("max_size", &self.max_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_add_refuses_over_budget() {
        let pool = BoundedPool::new(PoolRegion::OnHeap, 100);
        assert_eq!(pool.add(100, false), Some(100));
        assert_eq!(pool.add(1, false), None);
        assert_eq!(pool.size(), 100);
    }

    #[test]
    fn test_forced_add_exceeds_budget() {
        let pool = BoundedPool::new(PoolRegion::OnDisk, 10);
        assert_eq!(pool.add(25, true), Some(25));
        assert_eq!(pool.size(), 25);
        assert!(!pool.can_add_without_evicting(1));
    }

    #[test]
    fn test_replace_shrink_always_succeeds() {
        let pool = BoundedPool::new(PoolRegion::OnHeap, 10);
        pool.add(30, true);
        assert_eq!(pool.replace(30, 5, false), Some(-25));
        assert_eq!(pool.size(), 5);
    }

    #[test]
    fn test_replace_grow_refused() {
        let pool = BoundedPool::new(PoolRegion::OnHeap, 50);
        pool.add(40, false);
        assert_eq!(pool.replace(40, 60, false), None);
        assert_eq!(pool.size(), 40);
        assert_eq!(pool.replace(40, 50, false), Some(10));
    }

    #[test]
    fn test_delete_saturates() {
        let pool = BoundedPool::new(PoolRegion::OnHeap, 50);
        pool.add(10, false);
        assert_eq!(pool.delete(25), 10);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn test_clear() {
        let pool = BoundedPool::unbounded(PoolRegion::OnHeap);
        pool.add(1234, false);
        pool.clear();
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.max_size(), u64::MAX);
    }

    #[test]
    fn test_concurrent_adds_respect_budget() {
        let pool = Arc::new(BoundedPool::new(PoolRegion::OnHeap, 1_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || (0..500).filter(|_| pool.add(1, false).is_some()).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 1_000);
        assert_eq!(pool.size(), 1_000);
    }

    #[test]
    fn test_region_display() {
        assert_eq!(PoolRegion::OnHeap.to_string(), "on-heap");
        assert_eq!(PoolRegion::OnDisk.to_string(), "on-disk");
    }
}
