//! Stored Element Type
//!
//! This module provides the `Element<K, V>` structure: the logical value held by
//! the store. Whatever representation currently holds an element (resident on
//! the heap, waiting in a placeholder, or written out behind a tier marker), the
//! element itself always carries the same key, payload and metadata.
//!
//! # Metadata
//!
//! Each element has:
//! - `key: K` - the key it is mapped under
//! - `value: V` - the payload
//! - `size: u64` - bytes this element accounts for in the pools
//! - `creation_time` - milliseconds since the UNIX epoch
//! - `last_access_time` - atomic, bumped on every visible read
//! - `hit_count` - atomic, number of visible reads
//! - `time_to_live` / `time_to_idle` - optional expiry bounds
//! - `eternal` - when set, the element never expires
//!
//! # Expiry
//!
//! ```text
//! expiration = min(creation + ttl, max(creation, last_access) + tti)
//! ```
//!
//! Bounds that are not set do not take part. An eternal element has no
//! expiration at all.
//!
//! # Examples
//!
//! ```
//! use tierstore::Element;
//! use std::time::Duration;
//!
//! let element = Element::with_size("user:1", "Alice".to_string(), 5)
//!     .with_time_to_live(Duration::from_secs(60));
//! assert_eq!(element.key(), &"user:1");
//! assert_eq!(element.size(), 5);
//! assert!(!element.is_expired());
//! ```

use core::fmt;
use core::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Returns the current wall clock time in milliseconds since the UNIX epoch.
#[inline]
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Fixed per-element bookkeeping overhead used when no explicit size is given.
const ELEMENT_OVERHEAD: u64 = 64;

/// The expiry bounds of an element, without its access metadata.
///
/// Tier markers keep a copy so they can answer expiry questions without
/// reading the element back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Lifetime {
    pub(crate) creation_time: u64,
    pub(crate) time_to_live: Option<u64>,
    pub(crate) time_to_idle: Option<u64>,
    pub(crate) eternal: bool,
}

impl Lifetime {
    /// Expiry instant given the last access time (0 when never read).
    pub(crate) fn expiration_time(&self, last_access_time: u64) -> Option<u64> {
        if self.eternal {
            return None;
        }
        let ttl_expiry = self
            .time_to_live
            .filter(|ttl| *ttl > 0)
            .map(|ttl| self.creation_time.saturating_add(ttl));
        let tti_expiry = self.time_to_idle.filter(|tti| *tti > 0).map(|tti| {
            self.creation_time
                .max(last_access_time)
                .saturating_add(tti)
        });
        match (ttl_expiry, tti_expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// A key, its payload and the metadata the store tracks for it.
///
/// Elements are shared as `Arc<Element<K, V>>` once they enter the store, so
/// the access metadata that changes on reads is kept in atomics.
pub struct Element<K, V> {
    key: K,
    value: V,
    size: u64,
    lifetime: Lifetime,
    last_access_time: AtomicU64,
    hit_count: AtomicU64,
}

impl<K, V> Element<K, V> {
    /// Creates an element whose size is estimated from the in-memory size of
    /// its key and value types.
    ///
    /// Use [`with_size`](Self::with_size) when the real footprint is known.
    #[inline]
    pub fn new(key: K, value: V) -> Self {
        let size = mem::size_of::<K>() as u64 + mem::size_of::<V>() as u64 + ELEMENT_OVERHEAD;
        Self::with_size(key, value, size)
    }

    /// Creates an element that accounts for exactly `size` bytes.
    #[inline]
    pub fn with_size(key: K, value: V, size: u64) -> Self {
        Self {
            key,
            value,
            size,
            lifetime: Lifetime {
                creation_time: now_millis(),
                ..Lifetime::default()
            },
            last_access_time: AtomicU64::new(0),
            hit_count: AtomicU64::new(0),
        }
    }

    /// Sets the time-to-live, measured from the creation time.
    #[must_use]
    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.lifetime.time_to_live = Some(ttl.as_millis() as u64);
        self
    }

    /// Sets the time-to-idle, measured from the last access (or creation).
    #[must_use]
    pub fn with_time_to_idle(mut self, tti: Duration) -> Self {
        self.lifetime.time_to_idle = Some(tti.as_millis() as u64);
        self
    }

    /// Marks the element as never expiring, whatever its TTL or TTI.
    #[must_use]
    pub fn eternal(mut self) -> Self {
        self.lifetime.eternal = true;
        self
    }

    /// Overrides the creation timestamp (milliseconds since the UNIX epoch).
    ///
    /// Tiers that rebuild elements from stored bytes use this to keep the
    /// original creation time.
    #[must_use]
    pub fn with_creation_time(mut self, creation_time: u64) -> Self {
        self.lifetime.creation_time = creation_time;
        self
    }

    /// The key this element is mapped under.
    #[inline]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The payload.
    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Bytes this element accounts for.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Creation time in milliseconds since the UNIX epoch.
    #[inline]
    pub fn creation_time(&self) -> u64 {
        self.lifetime.creation_time
    }

    /// Last access time, or 0 if the element was never read.
    #[inline]
    pub fn last_access_time(&self) -> u64 {
        self.last_access_time.load(Ordering::Relaxed)
    }

    /// Number of visible reads.
    #[inline]
    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    /// Time-to-live, if set.
    #[inline]
    pub fn time_to_live(&self) -> Option<Duration> {
        self.lifetime.time_to_live.map(Duration::from_millis)
    }

    /// Time-to-idle, if set.
    #[inline]
    pub fn time_to_idle(&self) -> Option<Duration> {
        self.lifetime.time_to_idle.map(Duration::from_millis)
    }

    /// Returns `true` if the element never expires.
    #[inline]
    pub fn is_eternal(&self) -> bool {
        self.lifetime.eternal
    }

    #[inline]
    pub(crate) fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    /// Overwrites the access metadata, for elements read back from a tier
    /// whose marker kept recording reads.
    pub(crate) fn restore_access(&self, last_access_time: u64, hit_count: u64) {
        self.last_access_time.store(last_access_time, Ordering::Relaxed);
        self.hit_count.store(hit_count, Ordering::Relaxed);
    }

    /// Records a read: bumps the hit counter and the last access time.
    #[inline]
    pub fn touch(&self) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
        self.last_access_time.store(now_millis(), Ordering::Relaxed);
    }

    /// The instant (milliseconds since the UNIX epoch) at which this element
    /// expires, or `None` if it never does.
    pub fn expiration_time(&self) -> Option<u64> {
        self.lifetime.expiration_time(self.last_access_time())
    }

    /// Returns `true` if the element has expired at `now` (milliseconds).
    #[inline]
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expiration_time().is_some_and(|at| now >= at)
    }

    /// Returns `true` if the element has expired now.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }
}

impl<K: Clone, V: Clone> Clone for Element<K, V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            size: self.size,
            lifetime: self.lifetime,
            last_access_time: AtomicU64::new(self.last_access_time()),
            hit_count: AtomicU64::new(self.hit_count()),
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for Element<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("size", &self.size)
            .field("creation_time", &self.lifetime.creation_time)
            .field("last_access_time", &self.last_access_time())
            .field("hit_count", &self.hit_count())
            .field("eternal", &self.lifetime.eternal)
            .finish()
    }
}
