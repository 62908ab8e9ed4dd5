//! Secondary Tier I/O
//!
//! The store never touches disk itself. A [`TierIo`] provider performs the
//! actual reads and writes, and the store only keeps the opaque
//! [`TierLocation`] it hands back inside a tier marker.
//!
//! [`MemoryTier`] is the reference provider: an append-only, in-process
//! region that copies elements on write and on read, the same way a
//! serializing disk tier would hand back a fresh element.

use crate::element::Element;
use crate::error::TierError;
use core::fmt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[cfg(feature = "hashbrown")]
use hashbrown::HashMap;

#[cfg(not(feature = "hashbrown"))]
use std::collections::HashMap;

/// Where an element lives on the secondary tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TierLocation {
    /// Byte offset within the tier.
    pub offset: u64,
    /// Length of the stored record in bytes.
    pub len: u64,
}

impl fmt::Display for TierLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.offset, self.len)
    }
}

/// Performs the actual secondary-tier reads and writes.
pub trait TierIo<K, V>: Send + Sync {
    /// Stores `element` and returns where it went.
    fn write(&self, key: &K, element: &Element<K, V>) -> Result<TierLocation, TierError>;

    /// Reads back the element stored at `location`.
    fn read(&self, location: TierLocation) -> Result<Element<K, V>, TierError>;

    /// Releases the space held at `location`.
    fn free(&self, location: TierLocation);
}

/// An in-process secondary tier.
///
/// Locations are handed out from a monotonically increasing offset, so a
/// freed location is never reused.
pub struct MemoryTier<K, V> {
    blocks: Mutex<HashMap<u64, Element<K, V>>>,
    next_offset: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    fail_writes: AtomicBool,
}

impl<K, V> MemoryTier<K, V> {
    /// Creates an empty tier.
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            next_offset: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Number of elements currently stored.
    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    /// Bytes currently stored.
    pub fn stored_bytes(&self) -> u64 {
        self.blocks.lock().values().map(Element::size).sum()
    }

    /// Number of successful reads so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of successful writes so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Makes every subsequent write fail with [`TierError::Io`] until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }
}

impl<K, V> Default for MemoryTier<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TierIo<K, V> for MemoryTier<K, V>
where
    K: Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn write(&self, _key: &K, element: &Element<K, V>) -> Result<TierLocation, TierError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(TierError::Io("write rejected".to_string()));
        }
        let len = element.size().max(1);
        let offset = self.next_offset.fetch_add(len, Ordering::Relaxed);
        self.blocks.lock().insert(offset, element.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(TierLocation { offset, len })
    }

    fn read(&self, location: TierLocation) -> Result<Element<K, V>, TierError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.blocks
            .lock()
            .get(&location.offset)
            .cloned()
            .ok_or(TierError::Missing(location))
    }

    fn free(&self, location: TierLocation) {
        self.blocks.lock().remove(&location.offset);
    }
}

impl<K, V> fmt::Debug for MemoryTier<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTier")
            .field("len", &self.len())
            .field("next_offset", &self.next_offset.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let tier: MemoryTier<&str, String> = MemoryTier::new();
        let element = Element::with_size("a", "alpha".to_string(), 5);
        let location = tier.write(&"a", &element).unwrap();
        assert_eq!(location, TierLocation { offset: 0, len: 5 });

        let read = tier.read(location).unwrap();
        assert_eq!(read.value(), "alpha");
        assert_eq!(read.creation_time(), element.creation_time());
        assert_eq!(tier.reads(), 1);
        assert_eq!(tier.writes(), 1);
        assert_eq!(tier.stored_bytes(), 5);
    }

    #[test]
    fn test_offsets_never_reused() {
        let tier: MemoryTier<u32, u32> = MemoryTier::new();
        let first = tier.write(&1, &Element::with_size(1, 1, 10)).unwrap();
        tier.free(first);
        let second = tier.write(&2, &Element::with_size(2, 2, 10)).unwrap();
        assert_ne!(first.offset, second.offset);
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_read_after_free_is_missing() {
        let tier: MemoryTier<u32, u32> = MemoryTier::new();
        let location = tier.write(&1, &Element::with_size(1, 1, 4)).unwrap();
        tier.free(location);
        assert_eq!(tier.read(location).unwrap_err(), TierError::Missing(location));
        assert!(tier.is_empty());
    }

    #[test]
    fn test_injected_write_failure() {
        let tier: MemoryTier<u32, u32> = MemoryTier::new();
        tier.set_fail_writes(true);
        assert!(matches!(
            tier.write(&1, &Element::with_size(1, 1, 4)),
            Err(TierError::Io(_))
        ));
        tier.set_fail_writes(false);
        assert!(tier.write(&1, &Element::with_size(1, 1, 4)).is_ok());
    }

    #[test]
    fn test_location_display() {
        let location = TierLocation { offset: 64, len: 8 };
        assert_eq!(location.to_string(), "64+8");
    }
}
