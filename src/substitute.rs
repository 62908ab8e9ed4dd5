//! Stored Representations
//!
//! A slot never holds an element directly. It holds a [`Substitute`]: the
//! form the element currently takes in the store.
//!
//! ```text
//!              create (tier)           flush / write
//!  Resident ─────────────────▶ Placeholder ─────────────▶ Marker
//!     ▲                                                    │
//!     └──────────────────────── fault_in ◀─────────────────┘
//!     └─────────────────────────── spill ─────────────────▶
//! ```
//!
//! - `Resident` holds the element on the heap.
//! - `Placeholder` holds the element while a write to the secondary tier is
//!   pending.
//! - `Marker` holds only where the element lives on the secondary tier.
//!
//! Each non-resident variant names the [`FactoryId`] of the factory that
//! built it, so decoding and freeing always reach the right owner.
//!
//! # Identity
//!
//! Variants share their payload through `Arc`, and identity is `Arc`
//! identity: two substitutes are [`same`](Substitute::same) only when they
//! point at the very same allocation. This is what compare-and-swap on a
//! slot compares.
//!
//! # Guaranteed release
//!
//! [`Encoded`] owns a freshly built representation until it is installed.
//! Dropping it un-installed frees the representation through its factory.
//! [`Retired`] collects representations that were swapped out of slots and
//! frees them when it goes out of scope. Segments declare their `Retired`
//! before taking the lock guard, so every free runs after the lock is
//! released.

use crate::element::{now_millis, Element, Lifetime};
use crate::factory::FactorySet;
use crate::tier::TierLocation;
use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Heap bytes charged for a tier marker.
pub const MARKER_HEAP_SIZE: u64 = 64;

/// Identifies the factory that produced a representation.
///
/// Id 0 is reserved for the identity factory; tier factories use ids from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactoryId(u16);

impl FactoryId {
    /// The identity factory, producer of resident values.
    pub const IDENTITY: FactoryId = FactoryId(0);

    /// Wraps a raw id. Use ids from 1 for tier factories.
    #[inline]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// The raw id.
    #[inline]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Returns `true` for the identity factory.
    #[inline]
    pub const fn is_identity(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FactoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_identity() {
            f.write_str("identity")
        } else {
            write!(f, "tier#{}", self.0)
        }
    }
}

/// An element whose write to the secondary tier has not happened yet.
pub struct Placeholder<K, V> {
    element: Arc<Element<K, V>>,
    factory: FactoryId,
}

impl<K, V> Placeholder<K, V> {
    /// Holds `element` until `factory` writes it out.
    pub fn new(element: Arc<Element<K, V>>, factory: FactoryId) -> Self {
        Self { element, factory }
    }

    /// The element waiting to be written.
    #[inline]
    pub fn element(&self) -> &Arc<Element<K, V>> {
        &self.element
    }

    /// The tier factory that will write it.
    #[inline]
    pub fn factory(&self) -> FactoryId {
        self.factory
    }
}

/// Points at an element stored on the secondary tier.
///
/// The marker caches the element size and expiry bounds, and records reads
/// made through it, so that accounting, time-to-idle and the eviction
/// sampler never need tier I/O. Elements read back through the marker carry
/// its access metadata.
#[derive(Debug)]
pub struct TierMarker {
    /// Where the element lives on the tier.
    pub location: TierLocation,
    /// The tier factory that wrote it.
    pub factory: FactoryId,
    /// Bytes charged to the on-disk pool.
    pub size: u64,
    lifetime: Lifetime,
    last_access_time: AtomicU64,
    hit_count: AtomicU64,
}

impl TierMarker {
    /// A marker for an element that never expires and was never read.
    pub fn new(location: TierLocation, factory: FactoryId, size: u64) -> Self {
        Self::with_lifetime(location, factory, size, Lifetime::default(), 0, 0)
    }

    /// A marker for `element`, taking over its expiry bounds and access
    /// metadata.
    pub(crate) fn for_element<K, V>(
        location: TierLocation,
        factory: FactoryId,
        element: &Element<K, V>,
    ) -> Self {
        Self::with_lifetime(
            location,
            factory,
            element.size(),
            element.lifetime(),
            element.last_access_time(),
            element.hit_count(),
        )
    }

    fn with_lifetime(
        location: TierLocation,
        factory: FactoryId,
        size: u64,
        lifetime: Lifetime,
        last_access_time: u64,
        hit_count: u64,
    ) -> Self {
        Self {
            location,
            factory,
            size,
            lifetime,
            last_access_time: AtomicU64::new(last_access_time),
            hit_count: AtomicU64::new(hit_count),
        }
    }

    /// Last access time of the element, or 0 if it was never read.
    #[inline]
    pub fn last_access_time(&self) -> u64 {
        self.last_access_time.load(Ordering::Relaxed)
    }

    /// Number of visible reads of the element, including those made before
    /// it was written to the tier.
    #[inline]
    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    /// The instant at which the element expires, or `None` if it never does.
    #[inline]
    pub fn expiration_time(&self) -> Option<u64> {
        self.lifetime.expiration_time(self.last_access_time())
    }

    /// Records a read of the element through this marker.
    pub(crate) fn touch(&self) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
        self.last_access_time.store(now_millis(), Ordering::Relaxed);
    }

    /// Copies the recorded access metadata onto an element read back from
    /// the tier.
    pub(crate) fn restore_access<K, V>(&self, element: &Element<K, V>) {
        element.restore_access(self.last_access_time(), self.hit_count());
    }
}

/// Discriminant of a [`Substitute`], for statistics and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubstituteKind {
    /// Held on the heap.
    Resident,
    /// Waiting for a tier write.
    Placeholder,
    /// Written to a tier.
    Marker,
}

/// The stored form of an element.
pub enum Substitute<K, V> {
    /// The element itself, on the heap.
    Resident(Arc<Element<K, V>>),
    /// The element, queued for a tier write.
    Placeholder(Arc<Placeholder<K, V>>),
    /// Where the element lives on a tier.
    Marker(Arc<TierMarker>),
}

impl<K, V> Substitute<K, V> {
    /// Wraps an element as a resident value.
    #[inline]
    pub fn resident(element: Element<K, V>) -> Self {
        Substitute::Resident(Arc::new(element))
    }

    /// Which variant this is.
    #[inline]
    pub fn kind(&self) -> SubstituteKind {
        match self {
            Substitute::Resident(_) => SubstituteKind::Resident,
            Substitute::Placeholder(_) => SubstituteKind::Placeholder,
            Substitute::Marker(_) => SubstituteKind::Marker,
        }
    }

    /// The factory responsible for decoding and freeing this representation.
    #[inline]
    pub fn factory_id(&self) -> FactoryId {
        match self {
            Substitute::Resident(_) => FactoryId::IDENTITY,
            Substitute::Placeholder(p) => p.factory,
            Substitute::Marker(m) => m.factory,
        }
    }

    /// Returns `true` if both substitutes are the very same representation.
    #[inline]
    pub fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Substitute::Resident(a), Substitute::Resident(b)) => Arc::ptr_eq(a, b),
            (Substitute::Placeholder(a), Substitute::Placeholder(b)) => Arc::ptr_eq(a, b),
            (Substitute::Marker(a), Substitute::Marker(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// The element, when it is still held in memory.
    #[inline]
    pub fn in_memory(&self) -> Option<&Arc<Element<K, V>>> {
        match self {
            Substitute::Resident(e) => Some(e),
            Substitute::Placeholder(p) => Some(&p.element),
            Substitute::Marker(_) => None,
        }
    }

    /// Bytes this representation occupies on the heap.
    #[inline]
    pub fn heap_size(&self) -> u64 {
        match self {
            Substitute::Resident(e) => e.size(),
            Substitute::Placeholder(p) => p.element.size(),
            Substitute::Marker(_) => MARKER_HEAP_SIZE,
        }
    }

    /// Size of the element this representation stands for.
    #[inline]
    pub fn element_size(&self) -> u64 {
        match self {
            Substitute::Resident(e) => e.size(),
            Substitute::Placeholder(p) => p.element.size(),
            Substitute::Marker(m) => m.size,
        }
    }

    /// Returns `true` if the element has expired at `now`, without tier I/O.
    pub fn is_expired_at(&self, now: u64) -> bool {
        match self {
            Substitute::Resident(e) => e.is_expired_at(now),
            Substitute::Placeholder(p) => p.element.is_expired_at(now),
            Substitute::Marker(m) => m.expiration_time().is_some_and(|at| now >= at),
        }
    }
}

impl<K, V> Clone for Substitute<K, V> {
    fn clone(&self) -> Self {
        match self {
            Substitute::Resident(e) => Substitute::Resident(Arc::clone(e)),
            Substitute::Placeholder(p) => Substitute::Placeholder(Arc::clone(p)),
            Substitute::Marker(m) => Substitute::Marker(Arc::clone(m)),
        }
    }
}

impl<K, V> fmt::Debug for Substitute<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Substitute::Resident(e) => f
                .debug_struct("Resident")
                .field("size", &e.size())
                .finish(),
            Substitute::Placeholder(p) => f
                .debug_struct("Placeholder")
                .field("factory", &p.factory)
                .field("size", &p.element.size())
                .finish(),
            Substitute::Marker(m) => f
                .debug_struct("Marker")
                .field("factory", &m.factory)
                .field("location", &m.location)
                .field("size", &m.size)
                .finish(),
        }
    }
}

/// A representation built for installation that has not been installed yet.
///
/// Dropping an armed `Encoded` frees the representation through its factory.
pub struct Encoded<'a, K, V> {
    substitute: Substitute<K, V>,
    factories: &'a FactorySet<K, V>,
    armed: bool,
}

impl<'a, K, V> Encoded<'a, K, V> {
    pub(crate) fn new(substitute: Substitute<K, V>, factories: &'a FactorySet<K, V>) -> Self {
        Self {
            substitute,
            factories,
            armed: true,
        }
    }

    /// The representation waiting to be installed.
    #[inline]
    pub fn substitute(&self) -> &Substitute<K, V> {
        &self.substitute
    }

    /// Marks the representation as installed and returns a handle to it.
    ///
    /// After this, dropping the `Encoded` no longer frees anything. The
    /// `Encoded` itself stays alive until the caller's scope ends, which is
    /// after any lock guard taken later in that scope.
    pub(crate) fn disarm(&mut self) -> Substitute<K, V> {
        self.armed = false;
        self.substitute.clone()
    }
}

impl<K, V> Drop for Encoded<'_, K, V> {
    fn drop(&mut self) {
        if self.armed {
            self.factories.free(&self.substitute);
        }
    }
}

impl<K, V> fmt::Debug for Encoded<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encoded")
            .field("substitute", &self.substitute)
            .field("armed", &self.armed)
            .finish()
    }
}

/// Representations swapped out of slots, freed when this goes out of scope.
pub(crate) struct Retired<'a, K, V> {
    factories: &'a FactorySet<K, V>,
    pending: Vec<Substitute<K, V>>,
}

impl<'a, K, V> Retired<'a, K, V> {
    pub(crate) fn new(factories: &'a FactorySet<K, V>) -> Self {
        Self {
            factories,
            pending: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn push(&mut self, substitute: Substitute<K, V>) {
        self.pending.push(substitute);
    }
}

impl<K, V> Drop for Retired<'_, K, V> {
    fn drop(&mut self) {
        for substitute in self.pending.drain(..) {
            self.factories.free(&substitute);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn marker(offset: u64) -> Substitute<&'static str, u32> {
        let element = Element::with_size("k", 0u32, 8)
            .with_creation_time(0)
            .with_time_to_live(Duration::from_millis(1_000));
        Substitute::Marker(Arc::new(TierMarker::for_element(
            TierLocation { offset, len: 8 },
            FactoryId::new(1),
            &element,
        )))
    }

    #[test]
    fn test_identity_is_arc_identity() {
        let a = Substitute::resident(Element::with_size("k", 1u32, 4));
        let b = a.clone();
        let c = Substitute::resident(Element::with_size("k", 1u32, 4));
        assert!(a.same(&b));
        assert!(!a.same(&c));
        assert!(!a.same(&marker(0)));
    }

    #[test]
    fn test_factory_ids() {
        let resident = Substitute::resident(Element::with_size("k", 1u32, 4));
        assert_eq!(resident.factory_id(), FactoryId::IDENTITY);
        assert_eq!(marker(0).factory_id(), FactoryId::new(1));
        assert_eq!(FactoryId::IDENTITY.to_string(), "identity");
        assert_eq!(FactoryId::new(3).to_string(), "tier#3");
    }

    #[test]
    fn test_sizes_by_kind() {
        let element = Arc::new(Element::with_size("k", 1u32, 500));
        let placeholder =
            Substitute::Placeholder(Arc::new(Placeholder::new(element, FactoryId::new(1))));
        assert_eq!(placeholder.kind(), SubstituteKind::Placeholder);
        assert_eq!(placeholder.heap_size(), 500);

        let marker = marker(0);
        assert_eq!(marker.heap_size(), MARKER_HEAP_SIZE);
        assert_eq!(marker.element_size(), 8);
        assert!(marker.in_memory().is_none());
    }

    #[test]
    fn test_marker_expiry_uses_cached_time() {
        let marker = marker(0);
        assert!(!marker.is_expired_at(999));
        assert!(marker.is_expired_at(1_000));
    }

    #[test]
    fn test_marker_reads_extend_time_to_idle() {
        let element = Element::with_size("k", 1u32, 8)
            .with_creation_time(now_millis() - 10_000)
            .with_time_to_idle(Duration::from_millis(500));
        element.touch();
        let location = TierLocation { offset: 0, len: 8 };
        let marker = TierMarker::for_element(location, FactoryId::new(1), &element);
        assert_eq!(marker.hit_count(), 1);
        assert_eq!(marker.expiration_time(), element.expiration_time());

        marker.last_access_time.store(0, Ordering::Relaxed);
        assert!(marker.expiration_time().is_some_and(|at| at <= now_millis()));
        marker.touch();
        assert_eq!(marker.hit_count(), 2);
        assert!(marker.expiration_time().is_some_and(|at| at > now_millis()));

        let read_back = Element::with_size("k", 1u32, 8);
        marker.restore_access(&read_back);
        assert_eq!(read_back.hit_count(), 2);
        assert_eq!(read_back.last_access_time(), marker.last_access_time());
    }

    #[test]
    fn test_plain_marker_never_expires() {
        let marker = TierMarker::new(TierLocation { offset: 0, len: 1 }, FactoryId::new(2), 1);
        assert!(marker.expiration_time().is_none());
        assert_eq!(marker.hit_count(), 0);
    }
}
