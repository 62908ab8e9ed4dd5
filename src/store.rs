//! Tiered Store
//!
//! [`TieredStore`] is the composition root: a fixed array of segments
//! addressed by a spread hash, exposing the whole-store contract.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            TieredStore                               │
//! │                                                                      │
//! │  spread(hash(key)) >> shift  ──▶  Segment Selection                  │
//! │                                                                      │
//! │  ┌──────────────┐ ┌──────────────┐     ┌──────────────┐              │
//! │  │  Segment 0   │ │  Segment 1   │ ... │  Segment N-1 │              │
//! │  │  ┌────────┐  │ │  ┌────────┐  │     │  ┌────────┐  │              │
//! │  │  │ RwLock │  │ │  │ RwLock │  │     │  │ RwLock │  │              │
//! │  │  └────┬───┘  │ │  └────┬───┘  │     │  └────┬───┘  │              │
//! │  │  ┌────▼───┐  │ │  ┌────▼───┐  │     │  ┌────▼───┐  │              │
//! │  │  │buckets │  │ │  │buckets │  │     │  │buckets │  │              │
//! │  │  └────────┘  │ │  └────────┘  │     │  └────────┘  │              │
//! │  └──────────────┘ └──────────────┘     └──────────────┘              │
//! │                                                                      │
//! │  FactorySet (identity + tier)   on-heap pool   metrics   listeners   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Segment Selection
//!
//! Keys are hashed with the store's `BuildHasher`, folded to 32 bits and then
//! avalanche-mixed by [`spread`]. The segment is chosen from the high bits
//! of the mixed hash and the bucket inside the segment from the low bits, so
//! the two choices are independent. The segment count never changes; only
//! the bucket tables inside segments grow.
//!
//! ## Sizing
//!
//! [`size`](TieredStore::size) first sums the per-segment counts without
//! locking, accepting the sum if no segment was modified in between. After
//! two unstable attempts it read-locks every segment and counts under the
//! locks.
//!
//! ## Tiering
//!
//! With a [`TierFactory`] attached, elements move between representations:
//!
//! - [`spill`](TieredStore::spill) writes an in-memory element to the tier
//!   and swaps in a marker.
//! - [`fault_in`](TieredStore::fault_in) reads a marked element back and
//!   makes it resident again.
//! - With `tier_primary` set, puts store placeholders;
//!   [`flush`](TieredStore::flush) writes the queued placeholders out.
//!
//! Reads resolve any representation transparently.
//!
//! # Example
//!
//! ```
//! use tierstore::config::StoreConfig;
//! use tierstore::{Element, TieredStore};
//!
//! let config = StoreConfig::new().with_segments(4).with_initial_capacity(64);
//! let store: TieredStore<String, u32> = TieredStore::init(config, None).unwrap();
//!
//! store.put(Element::new("a".to_string(), 1)).unwrap();
//! store.put(Element::new("b".to_string(), 2)).unwrap();
//!
//! let a = store.get("a").unwrap().unwrap();
//! assert_eq!(*a.value(), 1);
//! assert_eq!(store.size(), 2);
//! ```

use crate::comparator::ValueComparator;
use crate::config::StoreConfig;
use crate::element::Element;
use crate::error::{Result, StoreError};
use crate::events::EventListeners;
use crate::factory::{FactorySet, TierFactory};
use crate::metrics::{CacheMetrics, StoreMetrics};
use crate::pool::{BoundedPool, PoolAccessor, PoolRegion};
use crate::segment::{Sample, Segment, SegmentLock, SegmentShared, SizeBound, Wait};
use crate::substitute::{Substitute, SubstituteKind};
use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

#[cfg(feature = "hashbrown")]
use hashbrown::DefaultHashBuilder;

#[cfg(not(feature = "hashbrown"))]
use std::collections::hash_map::RandomState as DefaultHashBuilder;

/// Unlocked attempts `size` makes before locking every segment.
const RETRIES_BEFORE_LOCK: usize = 2;

/// Avalanche-mixes a 32-bit hash so that nearby inputs land far apart in
/// both the high (segment) and low (bucket) bits.
#[inline]
pub fn spread(hash: u32) -> u32 {
    let mut h = hash;
    h = h.wrapping_add((h << 15) ^ 0xffff_cd7d);
    h ^= h >> 10;
    h = h.wrapping_add(h << 3);
    h ^= h >> 6;
    h = h.wrapping_add((h << 2).wrapping_add(h << 14));
    h ^ (h >> 16)
}

/// Optional collaborators supplied at construction.
pub struct StoreParts<K, V> {
    /// Ledger for heap bytes; unbounded when not set
    pub heap_pool: Arc<dyn PoolAccessor>,
    /// Secondary tier, if any
    pub tier: Option<Arc<TierFactory<K, V>>>,
}

impl<K, V> StoreParts<K, V> {
    /// Parts with an unbounded heap pool and no tier.
    pub fn new() -> Self {
        Self {
            heap_pool: Arc::new(BoundedPool::unbounded(PoolRegion::OnHeap)),
            tier: None,
        }
    }

    /// Sets the ledger for heap bytes.
    #[must_use]
    pub fn with_heap_pool(mut self, heap_pool: Arc<dyn PoolAccessor>) -> Self {
        self.heap_pool = heap_pool;
        self
    }

    /// Adds a secondary tier.
    #[must_use]
    pub fn with_tier(mut self, tier: Arc<TierFactory<K, V>>) -> Self {
        self.tier = Some(tier);
        self
    }
}

impl<K, V> Default for StoreParts<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for StoreParts<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreParts")
            .field("heap_pool", &self.heap_pool)
            .field("tier", &self.tier)
            .finish()
    }
}

/// A segmented, concurrent key/value store whose elements can live on the
/// heap or on a secondary tier.
///
/// # Type Parameters
///
/// - `K`: Key type. Must implement `Hash + Eq + Clone + Send + Sync`.
/// - `V`: Value type. Must implement `Send + Sync`.
/// - `S`: Hash builder type. Defaults to `DefaultHashBuilder`.
///
/// All methods take `&self`; share the store between threads with `Arc`.
pub struct TieredStore<K, V, S = DefaultHashBuilder> {
    segments: Box<[Segment<K, V>]>,
    segment_shift: u32,
    segment_mask: usize,
    hash_builder: S,
    factories: Arc<FactorySet<K, V>>,
    heap_pool: Arc<dyn PoolAccessor>,
    metrics: Arc<StoreMetrics>,
    events: Arc<EventListeners<K, V>>,
    bound: Arc<SizeBound>,
    max_eviction_rounds: usize,
}

impl<K, V> TieredStore<K, V, DefaultHashBuilder>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates a heap-only store from a configuration with an optional
    /// hasher.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidConfig`] if the configuration does not validate.
    pub fn init(config: StoreConfig, hasher: Option<DefaultHashBuilder>) -> Result<Self> {
        Self::init_with_parts(config, StoreParts::new(), hasher)
    }

    /// Creates a store with an explicit heap pool and optional secondary
    /// tier.
    pub fn init_with_parts(
        config: StoreConfig,
        parts: StoreParts<K, V>,
        hasher: Option<DefaultHashBuilder>,
    ) -> Result<Self> {
        Self::init_with_hasher(config, parts, hasher.unwrap_or_default())
    }
}

impl<K, V, S> TieredStore<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    /// Creates a store with a custom hash builder.
    ///
    /// Use this for deterministic hashing or DoS-resistant hashers.
    pub fn init_with_hasher(config: StoreConfig, parts: StoreParts<K, V>, hash_builder: S) -> Result<Self> {
        config.validate()?;
        if parts.heap_pool.region() != PoolRegion::OnHeap {
            return Err(StoreError::InvalidConfig(format!(
                "heap pool accounts for {}, expected on-heap",
                parts.heap_pool.region()
            )));
        }
        if config.tier_primary && parts.tier.is_none() {
            return Err(StoreError::InvalidConfig(
                "tier_primary requires a tier factory".to_string(),
            ));
        }

        let mut factories = FactorySet::new();
        if let Some(tier) = parts.tier {
            factories = factories.with_tier(tier, config.tier_primary)?;
        }

        let segment_count = config.segment_count();
        let shared = SegmentShared {
            factories: Arc::new(factories),
            pool: parts.heap_pool,
            metrics: Arc::new(StoreMetrics::new()),
            events: Arc::new(EventListeners::new()),
            bound: Arc::new(SizeBound::new(config.max_size)),
        };
        let segments: Vec<_> = (0..segment_count)
            .map(|_| Segment::new(&config, shared.clone()))
            .collect();

        debug!(
            segments = segment_count,
            segment_capacity = config.segment_capacity(),
            max_size = config.max_size,
            "created tiered store"
        );

        Ok(Self {
            segments: segments.into_boxed_slice(),
            segment_shift: 32 - segment_count.trailing_zeros(),
            segment_mask: segment_count - 1,
            hash_builder,
            factories: shared.factories,
            heap_pool: shared.pool,
            metrics: shared.metrics,
            events: shared.events,
            bound: shared.bound,
            max_eviction_rounds: config.max_eviction_rounds,
        })
    }

    /// Spread hash of `key`.
    #[inline]
    fn hash<Q>(&self, key: &Q) -> u32
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash,
    {
        let h = self.hash_builder.hash_one(key);
        spread((h ^ (h >> 32)) as u32)
    }

    #[inline]
    fn segment_index(&self, hash: u32) -> usize {
        (u64::from(hash) >> self.segment_shift) as usize & self.segment_mask
    }

    #[inline]
    fn segment_for(&self, hash: u32) -> &Segment<K, V> {
        &self.segments[self.segment_index(hash)]
    }

    /// Returns the number of segments in the store.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// The listeners notified of mapping changes.
    pub fn listeners(&self) -> &EventListeners<K, V> {
        &self.events
    }

    /// Live statistics counters.
    pub fn store_metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    /// The ledger for heap bytes.
    pub fn heap_pool(&self) -> &Arc<dyn PoolAccessor> {
        &self.heap_pool
    }

    /// The tier factory this store was built with, if any.
    pub fn tier(&self) -> Option<&Arc<TierFactory<K, V>>> {
        self.factories.default_tier()
    }

    /// Retrieves an element, recording the access.
    ///
    /// Elements on the secondary tier are read back transparently.
    pub fn get<Q>(&self, key: &Q) -> Result<Option<Arc<Element<K, V>>>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.hash(key);
        self.segment_for(hash).get(key, hash, Wait::Forever)
    }

    /// Like [`get`](Self::get), giving up after `timeout` if the segment is
    /// locked.
    pub fn get_timeout<Q>(&self, key: &Q, timeout: Duration) -> Result<Option<Arc<Element<K, V>>>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.hash(key);
        self.segment_for(hash).get(key, hash, Wait::For(timeout))
    }

    /// Retrieves an element without updating its access time, hit count or
    /// the store statistics.
    pub fn get_quiet<Q>(&self, key: &Q) -> Result<Option<Arc<Element<K, V>>>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.hash(key);
        self.segment_for(hash).get_quiet(key, hash, Wait::Forever)
    }

    /// Returns the stored representation of `key` without decoding it.
    pub fn unretrieved_get<Q>(&self, key: &Q) -> Option<Substitute<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.hash(key);
        self.segment_for(hash).unretrieved_get(key, hash)
    }

    /// Maps the element's key to it, returning the element it replaced.
    ///
    /// # Errors
    ///
    /// [`StoreError::CapacityRefused`] if the heap pool cannot admit the
    /// element; the store is left unchanged.
    pub fn put(&self, element: Element<K, V>) -> Result<Option<Arc<Element<K, V>>>> {
        self.put_with(element, false, Wait::Forever)
    }

    /// Like [`put`](Self::put), giving up after `timeout` if the segment is
    /// locked.
    pub fn put_timeout(
        &self,
        element: Element<K, V>,
        timeout: Duration,
    ) -> Result<Option<Arc<Element<K, V>>>> {
        self.put_with(element, false, Wait::For(timeout))
    }

    /// Maps the element's key only if it is unmapped. Returns the element
    /// that stays mapped when the key was already present.
    pub fn put_if_absent(&self, element: Element<K, V>) -> Result<Option<Arc<Element<K, V>>>> {
        self.put_with(element, true, Wait::Forever)
    }

    fn put_with(
        &self,
        element: Element<K, V>,
        only_if_absent: bool,
        wait: Wait,
    ) -> Result<Option<Arc<Element<K, V>>>> {
        let key = element.key().clone();
        let hash = self.hash(&key);
        let index = self.segment_index(hash);
        let previous =
            self.segments[index].put(key, hash, Arc::new(element), only_if_absent, wait)?;
        if !only_if_absent || previous.is_none() {
            self.evict_from_siblings(index, wait);
        }
        Ok(previous)
    }

    /// Evicts from the segments after `origin` while the store is still
    /// above its maximum size.
    ///
    /// The segment a put landed in evicts first, under its own lock. It can
    /// come up short when it holds little besides the new key, so the rest
    /// of the excess is taken from the other segments, one lock at a time.
    /// A segment whose lock cannot be had within `wait` is skipped; the put
    /// itself has already succeeded.
    fn evict_from_siblings(&self, origin: usize, wait: Wait) {
        let mut budget = self.bound.excess().min(self.max_eviction_rounds);
        let len = self.segments.len();
        for offset in 1..len {
            if budget == 0 {
                break;
            }
            let segment = &self.segments[(origin + offset) % len];
            match segment.evict_excess(budget, wait) {
                Ok(evicted) => budget = budget.saturating_sub(evicted),
                Err(err) => trace!(error = %err, "skipped a locked segment while evicting"),
            }
        }
    }

    /// Inserts an already encoded representation.
    ///
    /// # Errors
    ///
    /// [`StoreError::DuplicateKey`] if `key` is already mapped, and
    /// [`StoreError::UnknownFactory`] if `substitute` names a factory this
    /// store does not have. The representation is freed in both cases.
    pub fn put_raw_if_absent(&self, key: K, substitute: Substitute<K, V>) -> Result<()> {
        let encoded = self.factories.adopt(substitute);
        self.factories.get(encoded.substitute().factory_id())?;
        let hash = self.hash(&key);
        self.segment_for(hash).put_raw_if_absent(key, hash, encoded)
    }

    /// Removes `key`, returning its element.
    pub fn remove<Q>(&self, key: &Q) -> Result<Option<Arc<Element<K, V>>>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.hash(key);
        self.segment_for(hash).remove(key, hash, None, Wait::Forever)
    }

    /// Like [`remove`](Self::remove), giving up after `timeout` if the
    /// segment is locked.
    pub fn remove_timeout<Q>(
        &self,
        key: &Q,
        timeout: Duration,
    ) -> Result<Option<Arc<Element<K, V>>>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.hash(key);
        self.segment_for(hash)
            .remove(key, hash, None, Wait::For(timeout))
    }

    /// Removes the mapping for `expected.key()` only if its element matches
    /// `expected` under `comparator`.
    pub fn remove_element(
        &self,
        expected: &Element<K, V>,
        comparator: &dyn ValueComparator<K, V>,
    ) -> Result<Option<Arc<Element<K, V>>>> {
        let key = expected.key();
        let hash = self.hash(key);
        self.segment_for(hash)
            .remove(key, hash, Some((expected, comparator)), Wait::Forever)
    }

    /// Replaces the element mapped to its key, returning the previous one.
    /// Does nothing if the key is unmapped.
    pub fn replace(&self, element: Element<K, V>) -> Result<Option<Arc<Element<K, V>>>> {
        let key = element.key().clone();
        let hash = self.hash(&key);
        self.segment_for(hash)
            .replace(&key, hash, Arc::new(element), Wait::Forever)
    }

    /// Replaces `old` with `element` only if the current mapping matches
    /// `old` under `comparator`.
    pub fn replace_element(
        &self,
        old: &Element<K, V>,
        element: Element<K, V>,
        comparator: &dyn ValueComparator<K, V>,
    ) -> Result<bool> {
        let key = old.key();
        let hash = self.hash(key);
        self.segment_for(hash).replace_if(
            key,
            hash,
            old,
            Arc::new(element),
            comparator,
            Wait::Forever,
        )
    }

    /// Returns `true` if `key` is mapped. Does not count as an access.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.hash(key);
        self.segment_for(hash).contains_key(key, hash)
    }

    /// Returns `true` if any element holds `value`. Reads back elements on
    /// the secondary tier.
    pub fn contains_value(&self, value: &V) -> Result<bool>
    where
        V: PartialEq,
    {
        for segment in self.segments.iter() {
            if segment.contains_value(value)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Returns the number of mapped keys.
    pub fn size(&self) -> usize {
        let mut mod_counts = vec![0u64; self.segments.len()];
        for _ in 0..RETRIES_BEFORE_LOCK {
            let mut sum = 0;
            for (segment, mod_count) in self.segments.iter().zip(mod_counts.iter_mut()) {
                *mod_count = segment.mod_count();
                sum += segment.count();
            }
            let mut check = 0;
            let mut stable = true;
            for (segment, mod_count) in self.segments.iter().zip(mod_counts.iter()) {
                check += segment.count();
                if segment.mod_count() != *mod_count {
                    stable = false;
                    break;
                }
            }
            if stable && check == sum {
                return sum;
            }
        }

        let guards: Vec<_> = self.segments.iter().map(Segment::read_lock).collect();
        let sum = self.segments.iter().map(Segment::count).sum();
        drop(guards);
        sum
    }

    /// Element count kept alongside the segment counts without any
    /// consistency check. Cheap, but may be off while writers are active.
    pub fn quick_size(&self) -> usize {
        self.bound.total()
    }

    /// Returns `true` if no key is mapped.
    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|segment| segment.count() == 0)
    }

    fn kind_count(&self, kind: SubstituteKind) -> usize {
        self.segments
            .iter()
            .map(|segment| segment.kind_count(kind))
            .sum()
    }

    /// Elements held in memory: resident ones and pending placeholders.
    pub fn on_heap_count(&self) -> usize {
        self.kind_count(SubstituteKind::Resident) + self.kind_count(SubstituteKind::Placeholder)
    }

    /// Elements stored on the secondary tier.
    pub fn on_disk_count(&self) -> usize {
        self.kind_count(SubstituteKind::Marker)
    }

    /// Placeholders waiting for [`flush`](Self::flush).
    pub fn pending_count(&self) -> usize {
        self.kind_count(SubstituteKind::Placeholder)
    }

    /// Drops every mapping and frees every representation.
    pub fn clear(&self) {
        for segment in self.segments.iter() {
            segment.clear();
        }
    }

    /// Takes the write lock of the segment `key` maps to.
    ///
    /// Every operation on a key in that segment, including from the calling
    /// thread, blocks until the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// [`StoreError::LockTimeout`] if the lock is not acquired in time.
    pub fn lock_key_for<Q>(&self, key: &Q, timeout: Duration) -> Result<SegmentLock<'_, K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.hash(key);
        self.segment_for(hash).lock(Wait::For(timeout))
    }

    /// Collects up to `size` entries accepted by `filter` for an external
    /// capacity evictor.
    ///
    /// Sampling starts at a random segment, or at the segment of `key_hint`,
    /// and walks forward through the segments until enough entries are found
    /// or every segment has been visited once.
    pub fn random_sample(
        &self,
        filter: &dyn Fn(&Substitute<K, V>) -> bool,
        size: usize,
        key_hint: Option<&K>,
    ) -> Vec<Sample<K, V>> {
        let mut sampled = Vec::with_capacity(size);
        if size == 0 {
            return sampled;
        }
        let random_hash = rand::random::<u32>();
        let start = match key_hint {
            Some(key) => self.segment_index(self.hash(key)),
            None => self.segment_index(random_hash),
        };
        let mut index = start;
        loop {
            self.segments[index].add_random_sample(filter, size, random_hash, &mut sampled);
            if sampled.len() >= size {
                break;
            }
            index = (index + 1) & self.segment_mask;
            if index == start {
                break;
            }
        }
        sampled
    }

    /// Removes `key` if it still holds `expected` (or unconditionally when
    /// `expected` is `None`). Returns the evicted element.
    ///
    /// Never blocks: a contended segment is skipped and `Ok(None)` returned.
    pub fn evict<Q>(
        &self,
        key: &Q,
        expected: Option<&Substitute<K, V>>,
    ) -> Result<Option<Arc<Element<K, V>>>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.hash(key);
        self.segment_for(hash).evict(key, hash, expected)
    }

    /// Swaps the representation of `key` from `expect` to `substitute`.
    ///
    /// Returns `Ok(false)` if another writer changed or removed the mapping
    /// first; `substitute` is freed in that case.
    pub fn fault(&self, key: &K, expect: &Substitute<K, V>, substitute: Substitute<K, V>) -> Result<bool> {
        let hash = self.hash(key);
        let encoded = self.factories.adopt(substitute);
        self.segment_for(hash).fault(key, hash, expect, encoded, true)
    }

    /// Like [`fault`](Self::fault), but returns `Ok(false)` immediately if
    /// the segment lock is contended.
    pub fn try_fault(
        &self,
        key: &K,
        expect: &Substitute<K, V>,
        substitute: Substitute<K, V>,
    ) -> Result<bool> {
        let hash = self.hash(key);
        let encoded = self.factories.adopt(substitute);
        self.segment_for(hash).fault(key, hash, expect, encoded, false)
    }

    /// Writes the in-memory element of `key` to the secondary tier and
    /// replaces it with a marker.
    ///
    /// Returns `Ok(false)` if the key is unmapped, already on the tier, or
    /// changed while it was being written.
    pub fn spill(&self, key: &K) -> Result<bool> {
        let hash = self.hash(key);
        let segment = self.segment_for(hash);
        let Some(current) = segment.unretrieved_get(key, hash) else {
            return Ok(false);
        };
        let Some(element) = current.in_memory() else {
            return Ok(false);
        };
        let tier = match current.factory_id() {
            id if id.is_identity() => self.factories.default_tier().ok_or(StoreError::NoTier)?,
            id => self.factories.tier(id)?,
        };
        let marker = tier.write(key, element)?;
        segment.fault(key, hash, &current, self.factories.adopt(marker), true)
    }

    /// Reads the element of `key` back from the secondary tier and makes it
    /// resident.
    ///
    /// Returns `Ok(false)` if the key is unmapped, already in memory, or
    /// changed while it was being read.
    pub fn fault_in(&self, key: &K) -> Result<bool> {
        let hash = self.hash(key);
        let segment = self.segment_for(hash);
        let Some(current @ Substitute::Marker(_)) = segment.unretrieved_get(key, hash) else {
            return Ok(false);
        };
        let element = match self.factories.decode(key, &current) {
            Ok(element) => element,
            // A concurrent fault may already have released the location.
            Err(err) => {
                return match segment.unretrieved_get(key, hash) {
                    Some(now) if now.same(&current) => Err(err),
                    _ => Ok(false),
                }
            }
        };
        let resident = self.factories.adopt(Substitute::Resident(element));
        segment.fault(key, hash, &current, resident, true)
    }

    /// Writes every queued placeholder to its tier. Returns how many were
    /// written.
    ///
    /// # Errors
    ///
    /// The first tier or pool failure stops the flush; the key that failed
    /// and every key not yet attempted stay queued.
    pub fn flush(&self) -> Result<usize> {
        let mut written = 0;
        for tier in self.factories.tiers() {
            let mut keys = tier.drain_pending().into_iter();
            while let Some(key) = keys.next() {
                match self.flush_one(&key) {
                    Ok(true) => written += 1,
                    Ok(false) => {}
                    Err(err) => {
                        tier.requeue(core::iter::once(key).chain(keys));
                        return Err(err);
                    }
                }
            }
        }
        if written > 0 {
            debug!(written, "flushed placeholders");
        }
        Ok(written)
    }

    fn flush_one(&self, key: &K) -> Result<bool> {
        let hash = self.hash(key);
        let segment = self.segment_for(hash);
        let Some(current) = segment.unretrieved_get(key, hash) else {
            return Ok(false);
        };
        let Substitute::Placeholder(placeholder) = &current else {
            return Ok(false);
        };
        let tier = self.factories.tier(placeholder.factory())?;
        let marker = tier.write(key, placeholder.element())?;
        segment.fault(key, hash, &current, self.factories.adopt(marker), true)
    }

    /// Removes every expired element, notifying listeners. Returns how many
    /// were removed.
    pub fn expire_elements(&self) -> Result<usize> {
        let mut expired = 0;
        for segment in self.segments.iter() {
            expired += segment.expire_elements(Wait::Forever)?;
        }
        Ok(expired)
    }

    /// Snapshot of every mapped key.
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.size());
        for segment in self.segments.iter() {
            keys.extend(segment.keys());
        }
        keys
    }

    /// Changes the element count above which puts evict (0 disables).
    ///
    /// Takes effect on the next put; nothing is evicted right away.
    pub fn set_max_size(&self, max_size: usize) {
        self.bound.set_max_size(max_size);
    }
}

impl<K, V, S> CacheMetrics for TieredStore<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    fn metrics(&self) -> BTreeMap<String, f64> {
        let mut metrics = self.metrics.snapshot().to_btreemap();
        metrics.insert("size".to_string(), self.size() as f64);
        metrics.insert("on_heap_count".to_string(), self.on_heap_count() as f64);
        metrics.insert("on_disk_count".to_string(), self.on_disk_count() as f64);
        metrics.insert("heap_bytes".to_string(), self.heap_pool.size() as f64);
        if let Some(tier) = self.factories.default_tier() {
            metrics.insert("disk_bytes".to_string(), tier.pool().size() as f64);
        }
        metrics
    }

    fn algorithm_name(&self) -> &'static str {
        "TieredStore"
    }
}

impl<K, V, S> Drop for TieredStore<K, V, S> {
    fn drop(&mut self) {
        // Release tier space and pool bytes held by whatever is still mapped.
        for segment in self.segments.iter() {
            segment.clear();
        }
    }
}

impl<K, V, S> fmt::Debug for TieredStore<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredStore")
            .field("segment_count", &self.segments.len())
            .field("heap_pool", &self.heap_pool)
            .field("factories", &self.factories)
            .finish()
    }
}
