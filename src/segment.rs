//! Store Segment
//!
//! A segment is one independently locked shard of a [`TieredStore`](crate::TieredStore). It owns
//! a power-of-two array of bucket chains behind a single
//! `parking_lot::RwLock`.
//!
//! ```text
//! ┌────────────────────────────── Segment ───────────────────────────────┐
//! │  RwLock<SegmentTable>                                                │
//! │    buckets: [ ● ]──▶ Slot ──▶ Slot ──▶ ∅                             │
//! │             [ ∅ ]                                                    │
//! │             [ ● ]──▶ Slot ──▶ ∅                                      │
//! │    threshold = buckets.len() × load_factor                           │
//! │    cursor    = (bucket, depth)       eviction sampler position       │
//! │                                                                      │
//! │  count, mod_count (atomics, readable without the lock)               │
//! │  FactorySet ─ PoolAccessor(on-heap) ─ StoreMetrics ─ EventListeners  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Locking
//!
//! | Operation | Lock |
//! |-----------|------|
//! | `get`, `get_quiet`, `unretrieved_get`, `contains_*`, `keys`, sampling | read |
//! | `fault`, `try_fault` | read, plus compare-and-swap on the slot |
//! | `put`, `remove`, `replace*`, `evict`, `clear`, `expire_elements` | write |
//!
//! Faulting swaps a slot's representation without changing which keys are
//! mapped, so it only needs to keep the chain structure stable. Several
//! faulters may race on one slot; the compare-and-swap picks exactly one.
//!
//! # Releasing representations
//!
//! Every representation that leaves a slot, and every encoding that never
//! made it into one, is freed after the segment lock has been released.
//! Each operation declares its [`Retired`] list (and receives its
//! [`Encoded`] value) before taking the guard, so scope exit drops the guard
//! first. Listener notifications are likewise dispatched after unlocking.
//!
//! # Eviction sampler
//!
//! There is no recency list. Each slot carries an `accessed` flag, set when
//! it is inserted or read. When a put leaves the store above its maximum
//! size the sampler walks forward from a persistent cursor, clearing flags as
//! it passes, and picks the first slot that is expired or was not accessed
//! since the last pass. If every slot it visits was accessed it falls back
//! to the last one it passed over. The key that was just written is never
//! picked in the pass that follows its own put.

use crate::comparator::ValueComparator;
use crate::config::StoreConfig;
use crate::element::{now_millis, Element};
use crate::error::{Result, StoreError};
use crate::events::EventListeners;
use crate::factory::FactorySet;
use crate::metrics::StoreMetrics;
use crate::pool::PoolAccessor;
use crate::slot::Slot;
use crate::substitute::{Encoded, Retired, Substitute, SubstituteKind};
use core::borrow::Borrow;
use core::fmt;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Bucket tables never grow past this many buckets.
pub(crate) const MAXIMUM_CAPACITY: usize = 1 << 30;

/// How long an operation may wait for the segment lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wait {
    Forever,
    For(Duration),
}

/// A key and the representation it held when sampled.
#[derive(Debug)]
pub struct Sample<K, V> {
    /// The sampled key.
    pub key: K,
    /// Its representation when sampled. Pass it to `evict` to evict only if unchanged.
    pub substitute: Substitute<K, V>,
}

/// Holds a segment's write lock until dropped.
pub struct SegmentLock<'a, K, V> {
    _guard: RwLockWriteGuard<'a, SegmentTable<K, V>>,
}

impl<K, V> fmt::Debug for SegmentLock<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentLock").finish_non_exhaustive()
    }
}

/// Store-wide element count and the size it is held to.
///
/// Segments bump `total` next to their own count, so the store size can be
/// read without visiting every segment.
#[derive(Debug, Default)]
pub(crate) struct SizeBound {
    max_size: AtomicUsize,
    total: AtomicUsize,
}

impl SizeBound {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            max_size: AtomicUsize::new(max_size),
            total: AtomicUsize::new(0),
        }
    }

    pub(crate) fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Relaxed)
    }

    pub(crate) fn set_max_size(&self, max_size: usize) {
        self.max_size.store(max_size, Ordering::Relaxed);
    }

    /// Approximate number of mapped keys across the store.
    pub(crate) fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// How many elements the store holds above its maximum (0 if unbounded).
    pub(crate) fn excess(&self) -> usize {
        match self.max_size() {
            0 => 0,
            max_size => self.total().saturating_sub(max_size),
        }
    }

    fn added(&self) {
        self.total.fetch_add(1, Ordering::Release);
    }

    fn removed(&self, count: usize) {
        self.total.fetch_sub(count, Ordering::Release);
    }
}

/// Collaborators shared by every segment of a store.
pub(crate) struct SegmentShared<K, V> {
    pub(crate) factories: Arc<FactorySet<K, V>>,
    pub(crate) pool: Arc<dyn PoolAccessor>,
    pub(crate) metrics: Arc<StoreMetrics>,
    pub(crate) events: Arc<EventListeners<K, V>>,
    pub(crate) bound: Arc<SizeBound>,
}

impl<K, V> Clone for SegmentShared<K, V> {
    fn clone(&self) -> Self {
        Self {
            factories: Arc::clone(&self.factories),
            pool: Arc::clone(&self.pool),
            metrics: Arc::clone(&self.metrics),
            events: Arc::clone(&self.events),
            bound: Arc::clone(&self.bound),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct EvictionCursor {
    bucket: usize,
    depth: usize,
}

pub(crate) struct SegmentTable<K, V> {
    buckets: Box<[Option<Arc<Slot<K, V>>>]>,
    threshold: usize,
    cursor: EvictionCursor,
}

impl<K, V> SegmentTable<K, V> {
    fn with_capacity(capacity: usize, load_factor: f32) -> Self {
        Self {
            buckets: vec![None; capacity].into_boxed_slice(),
            threshold: threshold_for(capacity, load_factor),
            cursor: EvictionCursor::default(),
        }
    }

    #[inline]
    fn index(&self, hash: u32) -> usize {
        hash as usize & (self.buckets.len() - 1)
    }

    fn find<Q>(&self, key: &Q, hash: u32) -> Option<&Arc<Slot<K, V>>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut current = self.buckets[self.index(hash)].as_ref();
        while let Some(slot) = current {
            if slot.matches(key, hash) {
                return Some(slot);
            }
            current = slot.next();
        }
        None
    }

    fn slots(&self) -> impl Iterator<Item = &Arc<Slot<K, V>>> + '_ {
        self.buckets.iter().flat_map(|head| {
            let mut current = head.as_ref();
            core::iter::from_fn(move || {
                let slot = current?;
                current = slot.next();
                Some(slot)
            })
        })
    }

    fn nth_in_bucket(&self, bucket: usize, depth: usize) -> Option<&Arc<Slot<K, V>>> {
        let mut current = self.buckets[bucket].as_ref();
        for _ in 0..depth {
            current = current?.next();
        }
        current
    }
}

#[inline]
fn threshold_for(capacity: usize, load_factor: f32) -> usize {
    (capacity as f64 * f64::from(load_factor)) as usize
}

#[derive(Debug, Default)]
struct KindCounts {
    resident: AtomicUsize,
    placeholder: AtomicUsize,
    marker: AtomicUsize,
}

impl KindCounts {
    fn counter(&self, kind: SubstituteKind) -> &AtomicUsize {
        match kind {
            SubstituteKind::Resident => &self.resident,
            SubstituteKind::Placeholder => &self.placeholder,
            SubstituteKind::Marker => &self.marker,
        }
    }

    fn add(&self, kind: SubstituteKind) {
        self.counter(kind).fetch_add(1, Ordering::Relaxed);
    }

    fn sub(&self, kind: SubstituteKind) {
        self.counter(kind).fetch_sub(1, Ordering::Relaxed);
    }

    fn moved(&self, from: SubstituteKind, to: SubstituteKind) {
        if from != to {
            self.sub(from);
            self.add(to);
        }
    }

    fn get(&self, kind: SubstituteKind) -> usize {
        self.counter(kind).load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.resident.store(0, Ordering::Relaxed);
        self.placeholder.store(0, Ordering::Relaxed);
        self.marker.store(0, Ordering::Relaxed);
    }
}

/// A mapping change to report once the lock is released.
enum Notice<K, V> {
    Put(Arc<Element<K, V>>),
    Updated(Arc<Element<K, V>>, Arc<Element<K, V>>),
    Removed(Arc<Element<K, V>>),
    Evicted(Arc<Element<K, V>>),
    Expired(Arc<Element<K, V>>),
}

/// One shard of a tiered store.
pub(crate) struct Segment<K, V> {
    table: RwLock<SegmentTable<K, V>>,
    count: AtomicUsize,
    mod_count: AtomicU64,
    load_factor: f32,
    max_eviction_rounds: usize,
    kinds: KindCounts,
    factories: Arc<FactorySet<K, V>>,
    pool: Arc<dyn PoolAccessor>,
    metrics: Arc<StoreMetrics>,
    events: Arc<EventListeners<K, V>>,
    bound: Arc<SizeBound>,
}

impl<K, V> Segment<K, V>
where
    K: Eq + Clone + Send + Sync,
    V: Send + Sync,
{
    pub(crate) fn new(config: &StoreConfig, shared: SegmentShared<K, V>) -> Self {
        let capacity = config.segment_capacity().min(MAXIMUM_CAPACITY);
        Self {
            table: RwLock::new(SegmentTable::with_capacity(capacity, config.load_factor)),
            count: AtomicUsize::new(0),
            mod_count: AtomicU64::new(0),
            load_factor: config.load_factor,
            max_eviction_rounds: config.max_eviction_rounds,
            kinds: KindCounts::default(),
            factories: shared.factories,
            pool: shared.pool,
            metrics: shared.metrics,
            events: shared.events,
            bound: shared.bound,
        }
    }

    /// Number of mapped keys.
    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Number of structural modifications so far.
    #[inline]
    pub(crate) fn mod_count(&self) -> u64 {
        self.mod_count.load(Ordering::Acquire)
    }

    pub(crate) fn kind_count(&self, kind: SubstituteKind) -> usize {
        self.kinds.get(kind)
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.table.read().buckets.len()
    }

    fn write(&self, wait: Wait) -> Result<RwLockWriteGuard<'_, SegmentTable<K, V>>> {
        match wait {
            Wait::Forever => Ok(self.table.write()),
            Wait::For(timeout) => self
                .table
                .try_write_for(timeout)
                .ok_or(StoreError::LockTimeout(timeout)),
        }
    }

    fn read(&self, wait: Wait) -> Result<RwLockReadGuard<'_, SegmentTable<K, V>>> {
        match wait {
            Wait::Forever => Ok(self.table.read()),
            Wait::For(timeout) => self
                .table
                .try_read_for(timeout)
                .ok_or(StoreError::LockTimeout(timeout)),
        }
    }

    /// Takes the write lock and hands it to the caller.
    pub(crate) fn lock(&self, wait: Wait) -> Result<SegmentLock<'_, K, V>> {
        Ok(SegmentLock {
            _guard: self.write(wait)?,
        })
    }

    /// Holds the read lock so that `count` cannot change.
    pub(crate) fn read_lock(&self) -> RwLockReadGuard<'_, SegmentTable<K, V>> {
        self.table.read()
    }

    fn refused(&self, requested: u64) -> StoreError {
        self.metrics.record_refusal();
        debug!(region = %self.pool.region(), requested, "pool refused admission");
        StoreError::CapacityRefused {
            region: self.pool.region(),
            requested,
        }
    }

    /// Decodes the slot's current value, following it if a concurrent fault
    /// replaced it while the read was in flight.
    fn decode_slot(&self, slot: &Slot<K, V>) -> Result<(Substitute<K, V>, Arc<Element<K, V>>)> {
        let mut substitute = slot.load();
        loop {
            match self.factories.decode(slot.key(), &substitute) {
                Ok(element) => return Ok((substitute, element)),
                Err(err) => {
                    let latest = slot.load();
                    if latest.same(&substitute) {
                        return Err(err);
                    }
                    substitute = latest;
                }
            }
        }
    }

    fn dispatch(&self, notices: Vec<Notice<K, V>>) {
        if self.events.is_empty() {
            return;
        }
        for notice in &notices {
            match notice {
                Notice::Put(element) => self.events.notify_put(element),
                Notice::Updated(old, new) => self.events.notify_updated(old, new),
                Notice::Removed(element) => self.events.notify_removed(element),
                Notice::Evicted(element) => self.events.notify_evicted(element),
                Notice::Expired(element) => self.events.notify_expired(element),
            }
        }
    }

    /// Looks up `key`, records the access and returns its element.
    pub(crate) fn get<Q>(
        &self,
        key: &Q,
        hash: u32,
        wait: Wait,
    ) -> Result<Option<Arc<Element<K, V>>>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let table = self.read(wait)?;
        let Some(slot) = table.find(key, hash) else {
            self.metrics.record_miss();
            return Ok(None);
        };
        slot.mark_accessed();
        match self.decode_slot(slot) {
            Ok((substitute, element)) => {
                element.touch();
                match substitute {
                    Substitute::Marker(marker) => {
                        marker.touch();
                        self.metrics.record_tier_hit();
                    }
                    Substitute::Resident(_) | Substitute::Placeholder(_) => {
                        self.metrics.record_heap_hit()
                    }
                }
                Ok(Some(element))
            }
            Err(err) => {
                self.metrics.record_miss();
                warn!(error = %err, "failed to decode stored element");
                Err(err)
            }
        }
    }

    /// Looks up `key` without touching access metadata or statistics.
    pub(crate) fn get_quiet<Q>(
        &self,
        key: &Q,
        hash: u32,
        wait: Wait,
    ) -> Result<Option<Arc<Element<K, V>>>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let table = self.read(wait)?;
        match table.find(key, hash) {
            Some(slot) => Ok(Some(self.decode_slot(slot)?.1)),
            None => Ok(None),
        }
    }

    /// Returns the raw representation mapped to `key`.
    pub(crate) fn unretrieved_get<Q>(&self, key: &Q, hash: u32) -> Option<Substitute<K, V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let table = self.table.read();
        table.find(key, hash).map(|slot| slot.load())
    }

    pub(crate) fn contains_key<Q>(&self, key: &Q, hash: u32) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        if self.count() == 0 {
            return false;
        }
        self.table.read().find(key, hash).is_some()
    }

    /// Returns `true` if any element in this segment holds `value`.
    ///
    /// Elements on the secondary tier are read back to compare them.
    pub(crate) fn contains_value(&self, value: &V) -> Result<bool>
    where
        V: PartialEq,
    {
        if self.count() == 0 {
            return Ok(false);
        }
        let table = self.table.read();
        for slot in table.slots() {
            if self.decode_slot(slot)?.1.value() == value {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Maps `key` to `element`.
    ///
    /// Returns the element previously mapped, or with `only_if_absent` the
    /// element that kept its mapping.
    pub(crate) fn put(
        &self,
        key: K,
        hash: u32,
        element: Arc<Element<K, V>>,
        only_if_absent: bool,
        wait: Wait,
    ) -> Result<Option<Arc<Element<K, V>>>> {
        let mut encoded = self.factories.encode(&key, Arc::clone(&element))?;
        let mut retired = Retired::new(&self.factories);
        let mut notices = Vec::new();

        let (previous, installed) = {
            let mut table = self.write(wait)?;
            if self.count.load(Ordering::Relaxed) + 1 > table.threshold {
                self.rehash(&mut table);
            }

            let (previous, installed) = match table.find(&key, hash).cloned() {
                Some(slot) => {
                    let (_, old_element) = self.decode_slot(&slot)?;
                    if only_if_absent {
                        (Some(old_element), None)
                    } else {
                        let installed = self.swap_value(&slot, &mut encoded, &mut retired)?;
                        slot.mark_accessed();
                        self.metrics.record_update();
                        notices.push(Notice::Updated(Arc::clone(&old_element), element));
                        (Some(old_element), Some(installed))
                    }
                }
                None => {
                    let installed = self.link(&mut table, key.clone(), hash, &mut encoded)?;
                    self.metrics.record_put();
                    notices.push(Notice::Put(element));
                    (None, Some(installed))
                }
            };

            if installed.is_some() {
                self.evict_over_limit(&mut table, Some(&key), &mut retired, &mut notices);
            }
            (previous, installed)
        };

        if let Some(installed) = installed {
            self.factories.installed(&key, &installed);
        }
        self.dispatch(notices);
        Ok(previous)
    }

    /// Inserts an already encoded representation under a key that must not
    /// be mapped yet.
    ///
    /// # Errors
    ///
    /// [`StoreError::DuplicateKey`] if `key` is mapped; the encoding is freed.
    pub(crate) fn put_raw_if_absent(
        &self,
        key: K,
        hash: u32,
        mut encoded: Encoded<'_, K, V>,
    ) -> Result<()> {
        let installed = {
            let mut table = self.write(Wait::Forever)?;
            if table.find(&key, hash).is_some() {
                return Err(StoreError::DuplicateKey);
            }
            if self.count.load(Ordering::Relaxed) + 1 > table.threshold {
                self.rehash(&mut table);
            }
            self.link(&mut table, key.clone(), hash, &mut encoded)?
        };
        self.factories.installed(&key, &installed);
        Ok(())
    }

    /// Prepends a new slot holding `encoded`. Caller holds the write lock
    /// and has checked that `key` is absent.
    fn link(
        &self,
        table: &mut SegmentTable<K, V>,
        key: K,
        hash: u32,
        encoded: &mut Encoded<'_, K, V>,
    ) -> Result<Substitute<K, V>> {
        let size = encoded.substitute().heap_size();
        if self.pool.add(size, false).is_none() {
            return Err(self.refused(size));
        }
        let installed = encoded.disarm();
        let index = table.index(hash);
        let head = table.buckets[index].take();
        table.buckets[index] = Some(Arc::new(Slot::new(key, hash, head, installed.clone())));
        self.kinds.add(installed.kind());
        self.mod_count.fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Release);
        self.bound.added();
        Ok(installed)
    }

    /// Swaps `encoded` into `slot`, retiring the previous value. Caller holds
    /// the write lock.
    fn swap_value(
        &self,
        slot: &Slot<K, V>,
        encoded: &mut Encoded<'_, K, V>,
        retired: &mut Retired<'_, K, V>,
    ) -> Result<Substitute<K, V>> {
        let old_size = slot.load().heap_size();
        let new_size = encoded.substitute().heap_size();
        if self.pool.replace(old_size, new_size, false).is_none() {
            return Err(self.refused(new_size));
        }
        let installed = encoded.disarm();
        let previous = slot.swap(installed.clone());
        self.kinds.moved(previous.kind(), installed.kind());
        retired.push(previous);
        Ok(installed)
    }

    /// Splices `target` out of bucket `index` by rebuilding the part of the
    /// chain in front of it. Caller holds the write lock.
    fn unlink(
        &self,
        table: &mut SegmentTable<K, V>,
        index: usize,
        target: &Arc<Slot<K, V>>,
    ) -> Substitute<K, V> {
        let mut new_first = target.next().cloned();
        let mut current = table.buckets[index].clone();
        while let Some(slot) = current {
            if Arc::ptr_eq(&slot, target) {
                break;
            }
            new_first = Some(Arc::new(slot.relink(new_first)));
            current = slot.next().cloned();
        }
        table.buckets[index] = new_first;

        let substitute = target.load();
        self.pool.delete(substitute.heap_size());
        self.kinds.sub(substitute.kind());
        self.mod_count.fetch_add(1, Ordering::Relaxed);
        self.count.fetch_sub(1, Ordering::Release);
        self.bound.removed(1);
        substitute
    }

    /// Removes `key`, optionally only if its element matches `expected`.
    ///
    /// Returns the removed element. When nothing matches, nothing changes.
    pub(crate) fn remove<Q>(
        &self,
        key: &Q,
        hash: u32,
        expected: Option<(&Element<K, V>, &dyn ValueComparator<K, V>)>,
        wait: Wait,
    ) -> Result<Option<Arc<Element<K, V>>>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut retired = Retired::new(&self.factories);
        let removed = {
            let mut table = self.write(wait)?;
            let Some(slot) = table.find(key, hash).cloned() else {
                return Ok(None);
            };
            let (_, current) = self.decode_slot(&slot)?;
            if let Some((expected, comparator)) = expected {
                if !comparator.equals(&current, expected) {
                    return Ok(None);
                }
            }
            let index = table.index(hash);
            retired.push(self.unlink(&mut table, index, &slot));
            self.metrics.record_removal();
            current
        };
        self.dispatch(vec![Notice::Removed(Arc::clone(&removed))]);
        Ok(Some(removed))
    }

    /// Replaces whatever `key` maps to, returning the previous element.
    /// Absent keys stay absent.
    pub(crate) fn replace(
        &self,
        key: &K,
        hash: u32,
        element: Arc<Element<K, V>>,
        wait: Wait,
    ) -> Result<Option<Arc<Element<K, V>>>> {
        let mut encoded = self.factories.encode(key, Arc::clone(&element))?;
        let mut retired = Retired::new(&self.factories);
        let (previous, installed) = {
            let table = self.write(wait)?;
            let Some(slot) = table.find(key, hash) else {
                return Ok(None);
            };
            let (_, previous) = self.decode_slot(slot)?;
            let installed = self.swap_value(slot, &mut encoded, &mut retired)?;
            self.metrics.record_update();
            (previous, installed)
        };
        self.factories.installed(key, &installed);
        self.dispatch(vec![Notice::Updated(Arc::clone(&previous), element)]);
        Ok(Some(previous))
    }

    /// Replaces the element mapped to `key` only if it matches `old`.
    pub(crate) fn replace_if(
        &self,
        key: &K,
        hash: u32,
        old: &Element<K, V>,
        element: Arc<Element<K, V>>,
        comparator: &dyn ValueComparator<K, V>,
        wait: Wait,
    ) -> Result<bool> {
        let mut encoded = self.factories.encode(key, Arc::clone(&element))?;
        let mut retired = Retired::new(&self.factories);
        let (previous, installed) = {
            let table = self.write(wait)?;
            let Some(slot) = table.find(key, hash) else {
                return Ok(false);
            };
            let (_, current) = self.decode_slot(slot)?;
            if !comparator.equals(&current, old) {
                return Ok(false);
            }
            let installed = self.swap_value(slot, &mut encoded, &mut retired)?;
            self.metrics.record_update();
            (current, installed)
        };
        self.factories.installed(key, &installed);
        self.dispatch(vec![Notice::Updated(previous, element)]);
        Ok(true)
    }

    /// Swaps the representation of `key` from `expect` to `encoded` under
    /// the read lock.
    ///
    /// Returns `Ok(false)` when the slot no longer holds `expect` (or the
    /// key is gone, or `blocking` is off and the lock is contended); the
    /// encoding is then freed after the lock is released.
    pub(crate) fn fault(
        &self,
        key: &K,
        hash: u32,
        expect: &Substitute<K, V>,
        mut encoded: Encoded<'_, K, V>,
        blocking: bool,
    ) -> Result<bool> {
        let mut retired = Retired::new(&self.factories);
        let table = if blocking {
            self.table.read()
        } else {
            match self.table.try_read() {
                Some(table) => table,
                None => return Ok(false),
            }
        };

        let Some(slot) = table.find(key, hash) else {
            self.metrics.record_fault_race_lost();
            trace!("fault target was removed");
            return Ok(false);
        };
        let current = slot.load();
        if !current.same(expect) {
            self.metrics.record_fault_race_lost();
            trace!("fault target changed before the swap");
            return Ok(false);
        }

        let new_size = encoded.substitute().heap_size();
        let growth = new_size.saturating_sub(current.heap_size());
        if growth > 0 && !self.pool.can_add_without_evicting(growth) {
            return Err(self.refused(growth));
        }

        match slot.compare_and_swap(expect, encoded.substitute().clone()) {
            Ok(previous) => {
                let installed = encoded.disarm();
                self.pool.replace(previous.heap_size(), new_size, true);
                self.kinds.moved(previous.kind(), installed.kind());
                self.metrics.record_fault();
                retired.push(previous);
                Ok(true)
            }
            Err(_) => {
                self.metrics.record_fault_race_lost();
                trace!("lost fault race");
                Ok(false)
            }
        }
    }

    /// Removes `key` if it still holds `expected` (any value when `None`).
    ///
    /// Never waits for the lock: a contended segment returns `Ok(None)`.
    pub(crate) fn evict<Q>(
        &self,
        key: &Q,
        hash: u32,
        expected: Option<&Substitute<K, V>>,
    ) -> Result<Option<Arc<Element<K, V>>>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut retired = Retired::new(&self.factories);
        let mut notices = Vec::new();
        let evicted = {
            let Some(mut table) = self.table.try_write() else {
                return Ok(None);
            };
            let Some(slot) = table.find(key, hash).cloned() else {
                return Ok(None);
            };
            if let Some(expected) = expected {
                if !slot.load().same(expected) {
                    return Ok(None);
                }
            }
            let index = table.index(hash);
            self.retire_victim(&mut table, index, &slot, now_millis(), &mut retired, &mut notices)
        };
        self.dispatch(notices);
        Ok(evicted)
    }

    /// Unlinks a slot chosen for eviction or expiry and records why.
    fn retire_victim(
        &self,
        table: &mut SegmentTable<K, V>,
        index: usize,
        victim: &Arc<Slot<K, V>>,
        now: u64,
        retired: &mut Retired<'_, K, V>,
        notices: &mut Vec<Notice<K, V>>,
    ) -> Option<Arc<Element<K, V>>> {
        let element = match self.decode_slot(victim) {
            Ok((_, element)) => Some(element),
            Err(err) => {
                warn!(error = %err, "evicting an element that cannot be decoded");
                None
            }
        };
        let substitute = self.unlink(table, index, victim);
        let expired = substitute.is_expired_at(now);
        retired.push(substitute);
        if expired {
            self.metrics.record_expiration();
        } else {
            self.metrics.record_eviction();
        }
        if let Some(element) = &element {
            trace!(expired, "removed victim");
            notices.push(if expired {
                Notice::Expired(Arc::clone(element))
            } else {
                Notice::Evicted(Arc::clone(element))
            });
        }
        element
    }

    /// Runs the sampler on this segment while the store is above its
    /// maximum size, for at most `max_eviction_rounds` victims.
    fn evict_over_limit(
        &self,
        table: &mut SegmentTable<K, V>,
        just_added: Option<&K>,
        retired: &mut Retired<'_, K, V>,
        notices: &mut Vec<Notice<K, V>>,
    ) {
        let rounds = self.bound.excess().min(self.max_eviction_rounds);
        let now = now_millis();
        for _ in 0..rounds {
            let Some(victim) = self.next_expired_or_to_evict(table, just_added, now) else {
                break;
            };
            let index = table.index(victim.hash());
            self.retire_victim(table, index, &victim, now, retired, notices);
        }
    }

    /// Evicts from this segment while the store is above its maximum size,
    /// for at most `budget` victims. Used when the segment a put landed in
    /// had nothing left to give up.
    pub(crate) fn evict_excess(&self, budget: usize, wait: Wait) -> Result<usize> {
        if budget == 0 || self.count() == 0 || self.bound.excess() == 0 {
            return Ok(0);
        }
        let mut retired = Retired::new(&self.factories);
        let mut notices = Vec::new();
        let evicted = {
            let mut table = self.write(wait)?;
            let rounds = self.bound.excess().min(budget);
            let now = now_millis();
            let mut evicted = 0;
            for _ in 0..rounds {
                let Some(victim) = self.next_expired_or_to_evict(&mut table, None, now) else {
                    break;
                };
                let index = table.index(victim.hash());
                self.retire_victim(&mut table, index, &victim, now, &mut retired, &mut notices);
                evicted += 1;
            }
            evicted
        };
        self.dispatch(notices);
        Ok(evicted)
    }

    /// Picks the next eviction candidate, advancing the cursor.
    ///
    /// The caller unlinks the returned slot, so the cursor is saved as if
    /// that slot were already gone.
    fn next_expired_or_to_evict(
        &self,
        table: &mut SegmentTable<K, V>,
        just_added: Option<&K>,
        now: u64,
    ) -> Option<Arc<Slot<K, V>>> {
        let len = table.buckets.len();
        let count = self.count.load(Ordering::Relaxed);
        let EvictionCursor { mut bucket, mut depth } = table.cursor;
        bucket %= len;

        let mut chosen: Option<(Arc<Slot<K, V>>, EvictionCursor)> = None;
        let mut visited = 0;
        let mut advances = 0;
        while visited < count && advances <= 2 * len {
            let Some(slot) = table.nth_in_bucket(bucket, depth).cloned() else {
                bucket = (bucket + 1) % len;
                depth = 0;
                advances += 1;
                continue;
            };
            let position = EvictionCursor { bucket, depth };
            depth += 1;
            visited += 1;
            if just_added.is_some_and(|key| slot.key() == key) {
                continue;
            }
            let found = slot.load().is_expired_at(now) || !slot.take_accessed();
            chosen = Some((slot, position));
            if found {
                break;
            }
        }

        let Some((victim, position)) = chosen else {
            table.cursor = EvictionCursor { bucket, depth };
            return None;
        };
        if position.bucket == bucket && position.depth < depth {
            depth -= 1;
        }
        table.cursor = EvictionCursor { bucket, depth };
        Some(victim)
    }

    /// Doubles the bucket table. Caller holds the write lock.
    ///
    /// The trailing run of each chain whose slots all land in the same new
    /// bucket is reused as is; only the slots in front of it are cloned.
    fn rehash(&self, table: &mut SegmentTable<K, V>) {
        let old_len = table.buckets.len();
        if old_len >= MAXIMUM_CAPACITY {
            return;
        }
        let new_len = old_len << 1;
        let mask = new_len - 1;
        let mut buckets: Vec<Option<Arc<Slot<K, V>>>> = vec![None; new_len];

        for head in table.buckets.iter() {
            let Some(first) = head else {
                continue;
            };
            let first_index = first.hash() as usize & mask;
            if first.next().is_none() {
                buckets[first_index] = Some(Arc::clone(first));
                continue;
            }

            let mut last_run = first;
            let mut last_index = first_index;
            let mut current = first.next();
            while let Some(slot) = current {
                let index = slot.hash() as usize & mask;
                if index != last_index {
                    last_index = index;
                    last_run = slot;
                }
                current = slot.next();
            }
            buckets[last_index] = Some(Arc::clone(last_run));

            let mut current = Some(first);
            while let Some(slot) = current {
                if Arc::ptr_eq(slot, last_run) {
                    break;
                }
                let index = slot.hash() as usize & mask;
                let next = buckets[index].take();
                buckets[index] = Some(Arc::new(slot.relink(next)));
                current = slot.next();
            }
        }

        table.buckets = buckets.into_boxed_slice();
        table.threshold = threshold_for(new_len, self.load_factor);
        table.cursor = EvictionCursor::default();
        self.metrics.record_rehash();
        debug!(from = old_len, to = new_len, "rehashed segment");
    }

    /// Removes every expired element. Returns how many were removed.
    pub(crate) fn expire_elements(&self, wait: Wait) -> Result<usize> {
        let mut retired = Retired::new(&self.factories);
        let mut notices = Vec::new();
        let expired = {
            let mut table = self.write(wait)?;
            let now = now_millis();
            let expired: Vec<(K, u32)> = table
                .slots()
                .filter(|slot| slot.load().is_expired_at(now))
                .map(|slot| (slot.key().clone(), slot.hash()))
                .collect();
            // Unlinking rebuilds chain prefixes, so look every victim up again.
            for (key, hash) in &expired {
                if let Some(victim) = table.find(key, *hash).cloned() {
                    let index = table.index(*hash);
                    self.retire_victim(&mut table, index, &victim, now, &mut retired, &mut notices);
                }
            }
            expired.len()
        };
        self.dispatch(notices);
        Ok(expired)
    }

    /// Appends up to `sample_size` entries accepted by `filter` to `out`,
    /// starting at a bucket chosen from `seed` and wrapping around once.
    pub(crate) fn add_random_sample(
        &self,
        filter: &dyn Fn(&Substitute<K, V>) -> bool,
        sample_size: usize,
        seed: u32,
        out: &mut Vec<Sample<K, V>>,
    ) {
        if self.count() == 0 || out.len() >= sample_size {
            return;
        }
        let table = self.table.read();
        let len = table.buckets.len();
        let start = seed as usize & (len - 1);
        for offset in 0..len {
            let mut current = table.buckets[(start + offset) & (len - 1)].as_ref();
            while let Some(slot) = current {
                let substitute = slot.load();
                if filter(&substitute) {
                    out.push(Sample {
                        key: slot.key().clone(),
                        substitute,
                    });
                    if out.len() >= sample_size {
                        return;
                    }
                }
                current = slot.next();
            }
        }
    }

    /// Snapshot of the mapped keys.
    pub(crate) fn keys(&self) -> Vec<K> {
        let table = self.table.read();
        table.slots().map(|slot| slot.key().clone()).collect()
    }
}

impl<K, V> Segment<K, V> {
    /// Drops every mapping and releases its pool bytes.
    pub(crate) fn clear(&self) {
        let mut retired = Retired::new(&self.factories);
        let mut table = self.table.write();
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return;
        }
        for head in table.buckets.iter_mut() {
            let mut current = head.take();
            while let Some(slot) = current {
                let substitute = slot.load();
                self.pool.delete(substitute.heap_size());
                retired.push(substitute);
                current = slot.next().cloned();
            }
        }
        table.cursor = EvictionCursor::default();
        self.kinds.reset();
        self.mod_count.fetch_add(1, Ordering::Relaxed);
        self.count.store(0, Ordering::Release);
        self.bound.removed(count);
        drop(table);
    }
}

impl<K, V> fmt::Debug for Segment<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("count", &self.count.load(Ordering::Relaxed))
            .field("mod_count", &self.mod_count.load(Ordering::Relaxed))
            .field("max_size", &self.bound.max_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::DefaultComparator;
    use crate::pool::{BoundedPool, PoolRegion};
    use crate::substitute::FactoryId;
    use crate::tier::MemoryTier;
    use crate::factory::TierFactory;
    use std::thread;

    type TestSegment = Segment<u32, String>;

    struct Fixture {
        segment: TestSegment,
        heap: Arc<BoundedPool>,
        metrics: Arc<StoreMetrics>,
    }

    fn fixture_with(config: StoreConfig, heap_budget: u64) -> Fixture {
        let heap = Arc::new(BoundedPool::new(PoolRegion::OnHeap, heap_budget));
        let metrics = Arc::new(StoreMetrics::new());
        let shared = SegmentShared {
            factories: Arc::new(FactorySet::new()),
            pool: heap.clone(),
            metrics: Arc::clone(&metrics),
            events: Arc::new(EventListeners::new()),
            bound: Arc::new(SizeBound::new(config.max_size)),
        };
        Fixture {
            segment: Segment::new(&config, shared),
            heap,
            metrics,
        }
    }

    fn fixture() -> Fixture {
        let config = StoreConfig::new().with_segments(1).with_initial_capacity(16);
        fixture_with(config, u64::MAX)
    }

    fn element(key: u32, value: &str) -> Arc<Element<u32, String>> {
        Arc::new(Element::with_size(key, value.to_string(), 10))
    }

    fn put(segment: &TestSegment, key: u32, value: &str) -> Option<Arc<Element<u32, String>>> {
        segment
            .put(key, key, element(key, value), false, Wait::Forever)
            .unwrap()
    }

    fn value_of(segment: &TestSegment, key: u32) -> Option<String> {
        segment
            .get_quiet(&key, key, Wait::Forever)
            .unwrap()
            .map(|e| e.value().clone())
    }

    #[test]
    fn test_put_get_basic() {
        let f = fixture();
        assert!(put(&f.segment, 1, "one").is_none());
        assert_eq!(f.segment.count(), 1);
        let found = f.segment.get(&1, 1, Wait::Forever).unwrap().unwrap();
        assert_eq!(found.value(), "one");
        assert_eq!(found.hit_count(), 1);
        assert!(f.segment.get(&2, 2, Wait::Forever).unwrap().is_none());

        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.heap_hits, 1);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(f.heap.size(), 10);
    }

    #[test]
    fn test_put_existing_returns_previous() {
        let f = fixture();
        put(&f.segment, 1, "v1");
        let previous = put(&f.segment, 1, "v2").unwrap();
        assert_eq!(previous.value(), "v1");
        assert_eq!(value_of(&f.segment, 1).as_deref(), Some("v2"));
        assert_eq!(f.segment.count(), 1);
        assert_eq!(f.heap.size(), 10);
    }

    #[test]
    fn test_put_if_absent_keeps_existing() {
        let f = fixture();
        put(&f.segment, 1, "v1");
        let existing = f
            .segment
            .put(1, 1, element(1, "v2"), true, Wait::Forever)
            .unwrap()
            .unwrap();
        assert_eq!(existing.value(), "v1");
        assert_eq!(value_of(&f.segment, 1).as_deref(), Some("v1"));
    }

    #[test]
    fn test_get_quiet_skips_bookkeeping() {
        let f = fixture();
        put(&f.segment, 1, "one");
        let found = f.segment.get_quiet(&1, 1, Wait::Forever).unwrap().unwrap();
        assert_eq!(found.hit_count(), 0);
        assert_eq!(f.metrics.snapshot().requests(), 0);
    }

    #[test]
    fn test_rehash_keeps_every_key() {
        let f = fixture();
        assert_eq!(f.segment.bucket_count(), 16);
        for key in 0..20 {
            put(&f.segment, key, &format!("v{}", key));
        }
        assert!(f.segment.bucket_count() >= 32);
        assert!(f.metrics.snapshot().rehashes >= 1);
        assert_eq!(f.segment.count(), 20);
        for key in 0..20 {
            assert_eq!(value_of(&f.segment, key), Some(format!("v{}", key)));
        }
    }

    #[test]
    fn test_rehash_with_colliding_chains() {
        let f = fixture();
        // Hashes that share the low bits but split once the table doubles.
        let keys: Vec<u32> = (0..40).map(|i| i * 16).collect();
        for &key in &keys {
            f.segment
                .put(key, key, element(key, "x"), false, Wait::Forever)
                .unwrap();
        }
        assert_eq!(f.segment.count(), keys.len());
        for &key in &keys {
            assert!(f.segment.contains_key(&key, key), "lost key {}", key);
        }
        let mut all = f.segment.keys();
        all.sort_unstable();
        assert_eq!(all, keys);
    }

    #[test]
    fn test_remove_absent_changes_nothing() {
        let f = fixture();
        put(&f.segment, 1, "one");
        let mod_count = f.segment.mod_count();
        assert!(f.segment.remove(&9, 9, None, Wait::Forever).unwrap().is_none());
        assert_eq!(f.segment.count(), 1);
        assert_eq!(f.segment.mod_count(), mod_count);
    }

    #[test]
    fn test_remove_splices_chain() {
        let f = fixture();
        // All in bucket 0, chain order 48 -> 32 -> 16 -> 0.
        for key in [0, 16, 32, 48] {
            put(&f.segment, key, "v");
        }
        let removed = f.segment.remove(&16, 16, None, Wait::Forever).unwrap().unwrap();
        assert_eq!(*removed.key(), 16);
        assert_eq!(f.segment.count(), 3);
        for key in [0, 32, 48] {
            assert!(f.segment.contains_key(&key, key));
        }
        assert!(!f.segment.contains_key(&16, 16));
        assert_eq!(f.heap.size(), 30);
    }

    #[test]
    fn test_conditional_remove() {
        let f = fixture();
        put(&f.segment, 1, "one");
        let wrong = Element::with_size(1, "other".to_string(), 10);
        let right = Element::with_size(1, "one".to_string(), 10);
        assert!(f
            .segment
            .remove(&1, 1, Some((&wrong, &DefaultComparator)), Wait::Forever)
            .unwrap()
            .is_none());
        assert!(f
            .segment
            .remove(&1, 1, Some((&right, &DefaultComparator)), Wait::Forever)
            .unwrap()
            .is_some());
        assert_eq!(f.segment.count(), 0);
    }

    #[test]
    fn test_replace_forms() {
        let f = fixture();
        assert!(f
            .segment
            .replace(&1, 1, element(1, "x"), Wait::Forever)
            .unwrap()
            .is_none());
        assert_eq!(f.segment.count(), 0);

        put(&f.segment, 1, "a");
        let previous = f
            .segment
            .replace(&1, 1, element(1, "b"), Wait::Forever)
            .unwrap()
            .unwrap();
        assert_eq!(previous.value(), "a");

        let stale = Element::with_size(1, "a".to_string(), 10);
        let current = Element::with_size(1, "b".to_string(), 10);
        assert!(!f
            .segment
            .replace_if(&1, 1, &stale, element(1, "c"), &DefaultComparator, Wait::Forever)
            .unwrap());
        assert!(f
            .segment
            .replace_if(&1, 1, &current, element(1, "c"), &DefaultComparator, Wait::Forever)
            .unwrap());
        assert_eq!(value_of(&f.segment, 1).as_deref(), Some("c"));
    }

    #[test]
    fn test_refused_put_leaves_counts_intact() {
        let config = StoreConfig::new().with_segments(1);
        let f = fixture_with(config, 25);
        put(&f.segment, 1, "a");
        put(&f.segment, 2, "b");
        let err = f
            .segment
            .put(3, 3, element(3, "c"), false, Wait::Forever)
            .unwrap_err();
        assert!(matches!(err, StoreError::CapacityRefused { requested: 10, .. }));
        assert_eq!(f.segment.count(), 2);
        assert_eq!(f.heap.size(), 20);
        assert!(!f.segment.contains_key(&3, 3));
        assert_eq!(f.metrics.snapshot().refusals, 1);
    }

    #[test]
    fn test_put_raw_if_absent_rejects_duplicates() {
        let f = fixture();
        let factories = Arc::clone(&f.segment.factories);
        let raw = factories.adopt(Substitute::Resident(element(1, "raw")));
        f.segment.put_raw_if_absent(1, 1, raw).unwrap();
        let again = factories.adopt(Substitute::Resident(element(1, "again")));
        assert!(matches!(
            f.segment.put_raw_if_absent(1, 1, again),
            Err(StoreError::DuplicateKey)
        ));
        assert_eq!(value_of(&f.segment, 1).as_deref(), Some("raw"));
        assert_eq!(f.segment.count(), 1);
    }

    #[test]
    fn test_sampler_evicts_down_to_max() {
        let config = StoreConfig::new()
            .with_segments(1)
            .with_initial_capacity(64)
            .with_max_size(10);
        let f = fixture_with(config, u64::MAX);
        for key in 0..50 {
            put(&f.segment, key, "v");
            assert!(f.segment.contains_key(&key, key), "just-added key evicted");
            assert!(f.segment.count() <= 10);
        }
        assert_eq!(f.metrics.snapshot().evictions, 40);
        assert_eq!(f.heap.size(), 100);
    }

    #[test]
    fn test_sampler_prefers_unaccessed() {
        let config = StoreConfig::new()
            .with_segments(1)
            .with_initial_capacity(64)
            .with_max_size(3);
        let f = fixture_with(config, u64::MAX);
        for key in 0..3 {
            put(&f.segment, key, "v");
        }
        // First pass clears every flag and falls back; afterwards a read
        // keeps key 0 safe from the next pass.
        put(&f.segment, 3, "v");
        assert_eq!(f.segment.count(), 3);
        let survivor = (0..3).find(|k| f.segment.contains_key(k, *k)).unwrap();
        f.segment.get(&survivor, survivor, Wait::Forever).unwrap();
        put(&f.segment, 4, "v");
        assert!(f.segment.contains_key(&survivor, survivor));
        assert!(f.segment.contains_key(&4, 4));
    }

    #[test]
    fn test_sampler_cursor_resumes_at_slot_after_victim() {
        let f = fixture();
        // Keys double as hashes, so all four share bucket 0: 48 -> 32 -> 16 -> 0.
        for key in [0, 16, 32, 48] {
            put(&f.segment, key, "v");
        }
        let mut table = f.segment.table.write();
        for slot in table.slots() {
            slot.take_accessed();
        }
        let now = now_millis();
        let mut order = Vec::new();
        while let Some(victim) = f.segment.next_expired_or_to_evict(&mut table, None, now) {
            order.push(*victim.key());
            let index = table.index(victim.hash());
            f.segment.unlink(&mut table, index, &victim);
        }
        assert_eq!(order, vec![48, 32, 16, 0]);
    }

    #[test]
    fn test_sampler_removes_expired_first() {
        let config = StoreConfig::new()
            .with_segments(1)
            .with_initial_capacity(64)
            .with_max_size(2);
        let f = fixture_with(config, u64::MAX);
        put(&f.segment, 1, "fresh");
        let stale = Element::with_size(2, "stale".to_string(), 10)
            .with_creation_time(0)
            .with_time_to_live(Duration::from_millis(1));
        f.segment
            .put(2, 2, Arc::new(stale), false, Wait::Forever)
            .unwrap();
        put(&f.segment, 3, "new");
        assert!(!f.segment.contains_key(&2, 2));
        assert_eq!(f.metrics.snapshot().expirations, 1);
    }

    #[test]
    fn test_expire_elements() {
        let f = fixture();
        put(&f.segment, 1, "live");
        for key in 2..5 {
            let stale = Element::with_size(key, "old".to_string(), 10)
                .with_creation_time(0)
                .with_time_to_live(Duration::from_millis(5));
            f.segment
                .put(key, key, Arc::new(stale), false, Wait::Forever)
                .unwrap();
        }
        assert_eq!(f.segment.expire_elements(Wait::Forever).unwrap(), 3);
        assert_eq!(f.segment.count(), 1);
        assert_eq!(f.heap.size(), 10);
    }

    #[test]
    fn test_clear_releases_pool() {
        let f = fixture();
        for key in 0..5 {
            put(&f.segment, key, "v");
        }
        let mod_count = f.segment.mod_count();
        f.segment.clear();
        assert_eq!(f.segment.count(), 0);
        assert_eq!(f.heap.size(), 0);
        assert!(f.segment.mod_count() > mod_count);
        assert!(f.segment.keys().is_empty());
    }

    #[test]
    fn test_contains_value() {
        let f = fixture();
        put(&f.segment, 1, "needle");
        assert!(f.segment.contains_value(&"needle".to_string()).unwrap());
        assert!(!f.segment.contains_value(&"hay".to_string()).unwrap());
    }

    #[test]
    fn test_random_sample_respects_size_and_filter() {
        let f = fixture();
        for key in 0..30 {
            put(&f.segment, key, "v");
        }
        let mut out = Vec::new();
        f.segment
            .add_random_sample(&|_: &Substitute<u32, String>| true, 7, 12345, &mut out);
        assert_eq!(out.len(), 7);

        let mut none = Vec::new();
        f.segment
            .add_random_sample(&|_: &Substitute<u32, String>| false, 7, 0, &mut none);
        assert!(none.is_empty());
    }

    #[test]
    fn test_lock_timeout() {
        let f = fixture();
        let _held = f.segment.lock(Wait::Forever).unwrap();
        let err = thread::scope(|s| {
            s.spawn(|| {
                f.segment
                    .put(1, 1, element(1, "x"), false, Wait::For(Duration::from_millis(10)))
                    .unwrap_err()
            })
            .join()
            .unwrap()
        });
        assert!(matches!(err, StoreError::LockTimeout(_)));
        assert_eq!(f.segment.count(), 0);
    }

    #[test]
    fn test_evict_checks_identity() {
        let f = fixture();
        put(&f.segment, 1, "v");
        let stale = Substitute::Resident(element(1, "v"));
        assert!(f.segment.evict(&1, 1, Some(&stale)).unwrap().is_none());
        let current = f.segment.unretrieved_get(&1, 1).unwrap();
        assert!(f.segment.evict(&1, 1, Some(&current)).unwrap().is_some());
        assert_eq!(f.segment.count(), 0);
        assert_eq!(f.metrics.snapshot().evictions, 1);
    }

    fn tiered_fixture() -> (
        Fixture,
        Arc<TierFactory<u32, String>>,
        Arc<MemoryTier<u32, String>>,
    ) {
        let io: Arc<MemoryTier<u32, String>> = Arc::new(MemoryTier::new());
        let disk = Arc::new(BoundedPool::unbounded(PoolRegion::OnDisk));
        let tier = Arc::new(TierFactory::new(FactoryId::new(1), io.clone(), disk).unwrap());
        let heap = Arc::new(BoundedPool::unbounded(PoolRegion::OnHeap));
        let metrics = Arc::new(StoreMetrics::new());
        let shared = SegmentShared {
            factories: Arc::new(FactorySet::new().with_tier(Arc::clone(&tier), false).unwrap()),
            pool: heap.clone(),
            metrics: Arc::clone(&metrics),
            events: Arc::new(EventListeners::new()),
            bound: Arc::new(SizeBound::default()),
        };
        let config = StoreConfig::new().with_segments(1);
        let fixture = Fixture {
            segment: Segment::new(&config, shared),
            heap,
            metrics,
        };
        (fixture, tier, io)
    }

    #[test]
    fn test_fault_to_marker_then_get() {
        let (f, tier, io) = tiered_fixture();
        put(&f.segment, 1, "original");
        let resident = f.segment.unretrieved_get(&1, 1).unwrap();
        let in_memory = Arc::clone(resident.in_memory().unwrap());
        let marker = tier.write(&1, &in_memory).unwrap();
        let factories = Arc::clone(&f.segment.factories);
        assert!(f
            .segment
            .fault(&1, 1, &resident, factories.adopt(marker), true)
            .unwrap());
        assert_eq!(f.segment.kind_count(SubstituteKind::Marker), 1);
        assert_eq!(f.heap.size(), crate::substitute::MARKER_HEAP_SIZE);

        let found = f.segment.get(&1, 1, Wait::Forever).unwrap().unwrap();
        assert_eq!(found.value(), "original");
        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.tier_hits, 1);
        assert_eq!(snapshot.misses, 0);
        assert_eq!(io.reads(), 1);
    }

    #[test]
    fn test_losing_fault_frees_its_encoding() {
        let (f, tier, io) = tiered_fixture();
        put(&f.segment, 1, "v");
        let stale = Substitute::Resident(element(1, "v"));
        let marker = tier.write(&1, &Element::with_size(1, "v".to_string(), 10)).unwrap();
        let factories = Arc::clone(&f.segment.factories);
        assert!(!f
            .segment
            .fault(&1, 1, &stale, factories.adopt(marker), true)
            .unwrap());
        assert!(io.is_empty());
        assert_eq!(tier.pool().size(), 0);
        assert_eq!(f.metrics.snapshot().fault_races_lost, 1);
    }

    #[test]
    fn test_removing_marker_frees_tier_space() {
        let (f, tier, io) = tiered_fixture();
        put(&f.segment, 1, "v");
        let resident = f.segment.unretrieved_get(&1, 1).unwrap();
        let marker = tier
            .write(&1, resident.in_memory().unwrap())
            .unwrap();
        let factories = Arc::clone(&f.segment.factories);
        f.segment
            .fault(&1, 1, &resident, factories.adopt(marker), true)
            .unwrap();
        assert_eq!(io.len(), 1);

        let removed = f.segment.remove(&1, 1, None, Wait::Forever).unwrap().unwrap();
        assert_eq!(removed.value(), "v");
        assert!(io.is_empty());
        assert_eq!(tier.pool().size(), 0);
        assert_eq!(f.heap.size(), 0);
    }
}
