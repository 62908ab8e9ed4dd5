//! Bucket Chain Slots
//!
//! A slot is one node of a segment's bucket chain. Its key, spread hash and
//! `next` link never change after construction, so a chain can be walked by
//! anyone holding the segment's read lock. The only mutable part is the
//! value cell, which can be swapped or compare-and-swapped atomically.
//!
//! ```text
//!  bucket[i] ──▶ Slot{k3} ──▶ Slot{k7} ──▶ Slot{k1} ──▶ ∅
//!                  │             │             │
//!                value         value         value      (atomic cells)
//! ```
//!
//! Chains are never relinked in place. Removing a slot rebuilds the prefix
//! of the chain in front of it with [`Slot::relink`]; rehashing does the
//! same for the part of a chain it cannot reuse.
//!
//! # Memory reclamation
//!
//! The value cell is a `crossbeam::epoch::Atomic`. A reader pins the current
//! epoch, loads the pointer and clones the `Arc`-backed substitute out of it.
//! A writer that swaps a value out defers destruction of the old cell until
//! no pinned reader can still see it.

use crate::substitute::Substitute;
use core::fmt;
use crossbeam::epoch::{self, Atomic, Owned};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One node in a bucket chain.
pub struct Slot<K, V> {
    key: K,
    hash: u32,
    next: Option<Arc<Slot<K, V>>>,
    value: Atomic<Substitute<K, V>>,
    accessed: AtomicBool,
}

impl<K, V> Slot<K, V> {
    /// Creates a slot. New slots start out marked as accessed.
    pub(crate) fn new(
        key: K,
        hash: u32,
        next: Option<Arc<Slot<K, V>>>,
        value: Substitute<K, V>,
    ) -> Self {
        Self {
            key,
            hash,
            next,
            value: Atomic::new(value),
            accessed: AtomicBool::new(true),
        }
    }

    /// The key this slot maps.
    #[inline]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Spread hash of the key.
    #[inline]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// The next slot in the bucket chain.
    #[inline]
    pub fn next(&self) -> Option<&Arc<Slot<K, V>>> {
        self.next.as_ref()
    }

    /// Returns `true` if this slot is for `key` under `hash`.
    #[inline]
    pub(crate) fn matches<Q>(&self, key: &Q, hash: u32) -> bool
    where
        K: core::borrow::Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.hash == hash && self.key.borrow() == key
    }

    /// Loads the current value (acquire).
    pub fn load(&self) -> Substitute<K, V> {
        let guard = epoch::pin();
        let shared = self.value.load(Ordering::Acquire, &guard);
        // SAFETY: the cell is never null, and a value swapped out of it is
        // only destroyed after every guard pinned before the swap is gone.
        unsafe { shared.deref() }.clone()
    }

    /// Replaces the value (release), discarding the previous one.
    pub fn store(&self, value: Substitute<K, V>) {
        drop(self.swap(value));
    }

    /// Replaces the value and returns the previous one.
    pub fn swap(&self, value: Substitute<K, V>) -> Substitute<K, V> {
        let guard = epoch::pin();
        let old = self.value.swap(Owned::new(value), Ordering::AcqRel, &guard);
        // SAFETY: `old` was the non-null value of this cell and is now
        // unreachable from it; readers that loaded it are still pinned.
        unsafe {
            let previous = old.deref().clone();
            guard.defer_destroy(old);
            previous
        }
    }

    /// Installs `update` only if the cell still holds `expect`.
    ///
    /// On success the previous value is returned; on failure `update` is
    /// handed back unchanged.
    pub fn compare_and_swap(
        &self,
        expect: &Substitute<K, V>,
        update: Substitute<K, V>,
    ) -> Result<Substitute<K, V>, Substitute<K, V>> {
        let guard = epoch::pin();
        let current = self.value.load(Ordering::Acquire, &guard);
        // SAFETY: see `load`.
        if !unsafe { current.deref() }.same(expect) {
            return Err(update);
        }
        match self.value.compare_exchange(
            current,
            Owned::new(update),
            Ordering::AcqRel,
            Ordering::Acquire,
            &guard,
        ) {
            // SAFETY: the exchange unlinked `current`; defer its destruction
            // past every reader pinned now.
            Ok(_) => unsafe {
                let previous = current.deref().clone();
                guard.defer_destroy(current);
                Ok(previous)
            },
            Err(failure) => Err(*failure.new.into_box()),
        }
    }

    /// Clears the accessed flag, returning whether it was set.
    #[inline]
    pub(crate) fn take_accessed(&self) -> bool {
        self.accessed.swap(false, Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn mark_accessed(&self) {
        self.accessed.store(true, Ordering::Relaxed);
    }

    /// Returns `true` if the slot was read or written since the sampler last passed it.
    #[inline]
    pub fn is_accessed(&self) -> bool {
        self.accessed.load(Ordering::Relaxed)
    }
}

impl<K: Clone, V> Slot<K, V> {
    /// A copy of this slot with a different successor.
    pub(crate) fn relink(&self, next: Option<Arc<Slot<K, V>>>) -> Self {
        Self {
            key: self.key.clone(),
            hash: self.hash,
            next,
            value: Atomic::new(self.load()),
            accessed: AtomicBool::new(self.is_accessed()),
        }
    }
}

impl<K, V> Drop for Slot<K, V> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can reach this cell, so
        // the unprotected guard is sound for taking ownership of its value.
        unsafe {
            let value = self.value.load(Ordering::Relaxed, epoch::unprotected());
            if !value.is_null() {
                drop(value.into_owned());
            }
        }
    }
}

impl<K: fmt::Debug, V> fmt::Debug for Slot<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("key", &self.key)
            .field("hash", &self.hash)
            .field("value", &self.load())
            .field("accessed", &self.is_accessed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Element;
    use std::thread;

    fn resident(value: u32) -> Substitute<u32, u32> {
        Substitute::resident(Element::with_size(1, value, 4))
    }

    #[test]
    fn test_load_and_swap() {
        let first = resident(1);
        let slot = Slot::new(1, 42, None, first.clone());
        assert!(slot.load().same(&first));
        assert!(slot.is_accessed());

        let second = resident(2);
        let previous = slot.swap(second.clone());
        assert!(previous.same(&first));
        assert!(slot.load().same(&second));
    }

    #[test]
    fn test_store_replaces_value() {
        let slot = Slot::new(1, 0, None, resident(1));
        let update = resident(5);
        slot.store(update.clone());
        assert!(slot.load().same(&update));
    }

    #[test]
    fn test_compare_and_swap() {
        let first = resident(1);
        let slot = Slot::new(1, 0, None, first.clone());

        let stale = resident(9);
        let rejected = slot.compare_and_swap(&stale, resident(2)).unwrap_err();
        assert!(matches!(rejected, Substitute::Resident(ref e) if *e.value() == 2));
        assert!(slot.load().same(&first));

        let update = resident(3);
        let previous = slot.compare_and_swap(&first, update.clone()).unwrap();
        assert!(previous.same(&first));
        assert!(slot.load().same(&update));
    }

    #[test]
    fn test_take_accessed_clears_flag() {
        let slot = Slot::new(1, 0, None, resident(1));
        assert!(slot.take_accessed());
        assert!(!slot.take_accessed());
        slot.mark_accessed();
        assert!(slot.is_accessed());
    }

    #[test]
    fn test_relink_shares_value() {
        let tail = Arc::new(Slot::new(2, 0, None, resident(2)));
        let value = resident(1);
        let head = Slot::new(1, 0, None, value.clone());
        let relinked = head.relink(Some(Arc::clone(&tail)));
        assert!(relinked.load().same(&value));
        assert!(Arc::ptr_eq(relinked.next().unwrap(), &tail));
        assert!(head.next().is_none());
    }

    #[test]
    fn test_concurrent_cas_single_winner() {
        let original = resident(0);
        let slot = Arc::new(Slot::new(1, 0, None, original.clone()));
        let handles: Vec<_> = (1..=8)
            .map(|i| {
                let slot = Arc::clone(&slot);
                let expect = original.clone();
                thread::spawn(move || slot.compare_and_swap(&expect, resident(i)).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(!slot.load().same(&original));
    }
}
