//! Store Event Notifications
//!
//! Listeners registered with a store's [`EventListeners`] are told about
//! every mapping change. Notifications are always delivered after the
//! segment lock is released, so a listener may call back into the store.
//!
//! | Event | Fired when |
//! |-------|------------|
//! | `on_put` | a previously unmapped key gets an element |
//! | `on_updated` | an existing mapping is overwritten |
//! | `on_removed` | a mapping is explicitly removed |
//! | `on_evicted` | the sampler or an evict call drops a live element |
//! | `on_expired` | an expired element is dropped |

use crate::element::Element;
use core::fmt;
use parking_lot::RwLock;
use std::sync::Arc;

/// Receives store notifications. Every method defaults to a no-op.
pub trait StoreListener<K, V>: Send + Sync {
    /// A previously unmapped key got an element.
    fn on_put(&self, _element: &Arc<Element<K, V>>) {}

    /// `old` is the element that was replaced.
    fn on_updated(&self, _old: &Arc<Element<K, V>>, _new: &Arc<Element<K, V>>) {}

    /// A mapping was explicitly removed.
    fn on_removed(&self, _element: &Arc<Element<K, V>>) {}

    /// A live element was evicted.
    fn on_evicted(&self, _element: &Arc<Element<K, V>>) {}

    /// An expired element was dropped.
    fn on_expired(&self, _element: &Arc<Element<K, V>>) {}
}

/// The listeners registered with one store.
pub struct EventListeners<K, V> {
    listeners: RwLock<Vec<Arc<dyn StoreListener<K, V>>>>,
}

impl<K, V> EventListeners<K, V> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Adds a listener. It is notified of every later change.
    pub fn register(&self, listener: Arc<dyn StoreListener<K, V>>) {
        self.listeners.write().push(listener);
    }

    /// Removes a listener by identity. Returns `true` if it was registered.
    pub fn unregister(&self, listener: &Arc<dyn StoreListener<K, V>>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Returns `true` if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    fn each(&self, f: impl Fn(&dyn StoreListener<K, V>)) {
        // Snapshot so a listener can register or unregister from a callback.
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            f(listener.as_ref());
        }
    }

    pub(crate) fn notify_put(&self, element: &Arc<Element<K, V>>) {
        self.each(|l| l.on_put(element));
    }

    pub(crate) fn notify_updated(&self, old: &Arc<Element<K, V>>, new: &Arc<Element<K, V>>) {
        self.each(|l| l.on_updated(old, new));
    }

    pub(crate) fn notify_removed(&self, element: &Arc<Element<K, V>>) {
        self.each(|l| l.on_removed(element));
    }

    pub(crate) fn notify_evicted(&self, element: &Arc<Element<K, V>>) {
        self.each(|l| l.on_evicted(element));
    }

    pub(crate) fn notify_expired(&self, element: &Arc<Element<K, V>>) {
        self.each(|l| l.on_expired(element));
    }
}

impl<K, V> Default for EventListeners<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for EventListeners<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListeners")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        puts: AtomicUsize,
        updates: AtomicUsize,
    }

    impl StoreListener<u32, u32> for Counting {
        fn on_put(&self, _element: &Arc<Element<u32, u32>>) {
            self.puts.fetch_add(1, Ordering::Relaxed);
        }

        fn on_updated(&self, _old: &Arc<Element<u32, u32>>, _new: &Arc<Element<u32, u32>>) {
            self.updates.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_register_and_notify() {
        let listeners = EventListeners::new();
        let counting = Arc::new(Counting::default());
        listeners.register(counting.clone());

        let element = Arc::new(Element::with_size(1u32, 1u32, 1));
        listeners.notify_put(&element);
        listeners.notify_updated(&element, &element);
        listeners.notify_removed(&element);

        assert_eq!(counting.puts.load(Ordering::Relaxed), 1);
        assert_eq!(counting.updates.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_unregister() {
        let listeners: EventListeners<u32, u32> = EventListeners::new();
        let listener: Arc<dyn StoreListener<u32, u32>> = Arc::new(Counting::default());
        listeners.register(Arc::clone(&listener));
        assert_eq!(listeners.len(), 1);
        assert!(listeners.unregister(&listener));
        assert!(!listeners.unregister(&listener));
        assert!(listeners.is_empty());
    }
}
