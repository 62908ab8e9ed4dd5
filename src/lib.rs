//! # tierstore
//!
//! A segmented, concurrent key/value store whose elements can live on the
//! heap or on a secondary storage tier.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                             TieredStore                               │
//! │                                                                       │
//! │   get / put / remove / replace          random_sample / evict         │
//! │              │                                   │                    │
//! │              ▼                                   ▼                    │
//! │   ┌───────────────────┐  ...  ┌───────────────────┐                   │
//! │   │ Segment (RwLock)  │       │ Segment (RwLock)  │                   │
//! │   │  bucket chains of │       │                   │                   │
//! │   │  Slot ─▶ Slot ─▶  │       │                   │                   │
//! │   └─────────┬─────────┘       └───────────────────┘                   │
//! │             │ each slot holds a Substitute                            │
//! │             ▼                                                         │
//! │   Resident(element) │ Placeholder(element, tier) │ Marker(location)   │
//! │             │                    │                        │           │
//! │             └──── FactorySet: identity factory + TierFactory ───┘     │
//! │                                        │                              │
//! │                        on-disk pool ◀──┴──▶ TierIo                    │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concepts
//!
//! | Type | Role |
//! |------|------|
//! | [`Element`] | Key, value and access/expiry metadata |
//! | [`Substitute`] | The form an element takes in a slot |
//! | [`TierFactory`] | Encodes elements for the secondary tier and decodes them back |
//! | [`PoolAccessor`](pool::PoolAccessor) | Byte ledger that admits or refuses growth |
//! | [`TieredStore`] | The store: segments, hashing, sizing, tier transitions |
//!
//! ## Concurrency
//!
//! Each segment has its own `parking_lot::RwLock`. Lookups take the read
//! lock; structural changes take the write lock. Slot values are swapped
//! atomically, so a representation change ("fault") only needs the read
//! lock and loses cleanly to any concurrent writer. Representations that
//! leave the store are freed after the lock is released, and listeners are
//! notified after that.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tierstore::config::StoreConfig;
//! use tierstore::pool::{BoundedPool, PoolRegion};
//! use tierstore::tier::MemoryTier;
//! use tierstore::{Element, FactoryId, StoreParts, TierFactory, TieredStore};
//!
//! let tier = TierFactory::new(
//!     FactoryId::new(1),
//!     Arc::new(MemoryTier::<String, Vec<u8>>::new()),
//!     Arc::new(BoundedPool::new(PoolRegion::OnDisk, 1 << 20)),
//! )
//! .unwrap();
//! let parts = StoreParts::new().with_tier(Arc::new(tier));
//! let store: TieredStore<String, Vec<u8>> =
//!     TieredStore::init_with_parts(StoreConfig::new(), parts, None).unwrap();
//!
//! let key = "blob".to_string();
//! store
//!     .put(Element::with_size(key.clone(), vec![0u8; 512], 512))
//!     .unwrap();
//!
//! // Move it to the secondary tier; reads still see it.
//! assert!(store.spill(&key).unwrap());
//! assert_eq!(store.on_disk_count(), 1);
//! assert_eq!(store.get(&key).unwrap().unwrap().value().len(), 512);
//! ```
//!
//! ## Modules
//!
//! - [`store`]: the store itself
//! - [`element`]: stored elements and their expiry rules
//! - [`substitute`]: stored representations and their release guards
//! - [`factory`]: substitute factories and the per-store factory set
//! - [`tier`]: secondary tier I/O
//! - [`pool`]: byte accounting per storage region
//! - [`comparator`]: value equality for conditional operations
//! - [`events`]: mapping-change listeners
//! - [`config`]: construction parameters
//! - [`metrics`]: statistics counters and reporting
//! - [`error`]: error types

/// Value equality strategies for conditional remove and replace.
pub mod comparator;

/// Store configuration.
pub mod config;

/// Stored elements: key, value and access metadata.
pub mod element;

/// Error types shared by every module.
pub mod error;

/// Listeners notified when mappings change.
pub mod events;

/// Substitute factories.
///
/// Turns elements into stored representations and back, and releases
/// whatever a representation holds on its tier.
pub mod factory;

/// Store metrics.
///
/// Lock-free counters updated by every segment, with snapshot and reporting
/// support through the [`CacheMetrics`](metrics::CacheMetrics) trait.
pub mod metrics;

/// Byte accounting for the heap and the secondary tier.
pub mod pool;

/// The segment: one independently locked shard of the store.
///
/// **Note**: internal; the store is the only entry point.
pub(crate) mod segment;

/// Hash-chain nodes with an atomically swappable value.
pub mod slot;

/// The segmented store.
pub mod store;

/// Stored representations of elements.
pub mod substitute;

/// Secondary tier I/O.
pub mod tier;

// Re-export the main types
pub use comparator::{DefaultComparator, FnComparator, IdentityComparator, ValueComparator};
pub use element::Element;
pub use error::{Result, StoreError, TierError};
pub use events::{EventListeners, StoreListener};
pub use factory::{FactorySet, IdentityFactory, SubstituteFactory, TierFactory};
pub use segment::{Sample, SegmentLock};
pub use store::{StoreParts, TieredStore};
pub use substitute::{FactoryId, Placeholder, Substitute, SubstituteKind, TierMarker};
