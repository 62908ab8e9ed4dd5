//! Substitution Factories
//!
//! A factory converts an element into a storable [`Substitute`] and back, and
//! releases whatever resources a representation holds once it leaves a slot.
//!
//! | Factory | Produces | Frees |
//! |---------|----------|-------|
//! | [`IdentityFactory`] | `Resident` | nothing |
//! | [`TierFactory`] | `Placeholder`, then `Marker` on write | tier space and on-disk pool bytes |
//!
//! A store owns exactly one [`FactorySet`]: the identity factory plus any
//! number of tier factories, each registered under a distinct [`FactoryId`].
//! Every representation names the id of the factory that built it, and the
//! set routes decode and free calls by that id.

use crate::element::Element;
use crate::error::{Result, StoreError};
use crate::pool::{PoolAccessor, PoolRegion};
use crate::substitute::{Encoded, FactoryId, Placeholder, Substitute, TierMarker};
use crate::tier::TierIo;
use core::fmt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{trace, warn};

/// Converts elements to representations and back.
pub trait SubstituteFactory<K, V>: Send + Sync {
    /// The id stamped on every representation this factory builds.
    fn id(&self) -> FactoryId;

    /// Builds a representation of `element`.
    fn create(&self, key: &K, element: Arc<Element<K, V>>) -> Result<Substitute<K, V>>;

    /// Recovers the element behind a representation this factory built.
    fn retrieve(&self, key: &K, substitute: &Substitute<K, V>) -> Result<Arc<Element<K, V>>>;

    /// Releases the resources held by a representation this factory built.
    fn free(&self, substitute: &Substitute<K, V>);

    /// Called once a representation this factory built has been installed in
    /// a slot, after the segment lock is released.
    fn installed(&self, _key: &K, _substitute: &Substitute<K, V>) {}
}

/// Stores elements as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityFactory;

impl<K, V> SubstituteFactory<K, V> for IdentityFactory
where
    K: Send + Sync,
    V: Send + Sync,
{
    #[inline]
    fn id(&self) -> FactoryId {
        FactoryId::IDENTITY
    }

    #[inline]
    fn create(&self, _key: &K, element: Arc<Element<K, V>>) -> Result<Substitute<K, V>> {
        Ok(Substitute::Resident(element))
    }

    fn retrieve(&self, _key: &K, substitute: &Substitute<K, V>) -> Result<Arc<Element<K, V>>> {
        match substitute {
            Substitute::Resident(element) => Ok(Arc::clone(element)),
            other => Err(StoreError::UnknownFactory(other.factory_id())),
        }
    }

    #[inline]
    fn free(&self, _substitute: &Substitute<K, V>) {}
}

/// Moves elements to a secondary tier.
///
/// `create` only wraps the element in a placeholder and queues its key; the
/// tier write happens later, when the store flushes pending placeholders or
/// spills a key directly. Space on the tier is charged to the on-disk pool.
pub struct TierFactory<K, V> {
    id: FactoryId,
    io: Arc<dyn TierIo<K, V>>,
    pool: Arc<dyn PoolAccessor>,
    pending: Mutex<VecDeque<K>>,
}

impl<K, V> TierFactory<K, V>
where
    K: Clone + Send + Sync,
    V: Send + Sync,
{
    /// Creates a tier factory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] if `id` is the identity id or if
    /// `pool` does not account for the on-disk region.
    pub fn new(
        id: FactoryId,
        io: Arc<dyn TierIo<K, V>>,
        pool: Arc<dyn PoolAccessor>,
    ) -> Result<Self> {
        if id.is_identity() {
            return Err(StoreError::InvalidConfig(
                "tier factories cannot use the identity id".to_string(),
            ));
        }
        if pool.region() != PoolRegion::OnDisk {
            return Err(StoreError::InvalidConfig(format!(
                "tier factory {} needs an on-disk pool, got {}",
                id,
                pool.region()
            )));
        }
        Ok(Self {
            id,
            io,
            pool,
            pending: Mutex::new(VecDeque::new()),
        })
    }

    /// The on-disk pool this factory charges.
    pub fn pool(&self) -> &Arc<dyn PoolAccessor> {
        &self.pool
    }

    /// Writes `element` to the tier and returns a marker pointing at it.
    ///
    /// # Errors
    ///
    /// [`StoreError::CapacityRefused`] if the on-disk pool cannot admit the
    /// element, or [`StoreError::Tier`] if the write fails. Nothing is left
    /// charged or stored in either case.
    pub fn write(&self, key: &K, element: &Element<K, V>) -> Result<Substitute<K, V>> {
        let size = element.size();
        if self.pool.add(size, false).is_none() {
            return Err(StoreError::CapacityRefused {
                region: PoolRegion::OnDisk,
                requested: size,
            });
        }
        match self.io.write(key, element) {
            Ok(location) => {
                trace!(factory = %self.id, %location, size, "wrote element to tier");
                Ok(Substitute::Marker(Arc::new(TierMarker::for_element(
                    location, self.id, element,
                ))))
            }
            Err(err) => {
                self.pool.delete(size);
                warn!(factory = %self.id, error = %err, "tier write failed");
                Err(err.into())
            }
        }
    }

    /// Takes every key queued by installed placeholders.
    pub fn drain_pending(&self) -> Vec<K> {
        self.pending.lock().drain(..).collect()
    }

    /// Puts keys back at the front of the queue, preserving their order.
    pub fn requeue(&self, keys: impl IntoIterator<Item = K>) {
        let mut pending = self.pending.lock();
        let keys: Vec<K> = keys.into_iter().collect();
        for key in keys.into_iter().rev() {
            pending.push_front(key);
        }
    }

    /// Number of keys waiting to be flushed.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

impl<K, V> SubstituteFactory<K, V> for TierFactory<K, V>
where
    K: Clone + Send + Sync,
    V: Send + Sync,
{
    #[inline]
    fn id(&self) -> FactoryId {
        self.id
    }

    fn create(&self, _key: &K, element: Arc<Element<K, V>>) -> Result<Substitute<K, V>> {
        Ok(Substitute::Placeholder(Arc::new(Placeholder::new(
            element, self.id,
        ))))
    }

    fn retrieve(&self, _key: &K, substitute: &Substitute<K, V>) -> Result<Arc<Element<K, V>>> {
        match substitute {
            Substitute::Resident(element) => Ok(Arc::clone(element)),
            Substitute::Placeholder(placeholder) => Ok(Arc::clone(placeholder.element())),
            Substitute::Marker(marker) => {
                let element = self.io.read(marker.location)?;
                marker.restore_access(&element);
                Ok(Arc::new(element))
            }
        }
    }

    fn free(&self, substitute: &Substitute<K, V>) {
        if let Substitute::Marker(marker) = substitute {
            self.release(marker);
        }
    }

    fn installed(&self, key: &K, substitute: &Substitute<K, V>) {
        if let Substitute::Placeholder(_) = substitute {
            self.pending.lock().push_back(key.clone());
        }
    }
}

impl<K, V> TierFactory<K, V> {
    /// Returns the tier space and on-disk pool bytes behind `marker`.
    pub fn release(&self, marker: &TierMarker) {
        self.io.free(marker.location);
        self.pool.delete(marker.size);
        trace!(factory = %self.id, location = %marker.location, "freed tier space");
    }
}

impl<K, V> fmt::Debug for TierFactory<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TierFactory")
            .field("id", &self.id)
            .field("pool", &self.pool)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

/// The factories a store was built with, addressed by [`FactoryId`].
pub struct FactorySet<K, V> {
    identity: IdentityFactory,
    tiers: Vec<Arc<TierFactory<K, V>>>,
    primary: FactoryId,
}

impl<K, V> FactorySet<K, V>
where
    K: Clone + Send + Sync,
    V: Send + Sync,
{
    /// A set holding only the identity factory.
    pub fn new() -> Self {
        Self {
            identity: IdentityFactory,
            tiers: Vec::new(),
            primary: FactoryId::IDENTITY,
        }
    }

    /// Registers a tier factory. When `primary` is set, new puts are encoded
    /// by this factory instead of the identity factory.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidConfig`] if another factory already uses the id.
    pub fn with_tier(mut self, tier: Arc<TierFactory<K, V>>, primary: bool) -> Result<Self> {
        let id = SubstituteFactory::id(tier.as_ref());
        if self.tiers.iter().any(|t| SubstituteFactory::id(t.as_ref()) == id) {
            return Err(StoreError::InvalidConfig(format!(
                "factory id {} registered twice",
                id
            )));
        }
        if primary {
            self.primary = id;
        }
        self.tiers.push(tier);
        Ok(self)
    }

    /// Looks up a factory by id.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownFactory`] if no factory uses `id`.
    pub fn get(&self, id: FactoryId) -> Result<&dyn SubstituteFactory<K, V>> {
        if id.is_identity() {
            return Ok(&self.identity);
        }
        self.tier(id)
            .map(|tier| tier.as_ref() as &dyn SubstituteFactory<K, V>)
    }

    /// Looks up a tier factory by id.
    pub fn tier(&self, id: FactoryId) -> Result<&Arc<TierFactory<K, V>>> {
        self.tiers
            .iter()
            .find(|t| SubstituteFactory::id(t.as_ref()) == id)
            .ok_or(StoreError::UnknownFactory(id))
    }

    /// The first registered tier factory, if any.
    pub fn default_tier(&self) -> Option<&Arc<TierFactory<K, V>>> {
        self.tiers.first()
    }

    /// Every registered tier factory, in registration order.
    pub fn tiers(&self) -> &[Arc<TierFactory<K, V>>] {
        &self.tiers
    }

    /// Id of the factory new elements are encoded with.
    #[inline]
    pub fn primary_id(&self) -> FactoryId {
        self.primary
    }

    /// Encodes `element` with the primary factory.
    pub fn encode(&self, key: &K, element: Arc<Element<K, V>>) -> Result<Encoded<'_, K, V>> {
        let substitute = self.get(self.primary)?.create(key, element)?;
        Ok(Encoded::new(substitute, self))
    }

    /// Takes ownership of an already built representation.
    pub fn adopt(&self, substitute: Substitute<K, V>) -> Encoded<'_, K, V> {
        Encoded::new(substitute, self)
    }

    /// Decodes any representation built by a factory in this set.
    pub fn decode(&self, key: &K, substitute: &Substitute<K, V>) -> Result<Arc<Element<K, V>>> {
        match substitute {
            Substitute::Resident(element) => Ok(Arc::clone(element)),
            other => self.get(other.factory_id())?.retrieve(key, other),
        }
    }

    /// Notifies the owning factory that a representation is installed.
    pub fn installed(&self, key: &K, substitute: &Substitute<K, V>) {
        if let Ok(factory) = self.get(substitute.factory_id()) {
            factory.installed(key, substitute);
        }
    }
}

impl<K, V> FactorySet<K, V> {
    /// Frees a representation through the factory that built it.
    ///
    /// Only markers hold anything outside the heap, so resident values and
    /// placeholders need no factory lookup.
    pub fn free(&self, substitute: &Substitute<K, V>) {
        let Substitute::Marker(marker) = substitute else {
            return;
        };
        match self.tiers.iter().find(|t| t.id == marker.factory) {
            Some(tier) => tier.release(marker),
            None => warn!(
                error = %StoreError::UnknownFactory(marker.factory),
                "cannot free representation"
            ),
        }
    }
}

impl<K, V> Default for FactorySet<K, V>
where
    K: Clone + Send + Sync,
    V: Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for FactorySet<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactorySet")
            .field("tiers", &self.tiers)
            .field("primary", &self.primary)
            .finish()
    }
}
