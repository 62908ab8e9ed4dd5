//! Error types for the tiered store.

use crate::pool::PoolRegion;
use crate::substitute::FactoryId;
use crate::tier::TierLocation;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using [`StoreError`].
pub type Result<T, E = StoreError> = core::result::Result<T, E>;

/// Failures reported by a secondary-tier I/O provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TierError {
    /// Nothing is stored at the location a marker points to
    #[error("no data stored at tier location {0}")]
    Missing(TierLocation),

    /// The tier could not take a write of this size
    #[error("secondary tier cannot store {requested} more bytes")]
    Full { requested: u64 },

    /// Any other I/O failure
    #[error("tier I/O failed: {0}")]
    Io(String),
}

/// Errors surfaced by store operations.
///
/// Compare-and-swap races on the fault path are not errors: they are
/// reported as `Ok(false)` and the caller decides whether to retry.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A pool refused to admit the bytes a write needed
    #[error("{region} pool refused {requested} bytes")]
    CapacityRefused { region: PoolRegion, requested: u64 },

    /// A raw insert hit a key that is already mapped
    #[error("key is already mapped")]
    DuplicateKey,

    /// A substitute names a factory this store was not built with
    #[error("substitute references unknown factory {0}")]
    UnknownFactory(FactoryId),

    /// A tier operation was requested on a store without a secondary tier
    #[error("store has no secondary tier")]
    NoTier,

    /// The secondary tier failed
    #[error(transparent)]
    Tier(#[from] TierError),

    /// A segment lock could not be acquired in time
    #[error("timed out after {0:?} waiting for a segment lock")]
    LockTimeout(Duration),

    /// Construction parameters are inconsistent
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),
}

impl StoreError {
    /// Returns `true` for failures the caller can recover from by retrying,
    /// possibly after eviction frees space.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::CapacityRefused { .. }
                | StoreError::LockTimeout(_)
                | StoreError::Tier(TierError::Full { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = StoreError::CapacityRefused {
            region: PoolRegion::OnHeap,
            requested: 128,
        };
        assert_eq!(err.to_string(), "on-heap pool refused 128 bytes");

        let err = StoreError::from(TierError::Io("disk gone".to_string()));
        assert_eq!(err.to_string(), "tier I/O failed: disk gone");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(StoreError::LockTimeout(Duration::from_millis(5)).is_recoverable());
        assert!(StoreError::Tier(TierError::Full { requested: 1 }).is_recoverable());
        assert!(!StoreError::DuplicateKey.is_recoverable());
        assert!(!StoreError::UnknownFactory(FactoryId::IDENTITY).is_recoverable());
    }
}
