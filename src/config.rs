//! Store Configuration
//!
//! [`StoreConfig`] has public fields for direct instantiation plus `with_*`
//! builder methods. Call [`StoreConfig::validate`] (the store constructors
//! do) before use.
//!
//! # Sizing
//!
//! - **`initial_capacity`**: total slots the bucket tables start with across
//!   all segments. Each segment gets `initial_capacity / segments`, rounded
//!   up to a power of two. Tables double on their own as they fill, so this
//!   only avoids early rehashing.
//! - **`load_factor`**: fill ratio at which a segment doubles its table.
//! - **`segments`**: number of independently locked shards, rounded up to a
//!   power of two. More segments mean less contention.
//! - **`max_size`**: element count at which puts start evicting (0 disables
//!   eviction). Enforced against the whole store's element count.
//!
//! ```text
//! per-segment buckets   = next_pow2(ceil(initial_capacity / segments))
//! per-segment threshold = buckets × load_factor
//! ```
//!
//! # Examples
//!
//! ```
//! use tierstore::config::StoreConfig;
//!
//! let config = StoreConfig::new()
//!     .with_segments(8)
//!     .with_initial_capacity(1024)
//!     .with_max_size(10_000);
//! assert!(config.validate().is_ok());
//! assert_eq!(config.segment_capacity(), 128);
//! ```

use crate::error::{Result, StoreError};
use core::fmt;

/// Default total slot capacity.
pub const DEFAULT_INITIAL_CAPACITY: usize = 16;

/// Default fill ratio before a segment table doubles.
pub const DEFAULT_LOAD_FACTOR: f32 = 0.75;

/// Default number of sampler rounds a single put may run.
pub const DEFAULT_MAX_EVICTION_ROUNDS: usize = 5;

/// Upper bound on the number of segments.
pub const MAX_SEGMENTS: usize = 1 << 16;

/// Returns the default number of segments based on available parallelism.
pub fn default_segment_count() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get() * 4)
        .unwrap_or(16)
        .clamp(4, 64)
        .next_power_of_two()
}

/// Construction parameters for a [`TieredStore`](crate::TieredStore).
#[derive(Clone, Copy, PartialEq)]
pub struct StoreConfig {
    /// Total slots across all segments before the first rehash
    pub initial_capacity: usize,

    /// Fill ratio at which a segment doubles its bucket table
    pub load_factor: f32,

    /// Number of segments (rounded up to a power of two)
    pub segments: usize,

    /// Element count above which puts evict; 0 means unbounded
    pub max_size: usize,

    /// Upper bound on sampler rounds run by a single put
    pub max_eviction_rounds: usize,

    /// Encode new puts with the tier factory (as placeholders) instead of
    /// storing them resident
    pub tier_primary: bool,
}

impl StoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            load_factor: DEFAULT_LOAD_FACTOR,
            segments: default_segment_count(),
            max_size: 0,
            max_eviction_rounds: DEFAULT_MAX_EVICTION_ROUNDS,
            tier_primary: false,
        }
    }

    /// Sets the initial slot capacity, spread across the segments.
    #[must_use]
    pub fn with_initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }

    /// Sets the fill ratio at which a segment doubles its buckets.
    #[must_use]
    pub fn with_load_factor(mut self, load_factor: f32) -> Self {
        self.load_factor = load_factor;
        self
    }

    /// Sets the number of segments. Use a power of two; other values are
    /// rounded up.
    #[must_use]
    pub fn with_segments(mut self, segments: usize) -> Self {
        self.segments = segments;
        self
    }

    /// Sets the element count above which puts evict (0 disables).
    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets how many victims a single put may evict.
    #[must_use]
    pub fn with_max_eviction_rounds(mut self, rounds: usize) -> Self {
        self.max_eviction_rounds = rounds;
        self
    }

    /// Makes the tier factory the primary encoder for new puts.
    #[must_use]
    pub fn with_tier_primary(mut self, tier_primary: bool) -> Self {
        self.tier_primary = tier_primary;
        self
    }

    /// Checks the parameters for consistency.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if !(self.load_factor > 0.0 && self.load_factor.is_finite()) {
            return Err(StoreError::InvalidConfig(format!(
                "load_factor must be positive and finite, got {}",
                self.load_factor
            )));
        }
        if self.segments == 0 || self.segments > MAX_SEGMENTS {
            return Err(StoreError::InvalidConfig(format!(
                "segments must be in 1..={}, got {}",
                MAX_SEGMENTS, self.segments
            )));
        }
        if self.max_size > 0 && self.max_eviction_rounds == 0 {
            return Err(StoreError::InvalidConfig(
                "max_eviction_rounds must be > 0 when max_size is set".to_string(),
            ));
        }
        Ok(())
    }

    /// The segment count actually used: `segments` rounded up to a power of
    /// two.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.max(1).next_power_of_two()
    }

    /// Initial bucket count of each segment.
    pub fn segment_capacity(&self) -> usize {
        let segments = self.segment_count();
        self.initial_capacity
            .div_ceil(segments)
            .max(1)
            .next_power_of_two()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("initial_capacity", &self.initial_capacity)
            .field("load_factor", &self.load_factor)
            .field("segments", &self.segments)
            .field("max_size", &self.max_size)
            .field("max_eviction_rounds", &self.max_eviction_rounds)
            .field("tier_primary", &self.tier_primary)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::new();
        assert_eq!(config.initial_capacity, 16);
        assert_eq!(config.load_factor, 0.75);
        assert_eq!(config.max_size, 0);
        assert_eq!(config.max_eviction_rounds, 5);
        assert!(config.segments.is_power_of_two());
        assert!((4..=64).contains(&config.segments));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_segment_sizing() {
        let config = StoreConfig::new()
            .with_segments(6)
            .with_initial_capacity(100)
            .with_max_size(1000);
        assert_eq!(config.segment_count(), 8);
        assert_eq!(config.segment_capacity(), 16);
    }

    #[test]
    fn test_single_segment_keeps_capacity() {
        let config = StoreConfig::new()
            .with_segments(1)
            .with_initial_capacity(16);
        assert_eq!(config.segment_capacity(), 16);
    }

    #[test]
    fn test_zero_capacity_rounds_to_one() {
        let config = StoreConfig::new().with_initial_capacity(0).with_segments(4);
        assert_eq!(config.segment_capacity(), 1);
    }

    #[test]
    fn test_validation_failures() {
        assert!(StoreConfig::new().with_load_factor(0.0).validate().is_err());
        assert!(StoreConfig::new()
            .with_load_factor(f32::NAN)
            .validate()
            .is_err());
        assert!(StoreConfig::new().with_segments(0).validate().is_err());
        assert!(StoreConfig::new()
            .with_max_size(10)
            .with_max_eviction_rounds(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_debug_impl() {
        let debug_str = format!("{:?}", StoreConfig::new().with_max_size(7));
        assert!(debug_str.contains("StoreConfig"));
        assert!(debug_str.contains("max_size: 7"));
    }
}
