//! Value comparison policies for conditional remove and replace.

use crate::element::Element;
use core::fmt;
use core::marker::PhantomData;

/// Decides whether the element currently mapped matches the one a caller
/// expects.
pub trait ValueComparator<K, V>: Send + Sync {
    /// Returns `true` if `current` counts as `expected`.
    fn equals(&self, current: &Element<K, V>, expected: &Element<K, V>) -> bool;
}

/// Matches only the very same element instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityComparator;

impl<K, V> ValueComparator<K, V> for IdentityComparator {
    #[inline]
    fn equals(&self, current: &Element<K, V>, expected: &Element<K, V>) -> bool {
        core::ptr::eq(current, expected)
    }
}

/// Matches elements whose payloads are equal.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultComparator;

impl<K, V: PartialEq> ValueComparator<K, V> for DefaultComparator {
    #[inline]
    fn equals(&self, current: &Element<K, V>, expected: &Element<K, V>) -> bool {
        current.value() == expected.value()
    }
}

/// Adapts a closure into a comparator.
pub struct FnComparator<F, K, V> {
    compare: F,
    _marker: PhantomData<fn(&K, &V)>,
}

impl<F, K, V> FnComparator<F, K, V>
where
    F: Fn(&Element<K, V>, &Element<K, V>) -> bool,
{
    /// Wraps `compare` as a comparator.
    pub fn new(compare: F) -> Self {
        Self {
            compare,
            _marker: PhantomData,
        }
    }
}

impl<F, K, V> ValueComparator<K, V> for FnComparator<F, K, V>
where
    F: Fn(&Element<K, V>, &Element<K, V>) -> bool + Send + Sync,
{
    #[inline]
    fn equals(&self, current: &Element<K, V>, expected: &Element<K, V>) -> bool {
        (self.compare)(current, expected)
    }
}

impl<F, K, V> fmt::Debug for FnComparator<F, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnComparator").finish_non_exhaustive()
    }
}
