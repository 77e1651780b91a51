//! Concurrent bitmap for combining boolean control signals
//!
//! Several controllers can each own one bit; the aggregate "any bit set"
//! predicate is what the governors act on. Mutations detect whether that
//! predicate flipped and fire exactly one of two callbacks.

use parking_lot::Mutex;
use thiserror::Error;

/// Misuse of the bitmap
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BitMapError {
    #[error("Invalid index, must be between 0 and 63: {0}")]
    InvalidIndex(u32),

    #[error("Multiple one bits found")]
    MultipleBitsSet,
}

/// Up to 64 boolean flags with atomic change detection.
///
/// Mutations and their callbacks run under the bitmap's own lock, so a
/// callback observes a consistent state relative to other mutations. A
/// callback must not take locks that could be held while mutating this
/// bitmap.
#[derive(Debug, Default)]
pub struct ConcurrentBitMap {
    bits: Mutex<u64>,
}

impl ConcurrentBitMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// OR the bit in (or AND it out). Fires `changed` iff the any-bit-set
    /// predicate flipped, `not_changed` otherwise.
    pub fn cumulative_set_with(
        &self,
        index: u32,
        state: bool,
        changed: impl FnOnce(),
        not_changed: impl FnOnce(),
    ) -> Result<(), BitMapError> {
        self.mutate(
            index,
            |current, mask| if state { current | mask } else { current & !mask },
            changed,
            not_changed,
        )
    }

    /// OR the bit in (or AND it out)
    pub fn cumulative_set(&self, index: u32, state: bool) -> Result<(), BitMapError> {
        self.cumulative_set_with(index, state, || {}, || {})
    }

    /// Setting a bit to true clears all others; setting to false clears just
    /// that bit. Fires `changed` iff the any-bit-set predicate flipped,
    /// `not_changed` otherwise.
    pub fn exclusive_set_with(
        &self,
        index: u32,
        state: bool,
        changed: impl FnOnce(),
        not_changed: impl FnOnce(),
    ) -> Result<(), BitMapError> {
        self.mutate(
            index,
            |current, mask| if state { mask } else { current & !mask },
            changed,
            not_changed,
        )
    }

    /// Exclusive set without callbacks
    pub fn exclusive_set(&self, index: u32, state: bool) -> Result<(), BitMapError> {
        self.exclusive_set_with(index, state, || {}, || {})
    }

    /// The any-bit-set predicate
    pub fn any(&self) -> bool {
        *self.bits.lock() != 0
    }

    /// Raw bit pattern snapshot
    pub fn raw(&self) -> u64 {
        *self.bits.lock()
    }

    /// Index of the single set bit, `None` if no bit is set.
    ///
    /// Fails if more than one bit is set.
    pub fn unique_index(&self) -> Result<Option<u32>, BitMapError> {
        let state = *self.bits.lock();
        if state.count_ones() > 1 {
            return Err(BitMapError::MultipleBitsSet);
        }
        Ok(if state == 0 {
            None
        } else {
            Some(state.trailing_zeros())
        })
    }

    fn mutate(
        &self,
        index: u32,
        op: impl FnOnce(u64, u64) -> u64,
        changed: impl FnOnce(),
        not_changed: impl FnOnce(),
    ) -> Result<(), BitMapError> {
        if index > 63 {
            return Err(BitMapError::InvalidIndex(index));
        }
        let mask = 1u64 << index;
        let mut bits = self.bits.lock();
        let old = *bits;
        *bits = op(old, mask);
        if (*bits != 0) != (old != 0) {
            changed();
        } else {
            not_changed();
        }
        Ok(())
    }
}
