//! Mapping from sparse cursor numbers to dense bitmask positions.
//!
//! VM cursor numbers may be spread over the non-negative integers (3, 8,
//! 41, ...). To make full use of the 64 bits in a [`Bitmask`], the planner
//! translates them into consecutive bit positions starting at 0.
//!
//! Bits are assigned in FROM-list order, so for a FROM prefix of length k
//! the union of its masks is exactly `(1<<k)-1`. LEFT-JOIN analysis relies
//! on this: subtracting one from the right-table mask yields the mask of
//! every table to its left.

use lodestone_types::{Bitmask, CursorId, BMS};

/// The cursor-to-bit bijection for one planning call. Built once, then
/// immutable.
#[derive(Debug, Default)]
pub struct MaskSet {
    ix: Vec<CursorId>,
}

impl MaskSet {
    /// An empty mask set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new bit position for `cursor`. The FROM-list length is
    /// checked before planning begins, so the set cannot overflow.
    pub fn assign(&mut self, cursor: CursorId) {
        debug_assert!(self.ix.len() < BMS);
        self.ix.push(cursor);
    }

    /// The single-bit mask for `cursor`, or the empty mask if the cursor
    /// was never assigned.
    #[must_use]
    pub fn mask_of(&self, cursor: CursorId) -> Bitmask {
        self.ix
            .iter()
            .position(|&c| c == cursor)
            .map_or(Bitmask::EMPTY, Bitmask::bit)
    }

    /// Number of assigned cursors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ix.len()
    }

    /// Whether no cursor has been assigned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ix.is_empty()
    }
}
