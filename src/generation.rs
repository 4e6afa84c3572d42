//! Generation counters.
//!
//! The engine carries two generation numbers at all times: the *stable*
//! generation, which the last checkpoint made durable, and the *unstable*
//! generation (`stable + 1`), which tags every write made since. The pair
//! only advances at checkpoint, and always together, so `unstable ==
//! stable + 1` is an invariant of a healthy store.
//!
//! Generations are threaded explicitly through every operation as a
//! [`GenerationPair`] rather than read from shared state, which keeps the
//! tree logic reentrant and lets tests pin arbitrary generation views.
//!
//! Normally `unstable == stable + 1`. Recovery preparation widens the gap:
//! the crashed generation is skipped so that everything written during it
//! classifies as a crash pointer, leaving `unstable > stable + 1` until the
//! next checkpoint closes the gap again.

use eyre::{ensure, Result};

/// Lowest generation a pointer slot may carry. Generation 0 is reserved to
/// mean "empty slot".
pub const MIN_GENERATION: u64 = 1;

/// Upper bound on generation values. The top bit is kept clear so generation
/// arithmetic can never wrap into the reserved range.
pub const MAX_GENERATION: u64 = u64::MAX >> 1;

/// The stable/unstable generation view an operation runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationPair {
    pub stable: u64,
    pub unstable: u64,
}

impl GenerationPair {
    pub fn new(stable: u64, unstable: u64) -> Result<Self> {
        ensure!(
            (MIN_GENERATION..=MAX_GENERATION).contains(&stable),
            "stable generation {} out of range [{}, {}]",
            stable,
            MIN_GENERATION,
            MAX_GENERATION
        );
        ensure!(
            unstable > stable,
            "unstable generation {} must be ahead of stable generation {}",
            unstable,
            stable
        );
        Ok(Self { stable, unstable })
    }

    /// The pair a freshly created store starts from.
    pub fn initial() -> Self {
        Self {
            stable: MIN_GENERATION,
            unstable: MIN_GENERATION + 1,
        }
    }

    /// The pair in effect after a checkpoint of this pair completes.
    pub fn checkpointed(self) -> Self {
        Self {
            stable: self.unstable,
            unstable: self.unstable + 1,
        }
    }

    /// The pair in effect after recovery preparation: the crashed unstable
    /// generation is skipped, leaving its writes classified as crash
    /// pointers, while the stable generation stays put.
    pub fn bumped_unstable(self) -> Self {
        Self {
            stable: self.stable,
            unstable: self.unstable + 1,
        }
    }
}
