//! Generation-safe pointers.
//!
//! Structural pointers in this engine (child links, sibling links, successor
//! links) are never updated by overwriting a single on-disk word. Each
//! pointer field is a *pair* of slots, and every write goes to whichever
//! slot is not protecting the last checkpointed value. Combined with the
//! generation tag carried by each slot, this makes pointer updates
//! crash-atomic without any write-ahead log: after a crash, each slot
//! independently classifies as stable, in-flight or abandoned, and a
//! deterministic comparison picks the survivor.
//!
//! ## Slot encoding
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ---------------------------------------------
//! 0       8     generation (little-endian, MIN_GENERATION..)
//! 8       8     pointer (page id; 0 = NO_NODE)
//! 16      2     checksum over (generation, pointer)
//! ```
//!
//! A pair is two slots back to back, slot A at offset 0 and slot B at
//! offset 18, 36 bytes total.
//!
//! ## Resolution
//!
//! Relative to the (stable, unstable) generation view, each slot is in one
//! of five states: EMPTY, BROKEN, STABLE, CRASH or UNSTABLE. The resolution
//! tables in [`pair`] map every (state A, state B) combination to either a
//! winning slot or a typed failure. That table is the single most
//! safety-critical piece of logic in the engine and is tested exhaustively,
//! one assertion per combination, in both read and write direction.

mod pair;
mod slot;

pub use pair::{
    check_child_pointer, check_sibling_pointer, clean_crash_slots, read_pair, write_pair,
    GenComparison, PairError, PairOp, ResolvedPointer, SlotChoice, SlotState, PAIR_SIZE,
};
pub use slot::{checksum_of, read_slot, write_slot, RawSlot, NO_NODE, SLOT_SIZE};
