//! Dual-slot pointer field resolution.
//!
//! A pair field holds two independent slots. At any generation view, at most
//! one of them is authoritative; the tables in [`read_pair`] and
//! [`write_pair`] decide which, or report a typed failure when neither can
//! be trusted. Every combination of slot states is handled explicitly and
//! covered by the exhaustive test table at the bottom of this file.

use std::fmt;

use eyre::Result;

use crate::error::TreeError;
use crate::generation::{GenerationPair, MIN_GENERATION};

use super::slot::{read_slot, write_slot, RawSlot, NO_NODE, SLOT_SIZE};

/// Size of an encoded pair: slot A followed by slot B.
pub const PAIR_SIZE: usize = 2 * SLOT_SIZE;

/// Classification of one slot relative to a generation view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Never written: generation and pointer both zero.
    Empty,
    /// Checksum mismatch, or a generation outside the representable window.
    Broken,
    /// Written at or before the last checkpoint; survives a crash.
    Stable,
    /// Written during a generation that was abandoned by a crash and skipped
    /// by recovery; to be disregarded.
    Crash,
    /// Written during the current in-flight generation.
    Unstable,
}

impl SlotState {
    pub fn classify(slot: &RawSlot, gen: GenerationPair) -> Self {
        if slot.generation == 0 && slot.pointer == NO_NODE {
            return SlotState::Empty;
        }
        if !slot.checksum_ok {
            return SlotState::Broken;
        }
        if slot.generation < MIN_GENERATION || slot.generation > gen.unstable {
            return SlotState::Broken;
        }
        if slot.generation <= gen.stable {
            SlotState::Stable
        } else if slot.generation < gen.unstable {
            SlotState::Crash
        } else {
            SlotState::Unstable
        }
    }
}

/// Which physical slot a result refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotChoice {
    A,
    B,
}

/// Successful pair resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPointer {
    pub pointer: u64,
    pub slot: SlotChoice,
    pub generation: u64,
}

/// How the two raw generations compared at the moment of failure. Together
/// with the slot states this pins down exactly which row of the resolution
/// table rejected the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenComparison {
    Equal,
    ABig,
    BBig,
}

impl GenComparison {
    fn of(a: u64, b: u64) -> Self {
        match a.cmp(&b) {
            std::cmp::Ordering::Equal => GenComparison::Equal,
            std::cmp::Ordering::Greater => GenComparison::ABig,
            std::cmp::Ordering::Less => GenComparison::BBig,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairOp {
    Read,
    Write,
}

/// A pair that could not be resolved. Carries everything needed to render a
/// precise diagnostic: the operation, the generation comparison and both
/// slot states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairError {
    pub op: PairOp,
    pub comparison: GenComparison,
    pub state_a: SlotState,
    pub state_b: SlotState,
}

impl fmt::Display for PairError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            PairOp::Read => "read",
            PairOp::Write => "write",
        };
        let comparison = match self.comparison {
            GenComparison::Equal => "GEN_EQUAL",
            GenComparison::ABig => "GEN_A_BIG",
            GenComparison::BBig => "GEN_B_BIG",
        };
        write!(
            f,
            "ambiguous pointer pair on {}: {} slotA={:?} slotB={:?}",
            op, comparison, self.state_a, self.state_b
        )
    }
}

impl std::error::Error for PairError {}

/// Resolves a pair field to a single logical pointer.
///
/// A stable slot is self-sufficient: it survived a checkpoint, so whatever
/// sits next to it (empty, crash leftovers, a torn slot) cannot shadow it,
/// and a higher-generation stable or unstable partner simply wins. An
/// *unstable* slot is only trusted next to a stable or empty partner: a
/// crash or broken slot beside it means the pair has lost its durable half,
/// and, just as important for live readers, a slot that classifies as
/// broken because its generation lies beyond this view's horizon forces the
/// read to fail so the reader performs a generation catch-up instead of
/// continuing on a stale version of the tree.
pub fn read_pair(buf: &[u8], gen: GenerationPair) -> Result<ResolvedPointer, PairError> {
    let a = read_slot(&buf[..SLOT_SIZE]);
    let b = read_slot(&buf[SLOT_SIZE..PAIR_SIZE]);
    let state_a = SlotState::classify(&a, gen);
    let state_b = SlotState::classify(&b, gen);

    match (state_a, state_b) {
        (SlotState::Unstable, SlotState::Stable) | (SlotState::Unstable, SlotState::Empty) => {
            Ok(resolved(SlotChoice::A, &a))
        }
        (SlotState::Stable, SlotState::Unstable) | (SlotState::Empty, SlotState::Unstable) => {
            Ok(resolved(SlotChoice::B, &b))
        }
        (SlotState::Stable, SlotState::Stable) => match GenComparison::of(a.generation, b.generation)
        {
            GenComparison::ABig => Ok(resolved(SlotChoice::A, &a)),
            GenComparison::BBig => Ok(resolved(SlotChoice::B, &b)),
            GenComparison::Equal => Err(fail(PairOp::Read, &a, &b, state_a, state_b)),
        },
        (SlotState::Stable, _) => Ok(resolved(SlotChoice::A, &a)),
        (_, SlotState::Stable) => Ok(resolved(SlotChoice::B, &b)),
        _ => Err(fail(PairOp::Read, &a, &b, state_a, state_b)),
    }
}

/// Writes `pointer` into the pair at the unstable generation, choosing the
/// slot so that the last checkpointed value survives a crash:
///
/// 1. a slot already at the unstable generation is updated in place;
/// 2. with two stable slots the older one is overwritten;
/// 3. with one stable slot the *other* slot is overwritten; this is the
///    once-per-checkpoint flip that stands in for a write-ahead log;
/// 4. a never-written pair takes its first value in slot A.
pub fn write_pair(buf: &mut [u8], pointer: u64, gen: GenerationPair) -> Result<SlotChoice, PairError> {
    let a = read_slot(&buf[..SLOT_SIZE]);
    let b = read_slot(&buf[SLOT_SIZE..PAIR_SIZE]);
    let state_a = SlotState::classify(&a, gen);
    let state_b = SlotState::classify(&b, gen);

    let choice = match (state_a, state_b) {
        (SlotState::Stable, SlotState::Stable) => match GenComparison::of(a.generation, b.generation) {
            GenComparison::ABig => SlotChoice::B,
            GenComparison::BBig => SlotChoice::A,
            GenComparison::Equal => return Err(fail(PairOp::Write, &a, &b, state_a, state_b)),
        },
        // One stable slot: write the other one, whatever is in it: an
        // in-place update of an unstable value, or recycling of an empty,
        // crash or broken slot. The stable value stays untouched.
        (SlotState::Stable, _) => SlotChoice::B,
        (_, SlotState::Stable) => SlotChoice::A,
        // Without a stable protector an unstable slot may only be updated
        // in place when the partner is pristine.
        (SlotState::Unstable, SlotState::Empty) => SlotChoice::A,
        (SlotState::Empty, SlotState::Unstable) => SlotChoice::B,
        (SlotState::Empty, SlotState::Empty) => SlotChoice::A,
        _ => return Err(fail(PairOp::Write, &a, &b, state_a, state_b)),
    };

    let slot_buf = match choice {
        SlotChoice::A => &mut buf[..SLOT_SIZE],
        SlotChoice::B => &mut buf[SLOT_SIZE..PAIR_SIZE],
    };
    // The generation range was validated when `gen` was constructed.
    write_slot(slot_buf, pointer, gen.unstable).expect("unstable generation in range");
    Ok(choice)
}

/// Zeroes every slot classified as a crash slot under `gen`, returning how
/// many were cleaned. Run over all pages during recovery preparation:
/// crash slots belong to the generation the crash abandoned, and removing
/// them returns each pair to its checkpointed value (reachable nodes always
/// keep a stable slot; pairs first written in the crashed generation only
/// occur on nodes the recovered root cannot reach).
pub fn clean_crash_slots(buf: &mut [u8], gen: GenerationPair) -> usize {
    let mut cleaned = 0;
    for offset in [0, SLOT_SIZE] {
        let slot = read_slot(&buf[offset..offset + SLOT_SIZE]);
        if SlotState::classify(&slot, gen) == SlotState::Crash {
            buf[offset..offset + SLOT_SIZE].fill(0);
            cleaned += 1;
        }
    }
    cleaned
}

fn resolved(slot: SlotChoice, raw: &RawSlot) -> ResolvedPointer {
    ResolvedPointer {
        pointer: raw.pointer,
        slot,
        generation: raw.generation,
    }
}

fn fail(op: PairOp, a: &RawSlot, b: &RawSlot, state_a: SlotState, state_b: SlotState) -> PairError {
    PairError {
        op,
        comparison: GenComparison::of(a.generation, b.generation),
        state_a,
        state_b,
    }
}

/// Validates a resolved child pointer. Children must always point at a real
/// node; any resolution failure or NO_NODE here means the structure is
/// damaged.
pub fn check_child_pointer(
    result: Result<ResolvedPointer, PairError>,
    page_id: u64,
    pos: usize,
) -> Result<ResolvedPointer> {
    match result {
        Ok(r) if r.pointer != NO_NODE => Ok(r),
        Ok(r) => Err(TreeError::inconsistency(format!(
            "child pointer {} of node {} resolved to NO_NODE",
            pos, page_id
        ))
        .into()),
        Err(e) => Err(TreeError::inconsistency(format!(
            "child pointer {} of node {}: {}",
            pos, page_id, e
        ))
        .into()),
    }
}

/// Validates a resolved sibling or successor pointer, where NO_NODE is an
/// ordinary end-of-chain value.
pub fn check_sibling_pointer(
    result: Result<ResolvedPointer, PairError>,
    page_id: u64,
    field: &str,
) -> Result<ResolvedPointer> {
    match result {
        Ok(r) => Ok(r),
        Err(e) => Err(TreeError::inconsistency(format!(
            "{} pointer of node {}: {}",
            field, page_id, e
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The view used throughout: a recovery gap so that a crash generation
    // exists. stable=4, crash band={5}, unstable=6.
    fn gen() -> GenerationPair {
        GenerationPair::new(4, 6).unwrap()
    }

    const POINTER_A: u64 = 101;
    const POINTER_B: u64 = 202;

    fn slot_in_state(buf: &mut [u8], state: SlotState, pointer: u64) {
        match state {
            SlotState::Empty => buf[..SLOT_SIZE].fill(0),
            SlotState::Broken => {
                write_slot(&mut buf[..SLOT_SIZE], pointer, 3).unwrap();
                buf[16] ^= 0xFF;
            }
            SlotState::Stable => write_slot(&mut buf[..SLOT_SIZE], pointer, 3).unwrap(),
            SlotState::Crash => write_slot(&mut buf[..SLOT_SIZE], pointer, 5).unwrap(),
            SlotState::Unstable => write_slot(&mut buf[..SLOT_SIZE], pointer, 6).unwrap(),
        }
    }

    fn pair_in_states(state_a: SlotState, state_b: SlotState) -> [u8; PAIR_SIZE] {
        let mut buf = [0u8; PAIR_SIZE];
        slot_in_state(&mut buf[..SLOT_SIZE], state_a, POINTER_A);
        slot_in_state(&mut buf[SLOT_SIZE..], state_b, POINTER_B);
        buf
    }

    const ALL_STATES: [SlotState; 5] = [
        SlotState::Empty,
        SlotState::Broken,
        SlotState::Stable,
        SlotState::Crash,
        SlotState::Unstable,
    ];

    #[test]
    fn classify_covers_all_states() {
        let mut buf = [0u8; SLOT_SIZE];
        assert_eq!(SlotState::classify(&read_slot(&buf), gen()), SlotState::Empty);

        write_slot(&mut buf, 9, 3).unwrap();
        assert_eq!(SlotState::classify(&read_slot(&buf), gen()), SlotState::Stable);

        write_slot(&mut buf, 9, 4).unwrap();
        assert_eq!(SlotState::classify(&read_slot(&buf), gen()), SlotState::Stable);

        write_slot(&mut buf, 9, 5).unwrap();
        assert_eq!(SlotState::classify(&read_slot(&buf), gen()), SlotState::Crash);

        write_slot(&mut buf, 9, 6).unwrap();
        assert_eq!(SlotState::classify(&read_slot(&buf), gen()), SlotState::Unstable);

        buf[16] ^= 0x55;
        assert_eq!(SlotState::classify(&read_slot(&buf), gen()), SlotState::Broken);

        // A generation from the future is as untrustworthy as a bad checksum.
        write_slot(&mut buf, 9, 7).unwrap();
        assert_eq!(SlotState::classify(&read_slot(&buf), gen()), SlotState::Broken);
    }

    /// The full read table: every (state A, state B) combination, asserted
    /// individually. A stable slot wins over any non-stable partner; two
    /// stable slots at equal generations (as crafted here) fail GEN_EQUAL;
    /// an unstable slot wins only next to a stable or empty partner; next
    /// to crash, broken or another unstable slot the read must fail, which
    /// is what forces live readers into a generation catch-up.
    #[test]
    fn read_table_is_exhaustive() {
        for state_a in ALL_STATES {
            for state_b in ALL_STATES {
                let buf = pair_in_states(state_a, state_b);
                let result = read_pair(&buf, gen());

                let expected = match (state_a, state_b) {
                    (SlotState::Unstable, SlotState::Stable)
                    | (SlotState::Unstable, SlotState::Empty) => Some(SlotChoice::A),
                    (SlotState::Stable, SlotState::Unstable)
                    | (SlotState::Empty, SlotState::Unstable) => Some(SlotChoice::B),
                    // Both written at generation 3 in this fixture: a tie.
                    (SlotState::Stable, SlotState::Stable) => None,
                    (SlotState::Stable, _) => Some(SlotChoice::A),
                    (_, SlotState::Stable) => Some(SlotChoice::B),
                    _ => None,
                };

                match expected {
                    Some(SlotChoice::A) => {
                        let r = result.unwrap();
                        assert_eq!(r.slot, SlotChoice::A, "{state_a:?}/{state_b:?}");
                        assert_eq!(r.pointer, POINTER_A);
                        assert_eq!(r.generation, if state_a == SlotState::Unstable { 6 } else { 3 });
                    }
                    Some(SlotChoice::B) => {
                        let r = result.unwrap();
                        assert_eq!(r.slot, SlotChoice::B, "{state_a:?}/{state_b:?}");
                        assert_eq!(r.pointer, POINTER_B);
                        assert_eq!(r.generation, if state_b == SlotState::Unstable { 6 } else { 3 });
                    }
                    None => {
                        let err = result.unwrap_err();
                        assert_eq!(err.op, PairOp::Read, "{state_a:?}/{state_b:?}");
                        assert_eq!((err.state_a, err.state_b), (state_a, state_b));
                        if state_a == state_b {
                            assert_eq!(err.comparison, GenComparison::Equal);
                        }
                    }
                }
            }
        }
    }

    /// The full write table. A stable slot deflects the write into the
    /// other slot (in-place unstable update, or recycling of an empty,
    /// crash or broken slot); two stable slots overwrite the older one
    /// (equal generations rejected); without a stable protector only
    /// pristine pairs accept writes; a fresh pair starts in slot A.
    #[test]
    fn write_table_is_exhaustive() {
        for state_a in ALL_STATES {
            for state_b in ALL_STATES {
                let mut buf = pair_in_states(state_a, state_b);
                let result = write_pair(&mut buf, 777, gen());

                let expected = match (state_a, state_b) {
                    // Both stable at generation 3: a tie, rejected.
                    (SlotState::Stable, SlotState::Stable) => None,
                    (SlotState::Stable, _) => Some(SlotChoice::B),
                    (_, SlotState::Stable) => Some(SlotChoice::A),
                    (SlotState::Unstable, SlotState::Empty) => Some(SlotChoice::A),
                    (SlotState::Empty, SlotState::Unstable) => Some(SlotChoice::B),
                    (SlotState::Empty, SlotState::Empty) => Some(SlotChoice::A),
                    _ => None,
                };

                match expected {
                    Some(slot) => {
                        assert_eq!(result.unwrap(), slot, "{state_a:?}/{state_b:?}");
                        // The written pair must now read back as the new
                        // pointer at the unstable generation.
                        let r = read_pair(&buf, gen()).unwrap();
                        assert_eq!(r.pointer, 777, "{state_a:?}/{state_b:?}");
                        assert_eq!(r.generation, 6);
                        assert_eq!(r.slot, slot);
                    }
                    None => {
                        let err = result.unwrap_err();
                        assert_eq!(err.op, PairOp::Write, "{state_a:?}/{state_b:?}");
                        assert_eq!((err.state_a, err.state_b), (state_a, state_b));
                    }
                }
            }
        }
    }

    #[test]
    fn write_flips_slot_once_per_checkpoint_boundary() {
        let gen1 = GenerationPair::new(1, 2).unwrap();
        let mut buf = [0u8; PAIR_SIZE];

        // First ever write goes to A.
        assert_eq!(write_pair(&mut buf, 10, gen1).unwrap(), SlotChoice::A);
        // Still the same unstable generation: in-place update of A.
        assert_eq!(write_pair(&mut buf, 11, gen1).unwrap(), SlotChoice::A);

        // After a checkpoint, A is stable; the write must flip to B.
        let gen2 = gen1.checkpointed();
        assert_eq!(write_pair(&mut buf, 12, gen2).unwrap(), SlotChoice::B);
        assert_eq!(write_pair(&mut buf, 13, gen2).unwrap(), SlotChoice::B);

        // Next checkpoint: both slots stable, the older (A) is recycled.
        let gen3 = gen2.checkpointed();
        assert_eq!(write_pair(&mut buf, 14, gen3).unwrap(), SlotChoice::A);

        let r = read_pair(&buf, gen3).unwrap();
        assert_eq!(r.pointer, 14);
        assert_eq!(r.generation, gen3.unstable);
    }

    #[test]
    fn read_ignores_crash_slot_next_to_stable_value() {
        // A crashed in-flight write must not shadow the checkpointed value.
        let gen_before = GenerationPair::new(4, 5).unwrap();
        let mut buf = [0u8; PAIR_SIZE];
        write_slot(&mut buf[..SLOT_SIZE], 40, 4).unwrap();
        write_slot(&mut buf[SLOT_SIZE..], 50, 5).unwrap();

        // Before the crash the in-flight slot wins.
        assert_eq!(read_pair(&buf, gen_before).unwrap().pointer, 50);

        // After recovery bumps past generation 5 the stable slot wins again.
        let gen_after = gen_before.bumped_unstable();
        let r = read_pair(&buf, gen_after).unwrap();
        assert_eq!(r.pointer, 40);
        assert_eq!(r.slot, SlotChoice::A);
    }

    #[test]
    fn check_child_pointer_rejects_no_node() {
        let mut buf = [0u8; PAIR_SIZE];
        write_pair(&mut buf, NO_NODE, gen()).unwrap();

        let err = check_child_pointer(read_pair(&buf, gen()), 17, 0).unwrap_err();
        assert!(err.to_string().contains("NO_NODE"));
    }

    #[test]
    fn check_sibling_pointer_accepts_no_node() {
        let mut buf = [0u8; PAIR_SIZE];
        write_pair(&mut buf, NO_NODE, gen()).unwrap();

        let r = check_sibling_pointer(read_pair(&buf, gen()), 17, "right sibling").unwrap();
        assert_eq!(r.pointer, NO_NODE);
    }

    #[test]
    fn check_helpers_classify_failures_as_inconsistency() {
        use crate::error::TreeError;

        let buf = pair_in_states(SlotState::Crash, SlotState::Broken);
        let err = check_child_pointer(read_pair(&buf, gen()), 3, 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TreeError>(),
            Some(TreeError::Inconsistency(_))
        ));

        let err = check_sibling_pointer(read_pair(&buf, gen()), 3, "left sibling").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TreeError>(),
            Some(TreeError::Inconsistency(_))
        ));
    }

    #[test]
    fn cleaning_removes_crash_slots_and_restores_the_stable_value() {
        // Stable value 40 shadowed by a crashed in-flight write of 50.
        let mut buf = [0u8; PAIR_SIZE];
        write_slot(&mut buf[..SLOT_SIZE], 40, 4).unwrap();
        write_slot(&mut buf[SLOT_SIZE..], 50, 5).unwrap();
        let view = GenerationPair::new(4, 6).unwrap();

        assert_eq!(clean_crash_slots(&mut buf, view), 1);

        let r = read_pair(&buf, view).unwrap();
        assert_eq!(r.pointer, 40);
        // Idempotent.
        assert_eq!(clean_crash_slots(&mut buf, view), 0);
    }

    #[test]
    fn cleaning_leaves_stable_and_unstable_slots_alone() {
        let mut buf = pair_in_states(SlotState::Stable, SlotState::Unstable);
        assert_eq!(clean_crash_slots(&mut buf, gen()), 0);
        assert_eq!(read_pair(&buf, gen()).unwrap().pointer, POINTER_B);
    }

    #[test]
    fn failure_description_names_operation_and_states() {
        let buf = pair_in_states(SlotState::Crash, SlotState::Crash);
        let err = read_pair(&buf, gen()).unwrap_err();
        let description = err.to_string();
        assert!(description.contains("read"));
        assert!(description.contains("Crash"));
        assert!(description.contains("GEN_EQUAL"));
    }
}
