//! # Concurrent Readers Under Writer And Checkpoint Pressure
//!
//! The lock-free reader contract: seek cursors running concurrently with
//! one writer and a checkpointing thread must never observe a missing key,
//! a duplicate, or an out-of-order result, for any seek that completes
//! without error.
//!
//! The writer inserts monotonically increasing keys and publishes a
//! watermark after each batch; a reader that starts a seek after observing
//! watermark `w` must therefore see *every* key in `[from, min(to, w))`.
//! Keys at or above the watermark may legitimately appear (they are being
//! inserted concurrently) but must still be in order and unique.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gentree::{DefaultMonitor, GenTree, IoBudget, Options, U64Layout};

const PAGE_SIZE: usize = 256;
const TOTAL_KEYS: u64 = 4_000;
const READERS: usize = 4;
const SEEKS_PER_READER: usize = 150;

#[test]
fn readers_never_observe_gaps_duplicates_or_reordering() {
    let dir = tempfile::tempdir().unwrap();
    let tree = Arc::new(
        GenTree::open(
            &dir.path().join("index.gt"),
            U64Layout::default(),
            Options {
                page_size: PAGE_SIZE,
            },
            Arc::new(DefaultMonitor),
        )
        .unwrap(),
    );

    let watermark = Arc::new(AtomicU64::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(READERS + 2));
    let mut handles = Vec::new();

    // Writer: monotonically increasing keys in small sessions, so the
    // checkpointer gets a chance to interleave.
    {
        let tree = Arc::clone(&tree);
        let watermark = Arc::clone(&watermark);
        let done = Arc::clone(&done);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            let mut next = 0u64;
            while next < TOTAL_KEYS {
                let mut writer = tree.writer().unwrap();
                let batch_end = (next + 50).min(TOTAL_KEYS);
                while next < batch_end {
                    writer.put(next, next * 3).unwrap();
                    next += 1;
                }
                drop(writer);
                watermark.store(next, Ordering::Release);
            }
            done.store(true, Ordering::Release);
        }));
    }

    // Checkpointer: random intervals until the writer finishes.
    {
        let tree = Arc::clone(&tree);
        let done = Arc::clone(&done);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            let mut rng = StdRng::seed_from_u64(99);
            while !done.load(Ordering::Acquire) {
                tree.checkpoint(IoBudget::unlimited()).unwrap();
                thread::sleep(std::time::Duration::from_micros(rng.gen_range(50..2000)));
            }
        }));
    }

    // Readers: repeated bounded seeks over random windows.
    for reader in 0..READERS {
        let tree = Arc::clone(&tree);
        let watermark = Arc::clone(&watermark);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            let mut rng = StdRng::seed_from_u64(reader as u64);
            for _ in 0..SEEKS_PER_READER {
                let observed = watermark.load(Ordering::Acquire);
                let from = rng.gen_range(0..TOTAL_KEYS);
                let to = (from + rng.gen_range(1..500)).min(u64::MAX);

                let mut cursor = tree.seek(from, to).unwrap();
                let mut previous: Option<u64> = None;
                let mut hits = Vec::new();
                while let Some((key, value)) = cursor.next().unwrap() {
                    assert_eq!(value, key * 3, "value corruption at key {key}");
                    assert!(key >= from && key < to, "key {key} outside [{from}, {to})");
                    if let Some(previous) = previous {
                        assert!(previous < key, "reordering: {previous} before {key}");
                    }
                    previous = Some(key);
                    hits.push(key);
                }

                // Everything below the watermark observed before the seek
                // started must be present: no gaps.
                let guaranteed_to = to.min(observed);
                if from < guaranteed_to {
                    let expected: Vec<u64> = (from..guaranteed_to).collect();
                    let below: Vec<u64> =
                        hits.iter().copied().filter(|k| *k < guaranteed_to).collect();
                    assert_eq!(
                        below, expected,
                        "gap in [{from}, {guaranteed_to}) observed by reader {reader}"
                    );
                }
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    // Everything settled: full audit.
    tree.consistency_check().unwrap();
    let mut cursor = tree.seek(0, u64::MAX).unwrap();
    let mut count = 0u64;
    while let Some((key, _)) = cursor.next().unwrap() {
        assert_eq!(key, count);
        count += 1;
    }
    assert_eq!(count, TOTAL_KEYS);
}

#[test]
fn long_lived_cursor_survives_generational_churn() {
    let dir = tempfile::tempdir().unwrap();
    let tree = Arc::new(
        GenTree::open(
            &dir.path().join("index.gt"),
            U64Layout::default(),
            Options {
                page_size: PAGE_SIZE,
            },
            Arc::new(DefaultMonitor),
        )
        .unwrap(),
    );

    {
        let mut writer = tree.writer().unwrap();
        for key in 0..1000u64 {
            writer.put(key * 2, key).unwrap();
        }
    }

    // A slow reader drains one long seek while the writer keeps inserting
    // odd keys behind and ahead of it and checkpoints keep rotating
    // generations under it.
    let tree2 = Arc::clone(&tree);
    let done = Arc::new(AtomicBool::new(false));
    let done2 = Arc::clone(&done);
    let churn = thread::spawn(move || {
        let mut key = 1u64;
        while !done2.load(Ordering::Acquire) && key < 4000 {
            {
                let mut writer = tree2.writer().unwrap();
                for _ in 0..20 {
                    writer.put(key, key).unwrap();
                    key += 2;
                }
            }
            tree2.checkpoint(IoBudget::unlimited()).unwrap();
        }
    });

    let mut cursor = tree.seek(0, 2000).unwrap();
    let mut previous: Option<u64> = None;
    let mut even_count = 0;
    while let Some((key, _)) = cursor.next().unwrap() {
        if let Some(previous) = previous {
            assert!(previous < key, "reordering: {previous} before {key}");
        }
        previous = Some(key);
        if key % 2 == 0 {
            even_count += 1;
        }
    }
    done.store(true, Ordering::Release);
    churn.join().unwrap();

    // All 1000 pre-existing even keys in [0, 2000) must have been seen.
    assert_eq!(even_count, 1000);
}
