//! # gentree - Generation-Safe Embedded B+Tree
//!
//! An embedded, page-oriented, ordered key-value B+tree index with range
//! scans, built as a storage primitive for a larger database. Three
//! properties drive the whole design:
//!
//! - **Crash consistency without a write-ahead log.** Every structural
//!   pointer on disk is a *pair* of (generation, pointer, checksum) slots;
//!   writes alternate slots across checkpoint boundaries so the last
//!   checkpointed value always survives a crash, and a deterministic
//!   comparison resolves which slot is authoritative. A crash mid-split
//!   leaves every node independently self-consistent under those rules.
//! - **One writer, lock-free readers.** A single exclusive writer session
//!   mutates the tree; any number of concurrent range scans run without
//!   locks, synchronizing through per-page version counters (reread on
//!   change) and the pointer resolution protocol (generation catch-up on
//!   ambiguity).
//! - **Incremental checkpointing.** A checkpoint flushes dirty pages,
//!   persists the root/allocator state to one of two alternating
//!   checksummed state pages and advances the stable/unstable generation
//!   pair. Recovery work is bounded to replaying the writes since the last
//!   checkpoint; the tree itself reads no log.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------+
//! |              GenTree (orchestration)             |
//! |   open/create . writer session . checkpoint      |
//! +-----------+------------------+-------------------+
//! | TreeLogic |    SeekCursor    | ConsistencyChecker|
//! | insert/   |  lock-free range |  offline audit    |
//! | remove/COW|      scans       |                   |
//! +-----------+------------------+-------------------+
//! |   TreeNode (page layout over a Layout)           |
//! |   generation-safe pointer pairs . free list      |
//! +--------------------------------------------------+
//! |   PageStore (versioned pages, flush, backing IO) |
//! +--------------------------------------------------+
//! ```
//!
//! ## On-disk layout
//!
//! Fixed-size pages in one file: page 0 holds the meta header (format and
//! layout identity), pages 1 and 2 alternate as tree-state pages, page 3
//! seeds the free list and page 4 the first root; everything beyond is
//! allocated on demand and recycled through the free list.
//!
//! ## Quick start
//!
//! ```ignore
//! use gentree::{GenTree, DefaultMonitor, Options, U64Layout, IoBudget};
//! use std::sync::Arc;
//!
//! let tree = GenTree::open(
//!     path,
//!     U64Layout::default(),
//!     Options::default(),
//!     Arc::new(DefaultMonitor),
//! )?;
//!
//! {
//!     let mut writer = tree.writer()?;
//!     writer.put(1, 100)?;
//!     writer.put(2, 200)?;
//! }
//! tree.checkpoint(IoBudget::unlimited())?;
//!
//! let mut cursor = tree.seek(0, u64::MAX)?;
//! while let Some((key, value)) = cursor.next()? {
//!     println!("{key} -> {value}");
//! }
//! # eyre::Ok(())
//! ```
//!
//! ## What this crate is not
//!
//! No networking or replication, no page eviction policy (the working set
//! is resident), and deliberately no rebalancing or merging of underfull
//! nodes on removal; space comes back through copy-on-write recycling,
//! not through merge logic.

pub mod check;
pub mod error;
pub mod freelist;
pub mod generation;
pub mod layout;
pub mod meta;
pub mod node;
pub mod pointer;
pub mod seek;
pub mod state;
pub mod store;
pub mod tree;

pub use check::CheckSummary;
pub use error::TreeError;
pub use generation::{GenerationPair, MAX_GENERATION, MIN_GENERATION};
pub use layout::{Layout, U64Layout};
pub use seek::{SeekCursor, TreeView};
pub use store::IoBudget;
pub use tree::logic::{Combine, KeepExisting, Overwrite, ValueMerger};
pub use tree::{DefaultMonitor, GenTree, Monitor, Options, Root, Writer};
