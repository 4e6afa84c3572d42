//! Tree orchestration: open/create, writer sessions, checkpointing.
//!
//! [`GenTree`] is a thin coordination layer over the real machinery (pair
//! resolution, tree logic, the seek cursor, the free list): it owns the
//! page store, publishes the current root and generation view to readers,
//! enforces the single-writer rule and runs the checkpoint protocol.
//!
//! ## Concurrency regime
//!
//! - Any number of threads may [`GenTree::seek`] concurrently; cursors
//!   synchronize with the writer purely through page versions and pointer
//!   pair resolution, never through locks.
//! - At most one [`GenTree::writer`] session exists at a time; requesting a
//!   second fails fast with [`TreeError::WriterAlreadyOpen`].
//! - [`GenTree::checkpoint`] excludes writers (it waits for an in-flight
//!   session and blocks new ones) but never readers: flush dirty pages,
//!   persist the tree state to the older of the two state pages, advance
//!   both generation counters, publish.
//!
//! ## Durability model
//!
//! There is no write-ahead log. Writes since the last checkpoint live only
//! in page memory until the next checkpoint flushes them; after a crash the
//! store reopens at its last checkpoint and the owner replays the writes
//! made since, after calling [`GenTree::prepare_for_recovery`] so that the
//! crashed generation's half-applied structure is classified out by the
//! pointer resolution rules rather than read.

pub(crate) mod logic;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::check::{CheckSummary, ConsistencyChecker};
use crate::error::TreeError;
use crate::freelist::{self, FreeListIdProvider, FREELIST_FIRST_PAGE};
use crate::generation::GenerationPair;
use crate::layout::Layout;
use crate::meta::MetaHeader;
use crate::node::TreeNode;
use crate::seek::{SeekCursor, TreeView};
use crate::state::{
    select_newest_valid, select_oldest_or_invalid, StatePage, TreeState, STATE_PAGE_A,
    STATE_PAGE_B,
};
use crate::store::{IoBudget, PageStore};
use crate::tree::logic::{Overwrite, StructurePropagation, TreeLogic, ValueMerger};

/// Page id of the first root; also the highest reserved-or-initial id.
const INITIAL_ROOT: u64 = 4;

/// The published root: a page id and the generation of the pointer that
/// published it (cursors check arrived-at nodes against it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Root {
    pub id: u64,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    gen: GenerationPair,
    root: Root,
}

/// Observation hooks for the store's lifecycle events.
pub trait Monitor: Send + Sync {
    /// A store file was absent and a fresh store was created.
    fn no_store_file(&self) {}
    /// A checkpoint completed; `stable_generation` is now durable.
    fn checkpoint_completed(&self, _stable_generation: u64) {}
    /// Recovery preparation bumped the unstable generation.
    fn recovery_prepared(&self, _unstable_generation: u64) {}
}

/// Monitor that ignores everything.
#[derive(Debug, Default)]
pub struct DefaultMonitor;

impl Monitor for DefaultMonitor {}

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub page_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self { page_size: 8192 }
    }
}

pub struct GenTree<L: Layout> {
    store: PageStore,
    node: TreeNode<L>,
    snapshot: RwLock<Snapshot>,
    freelist: Mutex<FreeListIdProvider>,
    writer_gate: RwLock<()>,
    writer_active: AtomicBool,
    monitor: Arc<dyn Monitor>,
}

impl<L: Layout> std::fmt::Debug for GenTree<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenTree")
            .field("writer_active", &self.writer_active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<L: Layout> GenTree<L> {
    /// Opens the store at `path`, creating it if absent. An existing file
    /// must have been created with the same page size and the same layout
    /// identity, or the open fails with [`TreeError::MetadataMismatch`]
    /// before any tree page is touched.
    pub fn open(path: &Path, layout: L, options: Options, monitor: Arc<dyn Monitor>) -> Result<Self> {
        let layout = Arc::new(layout);
        let node = TreeNode::new(Arc::clone(&layout), options.page_size)?;

        if path.exists() {
            Self::open_existing(path, layout, node, options, monitor)
        } else {
            Self::create_new(path, layout, node, options, monitor)
        }
    }

    fn create_new(
        path: &Path,
        layout: Arc<L>,
        node: TreeNode<L>,
        options: Options,
        monitor: Arc<dyn Monitor>,
    ) -> Result<Self> {
        debug!(path = %path.display(), page_size = options.page_size, "creating new store");
        monitor.no_store_file();

        let store = PageStore::create(path, options.page_size)?;
        store.grow_to(INITIAL_ROOT);

        let meta = MetaHeader::new(layout.as_ref(), options.page_size as u32);
        store.write(0, |page| meta.write_to(page))?;

        freelist::initialize_page(&store, FREELIST_FIRST_PAGE)?;

        let gen = GenerationPair::initial();
        store.write(INITIAL_ROOT, |page| node.initialize_leaf(page, gen))?;

        let provider = FreeListIdProvider::new(FREELIST_FIRST_PAGE, INITIAL_ROOT);
        let root = Root {
            id: INITIAL_ROOT,
            generation: gen.unstable,
        };
        let state = compose_state(gen, root, &provider);
        store.write(STATE_PAGE_A, |page| state.write_to(page))?;
        store.flush(&IoBudget::unlimited())?;

        let tree = Self {
            store,
            node,
            snapshot: RwLock::new(Snapshot { gen, root }),
            freelist: Mutex::new(provider),
            writer_gate: RwLock::new(()),
            writer_active: AtomicBool::new(false),
            monitor,
        };
        // Checkpoint immediately so the initial root is stable: a crash
        // before the first user checkpoint must not leave the root itself
        // inside the crashed generation band.
        tree.checkpoint(IoBudget::unlimited())?;
        Ok(tree)
    }

    fn open_existing(
        path: &Path,
        layout: Arc<L>,
        node: TreeNode<L>,
        options: Options,
        monitor: Arc<dyn Monitor>,
    ) -> Result<Self> {
        let store = PageStore::open(path, options.page_size)?;
        ensure!(
            store.page_count() > INITIAL_ROOT,
            "store file {} truncated: {} pages",
            path.display(),
            store.page_count()
        );

        let meta = store.read(0, |page| MetaHeader::read_from(page))??;
        meta.validate(layout.as_ref(), options.page_size as u32)?;

        let state_a = store.read(STATE_PAGE_A, |page| TreeState::read_from(page))?;
        let state_b = store.read(STATE_PAGE_B, |page| TreeState::read_from(page))?;
        if state_a.is_none() || state_b.is_none() {
            warn!(
                path = %path.display(),
                a_valid = state_a.is_some(),
                b_valid = state_b.is_some(),
                "a tree state page failed its checksum; using the other"
            );
        }
        let (state, picked) = select_newest_valid(state_a, state_b)?;
        debug!(
            path = %path.display(),
            stable = state.generation.stable,
            unstable = state.generation.unstable,
            root = state.root_id,
            state_page = ?picked,
            "opened store"
        );

        Ok(Self {
            store,
            node,
            snapshot: RwLock::new(Snapshot {
                gen: state.generation,
                root: Root {
                    id: state.root_id,
                    generation: state.root_generation,
                },
            }),
            freelist: Mutex::new(FreeListIdProvider::from_state(&state)),
            writer_gate: RwLock::new(()),
            writer_active: AtomicBool::new(false),
            monitor,
        })
    }

    /// The generation view operations currently run under.
    pub fn generation(&self) -> GenerationPair {
        self.snapshot.read().gen
    }

    /// The currently published root.
    pub fn root(&self) -> Root {
        self.snapshot.read().root
    }

    /// Opens the exclusive writer session. Fails fast if one is already
    /// open; blocks while a checkpoint is running.
    pub fn writer(&self) -> Result<Writer<'_, L>> {
        if self
            .writer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TreeError::WriterAlreadyOpen.into());
        }
        let gate = self.writer_gate.read();
        let freelist = self.freelist.lock();
        Ok(Writer {
            tree: self,
            freelist,
            _gate: gate,
        })
    }

    /// Lazy ordered scan over `[from, to)`.
    pub fn seek(&self, from: L::Key, to: L::Key) -> Result<SeekCursor<'_, L>> {
        SeekCursor::new(&self.store, &self.node, self, from, to)
    }

    /// Makes everything written so far durable and advances the generation
    /// pair. Blocks new writer sessions and waits for an in-flight one;
    /// readers are unaffected throughout.
    pub fn checkpoint(&self, budget: IoBudget) -> Result<()> {
        let _gate = self.writer_gate.write();
        let freelist = self.freelist.lock();
        let snapshot = *self.snapshot.read();

        // Order matters: data pages first, then the state that makes them
        // authoritative.
        self.store.flush(&budget)?;

        let next_gen = snapshot.gen.checkpointed();
        let state = compose_state(next_gen, snapshot.root, &freelist);
        self.write_state(&state)?;

        self.snapshot.write().gen = next_gen;
        info!(
            stable = next_gen.stable,
            root = snapshot.root.id,
            last_id = freelist.last_id(),
            "checkpoint completed"
        );
        self.monitor.checkpoint_completed(next_gen.stable);
        Ok(())
    }

    /// Prepares for replay after a crash: the generation that was in flight
    /// when the crash happened is skipped, so every pointer slot written
    /// during it classifies as a crash slot, and all such slots are scrubbed
    /// from the tree pages, returning every pair to its checkpointed value.
    /// The bumped state is persisted immediately, which keeps repeated
    /// crash-recover cycles monotone. Replaying the writes since the last
    /// checkpoint then rebuilds the lost updates.
    pub fn prepare_for_recovery(&self) -> Result<()> {
        let _gate = self.writer_gate.write();
        let freelist = self.freelist.lock();
        let snapshot = *self.snapshot.read();

        let next_gen = snapshot.gen.bumped_unstable();
        let cleaned = self.clean_crash_pointers(next_gen, freelist.last_id())?;

        let state = compose_state(next_gen, snapshot.root, &freelist);
        self.write_state(&state)?;

        self.snapshot.write().gen = next_gen;
        debug!(
            stable = next_gen.stable,
            unstable = next_gen.unstable,
            cleaned,
            "prepared for recovery"
        );
        self.monitor.recovery_prepared(next_gen.unstable);
        Ok(())
    }

    /// Scrubs crash slots from every tree page up to `last_id`.
    fn clean_crash_pointers(&self, gen: GenerationPair, last_id: u64) -> Result<usize> {
        let mut cleaned = 0;
        for id in FREELIST_FIRST_PAGE..=last_id.min(self.store.page_count().saturating_sub(1)) {
            let is_tree_node = self.store.read(id, |page| self.node.is_tree_node(page))?;
            if !is_tree_node {
                continue;
            }
            cleaned += self
                .store
                .write(id, |page| self.node.clean_crash_pointers(page, gen))?;
        }
        Ok(cleaned)
    }

    /// Full offline verification of the tree structure; takes the writer
    /// gate for its duration.
    pub fn consistency_check(&self) -> Result<CheckSummary> {
        let _gate = self.writer_gate.write();
        let freelist = self.freelist.lock();
        let snapshot = *self.snapshot.read();

        let summary = ConsistencyChecker::new(&self.store, &self.node, snapshot.gen)
            .check(snapshot.root, &freelist)?;
        info!(
            tree_pages = summary.tree_pages,
            keys = summary.keys,
            free_ids = summary.free_ids,
            "consistency check passed"
        );
        Ok(summary)
    }

    fn write_state(&self, state: &TreeState) -> Result<()> {
        let state_a = self.store.read(STATE_PAGE_A, |page| TreeState::read_from(page))?;
        let state_b = self.store.read(STATE_PAGE_B, |page| TreeState::read_from(page))?;
        let target: StatePage = select_oldest_or_invalid(state_a, state_b)?;
        self.store
            .write(target.page_id(), |page| state.write_to(page))?;
        self.store.flush(&IoBudget::unlimited())?;
        Ok(())
    }

}

impl<L: Layout> TreeView for GenTree<L> {
    fn generation(&self) -> GenerationPair {
        self.snapshot.read().gen
    }

    fn root(&self) -> Root {
        self.snapshot.read().root
    }
}

fn compose_state(gen: GenerationPair, root: Root, freelist: &FreeListIdProvider) -> TreeState {
    TreeState {
        generation: gen,
        root_id: root.id,
        root_generation: root.generation,
        last_id: freelist.last_id(),
        freelist_write_page: freelist.write_page(),
        freelist_read_page: freelist.read_page(),
        freelist_write_pos: freelist.write_pos(),
        freelist_read_pos: freelist.read_pos(),
    }
}

/// The exclusive mutator. Holds the single-writer slot and a shared hold on
/// the checkpoint gate for its whole lifetime; drop it to let a checkpoint
/// proceed.
pub struct Writer<'t, L: Layout> {
    tree: &'t GenTree<L>,
    freelist: MutexGuard<'t, FreeListIdProvider>,
    _gate: RwLockReadGuard<'t, ()>,
}

impl<'t, L: Layout> std::fmt::Debug for Writer<'t, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer").finish_non_exhaustive()
    }
}

impl<'t, L: Layout> Writer<'t, L> {
    /// Inserts or overwrites.
    pub fn put(&mut self, key: L::Key, value: L::Value) -> Result<()> {
        self.merge(key, value, &Overwrite)
    }

    /// Inserts, resolving collisions with an existing key through `merger`.
    pub fn merge(
        &mut self,
        key: L::Key,
        value: L::Value,
        merger: &dyn ValueMerger<L::Key, L::Value>,
    ) -> Result<()> {
        let snapshot = *self.tree.snapshot.read();
        let prop = {
            let mut logic = TreeLogic {
                store: &self.tree.store,
                node: &self.tree.node,
                freelist: &mut *self.freelist,
                gen: snapshot.gen,
            };
            logic.insert(snapshot.root.id, &key, &value, merger)?
        };
        self.handle_root_changes(prop, snapshot)
    }

    /// Removes `key`, returning the value it had.
    pub fn remove(&mut self, key: L::Key) -> Result<Option<L::Value>> {
        let snapshot = *self.tree.snapshot.read();
        let (removed, prop) = {
            let mut logic = TreeLogic {
                store: &self.tree.store,
                node: &self.tree.node,
                freelist: &mut *self.freelist,
                gen: snapshot.gen,
            };
            logic.remove(snapshot.root.id, &key)?
        };
        self.handle_root_changes(prop, snapshot)?;
        Ok(removed)
    }

    /// Resolves what the recursion could not: a root that moved to its
    /// successor, or a root split that needs a new root synthesized above
    /// the two halves.
    fn handle_root_changes(
        &mut self,
        prop: StructurePropagation<L::Key>,
        snapshot: Snapshot,
    ) -> Result<()> {
        if !prop.has_new_gen && !prop.has_split {
            return Ok(());
        }
        let gen = snapshot.gen;
        let mut root = snapshot.root;

        if prop.has_new_gen {
            root = Root {
                id: prop.new_gen_id,
                generation: gen.unstable,
            };
        }

        if prop.has_split {
            let new_root_id = self.freelist.acquire_new_id(&self.tree.store, gen)?;
            let prim_key = prop.prim_key.expect("split propagation carries a prim key");
            let node = &self.tree.node;
            let result = self.tree.store.write(new_root_id, |page| {
                node.initialize_internal(page, gen);
                node.set_child_at(page, prop.left, 0, gen)?;
                node.insert_key_and_right_child_at(page, &prim_key, prop.right, 0, 0, gen)?;
                Ok::<(), crate::pointer::PairError>(())
            })?;
            result.map_err(|e| {
                TreeError::inconsistency(format!("initializing new root {}: {}", new_root_id, e))
            })?;
            debug!(new_root = new_root_id, "root split");
            root = Root {
                id: new_root_id,
                generation: gen.unstable,
            };
        }

        self.tree.snapshot.write().root = root;
        Ok(())
    }
}

impl<L: Layout> Drop for Writer<'_, L> {
    fn drop(&mut self) {
        self.tree.writer_active.store(false, Ordering::Release);
    }
}
