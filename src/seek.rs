//! Range-scan cursor.
//!
//! A seek produces the keys in `[from, to)` in order, lazily, while a writer
//! may be restructuring the tree underneath it. The cursor takes no locks;
//! it works exclusively on page *snapshots* and reconciles with concurrent
//! mutation through three signals:
//!
//! 1. **Page version.** Before consuming the next entry the cursor compares
//!    the live version counter of its current page against the version its
//!    snapshot was taken at. A difference means the page changed and the
//!    snapshot is re-taken, with the position recomputed from the resume
//!    key (the last returned key, or the range start before the first hit).
//!    Keys that moved left of the resume point are skipped, keys at or
//!    right of it are picked up, and a returned key is never returned
//!    again.
//! 2. **Successor pointers.** A reread that finds a successor link follows
//!    it transparently: the node was copied by the writer and the copy is
//!    where the current entries live.
//! 3. **Generation catch-up.** A pointer pair that fails to resolve is not
//!    immediately fatal: a checkpoint may have advanced the generations
//!    since this cursor captured its view. The cursor refreshes its view
//!    and retries that read once; failure without a generation change is a
//!    real inconsistency and surfaces as [`TreeError::Inconsistency`].
//!
//! A node whose own generation is *ahead* of the pointer it was reached by,
//! or that changes generation between two reads, has been freed and reused;
//! the cursor then re-acquires the current root through the injected
//! [`TreeView`] and re-descends, anchored at the resume key. The cursor is
//! forward-only and not restartable.

use eyre::Result;

use crate::error::TreeError;
use crate::generation::GenerationPair;
use crate::layout::Layout;
use crate::node::TreeNode;
use crate::pointer::NO_NODE;
use crate::store::PageStore;
use crate::tree::Root;

/// Read access to the tree's published root and generation view. Injected
/// into cursors so they can catch up after checkpoints and root changes.
pub trait TreeView: Send + Sync {
    fn generation(&self) -> GenerationPair;
    fn root(&self) -> Root;
}

pub struct SeekCursor<'t, L: Layout> {
    store: &'t PageStore,
    node: &'t TreeNode<L>,
    view: &'t dyn TreeView,
    from: L::Key,
    to: L::Key,
    gen: GenerationPair,

    page_id: u64,
    page_version: u64,
    buf: Vec<u8>,
    pos: usize,
    key_count: usize,
    needs_reread: bool,

    /// Generation of the pointer most recently followed; the node reached
    /// must not be younger, or it was reused after the pointer was read.
    last_followed_pointer_gen: u64,
    /// Generation the current node held when first read; a change between
    /// reads likewise means reuse.
    expected_node_gen: u64,

    first: bool,
    prev_key: Option<L::Key>,
    exhausted: bool,
}

impl<'t, L: Layout> SeekCursor<'t, L> {
    pub(crate) fn new(
        store: &'t PageStore,
        node: &'t TreeNode<L>,
        view: &'t dyn TreeView,
        from: L::Key,
        to: L::Key,
    ) -> Result<Self> {
        let exhausted = from >= to;
        let mut cursor = Self {
            store,
            node,
            view,
            gen: view.generation(),
            from,
            to,
            page_id: NO_NODE,
            page_version: 0,
            buf: Vec::new(),
            pos: 0,
            key_count: 0,
            needs_reread: false,
            last_followed_pointer_gen: 0,
            expected_node_gen: 0,
            first: true,
            prev_key: None,
            exhausted,
        };
        if !cursor.exhausted {
            cursor.traverse_from_root()?;
        }
        Ok(cursor)
    }

    /// Produces the next hit, or `None` once the range is exhausted.
    pub fn next(&mut self) -> Result<Option<(L::Key, L::Value)>> {
        if self.exhausted {
            return Ok(None);
        }
        loop {
            if self.needs_reread || self.store.version(self.page_id)? != self.page_version {
                self.reread()?;
                continue;
            }

            if self.pos < self.key_count {
                let pos = self.pos;
                self.pos += 1;
                let key = self.node.key_at(&self.buf, pos);
                if key < self.from {
                    // Left of the range; can appear after a reread landed us
                    // on entries that shuffled leftwards.
                    continue;
                }
                if let Some(prev) = &self.prev_key {
                    if key <= *prev {
                        // Already returned (or passed); a concurrent split
                        // moved it under us. Skip, never re-return.
                        continue;
                    }
                }
                if key >= self.to {
                    self.exhausted = true;
                    return Ok(None);
                }
                let value = self.node.value_at(&self.buf, pos);
                self.prev_key = Some(key.clone());
                self.first = false;
                return Ok(Some((key, value)));
            }

            // Leaf consumed: step to the right sibling recorded in this
            // consistent snapshot.
            match self.node.right_sibling(&self.buf, self.gen) {
                Ok(sibling) if sibling.pointer == NO_NODE => {
                    self.exhausted = true;
                    return Ok(None);
                }
                Ok(sibling) => {
                    self.goto_page(sibling.pointer, sibling.generation);
                }
                Err(e) => {
                    if self.generation_catchup() {
                        // Explained by a checkpoint: re-take the snapshot
                        // and retry the sibling read under the new view.
                        self.needs_reread = true;
                        continue;
                    }
                    return Err(TreeError::inconsistency(format!(
                        "right sibling of node {} during seek: {}",
                        self.page_id, e
                    ))
                    .into());
                }
            }
        }
    }

    /// Key the scan must resume at after losing its position.
    fn resume_key(&self) -> &L::Key {
        self.prev_key.as_ref().unwrap_or(&self.from)
    }

    fn position_for_resume(&self) -> usize {
        let search = self.node.search(&self.buf, self.resume_key(), self.key_count);
        if self.first {
            // Range start is inclusive: an exact hit is the next result.
            search.position()
        } else {
            // The resume key itself was already returned.
            match search {
                crate::node::SearchResult::Found(pos) => pos + 1,
                crate::node::SearchResult::NotFound(pos) => pos,
            }
        }
    }

    fn goto_page(&mut self, id: u64, pointer_generation: u64) {
        self.page_id = id;
        self.last_followed_pointer_gen = pointer_generation;
        self.needs_reread = true;
    }

    fn generation_catchup(&mut self) -> bool {
        let current = self.view.generation();
        if current != self.gen {
            self.gen = current;
            true
        } else {
            false
        }
    }

    /// Re-snapshots the current page and revalidates everything read from
    /// it. Falls back to a fresh root descent when the page stopped being
    /// the leaf this cursor thinks it is.
    fn reread(&mut self) -> Result<()> {
        let version = self.store.snapshot_into(self.page_id, &mut self.buf)?;

        if !self.node.is_tree_node(&self.buf) || self.node.is_internal(&self.buf) {
            // Freed and reused as something else entirely.
            return self.traverse_from_root();
        }

        let node_gen = self.node.generation(&self.buf);
        if self.last_followed_pointer_gen != 0 {
            if node_gen > self.last_followed_pointer_gen {
                // Reused after the pointer to it was read.
                return self.traverse_from_root();
            }
            self.expected_node_gen = node_gen;
            self.last_followed_pointer_gen = 0;
        } else if node_gen != self.expected_node_gen {
            return self.traverse_from_root();
        }

        match self.node.successor(&self.buf, self.gen) {
            Ok(successor) if successor.pointer != NO_NODE => {
                // The writer copied this node; continue on the copy.
                self.goto_page(successor.pointer, successor.generation);
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                if self.generation_catchup() {
                    self.needs_reread = true;
                    return Ok(());
                }
                return Err(TreeError::inconsistency(format!(
                    "successor of node {} during seek: {}",
                    self.page_id, e
                ))
                .into());
            }
        }

        let key_count = self.node.key_count(&self.buf);
        if key_count > self.node.leaf_max_keys() {
            return self.traverse_from_root();
        }

        self.key_count = key_count;
        self.pos = self.position_for_resume();
        self.page_version = version;
        self.needs_reread = false;
        Ok(())
    }

    /// Catches up with the published root and descends to the leaf covering
    /// the resume key.
    fn traverse_from_root(&mut self) -> Result<()> {
        'restart: loop {
            self.gen = self.view.generation();
            let root = self.view.root();
            let mut id = root.id;
            let mut pointer_gen = root.generation;

            loop {
                let version = self.store.snapshot_into(id, &mut self.buf)?;
                if !self.node.is_tree_node(&self.buf) {
                    if self.generation_catchup() {
                        continue 'restart;
                    }
                    return Err(TreeError::inconsistency(format!(
                        "page {} reached from root is not a tree node",
                        id
                    ))
                    .into());
                }

                let node_gen = self.node.generation(&self.buf);
                if node_gen > pointer_gen {
                    // Reused between reading the pointer and arriving.
                    continue 'restart;
                }

                // A superseded node, internal or leaf, forwards to its
                // copy; the copy is where current structure lives.
                match self.node.successor(&self.buf, self.gen) {
                    Ok(successor) if successor.pointer != NO_NODE => {
                        id = successor.pointer;
                        pointer_gen = successor.generation;
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if self.generation_catchup() {
                            continue 'restart;
                        }
                        return Err(TreeError::inconsistency(format!(
                            "successor of node {} during seek: {}",
                            id, e
                        ))
                        .into());
                    }
                }

                if self.node.is_internal(&self.buf) {
                    let key_count = self.node.key_count(&self.buf);
                    if key_count > self.node.internal_max_keys() {
                        continue 'restart;
                    }
                    let child_pos = self
                        .node
                        .search(&self.buf, self.resume_key(), key_count)
                        .child_position();
                    match self.node.child_at(&self.buf, child_pos, self.gen) {
                        Ok(child) if child.pointer != NO_NODE => {
                            id = child.pointer;
                            pointer_gen = child.generation;
                        }
                        Ok(_) => {
                            return Err(TreeError::inconsistency(format!(
                                "child {} of node {} is NO_NODE during seek",
                                child_pos, id
                            ))
                            .into());
                        }
                        Err(e) => {
                            if self.generation_catchup() {
                                continue 'restart;
                            }
                            return Err(TreeError::inconsistency(format!(
                                "child {} of node {} during seek: {}",
                                child_pos, id, e
                            ))
                            .into());
                        }
                    }
                    continue;
                }

                // Arrived at a leaf with no successor.
                let key_count = self.node.key_count(&self.buf);
                if key_count > self.node.leaf_max_keys() {
                    continue 'restart;
                }

                self.page_id = id;
                self.page_version = version;
                self.expected_node_gen = node_gen;
                self.last_followed_pointer_gen = 0;
                self.key_count = key_count;
                self.pos = self.position_for_resume();
                self.needs_reread = false;
                return Ok(());
            }
        }
    }
}
