//! Tree mutation logic.
//!
//! Recursive insert and remove over the node layer, with the two structural
//! mechanisms layered in:
//!
//! - **Copy-on-write successors.** A node whose stored generation is at or
//!   behind the stable generation has survived a checkpoint and must never
//!   be mutated in its entry area again. Before the first such mutation per
//!   checkpoint interval the node is copied to a freshly acquired id, the
//!   copy is stamped with the unstable generation, the old page's successor
//!   pair points at the copy, both neighbours' sibling pairs are redirected,
//!   and the old id goes to the free list. Pointer-pair rewrites (child,
//!   sibling, successor fields) are crash-atomic on their own and happen in
//!   place even on stable nodes; only the flat key/value arrays need the
//!   copy.
//!
//! - **Structure propagation.** Splits and successor creations at one level
//!   are reported to the level above through [`StructurePropagation`], one
//!   instance per recursion level: the parent rewrites its child pointer
//!   for a successor and inserts the published `prim_key` plus right child
//!   for a split, which may cascade into its own copy/split. The caller of
//!   the root-level operation resolves what remains: a new root after a
//!   root split, or a moved root after a root copy.
//!
//! Removal is deliberately minimal: an exact hit shift-deletes within the
//! leaf (behind the same copy-on-write gate) and that is all. Underfull
//! leaves are never rebalanced or merged with siblings and the root is
//! never collapsed; superseded pages are reclaimed through the free list
//! instead. This matches the observed production behavior of the design
//! this engine follows.

use eyre::Result;

use crate::error::TreeError;
use crate::freelist::FreeListIdProvider;
use crate::generation::GenerationPair;
use crate::layout::Layout;
use crate::node::TreeNode;
use crate::pointer::{
    check_child_pointer, check_sibling_pointer, write_pair, PairError, NO_NODE, PAIR_SIZE,
};
use crate::store::PageStore;

/// Decides what happens when a write meets an existing key.
pub trait ValueMerger<K, V>: Send + Sync {
    /// `None` keeps the existing value untouched; `Some` replaces it.
    fn merge(&self, key: &K, existing: &V, incoming: &V) -> Option<V>;
}

/// Last write wins. The policy behind plain `put`.
pub struct Overwrite;

impl<K, V: Clone> ValueMerger<K, V> for Overwrite {
    fn merge(&self, _key: &K, _existing: &V, incoming: &V) -> Option<V> {
        Some(incoming.clone())
    }
}

/// First write wins; later writes of the same key are ignored.
pub struct KeepExisting;

impl<K, V> ValueMerger<K, V> for KeepExisting {
    fn merge(&self, _key: &K, _existing: &V, _incoming: &V) -> Option<V> {
        None
    }
}

/// Combines existing and incoming value with a function.
pub struct Combine<F>(pub F);

impl<K, V, F> ValueMerger<K, V> for Combine<F>
where
    F: Fn(&V, &V) -> V + Send + Sync,
{
    fn merge(&self, _key: &K, existing: &V, incoming: &V) -> Option<V> {
        Some((self.0)(existing, incoming))
    }
}

/// Structural changes one level reports to the level above.
#[derive(Debug, Clone)]
pub struct StructurePropagation<K> {
    pub has_split: bool,
    /// Left node of a split (the original, possibly as its successor).
    pub left: u64,
    /// Newly created right node of a split.
    pub right: u64,
    /// First key of the right node (leaf split) or the key moved up
    /// (internal split); the parent inserts it as the new separator.
    pub prim_key: Option<K>,
    pub has_new_gen: bool,
    /// Successor id the parent must rewire its child pointer to.
    pub new_gen_id: u64,
}

impl<K> Default for StructurePropagation<K> {
    fn default() -> Self {
        Self {
            has_split: false,
            left: NO_NODE,
            right: NO_NODE,
            prim_key: None,
            has_new_gen: false,
            new_gen_id: NO_NODE,
        }
    }
}

/// One mutation pass over the tree. Holds the writer-side resources for the
/// duration of a single insert or remove; the generation view is fixed at
/// construction.
pub(crate) struct TreeLogic<'a, L: Layout> {
    pub store: &'a PageStore,
    pub node: &'a TreeNode<L>,
    pub freelist: &'a mut FreeListIdProvider,
    pub gen: GenerationPair,
}

impl<'a, L: Layout> TreeLogic<'a, L> {
    pub fn insert(
        &mut self,
        root_id: u64,
        key: &L::Key,
        value: &L::Value,
        merger: &dyn ValueMerger<L::Key, L::Value>,
    ) -> Result<StructurePropagation<L::Key>> {
        self.insert_recursive(root_id, key, value, merger)
    }

    pub fn remove(
        &mut self,
        root_id: u64,
        key: &L::Key,
    ) -> Result<(Option<L::Value>, StructurePropagation<L::Key>)> {
        self.remove_recursive(root_id, key)
    }

    // --- descent ---

    fn read_header(&self, id: u64) -> Result<(bool, usize)> {
        let (node_type, is_internal, key_count) = self.store.read(id, |page| {
            (
                self.node.node_type(page),
                self.node.is_internal(page),
                self.node.key_count(page),
            )
        })?;
        if node_type != crate::node::NODE_TYPE_TREE {
            return Err(TreeError::inconsistency(format!(
                "page {} is not a tree node (type {})",
                id, node_type
            ))
            .into());
        }
        let max = if is_internal {
            self.node.internal_max_keys()
        } else {
            self.node.leaf_max_keys()
        };
        if key_count > max {
            return Err(TreeError::inconsistency(format!(
                "page {} reports {} keys, max is {}",
                id, key_count, max
            ))
            .into());
        }
        Ok((is_internal, key_count))
    }

    fn insert_recursive(
        &mut self,
        id: u64,
        key: &L::Key,
        value: &L::Value,
        merger: &dyn ValueMerger<L::Key, L::Value>,
    ) -> Result<StructurePropagation<L::Key>> {
        let (is_internal, key_count) = self.read_header(id)?;
        if is_internal {
            let (child_pos, child_id) = self.child_for(id, key, key_count)?;
            let child_prop = self.insert_recursive(child_id, key, value, merger)?;
            self.apply_child_changes(id, child_pos, child_prop)
        } else {
            self.insert_in_leaf(id, key, value, merger, key_count)
        }
    }

    fn remove_recursive(
        &mut self,
        id: u64,
        key: &L::Key,
    ) -> Result<(Option<L::Value>, StructurePropagation<L::Key>)> {
        let (is_internal, key_count) = self.read_header(id)?;
        if is_internal {
            let (child_pos, child_id) = self.child_for(id, key, key_count)?;
            let (removed, child_prop) = self.remove_recursive(child_id, key)?;
            // Removal never splits, so the only change to wire up is a
            // successor the child may have created.
            let prop = self.apply_child_changes(id, child_pos, child_prop)?;
            Ok((removed, prop))
        } else {
            self.remove_from_leaf(id, key, key_count)
        }
    }

    fn child_for(&self, id: u64, key: &L::Key, key_count: usize) -> Result<(usize, u64)> {
        let (child_pos, child) = self.store.read(id, |page| {
            let child_pos = self.node.search(page, key, key_count).child_position();
            (child_pos, self.node.child_at(page, child_pos, self.gen))
        })?;
        let resolved = check_child_pointer(child, id, child_pos)?;
        Ok((child_pos, resolved.pointer))
    }

    // --- structure propagation ---

    fn apply_child_changes(
        &mut self,
        id: u64,
        child_pos: usize,
        child_prop: StructurePropagation<L::Key>,
    ) -> Result<StructurePropagation<L::Key>> {
        let mut prop = StructurePropagation::default();

        if child_prop.has_new_gen {
            // Rewiring a child pointer is a pair write and therefore
            // crash-atomic in place; no copy of this node.
            let result = self.store.write(id, |page| {
                self.node
                    .set_child_at(page, child_prop.new_gen_id, child_pos, self.gen)
            })?;
            pair_write(result, id, "child")?;
        }

        if child_prop.has_split {
            let prim_key = child_prop
                .prim_key
                .expect("split propagation carries a prim key");
            let current = self.create_successor_if_needed(id, &mut prop)?;
            let key_count = self.store.read(current, |page| self.node.key_count(page))?;
            if key_count < self.node.internal_max_keys() {
                let result = self.store.write(current, |page| {
                    let pos = self.node.search(page, &prim_key, key_count).position();
                    self.node.insert_key_and_right_child_at(
                        page,
                        &prim_key,
                        child_prop.right,
                        pos,
                        key_count,
                        self.gen,
                    )
                })?;
                pair_write(result, current, "child")?;
            } else {
                self.split_internal(current, &prim_key, child_prop.right, key_count, &mut prop)?;
            }
        }

        Ok(prop)
    }

    // --- leaf level ---

    fn insert_in_leaf(
        &mut self,
        id: u64,
        key: &L::Key,
        value: &L::Value,
        merger: &dyn ValueMerger<L::Key, L::Value>,
        key_count: usize,
    ) -> Result<StructurePropagation<L::Key>> {
        let search = self
            .store
            .read(id, |page| self.node.search(page, key, key_count))?;
        let pos = search.position();
        let mut prop = StructurePropagation::default();

        if search.is_hit() {
            let existing = self.store.read(id, |page| self.node.value_at(page, pos))?;
            if let Some(merged) = merger.merge(key, &existing, value) {
                let current = self.create_successor_if_needed(id, &mut prop)?;
                self.store
                    .write(current, |page| self.node.set_value_at(page, &merged, pos))?;
            }
            return Ok(prop);
        }

        let current = self.create_successor_if_needed(id, &mut prop)?;
        if key_count < self.node.leaf_max_keys() {
            self.store.write(current, |page| {
                self.node.insert_key_value_at(page, key, value, pos, key_count)
            })?;
        } else {
            self.split_leaf(current, key, value, pos, &mut prop)?;
        }
        Ok(prop)
    }

    fn remove_from_leaf(
        &mut self,
        id: u64,
        key: &L::Key,
        key_count: usize,
    ) -> Result<(Option<L::Value>, StructurePropagation<L::Key>)> {
        let search = self
            .store
            .read(id, |page| self.node.search(page, key, key_count))?;
        if !search.is_hit() {
            return Ok((None, StructurePropagation::default()));
        }
        let pos = search.position();
        let removed = self.store.read(id, |page| self.node.value_at(page, pos))?;

        let mut prop = StructurePropagation::default();
        let current = self.create_successor_if_needed(id, &mut prop)?;
        self.store.write(current, |page| {
            self.node.remove_key_value_at(page, pos, key_count)
        })?;
        Ok((Some(removed), prop))
    }

    // --- splits ---

    fn split_leaf(
        &mut self,
        current: u64,
        key: &L::Key,
        value: &L::Value,
        insert_pos: usize,
        prop: &mut StructurePropagation<L::Key>,
    ) -> Result<()> {
        let old_right = check_sibling_pointer(
            self.store
                .read(current, |page| self.node.right_sibling(page, self.gen))?,
            current,
            "right sibling",
        )?
        .pointer;
        let new_right = self.freelist.acquire_new_id(self.store, self.gen)?;

        let (mut keys, mut values) = self
            .store
            .read(current, |page| self.node.collect_leaf_entries(page))?;
        keys.insert(insert_pos, key.clone());
        values.insert(insert_pos, value.clone());

        let keep_left = (keys.len() + 1) / 2;
        let prim_key = keys[keep_left].clone();

        let result = self.store.write(new_right, |page| {
            self.node.initialize_leaf(page, self.gen);
            self.node
                .set_leaf_entries(page, &keys[keep_left..], &values[keep_left..]);
            self.node.set_right_sibling(page, old_right, self.gen)?;
            self.node.set_left_sibling(page, current, self.gen)?;
            Ok::<(), PairError>(())
        })?;
        result.map_err(|e| pair_error(e, new_right, "sibling"))?;

        self.store.write(current, |page| {
            self.node
                .set_leaf_entries(page, &keys[..keep_left], &values[..keep_left])
        })?;

        self.relink_after_split(current, new_right, old_right)?;

        prop.has_split = true;
        prop.left = current;
        prop.right = new_right;
        prop.prim_key = Some(prim_key);
        Ok(())
    }

    fn split_internal(
        &mut self,
        current: u64,
        key: &L::Key,
        right_child: u64,
        key_count: usize,
        prop: &mut StructurePropagation<L::Key>,
    ) -> Result<()> {
        let old_right = check_sibling_pointer(
            self.store
                .read(current, |page| self.node.right_sibling(page, self.gen))?,
            current,
            "right sibling",
        )?
        .pointer;
        let new_right = self.freelist.acquire_new_id(self.store, self.gen)?;

        let (mut keys, mut children) = self
            .store
            .read(current, |page| self.node.collect_internal_entries(page))?;
        let insert_pos = {
            let mut lo = 0;
            while lo < keys.len() && keys[lo] < *key {
                lo += 1;
            }
            lo
        };
        keys.insert(insert_pos, key.clone());
        let mut new_child_pair = [0u8; PAIR_SIZE];
        write_pair(&mut new_child_pair, right_child, self.gen)
            .map_err(|e| pair_error(e, current, "child"))?;
        children.insert(insert_pos + 1, new_child_pair);

        // The middle key moves up; it lands in neither half.
        let keep_left = keys.len() / 2;
        let prim_key = keys[keep_left].clone();
        debug_assert!(key_count >= 2);

        let result = self.store.write(new_right, |page| {
            self.node.initialize_internal(page, self.gen);
            self.node
                .set_internal_entries(page, &keys[keep_left + 1..], &children[keep_left + 1..]);
            self.node.set_right_sibling(page, old_right, self.gen)?;
            self.node.set_left_sibling(page, current, self.gen)?;
            Ok::<(), PairError>(())
        })?;
        result.map_err(|e| pair_error(e, new_right, "sibling"))?;

        self.store.write(current, |page| {
            self.node
                .set_internal_entries(page, &keys[..keep_left], &children[..keep_left + 1])
        })?;

        self.relink_after_split(current, new_right, old_right)?;

        prop.has_split = true;
        prop.left = current;
        prop.right = new_right;
        prop.prim_key = Some(prim_key);
        Ok(())
    }

    /// After a split: old right sibling (if any) gains `new_right` as its
    /// left neighbour, and the split node points right at `new_right`. Both
    /// are in-place pair writes.
    fn relink_after_split(&self, current: u64, new_right: u64, old_right: u64) -> Result<()> {
        if old_right != NO_NODE {
            let result = self.store.write(old_right, |page| {
                self.node.set_left_sibling(page, new_right, self.gen)
            })?;
            pair_write(result, old_right, "left sibling")?;
        }
        let result = self.store.write(current, |page| {
            self.node.set_right_sibling(page, new_right, self.gen)
        })?;
        pair_write(result, current, "right sibling")?;
        Ok(())
    }

    // --- copy-on-write ---

    /// Copies `id` to a fresh page if its stored generation predates the
    /// current unstable generation, wiring successor and sibling pointers
    /// and recycling the old id. Returns the id mutations should target.
    pub fn create_successor_if_needed(
        &mut self,
        id: u64,
        prop: &mut StructurePropagation<L::Key>,
    ) -> Result<u64> {
        let node_generation = self.store.read(id, |page| self.node.generation(page))?;
        if node_generation == self.gen.unstable {
            return Ok(id);
        }

        let successor_id = self.freelist.acquire_new_id(self.store, self.gen)?;
        let bytes = self.store.read(id, |page| page.to_vec())?;
        let result = self.store.write(successor_id, |page| {
            page.copy_from_slice(&bytes);
            self.node.set_generation(page, self.gen.unstable);
            self.node.set_successor(page, NO_NODE, self.gen)
        })?;
        pair_write(result, successor_id, "successor")?;

        let result = self.store.write(id, |page| {
            self.node.set_successor(page, successor_id, self.gen)
        })?;
        pair_write(result, id, "successor")?;

        // Neighbours now link past the old version.
        let left = check_sibling_pointer(
            self.store.read(id, |page| self.node.left_sibling(page, self.gen))?,
            id,
            "left sibling",
        )?
        .pointer;
        if left != NO_NODE {
            let result = self.store.write(left, |page| {
                self.node.set_right_sibling(page, successor_id, self.gen)
            })?;
            pair_write(result, left, "right sibling")?;
        }
        let right = check_sibling_pointer(
            self.store.read(id, |page| self.node.right_sibling(page, self.gen))?,
            id,
            "right sibling",
        )?
        .pointer;
        if right != NO_NODE {
            let result = self.store.write(right, |page| {
                self.node.set_left_sibling(page, successor_id, self.gen)
            })?;
            pair_write(result, right, "left sibling")?;
        }

        self.freelist.release_id(self.store, self.gen, id)?;

        prop.has_new_gen = true;
        prop.new_gen_id = successor_id;
        Ok(successor_id)
    }
}

fn pair_error(e: PairError, id: u64, field: &str) -> eyre::Report {
    TreeError::inconsistency(format!("{} pair write on node {}: {}", field, id, e)).into()
}

fn pair_write<T>(result: Result<T, PairError>, id: u64, field: &str) -> Result<()> {
    result.map(|_| ()).map_err(|e| pair_error(e, id, field))
}
