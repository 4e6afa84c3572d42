//! Tree node page layout.
//!
//! Every tree page, leaf or internal, starts with the same fixed header and
//! is followed by flat entry arrays sized from the layout's fixed key and
//! value widths. All offsets are computed once at construction; accessors
//! take the page bytes as a parameter so the same [`TreeNode`] instance
//! serves live pages, snapshots and scratch buffers alike.
//!
//! ## Page layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -------------------------------------------
//! 0       1     node type (1 = tree node, 2 = free-list)
//! 1       1     0 = leaf, 1 = internal
//! 2       8     node generation (the copy-on-write gate)
//! 10      4     key count
//! 14      36    right sibling pointer pair
//! 50      36    left sibling pointer pair
//! 86      36    successor pointer pair
//! 122     ...   entry area
//! ```
//!
//! Leaf entry area: key array, then value array, both indexed by logical
//! position. Internal entry area: key array, then child pointer-pair array
//! (`key_count + 1` children). Keeping keys and values in separate flat
//! arrays makes position shifts two `copy_within` calls.
//!
//! The node's own generation is distinct from the generations inside its
//! pointer pairs: it records when this physical page version was created,
//! and gates whether a mutation must copy the node first.

use std::sync::Arc;

use eyre::{ensure, Result};

use crate::generation::GenerationPair;
use crate::layout::Layout;
use crate::pointer::{
    clean_crash_slots, read_pair, write_pair, PairError, ResolvedPointer, SlotChoice, NO_NODE,
    PAIR_SIZE,
};

pub const NODE_TYPE_TREE: u8 = 1;
pub const NODE_TYPE_FREELIST: u8 = 2;

pub const BYTE_POS_NODE_TYPE: usize = 0;
pub const BYTE_POS_IS_INTERNAL: usize = 1;
pub const BYTE_POS_GENERATION: usize = 2;
pub const BYTE_POS_KEY_COUNT: usize = 10;
pub const BYTE_POS_RIGHT_SIBLING: usize = 14;
pub const BYTE_POS_LEFT_SIBLING: usize = 50;
pub const BYTE_POS_SUCCESSOR: usize = 86;
pub const NODE_HEADER_SIZE: usize = 122;

/// Result of a key search within one node. A miss carries the insertion
/// point so callers never search twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found(usize),
    NotFound(usize),
}

impl SearchResult {
    /// Position a mutation should operate at.
    pub fn position(self) -> usize {
        match self {
            SearchResult::Found(pos) | SearchResult::NotFound(pos) => pos,
        }
    }

    /// Child index to descend into from an internal node: an exact hit on a
    /// separator key belongs to the right subtree.
    pub fn child_position(self) -> usize {
        match self {
            SearchResult::Found(pos) => pos + 1,
            SearchResult::NotFound(pos) => pos,
        }
    }

    pub fn is_hit(self) -> bool {
        matches!(self, SearchResult::Found(_))
    }
}

#[derive(Debug)]
pub struct TreeNode<L: Layout> {
    layout: Arc<L>,
    page_size: usize,
    leaf_max_keys: usize,
    internal_max_keys: usize,
}

impl<L: Layout> TreeNode<L> {
    pub fn new(layout: Arc<L>, page_size: usize) -> Result<Self> {
        let key_size = layout.key_size();
        let value_size = layout.value_size();
        ensure!(key_size > 0, "layout key size must be non-zero");
        ensure!(
            page_size > NODE_HEADER_SIZE,
            "page size {} cannot fit the {}-byte node header",
            page_size,
            NODE_HEADER_SIZE
        );

        let entry_area = page_size - NODE_HEADER_SIZE;
        let leaf_max_keys = entry_area / (key_size + value_size);
        let internal_max_keys = entry_area.saturating_sub(PAIR_SIZE) / (key_size + PAIR_SIZE);
        ensure!(
            leaf_max_keys >= 2 && internal_max_keys >= 2,
            "page size {} fits only {} leaf / {} internal keys for this layout; at least 2 required",
            page_size,
            leaf_max_keys,
            internal_max_keys
        );

        Ok(Self {
            layout,
            page_size,
            leaf_max_keys,
            internal_max_keys,
        })
    }

    pub fn layout(&self) -> &L {
        &self.layout
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn leaf_max_keys(&self) -> usize {
        self.leaf_max_keys
    }

    pub fn internal_max_keys(&self) -> usize {
        self.internal_max_keys
    }

    // --- header ---

    /// Zeroes the page (acquired ids may carry recycled content), writes a
    /// leaf header at the unstable generation and seeds all three pointer
    /// pairs with explicit NO_NODE values, so later reads resolve instead
    /// of seeing never-written pairs.
    pub fn initialize_leaf(&self, page: &mut [u8], gen: GenerationPair) {
        self.initialize(page, 0, gen);
    }

    pub fn initialize_internal(&self, page: &mut [u8], gen: GenerationPair) {
        self.initialize(page, 1, gen);
    }

    fn initialize(&self, page: &mut [u8], is_internal: u8, gen: GenerationPair) {
        page.fill(0);
        page[BYTE_POS_NODE_TYPE] = NODE_TYPE_TREE;
        page[BYTE_POS_IS_INTERNAL] = is_internal;
        self.set_generation(page, gen.unstable);
        self.set_right_sibling(page, NO_NODE, gen)
            .expect("empty pair accepts first write");
        self.set_left_sibling(page, NO_NODE, gen)
            .expect("empty pair accepts first write");
        self.set_successor(page, NO_NODE, gen)
            .expect("empty pair accepts first write");
    }

    pub fn node_type(&self, page: &[u8]) -> u8 {
        page[BYTE_POS_NODE_TYPE]
    }

    pub fn is_tree_node(&self, page: &[u8]) -> bool {
        page[BYTE_POS_NODE_TYPE] == NODE_TYPE_TREE
    }

    pub fn is_internal(&self, page: &[u8]) -> bool {
        page[BYTE_POS_IS_INTERNAL] != 0
    }

    pub fn is_leaf(&self, page: &[u8]) -> bool {
        !self.is_internal(page)
    }

    pub fn generation(&self, page: &[u8]) -> u64 {
        u64::from_le_bytes(
            page[BYTE_POS_GENERATION..BYTE_POS_GENERATION + 8]
                .try_into()
                .unwrap(),
        )
    }

    pub fn set_generation(&self, page: &mut [u8], generation: u64) {
        page[BYTE_POS_GENERATION..BYTE_POS_GENERATION + 8]
            .copy_from_slice(&generation.to_le_bytes());
    }

    pub fn key_count(&self, page: &[u8]) -> usize {
        u32::from_le_bytes(
            page[BYTE_POS_KEY_COUNT..BYTE_POS_KEY_COUNT + 4]
                .try_into()
                .unwrap(),
        ) as usize
    }

    pub fn set_key_count(&self, page: &mut [u8], count: usize) {
        page[BYTE_POS_KEY_COUNT..BYTE_POS_KEY_COUNT + 4]
            .copy_from_slice(&(count as u32).to_le_bytes());
    }

    /// Max key count for the node kind actually on the page.
    pub fn max_keys(&self, page: &[u8]) -> usize {
        if self.is_internal(page) {
            self.internal_max_keys
        } else {
            self.leaf_max_keys
        }
    }

    // --- sibling and successor pointer pairs ---

    pub fn right_sibling(&self, page: &[u8], gen: GenerationPair) -> Result<ResolvedPointer, PairError> {
        read_pair(&page[BYTE_POS_RIGHT_SIBLING..BYTE_POS_RIGHT_SIBLING + PAIR_SIZE], gen)
    }

    pub fn set_right_sibling(
        &self,
        page: &mut [u8],
        pointer: u64,
        gen: GenerationPair,
    ) -> Result<SlotChoice, PairError> {
        write_pair(
            &mut page[BYTE_POS_RIGHT_SIBLING..BYTE_POS_RIGHT_SIBLING + PAIR_SIZE],
            pointer,
            gen,
        )
    }

    pub fn left_sibling(&self, page: &[u8], gen: GenerationPair) -> Result<ResolvedPointer, PairError> {
        read_pair(&page[BYTE_POS_LEFT_SIBLING..BYTE_POS_LEFT_SIBLING + PAIR_SIZE], gen)
    }

    pub fn set_left_sibling(
        &self,
        page: &mut [u8],
        pointer: u64,
        gen: GenerationPair,
    ) -> Result<SlotChoice, PairError> {
        write_pair(
            &mut page[BYTE_POS_LEFT_SIBLING..BYTE_POS_LEFT_SIBLING + PAIR_SIZE],
            pointer,
            gen,
        )
    }

    pub fn successor(&self, page: &[u8], gen: GenerationPair) -> Result<ResolvedPointer, PairError> {
        read_pair(&page[BYTE_POS_SUCCESSOR..BYTE_POS_SUCCESSOR + PAIR_SIZE], gen)
    }

    pub fn set_successor(
        &self,
        page: &mut [u8],
        pointer: u64,
        gen: GenerationPair,
    ) -> Result<SlotChoice, PairError> {
        write_pair(
            &mut page[BYTE_POS_SUCCESSOR..BYTE_POS_SUCCESSOR + PAIR_SIZE],
            pointer,
            gen,
        )
    }

    // --- entry offsets ---

    fn key_offset(&self, pos: usize) -> usize {
        NODE_HEADER_SIZE + pos * self.layout.key_size()
    }

    fn value_offset(&self, pos: usize) -> usize {
        NODE_HEADER_SIZE + self.leaf_max_keys * self.layout.key_size() + pos * self.layout.value_size()
    }

    /// Byte offset of the child pointer pair at a logical child position.
    /// Exposed so pairs can be addressed both ways; both must decode the
    /// same pointer.
    pub fn child_offset(&self, pos: usize) -> usize {
        NODE_HEADER_SIZE + self.internal_max_keys * self.layout.key_size() + pos * PAIR_SIZE
    }

    // --- entry access ---

    pub fn key_at(&self, page: &[u8], pos: usize) -> L::Key {
        let offset = self.key_offset(pos);
        self.layout.read_key(&page[offset..offset + self.layout.key_size()])
    }

    pub fn set_key_at(&self, page: &mut [u8], key: &L::Key, pos: usize) {
        let offset = self.key_offset(pos);
        self.layout
            .write_key(&mut page[offset..offset + self.layout.key_size()], key);
    }

    pub fn value_at(&self, page: &[u8], pos: usize) -> L::Value {
        let offset = self.value_offset(pos);
        self.layout
            .read_value(&page[offset..offset + self.layout.value_size()])
    }

    pub fn set_value_at(&self, page: &mut [u8], value: &L::Value, pos: usize) {
        let offset = self.value_offset(pos);
        self.layout
            .write_value(&mut page[offset..offset + self.layout.value_size()], value);
    }

    pub fn child_at(
        &self,
        page: &[u8],
        pos: usize,
        gen: GenerationPair,
    ) -> Result<ResolvedPointer, PairError> {
        let offset = self.child_offset(pos);
        read_pair(&page[offset..offset + PAIR_SIZE], gen)
    }

    pub fn set_child_at(
        &self,
        page: &mut [u8],
        pointer: u64,
        pos: usize,
        gen: GenerationPair,
    ) -> Result<SlotChoice, PairError> {
        let offset = self.child_offset(pos);
        write_pair(&mut page[offset..offset + PAIR_SIZE], pointer, gen)
    }

    pub fn child_pair_bytes(&self, page: &[u8], pos: usize) -> [u8; PAIR_SIZE] {
        let offset = self.child_offset(pos);
        page[offset..offset + PAIR_SIZE].try_into().unwrap()
    }

    pub fn set_child_pair_bytes(&self, page: &mut [u8], pos: usize, bytes: &[u8; PAIR_SIZE]) {
        let offset = self.child_offset(pos);
        page[offset..offset + PAIR_SIZE].copy_from_slice(bytes);
    }

    /// Zeroes crash slots in every pointer pair on this page: the three
    /// header pairs and, on internal nodes, all child pairs. Part of
    /// recovery preparation.
    pub fn clean_crash_pointers(&self, page: &mut [u8], gen: GenerationPair) -> usize {
        let mut cleaned = 0;
        for offset in [BYTE_POS_RIGHT_SIBLING, BYTE_POS_LEFT_SIBLING, BYTE_POS_SUCCESSOR] {
            cleaned += clean_crash_slots(&mut page[offset..offset + PAIR_SIZE], gen);
        }
        if self.is_internal(page) {
            let key_count = self.key_count(page).min(self.internal_max_keys);
            for pos in 0..=key_count {
                let offset = self.child_offset(pos);
                cleaned += clean_crash_slots(&mut page[offset..offset + PAIR_SIZE], gen);
            }
        }
        cleaned
    }

    // --- search ---

    /// Binary search over the key array.
    pub fn search(&self, page: &[u8], key: &L::Key, key_count: usize) -> SearchResult {
        let mut lo = 0usize;
        let mut hi = key_count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.key_at(page, mid).cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return SearchResult::Found(mid),
            }
        }
        SearchResult::NotFound(lo)
    }

    // --- leaf mutation ---

    /// Inserts a key/value at a logical position, shifting later entries
    /// right. Caller guarantees `key_count < leaf_max_keys`.
    pub fn insert_key_value_at(
        &self,
        page: &mut [u8],
        key: &L::Key,
        value: &L::Value,
        pos: usize,
        key_count: usize,
    ) {
        debug_assert!(key_count < self.leaf_max_keys);
        let key_size = self.layout.key_size();
        let value_size = self.layout.value_size();

        let key_start = self.key_offset(pos);
        page.copy_within(
            key_start..self.key_offset(key_count),
            key_start + key_size,
        );
        let value_start = self.value_offset(pos);
        page.copy_within(
            value_start..self.value_offset(key_count),
            value_start + value_size,
        );

        self.set_key_at(page, key, pos);
        self.set_value_at(page, value, pos);
        self.set_key_count(page, key_count + 1);
    }

    /// Removes the entry at a logical position, shifting later entries left.
    pub fn remove_key_value_at(&self, page: &mut [u8], pos: usize, key_count: usize) {
        debug_assert!(pos < key_count);
        let key_size = self.layout.key_size();
        let value_size = self.layout.value_size();

        page.copy_within(
            self.key_offset(pos) + key_size..self.key_offset(key_count),
            self.key_offset(pos),
        );
        page.copy_within(
            self.value_offset(pos) + value_size..self.value_offset(key_count),
            self.value_offset(pos),
        );
        self.set_key_count(page, key_count - 1);
    }

    // --- internal mutation ---

    /// Inserts a separator key and the child to its right, shifting later
    /// keys and children. Caller guarantees `key_count < internal_max_keys`.
    pub fn insert_key_and_right_child_at(
        &self,
        page: &mut [u8],
        key: &L::Key,
        child: u64,
        pos: usize,
        key_count: usize,
        gen: GenerationPair,
    ) -> Result<(), PairError> {
        debug_assert!(key_count < self.internal_max_keys);
        let key_size = self.layout.key_size();

        let key_start = self.key_offset(pos);
        page.copy_within(
            key_start..self.key_offset(key_count),
            key_start + key_size,
        );
        let child_start = self.child_offset(pos + 1);
        page.copy_within(
            child_start..self.child_offset(key_count + 1),
            child_start + PAIR_SIZE,
        );

        self.set_key_at(page, key, pos);
        // The shifted-from slot still holds a stale pair copy; the new child
        // starts from a clean pair so the first write lands in slot A.
        self.set_child_pair_bytes(page, pos + 1, &[0u8; PAIR_SIZE]);
        self.set_child_at(page, child, pos + 1, gen)?;
        self.set_key_count(page, key_count + 1);
        Ok(())
    }

    // --- bulk entry rewrites (splits, copies) ---

    pub fn collect_leaf_entries(&self, page: &[u8]) -> (Vec<L::Key>, Vec<L::Value>) {
        let count = self.key_count(page);
        let mut keys = Vec::with_capacity(count);
        let mut values = Vec::with_capacity(count);
        for pos in 0..count {
            keys.push(self.key_at(page, pos));
            values.push(self.value_at(page, pos));
        }
        (keys, values)
    }

    pub fn set_leaf_entries(&self, page: &mut [u8], keys: &[L::Key], values: &[L::Value]) {
        debug_assert_eq!(keys.len(), values.len());
        debug_assert!(keys.len() <= self.leaf_max_keys);
        for (pos, key) in keys.iter().enumerate() {
            self.set_key_at(page, key, pos);
        }
        for (pos, value) in values.iter().enumerate() {
            self.set_value_at(page, value, pos);
        }
        self.set_key_count(page, keys.len());
    }

    pub fn collect_internal_entries(&self, page: &[u8]) -> (Vec<L::Key>, Vec<[u8; PAIR_SIZE]>) {
        let count = self.key_count(page);
        let mut keys = Vec::with_capacity(count);
        let mut children = Vec::with_capacity(count + 1);
        for pos in 0..count {
            keys.push(self.key_at(page, pos));
        }
        for pos in 0..count + 1 {
            children.push(self.child_pair_bytes(page, pos));
        }
        (keys, children)
    }

    pub fn set_internal_entries(
        &self,
        page: &mut [u8],
        keys: &[L::Key],
        children: &[[u8; PAIR_SIZE]],
    ) {
        debug_assert_eq!(children.len(), keys.len() + 1);
        debug_assert!(keys.len() <= self.internal_max_keys);
        for (pos, key) in keys.iter().enumerate() {
            self.set_key_at(page, key, pos);
        }
        for (pos, child) in children.iter().enumerate() {
            self.set_child_pair_bytes(page, pos, child);
        }
        self.set_key_count(page, keys.len());
    }
}
