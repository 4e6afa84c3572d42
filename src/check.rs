//! Offline consistency checking.
//!
//! A full structural audit of the store under the current generation view,
//! run while no writer is active. Verified properties:
//!
//! - every pointer pair (children, siblings, successors) resolves without
//!   ambiguity, and no slot is in a crash or broken state;
//! - a pointer's recorded generation is never older than the generation
//!   stored on the page it points to (a younger target means the page was
//!   reused while something still pointed at it);
//! - no node reachable from the root carries a successor link (a live
//!   successor means a superseded version is still wired into the tree);
//! - keys are strictly ordered within each node and every subtree stays
//!   inside the bounds inherited from its ancestors' separator keys;
//! - per level, nodes form one doubly-linked sibling chain, visited left to
//!   right without gaps or loops, and all leaves sit at the same depth;
//! - every allocatable page id is accounted for exactly once: reachable
//!   from the root, serving as a free-list page, or queued in the free
//!   list.

use eyre::Result;
use hashbrown::HashSet;
use smallvec::SmallVec;

use crate::error::TreeError;
use crate::freelist::{FreeListIdProvider, FREELIST_FIRST_PAGE};
use crate::generation::GenerationPair;
use crate::layout::Layout;
use crate::node::{TreeNode, NODE_TYPE_TREE};
use crate::pointer::NO_NODE;
use crate::store::PageStore;
use crate::tree::Root;

/// What a passing check covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckSummary {
    pub tree_pages: usize,
    pub keys: usize,
    pub freelist_pages: usize,
    pub free_ids: usize,
}

/// Trees of any realistic size stay under this depth; the chain stack is
/// stack-allocated up to it.
const EXPECTED_MAX_DEPTH: usize = 16;

pub(crate) struct ConsistencyChecker<'a, L: Layout> {
    store: &'a PageStore,
    node: &'a TreeNode<L>,
    gen: GenerationPair,
    seen: HashSet<u64>,
    tree_pages: usize,
    keys: usize,
    /// Per level: id and right-sibling pointer of the rightmost node
    /// visited so far.
    chain: SmallVec<[(u64, u64); EXPECTED_MAX_DEPTH]>,
    leaf_level: Option<usize>,
}

impl<'a, L: Layout> ConsistencyChecker<'a, L> {
    pub fn new(store: &'a PageStore, node: &'a TreeNode<L>, gen: GenerationPair) -> Self {
        Self {
            store,
            node,
            gen,
            seen: HashSet::new(),
            tree_pages: 0,
            keys: 0,
            chain: SmallVec::new(),
            leaf_level: None,
        }
    }

    pub fn check(mut self, root: Root, freelist: &FreeListIdProvider) -> Result<CheckSummary> {
        self.check_subtree(root.id, root.generation, None, None, 0)?;

        // Every per-level chain must terminate.
        for (level, &(id, right)) in self.chain.iter().enumerate() {
            if right != NO_NODE {
                return inconsistency(format!(
                    "rightmost node {} at level {} still has right sibling {}",
                    id, level, right
                ));
            }
        }

        // Account for the pages the free list owns.
        let mut freelist_pages = Vec::new();
        let mut free_ids = Vec::new();
        freelist.visit(
            self.store,
            |page| freelist_pages.push(page),
            |id| free_ids.push(id),
        )?;
        for id in freelist_pages.iter().chain(free_ids.iter()) {
            if !self.seen.insert(*id) {
                return inconsistency(format!(
                    "page {} is both reachable from the root and owned by the free list",
                    id
                ));
            }
        }

        // Exactly-once coverage of the allocatable id space.
        for id in FREELIST_FIRST_PAGE..=freelist.last_id() {
            if !self.seen.contains(&id) {
                return inconsistency(format!(
                    "page {} is neither reachable from the root nor in the free list",
                    id
                ));
            }
        }

        Ok(CheckSummary {
            tree_pages: self.tree_pages,
            keys: self.keys,
            freelist_pages: freelist_pages.len(),
            free_ids: free_ids.len(),
        })
    }

    fn check_subtree(
        &mut self,
        id: u64,
        pointer_generation: u64,
        lower: Option<&L::Key>,
        upper: Option<&L::Key>,
        level: usize,
    ) -> Result<()> {
        if !self.seen.insert(id) {
            return inconsistency(format!("page {} reached twice from the root", id));
        }
        self.tree_pages += 1;

        let page = self.store.read(id, |page| page.to_vec())?;

        if self.node.node_type(&page) != NODE_TYPE_TREE {
            return inconsistency(format!(
                "page {} reached from the root is not a tree node (type {})",
                id,
                self.node.node_type(&page)
            ));
        }

        let node_generation = self.node.generation(&page);
        if node_generation > pointer_generation {
            return inconsistency(format!(
                "node {} has generation {} but was reached through a pointer of generation {}",
                id, node_generation, pointer_generation
            ));
        }

        let successor = match self.node.successor(&page, self.gen) {
            Ok(successor) => successor,
            Err(e) => return inconsistency(format!("successor pair of node {}: {}", id, e)),
        };
        if successor.pointer != NO_NODE {
            return inconsistency(format!(
                "reachable node {} still points to a newer version {}",
                id, successor.pointer
            ));
        }

        let left_sibling = match self.node.left_sibling(&page, self.gen) {
            Ok(sibling) => sibling.pointer,
            Err(e) => return inconsistency(format!("left sibling pair of node {}: {}", id, e)),
        };
        let right_sibling = match self.node.right_sibling(&page, self.gen) {
            Ok(sibling) => sibling.pointer,
            Err(e) => return inconsistency(format!("right sibling pair of node {}: {}", id, e)),
        };

        // Sibling chain, built from the left-to-right visit order.
        if self.chain.len() == level {
            if left_sibling != NO_NODE {
                return inconsistency(format!(
                    "leftmost node {} at level {} has left sibling {}",
                    id, level, left_sibling
                ));
            }
            self.chain.push((id, right_sibling));
        } else {
            let (previous, previous_right) = self.chain[level];
            if previous_right != id {
                return inconsistency(format!(
                    "node {} at level {} points right at {} but {} follows it in the chain",
                    previous, level, previous_right, id
                ));
            }
            if left_sibling != previous {
                return inconsistency(format!(
                    "node {} at level {} has left sibling {} but follows {}",
                    id, level, left_sibling, previous
                ));
            }
            self.chain[level] = (id, right_sibling);
        }

        let key_count = self.node.key_count(&page);
        let max = self.node.max_keys(&page);
        if key_count > max {
            return inconsistency(format!(
                "node {} reports {} keys, max is {}",
                id, key_count, max
            ));
        }

        // Strict ordering and inherited bounds.
        let mut previous_key: Option<L::Key> = None;
        for pos in 0..key_count {
            let key = self.node.key_at(&page, pos);
            if let Some(prev) = &previous_key {
                if *prev >= key {
                    return inconsistency(format!(
                        "node {} keys out of order at position {}",
                        id, pos
                    ));
                }
            }
            if let Some(lower) = lower {
                if key < *lower {
                    return inconsistency(format!(
                        "node {} key at position {} below the subtree's lower bound",
                        id, pos
                    ));
                }
            }
            if let Some(upper) = upper {
                if key >= *upper {
                    return inconsistency(format!(
                        "node {} key at position {} at or above the subtree's upper bound",
                        id, pos
                    ));
                }
            }
            previous_key = Some(key);
        }

        if self.node.is_internal(&page) {
            for pos in 0..=key_count {
                let child = match self.node.child_at(&page, pos, self.gen) {
                    Ok(child) => child,
                    Err(e) => {
                        return inconsistency(format!(
                            "child pair {} of node {}: {}",
                            pos, id, e
                        ))
                    }
                };
                if child.pointer == NO_NODE {
                    return inconsistency(format!("child {} of node {} is NO_NODE", pos, id));
                }
                let child_lower = if pos == 0 {
                    lower.cloned()
                } else {
                    Some(self.node.key_at(&page, pos - 1))
                };
                let child_upper = if pos == key_count {
                    upper.cloned()
                } else {
                    Some(self.node.key_at(&page, pos))
                };
                self.check_subtree(
                    child.pointer,
                    child.generation,
                    child_lower.as_ref(),
                    child_upper.as_ref(),
                    level + 1,
                )?;
            }
        } else {
            self.keys += key_count;
            match self.leaf_level {
                None => self.leaf_level = Some(level),
                Some(expected) if expected != level => {
                    return inconsistency(format!(
                        "leaf {} at level {} but other leaves are at level {}",
                        id, level, expected
                    ));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}

fn inconsistency<T>(msg: String) -> Result<T> {
    Err(TreeError::Inconsistency(msg).into())
}
