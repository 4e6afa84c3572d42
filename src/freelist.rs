//! Free-list id provider.
//!
//! Page ids released by copy-on-write are queued for reuse in a durable
//! FIFO, spread across linked free-list pages that are themselves ordinary
//! pages from the same id space (the list is self-hosting: a drained list
//! page goes back into the queue it just served).
//!
//! Every queued entry remembers the generation it was released at, and
//! [`FreeListIdProvider::acquire_new_id`] only hands an id back out once
//! that generation has become stable. Until then a concurrent reader could
//! still be traversing the page under its old identity, and a crash could
//! still roll the tree back to a state in which the page is live. When the
//! queue has nothing reusable the provider grows the store instead
//! (`last_id + 1`).
//!
//! ## Free-list page layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ------------------------------
//! 0       1     node type (2 = free-list page)
//! 1       8     next free-list page id (0 = none)
//! 9       16*N  entries: (release generation u64, page id u64)
//! ```
//!
//! Head positions (read page/pos, write page/pos) live in memory and are
//! persisted only through the tree state at checkpoint; the entries
//! themselves are regular page writes flushed by the same checkpoint.

use eyre::{bail, ensure, Result};

use crate::generation::GenerationPair;
use crate::node::NODE_TYPE_FREELIST;
use crate::state::TreeState;
use crate::store::PageStore;

pub const FREELIST_HEADER_SIZE: usize = 9;
pub const FREELIST_ENTRY_SIZE: usize = 16;

/// The free-list page a fresh store starts with.
pub const FREELIST_FIRST_PAGE: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeListIdProvider {
    write_page: u64,
    read_page: u64,
    write_pos: u32,
    read_pos: u32,
    last_id: u64,
}

pub fn entries_per_page(page_size: usize) -> u32 {
    ((page_size - FREELIST_HEADER_SIZE) / FREELIST_ENTRY_SIZE) as u32
}

/// Stamps an empty free-list page header.
pub fn initialize_page(store: &PageStore, id: u64) -> Result<()> {
    store.write(id, |page| {
        page.fill(0);
        page[0] = NODE_TYPE_FREELIST;
    })
}

fn entry_offset(pos: u32) -> usize {
    FREELIST_HEADER_SIZE + pos as usize * FREELIST_ENTRY_SIZE
}

fn read_entry(page: &[u8], pos: u32) -> (u64, u64) {
    let offset = entry_offset(pos);
    let generation = u64::from_le_bytes(page[offset..offset + 8].try_into().unwrap());
    let id = u64::from_le_bytes(page[offset + 8..offset + 16].try_into().unwrap());
    (generation, id)
}

fn write_entry(page: &mut [u8], pos: u32, generation: u64, id: u64) {
    let offset = entry_offset(pos);
    page[offset..offset + 8].copy_from_slice(&generation.to_le_bytes());
    page[offset + 8..offset + 16].copy_from_slice(&id.to_le_bytes());
}

fn next_page(page: &[u8]) -> u64 {
    u64::from_le_bytes(page[1..9].try_into().unwrap())
}

fn set_next_page(page: &mut [u8], next: u64) {
    page[1..9].copy_from_slice(&next.to_le_bytes());
}

impl FreeListIdProvider {
    /// Provider for a fresh store: an empty queue on the initial free-list
    /// page, with `last_id` covering the reserved ids and the first root.
    pub fn new(initial_page: u64, last_id: u64) -> Self {
        Self {
            write_page: initial_page,
            read_page: initial_page,
            write_pos: 0,
            read_pos: 0,
            last_id,
        }
    }

    pub fn from_state(state: &TreeState) -> Self {
        Self {
            write_page: state.freelist_write_page,
            read_page: state.freelist_read_page,
            write_pos: state.freelist_write_pos,
            read_pos: state.freelist_read_pos,
            last_id: state.last_id,
        }
    }

    pub fn last_id(&self) -> u64 {
        self.last_id
    }

    pub fn write_page(&self) -> u64 {
        self.write_page
    }

    pub fn read_page(&self) -> u64 {
        self.read_page
    }

    pub fn write_pos(&self) -> u32 {
        self.write_pos
    }

    pub fn read_pos(&self) -> u32 {
        self.read_pos
    }

    /// Hands out a page id: the oldest queued id whose release generation
    /// has become stable, or a freshly grown one.
    pub fn acquire_new_id(&mut self, store: &PageStore, gen: GenerationPair) -> Result<u64> {
        self.acquire(store, gen, true)
    }

    fn acquire(
        &mut self,
        store: &PageStore,
        gen: GenerationPair,
        allow_take_last: bool,
    ) -> Result<u64> {
        let entries = entries_per_page(store.page_size());
        let queue_non_empty = self.read_page != self.write_page || self.read_pos < self.write_pos;

        if queue_non_empty {
            let drains_page = self.read_pos + 1 >= entries;
            // Draining the read page releases that page back into the
            // queue; when called from inside `release_id` the write page is
            // full, so taking the last entry is deferred to a later call.
            if !drains_page || allow_take_last {
                let (release_generation, id) =
                    store.read(self.read_page, |page| read_entry(page, self.read_pos))?;
                if release_generation <= gen.stable {
                    self.read_pos += 1;
                    if self.read_pos >= entries {
                        let next = store.read(self.read_page, |page| next_page(page))?;
                        ensure!(
                            next != 0,
                            "free-list read page {} drained with no next page linked",
                            self.read_page
                        );
                        let drained = self.read_page;
                        self.read_page = next;
                        self.read_pos = 0;
                        self.release_id(store, gen, drained)?;
                    }
                    return Ok(id);
                }
            }
        }

        self.last_id += 1;
        store.grow_to(self.last_id);
        Ok(self.last_id)
    }

    /// Queues `id` for reuse once the current unstable generation has been
    /// checkpointed.
    pub fn release_id(&mut self, store: &PageStore, gen: GenerationPair, id: u64) -> Result<()> {
        ensure!(
            id >= FREELIST_FIRST_PAGE && id <= self.last_id,
            "released id {} outside the allocatable range [{}, {}]",
            id,
            FREELIST_FIRST_PAGE,
            self.last_id
        );

        let pos = self.write_pos;
        store.write(self.write_page, |page| {
            write_entry(page, pos, gen.unstable, id)
        })?;
        self.write_pos += 1;

        if self.write_pos >= entries_per_page(store.page_size()) {
            // Write page is full: link a fresh page and move the head over.
            let new_page = self.acquire(store, gen, false)?;
            initialize_page(store, new_page)?;
            store.write(self.write_page, |page| set_next_page(page, new_page))?;
            self.write_page = new_page;
            self.write_pos = 0;
        }
        Ok(())
    }

    /// Walks the queue, reporting every free-list page id and every queued
    /// (not yet re-acquired) page id. The consistency checker uses this to
    /// account for pages that are alive but unreachable from the root.
    pub fn visit(
        &self,
        store: &PageStore,
        mut on_freelist_page: impl FnMut(u64),
        mut on_free_id: impl FnMut(u64),
    ) -> Result<()> {
        let entries = entries_per_page(store.page_size());
        let mut page_id = self.read_page;
        loop {
            on_freelist_page(page_id);
            let start = if page_id == self.read_page { self.read_pos } else { 0 };
            let end = if page_id == self.write_page { self.write_pos } else { entries };
            let next = store.read(page_id, |page| {
                for pos in start..end {
                    on_free_id(read_entry(page, pos).1);
                }
                next_page(page)
            })?;
            if page_id == self.write_page {
                return Ok(());
            }
            if next == 0 {
                bail!(
                    "free-list chain broken: page {} has no next but write page {} not reached",
                    page_id,
                    self.write_page
                );
            }
            page_id = next;
        }
    }
}
