//! Paged storage with optimistic read signaling.
//!
//! Pages live in heap buffers, one per page id, and are persisted to a
//! single backing file with positioned writes at flush time. The interesting
//! part is the concurrency contract:
//!
//! - Exactly one thread mutates pages at a time (the writer session, or a
//!   checkpoint/recovery holding the writer gate). Mutation goes through
//!   [`PageStore::write`], which brackets the change with version counter
//!   bumps.
//! - Any number of reader threads take page *snapshots* through
//!   [`PageStore::snapshot_into`]: copy the bytes, then confirm the version
//!   counter did not move during the copy, retrying until it holds still.
//!   The version counter doubles as the "page changed since I looked"
//!   signal that drives the seek cursor's reread protocol.
//!
//! ```text
//! writer:   version += 1 (odd)   mutate bytes   version += 1 (even)
//! reader:   v1 = version (even?) copy bytes     v2 = version; v1 == v2?
//! ```
//!
//! Readers never block and never take a lock on the data path; a torn copy
//! is detected by the version check and simply redone. [`PageStore::read`]
//! hands out direct borrows without the version dance and is only for
//! contexts that hold the writer role themselves.
//!
//! ## Durability
//!
//! Flushing writes every dirty page with a positioned write and fsyncs once
//! at the end. A page write is assumed atomic at the device level for the
//! configured page size; cross-page structural consistency is the tree's
//! job (generation tagging), not the store's.

use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock};

pub const MIN_PAGE_SIZE: usize = 64;
pub const MAX_PAGE_SIZE: usize = 1 << 22;

/// Limits how much IO a single flush may issue per batch, so a checkpoint
/// can be throttled instead of saturating the device. `unlimited` flushes
/// everything in one go.
#[derive(Debug, Clone, Copy)]
pub struct IoBudget {
    pages_per_batch: Option<usize>,
}

impl IoBudget {
    pub fn unlimited() -> Self {
        Self {
            pages_per_batch: None,
        }
    }

    pub fn pages_per_batch(pages: usize) -> Self {
        Self {
            pages_per_batch: Some(pages.max(1)),
        }
    }

    fn batch(&self) -> usize {
        self.pages_per_batch.unwrap_or(usize::MAX)
    }
}

struct PageBuf {
    version: AtomicU64,
    data: UnsafeCell<Box<[u8]>>,
}

// Safety: `data` is only mutated by the single writer thread, inside
// `PageStore::write`, bracketed by odd/even version bumps. Concurrent
// readers only ever copy the bytes out and validate the version afterwards,
// discarding any copy that overlapped a mutation.
unsafe impl Sync for PageBuf {}
unsafe impl Send for PageBuf {}

impl PageBuf {
    fn zeroed(page_size: usize) -> Self {
        Self {
            version: AtomicU64::new(0),
            data: UnsafeCell::new(vec![0u8; page_size].into_boxed_slice()),
        }
    }

    fn from_bytes(bytes: Box<[u8]>) -> Self {
        Self {
            version: AtomicU64::new(0),
            data: UnsafeCell::new(bytes),
        }
    }
}

pub struct PageStore {
    page_size: usize,
    pages: RwLock<Vec<Arc<PageBuf>>>,
    dirty: Mutex<HashSet<u64>>,
    file: Option<Mutex<File>>,
}

impl PageStore {
    /// Creates a store backed by `path`, truncating any existing file.
    pub fn create(path: &Path, page_size: usize) -> Result<Self> {
        validate_page_size(page_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("creating store file {}", path.display()))?;
        Ok(Self {
            page_size,
            pages: RwLock::new(Vec::new()),
            dirty: Mutex::new(HashSet::new()),
            file: Some(Mutex::new(file)),
        })
    }

    /// Opens an existing store file, loading every page into memory.
    pub fn open(path: &Path, page_size: usize) -> Result<Self> {
        validate_page_size(page_size)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("opening store file {}", path.display()))?;

        let len = file.metadata()?.len() as usize;
        ensure!(
            len % page_size == 0,
            "store file {} length {} is not a multiple of page size {}",
            path.display(),
            len,
            page_size
        );

        let mut pages = Vec::with_capacity(len / page_size);
        let mut buf = vec![0u8; page_size];
        file.seek(SeekFrom::Start(0))?;
        for _ in 0..len / page_size {
            file.read_exact(&mut buf)?;
            pages.push(Arc::new(PageBuf::from_bytes(
                buf.clone().into_boxed_slice(),
            )));
        }

        Ok(Self {
            page_size,
            pages: RwLock::new(pages),
            dirty: Mutex::new(HashSet::new()),
            file: Some(Mutex::new(file)),
        })
    }

    /// A store with no backing file. Flush becomes a no-op; everything else
    /// behaves identically. Used by unit tests exercising tree logic.
    pub fn in_memory(page_size: usize) -> Self {
        validate_page_size(page_size).expect("valid page size");
        Self {
            page_size,
            pages: RwLock::new(Vec::new()),
            dirty: Mutex::new(HashSet::new()),
            file: None,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u64 {
        self.pages.read().len() as u64
    }

    /// Ensures pages `0..=id` exist, appending zeroed pages as needed. New
    /// pages are dirty from birth.
    pub fn grow_to(&self, id: u64) {
        let mut pages = self.pages.write();
        if (pages.len() as u64) <= id {
            let mut dirty = self.dirty.lock();
            while (pages.len() as u64) <= id {
                dirty.insert(pages.len() as u64);
                pages.push(Arc::new(PageBuf::zeroed(self.page_size)));
            }
        }
    }

    fn page(&self, id: u64) -> Result<Arc<PageBuf>> {
        let pages = self.pages.read();
        pages
            .get(id as usize)
            .cloned()
            .ok_or_else(|| eyre::eyre!("page {} out of bounds (page_count={})", id, pages.len()))
    }

    /// Direct read access. Only sound from the writer role (writer session,
    /// checkpoint, recovery, offline checking): no other thread is mutating,
    /// so the borrow observes a quiescent page.
    pub fn read<R>(&self, id: u64, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let page = self.page(id)?;
        // Safety: see above; the writer role serializes all mutation.
        let data = unsafe { &*page.data.get() };
        Ok(f(data))
    }

    /// Mutates a page under the version protocol and marks it dirty.
    pub fn write<R>(&self, id: u64, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let page = self.page(id)?;
        page.version.fetch_add(1, Ordering::Release);
        fence(Ordering::Release);
        // Safety: single mutator per the writer role; readers detect and
        // discard overlapping copies via the version counter.
        let data = unsafe { &mut *page.data.get() };
        let result = f(data);
        page.version.fetch_add(1, Ordering::Release);
        self.dirty.lock().insert(id);
        Ok(result)
    }

    /// Current version counter of a page. A cursor remembers this and treats
    /// any later difference as the "page changed, reread" signal.
    pub fn version(&self, id: u64) -> Result<u64> {
        Ok(self.page(id)?.version.load(Ordering::Acquire))
    }

    /// Copies a consistent snapshot of the page into `buf`, returning the
    /// version it was taken at. Spins only while a mutation is in flight on
    /// this very page.
    pub fn snapshot_into(&self, id: u64, buf: &mut Vec<u8>) -> Result<u64> {
        let page = self.page(id)?;
        buf.resize(self.page_size, 0);
        loop {
            let before = page.version.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            // Safety: the copy may race a writer; the version check below
            // rejects any copy that did.
            unsafe {
                let src = &*page.data.get();
                std::ptr::copy_nonoverlapping(src.as_ptr(), buf.as_mut_ptr(), self.page_size);
            }
            fence(Ordering::Acquire);
            let after = page.version.load(Ordering::Acquire);
            if before == after {
                return Ok(before);
            }
        }
    }

    /// Writes dirty pages back to the file in budget-sized batches, then
    /// syncs. No-op for in-memory stores.
    pub fn flush(&self, budget: &IoBudget) -> Result<()> {
        let Some(file) = &self.file else {
            self.dirty.lock().clear();
            return Ok(());
        };

        let mut ids: Vec<u64> = {
            let mut dirty = self.dirty.lock();
            dirty.drain().collect()
        };
        ids.sort_unstable();

        let mut file = file.lock();
        let len_needed = self.page_count() * self.page_size as u64;
        if file.metadata()?.len() < len_needed {
            file.set_len(len_needed)?;
        }

        for batch in ids.chunks(budget.batch()) {
            for &id in batch {
                let page = self.page(id)?;
                // Safety: flush runs from the writer role; page is quiescent.
                let data = unsafe { &*page.data.get() };
                file.seek(SeekFrom::Start(id * self.page_size as u64))?;
                file.write_all(data)
                    .wrap_err_with(|| format!("flushing page {}", id))?;
            }
        }
        file.sync_data().wrap_err("syncing store file")?;
        Ok(())
    }

    #[cfg(test)]
    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }
}

fn validate_page_size(page_size: usize) -> Result<()> {
    ensure!(
        (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size),
        "page size {} out of range [{}, {}]",
        page_size,
        MIN_PAGE_SIZE,
        MAX_PAGE_SIZE
    );
    ensure!(
        page_size.is_power_of_two(),
        "page size {} must be a power of two",
        page_size
    );
    Ok(())
}
