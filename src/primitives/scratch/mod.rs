//! Scratch buffer pool.
//!
//! Scratch files hold the page versions produced by committed transactions
//! until a checkpoint folds them into the data file. The pool keeps a
//! translation table from logical page numbers to the versions currently in
//! scratch; a read at snapshot `S` resolves to the newest version with
//! `tx <= S` and falls through to the data file when none exists.
//!
//! Reclamation is generation-based: the generation advances once per
//! checkpoint, freed slots are queued tagged with the generation they were
//! freed under, and a slot is only reused once every registered reader
//! belongs to a newer generation. This closes the race between a flush and a
//! read transaction that began just before it.

use std::any::Any;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::MmapMut;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::primitives::pager::PageView;
use crate::types::{PageId, Result, TxId, VesperError};

/// Counters describing scratch pool occupancy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScratchStats {
    /// Page versions currently reachable through the translation table.
    pub live_allocations: u64,
    /// Freed slots waiting for generation-based reclamation.
    pub pending_free: u64,
    /// Number of scratch files in the pool.
    pub files: usize,
    /// Current reclamation generation.
    pub generation: u64,
}

struct ScratchMap {
    _map: MmapMut,
    base: *mut u8,
    len: usize,
}

// Slots are written only while unreferenced (freshly allocated under the pool
// lock) and are immutable from publication until generation-based reclaim
// proves no view can remain. Views pin the map through an `Arc`.
unsafe impl Send for ScratchMap {}
unsafe impl Sync for ScratchMap {}

impl ScratchMap {
    fn create(path: &Path, len: usize) -> Result<Arc<Self>> {
        let file: File = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(VesperError::from)?;
        file.set_len(len as u64).map_err(VesperError::from)?;
        let mut map = unsafe { MmapMut::map_mut(&file).map_err(VesperError::from)? };
        let base = map.as_mut_ptr();
        Ok(Arc::new(Self {
            _map: map,
            base,
            len,
        }))
    }

    fn write(&self, off: usize, src: &[u8]) {
        assert!(off + src.len() <= self.len, "scratch write out of bounds");
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(off), src.len());
        }
    }

    fn view(self: &Arc<Self>, off: usize, len: usize) -> PageView {
        assert!(off + len <= self.len, "scratch view out of bounds");
        let owner: Arc<dyn Any + Send + Sync> = Arc::clone(self) as _;
        unsafe { PageView::pinned(owner, self.base.add(off) as *const u8, len) }
    }
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    file: usize,
    index: u64,
}

#[derive(Clone, Copy, Debug)]
struct Version {
    tx: TxId,
    slot: Slot,
}

#[derive(Clone, Copy, Debug)]
struct PendingFree {
    generation: u64,
    slot: Slot,
}

struct PoolState {
    files: Vec<Arc<ScratchMap>>,
    next_index: Vec<u64>,
    free_slots: Vec<Vec<u64>>,
    table: FxHashMap<u64, Vec<Version>>,
    pending: VecDeque<PendingFree>,
    generation: u64,
    live: u64,
}

impl PoolState {
    fn queue_free(&mut self, slot: Slot) {
        self.pending.push_back(PendingFree {
            generation: self.generation,
            slot,
        });
    }
}

/// Pool of memory-mapped scratch files.
pub struct ScratchPool {
    dir: PathBuf,
    page_size: usize,
    file_pages: u64,
    inner: Mutex<PoolState>,
}

impl ScratchPool {
    /// Opens the pool rooted at `dir`, discarding any leftover scratch files.
    pub fn open(dir: impl Into<PathBuf>, page_size: u32, max_file_size: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(VesperError::from)?;
        for entry in fs::read_dir(&dir).map_err(VesperError::from)? {
            let entry = entry.map_err(VesperError::from)?;
            // Scratch content is meaningless across restarts.
            let _ = fs::remove_file(entry.path());
        }
        let file_pages = (max_file_size / u64::from(page_size)).max(16);
        Ok(Self {
            dir,
            page_size: page_size as usize,
            file_pages,
            inner: Mutex::new(PoolState {
                files: Vec::new(),
                next_index: Vec::new(),
                free_slots: Vec::new(),
                table: FxHashMap::default(),
                pending: VecDeque::new(),
                generation: 1,
                live: 0,
            }),
        })
    }

    /// Current reclamation generation; readers register under it at begin.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Publishes the page images of a committed transaction.
    pub fn publish(&self, tx: TxId, pages: &[(PageId, &[u8])]) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        for (_, image) in pages {
            if image.len() != self.page_size {
                return Err(VesperError::Invalid("scratch image size mismatch"));
            }
        }
        let mut state = self.inner.lock();
        let slots = self.allocate(&mut state, pages.len())?;
        for ((page, image), slot) in pages.iter().zip(slots.iter()) {
            let off = (slot.index as usize) * self.page_size;
            state.files[slot.file].write(off, image);
            let versions = state.table.entry(page.0).or_default();
            if let Some(last) = versions.last() {
                if last.tx >= tx {
                    return Err(VesperError::Invalid("scratch publish out of order"));
                }
            }
            versions.push(Version { tx, slot: *slot });
            state.live += 1;
        }
        Ok(())
    }

    /// Frees versions a commit made unreachable, once it is published.
    ///
    /// A version is dead when no snapshot can resolve to it: version v of a
    /// page is reachable only by snapshots in `[v.tx, succ.tx)`, where the
    /// successor of the newest version of a page freed by `committed_tx` is
    /// the commit itself. `oldest_reader` is the oldest snapshot still
    /// registered (the committing writer excluded); `None` means no reader
    /// can hold any of those snapshots.
    pub fn prune(
        &self,
        touched: &[PageId],
        freed: &[PageId],
        committed_tx: TxId,
        oldest_reader: Option<TxId>,
    ) {
        let floor = oldest_reader.map(|tx| tx.0).unwrap_or(u64::MAX);
        let mut state = self.inner.lock();
        for (pages, freed_by_commit) in [(touched, false), (freed, true)] {
            for page in pages {
                Self::prune_page(&mut state, page.0, committed_tx, floor, freed_by_commit);
            }
        }
    }

    fn prune_page(
        state: &mut PoolState,
        page: u64,
        committed_tx: TxId,
        floor: u64,
        freed_by_commit: bool,
    ) {
        let Some(versions) = state.table.get_mut(&page) else {
            return;
        };
        let mut kept = Vec::with_capacity(versions.len());
        let mut dropped = Vec::new();
        for i in 0..versions.len() {
            let successor = match versions.get(i + 1) {
                Some(succ) => Some(succ.tx.0),
                None if freed_by_commit => Some(committed_tx.0),
                None => None,
            };
            if successor.is_some_and(|succ| succ <= floor) {
                dropped.push(versions[i].slot);
            } else {
                kept.push(versions[i]);
            }
        }
        if dropped.is_empty() {
            return;
        }
        state.live -= dropped.len() as u64;
        if kept.is_empty() {
            state.table.remove(&page);
        } else {
            *state.table.get_mut(&page).expect("pruned page entry") = kept;
        }
        for slot in dropped {
            state.queue_free(slot);
        }
    }

    /// Resolves `page` for a snapshot; `None` falls through to the data file.
    pub fn lookup(&self, page: PageId, snapshot: TxId) -> Option<PageView> {
        let state = self.inner.lock();
        let versions = state.table.get(&page.0)?;
        let version = versions.iter().rev().find(|v| v.tx <= snapshot)?;
        let off = (version.slot.index as usize) * self.page_size;
        Some(state.files[version.slot.file].view(off, self.page_size))
    }

    /// Newest version per page with `tx <= upto`, ordered by page number.
    ///
    /// This is the checkpoint's work list.
    pub fn latest_upto(&self, upto: TxId) -> Vec<(PageId, PageView)> {
        let state = self.inner.lock();
        let mut out = Vec::new();
        for (&page, versions) in &state.table {
            if let Some(version) = versions.iter().rev().find(|v| v.tx <= upto) {
                let off = (version.slot.index as usize) * self.page_size;
                out.push((
                    PageId(page),
                    state.files[version.slot.file].view(off, self.page_size),
                ));
            }
        }
        out.sort_by_key(|(page, _)| page.0);
        out
    }

    /// Removes every version with `tx <= upto` after a checkpoint applied
    /// them, queues their slots for reclamation, and advances the generation.
    pub fn retire_upto(&self, upto: TxId) {
        let mut state = self.inner.lock();
        let mut retired = 0u64;
        let mut freed = Vec::new();
        state.table.retain(|_, versions| {
            versions.retain(|v| {
                if v.tx <= upto {
                    freed.push(v.slot);
                    retired += 1;
                    false
                } else {
                    true
                }
            });
            !versions.is_empty()
        });
        state.live -= retired;
        for slot in freed {
            state.queue_free(slot);
        }
        state.generation += 1;
        debug!(
            retired,
            generation = state.generation,
            "scratch.retire"
        );
    }

    /// Returns queued slots to the free pool once provably unreachable.
    ///
    /// `oldest_active_generation` is the smallest generation any registered
    /// reader holds; `None` means no reader is active.
    pub fn reclaim(&self, oldest_active_generation: Option<u64>) {
        let mut state = self.inner.lock();
        let floor = oldest_active_generation.unwrap_or(u64::MAX);
        while let Some(front) = state.pending.front() {
            if front.generation >= floor {
                break;
            }
            let slot = front.slot;
            state.pending.pop_front();
            state.free_slots[slot.file].push(slot.index);
        }
    }

    /// Returns occupancy counters.
    pub fn stats(&self) -> ScratchStats {
        let state = self.inner.lock();
        ScratchStats {
            live_allocations: state.live,
            pending_free: state.pending.len() as u64,
            files: state.files.len(),
            generation: state.generation,
        }
    }

    fn allocate(&self, state: &mut PoolState, n: usize) -> Result<Vec<Slot>> {
        let n_u64 = n as u64;
        // Prefer one contiguous run so a transaction's pages sit together.
        if n_u64 <= self.file_pages {
            for file in 0..state.files.len() {
                if state.next_index[file] + n_u64 <= self.file_pages {
                    let first = state.next_index[file];
                    state.next_index[file] += n_u64;
                    return Ok((0..n_u64).map(|i| Slot { file, index: first + i }).collect());
                }
            }
        }
        // Reuse reclaimed slots one page at a time, growing the pool when
        // every file is exhausted.
        let mut slots = Vec::with_capacity(n);
        for _ in 0..n {
            slots.push(self.allocate_one(state)?);
        }
        Ok(slots)
    }

    fn allocate_one(&self, state: &mut PoolState) -> Result<Slot> {
        for file in 0..state.files.len() {
            if let Some(index) = state.free_slots[file].pop() {
                return Ok(Slot { file, index });
            }
            if state.next_index[file] < self.file_pages {
                let index = state.next_index[file];
                state.next_index[file] += 1;
                return Ok(Slot { file, index });
            }
        }
        self.add_file(state)?;
        let file = state.files.len() - 1;
        state.next_index[file] = 1;
        Ok(Slot { file, index: 0 })
    }

    fn add_file(&self, state: &mut PoolState) -> Result<()> {
        let seq = state.files.len() as u64 + 1;
        let path = self.dir.join(format!("scratch.{seq:010}.buffers"));
        let len = (self.file_pages as usize) * self.page_size;
        let map = ScratchMap::create(&path, len)?;
        debug!(file = %path.display(), pages = self.file_pages, "scratch.add_file");
        state.files.push(map);
        state.next_index.push(0);
        state.free_slots.push(Vec::new());
        Ok(())
    }
}

impl Drop for ScratchPool {
    fn drop(&mut self) {
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}
