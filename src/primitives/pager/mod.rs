//! Memory-mapped data-file pager.
//!
//! The data file is read through an immutable memory mapping wrapped in
//! generation-tagged segments. Growing the file installs a fresh segment;
//! transactions keep the segment they started with, so remapping never
//! invalidates a page an in-flight snapshot already resolved. Writes go
//! through positioned file I/O and are only issued by the checkpoint and
//! recovery paths.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{page, PageId, Result, VesperError};

mod meta;
mod view;

pub use meta::{create_meta, load_meta, meta_catalog_capacity, read_meta_page, write_meta_page, Meta};
pub use view::PageView;

/// Largest single growth step for the data file (bytes).
const MAX_GROWTH_STEP: u64 = 64 * 1024 * 1024;

/// One generation of the data-file mapping.
///
/// Kept alive by every transaction that acquired it, so the address range
/// stays valid even after the pager has moved on to a larger mapping.
pub struct MapSegment {
    map: Option<Mmap>,
    len: u64,
    generation: u64,
}

impl MapSegment {
    fn map_file(io: &StdFileIo, generation: u64) -> Result<Arc<Self>> {
        let len = io.len()?;
        let map = if len == 0 {
            None
        } else {
            // The mapping is read-only; concurrent file writes target pages
            // no live snapshot reads (checkpoint ordering guarantees it).
            Some(unsafe { Mmap::map(io.file()).map_err(VesperError::from)? })
        };
        Ok(Arc::new(Self {
            map,
            len,
            generation,
        }))
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true when nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mapping generation, advanced on every growth.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn bytes(&self) -> Option<&[u8]> {
        self.map.as_deref()
    }
}

struct PagerState {
    segment: Arc<MapSegment>,
    file_len: u64,
}

/// Counters describing pager activity.
#[derive(Clone, Copy, Debug, Default)]
pub struct PagerStats {
    /// Number of times the data file grew.
    pub growths: u64,
    /// Pages written by checkpoint or recovery.
    pub page_writes: u64,
    /// Number of data-file syncs.
    pub syncs: u64,
    /// Current mapping generation.
    pub mapping_generation: u64,
}

/// Translates page numbers into memory for readers and applies checkpointed
/// pages for the flush path.
pub struct Pager {
    io: StdFileIo,
    page_size: usize,
    salt: u64,
    state: Mutex<PagerState>,
    verified: Mutex<FxHashSet<u64>>,
    growths: AtomicU64,
    page_writes: AtomicU64,
    syncs: AtomicU64,
}

impl Pager {
    /// Opens a pager over an existing data file.
    pub fn open(io: StdFileIo, page_size: u32, salt: u64) -> Result<Self> {
        if !page_size.is_power_of_two() {
            return Err(VesperError::Invalid("page size must be a power of two"));
        }
        let file_len = io.len()?;
        let segment = MapSegment::map_file(&io, 1)?;
        Ok(Self {
            io,
            page_size: page_size as usize,
            salt,
            state: Mutex::new(PagerState { segment, file_len }),
            verified: Mutex::new(FxHashSet::default()),
            growths: AtomicU64::new(0),
            page_writes: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
        })
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Hands the current mapping segment to a starting transaction.
    pub fn segment(&self) -> Arc<MapSegment> {
        Arc::clone(&self.state.lock().segment)
    }

    /// Reads one page, preferring the zero-copy mapped path.
    ///
    /// Pages are CRC-verified the first time they are seen; the set of
    /// verified pages is invalidated when a checkpoint rewrites them.
    pub fn read_page(&self, segment: &Arc<MapSegment>, page: PageId) -> Result<PageView> {
        if page.0 == 0 {
            return Err(VesperError::Invalid("page 0 is the meta page"));
        }
        let off = page
            .0
            .checked_mul(self.page_size as u64)
            .ok_or(VesperError::Invalid("page offset overflow"))?;
        if off + self.page_size as u64 <= segment.len() {
            if let Some(bytes) = segment.bytes() {
                let start = off as usize;
                let image = &bytes[start..start + self.page_size];
                self.verify_once(page, image)?;
                return Ok(PageView::mapped(
                    Arc::clone(segment),
                    start,
                    self.page_size,
                ));
            }
        }
        // The page landed on disk after this segment was mapped; fall back to
        // a positioned read against the file.
        let mut buf = vec![0u8; self.page_size];
        match self.io.read_at(off, &mut buf) {
            Ok(()) => {}
            Err(VesperError::Io(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                return Err(VesperError::Corruption("page beyond data file"));
            }
            Err(err) => return Err(err),
        }
        self.verify_once(page, &buf)?;
        Ok(PageView::owned(buf.into()))
    }

    fn verify_once(&self, page: PageId, image: &[u8]) -> Result<()> {
        {
            let verified = self.verified.lock();
            if verified.contains(&page.0) {
                return Ok(());
            }
        }
        page::verify_page(image, page, self.salt)?;
        self.verified.lock().insert(page.0);
        Ok(())
    }

    /// Grows the data file so pages `0..min_pages` are addressable.
    ///
    /// Growth doubles the file (bounded by [`MAX_GROWTH_STEP`]) to amortize
    /// remapping. A failure here leaves the previous mapping intact.
    pub fn ensure_capacity(&self, min_pages: u64) -> Result<()> {
        let required = min_pages
            .checked_mul(self.page_size as u64)
            .ok_or(VesperError::Invalid("data file length overflow"))?;
        let mut state = self.state.lock();
        if required <= state.file_len {
            return Ok(());
        }
        let doubled = state
            .file_len
            .saturating_mul(2)
            .min(state.file_len + MAX_GROWTH_STEP);
        let new_len = required.max(doubled);
        let new_len = new_len.div_ceil(self.page_size as u64) * self.page_size as u64;
        self.io.truncate(new_len)?;
        let generation = state.segment.generation() + 1;
        let segment = MapSegment::map_file(&self.io, generation)?;
        debug!(
            old_len = state.file_len,
            new_len,
            generation,
            "pager.grow"
        );
        state.file_len = new_len;
        state.segment = segment;
        self.growths.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    /// Writes a full page image; callers must have ensured capacity.
    pub fn write_page(&self, page: PageId, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            return Err(VesperError::Invalid("page image size mismatch"));
        }
        let off = page
            .0
            .checked_mul(self.page_size as u64)
            .ok_or(VesperError::Invalid("page offset overflow"))?;
        self.io.write_at(off, data)?;
        self.verified.lock().remove(&page.0);
        self.page_writes.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    /// Rewrites the meta page (page 0).
    pub fn write_meta(&self, meta: &Meta) -> Result<()> {
        let mut buf = vec![0u8; self.page_size];
        write_meta_page(&mut buf, meta)?;
        self.io.write_at(0, &buf)?;
        self.page_writes.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    /// Syncs the data file.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()?;
        self.syncs.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    /// Returns pager activity counters.
    pub fn stats(&self) -> PagerStats {
        PagerStats {
            growths: self.growths.load(AtomicOrdering::Relaxed),
            page_writes: self.page_writes.load(AtomicOrdering::Relaxed),
            syncs: self.syncs.load(AtomicOrdering::Relaxed),
            mapping_generation: self.state.lock().segment.generation(),
        }
    }
}
