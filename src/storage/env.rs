//! Storage environment: the coordinator owning the pager, scratch pool, and
//! journal, and the only place transactions are created.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::primitives::concurrency::EnvLock;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::journal::{self, Journal, JournalStats};
use crate::primitives::pager::{
    create_meta, load_meta, meta_catalog_capacity, write_meta_page, Meta, Pager, PagerStats,
};
use crate::primitives::scratch::{ScratchPool, ScratchStats};
use crate::types::{PageId, Result, TxId, VesperError};

use super::catalog::Catalog;
use super::freelist;
use super::options::EnvOptions;
use super::readers::ReaderTable;
use super::txn::{begin_read, begin_write, try_begin_write, ReadTx, WriteTx};

const DATA_FILE_NAME: &str = "data.vesper";
const JOURNAL_DIR_NAME: &str = "journal";
const SCRATCH_DIR_NAME: &str = "scratch";
const LOCK_FILE_NAME: &str = "vesper.lock";

/// State published by the newest committed transaction.
pub(crate) struct CommittedState {
    pub(crate) last_committed: TxId,
    pub(crate) next_page: PageId,
    pub(crate) catalog: Arc<Catalog>,
}

/// Per-commit snapshot retained until checkpointed, so a flush that stops
/// short of the newest commit can still write an accurate meta page.
pub(crate) struct CommittedVersion {
    pub(crate) tx: TxId,
    pub(crate) next_page: PageId,
    pub(crate) catalog: Arc<Catalog>,
}

/// Mutable state owned by whichever transaction holds the writer slot.
pub(crate) struct WriterShared {
    pub(crate) free_pages: BTreeSet<u64>,
}

#[derive(Default)]
struct FlusherSignal {
    stop: Mutex<bool>,
    cv: Condvar,
}

struct FlusherHandle {
    signal: Arc<FlusherSignal>,
    join: JoinHandle<()>,
}

/// Counters and gauges describing an environment.
#[derive(Clone, Debug)]
pub struct EnvStats {
    /// Newest committed transaction.
    pub last_committed: TxId,
    /// Newest transaction fully applied to the data file.
    pub last_checkpointed: TxId,
    /// Scratch pool occupancy.
    pub scratch: ScratchStats,
    /// Journal activity.
    pub journal: JournalStats,
    /// Pager activity.
    pub pager: PagerStats,
    /// Registered transactions (readers plus the writer).
    pub active_readers: u64,
    /// Oldest snapshot any registered transaction observes.
    pub oldest_reader_snapshot: Option<TxId>,
}

pub(crate) struct EnvInner {
    pub(crate) options: EnvOptions,
    pub(crate) page_size: usize,
    pub(crate) salt: u64,
    pub(crate) pager: Pager,
    pub(crate) scratch: ScratchPool,
    pub(crate) journal: Journal,
    pub(crate) committed: RwLock<Arc<CommittedState>>,
    pub(crate) history: Mutex<VecDeque<CommittedVersion>>,
    pub(crate) writer: Arc<Mutex<WriterShared>>,
    pub(crate) readers: ReaderTable,
    pub(crate) last_checkpointed: Mutex<TxId>,
    flush_lock: Mutex<()>,
    flusher: Mutex<Option<FlusherHandle>>,
    _lock: EnvLock,
    _ephemeral: Option<TempDir>,
}

/// A storage environment rooted at a directory.
///
/// Cloning the handle is cheap; the environment shuts down (stopping the
/// background flusher and running a final checkpoint) when the last handle
/// and transaction are gone.
#[derive(Clone)]
pub struct Env {
    pub(crate) inner: Arc<EnvInner>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env").finish_non_exhaustive()
    }
}

impl Env {
    /// Opens (or creates) the environment at `path`.
    pub fn open(path: impl AsRef<Path>, options: EnvOptions) -> Result<Self> {
        Self::open_inner(path.as_ref().to_path_buf(), options, None)
    }

    /// Creates an ephemeral environment backed by a temporary directory that
    /// is removed on shutdown.
    pub fn ephemeral(options: EnvOptions) -> Result<Self> {
        let dir = TempDir::new().map_err(VesperError::from)?;
        let path = dir.path().to_path_buf();
        Self::open_inner(path, options, Some(dir))
    }

    fn open_inner(path: PathBuf, mut options: EnvOptions, ephemeral: Option<TempDir>) -> Result<Self> {
        fs::create_dir_all(&path).map_err(VesperError::from)?;
        options.apply_file_overrides(&path)?;
        options.validate()?;
        let lock = EnvLock::acquire(path.join(LOCK_FILE_NAME))?;

        let data_io = StdFileIo::open(path.join(DATA_FILE_NAME))?;
        let meta = if data_io.is_empty()? {
            info!(path = %path.display(), page_size = options.page_size, "env.create");
            create_meta(&data_io, options.page_size, &Catalog::default().encode())?
        } else {
            let meta = load_meta(&data_io)?;
            if meta.page_size != options.page_size {
                return Err(VesperError::Invalid(
                    "page size differs from the existing store",
                ));
            }
            meta
        };
        let page_size = meta.page_size as usize;
        let salt = meta.salt;

        // Replay the journal tail into the data file before anything maps it.
        let journal_dir = path.join(JOURNAL_DIR_NAME);
        let mut catalog = Catalog::decode(&meta.catalog)?;
        let mut next_page = meta.next_page;
        let mut last_tx = meta.last_checkpointed;
        let report = journal::recover(&journal_dir, page_size, meta.last_checkpointed, |record| {
            for (page, image) in &record.pages {
                if page.0 == 0 {
                    return Err(VesperError::Corruption("journal record rewrites page 0"));
                }
                data_io.write_at(page.0 * page_size as u64, image)?;
            }
            catalog = Catalog::decode(&record.catalog)?;
            next_page = record.next_page;
            last_tx = record.tx_id;
            Ok(())
        })?;
        if report.applied > 0 {
            data_io.sync_all()?;
            let recovered = Meta {
                page_size: meta.page_size,
                salt,
                last_checkpointed: last_tx,
                next_page,
                catalog: catalog.encode(),
            };
            let mut buf = vec![0u8; page_size];
            write_meta_page(&mut buf, &recovered)?;
            data_io.write_at(0, &buf)?;
            data_io.sync_all()?;
        }
        // Everything on disk is now checkpointed; journal files are spent.
        if journal_dir.exists() {
            for entry in fs::read_dir(&journal_dir).map_err(VesperError::from)? {
                let entry = entry.map_err(VesperError::from)?;
                let _ = fs::remove_file(entry.path());
            }
        }

        let pager = Pager::open(data_io, meta.page_size, salt)?;
        let scratch = ScratchPool::open(
            path.join(SCRATCH_DIR_NAME),
            meta.page_size,
            options.max_scratch_file_size,
        )?;
        let journal = Journal::open(
            &journal_dir,
            options.max_journal_file_size,
            options.recycle_journals,
            options.max_recycled_journals,
            report.max_seq + 1,
        )?;

        let free_pages = load_free_pages(&pager, &catalog)?;
        let committed = CommittedState {
            last_committed: last_tx,
            next_page,
            catalog: Arc::new(catalog),
        };
        let inner = Arc::new(EnvInner {
            options: options.clone(),
            page_size,
            salt,
            pager,
            scratch,
            journal,
            committed: RwLock::new(Arc::new(committed)),
            history: Mutex::new(VecDeque::new()),
            writer: Arc::new(Mutex::new(WriterShared { free_pages })),
            readers: ReaderTable::default(),
            last_checkpointed: Mutex::new(last_tx),
            flush_lock: Mutex::new(()),
            flusher: Mutex::new(None),
            _lock: lock,
            _ephemeral: ephemeral,
        });
        let env = Self { inner };
        if let Some(interval) = options.flush_interval {
            env.spawn_flusher(interval)?;
        }
        info!(
            last_committed = last_tx.0,
            recovered = report.applied,
            "env.open"
        );
        Ok(env)
    }

    /// Begins a read transaction; never blocks.
    pub fn begin_read(&self) -> Result<ReadTx> {
        begin_read(Arc::clone(&self.inner))
    }

    /// Begins the write transaction, blocking until the writer slot frees.
    pub fn begin_write(&self) -> Result<WriteTx> {
        begin_write(Arc::clone(&self.inner))
    }

    /// Begins the write transaction only if the writer slot is free right
    /// now; callers wanting admission timeouts poll this instead of
    /// blocking.
    pub fn try_begin_write(&self) -> Result<Option<WriteTx>> {
        try_begin_write(Arc::clone(&self.inner))
    }

    /// Checkpoints committed transactions into the data file.
    ///
    /// Returns whether any pages were applied. Never runs concurrently with
    /// itself; runs freely alongside readers and the writer.
    pub fn flush(&self) -> Result<bool> {
        self.inner.flush()
    }

    /// Returns environment counters.
    pub fn stats(&self) -> EnvStats {
        let committed = Arc::clone(&*self.inner.committed.read());
        let readers = self.inner.readers.stats(Instant::now());
        EnvStats {
            last_committed: committed.last_committed,
            last_checkpointed: *self.inner.last_checkpointed.lock(),
            scratch: self.inner.scratch.stats(),
            journal: self.inner.journal.stats(),
            pager: self.inner.pager.stats(),
            active_readers: readers.active,
            oldest_reader_snapshot: readers.oldest_snapshot,
        }
    }

    /// Options the environment was opened with (after file overrides).
    pub fn options(&self) -> &EnvOptions {
        &self.inner.options
    }

    fn spawn_flusher(&self, interval: Duration) -> Result<()> {
        let signal = Arc::new(FlusherSignal::default());
        let thread_signal = Arc::clone(&signal);
        let weak = Arc::downgrade(&self.inner);
        let join = std::thread::Builder::new()
            .name("vesper-flush".into())
            .spawn(move || loop {
                {
                    let mut stop = thread_signal.stop.lock();
                    if *stop {
                        break;
                    }
                    thread_signal.cv.wait_for(&mut stop, interval);
                    if *stop {
                        break;
                    }
                }
                let Some(inner) = weak.upgrade() else { break };
                if let Err(err) = inner.flush() {
                    warn!(%err, "background flush failed");
                }
            })
            .map_err(VesperError::from)?;
        *self.inner.flusher.lock() = Some(FlusherHandle { signal, join });
        Ok(())
    }
}

impl EnvInner {
    pub(crate) fn flush(&self) -> Result<bool> {
        let _guard = self.flush_lock.lock();
        let committed = Arc::clone(&*self.committed.read());
        // Applying a transaction to the data file overwrites page images an
        // older snapshot may still resolve there, so the checkpoint stops at
        // the oldest registered snapshot.
        let oldest = self.readers.oldest_snapshot();
        let upto = match oldest {
            Some(snapshot) => TxId(snapshot.0.min(committed.last_committed.0)),
            None => committed.last_committed,
        };
        let last_checkpointed = *self.last_checkpointed.lock();
        if upto <= last_checkpointed {
            self.scratch.reclaim(self.readers.oldest_generation());
            return Ok(false);
        }
        let work = self.scratch.latest_upto(upto);
        let max_page = work.iter().map(|(page, _)| page.0).max().unwrap_or(0);
        self.pager.ensure_capacity(max_page + 1)?;
        for (page, image) in &work {
            self.pager.write_page(*page, image)?;
        }
        self.pager.sync()?;

        let (catalog_bytes, next_page) = {
            let history = self.history.lock();
            let version = history
                .iter()
                .find(|v| v.tx == upto)
                .ok_or(VesperError::Invalid("checkpoint target missing from history"))?;
            (version.catalog.encode(), version.next_page)
        };
        let meta = Meta {
            page_size: self.page_size as u32,
            salt: self.salt,
            last_checkpointed: upto,
            next_page,
            catalog: catalog_bytes,
        };
        self.pager.write_meta(&meta)?;
        self.pager.sync()?;
        *self.last_checkpointed.lock() = upto;
        self.history.lock().retain(|v| v.tx > upto);

        self.journal.recycle_upto(upto)?;
        self.scratch.retire_upto(upto);
        self.scratch.reclaim(self.readers.oldest_generation());
        info!(upto = upto.0, pages = work.len(), "env.flush");
        Ok(true)
    }

    pub(crate) fn catalog_capacity(&self) -> usize {
        meta_catalog_capacity(self.page_size as u32)
    }
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        if let Some(handle) = self.flusher.lock().take() {
            *handle.signal.stop.lock() = true;
            handle.signal.cv.notify_all();
            if handle.join.thread().id() != std::thread::current().id() {
                let _ = handle.join.join();
            }
        }
        match self.flush() {
            Ok(applied) => debug!(applied, "env.shutdown_flush"),
            Err(err) => warn!(%err, "shutdown flush failed"),
        }
    }
}

fn load_free_pages(pager: &Pager, catalog: &Catalog) -> Result<BTreeSet<u64>> {
    let mut free = BTreeSet::new();
    let segment = pager.segment();
    let mut next = catalog.free_head();
    while let Some(page_no) = next {
        let view = pager.read_page(&segment, page_no)?;
        let (chain_next, entries) = freelist::decode_chain_page(&view)?;
        free.extend(entries);
        next = chain_next;
    }
    Ok(free)
}
