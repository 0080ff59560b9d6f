//! Append-only transaction journal.
//!
//! Commits append self-validating records to the active journal file. A file
//! that reaches its size threshold is retired (the current-file reference
//! becomes `None`) and the next commit starts a fresh file with the next
//! sequence number. Files whose content is fully checkpointed become
//! recyclable: they are renamed and truncated for reuse, or deleted once the
//! recycle pool is full or recycling is disabled.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{JournalSeq, Result, TxId, VesperError};

mod record;

pub use record::{encode_record, read_record, TransactionRecord, TX_RECORD_HDR_LEN, TX_RECORD_MARKER};

const JOURNAL_EXT: &str = "journal";

fn journal_file_name(seq: u64) -> String {
    format!("{seq:010}.{JOURNAL_EXT}")
}

fn seq_from_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(&format!(".{JOURNAL_EXT}"))?;
    if stem.len() != 10 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Counters describing journal activity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JournalStats {
    /// Journal files on disk (completed plus active).
    pub file_count: usize,
    /// Sequence of the file currently accepting appends, if any.
    pub current_seq: Option<JournalSeq>,
    /// Transaction records appended since open.
    pub records_appended: u64,
    /// Bytes appended since open.
    pub bytes_appended: u64,
    /// Journal fsyncs since open.
    pub syncs: u64,
    /// Times the active file was retired at its size threshold.
    pub rotations: u64,
    /// Files recycled or retired after checkpointing.
    pub recycled: u64,
}

struct ActiveFile {
    seq: u64,
    path: PathBuf,
    io: StdFileIo,
    offset: u64,
    last_tx: TxId,
}

struct CompletedFile {
    seq: u64,
    path: PathBuf,
    last_tx: TxId,
}

struct JournalState {
    active: Option<ActiveFile>,
    completed: Vec<CompletedFile>,
    recycle_pool: Vec<PathBuf>,
    next_seq: u64,
    stats: JournalStats,
}

/// Manages the ordered set of journal files for one environment.
pub struct Journal {
    dir: PathBuf,
    max_file_size: u64,
    recycle: bool,
    max_recycled: usize,
    state: Mutex<JournalState>,
}

impl Journal {
    /// Opens the journal directory for writing.
    ///
    /// Recovery must already have consumed and removed any files left by a
    /// previous run; appends start at `start_seq`.
    pub fn open(
        dir: impl Into<PathBuf>,
        max_file_size: u64,
        recycle: bool,
        max_recycled: usize,
        start_seq: u64,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(VesperError::from)?;
        Ok(Self {
            dir,
            max_file_size: max_file_size.max(TX_RECORD_HDR_LEN as u64),
            recycle,
            max_recycled,
            state: Mutex::new(JournalState {
                active: None,
                completed: Vec::new(),
                recycle_pool: Vec::new(),
                next_seq: start_seq.max(1),
                stats: JournalStats::default(),
            }),
        })
    }

    /// Appends one transaction record, rotating files as needed.
    ///
    /// With `sync` set the record is fsynced before this returns; that is the
    /// durability point of a commit.
    pub fn append(&self, tx: TxId, record: &[u8], sync: bool) -> Result<()> {
        let mut state = self.state.lock();
        let needs_rotation = state
            .active
            .as_ref()
            .is_some_and(|a| a.offset > 0 && a.offset + record.len() as u64 > self.max_file_size);
        if needs_rotation {
            Self::retire_active(&mut state);
        }
        if state.active.is_none() {
            self.start_file(&mut state)?;
        }
        let (io, offset) = {
            let active = state.active.as_ref().expect("active journal file");
            (active.io.clone(), active.offset)
        };
        io.write_at(offset, record)?;
        if sync {
            io.sync_all()?;
            state.stats.syncs += 1;
        }
        {
            let active = state.active.as_mut().expect("active journal file");
            active.offset += record.len() as u64;
            active.last_tx = tx;
        }
        state.stats.records_appended += 1;
        state.stats.bytes_appended += record.len() as u64;
        if state.active.as_ref().expect("active journal file").offset >= self.max_file_size {
            Self::retire_active(&mut state);
        }
        Ok(())
    }

    /// Fsyncs the active file, if any.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        let io = state.active.as_ref().map(|a| a.io.clone());
        if let Some(io) = io {
            io.sync_all()?;
            state.stats.syncs += 1;
        }
        Ok(())
    }

    /// Recycles or retires completed files fully covered by a checkpoint.
    pub fn recycle_upto(&self, tx: TxId) -> Result<usize> {
        let mut state = self.state.lock();
        let mut kept = Vec::new();
        let mut released = 0usize;
        for file in std::mem::take(&mut state.completed) {
            if file.last_tx <= tx {
                released += 1;
                if self.recycle && state.recycle_pool.len() < self.max_recycled {
                    debug!(seq = file.seq, "journal.recycle");
                    state.recycle_pool.push(file.path);
                } else {
                    debug!(seq = file.seq, "journal.retire");
                    if let Err(err) = fs::remove_file(&file.path) {
                        warn!(seq = file.seq, %err, "journal file removal failed");
                    }
                }
            } else {
                kept.push(file);
            }
        }
        state.completed = kept;
        state.stats.recycled += released as u64;
        Ok(released)
    }

    /// Sequence of the file currently accepting appends; `None` right after a
    /// rotation threshold was crossed.
    pub fn current_seq(&self) -> Option<JournalSeq> {
        self.state.lock().active.as_ref().map(|a| JournalSeq(a.seq))
    }

    /// Journal files on disk, completed plus active (recycle pool excluded).
    pub fn file_count(&self) -> usize {
        let state = self.state.lock();
        state.completed.len() + usize::from(state.active.is_some())
    }

    /// Returns journal activity counters.
    pub fn stats(&self) -> JournalStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.file_count = state.completed.len() + usize::from(state.active.is_some());
        stats.current_seq = state.active.as_ref().map(|a| JournalSeq(a.seq));
        stats
    }

    fn retire_active(state: &mut JournalState) {
        if let Some(active) = state.active.take() {
            debug!(seq = active.seq, bytes = active.offset, "journal.rotate");
            state.completed.push(CompletedFile {
                seq: active.seq,
                path: active.path,
                last_tx: active.last_tx,
            });
            state.stats.rotations += 1;
        }
    }

    fn start_file(&self, state: &mut JournalState) -> Result<()> {
        let seq = state.next_seq;
        state.next_seq += 1;
        let path = self.dir.join(journal_file_name(seq));
        if let Some(recycled) = state.recycle_pool.pop() {
            fs::rename(&recycled, &path).map_err(VesperError::from)?;
            let io = StdFileIo::open(&path)?;
            io.truncate(0)?;
            state.active = Some(ActiveFile {
                seq,
                path,
                io,
                offset: 0,
                last_tx: TxId(0),
            });
            return Ok(());
        }
        let io = StdFileIo::open(&path)?;
        io.truncate(0)?;
        state.active = Some(ActiveFile {
            seq,
            path,
            io,
            offset: 0,
            last_tx: TxId(0),
        });
        Ok(())
    }
}

/// Outcome of replaying the journal directory at environment open.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Newest transaction applied (or revalidated) during replay.
    pub last_valid_tx: Option<TxId>,
    /// Records applied through the callback.
    pub applied: usize,
    /// Whether a torn tail was truncated away.
    pub truncated: bool,
    /// Highest journal sequence seen on disk.
    pub max_seq: u64,
}

/// Replays journal files in ascending sequence order.
///
/// Records with `tx_id <= last_applied` are validated but skipped; newer ones
/// are handed to `apply` in transaction order. The first invalid or truncated
/// record ends the replay: the file is truncated at the last valid byte and
/// any later files are removed. Corruption here is always treated as the torn
/// tail of an unclean shutdown, never as a hard open failure.
pub fn recover(
    dir: &Path,
    page_size: usize,
    last_applied: TxId,
    mut apply: impl FnMut(&TransactionRecord) -> Result<()>,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    if !dir.exists() {
        return Ok(report);
    }
    let mut files = BTreeMap::new();
    for entry in fs::read_dir(dir).map_err(VesperError::from)? {
        let entry = entry.map_err(VesperError::from)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(seq) = seq_from_name(name) {
            files.insert(seq, entry.path());
        }
    }
    let mut expected_tx = last_applied;
    let mut stop = false;
    let mut stopped_at: Option<u64> = None;
    for (&seq, path) in &files {
        report.max_seq = report.max_seq.max(seq);
        if stop {
            continue;
        }
        let io = StdFileIo::open(path)?;
        let file_len = io.len()?;
        let mut offset = 0u64;
        loop {
            match read_record(&io, offset, file_len, page_size)? {
                Some((record, next_offset)) => {
                    if record.tx_id.0 != expected_tx.0 + 1 && record.tx_id > expected_tx {
                        // A gap in transaction ids means the tail is stale.
                        stop = true;
                        stopped_at = Some(seq);
                        truncate_torn(&io, path, offset, file_len, &mut report)?;
                        break;
                    }
                    if record.tx_id > expected_tx {
                        apply(&record)?;
                        report.applied += 1;
                        expected_tx = record.tx_id;
                        report.last_valid_tx = Some(record.tx_id);
                    }
                    offset = next_offset;
                }
                None => {
                    if offset < file_len {
                        stop = true;
                        stopped_at = Some(seq);
                        truncate_torn(&io, path, offset, file_len, &mut report)?;
                    }
                    break;
                }
            }
        }
    }
    if stop {
        // Everything after the torn file cannot be a valid continuation.
        let boundary = stopped_at.unwrap_or(0);
        for (&seq, path) in &files {
            if seq > boundary {
                if let Err(err) = fs::remove_file(path) {
                    warn!(seq, %err, "stale journal removal failed");
                }
            }
        }
    }
    if report.applied > 0 || report.truncated {
        info!(
            applied = report.applied,
            truncated = report.truncated,
            last_valid_tx = report.last_valid_tx.map(|tx| tx.0),
            "journal.recovered"
        );
    }
    Ok(report)
}

fn truncate_torn(
    io: &StdFileIo,
    path: &Path,
    offset: u64,
    file_len: u64,
    report: &mut RecoveryReport,
) -> Result<()> {
    if offset < file_len {
        warn!(
            file = %path.display(),
            valid_bytes = offset,
            file_len,
            "journal tail truncated"
        );
        io.truncate(offset)?;
        io.sync_all()?;
        report.truncated = true;
    }
    Ok(())
}
