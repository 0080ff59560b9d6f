//! Registry of active read snapshots.
//!
//! Every transaction (readers and the writer alike) registers the snapshot it
//! observes and the scratch generation it started under. The checkpoint uses
//! the oldest registered snapshot to bound how far it may apply pages, and
//! the scratch pool uses the oldest registered generation to decide when a
//! freed slot is provably unreachable.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

use crate::types::TxId;

/// Identifier handed out for every registered reader.
pub type ReaderId = u64;

#[derive(Clone, Debug)]
struct ActiveReader {
    snapshot: TxId,
    generation: u64,
    begin: Instant,
}

/// Summary of reader activity for diagnostics.
#[derive(Clone, Debug, Default)]
pub struct ReaderTableStats {
    /// Registered transactions.
    pub active: u64,
    /// Oldest snapshot held by any registered transaction.
    pub oldest_snapshot: Option<TxId>,
    /// Newest snapshot held by any registered transaction.
    pub newest_snapshot: Option<TxId>,
    /// Age in milliseconds of the longest-running registration.
    pub max_age_ms: u64,
}

#[derive(Default)]
struct TableState {
    readers: HashMap<ReaderId, ActiveReader>,
    next_id: ReaderId,
}

/// Table of active snapshot registrations.
#[derive(Default)]
pub struct ReaderTable {
    state: Mutex<TableState>,
}

impl ReaderTable {
    /// Registers a transaction's snapshot and scratch generation.
    pub fn register(&self, snapshot: TxId, generation: u64) -> ReaderId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.readers.insert(
            id,
            ActiveReader {
                snapshot,
                generation,
                begin: Instant::now(),
            },
        );
        id
    }

    /// Releases a registration; unknown ids are ignored.
    pub fn release(&self, id: ReaderId) {
        self.state.lock().readers.remove(&id);
    }

    /// Oldest snapshot any registered transaction observes.
    pub fn oldest_snapshot(&self) -> Option<TxId> {
        let state = self.state.lock();
        state.readers.values().map(|r| r.snapshot).min()
    }

    /// Oldest snapshot among registrations other than `except`.
    ///
    /// The committing writer uses this to ask what other transactions can
    /// still reach, without its own registration pinning everything.
    pub fn oldest_snapshot_except(&self, except: ReaderId) -> Option<TxId> {
        let state = self.state.lock();
        state
            .readers
            .iter()
            .filter(|(id, _)| **id != except)
            .map(|(_, r)| r.snapshot)
            .min()
    }

    /// Oldest scratch generation any registered transaction started under.
    pub fn oldest_generation(&self) -> Option<u64> {
        let state = self.state.lock();
        state.readers.values().map(|r| r.generation).min()
    }

    /// Captures reader activity for diagnostics.
    pub fn stats(&self, now: Instant) -> ReaderTableStats {
        let state = self.state.lock();
        let mut stats = ReaderTableStats {
            active: state.readers.len() as u64,
            ..ReaderTableStats::default()
        };
        for reader in state.readers.values() {
            stats.oldest_snapshot = Some(
                stats
                    .oldest_snapshot
                    .map_or(reader.snapshot, |s| s.min(reader.snapshot)),
            );
            stats.newest_snapshot = Some(
                stats
                    .newest_snapshot
                    .map_or(reader.snapshot, |s| s.max(reader.snapshot)),
            );
            let age_ms = now
                .saturating_duration_since(reader.begin)
                .as_millis()
                .min(u64::MAX as u128) as u64;
            stats.max_age_ms = stats.max_age_ms.max(age_ms);
        }
        stats
    }
}
