//! Read and write transactions.
//!
//! A read transaction pins an immutable snapshot: the committed catalog, the
//! pager mapping segment, and a reader registration that protects scratch
//! versions from reclamation. The single write transaction stages
//! copy-on-write page images in a private dirty table and publishes them
//! atomically at commit through the journal.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::RawMutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::primitives::journal::encode_record;
use crate::primitives::pager::PageView;
use crate::types::{page, PageId, Result, TxId, VesperError};

use super::btree::{tree, Cursor, NodeSource, NodeStore, TreeRootHeader};
use super::catalog::Catalog;
use super::env::{CommittedState, CommittedVersion, EnvInner, WriterShared};
use super::freelist;
use super::options::Durability;
use super::readers::ReaderId;

type WriterGuard = ArcMutexGuard<RawMutex, WriterShared>;

/// Cheap handle naming a tree inside a transaction's catalog.
#[derive(Clone, Debug)]
pub struct TreeRef {
    name: Arc<str>,
}

impl TreeRef {
    fn new(name: &str) -> Self {
        Self { name: name.into() }
    }

    /// The tree's name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A read transaction over one immutable snapshot.
pub struct ReadTx {
    inner: Arc<EnvInner>,
    state: Arc<CommittedState>,
    segment: Arc<crate::primitives::pager::MapSegment>,
    reader_id: ReaderId,
}

pub(crate) fn begin_read(inner: Arc<EnvInner>) -> Result<ReadTx> {
    // Registration happens under the committed-state lock so a committing
    // writer either sees this reader or publishes first; either way the
    // snapshot the reader captured stays resolvable.
    let (state, reader_id) = {
        let guard = inner.committed.read();
        let state = Arc::clone(&*guard);
        let reader_id = inner
            .readers
            .register(state.last_committed, inner.scratch.generation());
        (state, reader_id)
    };
    let segment = inner.pager.segment();
    Ok(ReadTx {
        inner,
        state,
        segment,
        reader_id,
    })
}

impl ReadTx {
    /// The snapshot's transaction id.
    pub fn id(&self) -> TxId {
        self.state.last_committed
    }

    /// Opens an existing named tree.
    pub fn open_tree(&self, name: &str) -> Result<TreeRef> {
        Catalog::validate_name(name)?;
        if self.state.catalog.tree(name).is_none() {
            return Err(VesperError::NotFound);
        }
        Ok(TreeRef::new(name))
    }

    /// Names of all trees in this snapshot.
    pub fn tree_names(&self) -> Vec<String> {
        self.state.catalog.tree_names().map(String::from).collect()
    }

    /// Root statistics (depth and entry count) of a tree.
    pub fn tree_stats(&self, tree: &TreeRef) -> Result<TreeRootHeader> {
        self.state
            .catalog
            .tree(tree.name())
            .ok_or(VesperError::NotFound)
    }

    /// Point lookup.
    pub fn get(&self, tree: &TreeRef, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let root = self.tree_stats(tree)?;
        tree::get(self, &root, key)
    }

    /// Whether `key` exists.
    pub fn contains(&self, tree: &TreeRef, key: &[u8]) -> Result<bool> {
        let root = self.tree_stats(tree)?;
        tree::contains(self, &root, key)
    }

    /// Iterates the whole tree in key order.
    pub fn iter(&self, tree: &TreeRef) -> Result<Cursor<'_, ReadTx>> {
        self.range(tree, None, None)
    }

    /// Iterates `[start, end)` in key order.
    pub fn range(
        &self,
        tree: &TreeRef,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Cursor<'_, ReadTx>> {
        let root = self.tree_stats(tree)?;
        Cursor::new(self, &root, start, end)
    }
}

impl NodeSource for ReadTx {
    fn page_size(&self) -> usize {
        self.inner.page_size
    }

    fn load(&self, page: PageId) -> Result<PageView> {
        if let Some(view) = self.inner.scratch.lookup(page, self.state.last_committed) {
            return Ok(view);
        }
        self.inner.pager.read_page(&self.segment, page)
    }
}

impl Drop for ReadTx {
    fn drop(&mut self) {
        self.inner.readers.release(self.reader_id);
    }
}

/// The environment's single write transaction.
///
/// Dropping it without [`WriteTx::commit`] rolls everything back: no on-disk
/// state changes and the writer slot frees.
pub struct WriteTx {
    inner: Arc<EnvInner>,
    shared: WriterGuard,
    state: Arc<CommittedState>,
    segment: Arc<crate::primitives::pager::MapSegment>,
    reader_id: ReaderId,
    catalog: Catalog,
    catalog_changed: bool,
    next_page: u64,
    dirty: FxHashMap<u64, Vec<u8>>,
    freed: BTreeSet<u64>,
    allocated_from_free: Vec<u64>,
    final_free: Option<BTreeSet<u64>>,
    committed: bool,
}

pub(crate) fn begin_write(inner: Arc<EnvInner>) -> Result<WriteTx> {
    // Blocks here until the current writer commits or rolls back.
    let shared = inner.writer.lock_arc();
    build_write(inner, shared)
}

pub(crate) fn try_begin_write(inner: Arc<EnvInner>) -> Result<Option<WriteTx>> {
    match inner.writer.try_lock_arc() {
        Some(shared) => build_write(inner, shared).map(Some),
        None => Ok(None),
    }
}

fn build_write(inner: Arc<EnvInner>, shared: WriterGuard) -> Result<WriteTx> {
    let (state, reader_id) = {
        let guard = inner.committed.read();
        let state = Arc::clone(&*guard);
        let reader_id = inner
            .readers
            .register(state.last_committed, inner.scratch.generation());
        (state, reader_id)
    };
    let segment = inner.pager.segment();
    let catalog = (*state.catalog).clone();
    let next_page = state.next_page.0;
    Ok(WriteTx {
        inner,
        shared,
        state,
        segment,
        reader_id,
        catalog,
        catalog_changed: false,
        next_page,
        dirty: FxHashMap::default(),
        freed: BTreeSet::new(),
        allocated_from_free: Vec::new(),
        final_free: None,
        committed: false,
    })
}

impl WriteTx {
    /// The snapshot this transaction started from.
    pub fn snapshot_id(&self) -> TxId {
        self.state.last_committed
    }

    /// Opens `name`, creating it in this transaction when absent.
    pub fn create_tree(&mut self, name: &str) -> Result<TreeRef> {
        Catalog::validate_name(name)?;
        if self.catalog.tree(name).is_none() {
            self.catalog.set_tree(name, TreeRootHeader::default());
            self.catalog_changed = true;
        }
        Ok(TreeRef::new(name))
    }

    /// Opens an existing named tree.
    pub fn open_tree(&self, name: &str) -> Result<TreeRef> {
        Catalog::validate_name(name)?;
        if self.catalog.tree(name).is_none() {
            return Err(VesperError::NotFound);
        }
        Ok(TreeRef::new(name))
    }

    /// Drops a named tree, freeing all of its pages; returns whether it
    /// existed.
    pub fn delete_tree(&mut self, name: &str) -> Result<bool> {
        Catalog::validate_name(name)?;
        let Some(root) = self.catalog.tree(name) else {
            return Ok(false);
        };
        tree::free_tree(self, &root)?;
        self.catalog.remove_tree(name);
        self.catalog_changed = true;
        Ok(true)
    }

    /// Names of all trees as this transaction sees them.
    pub fn tree_names(&self) -> Vec<String> {
        self.catalog.tree_names().map(String::from).collect()
    }

    /// Root statistics of a tree, including uncommitted changes.
    pub fn tree_stats(&self, tree: &TreeRef) -> Result<TreeRootHeader> {
        self.catalog.tree(tree.name()).ok_or(VesperError::NotFound)
    }

    /// Point lookup observing this transaction's own writes.
    pub fn get(&self, tree: &TreeRef, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let root = self.tree_stats(tree)?;
        tree::get(self, &root, key)
    }

    /// Whether `key` exists, observing this transaction's own writes.
    pub fn contains(&self, tree: &TreeRef, key: &[u8]) -> Result<bool> {
        let root = self.tree_stats(tree)?;
        tree::contains(self, &root, key)
    }

    /// Inserts or replaces `key`.
    pub fn put(&mut self, tree: &TreeRef, key: &[u8], value: &[u8]) -> Result<()> {
        let mut root = self.tree_stats(tree)?;
        tree::put(self, &mut root, key, value)?;
        self.catalog.set_tree(tree.name(), root);
        self.catalog_changed = true;
        Ok(())
    }

    /// Deletes `key`; returns whether it existed.
    pub fn delete(&mut self, tree: &TreeRef, key: &[u8]) -> Result<bool> {
        let mut root = self.tree_stats(tree)?;
        let existed = tree::delete(self, &mut root, key)?;
        if existed {
            self.catalog.set_tree(tree.name(), root);
            self.catalog_changed = true;
        }
        Ok(existed)
    }

    /// Iterates the whole tree, including uncommitted changes.
    pub fn iter(&self, tree: &TreeRef) -> Result<Cursor<'_, WriteTx>> {
        self.range(tree, None, None)
    }

    /// Iterates `[start, end)`, including uncommitted changes.
    pub fn range(
        &self,
        tree: &TreeRef,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Cursor<'_, WriteTx>> {
        let root = self.tree_stats(tree)?;
        Cursor::new(self, &root, start, end)
    }

    /// Commits the transaction.
    ///
    /// Assigns the next transaction id, appends the record to the journal
    /// (fsyncing under full durability), and only then publishes the new
    /// roots with a single pointer swap. A journal failure leaves committed
    /// state untouched and rolls the transaction back on drop.
    pub fn commit(mut self) -> Result<TxId> {
        if self.dirty.is_empty() && !self.catalog_changed {
            self.committed = true;
            return Ok(self.state.last_committed);
        }
        self.persist_free_list()?;

        let tx_id = TxId(self.state.last_committed.0 + 1);
        let salt = self.inner.salt;
        let mut keys: Vec<u64> = self.dirty.keys().copied().collect();
        keys.sort_unstable();
        for key in &keys {
            let image = self.dirty.get_mut(key).expect("dirty image");
            page::seal_page(image, PageId(*key), salt)?;
        }
        let catalog_bytes = self.catalog.encode();
        if catalog_bytes.len() > self.inner.catalog_capacity() {
            return Err(VesperError::Invalid("tree catalog exceeds meta page"));
        }
        let page_refs: Vec<(PageId, &[u8])> = keys
            .iter()
            .map(|key| (PageId(*key), self.dirty[key].as_slice()))
            .collect();
        let record = encode_record(
            tx_id,
            PageId(self.next_page),
            &catalog_bytes,
            &page_refs,
            self.inner.page_size,
            self.inner.options.compress_journal,
        )?;
        let sync = matches!(self.inner.options.durability, Durability::Full);
        self.inner.journal.append(tx_id, &record, sync)?;

        // Durable (to the configured degree): publish.
        self.inner.scratch.publish(tx_id, &page_refs)?;
        drop(page_refs);
        let new_state = Arc::new(CommittedState {
            last_committed: tx_id,
            next_page: PageId(self.next_page),
            catalog: Arc::new(self.catalog.clone()),
        });
        self.inner.history.lock().push_back(CommittedVersion {
            tx: tx_id,
            next_page: PageId(self.next_page),
            catalog: Arc::clone(&new_state.catalog),
        });
        *self.inner.committed.write() = new_state;

        // Readers registering from here on see `tx_id`; whatever older
        // snapshots remain registered bounds the eager version cleanup.
        let touched: Vec<PageId> = keys.iter().map(|k| PageId(*k)).collect();
        let freed: Vec<PageId> = self.freed.iter().map(|k| PageId(*k)).collect();
        let oldest_reader = self.inner.readers.oldest_snapshot_except(self.reader_id);
        self.inner.scratch.prune(&touched, &freed, tx_id, oldest_reader);

        if let Some(free) = self.final_free.take() {
            self.shared.free_pages = free;
        }
        self.committed = true;
        debug!(tx = tx_id.0, pages = keys.len(), "txn.commit");
        Ok(tx_id)
    }

    // Persists the post-commit free set as a chain of free-list pages.
    //
    // Chain pages are always allocated from `next_page`, never from the free
    // set itself, so the serialized set is stable; the previous chain's pages
    // join the set they used to describe.
    fn persist_free_list(&mut self) -> Result<()> {
        if self.freed.is_empty() && self.allocated_from_free.is_empty() {
            return Ok(());
        }
        let mut set: BTreeSet<u64> = self.shared.free_pages.clone();
        set.extend(self.freed.iter().copied());
        let mut old_chain = self.state.catalog.free_head();
        while let Some(page_no) = old_chain {
            let view = self.load(page_no)?;
            let (next, _entries) = freelist::decode_chain_page(&view)?;
            set.insert(page_no.0);
            old_chain = next;
        }

        if set.is_empty() {
            self.catalog.set_free_head(None);
            self.catalog_changed = true;
            self.final_free = Some(set);
            return Ok(());
        }
        let per_page = freelist::entries_per_page(self.inner.page_size);
        let entries: Vec<u64> = set.iter().copied().collect();
        let chunks: Vec<&[u64]> = entries.chunks(per_page).collect();
        let mut chain_pages = Vec::with_capacity(chunks.len());
        for _ in 0..chunks.len() {
            let page_no = PageId(self.next_page);
            self.next_page += 1;
            chain_pages.push(page_no);
        }
        for (idx, chunk) in chunks.iter().enumerate().rev() {
            let next = chain_pages.get(idx + 1).copied();
            let image = freelist::encode_chain_page(
                chain_pages[idx],
                next,
                chunk,
                self.inner.page_size,
                self.inner.salt,
            )?;
            self.dirty.insert(chain_pages[idx].0, image);
        }
        self.catalog.set_free_head(Some(chain_pages[0]));
        self.catalog_changed = true;
        self.final_free = Some(set);
        Ok(())
    }
}

impl NodeSource for WriteTx {
    fn page_size(&self) -> usize {
        self.inner.page_size
    }

    fn load(&self, page: PageId) -> Result<PageView> {
        if let Some(image) = self.dirty.get(&page.0) {
            return Ok(PageView::owned(image.clone().into()));
        }
        if let Some(view) = self.inner.scratch.lookup(page, self.state.last_committed) {
            return Ok(view);
        }
        self.inner.pager.read_page(&self.segment, page)
    }
}

impl NodeStore for WriteTx {
    fn salt(&self) -> u64 {
        self.inner.salt
    }

    fn allocate(&mut self) -> Result<PageId> {
        if let Some(page) = self.shared.free_pages.pop_first() {
            self.allocated_from_free.push(page);
            return Ok(PageId(page));
        }
        let page = self.next_page;
        self.next_page += 1;
        Ok(PageId(page))
    }

    fn free(&mut self, page: PageId) {
        self.freed.insert(page.0);
    }

    fn is_dirty(&self, page: PageId) -> bool {
        self.dirty.contains_key(&page.0)
    }

    fn take_dirty(&mut self, page: PageId) -> Option<Vec<u8>> {
        self.dirty.remove(&page.0)
    }

    fn put_dirty(&mut self, page: PageId, image: Vec<u8>) {
        self.dirty.insert(page.0, image);
    }
}

impl Drop for WriteTx {
    fn drop(&mut self) {
        if !self.committed {
            // Rollback: the dirty table vanishes, reclaimed free pages go
            // back to the committed free set.
            for page in self.allocated_from_free.drain(..) {
                self.shared.free_pages.insert(page);
            }
            debug!("txn.rollback");
        }
        self.inner.readers.release(self.reader_id);
    }
}
