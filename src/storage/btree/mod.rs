//! Copy-on-write B+tree over fixed-size pages.
//!
//! Trees never mutate a page that a committed snapshot can reference: every
//! write path copies the touched pages into transaction-owned buffers under
//! fresh page numbers and rewrites the ancestor chain, so the previous root
//! remains fully readable for older snapshots.

use crate::primitives::pager::PageView;
use crate::types::{PageId, Result};

pub mod cursor;
pub mod page;
pub mod tree;


pub use cursor::Cursor;

/// Root pointer and statistics of one named tree, embedded in the catalog
/// carried by every transaction record.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TreeRootHeader {
    /// Root page, `None` while the tree is empty.
    pub root: Option<PageId>,
    /// Number of levels, counting the leaf level; zero while empty.
    pub depth: u32,
    /// Number of live keys.
    pub entry_count: u64,
}

/// Read access to pages, resolved through a transaction's snapshot.
pub trait NodeSource {
    /// Page size in bytes.
    fn page_size(&self) -> usize;
    /// Loads the page image visible to this transaction.
    fn load(&self, page: PageId) -> Result<PageView>;
}

/// Page allocation and dirty-tracking services a write transaction offers
/// the tree.
pub trait NodeStore: NodeSource {
    /// Environment salt, needed to stamp fresh page headers.
    fn salt(&self) -> u64;
    /// Allocates a page number for a copy-on-write image.
    fn allocate(&mut self) -> Result<PageId>;
    /// Releases a page superseded by a copy-on-write rewrite.
    fn free(&mut self, page: PageId);
    /// Whether this transaction already owns a working image of `page`.
    fn is_dirty(&self, page: PageId) -> bool;
    /// Takes the working image of `page` for mutation.
    fn take_dirty(&mut self, page: PageId) -> Option<Vec<u8>>;
    /// Stores the working image of `page`.
    fn put_dirty(&mut self, page: PageId, image: Vec<u8>);
}

/// Longest key accepted by a tree with the given page size.
pub fn max_key_len(page_size: usize) -> usize {
    page::node_capacity(page_size) / 8
}

/// Longest value stored inline in a leaf; anything larger spills to an
/// overflow chain.
pub fn max_inline_value(page_size: usize) -> usize {
    page::node_capacity(page_size) / 8
}
