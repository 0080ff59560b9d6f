//! Tree catalog: the named-tree roots and free-list head carried by every
//! transaction record and by the meta page at checkpoint time.

use std::collections::BTreeMap;

use crate::primitives::bytes::ByteCursor;
use crate::types::{PageId, Result, VesperError};

use super::btree::TreeRootHeader;

/// Longest accepted tree name in bytes.
pub const MAX_TREE_NAME_LEN: usize = 128;

/// Snapshot of every named tree root plus the free-list head.
///
/// A catalog is immutable once published; write transactions work on a
/// private clone and commit it atomically with their pages.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Catalog {
    free_head: Option<PageId>,
    trees: BTreeMap<String, TreeRootHeader>,
}

impl Catalog {
    /// Head of the persisted free-list chain.
    pub fn free_head(&self) -> Option<PageId> {
        self.free_head
    }

    /// Points the catalog at a new free-list chain.
    pub fn set_free_head(&mut self, head: Option<PageId>) {
        self.free_head = head;
    }

    /// Root header of `name`, if the tree exists.
    pub fn tree(&self, name: &str) -> Option<TreeRootHeader> {
        self.trees.get(name).copied()
    }

    /// Creates or updates the root header of `name`.
    pub fn set_tree(&mut self, name: &str, root: TreeRootHeader) {
        self.trees.insert(name.to_owned(), root);
    }

    /// Removes `name`, returning its last root header.
    pub fn remove_tree(&mut self, name: &str) -> Option<TreeRootHeader> {
        self.trees.remove(name)
    }

    /// Tree names in lexicographic order.
    pub fn tree_names(&self) -> impl Iterator<Item = &str> {
        self.trees.keys().map(String::as_str)
    }

    /// Number of named trees.
    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    /// Validates a tree name before it enters the catalog.
    pub fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(VesperError::Invalid("tree name must be non-empty"));
        }
        if name.len() > MAX_TREE_NAME_LEN {
            return Err(VesperError::Invalid("tree name too long"));
        }
        Ok(())
    }

    /// Serializes the catalog into its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.trees.len() * 32);
        out.extend_from_slice(&self.free_head.map(|p| p.0).unwrap_or(0).to_be_bytes());
        out.extend_from_slice(&(self.trees.len() as u32).to_be_bytes());
        for (name, root) in &self.trees {
            out.extend_from_slice(&(name.len() as u16).to_be_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&root.root.map(|p| p.0).unwrap_or(0).to_be_bytes());
            out.extend_from_slice(&root.depth.to_be_bytes());
            out.extend_from_slice(&root.entry_count.to_be_bytes());
        }
        out
    }

    /// Deserializes a catalog blob.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = ByteCursor::new(buf);
        let free_head_raw = cursor.read_u64("catalog free head truncated")?;
        let free_head = (free_head_raw != 0).then_some(PageId(free_head_raw));
        let count = cursor.read_u32("catalog tree count truncated")? as usize;
        let mut trees = BTreeMap::new();
        for _ in 0..count {
            let name_len = cursor.read_u16("catalog name length truncated")? as usize;
            if name_len == 0 || name_len > MAX_TREE_NAME_LEN {
                return Err(VesperError::Corruption("catalog name length out of range"));
            }
            let name = std::str::from_utf8(cursor.take(name_len)?)
                .map_err(|_| VesperError::Corruption("catalog name not utf-8"))?
                .to_owned();
            let root_raw = cursor.read_u64("catalog root truncated")?;
            let depth = cursor.read_u32("catalog depth truncated")?;
            let entry_count = cursor.read_u64("catalog entry count truncated")?;
            let root = TreeRootHeader {
                root: (root_raw != 0).then_some(PageId(root_raw)),
                depth,
                entry_count,
            };
            if trees.insert(name, root).is_some() {
                return Err(VesperError::Corruption("catalog has duplicate tree"));
            }
        }
        if cursor.remaining() != 0 {
            return Err(VesperError::Corruption("catalog has trailing bytes"));
        }
        Ok(Self { free_head, trees })
    }
}
