//! Forward-only range iteration over a tree snapshot.

use smallvec::SmallVec;

use crate::types::{
    page::{PageHeader, PageKind},
    PageId, Result, VesperError,
};

use super::page::{
    self, branch_entry, branch_route, decode_leaf_record, leaf_search, node_hdr, record,
    OverflowRef,
};
use super::tree::read_overflow;
use super::{NodeSource, TreeRootHeader};

#[derive(Clone, Copy, Debug)]
struct Frame {
    page: PageId,
    idx: usize,
}

/// Lazy, forward-only cursor over the key range `[start, end)`.
///
/// The cursor is bound to the snapshot of the transaction it was created
/// from: commits that happen while it is alive are never observed.
pub struct Cursor<'s, S: NodeSource + ?Sized> {
    src: &'s S,
    // Depth-bounded: eight levels cover any realistic tree.
    stack: SmallVec<[Frame; 8]>,
    end: Option<Vec<u8>>,
    done: bool,
}

impl<'s, S: NodeSource + ?Sized> Cursor<'s, S> {
    /// Positions a cursor at `start` (or the smallest key).
    pub fn new(
        src: &'s S,
        root: &TreeRootHeader,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Self> {
        let mut cursor = Self {
            src,
            stack: SmallVec::new(),
            end: end.map(Vec::from),
            done: false,
        };
        match root.root {
            Some(root_no) => cursor.seek(root_no, start)?,
            None => cursor.done = true,
        }
        Ok(cursor)
    }

    fn seek(&mut self, mut page_no: PageId, start: Option<&[u8]>) -> Result<()> {
        loop {
            let view = self.src.load(page_no)?;
            let kind = PageHeader::decode(&view)?.kind;
            let payload = page::payload(&view)?;
            let hdr = node_hdr(payload)?;
            match kind {
                PageKind::TreeBranch => {
                    let idx = match start {
                        Some(key) => branch_route(payload, &hdr, key)?,
                        None => 0,
                    };
                    let child = branch_entry(payload, &hdr, idx)?.child;
                    self.stack.push(Frame { page: page_no, idx });
                    page_no = child;
                }
                PageKind::TreeLeaf => {
                    let idx = match start {
                        Some(key) => match leaf_search(payload, &hdr, key)? {
                            Ok(idx) | Err(idx) => idx,
                        },
                        None => 0,
                    };
                    self.stack.push(Frame { page: page_no, idx });
                    return Ok(());
                }
                _ => return Err(VesperError::Corruption("cursor hit non-tree page")),
            }
        }
    }

    fn descend_leftmost(&mut self, mut page_no: PageId) -> Result<()> {
        loop {
            let view = self.src.load(page_no)?;
            let kind = PageHeader::decode(&view)?.kind;
            let payload = page::payload(&view)?;
            let hdr = node_hdr(payload)?;
            match kind {
                PageKind::TreeBranch => {
                    let child = branch_entry(payload, &hdr, 0)?.child;
                    self.stack.push(Frame { page: page_no, idx: 0 });
                    page_no = child;
                }
                PageKind::TreeLeaf => {
                    self.stack.push(Frame { page: page_no, idx: 0 });
                    return Ok(());
                }
                _ => return Err(VesperError::Corruption("cursor hit non-tree page")),
            }
        }
    }

    /// Returns the next key/value pair, or `None` past the range end.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.done {
            return Ok(None);
        }
        loop {
            let Some(&Frame { page, idx }) = self.stack.last() else {
                self.done = true;
                return Ok(None);
            };
            let view = self.src.load(page)?;
            let kind = PageHeader::decode(&view)?.kind;
            let payload = page::payload(&view)?;
            let hdr = node_hdr(payload)?;
            match kind {
                PageKind::TreeLeaf => {
                    if idx >= hdr.nslots {
                        self.stack.pop();
                        continue;
                    }
                    let rec = decode_leaf_record(record(payload, &hdr, idx)?)?;
                    if let Some(end) = &self.end {
                        if rec.key >= end.as_slice() {
                            self.done = true;
                            return Ok(None);
                        }
                    }
                    let key = rec.key.to_vec();
                    let value = if rec.overflow {
                        let reference = OverflowRef::decode(rec.value)?;
                        read_overflow(self.src, reference)?
                    } else {
                        rec.value.to_vec()
                    };
                    self.stack.last_mut().expect("leaf frame").idx += 1;
                    return Ok(Some((key, value)));
                }
                PageKind::TreeBranch => {
                    let next_idx = idx + 1;
                    if next_idx >= hdr.nslots {
                        self.stack.pop();
                        continue;
                    }
                    let child = branch_entry(payload, &hdr, next_idx)?.child;
                    self.stack.last_mut().expect("branch frame").idx = next_idx;
                    self.descend_leftmost(child)?;
                }
                _ => return Err(VesperError::Corruption("cursor hit non-tree page")),
            }
        }
    }
}

impl<'s, S: NodeSource + ?Sized> Iterator for Cursor<'s, S> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
