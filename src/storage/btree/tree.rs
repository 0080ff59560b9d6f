//! Tree operations: point lookups and copy-on-write mutation.

use crate::types::{
    page::{header as page_header, PageHeader, PageKind, PAGE_HDR_LEN},
    PageId, Result, VesperError,
};

use super::page::{
    self, branch_entry, branch_route, decode_branch_record, decode_leaf_record, encode_branch_record,
    encode_leaf_record, leaf_search, node_hdr, record, OverflowRef, OVERFLOW_PAGE_HDR_LEN,
    SLOT_ENTRY_LEN,
};
use super::{max_inline_value, max_key_len, NodeSource, NodeStore, TreeRootHeader};

/// Looks up `key`, assembling overflow values transparently.
pub fn get<S: NodeSource + ?Sized>(
    src: &S,
    root: &TreeRootHeader,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let Some(mut page_no) = root.root else {
        return Ok(None);
    };
    loop {
        let view = src.load(page_no)?;
        let kind = PageHeader::decode(&view)?.kind;
        let payload = page::payload(&view)?;
        let hdr = node_hdr(payload)?;
        match kind {
            PageKind::TreeBranch => {
                let idx = branch_route(payload, &hdr, key)?;
                page_no = branch_entry(payload, &hdr, idx)?.child;
            }
            PageKind::TreeLeaf => {
                return match leaf_search(payload, &hdr, key)? {
                    Ok(idx) => {
                        let rec = decode_leaf_record(record(payload, &hdr, idx)?)?;
                        if rec.overflow {
                            let reference = OverflowRef::decode(rec.value)?;
                            let value = read_overflow(src, reference)?;
                            Ok(Some(value))
                        } else {
                            Ok(Some(rec.value.to_vec()))
                        }
                    }
                    Err(_) => Ok(None),
                };
            }
            _ => return Err(VesperError::Corruption("tree descent hit non-tree page")),
        }
    }
}

/// Returns whether `key` exists, without touching overflow chains.
pub fn contains<S: NodeSource + ?Sized>(
    src: &S,
    root: &TreeRootHeader,
    key: &[u8],
) -> Result<bool> {
    let Some(mut page_no) = root.root else {
        return Ok(false);
    };
    loop {
        let view = src.load(page_no)?;
        let kind = PageHeader::decode(&view)?.kind;
        let payload = page::payload(&view)?;
        let hdr = node_hdr(payload)?;
        match kind {
            PageKind::TreeBranch => {
                let idx = branch_route(payload, &hdr, key)?;
                page_no = branch_entry(payload, &hdr, idx)?.child;
            }
            PageKind::TreeLeaf => return Ok(leaf_search(payload, &hdr, key)?.is_ok()),
            _ => return Err(VesperError::Corruption("tree descent hit non-tree page")),
        }
    }
}

/// Inserts or replaces `key`.
///
/// The whole root-to-leaf path is rewritten copy-on-write; the previous root
/// stays valid for any snapshot that references it.
pub fn put<S: NodeStore + ?Sized>(
    store: &mut S,
    root: &mut TreeRootHeader,
    key: &[u8],
    value: &[u8],
) -> Result<()> {
    let page_size = store.page_size();
    if key.is_empty() {
        return Err(VesperError::Invalid("tree keys must be non-empty"));
    }
    if key.len() > max_key_len(page_size) {
        return Err(VesperError::Invalid("tree key exceeds page budget"));
    }
    let mut rec = Vec::new();
    if value.len() <= max_inline_value(page_size) {
        encode_leaf_record(key, value, false, &mut rec);
    } else {
        let reference = write_overflow_chain(store, value)?;
        encode_leaf_record(key, &reference.encode(), true, &mut rec);
    }

    let Some(root_no) = root.root else {
        let leaf_no = store.allocate()?;
        let mut buf = new_node(page_size, leaf_no, PageKind::TreeLeaf, store.salt())?;
        let payload = page::payload_mut(&mut buf)?;
        if !page::insert_record(payload, 0, &rec)? {
            return Err(VesperError::Invalid("record exceeds empty page"));
        }
        store.put_dirty(leaf_no, buf);
        root.root = Some(leaf_no);
        root.depth = 1;
        root.entry_count = 1;
        return Ok(());
    };

    let (new_root, outcome, inserted_new) = put_rec(store, root_no, key, &rec)?;
    match outcome {
        Down::Done => {
            root.root = Some(new_root);
        }
        Down::Split { sep, right } => {
            let branch_no = store.allocate()?;
            let mut buf = new_node(page_size, branch_no, PageKind::TreeBranch, store.salt())?;
            let payload = page::payload_mut(&mut buf)?;
            let mut entry = Vec::new();
            encode_branch_record(b"", new_root, &mut entry);
            if !page::insert_record(payload, 0, &entry)? {
                return Err(VesperError::Invalid("branch entry exceeds empty page"));
            }
            entry.clear();
            encode_branch_record(&sep, right, &mut entry);
            if !page::insert_record(payload, 1, &entry)? {
                return Err(VesperError::Invalid("branch entry exceeds empty page"));
            }
            store.put_dirty(branch_no, buf);
            root.root = Some(branch_no);
            root.depth += 1;
        }
    }
    if inserted_new {
        root.entry_count += 1;
    }
    Ok(())
}

/// Deletes `key`; returns whether it existed.
pub fn delete<S: NodeStore + ?Sized>(
    store: &mut S,
    root: &mut TreeRootHeader,
    key: &[u8],
) -> Result<bool> {
    let Some(root_no) = root.root else {
        return Ok(false);
    };
    // Probe first so a miss does not churn the copy-on-write path.
    if !contains(&*store, root, key)? {
        return Ok(false);
    }
    let (new_root, _under) = del_rec(store, root_no, key)?;
    root.entry_count -= 1;

    // Collapse trivial roots: a branch with a single child hands the root to
    // that child, an empty leaf empties the tree.
    let mut current = new_root;
    loop {
        let (kind, nslots, only_child) = {
            let view = store.load(current)?;
            let kind = PageHeader::decode(&view)?.kind;
            let payload = page::payload(&view)?;
            let hdr = node_hdr(payload)?;
            let only_child = if kind == PageKind::TreeBranch && hdr.nslots == 1 {
                Some(branch_entry(payload, &hdr, 0)?.child)
            } else {
                None
            };
            (kind, hdr.nslots, only_child)
        };
        match kind {
            PageKind::TreeBranch => {
                if let Some(child) = only_child {
                    discard_node(store, current);
                    root.depth -= 1;
                    current = child;
                    continue;
                }
            }
            PageKind::TreeLeaf => {
                if nslots == 0 {
                    discard_node(store, current);
                    root.root = None;
                    root.depth = 0;
                    root.entry_count = 0;
                    return Ok(true);
                }
            }
            _ => return Err(VesperError::Corruption("tree root has non-tree kind")),
        }
        break;
    }
    root.root = Some(current);
    Ok(true)
}

enum Down {
    Done,
    Split { sep: Vec<u8>, right: PageId },
}

fn new_node(page_size: usize, page_no: PageId, kind: PageKind, salt: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; page_size];
    page::init_node(&mut buf, page_no, kind, page_size as u32, salt)?;
    Ok(buf)
}

fn make_writable<S: NodeStore + ?Sized>(
    store: &mut S,
    page_no: PageId,
) -> Result<(PageId, Vec<u8>)> {
    if let Some(buf) = store.take_dirty(page_no) {
        return Ok((page_no, buf));
    }
    let view = store.load(page_no)?;
    let mut buf = view.to_vec();
    let new_no = store.allocate()?;
    store.free(page_no);
    buf[page_header::PAGE_NO].copy_from_slice(&new_no.0.to_be_bytes());
    Ok((new_no, buf))
}

fn discard_node<S: NodeStore + ?Sized>(store: &mut S, page_no: PageId) {
    if store.is_dirty(page_no) {
        let _ = store.take_dirty(page_no);
    }
    store.free(page_no);
}

fn collect_records(buf: &[u8]) -> Result<Vec<Vec<u8>>> {
    let payload = page::payload(buf)?;
    let hdr = node_hdr(payload)?;
    let mut records = Vec::with_capacity(hdr.nslots);
    for idx in 0..hdr.nslots {
        records.push(record(payload, &hdr, idx)?.to_vec());
    }
    Ok(records)
}

// First index that belongs to the right half of a byte-balanced split.
fn split_point(records: &[Vec<u8>]) -> usize {
    let total: usize = records.iter().map(|r| r.len() + SLOT_ENTRY_LEN).sum();
    let mut left_cost = 0usize;
    let mut split = 0usize;
    for (idx, rec) in records.iter().enumerate() {
        if idx + 1 == records.len() {
            break;
        }
        let cost = rec.len() + SLOT_ENTRY_LEN;
        if split > 0 && left_cost + cost > total / 2 {
            break;
        }
        left_cost += cost;
        split = idx + 1;
    }
    split.max(1)
}

fn put_rec<S: NodeStore + ?Sized>(
    store: &mut S,
    page_no: PageId,
    key: &[u8],
    rec: &[u8],
) -> Result<(PageId, Down, bool)> {
    let (no, mut buf) = make_writable(store, page_no)?;
    let kind = PageHeader::decode(&buf)?.kind;
    match kind {
        PageKind::TreeLeaf => {
            let mut freed_overflow = None;
            let (idx, replacing) = {
                let payload = page::payload_mut(&mut buf)?;
                let hdr = node_hdr(payload)?;
                match leaf_search(payload, &hdr, key)? {
                    Ok(idx) => {
                        let old = decode_leaf_record(record(payload, &hdr, idx)?)?;
                        if old.overflow {
                            freed_overflow = Some(OverflowRef::decode(old.value)?);
                        }
                        page::remove_record(payload, idx)?;
                        (idx, true)
                    }
                    Err(idx) => (idx, false),
                }
            };
            if let Some(reference) = freed_overflow {
                free_overflow_chain(store, reference.head)?;
            }
            let fits = {
                let payload = page::payload_mut(&mut buf)?;
                page::insert_record(payload, idx, rec)?
            };
            if fits {
                store.put_dirty(no, buf);
                return Ok((no, Down::Done, !replacing));
            }
            let mut records = collect_records(&buf)?;
            records.insert(idx, rec.to_vec());
            let split = split_point(&records);
            let right_records = records.split_off(split);
            let sep = decode_leaf_record(&right_records[0])?.key.to_vec();
            {
                let payload = page::payload_mut(&mut buf)?;
                page::rebuild(payload, &records)?;
            }
            store.put_dirty(no, buf);
            let right_no = store.allocate()?;
            let mut right_buf =
                new_node(store.page_size(), right_no, PageKind::TreeLeaf, store.salt())?;
            {
                let payload = page::payload_mut(&mut right_buf)?;
                page::rebuild(payload, &right_records)?;
            }
            store.put_dirty(right_no, right_buf);
            Ok((
                no,
                Down::Split {
                    sep,
                    right: right_no,
                },
                !replacing,
            ))
        }
        PageKind::TreeBranch => {
            let (child_idx, child_no) = {
                let payload = page::payload(&buf)?;
                let hdr = node_hdr(payload)?;
                let idx = branch_route(payload, &hdr, key)?;
                (idx, branch_entry(payload, &hdr, idx)?.child)
            };
            let (new_child, down, inserted) = put_rec(store, child_no, key, rec)?;
            if new_child != child_no {
                let payload = page::payload_mut(&mut buf)?;
                page::patch_branch_child(payload, child_idx, new_child)?;
            }
            let Down::Split { sep, right } = down else {
                store.put_dirty(no, buf);
                return Ok((no, Down::Done, inserted));
            };
            let mut entry = Vec::new();
            encode_branch_record(&sep, right, &mut entry);
            let fits = {
                let payload = page::payload_mut(&mut buf)?;
                page::insert_record(payload, child_idx + 1, &entry)?
            };
            if fits {
                store.put_dirty(no, buf);
                return Ok((no, Down::Done, inserted));
            }
            let mut records = collect_records(&buf)?;
            records.insert(child_idx + 1, entry);
            let split = split_point(&records);
            let right_records = records.split_off(split);
            let sep_up = decode_branch_record(&right_records[0])?.separator.to_vec();
            {
                let payload = page::payload_mut(&mut buf)?;
                page::rebuild(payload, &records)?;
            }
            store.put_dirty(no, buf);
            let right_no = store.allocate()?;
            let mut right_buf =
                new_node(store.page_size(), right_no, PageKind::TreeBranch, store.salt())?;
            {
                let payload = page::payload_mut(&mut right_buf)?;
                page::rebuild(payload, &right_records)?;
            }
            store.put_dirty(right_no, right_buf);
            Ok((
                no,
                Down::Split {
                    sep: sep_up,
                    right: right_no,
                },
                inserted,
            ))
        }
        _ => Err(VesperError::Corruption("tree descent hit non-tree page")),
    }
}

fn del_rec<S: NodeStore + ?Sized>(
    store: &mut S,
    page_no: PageId,
    key: &[u8],
) -> Result<(PageId, bool)> {
    let (no, mut buf) = make_writable(store, page_no)?;
    let kind = PageHeader::decode(&buf)?.kind;
    let capacity = page::node_capacity(store.page_size());
    match kind {
        PageKind::TreeLeaf => {
            let mut freed_overflow = None;
            {
                let payload = page::payload_mut(&mut buf)?;
                let hdr = node_hdr(payload)?;
                let Ok(idx) = leaf_search(payload, &hdr, key)? else {
                    return Err(VesperError::Corruption("delete lost its probed key"));
                };
                let old = decode_leaf_record(record(payload, &hdr, idx)?)?;
                if old.overflow {
                    freed_overflow = Some(OverflowRef::decode(old.value)?);
                }
                page::remove_record(payload, idx)?;
            }
            if let Some(reference) = freed_overflow {
                free_overflow_chain(store, reference.head)?;
            }
            let under = {
                let payload = page::payload(&buf)?;
                let hdr = node_hdr(payload)?;
                page::used_cost(payload, &hdr)? < capacity / 4
            };
            store.put_dirty(no, buf);
            Ok((no, under))
        }
        PageKind::TreeBranch => {
            let (child_idx, child_no) = {
                let payload = page::payload(&buf)?;
                let hdr = node_hdr(payload)?;
                let idx = branch_route(payload, &hdr, key)?;
                (idx, branch_entry(payload, &hdr, idx)?.child)
            };
            let (new_child, child_under) = del_rec(store, child_no, key)?;
            if new_child != child_no {
                let payload = page::payload_mut(&mut buf)?;
                page::patch_branch_child(payload, child_idx, new_child)?;
            }
            if child_under {
                try_merge_children(store, &mut buf, child_idx)?;
            }
            let under = {
                let payload = page::payload(&buf)?;
                let hdr = node_hdr(payload)?;
                page::used_cost(payload, &hdr)? < capacity / 4
            };
            store.put_dirty(no, buf);
            Ok((no, under))
        }
        _ => Err(VesperError::Corruption("tree descent hit non-tree page")),
    }
}

// Merges the underflowing child at `child_idx` with a sibling when their
// combined records fit one page; otherwise the child stays underfull.
fn try_merge_children<S: NodeStore + ?Sized>(
    store: &mut S,
    parent_buf: &mut Vec<u8>,
    child_idx: usize,
) -> Result<()> {
    let capacity = page::node_capacity(store.page_size());
    let (left_idx, right_idx) = {
        let payload = page::payload(parent_buf)?;
        let hdr = node_hdr(payload)?;
        if hdr.nslots < 2 {
            return Ok(());
        }
        if child_idx + 1 < hdr.nslots {
            (child_idx, child_idx + 1)
        } else {
            (child_idx - 1, child_idx)
        }
    };
    let (left_no, right_no) = {
        let payload = page::payload(parent_buf)?;
        let hdr = node_hdr(payload)?;
        (
            branch_entry(payload, &hdr, left_idx)?.child,
            branch_entry(payload, &hdr, right_idx)?.child,
        )
    };
    let right_view_records = {
        let view = store.load(right_no)?;
        let right_kind = PageHeader::decode(&view)?.kind;
        let left_kind = PageHeader::decode(&store.load(left_no)?)?.kind;
        if right_kind != left_kind {
            return Err(VesperError::Corruption("sibling node kinds differ"));
        }
        collect_records(&view)?
    };
    let left_used = {
        let view = store.load(left_no)?;
        let payload = page::payload(&view)?;
        let hdr = node_hdr(payload)?;
        page::used_cost(payload, &hdr)?
    };
    let right_cost: usize = right_view_records
        .iter()
        .map(|r| r.len() + SLOT_ENTRY_LEN)
        .sum();
    if left_used + right_cost > capacity {
        return Ok(());
    }
    let (merged_no, mut merged_buf) = make_writable(store, left_no)?;
    let mut records = collect_records(&merged_buf)?;
    records.extend(right_view_records);
    {
        let payload = page::payload_mut(&mut merged_buf)?;
        page::rebuild(payload, &records)?;
    }
    store.put_dirty(merged_no, merged_buf);
    discard_node(store, right_no);
    let payload = page::payload_mut(parent_buf)?;
    if merged_no != left_no {
        page::patch_branch_child(payload, left_idx, merged_no)?;
    }
    page::remove_record(payload, right_idx)?;
    Ok(())
}

fn write_overflow_chain<S: NodeStore + ?Sized>(store: &mut S, value: &[u8]) -> Result<OverflowRef> {
    let page_size = store.page_size();
    let chunk_len = page_size - PAGE_HDR_LEN - OVERFLOW_PAGE_HDR_LEN;
    let mut next = PageId(0);
    let chunks: Vec<&[u8]> = value.chunks(chunk_len).collect();
    for part in chunks.iter().rev() {
        let no = store.allocate()?;
        let mut buf = vec![0u8; page_size];
        let header = PageHeader::new(no, PageKind::Overflow, page_size as u32, store.salt())?;
        header.encode(&mut buf[..PAGE_HDR_LEN])?;
        buf[PAGE_HDR_LEN..PAGE_HDR_LEN + 8].copy_from_slice(&next.0.to_be_bytes());
        buf[PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 12]
            .copy_from_slice(&(part.len() as u32).to_be_bytes());
        buf[PAGE_HDR_LEN + 12..PAGE_HDR_LEN + 12 + part.len()].copy_from_slice(part);
        store.put_dirty(no, buf);
        next = no;
    }
    Ok(OverflowRef {
        total_len: value.len() as u64,
        head: next,
    })
}

/// Reads an overflow chain back into one contiguous value.
pub(crate) fn read_overflow<S: NodeSource + ?Sized>(
    src: &S,
    reference: OverflowRef,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(reference.total_len as usize);
    let mut page_no = reference.head;
    while page_no.0 != 0 {
        let view = src.load(page_no)?;
        let header = PageHeader::decode(&view)?;
        if header.kind != PageKind::Overflow {
            return Err(VesperError::Corruption("overflow chain hit non-overflow page"));
        }
        let body = &view[PAGE_HDR_LEN..];
        let next = PageId(u64::from_be_bytes(body[..8].try_into().unwrap()));
        let chunk_len = u32::from_be_bytes(body[8..12].try_into().unwrap()) as usize;
        if OVERFLOW_PAGE_HDR_LEN + chunk_len > body.len() {
            return Err(VesperError::Corruption("overflow chunk beyond page"));
        }
        out.extend_from_slice(&body[OVERFLOW_PAGE_HDR_LEN..OVERFLOW_PAGE_HDR_LEN + chunk_len]);
        if out.len() as u64 > reference.total_len {
            return Err(VesperError::Corruption("overflow chain longer than value"));
        }
        page_no = next;
    }
    if out.len() as u64 != reference.total_len {
        return Err(VesperError::Corruption("overflow chain shorter than value"));
    }
    Ok(out)
}

fn free_overflow_chain<S: NodeStore + ?Sized>(store: &mut S, head: PageId) -> Result<()> {
    let mut page_no = head;
    while page_no.0 != 0 {
        let next = {
            let view = store.load(page_no)?;
            let header = PageHeader::decode(&view)?;
            if header.kind != PageKind::Overflow {
                return Err(VesperError::Corruption("overflow chain hit non-overflow page"));
            }
            let body = &view[PAGE_HDR_LEN..];
            PageId(u64::from_be_bytes(body[..8].try_into().unwrap()))
        };
        discard_node(store, page_no);
        page_no = next;
    }
    Ok(())
}

/// Frees every page of a tree: nodes and overflow chains alike.
///
/// Used when a named tree is dropped; the catalog entry goes away in the
/// same commit.
pub fn free_tree<S: NodeStore + ?Sized>(store: &mut S, root: &TreeRootHeader) -> Result<()> {
    let Some(root_no) = root.root else {
        return Ok(());
    };
    free_subtree(store, root_no)
}

fn free_subtree<S: NodeStore + ?Sized>(store: &mut S, page_no: PageId) -> Result<()> {
    let view = store.load(page_no)?;
    let kind = PageHeader::decode(&view)?.kind;
    match kind {
        PageKind::TreeBranch => {
            let children = {
                let payload = page::payload(&view)?;
                let hdr = node_hdr(payload)?;
                let mut children = Vec::with_capacity(hdr.nslots);
                for idx in 0..hdr.nslots {
                    children.push(branch_entry(payload, &hdr, idx)?.child);
                }
                children
            };
            drop(view);
            for child in children {
                free_subtree(store, child)?;
            }
        }
        PageKind::TreeLeaf => {
            let chains = {
                let payload = page::payload(&view)?;
                let hdr = node_hdr(payload)?;
                let mut chains = Vec::new();
                for idx in 0..hdr.nslots {
                    let rec = decode_leaf_record(record(payload, &hdr, idx)?)?;
                    if rec.overflow {
                        chains.push(OverflowRef::decode(rec.value)?.head);
                    }
                }
                chains
            };
            drop(view);
            for head in chains {
                free_overflow_chain(store, head)?;
            }
        }
        _ => return Err(VesperError::Corruption("tree free hit non-tree page")),
    }
    discard_node(store, page_no);
    Ok(())
}
