//! Slotted page layout for tree nodes.
//!
//! Every node page starts with the fixed page header, followed by a small
//! node header, record bytes growing upward from the header, and a slot
//! directory growing downward from the payload end. Slots are kept in key
//! order; records are not, so deletions leave holes that compaction
//! reclaims.
//!
//! Leaf records: `flags u8 | varint key_len | varint val_len | key | value`,
//! where an overflow value is the 16-byte `total_len u64 | head_page u64`
//! reference. Branch records: `child u64 | sep_len u16 | separator`.

use std::convert::TryFrom;

use crate::primitives::bytes::{var, ByteCursor};
use crate::types::{
    page::{PageHeader, PageKind, PAGE_HDR_LEN},
    PageId, Result, VesperError,
};

/// Length of the node header at the start of the payload.
pub const NODE_HDR_LEN: usize = 8;
/// Size of one slot directory entry (`offset u16 | len u16`).
pub const SLOT_ENTRY_LEN: usize = 4;
/// Length of an overflow value reference stored inline in a leaf.
pub const OVERFLOW_REF_LEN: usize = 16;
/// Fixed prefix of a branch record before the separator bytes.
pub const BRANCH_RECORD_HDR_LEN: usize = 10;
/// Overflow page prefix: `next_page u64 | chunk_len u32`.
pub const OVERFLOW_PAGE_HDR_LEN: usize = 12;

/// Leaf record flag: value lives in an overflow chain.
pub const LEAF_FLAG_OVERFLOW: u8 = 0x1;

const NSLOTS_OFFSET: usize = 0;
const FREE_START_OFFSET: usize = 2;
const FREE_END_OFFSET: usize = 4;

/// Decoded node header.
#[derive(Clone, Copy, Debug)]
pub struct NodeHdr {
    /// Number of slots in the directory.
    pub nslots: usize,
    /// Payload offset where the next record would be written.
    pub free_start: usize,
    /// Payload offset where the slot directory begins.
    pub free_end: usize,
}

/// Returns the payload region of a node page.
pub fn payload(page: &[u8]) -> Result<&[u8]> {
    if page.len() < PAGE_HDR_LEN + NODE_HDR_LEN {
        return Err(VesperError::Corruption("node page shorter than headers"));
    }
    Ok(&page[PAGE_HDR_LEN..])
}

/// Mutable variant of [`payload`].
pub fn payload_mut(page: &mut [u8]) -> Result<&mut [u8]> {
    if page.len() < PAGE_HDR_LEN + NODE_HDR_LEN {
        return Err(VesperError::Corruption("node page shorter than headers"));
    }
    Ok(&mut page[PAGE_HDR_LEN..])
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn write_u16(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_be_bytes());
}

/// Parses and validates the node header of `payload`.
pub fn node_hdr(payload: &[u8]) -> Result<NodeHdr> {
    let nslots = read_u16(payload, NSLOTS_OFFSET) as usize;
    let free_start = read_u16(payload, FREE_START_OFFSET) as usize;
    let free_end = read_u16(payload, FREE_END_OFFSET) as usize;
    let slot_bytes = nslots
        .checked_mul(SLOT_ENTRY_LEN)
        .ok_or(VesperError::Corruption("slot count overflow"))?;
    if free_start < NODE_HDR_LEN
        || free_start > free_end
        || free_end > payload.len()
        || slot_bytes > payload.len()
        || free_end != payload.len() - slot_bytes
    {
        return Err(VesperError::Corruption("node header out of range"));
    }
    Ok(NodeHdr {
        nslots,
        free_start,
        free_end,
    })
}

/// Initializes a fresh node page (page header plus empty node header).
pub fn init_node(
    page: &mut [u8],
    page_no: PageId,
    kind: PageKind,
    page_size: u32,
    salt: u64,
) -> Result<()> {
    if !matches!(kind, PageKind::TreeLeaf | PageKind::TreeBranch) {
        return Err(VesperError::Invalid("init_node requires a tree page kind"));
    }
    page.fill(0);
    let header = PageHeader::new(page_no, kind, page_size, salt)?;
    header.encode(&mut page[..PAGE_HDR_LEN])?;
    let payload = payload_mut(page)?;
    let payload_len = payload.len();
    write_u16(payload, NSLOTS_OFFSET, 0);
    write_u16(payload, FREE_START_OFFSET, NODE_HDR_LEN as u16);
    write_u16(
        payload,
        FREE_END_OFFSET,
        u16::try_from(payload_len).map_err(|_| VesperError::Invalid("payload exceeds u16"))?,
    );
    Ok(())
}

/// Returns the `(offset, len)` extent of slot `idx`.
pub fn slot(payload: &[u8], hdr: &NodeHdr, idx: usize) -> Result<(usize, usize)> {
    if idx >= hdr.nslots {
        return Err(VesperError::Invalid("slot index out of range"));
    }
    let pos = hdr.free_end + idx * SLOT_ENTRY_LEN;
    let off = read_u16(payload, pos) as usize;
    let len = read_u16(payload, pos + 2) as usize;
    let end = off
        .checked_add(len)
        .ok_or(VesperError::Corruption("record extent overflow"))?;
    if len == 0 || off < NODE_HDR_LEN || end > hdr.free_start {
        return Err(VesperError::Corruption("record extent out of range"));
    }
    Ok((off, len))
}

/// Returns the raw bytes of the record at slot `idx`.
pub fn record<'a>(payload: &'a [u8], hdr: &NodeHdr, idx: usize) -> Result<&'a [u8]> {
    let (off, len) = slot(payload, hdr, idx)?;
    Ok(&payload[off..off + len])
}

/// Bytes of payload accounted to live records and their slots.
pub fn used_cost(payload: &[u8], hdr: &NodeHdr) -> Result<usize> {
    let mut total = 0;
    for idx in 0..hdr.nslots {
        let (_, len) = slot(payload, hdr, idx)?;
        total += len + SLOT_ENTRY_LEN;
    }
    Ok(total)
}

/// Capacity available to records and slots on a node page.
pub fn node_capacity(page_size: usize) -> usize {
    page_size - PAGE_HDR_LEN - NODE_HDR_LEN
}

/// Inserts `bytes` as a new record at slot `idx`, compacting if fragmented.
///
/// Returns `false` when the record cannot fit even after compaction, in
/// which case the page is left unchanged and the caller must split.
pub fn insert_record(payload: &mut [u8], idx: usize, bytes: &[u8]) -> Result<bool> {
    let hdr = node_hdr(payload)?;
    if idx > hdr.nslots {
        return Err(VesperError::Invalid("slot insert index out of range"));
    }
    let need = bytes.len() + SLOT_ENTRY_LEN;
    let gap = hdr.free_end - hdr.free_start;
    if need > gap {
        let live = used_cost(payload, &hdr)?;
        if live + need > payload.len() - NODE_HDR_LEN {
            return Ok(false);
        }
        compact(payload)?;
        return insert_record(payload, idx, bytes);
    }
    let rec_off = hdr.free_start;
    payload[rec_off..rec_off + bytes.len()].copy_from_slice(bytes);
    // Shift the slot directory down by one entry and open slot `idx`.
    let new_free_end = hdr.free_end - SLOT_ENTRY_LEN;
    let split_at = hdr.free_end + idx * SLOT_ENTRY_LEN;
    payload.copy_within(hdr.free_end..split_at, new_free_end);
    write_u16(payload, new_free_end + idx * SLOT_ENTRY_LEN, rec_off as u16);
    write_u16(
        payload,
        new_free_end + idx * SLOT_ENTRY_LEN + 2,
        bytes.len() as u16,
    );
    write_u16(payload, NSLOTS_OFFSET, (hdr.nslots + 1) as u16);
    write_u16(payload, FREE_START_OFFSET, (rec_off + bytes.len()) as u16);
    write_u16(payload, FREE_END_OFFSET, new_free_end as u16);
    Ok(true)
}

/// Removes the record at slot `idx`; its bytes become a hole until the next
/// compaction.
pub fn remove_record(payload: &mut [u8], idx: usize) -> Result<()> {
    let hdr = node_hdr(payload)?;
    if idx >= hdr.nslots {
        return Err(VesperError::Invalid("slot remove index out of range"));
    }
    let entry_pos = hdr.free_end + idx * SLOT_ENTRY_LEN;
    payload.copy_within(hdr.free_end..entry_pos, hdr.free_end + SLOT_ENTRY_LEN);
    write_u16(payload, NSLOTS_OFFSET, (hdr.nslots - 1) as u16);
    write_u16(payload, FREE_END_OFFSET, (hdr.free_end + SLOT_ENTRY_LEN) as u16);
    Ok(())
}

/// Overwrites the first eight bytes of the record at `idx` (a branch child
/// pointer) in place.
pub fn patch_branch_child(payload: &mut [u8], idx: usize, child: PageId) -> Result<()> {
    let hdr = node_hdr(payload)?;
    let (off, len) = slot(payload, &hdr, idx)?;
    if len < BRANCH_RECORD_HDR_LEN {
        return Err(VesperError::Corruption("branch record shorter than header"));
    }
    payload[off..off + 8].copy_from_slice(&child.0.to_be_bytes());
    Ok(())
}

/// Rewrites all records densely, eliminating holes.
pub fn compact(payload: &mut [u8]) -> Result<()> {
    let hdr = node_hdr(payload)?;
    let mut records = Vec::with_capacity(hdr.nslots);
    for idx in 0..hdr.nslots {
        records.push(record(payload, &hdr, idx)?.to_vec());
    }
    rebuild(payload, &records)
}

/// Replaces the page content with `records` in slot order.
///
/// The caller must have verified the records fit; violating that is a logic
/// error surfaced as `Invalid`.
pub fn rebuild(payload: &mut [u8], records: &[Vec<u8>]) -> Result<()> {
    let payload_len = payload.len();
    let total: usize = records.iter().map(|r| r.len() + SLOT_ENTRY_LEN).sum();
    if NODE_HDR_LEN + total > payload_len {
        return Err(VesperError::Invalid("rebuild records exceed page"));
    }
    payload[NODE_HDR_LEN..].fill(0);
    let mut off = NODE_HDR_LEN;
    let free_end = payload_len - records.len() * SLOT_ENTRY_LEN;
    for (idx, rec) in records.iter().enumerate() {
        payload[off..off + rec.len()].copy_from_slice(rec);
        let pos = free_end + idx * SLOT_ENTRY_LEN;
        write_u16(payload, pos, off as u16);
        write_u16(payload, pos + 2, rec.len() as u16);
        off += rec.len();
    }
    write_u16(payload, NSLOTS_OFFSET, records.len() as u16);
    write_u16(payload, FREE_START_OFFSET, off as u16);
    write_u16(payload, FREE_END_OFFSET, free_end as u16);
    Ok(())
}

/// Borrowed view of a decoded leaf record.
#[derive(Clone, Copy, Debug)]
pub struct LeafRecordRef<'a> {
    /// Key bytes.
    pub key: &'a [u8],
    /// Inline value bytes, or the raw overflow reference when `overflow`.
    pub value: &'a [u8],
    /// Whether `value` is an overflow reference.
    pub overflow: bool,
}

/// Reference to a value spilled into an overflow chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OverflowRef {
    /// Total value length in bytes.
    pub total_len: u64,
    /// First page of the chain.
    pub head: PageId,
}

impl OverflowRef {
    /// Encodes the reference into its 16-byte wire form.
    pub fn encode(&self) -> [u8; OVERFLOW_REF_LEN] {
        let mut buf = [0u8; OVERFLOW_REF_LEN];
        buf[..8].copy_from_slice(&self.total_len.to_be_bytes());
        buf[8..].copy_from_slice(&self.head.0.to_be_bytes());
        buf
    }

    /// Decodes a reference from leaf record value bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != OVERFLOW_REF_LEN {
            return Err(VesperError::Corruption("overflow reference length"));
        }
        let total_len = u64::from_be_bytes(buf[..8].try_into().unwrap());
        let head = PageId(u64::from_be_bytes(buf[8..].try_into().unwrap()));
        if head.0 == 0 {
            return Err(VesperError::Corruption("overflow head page zero"));
        }
        Ok(Self { total_len, head })
    }
}

/// Encodes a leaf record.
pub fn encode_leaf_record(key: &[u8], value: &[u8], overflow: bool, dst: &mut Vec<u8>) {
    dst.push(if overflow { LEAF_FLAG_OVERFLOW } else { 0 });
    var::encode_u64(key.len() as u64, dst);
    var::encode_u64(value.len() as u64, dst);
    dst.extend_from_slice(key);
    dst.extend_from_slice(value);
}

/// Decodes a leaf record.
pub fn decode_leaf_record(buf: &[u8]) -> Result<LeafRecordRef<'_>> {
    let mut cursor = ByteCursor::new(buf);
    let flags = cursor.take(1)?[0];
    if flags & !LEAF_FLAG_OVERFLOW != 0 {
        return Err(VesperError::Corruption("unknown leaf record flags"));
    }
    let key_len = cursor.read_var_u64("leaf key length truncated")? as usize;
    let val_len = cursor.read_var_u64("leaf value length truncated")? as usize;
    if key_len == 0 {
        return Err(VesperError::Corruption("leaf key length zero"));
    }
    let key = cursor.take(key_len)?;
    let value = cursor.take(val_len)?;
    let overflow = flags & LEAF_FLAG_OVERFLOW != 0;
    if overflow && value.len() != OVERFLOW_REF_LEN {
        return Err(VesperError::Corruption("overflow reference length"));
    }
    Ok(LeafRecordRef {
        key,
        value,
        overflow,
    })
}

/// Key of the leaf record at slot `idx`.
pub fn leaf_key<'a>(payload: &'a [u8], hdr: &NodeHdr, idx: usize) -> Result<&'a [u8]> {
    Ok(decode_leaf_record(record(payload, hdr, idx)?)?.key)
}

/// Borrowed view of a decoded branch record.
#[derive(Clone, Copy, Debug)]
pub struct BranchRecordRef<'a> {
    /// Smallest key reachable through `child`; empty for the leftmost entry
    /// of a root-split branch.
    pub separator: &'a [u8],
    /// Child page.
    pub child: PageId,
}

/// Encodes a branch record.
pub fn encode_branch_record(separator: &[u8], child: PageId, dst: &mut Vec<u8>) {
    let sep_len = u16::try_from(separator.len()).expect("separator longer than u16");
    dst.extend_from_slice(&child.0.to_be_bytes());
    dst.extend_from_slice(&sep_len.to_be_bytes());
    dst.extend_from_slice(separator);
}

/// Decodes a branch record.
pub fn decode_branch_record(buf: &[u8]) -> Result<BranchRecordRef<'_>> {
    if buf.len() < BRANCH_RECORD_HDR_LEN {
        return Err(VesperError::Corruption("branch record shorter than header"));
    }
    let child = PageId(u64::from_be_bytes(buf[..8].try_into().unwrap()));
    let sep_len = u16::from_be_bytes(buf[8..10].try_into().unwrap()) as usize;
    if buf.len() != BRANCH_RECORD_HDR_LEN + sep_len {
        return Err(VesperError::Corruption("branch record truncated"));
    }
    if child.0 == 0 {
        return Err(VesperError::Corruption("branch child page zero"));
    }
    Ok(BranchRecordRef {
        separator: &buf[BRANCH_RECORD_HDR_LEN..],
        child,
    })
}

/// Branch entry at slot `idx`.
pub fn branch_entry<'a>(payload: &'a [u8], hdr: &NodeHdr, idx: usize) -> Result<BranchRecordRef<'a>> {
    decode_branch_record(record(payload, hdr, idx)?)
}

/// Index of the child a lookup for `key` must descend into.
pub fn branch_route(payload: &[u8], hdr: &NodeHdr, key: &[u8]) -> Result<usize> {
    debug_assert!(hdr.nslots > 0, "branch must have entries");
    let mut lo = 0usize;
    let mut hi = hdr.nslots;
    // Greatest idx with separator <= key, clamped to the leftmost entry.
    while lo < hi {
        let mid = (lo + hi) / 2;
        let entry = branch_entry(payload, hdr, mid)?;
        if entry.separator <= key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo.saturating_sub(1))
}

/// Binary search for `key` among leaf slots.
pub fn leaf_search(payload: &[u8], hdr: &NodeHdr, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
    let mut lo = 0usize;
    let mut hi = hdr.nslots;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let mid_key = leaf_key(payload, hdr, mid)?;
        match mid_key.cmp(key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return Ok(Ok(mid)),
        }
    }
    Ok(Err(lo))
}
