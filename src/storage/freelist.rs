//! On-disk free-list chain codec.
//!
//! Pages released by copy-on-write rewrites are persisted as a chain of
//! `FreeList` pages so space survives restarts. The chain head travels in the
//! catalog; each page holds `next u64 | count u32 | page numbers`.

use std::convert::TryInto;

use crate::types::{
    page::{PageHeader, PageKind, PAGE_HDR_LEN},
    PageId, Result, VesperError,
};

const CHAIN_HDR_LEN: usize = 12;

/// Free page numbers one chain page can hold.
pub fn entries_per_page(page_size: usize) -> usize {
    (page_size - PAGE_HDR_LEN - CHAIN_HDR_LEN) / 8
}

/// Builds one chain page image.
pub fn encode_chain_page(
    page_no: PageId,
    next: Option<PageId>,
    entries: &[u64],
    page_size: usize,
    salt: u64,
) -> Result<Vec<u8>> {
    if entries.len() > entries_per_page(page_size) {
        return Err(VesperError::Invalid("free-list entries exceed page"));
    }
    let mut buf = vec![0u8; page_size];
    let header = PageHeader::new(page_no, PageKind::FreeList, page_size as u32, salt)?;
    header.encode(&mut buf[..PAGE_HDR_LEN])?;
    buf[PAGE_HDR_LEN..PAGE_HDR_LEN + 8]
        .copy_from_slice(&next.map(|p| p.0).unwrap_or(0).to_be_bytes());
    buf[PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 12]
        .copy_from_slice(&(entries.len() as u32).to_be_bytes());
    let mut off = PAGE_HDR_LEN + CHAIN_HDR_LEN;
    for entry in entries {
        buf[off..off + 8].copy_from_slice(&entry.to_be_bytes());
        off += 8;
    }
    Ok(buf)
}

/// Decodes one chain page image.
pub fn decode_chain_page(image: &[u8]) -> Result<(Option<PageId>, Vec<u64>)> {
    let header = PageHeader::decode(image)?;
    if header.kind != PageKind::FreeList {
        return Err(VesperError::Corruption("free-list chain hit wrong page kind"));
    }
    let body = &image[PAGE_HDR_LEN..];
    if body.len() < CHAIN_HDR_LEN {
        return Err(VesperError::Corruption("free-list page truncated"));
    }
    let next_raw = u64::from_be_bytes(body[..8].try_into().unwrap());
    let count = u32::from_be_bytes(body[8..12].try_into().unwrap()) as usize;
    if CHAIN_HDR_LEN + count * 8 > body.len() {
        return Err(VesperError::Corruption("free-list count beyond page"));
    }
    let mut entries = Vec::with_capacity(count);
    for idx in 0..count {
        let off = CHAIN_HDR_LEN + idx * 8;
        entries.push(u64::from_be_bytes(body[off..off + 8].try_into().unwrap()));
    }
    Ok(((next_raw != 0).then_some(PageId(next_raw)), entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_page_roundtrip() -> Result<()> {
        let entries: Vec<u64> = (100..140).collect();
        let image = encode_chain_page(PageId(9), Some(PageId(10)), &entries, 512, 7)?;
        let (next, decoded) = decode_chain_page(&image)?;
        assert_eq!(next, Some(PageId(10)));
        assert_eq!(decoded, entries);
        Ok(())
    }

    #[test]
    fn tail_page_has_no_next() -> Result<()> {
        let image = encode_chain_page(PageId(9), None, &[42], 512, 7)?;
        let (next, decoded) = decode_chain_page(&image)?;
        assert_eq!(next, None);
        assert_eq!(decoded, vec![42]);
        Ok(())
    }

    #[test]
    fn overfull_page_is_rejected() {
        let entries: Vec<u64> = (0..200).collect();
        assert!(encode_chain_page(PageId(1), None, &entries, 512, 7).is_err());
    }
}
