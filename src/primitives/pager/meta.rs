use std::convert::TryInto;
use std::io::ErrorKind;
use std::ops::Range;

use rand::{rngs::OsRng, RngCore};

use crate::primitives::io::FileIo;
use crate::types::{
    page::{self, PageHeader, PageKind, PAGE_HDR_LEN},
    PageId, Result, TxId, VesperError,
};

const META_LAST_CHECKPOINTED: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 8;
const META_NEXT_PAGE: Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 16;
const META_CATALOG_LEN: Range<usize> = PAGE_HDR_LEN + 16..PAGE_HDR_LEN + 20;
const META_RESERVED: Range<usize> = PAGE_HDR_LEN + 20..PAGE_HDR_LEN + 24;
const META_CATALOG_START: usize = PAGE_HDR_LEN + 24;

/// Environment metadata stored in page 0.
///
/// Describes the state as of the last checkpoint: everything newer lives in
/// the journal until the next flush rewrites this page.
#[derive(Clone, Debug, PartialEq)]
pub struct Meta {
    /// Size of each page in bytes.
    pub page_size: u32,
    /// Random salt mixed into every page CRC.
    pub salt: u64,
    /// Newest transaction whose pages are fully applied to the data file.
    pub last_checkpointed: TxId,
    /// First never-allocated page number as of the checkpoint.
    pub next_page: PageId,
    /// Serialized tree catalog as of the checkpoint (opaque to the pager).
    pub catalog: Vec<u8>,
}

/// Maximum catalog blob length that fits a meta page of `page_size` bytes.
pub fn meta_catalog_capacity(page_size: u32) -> usize {
    (page_size as usize).saturating_sub(META_CATALOG_START)
}

/// Creates a fresh metadata page and writes it to page 0, synced.
pub fn create_meta(io: &dyn FileIo, page_size: u32, catalog: &[u8]) -> Result<Meta> {
    if (page_size as usize) < META_CATALOG_START {
        return Err(VesperError::Invalid("page size smaller than meta layout"));
    }
    let mut rng = OsRng;
    let meta = Meta {
        page_size,
        salt: rng.next_u64(),
        last_checkpointed: TxId(0),
        next_page: PageId(1),
        catalog: catalog.to_vec(),
    };
    let mut buf = vec![0u8; page_size as usize];
    write_meta_page(&mut buf, &meta)?;
    io.write_at(0, &buf)?;
    io.sync_all()?;
    Ok(meta)
}

/// Loads and verifies the metadata page, discovering the page size from the
/// fixed header.
pub fn load_meta(io: &dyn FileIo) -> Result<Meta> {
    let mut hdr = [0u8; PAGE_HDR_LEN];
    match io.read_at(0, &mut hdr) {
        Ok(()) => {}
        Err(VesperError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
            return Err(VesperError::Corruption("meta page truncated"));
        }
        Err(err) => return Err(err),
    }
    let header = PageHeader::decode(&hdr)?;
    if header.kind != PageKind::Meta {
        return Err(VesperError::Corruption("meta page has wrong kind"));
    }
    let mut buf = vec![0u8; header.page_size as usize];
    match io.read_at(0, &mut buf) {
        Ok(()) => {}
        Err(VesperError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
            return Err(VesperError::Corruption("meta page truncated"));
        }
        Err(err) => return Err(err),
    }
    read_meta_page(&buf)
}

/// Encodes metadata into a page buffer and seals it with the page CRC.
pub fn write_meta_page(buf: &mut [u8], meta: &Meta) -> Result<()> {
    let page_size = meta.page_size as usize;
    if buf.len() < page_size {
        return Err(VesperError::Invalid("meta buffer too small"));
    }
    if meta.catalog.len() > meta_catalog_capacity(meta.page_size) {
        return Err(VesperError::Invalid("tree catalog exceeds meta page"));
    }
    buf[..page_size].fill(0);
    let header = PageHeader::new(PageId(0), PageKind::Meta, meta.page_size, meta.salt)?;
    header.encode(&mut buf[..PAGE_HDR_LEN])?;
    buf[META_LAST_CHECKPOINTED].copy_from_slice(&meta.last_checkpointed.0.to_be_bytes());
    buf[META_NEXT_PAGE].copy_from_slice(&meta.next_page.0.to_be_bytes());
    let catalog_len = u32::try_from(meta.catalog.len())
        .map_err(|_| VesperError::Invalid("tree catalog length exceeds u32"))?;
    buf[META_CATALOG_LEN].copy_from_slice(&catalog_len.to_be_bytes());
    buf[META_RESERVED].fill(0);
    buf[META_CATALOG_START..META_CATALOG_START + meta.catalog.len()]
        .copy_from_slice(&meta.catalog);
    page::seal_page(&mut buf[..page_size], PageId(0), meta.salt)?;
    Ok(())
}

/// Decodes metadata from a page buffer, verifying its CRC.
pub fn read_meta_page(buf: &[u8]) -> Result<Meta> {
    if buf.len() < META_CATALOG_START {
        return Err(VesperError::Corruption("meta page truncated"));
    }
    let header = PageHeader::decode(&buf[..PAGE_HDR_LEN])?;
    if header.kind != PageKind::Meta {
        return Err(VesperError::Corruption("meta page has wrong kind"));
    }
    let page_size = header.page_size as usize;
    if buf.len() < page_size {
        return Err(VesperError::Corruption("meta page truncated"));
    }
    page::verify_page(&buf[..page_size], PageId(0), header.salt)?;
    let last_checkpointed = TxId(u64::from_be_bytes(
        buf[META_LAST_CHECKPOINTED].try_into().unwrap(),
    ));
    let next_page = PageId(u64::from_be_bytes(buf[META_NEXT_PAGE].try_into().unwrap()));
    if buf[META_RESERVED].iter().any(|b| *b != 0) {
        return Err(VesperError::Corruption("meta reserved field non-zero"));
    }
    let catalog_len = u32::from_be_bytes(buf[META_CATALOG_LEN].try_into().unwrap()) as usize;
    let catalog_end = META_CATALOG_START
        .checked_add(catalog_len)
        .ok_or(VesperError::Corruption("meta catalog length overflow"))?;
    if catalog_end > page_size {
        return Err(VesperError::Corruption("meta catalog beyond page"));
    }
    let catalog = buf[META_CATALOG_START..catalog_end].to_vec();
    if next_page.0 == 0 {
        return Err(VesperError::Corruption("meta next_page is zero"));
    }
    Ok(Meta {
        page_size: header.page_size,
        salt: header.salt,
        last_checkpointed,
        next_page,
        catalog,
    })
}
