use std::convert::TryInto;
use std::ops::Range;

use time::OffsetDateTime;

use crate::primitives::io::FileIo;
use crate::types::{content_hash, Crc32Fast, Checksum, PageId, Result, TxId, VesperError};

/// Marker opening every transaction record; a mismatch ends recovery.
pub const TX_RECORD_MARKER: u64 = 0x5645_5350_5452_584E; // "VESPTRXN"

/// Length of the fixed transaction record header.
pub const TX_RECORD_HDR_LEN: usize = 80;

const HDR_MARKER: Range<usize> = 0..8;
const HDR_TX_ID: Range<usize> = 8..16;
const HDR_PAGE_COUNT: Range<usize> = 16..20;
const HDR_FLAGS: Range<usize> = 20..24;
const HDR_NEXT_PAGE: Range<usize> = 24..32;
const HDR_CATALOG_LEN: Range<usize> = 32..36;
const HDR_RESERVED: Range<usize> = 36..40;
const HDR_UNCOMPRESSED: Range<usize> = 40..48;
const HDR_STORED: Range<usize> = 48..56;
const HDR_CONTENT_HASH: Range<usize> = 56..64;
const HDR_TIMESTAMP: Range<usize> = 64..72;
const HDR_CRC32: Range<usize> = 72..76;
const HDR_PAD: Range<usize> = 76..80;

const FLAG_COMPRESSED: u32 = 0x1;

/// A fully decoded transaction record.
#[derive(Debug)]
pub struct TransactionRecord {
    /// Transaction id; strictly increasing across a journal.
    pub tx_id: TxId,
    /// First never-allocated page number after this transaction.
    pub next_page: PageId,
    /// Commit timestamp, unix seconds UTC.
    pub timestamp: i64,
    /// Serialized tree catalog as of this transaction.
    pub catalog: Vec<u8>,
    /// Dirty page images, ascending by page number.
    pub pages: Vec<(PageId, Vec<u8>)>,
}

fn header_crc(buf: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&buf[..HDR_CRC32.start]);
    hasher.finalize()
}

/// Serializes one committed transaction into its on-disk record.
///
/// The payload is the concatenation of `page_no | page bytes` tuples,
/// snappy-compressed when that actually saves space.
pub fn encode_record(
    tx_id: TxId,
    next_page: PageId,
    catalog: &[u8],
    pages: &[(PageId, &[u8])],
    page_size: usize,
    compress: bool,
) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(pages.len() * (8 + page_size));
    let mut prev: Option<PageId> = None;
    for (page, image) in pages {
        if image.len() != page_size {
            return Err(VesperError::Invalid("record page image size mismatch"));
        }
        if let Some(prev) = prev {
            if page.0 <= prev.0 {
                return Err(VesperError::Invalid("record pages must ascend"));
            }
        }
        prev = Some(*page);
        payload.extend_from_slice(&page.0.to_be_bytes());
        payload.extend_from_slice(image);
    }
    let uncompressed_len = payload.len() as u64;
    let mut flags = 0u32;
    let stored = if compress && !payload.is_empty() {
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&payload)
            .map_err(|_| VesperError::Invalid("journal payload compression failed"))?;
        if compressed.len() < payload.len() {
            flags |= FLAG_COMPRESSED;
            compressed
        } else {
            payload
        }
    } else {
        payload
    };
    let hash = content_hash(&[catalog, &stored]);
    let timestamp = OffsetDateTime::now_utc().unix_timestamp();

    let mut out = Vec::with_capacity(TX_RECORD_HDR_LEN + catalog.len() + stored.len());
    out.resize(TX_RECORD_HDR_LEN, 0);
    out[HDR_MARKER].copy_from_slice(&TX_RECORD_MARKER.to_be_bytes());
    out[HDR_TX_ID].copy_from_slice(&tx_id.0.to_be_bytes());
    let page_count = u32::try_from(pages.len())
        .map_err(|_| VesperError::Invalid("record page count exceeds u32"))?;
    out[HDR_PAGE_COUNT].copy_from_slice(&page_count.to_be_bytes());
    out[HDR_FLAGS].copy_from_slice(&flags.to_be_bytes());
    out[HDR_NEXT_PAGE].copy_from_slice(&next_page.0.to_be_bytes());
    let catalog_len = u32::try_from(catalog.len())
        .map_err(|_| VesperError::Invalid("record catalog length exceeds u32"))?;
    out[HDR_CATALOG_LEN].copy_from_slice(&catalog_len.to_be_bytes());
    out[HDR_RESERVED].fill(0);
    out[HDR_UNCOMPRESSED].copy_from_slice(&uncompressed_len.to_be_bytes());
    out[HDR_STORED].copy_from_slice(&(stored.len() as u64).to_be_bytes());
    out[HDR_CONTENT_HASH].copy_from_slice(&hash.to_be_bytes());
    out[HDR_TIMESTAMP].copy_from_slice(&timestamp.to_be_bytes());
    let crc = header_crc(&out[..TX_RECORD_HDR_LEN]);
    out[HDR_CRC32].copy_from_slice(&crc.to_be_bytes());
    out[HDR_PAD].fill(0);
    out.extend_from_slice(catalog);
    out.extend_from_slice(&stored);
    Ok(out)
}

/// Reads one record at `offset`, treating any malformed or truncated bytes as
/// the torn tail of an unclean shutdown.
///
/// Returns the decoded record and the offset of the next one, or `None` when
/// nothing valid starts at `offset` (including a clean end of file).
pub fn read_record(
    io: &dyn FileIo,
    offset: u64,
    file_len: u64,
    page_size: usize,
) -> Result<Option<(TransactionRecord, u64)>> {
    if offset + TX_RECORD_HDR_LEN as u64 > file_len {
        return Ok(None);
    }
    let mut hdr = [0u8; TX_RECORD_HDR_LEN];
    if read_fully(io, offset, &mut hdr)?.is_none() {
        return Ok(None);
    }
    if u64::from_be_bytes(hdr[HDR_MARKER].try_into().unwrap()) != TX_RECORD_MARKER {
        return Ok(None);
    }
    let stored_crc = u32::from_be_bytes(hdr[HDR_CRC32].try_into().unwrap());
    if header_crc(&hdr) != stored_crc {
        return Ok(None);
    }
    if hdr[HDR_RESERVED].iter().any(|b| *b != 0) || hdr[HDR_PAD].iter().any(|b| *b != 0) {
        return Ok(None);
    }
    let tx_id = TxId(u64::from_be_bytes(hdr[HDR_TX_ID].try_into().unwrap()));
    let page_count = u32::from_be_bytes(hdr[HDR_PAGE_COUNT].try_into().unwrap()) as usize;
    let flags = u32::from_be_bytes(hdr[HDR_FLAGS].try_into().unwrap());
    let next_page = PageId(u64::from_be_bytes(hdr[HDR_NEXT_PAGE].try_into().unwrap()));
    let catalog_len = u32::from_be_bytes(hdr[HDR_CATALOG_LEN].try_into().unwrap()) as u64;
    let uncompressed_len = u64::from_be_bytes(hdr[HDR_UNCOMPRESSED].try_into().unwrap());
    let stored_len = u64::from_be_bytes(hdr[HDR_STORED].try_into().unwrap());
    let hash = u64::from_be_bytes(hdr[HDR_CONTENT_HASH].try_into().unwrap());
    let timestamp = i64::from_be_bytes(hdr[HDR_TIMESTAMP].try_into().unwrap());

    let body_start = offset + TX_RECORD_HDR_LEN as u64;
    let body_len = catalog_len
        .checked_add(stored_len)
        .filter(|len| body_start.checked_add(*len).is_some())
        .filter(|len| body_start + len <= file_len);
    let Some(body_len) = body_len else {
        return Ok(None);
    };
    let mut body = vec![0u8; body_len as usize];
    if read_fully(io, body_start, &mut body)?.is_none() {
        return Ok(None);
    }
    let (catalog, stored) = body.split_at(catalog_len as usize);
    if content_hash(&[catalog, stored]) != hash {
        return Ok(None);
    }
    let payload = if flags & FLAG_COMPRESSED != 0 {
        let Ok(raw) = snap::raw::Decoder::new().decompress_vec(stored) else {
            return Ok(None);
        };
        raw
    } else {
        stored.to_vec()
    };
    if payload.len() as u64 != uncompressed_len {
        return Ok(None);
    }
    if payload.len() != page_count * (8 + page_size) {
        return Ok(None);
    }
    let mut pages = Vec::with_capacity(page_count);
    let mut prev: Option<u64> = None;
    for chunk in payload.chunks_exact(8 + page_size) {
        let page_no = u64::from_be_bytes(chunk[..8].try_into().unwrap());
        if prev.is_some_and(|prev| page_no <= prev) {
            return Ok(None);
        }
        prev = Some(page_no);
        pages.push((PageId(page_no), chunk[8..].to_vec()));
    }
    let record = TransactionRecord {
        tx_id,
        next_page,
        timestamp,
        catalog: catalog.to_vec(),
        pages,
    };
    Ok(Some((record, body_start + body_len)))
}

// Reads, mapping a short file to `None` instead of an error.
fn read_fully(io: &dyn FileIo, offset: u64, dst: &mut [u8]) -> Result<Option<()>> {
    match io.read_at(offset, dst) {
        Ok(()) => Ok(Some(())),
        Err(VesperError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::StdFileIo;
    use tempfile::tempdir;

    const PAGE_SIZE: usize = 256;

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; PAGE_SIZE]
    }

    #[test]
    fn encode_decode_roundtrip() -> Result<()> {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("j"))?;
        let a = page(1);
        let b = page(2);
        let record = encode_record(
            TxId(7),
            PageId(10),
            b"cat",
            &[(PageId(3), a.as_slice()), (PageId(5), b.as_slice())],
            PAGE_SIZE,
            true,
        )?;
        io.write_at(0, &record)?;
        let (decoded, next) = read_record(&io, 0, record.len() as u64, PAGE_SIZE)?
            .expect("record decodes");
        assert_eq!(next, record.len() as u64);
        assert_eq!(decoded.tx_id, TxId(7));
        assert_eq!(decoded.next_page, PageId(10));
        assert_eq!(decoded.catalog, b"cat");
        assert_eq!(decoded.pages.len(), 2);
        assert_eq!(decoded.pages[0].0, PageId(3));
        assert_eq!(decoded.pages[0].1, a);
        assert_eq!(decoded.pages[1].0, PageId(5));
        assert_eq!(decoded.pages[1].1, b);
        Ok(())
    }

    #[test]
    fn compression_shrinks_repetitive_payload() -> Result<()> {
        let image = page(0xAA);
        let compressed = encode_record(
            TxId(1),
            PageId(2),
            b"",
            &[(PageId(1), image.as_slice())],
            PAGE_SIZE,
            true,
        )?;
        let raw = encode_record(
            TxId(1),
            PageId(2),
            b"",
            &[(PageId(1), image.as_slice())],
            PAGE_SIZE,
            false,
        )?;
        assert!(compressed.len() < raw.len());
        Ok(())
    }

    #[test]
    fn truncated_tail_reads_as_none() -> Result<()> {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("j"))?;
        let image = page(9);
        let record = encode_record(
            TxId(1),
            PageId(2),
            b"catalog",
            &[(PageId(1), image.as_slice())],
            PAGE_SIZE,
            false,
        )?;
        // Drop the final byte to simulate a torn write.
        io.write_at(0, &record[..record.len() - 1])?;
        let result = read_record(&io, 0, record.len() as u64 - 1, PAGE_SIZE)?;
        assert!(result.is_none());
        Ok(())
    }

    #[test]
    fn bad_marker_reads_as_none() -> Result<()> {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("j"))?;
        let image = page(4);
        let mut record = encode_record(
            TxId(1),
            PageId(2),
            b"",
            &[(PageId(1), image.as_slice())],
            PAGE_SIZE,
            false,
        )?;
        record[0] ^= 0xFF;
        io.write_at(0, &record)?;
        assert!(read_record(&io, 0, record.len() as u64, PAGE_SIZE)?.is_none());
        Ok(())
    }

    #[test]
    fn payload_corruption_fails_the_content_hash() -> Result<()> {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("j"))?;
        let image = page(4);
        let mut record = encode_record(
            TxId(1),
            PageId(2),
            b"",
            &[(PageId(1), image.as_slice())],
            PAGE_SIZE,
            false,
        )?;
        let flip = TX_RECORD_HDR_LEN + 20;
        record[flip] ^= 0xFF;
        io.write_at(0, &record)?;
        assert!(read_record(&io, 0, record.len() as u64, PAGE_SIZE)?.is_none());
        Ok(())
    }

    #[test]
    fn empty_transaction_record_roundtrips() -> Result<()> {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("j"))?;
        let record = encode_record(TxId(3), PageId(9), b"only-catalog", &[], PAGE_SIZE, true)?;
        io.write_at(0, &record)?;
        let (decoded, _) = read_record(&io, 0, record.len() as u64, PAGE_SIZE)?
            .expect("record decodes");
        assert_eq!(decoded.tx_id, TxId(3));
        assert!(decoded.pages.is_empty());
        assert_eq!(decoded.catalog, b"only-catalog");
        Ok(())
    }
}
