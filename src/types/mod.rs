//! Shared identifiers, error types, and on-disk page metadata.

#![forbid(unsafe_code)]

use std::fmt;

mod checksum;

pub use checksum::{content_hash, page_crc32, Checksum, Crc32Fast};

/// Logical page number inside the data file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

/// Identifier assigned to every committed write transaction, in commit order.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TxId(pub u64);

/// Sequence number of a journal file; files replay in ascending order.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct JournalSeq(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for JournalSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Crate-wide error type.
#[derive(thiserror::Error, Debug)]
pub enum VesperError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk state failed a structural or checksum validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the engine cannot honor.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Invalid argument with a dynamically built message.
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// Requested key or tree does not exist.
    #[error("not found")]
    NotFound,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VesperError>;

pub mod page {
    //! Shared on-disk page metadata used by the pager, journal, and trees.

    use core::convert::{TryFrom, TryInto};

    use super::{PageId, Result, VesperError};

    /// Magic bytes opening every page header.
    pub const PAGE_MAGIC: [u8; 4] = *b"VESP";
    /// On-disk page format version.
    pub const PAGE_FORMAT_VERSION: u16 = 1;
    /// Default page size in bytes.
    pub const DEFAULT_PAGE_SIZE: u32 = 8192;
    /// Length of the fixed page header in bytes.
    pub const PAGE_HDR_LEN: usize = 32;

    pub mod header {
        //! Byte offsets for fixed header fields.
        use core::ops::Range;

        /// Magic bytes.
        pub const MAGIC: Range<usize> = 0..4;
        /// Format version.
        pub const FORMAT_VERSION: Range<usize> = 4..6;
        /// Page kind tag.
        pub const PAGE_KIND: usize = 6;
        /// Reserved, must be zero.
        pub const RESERVED: usize = 7;
        /// Page size in bytes.
        pub const PAGE_SIZE: Range<usize> = 8..12;
        /// Page number.
        pub const PAGE_NO: Range<usize> = 12..20;
        /// Environment salt.
        pub const SALT: Range<usize> = 20..28;
        /// CRC32 over the page with this field zeroed.
        pub const CRC32: Range<usize> = 28..32;
    }

    /// Logical kind tag carried by every page.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum PageKind {
        /// Environment metadata, always page 0.
        Meta = 1,
        /// Chained free-list page.
        FreeList = 2,
        /// B+tree leaf page.
        TreeLeaf = 3,
        /// B+tree branch page.
        TreeBranch = 4,
        /// Overflow page holding part of a large value.
        Overflow = 5,
    }

    impl PageKind {
        /// Returns the raw tag byte.
        pub const fn as_u8(self) -> u8 {
            self as u8
        }
    }

    impl TryFrom<u8> for PageKind {
        type Error = VesperError;

        fn try_from(value: u8) -> Result<Self> {
            match value {
                1 => Ok(PageKind::Meta),
                2 => Ok(PageKind::FreeList),
                3 => Ok(PageKind::TreeLeaf),
                4 => Ok(PageKind::TreeBranch),
                5 => Ok(PageKind::Overflow),
                _ => Err(VesperError::Corruption("unknown page kind")),
            }
        }
    }

    /// Fixed header prepended to every page image.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct PageHeader {
        /// Format version of the page layout.
        pub format_version: u16,
        /// Page kind tag.
        pub kind: PageKind,
        /// Page size the environment was created with.
        pub page_size: u32,
        /// Page number this image belongs to.
        pub page_no: PageId,
        /// Environment salt mixed into the page CRC.
        pub salt: u64,
        /// CRC32 over the page with the CRC field zeroed.
        pub crc32: u32,
    }

    impl PageHeader {
        /// Builds a header for a freshly initialized page.
        pub fn new(page_no: PageId, kind: PageKind, page_size: u32, salt: u64) -> Result<Self> {
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(VesperError::Invalid("page size smaller than header"));
            }
            Ok(Self {
                format_version: PAGE_FORMAT_VERSION,
                kind,
                page_size,
                page_no,
                salt,
                crc32: 0,
            })
        }

        /// Returns the header with the CRC field set.
        pub fn with_crc32(mut self, crc32: u32) -> Self {
            self.crc32 = crc32;
            self
        }

        /// Encodes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < PAGE_HDR_LEN {
                return Err(VesperError::Invalid("page header buffer too small"));
            }
            let hdr = &mut dst[..PAGE_HDR_LEN];
            hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
            hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
            hdr[header::PAGE_KIND] = self.kind.as_u8();
            hdr[header::RESERVED] = 0;
            hdr[header::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
            hdr[header::PAGE_NO].copy_from_slice(&self.page_no.0.to_be_bytes());
            hdr[header::SALT].copy_from_slice(&self.salt.to_be_bytes());
            hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
            Ok(())
        }

        /// Decodes and validates a header from the start of `src`.
        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < PAGE_HDR_LEN {
                return Err(VesperError::Corruption("page header truncated"));
            }
            let hdr = &src[..PAGE_HDR_LEN];
            let magic: [u8; 4] = hdr[header::MAGIC].try_into().unwrap();
            if magic != PAGE_MAGIC {
                return Err(VesperError::Corruption("invalid page magic"));
            }
            let format_version =
                u16::from_be_bytes(hdr[header::FORMAT_VERSION].try_into().unwrap());
            if format_version != PAGE_FORMAT_VERSION {
                return Err(VesperError::Corruption("unsupported page format version"));
            }
            if hdr[header::RESERVED] != 0 {
                return Err(VesperError::Corruption("page header reserved byte not zero"));
            }
            let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
            let page_size = u32::from_be_bytes(hdr[header::PAGE_SIZE].try_into().unwrap());
            if (page_size as usize) < PAGE_HDR_LEN {
                return Err(VesperError::Corruption("page size smaller than header"));
            }
            let page_no = PageId(u64::from_be_bytes(hdr[header::PAGE_NO].try_into().unwrap()));
            let salt = u64::from_be_bytes(hdr[header::SALT].try_into().unwrap());
            let crc32 = u32::from_be_bytes(hdr[header::CRC32].try_into().unwrap());
            Ok(Self {
                format_version,
                kind,
                page_size,
                page_no,
                salt,
                crc32,
            })
        }
    }

    /// Zeroes the CRC field so a checksum can be recomputed.
    pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
        if buf.len() < header::CRC32.end {
            return Err(VesperError::Invalid("page header buffer too small"));
        }
        buf[header::CRC32].fill(0);
        Ok(())
    }

    /// Computes the CRC for a full page image with the CRC field zeroed.
    pub fn compute_page_crc32(buf: &[u8], page_no: PageId, salt: u64) -> Result<u32> {
        if buf.len() < PAGE_HDR_LEN {
            return Err(VesperError::Invalid("page buffer shorter than header"));
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&page_no.0.to_be_bytes());
        hasher.update(&salt.to_be_bytes());
        hasher.update(&buf[..header::CRC32.start]);
        hasher.update(&[0u8; 4]);
        hasher.update(&buf[header::CRC32.end..]);
        Ok(hasher.finalize())
    }

    /// Stamps the CRC field of a finished page image.
    pub fn seal_page(buf: &mut [u8], page_no: PageId, salt: u64) -> Result<()> {
        let crc = compute_page_crc32(buf, page_no, salt)?;
        buf[header::CRC32].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }

    /// Verifies the header and CRC of a page image read from durable storage.
    pub fn verify_page(buf: &[u8], expected: PageId, salt: u64) -> Result<PageHeader> {
        let header = PageHeader::decode(buf)?;
        if header.page_no != expected {
            return Err(VesperError::Corruption("page number mismatch"));
        }
        let crc = compute_page_crc32(buf, expected, salt)?;
        if crc != header.crc32 {
            return Err(VesperError::Corruption("page crc mismatch"));
        }
        Ok(header)
    }
}
