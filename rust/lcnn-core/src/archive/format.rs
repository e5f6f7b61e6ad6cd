// rust/lcnn-core/src/archive/format.rs

//! LCNN archive file format.
//!
//! ```text
//! +---------------------------+
//! | Magic "LCNN" (4 bytes)    |
//! +---------------------------+
//! | Version (u32)             |  <- currently 1
//! +---------------------------+
//! | Record count (u32)        |
//! +---------------------------+
//! | Record 0 .. count-1       |
//! +---------------------------+
//!
//! Record:
//! +---------------------------+
//! | Name length (u32)         |  <- at most 256
//! | Name (UTF-8)              |
//! | ndim (u32)                |
//! | dims (u32 x ndim)         |
//! | data (f32 x product(dims))|  <- row-major
//! +---------------------------+
//! ```
//!
//! All integers and floats are little-endian.

use crate::error::ReaderError;

/// Size of the fixed archive header in bytes.
pub const HEADER_LEN: usize = 12;

/// Longest encoded parameter name an archive may hold.
pub const MAX_NAME_BYTES: usize = 256;

/// Fixed header at the start of every archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveHeader {
    /// Magic bytes identifying this as an LCNN archive ("LCNN")
    pub magic: [u8; 4],
    /// Format version number
    pub version: u32,
    /// Number of records that follow
    pub count: u32,
}

impl ArchiveHeader {
    /// Magic bytes for archive files
    pub const MAGIC: [u8; 4] = *b"LCNN";

    /// Current format version
    pub const VERSION: u32 = 1;

    pub fn new(count: u32) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            count,
        }
    }

    pub fn validate_magic(&self) -> bool {
        self.magic == Self::MAGIC
    }

    pub fn validate_version(&self) -> bool {
        self.version == Self::VERSION
    }

    /// Serializes the header into its on-disk form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&self.magic);
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..].copy_from_slice(&self.count.to_le_bytes());
        out
    }

    /// Parses and validates a header.
    ///
    /// Magic is checked before the version so a foreign file is reported
    /// as `BadMagic` even when it is shorter than a full header.
    pub fn decode(bytes: &[u8]) -> Result<Self, ReaderError> {
        let truncated = |field: &str, offset: usize, needed: usize| ReaderError::Truncated {
            field: field.to_string(),
            offset,
            needed,
            available: bytes.len().saturating_sub(offset),
        };

        let magic: [u8; 4] = bytes
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| truncated("magic", 0, 4))?;
        if magic != Self::MAGIC {
            return Err(ReaderError::BadMagic {
                expected: Self::MAGIC,
                actual: magic,
            });
        }

        let version = bytes
            .get(4..8)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or_else(|| truncated("version", 4, 4))?;
        if version != Self::VERSION {
            return Err(ReaderError::UnsupportedVersion {
                found: version,
                supported: Self::VERSION,
            });
        }

        let count = bytes
            .get(8..12)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or_else(|| truncated("record count", 8, 4))?;

        Ok(Self {
            magic,
            version,
            count,
        })
    }
}

/// Returns the longest prefix of `name` that encodes to at most
/// [`MAX_NAME_BYTES`] bytes and ends on a character boundary.
pub fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_NAME_BYTES {
        return name;
    }
    let mut end = MAX_NAME_BYTES;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Encoded size of one record.
pub fn record_len(name_len: usize, ndim: usize, numel: usize) -> usize {
    4 + name_len + 4 + 4 * ndim + 4 * numel
}
