// rust/lcnn-core/src/archive/reader.rs

//! Archive reader implementation.

use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use crate::error::{ReaderError, Result};
use crate::storage::StorageBackend;
use crate::tensor::{element_count, ParameterRecord};

use super::format::{ArchiveHeader, HEADER_LEN, MAX_NAME_BYTES};

/// A fully decoded archive.
#[derive(Debug, Clone, PartialEq)]
pub struct Archive {
    pub header: ArchiveHeader,
    /// Records in file order.
    pub records: Vec<ParameterRecord>,
}

impl Archive {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.name.as_str())
    }
}

/// Reads and validates archives.
///
/// The `ArchiveReader` handles:
/// - Validating the magic bytes and version before any record
/// - Bounds-checking every field against the bytes that remain
/// - Rejecting records whose declared sizes cannot be satisfied
pub struct ArchiveReader {
    storage: Arc<dyn StorageBackend>,
}

impl ArchiveReader {
    /// Creates a new archive reader.
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Reads and decodes the archive at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be opened or read
    /// - The magic bytes or version are wrong
    /// - A record is truncated or internally inconsistent
    pub fn read(&self, path: &Path) -> Result<Archive> {
        let mut reader = self.storage.open_read(path)?;
        let bytes = reader.contents()?;
        let archive = decode(&bytes)?;

        debug!(
            path = %path.display(),
            records = archive.records.len(),
            "archive read"
        );
        Ok(archive)
    }

    /// Reads only the fixed header.
    ///
    /// Useful for inspecting the record count without loading the data.
    pub fn read_header(&self, path: &Path) -> Result<ArchiveHeader> {
        let mut reader = self.storage.open_read(path)?;
        let len = reader.size().min(HEADER_LEN as u64) as usize;
        let bytes = reader.read_range(0, len)?;
        Ok(ArchiveHeader::decode(&bytes)?)
    }
}

/// Decodes an archive from memory.
///
/// Bytes after the last declared record are ignored.
pub fn decode(bytes: &[u8]) -> std::result::Result<Archive, ReaderError> {
    let header = ArchiveHeader::decode(bytes)?;
    let mut cursor = Cursor::new(bytes, HEADER_LEN);

    // Every record is at least 12 bytes, which bounds the allocation for a
    // corrupt count.
    let capacity = (header.count as usize).min(cursor.remaining() / 12);
    let mut records = Vec::with_capacity(capacity);

    for index in 0..header.count {
        records.push(decode_record(&mut cursor, index)?);
    }

    if cursor.remaining() > 0 {
        debug!(
            trailing = cursor.remaining(),
            "ignoring bytes after the last record"
        );
    }

    Ok(Archive { header, records })
}

fn decode_record(
    cursor: &mut Cursor<'_>,
    index: u32,
) -> std::result::Result<ParameterRecord, ReaderError> {
    let name_len = cursor.u32(|| format!("record {index} name length"))? as usize;
    if name_len > MAX_NAME_BYTES {
        return Err(ReaderError::Inconsistent {
            index,
            message: format!("name length {name_len} exceeds {MAX_NAME_BYTES} bytes"),
        });
    }
    let name_bytes = cursor.take(name_len, || format!("record {index} name"))?;
    let name = std::str::from_utf8(name_bytes)
        .map_err(|_| ReaderError::InvalidName { index })?
        .to_string();

    let ndim = cursor.u32(|| format!("record {index} ndim"))? as usize;
    let dims_len = ndim.checked_mul(4).ok_or_else(|| ReaderError::Inconsistent {
        index,
        message: format!("rank {ndim} is too large"),
    })?;
    let dims_bytes = cursor.take(dims_len, || format!("record {index} dims"))?;
    let mut shape = vec![0u32; ndim];
    LittleEndian::read_u32_into(dims_bytes, &mut shape);

    let data_len = element_count(shape.iter().map(|&d| d as usize))
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| ReaderError::Inconsistent {
            index,
            message: format!("shape {shape:?} overflows the addressable element count"),
        })?;
    let data_bytes = cursor.take(data_len, || format!("record {index} data"))?;
    let mut data = vec![0f32; data_len / 4];
    LittleEndian::read_f32_into(data_bytes, &mut data);

    Ok(ParameterRecord { name, shape, data })
}

/// Forward-only view over the archive bytes.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn take(
        &mut self,
        len: usize,
        field: impl FnOnce() -> String,
    ) -> std::result::Result<&'a [u8], ReaderError> {
        if len > self.remaining() {
            return Err(ReaderError::Truncated {
                field: field(),
                offset: self.pos,
                needed: len,
                available: self.remaining(),
            });
        }
        let out = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u32(&mut self, field: impl FnOnce() -> String) -> std::result::Result<u32, ReaderError> {
        self.take(4, field).map(LittleEndian::read_u32)
    }
}
