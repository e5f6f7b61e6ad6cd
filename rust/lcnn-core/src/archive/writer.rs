// rust/lcnn-core/src/archive/writer.rs

//! Archive writer implementation.

use std::hash::Hasher;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use tracing::{debug, info, warn};
use twox_hash::XxHash64;

use crate::config::{DoublePrecision, WriterConfig};
use crate::error::{LcnnError, Result, WriterError};
use crate::storage::StorageBackend;
use crate::tensor::{DType, NamedTensor};

use super::format::{record_len, truncate_name, ArchiveHeader};

/// Floats converted to bytes per write call.
const FLOAT_CHUNK: usize = 16 * 1024;

/// Outcome of streaming an archive into a sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodeStats {
    /// Number of records emitted.
    pub records: u32,
    /// Records whose name was cut to fit the 256-byte limit.
    pub truncated_names: usize,
    /// Records narrowed from f64.
    pub narrowed_tensors: usize,
    /// Bytes handed to the sink.
    pub bytes_written: u64,
    /// XXH64 (seed 0) of the emitted bytes.
    pub checksum: u64,
}

/// Result of writing an archive file.
#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    /// Size reported by the filesystem after the write completed.
    pub file_size: u64,
    pub stats: EncodeStats,
}

/// Writes LCNN archives.
///
/// The `ArchiveWriter` handles:
/// - Validating every tensor before the first byte is emitted
/// - Converting element buffers to little-endian f32
/// - Truncating over-long names on a character boundary
/// - Atomic writes (write to temp file then rename)
pub struct ArchiveWriter {
    storage: Arc<dyn StorageBackend>,
    config: WriterConfig,
}

/// Shape and name of one record, checked and ready to emit.
struct RecordPlan<'t> {
    name: &'t str,
    dims: Vec<u32>,
    numel: usize,
    narrowed: bool,
}

impl ArchiveWriter {
    /// Creates a new archive writer.
    pub fn new(storage: Arc<dyn StorageBackend>, config: WriterConfig) -> Self {
        Self { storage, config }
    }

    /// Writes an archive to `path` and returns a summary of the result.
    ///
    /// With atomic writes enabled the archive is staged in a hidden sibling
    /// file and renamed over `path` only after it has been flushed and
    /// synced; on failure the staging file is removed and `path` is left as
    /// it was. Without atomic writes a failure can leave a partial file at
    /// `path` that callers must not trust.
    ///
    /// # Errors
    ///
    /// Every failure is reported as [`LcnnError::Writer`].
    pub fn write(&self, path: &Path, tensors: &[NamedTensor<'_>]) -> Result<ArchiveSummary> {
        let staging = if self.config.atomic_writes {
            staging_path(path)
        } else {
            path.to_path_buf()
        };

        let mut sink = self
            .storage
            .open_write(&staging)
            .map_err(WriterError::from_storage)?;

        let stats = match self.encode(&mut sink, tensors) {
            Ok(stats) => stats,
            Err(err) => {
                drop(sink);
                self.discard(&staging);
                return Err(err.into());
            }
        };

        if let Err(err) = sink.finish() {
            self.discard(&staging);
            return Err(WriterError::from_storage(err).into());
        }

        if self.config.atomic_writes {
            if let Err(err) = self.storage.rename(&staging, path) {
                self.discard(&staging);
                return Err(WriterError::from_storage(err).into());
            }
        }

        let file_size = self
            .storage
            .metadata(path)
            .map_err(WriterError::from_storage)?
            .size;

        info!(
            path = %path.display(),
            records = stats.records,
            file_size,
            "archive written"
        );

        Ok(ArchiveSummary {
            path: path.to_path_buf(),
            file_size,
            stats,
        })
    }

    /// Streams an archive into `sink`.
    ///
    /// All tensors are validated before anything is written, so element type
    /// and shape errors never produce output. The sink is flushed but not
    /// closed.
    pub fn encode<W: Write>(
        &self,
        sink: W,
        tensors: &[NamedTensor<'_>],
    ) -> std::result::Result<EncodeStats, WriterError> {
        let count = u32::try_from(tensors.len()).map_err(|_| WriterError::DimensionOverflow {
            what: "record count".to_string(),
            value: tensors.len(),
        })?;

        let plans = tensors
            .iter()
            .map(|named| self.plan(named))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut out = HashingWriter::new(sink);
        out.write_all(&ArchiveHeader::new(count).encode())
            .map_err(|e| WriterError::io("failed to write archive header", e))?;

        let mut stats = EncodeStats {
            records: count,
            ..Default::default()
        };

        let mut scratch = Vec::new();
        for (named, plan) in tensors.iter().zip(&plans) {
            if plan.name.len() < named.name.len() {
                warn!(
                    original = %named.name,
                    stored = %plan.name,
                    "parameter name exceeds 256 bytes, truncated"
                );
                stats.truncated_names += 1;
            }
            if plan.narrowed {
                stats.narrowed_tensors += 1;
            }

            debug!(
                name = %plan.name,
                shape = ?plan.dims,
                dtype = %named.tensor.dtype(),
                bytes = record_len(plan.name.len(), plan.dims.len(), plan.numel),
                "writing record"
            );

            self.write_record(&mut out, named, plan, &mut scratch)
                .map_err(|e| WriterError::io(format!("failed to write record '{}'", plan.name), e))?;
        }

        out.flush()
            .map_err(|e| WriterError::io("failed to flush archive", e))?;

        if stats.narrowed_tensors > 0 {
            warn!(
                tensors = stats.narrowed_tensors,
                "double-precision parameters narrowed to f32"
            );
        }

        stats.bytes_written = out.bytes;
        stats.checksum = out.hasher.finish();
        Ok(stats)
    }

    /// Checks one tensor against the format's constraints.
    fn plan<'t>(&self, named: &'t NamedTensor<'_>) -> std::result::Result<RecordPlan<'t>, WriterError> {
        let tensor = named.tensor;
        let dtype = tensor.dtype();

        let narrowed = match dtype {
            DType::Bool => {
                return Err(WriterError::UnsupportedDType {
                    name: named.name.clone(),
                    dtype,
                })
            }
            DType::F64 if self.config.double_precision == DoublePrecision::Reject => {
                return Err(WriterError::UnsupportedDType {
                    name: named.name.clone(),
                    dtype,
                })
            }
            DType::F64 => true,
            _ => false,
        };

        let numel = tensor.numel().ok_or_else(|| WriterError::DimensionOverflow {
            what: format!("element count of '{}'", named.name),
            value: usize::MAX,
        })?;
        if numel != tensor.data().len() {
            return Err(WriterError::ShapeMismatch {
                name: named.name.clone(),
                shape: tensor.shape().to_vec(),
                expected: numel,
                actual: tensor.data().len(),
            });
        }

        let dims = tensor
            .shape()
            .iter()
            .map(|&d| {
                u32::try_from(d).map_err(|_| WriterError::DimensionOverflow {
                    what: format!("dimension of '{}'", named.name),
                    value: d,
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if u32::try_from(dims.len()).is_err() {
            return Err(WriterError::DimensionOverflow {
                what: format!("rank of '{}'", named.name),
                value: dims.len(),
            });
        }

        let name = truncate_name(&named.name);
        u32::try_from(name.len()).map_err(|_| WriterError::DimensionOverflow {
            what: "name length".to_string(),
            value: name.len(),
        })?;

        Ok(RecordPlan {
            name,
            dims,
            numel,
            narrowed,
        })
    }

    fn write_record<W: Write>(
        &self,
        out: &mut W,
        named: &NamedTensor<'_>,
        plan: &RecordPlan<'_>,
        scratch: &mut Vec<u8>,
    ) -> std::io::Result<()> {
        out.write_u32::<LittleEndian>(plan.name.len() as u32)?;
        out.write_all(plan.name.as_bytes())?;

        out.write_u32::<LittleEndian>(plan.dims.len() as u32)?;
        for &dim in &plan.dims {
            out.write_u32::<LittleEndian>(dim)?;
        }

        // Element types were checked in `plan`, so conversion cannot fail here.
        let values = named.tensor.data().to_f32().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "tensor has no f32 form")
        })?;
        debug_assert_eq!(values.len(), plan.numel);

        for chunk in values.chunks(FLOAT_CHUNK) {
            scratch.resize(chunk.len() * 4, 0);
            LittleEndian::write_f32_into(chunk, scratch);
            out.write_all(scratch)?;
        }

        Ok(())
    }

    /// Removes a staging file left behind by a failed atomic write.
    fn discard(&self, staging: &Path) {
        if !self.config.atomic_writes {
            return;
        }
        if let Err(err) = self.storage.delete(staging) {
            warn!(path = %staging.display(), error = %err, "failed to remove staging file");
        }
    }
}

impl WriterError {
    /// Wraps a storage failure as a writer I/O failure.
    pub fn from_storage(err: LcnnError) -> Self {
        match err {
            LcnnError::Storage {
                path,
                message,
                source,
            } => WriterError::Io {
                message: format!("{message} ({})", path.display()),
                source,
            },
            LcnnError::Writer(inner) => inner,
            other => WriterError::Io {
                message: other.to_string(),
                source: None,
            },
        }
    }
}

/// Hidden sibling used to stage atomic writes: `dir/.name.tmp`.
fn staging_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    path.with_file_name(format!(".{file_name}.tmp"))
}

/// Counts and hashes every byte passed to the inner writer.
struct HashingWriter<W> {
    inner: W,
    hasher: XxHash64,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: XxHash64::with_seed(0),
            bytes: 0,
        }
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.write(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
