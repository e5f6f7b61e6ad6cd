// rust/lcnn-core/src/storage/local.rs

//! Local filesystem storage backend implementation.
//!
//! Small files are read through a buffered reader; files at or above the
//! configured threshold are memory-mapped so archives can be decoded in place.

use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use super::traits::{ObjectMeta, StorageBackend, StorageReader, StorageWriter};
use crate::config::StorageConfig;
use crate::error::{LcnnError, Result};

/// Local filesystem storage backend.
pub struct LocalStorage {
    /// Base path that relative paths resolve against.
    base_path: PathBuf,
    /// Buffer size for buffered I/O operations.
    buffer_size: usize,
    /// Whether to use memory-mapped I/O.
    use_mmap: bool,
    /// File size threshold above which to use mmap.
    mmap_threshold: u64,
}

impl LocalStorage {
    /// Creates a new `LocalStorage` instance from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the base path cannot be created.
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let base_path = config.base_path.clone();

        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                LcnnError::storage_with_source(&base_path, "failed to create base directory", e)
            })?;
        }

        Ok(Self {
            base_path,
            buffer_size: config.buffer_size,
            use_mmap: config.use_mmap,
            mmap_threshold: config.mmap_threshold,
        })
    }

    /// Resolves a path relative to the base path.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    fn ensure_parent(&self, full_path: &Path) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    LcnnError::storage_with_source(parent, "failed to create parent directories", e)
                })?;
            }
        }
        Ok(())
    }
}

impl StorageBackend for LocalStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.resolve_path(path).exists())
    }

    fn metadata(&self, path: &Path) -> Result<ObjectMeta> {
        let full_path = self.resolve_path(path);
        let meta = fs::metadata(&full_path).map_err(|e| {
            LcnnError::storage_with_source(&full_path, "failed to read metadata", e)
        })?;

        Ok(ObjectMeta {
            size: meta.len(),
        })
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>> {
        let full_path = self.resolve_path(path);
        let file = File::open(&full_path)
            .map_err(|e| LcnnError::storage_with_source(&full_path, "failed to open file", e))?;

        let size = file
            .metadata()
            .map_err(|e| {
                LcnnError::storage_with_source(&full_path, "failed to read file metadata", e)
            })?
            .len();

        if self.use_mmap && size > 0 && size >= self.mmap_threshold {
            // SAFETY: The file is opened read-only and we maintain the Mmap
            // for the lifetime of the reader.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
                LcnnError::storage_with_source(&full_path, "failed to memory-map file", e)
            })?;

            Ok(Box::new(MmapReader::new(mmap, full_path)))
        } else {
            Ok(Box::new(LocalReader::new(
                file,
                size,
                self.buffer_size,
                full_path,
            )))
        }
    }

    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        let full_path = self.resolve_path(path);
        self.ensure_parent(&full_path)?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full_path)
            .map_err(|e| LcnnError::storage_with_source(&full_path, "failed to create file", e))?;

        Ok(Box::new(LocalWriter::new(file, self.buffer_size, full_path)))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let full_path = self.resolve_path(path);

        fs::remove_file(&full_path)
            .map_err(|e| LcnnError::storage_with_source(&full_path, "failed to delete file", e))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_path = self.resolve_path(from);
        let to_path = self.resolve_path(to);
        self.ensure_parent(&to_path)?;

        fs::rename(&from_path, &to_path).map_err(|e| {
            LcnnError::storage_with_source(
                &from_path,
                format!("failed to rename to {}", to_path.display()),
                e,
            )
        })
    }
}

/// Buffered file reader for local storage.
struct LocalReader {
    reader: BufReader<File>,
    size: u64,
    path: PathBuf,
}

impl LocalReader {
    fn new(file: File, size: u64, buffer_size: usize, path: PathBuf) -> Self {
        Self {
            reader: BufReader::with_capacity(buffer_size, file),
            size,
            path,
        }
    }
}

impl Read for LocalReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for LocalReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageReader for LocalReader {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>> {
        self.seek(SeekFrom::Start(start)).map_err(|e| {
            LcnnError::storage_with_source(
                &self.path,
                format!("failed to seek to position {start}"),
                e,
            )
        })?;

        let mut buf = vec![0u8; length];
        self.read_exact(&mut buf).map_err(|e| {
            LcnnError::storage_with_source(
                &self.path,
                format!("failed to read {length} bytes at position {start}"),
                e,
            )
        })?;

        Ok(buf)
    }

    fn contents(&mut self) -> Result<Cow<'_, [u8]>> {
        self.seek(SeekFrom::Start(0)).map_err(|e| {
            LcnnError::storage_with_source(&self.path, "failed to rewind file", e)
        })?;

        let mut buf = Vec::with_capacity(self.size as usize);
        self.read_to_end(&mut buf).map_err(|e| {
            LcnnError::storage_with_source(&self.path, "failed to read file", e)
        })?;

        Ok(Cow::Owned(buf))
    }
}

/// Memory-mapped file reader for local storage.
struct MmapReader {
    mmap: Mmap,
    pos: u64,
    path: PathBuf,
}

impl MmapReader {
    fn new(mmap: Mmap, path: PathBuf) -> Self {
        Self { mmap, pos: 0, path }
    }
}

impl Read for MmapReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let pos = (self.pos as usize).min(self.mmap.len());
        let remaining = &self.mmap[pos..];
        let to_read = buf.len().min(remaining.len());

        buf[..to_read].copy_from_slice(&remaining[..to_read]);
        self.pos += to_read as u64;
        Ok(to_read)
    }
}

impl Seek for MmapReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.mmap.len() as i64 + offset,
            SeekFrom::Current(offset) => self.pos as i64 + offset,
        };

        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek to negative position",
            ));
        }

        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

impl StorageReader for MmapReader {
    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>> {
        let start = start as usize;
        let end = start.saturating_add(length);

        if end > self.mmap.len() {
            return Err(LcnnError::storage(
                &self.path,
                format!(
                    "read range {}..{} exceeds file size {}",
                    start,
                    end,
                    self.mmap.len()
                ),
            ));
        }

        Ok(self.mmap[start..end].to_vec())
    }

    fn contents(&mut self) -> Result<Cow<'_, [u8]>> {
        Ok(Cow::Borrowed(&self.mmap[..]))
    }
}

/// Buffered file writer for local storage.
struct LocalWriter {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl LocalWriter {
    fn new(file: File, buffer_size: usize, path: PathBuf) -> Self {
        Self {
            writer: BufWriter::with_capacity(buffer_size, file),
            path,
        }
    }
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl StorageWriter for LocalWriter {
    fn finish(mut self: Box<Self>) -> Result<()> {
        self.writer.flush().map_err(|e| {
            LcnnError::storage_with_source(&self.path, "failed to flush writer", e)
        })?;

        self.writer.get_ref().sync_all().map_err(|e| {
            LcnnError::storage_with_source(&self.path, "failed to sync file to disk", e)
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (LocalStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            base_path: temp_dir.path().to_path_buf(),
            buffer_size: 4096,
            use_mmap: true,
            mmap_threshold: 1024, // Low threshold for testing
        };
        let storage = LocalStorage::new(&config).unwrap();
        (storage, temp_dir)
    }

    fn write_file(storage: &LocalStorage, path: &str, data: &[u8]) {
        let mut writer = storage.open_write(Path::new(path)).unwrap();
        writer.write_all(data).unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn test_new_creates_base_dir() {
        let temp_dir = TempDir::new().unwrap();
        let new_base = temp_dir.path().join("new_subdir");

        let config = StorageConfig {
            base_path: new_base.clone(),
            ..Default::default()
        };

        let _storage = LocalStorage::new(&config).unwrap();
        assert!(new_base.exists());
    }

    #[test]
    fn test_exists_file() {
        let (storage, _temp) = create_test_storage();

        assert!(!storage.exists(Path::new("weights.bin")).unwrap());
        write_file(&storage, "weights.bin", b"LCNN");
        assert!(storage.exists(Path::new("weights.bin")).unwrap());
    }

    #[test]
    fn test_metadata_reports_size() {
        let (storage, _temp) = create_test_storage();

        let data = b"hello world";
        write_file(&storage, "test.bin", data);

        let meta = storage.metadata(Path::new("test.bin")).unwrap();
        assert_eq!(meta.size, data.len() as u64);
    }

    #[test]
    fn test_metadata_not_found() {
        let (storage, _temp) = create_test_storage();
        let result = storage.metadata(Path::new("nonexistent.bin"));
        assert!(matches!(result, Err(LcnnError::Storage { .. })));
    }

    #[test]
    fn test_contents_small_file_is_owned() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, "small.bin", b"hello world");

        let mut reader = storage.open_read(Path::new("small.bin")).unwrap();
        assert_eq!(reader.size(), 11);

        // Partially consumed readers still return the whole object.
        let mut first = [0u8; 5];
        reader.read_exact(&mut first).unwrap();

        let bytes = reader.contents().unwrap();
        assert!(matches!(bytes, Cow::Owned(_)));
        assert_eq!(&bytes[..], b"hello world");
    }

    #[test]
    fn test_contents_large_file_is_mapped() {
        let (storage, _temp) = create_test_storage();
        let data: Vec<u8> = (0..2048).map(|i| (i % 256) as u8).collect();
        write_file(&storage, "large.bin", &data);

        let mut reader = storage.open_read(Path::new("large.bin")).unwrap();
        let bytes = reader.contents().unwrap();
        assert!(matches!(bytes, Cow::Borrowed(_)));
        assert_eq!(&bytes[..], &data[..]);
    }

    #[test]
    fn test_read_range() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, "small.bin", b"hello world");

        let mut reader = storage.open_read(Path::new("small.bin")).unwrap();
        assert_eq!(reader.read_range(6, 5).unwrap(), b"world");
        assert!(reader.read_range(8, 10).is_err());
    }

    #[test]
    fn test_read_range_mapped_out_of_bounds() {
        let (storage, _temp) = create_test_storage();
        let data: Vec<u8> = (0..2048).map(|i| (i % 256) as u8).collect();
        write_file(&storage, "large.bin", &data);

        let mut reader = storage.open_read(Path::new("large.bin")).unwrap();
        assert_eq!(reader.read_range(100, 50).unwrap(), &data[100..150]);
        assert!(reader.read_range(2000, 100).is_err());
    }

    #[test]
    fn test_mapped_seek_and_read() {
        let (storage, _temp) = create_test_storage();
        let data: Vec<u8> = (0..2048).map(|i| (i % 256) as u8).collect();
        write_file(&storage, "large.bin", &data);

        let mut reader = storage.open_read(Path::new("large.bin")).unwrap();
        assert_eq!(reader.seek(SeekFrom::End(-3)).unwrap(), 2045);

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, &data[2045..]);
    }

    #[test]
    fn test_delete_file() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, "test.bin", b"hello");

        storage.delete(Path::new("test.bin")).unwrap();
        assert!(!storage.exists(Path::new("test.bin")).unwrap());
        assert!(storage.delete(Path::new("test.bin")).is_err());
    }

    #[test]
    fn test_rename_replaces_destination() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, "new.bin", b"stale");
        write_file(&storage, ".new.bin.tmp", b"fresh");

        storage
            .rename(Path::new(".new.bin.tmp"), Path::new("new.bin"))
            .unwrap();

        assert!(!storage.exists(Path::new(".new.bin.tmp")).unwrap());
        let mut reader = storage.open_read(Path::new("new.bin")).unwrap();
        assert_eq!(&reader.contents().unwrap()[..], b"fresh");
    }

    #[test]
    fn test_rename_not_found() {
        let (storage, _temp) = create_test_storage();
        let result = storage.rename(Path::new("nonexistent.bin"), Path::new("new.bin"));
        assert!(result.is_err());
    }

    #[test]
    fn test_write_creates_parent_dirs() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, "nested/path/weights.bin", b"hello");
        assert!(storage.exists(Path::new("nested/path/weights.bin")).unwrap());
    }

    #[test]
    fn test_overwrite_truncates() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, "file.bin", b"initial");
        write_file(&storage, "file.bin", b"new");

        let mut reader = storage.open_read(Path::new("file.bin")).unwrap();
        assert_eq!(&reader.contents().unwrap()[..], b"new");
    }

    #[test]
    fn test_absolute_path_bypasses_base() {
        let (storage, _temp) = create_test_storage();
        let other = TempDir::new().unwrap();
        let absolute = other.path().join("abs.bin");

        let mut writer = storage.open_write(&absolute).unwrap();
        writer.write_all(b"x").unwrap();
        writer.finish().unwrap();

        assert!(absolute.exists());
        assert_eq!(storage.resolve_path(&absolute), absolute);
    }

    #[test]
    fn test_mmap_disabled() {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            base_path: temp_dir.path().to_path_buf(),
            buffer_size: 4096,
            use_mmap: false,
            mmap_threshold: 1024,
        };
        let storage = LocalStorage::new(&config).unwrap();

        let data: Vec<u8> = (0..2048).map(|i| (i % 256) as u8).collect();
        write_file(&storage, "large.bin", &data);

        let mut reader = storage.open_read(Path::new("large.bin")).unwrap();
        let bytes = reader.contents().unwrap();
        assert!(matches!(bytes, Cow::Owned(_)));
        assert_eq!(&bytes[..], &data[..]);
    }

    #[test]
    fn test_object_safety() {
        let (storage, _temp) = create_test_storage();
        let backend: Box<dyn StorageBackend> = Box::new(storage);

        let mut writer = backend.open_write(Path::new("test.bin")).unwrap();
        writer.write_all(b"hello").unwrap();
        writer.finish().unwrap();

        assert!(backend.exists(Path::new("test.bin")).unwrap());

        let mut reader = backend.open_read(Path::new("test.bin")).unwrap();
        assert_eq!(&reader.contents().unwrap()[..], b"hello");
    }
}
