// rust/lcnn-core/src/storage/mod.rs

//! Storage abstraction for archive files.
//!
//! Archives are read and written through the
//! [`StorageBackend`] trait so the writer's atomic temp-then-rename protocol
//! and the reader's memory-mapped access live in one place.
//!
//! # Example
//!
//! ```no_run
//! use lcnn_core::config::StorageConfig;
//! use lcnn_core::storage::{LocalStorage, StorageBackend};
//! use std::io::Write;
//! use std::path::Path;
//!
//! let config = StorageConfig::default();
//! let storage = LocalStorage::new(&config).unwrap();
//!
//! let mut writer = storage.open_write(Path::new("weights/blob.bin")).unwrap();
//! writer.write_all(b"LCNN").unwrap();
//! writer.finish().unwrap();
//!
//! let mut reader = storage.open_read(Path::new("weights/blob.bin")).unwrap();
//! assert_eq!(&reader.contents().unwrap()[..], b"LCNN");
//! ```

mod local;
mod traits;

pub use local::LocalStorage;
pub use traits::{ObjectMeta, StorageBackend, StorageReader, StorageWriter};
