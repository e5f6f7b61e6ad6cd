// rust/lcnn-core/src/archive/mod.rs

//! LCNN archive format: a flat, self-describing file of named f32 tensors.
//!
//! This module provides functionality for:
//! - Writing archives from named tensors, atomically when configured
//! - Reading and validating archives
//! - Looking up decoded weights by name
//!
//! See [`format`] for the byte layout.
//!
//! # Example
//!
//! ```no_run
//! use lcnn_core::archive::{ArchiveReader, ArchiveWriter};
//! use lcnn_core::config::{StorageConfig, WriterConfig};
//! use lcnn_core::storage::LocalStorage;
//! use lcnn_core::tensor::{NamedTensor, Tensor};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let storage = Arc::new(LocalStorage::new(&StorageConfig::default()).unwrap());
//! let writer = ArchiveWriter::new(storage.clone(), WriterConfig::default());
//!
//! let bias = Tensor::from_f32(vec![4], vec![0.1, 0.2, 0.3, 0.4]);
//! let summary = writer
//!     .write(Path::new("model_weights.bin"), &[NamedTensor::new("fc.bias", &bias)])
//!     .unwrap();
//! assert_eq!(summary.stats.records, 1);
//!
//! let archive = ArchiveReader::new(storage).read(&summary.path).unwrap();
//! assert_eq!(archive.records[0].name, "fc.bias");
//! ```

pub mod format;
mod reader;
mod store;
mod writer;

pub use format::{ArchiveHeader, HEADER_LEN, MAX_NAME_BYTES};
pub use reader::{decode, Archive, ArchiveReader};
pub use store::{WeightStore, COMPILED_MODULE_PREFIX};
pub use writer::{ArchiveSummary, ArchiveWriter, EncodeStats};
