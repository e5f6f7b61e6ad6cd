// rust/lcnn-core/src/lib.rs

//! LCNN tensor archive toolkit - Core Library
//!
//! This crate converts trained model checkpoints into LCNN archives, a flat
//! binary file of named f32 tensors that a C++ inference engine can load
//! without a Python runtime. It provides checkpoint loading and adaptation,
//! the archive writer and reader, storage abstractions, configuration and
//! error handling.

pub mod archive;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod storage;
pub mod tensor;

// Re-export commonly used types for convenience
pub use archive::{Archive, ArchiveReader, ArchiveSummary, ArchiveWriter, WeightStore};
pub use checkpoint::{load_checkpoint, CheckpointAdapter, CheckpointValue, StateSource};
pub use config::ExportConfig;
pub use error::{AdapterError, LcnnError, LoadError, ReaderError, Result, WriterError};
pub use storage::{LocalStorage, ObjectMeta, StorageBackend, StorageReader, StorageWriter};
pub use tensor::{DType, NamedTensor, ParameterRecord, Tensor, TensorData};
