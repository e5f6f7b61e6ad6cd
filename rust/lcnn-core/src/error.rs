// rust/lcnn-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

use crate::tensor::DType;

/// Failure to resolve a checkpoint into name/tensor pairs.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("checkpoint is empty or unreadable: {reason}")]
    EmptyOrUnreadable { reason: String },
}

impl AdapterError {
    pub fn unreadable(reason: impl Into<String>) -> Self {
        Self::EmptyOrUnreadable {
            reason: reason.into(),
        }
    }
}

/// Failure while emitting an archive.
#[derive(Error, Debug)]
pub enum WriterError {
    #[error("I/O error while writing archive: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("parameter '{name}' has element type {dtype} which cannot be stored as f32")]
    UnsupportedDType { name: String, dtype: DType },

    #[error("parameter '{name}' holds {actual} elements but its shape {shape:?} requires {expected}")]
    ShapeMismatch {
        name: String,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("{what} of {value} does not fit in a u32 field")]
    DimensionOverflow { what: String, value: usize },
}

impl WriterError {
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source: Some(source),
        }
    }
}

/// Failure while parsing an archive.
#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("bad magic bytes: expected {expected:?}, got {actual:?}")]
    BadMagic { expected: [u8; 4], actual: [u8; 4] },

    #[error("unsupported archive version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("archive truncated while reading {field}: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        field: String,
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("record {index} is inconsistent: {message}")]
    Inconsistent { index: u32, message: String },

    #[error("record {index} has a name that is not valid UTF-8")]
    InvalidName { index: u32 },

    #[error("weight not found: {name}")]
    MissingWeight { name: String },
}

/// Failure while loading a checkpoint file from disk.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("invalid zip container")]
    Zip(#[from] zip::result::ZipError),

    #[error("pickle error: {0}")]
    Pickle(String),

    #[error("unsupported torch storage type: {0}")]
    UnsupportedStorage(String),

    #[error("tensor '{name}' reads past its storage (storage holds {storage_elems} elements, need index {max_index})")]
    OutOfBounds {
        name: String,
        storage_elems: usize,
        max_index: usize,
    },
}

impl LoadError {
    pub fn pickle(message: impl Into<String>) -> Self {
        Self::Pickle(message.into())
    }
}

#[derive(Error, Debug)]
pub enum LcnnError {
    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Writer(#[from] WriterError),

    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error("failed to load checkpoint '{path}'")]
    Load {
        path: PathBuf,
        #[source]
        source: LoadError,
    },
}

pub type Result<T> = std::result::Result<T, LcnnError>;

// Convenience constructors
impl LcnnError {
    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn load(path: impl Into<PathBuf>, source: LoadError) -> Self {
        Self::Load {
            path: path.into(),
            source,
        }
    }
}
