// rust/lcnn-core/src/checkpoint/mod.rs

//! In-memory checkpoints and their resolution into named tensors.
//!
//! A checkpoint is an ordered tree of [`CheckpointValue`]s. The
//! [`CheckpointAdapter`] finds the state mapping inside it (either the whole
//! checkpoint or a training wrapper such as `{"model_state_dict": ...}`) and
//! yields its tensors in order. [`torch`] loads the tree from a `torch.save`
//! zip file.

mod adapter;
mod pickle;
pub mod torch;

pub use adapter::{CheckpointAdapter, WrapperProbe};
pub use torch::{load_checkpoint, TorchCheckpoint};

use crate::tensor::Tensor;

/// A node of a loaded checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointValue {
    /// Mapping with entries in insertion order.
    Map(Vec<(String, CheckpointValue)>),
    List(Vec<CheckpointValue>),
    Tensor(Tensor),
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
    /// An object the loader does not interpret, by qualified type name.
    Opaque(String),
}

impl CheckpointValue {
    /// Builds a mapping from `(key, value)` pairs.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, CheckpointValue)>) -> Self {
        CheckpointValue::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Short name of the node kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            CheckpointValue::Map(_) => "mapping",
            CheckpointValue::List(_) => "list",
            CheckpointValue::Tensor(_) => "tensor",
            CheckpointValue::Int(_) => "int",
            CheckpointValue::Float(_) => "float",
            CheckpointValue::Str(_) => "string",
            CheckpointValue::Bool(_) => "bool",
            CheckpointValue::None => "none",
            CheckpointValue::Opaque(_) => "object",
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            CheckpointValue::Tensor(t) => Some(t),
            _ => None,
        }
    }
}

/// Anything that can expose a keyed state mapping.
///
/// The adapter only relies on these capabilities, so wrappers are detected by
/// what a value can do rather than by its concrete type.
pub trait StateSource {
    /// Entries in iteration order, or `None` if this is not a mapping.
    fn entries(&self) -> Option<&[(String, CheckpointValue)]>;

    /// First value stored under `key`.
    fn lookup(&self, key: &str) -> Option<&CheckpointValue> {
        self.entries()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

impl StateSource for CheckpointValue {
    fn entries(&self) -> Option<&[(String, CheckpointValue)]> {
        match self {
            CheckpointValue::Map(entries) => Some(entries),
            _ => None,
        }
    }
}
