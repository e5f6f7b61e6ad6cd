// rust/lcnn-core/src/archive/store.rs

//! Name-indexed view of a decoded archive.

use std::collections::HashMap;

use crate::error::ReaderError;
use crate::tensor::ParameterRecord;

use super::reader::Archive;

/// Prefix `torch.compile` prepends to every parameter of a compiled module.
pub const COMPILED_MODULE_PREFIX: &str = "_orig_mod.";

/// Lookup table from parameter name to record.
///
/// Names are stored with [`COMPILED_MODULE_PREFIX`] removed so weights from
/// compiled and uncompiled models resolve the same way. When two records map
/// to the same key the later one wins.
#[derive(Debug, Clone, Default)]
pub struct WeightStore {
    weights: HashMap<String, ParameterRecord>,
    order: Vec<String>,
}

impl WeightStore {
    pub fn from_archive(archive: Archive) -> Self {
        let mut store = Self::default();
        for record in archive.records {
            store.insert(record);
        }
        store
    }

    fn insert(&mut self, mut record: ParameterRecord) {
        if let Some(stripped) = record.name.strip_prefix(COMPILED_MODULE_PREFIX) {
            record.name = stripped.to_string();
        }
        if !self.weights.contains_key(&record.name) {
            self.order.push(record.name.clone());
        }
        self.weights.insert(record.name.clone(), record);
    }

    /// Returns the record stored under `name`.
    pub fn get(&self, name: &str) -> Result<&ParameterRecord, ReaderError> {
        self.weights
            .get(name)
            .ok_or_else(|| ReaderError::MissingWeight {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.weights.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Records in archive order.
    pub fn iter(&self) -> impl Iterator<Item = &ParameterRecord> {
        self.order.iter().filter_map(|name| self.weights.get(name))
    }
}
