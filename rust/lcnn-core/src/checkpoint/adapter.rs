// rust/lcnn-core/src/checkpoint/adapter.rs

//! Resolution of a checkpoint into ordered `(name, tensor)` pairs.

use tracing::debug;

use crate::config::AdapterConfig;
use crate::error::AdapterError;
use crate::tensor::NamedTensor;

use super::{CheckpointValue, StateSource};

/// Recognizes one training wrapper by the key that holds the state mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperProbe {
    key: String,
}

impl WrapperProbe {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the wrapped mapping when `source` has the key and the value
    /// under it is itself a mapping.
    pub fn probe<'a, S>(&self, source: &'a S) -> Option<&'a [(String, CheckpointValue)]>
    where
        S: StateSource + ?Sized,
    {
        source.lookup(&self.key)?.entries()
    }
}

/// Turns a checkpoint into the tensors to export.
///
/// Probes are tried in order and the first match wins. If none match the
/// checkpoint itself is treated as the state mapping.
#[derive(Debug, Clone)]
pub struct CheckpointAdapter {
    probes: Vec<WrapperProbe>,
    strip_prefixes: Vec<String>,
}

impl Default for CheckpointAdapter {
    fn default() -> Self {
        Self::from_config(&AdapterConfig::default())
    }
}

impl CheckpointAdapter {
    pub fn new(probes: Vec<WrapperProbe>) -> Self {
        Self {
            probes,
            strip_prefixes: Vec::new(),
        }
    }

    pub fn from_config(config: &AdapterConfig) -> Self {
        Self {
            probes: config.wrapper_keys.iter().map(WrapperProbe::new).collect(),
            strip_prefixes: config.strip_prefixes.clone(),
        }
    }

    /// Adds a prefix to remove from parameter names.
    pub fn with_strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.strip_prefixes.push(prefix.into());
        self
    }

    pub fn probes(&self) -> &[WrapperProbe] {
        &self.probes
    }

    /// Locates the state mapping inside `source`.
    pub fn resolve<'a, S>(
        &self,
        source: &'a S,
    ) -> Result<&'a [(String, CheckpointValue)], AdapterError>
    where
        S: StateSource + ?Sized,
    {
        for probe in &self.probes {
            if let Some(entries) = probe.probe(source) {
                debug!(key = probe.key(), "state mapping found under wrapper key");
                return Ok(entries);
            }
        }

        source
            .entries()
            .ok_or_else(|| AdapterError::unreadable("checkpoint is not a mapping"))
    }

    /// Returns every tensor of the state mapping in iteration order.
    ///
    /// Tensors are borrowed from the checkpoint; no element conversion
    /// happens here.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::EmptyOrUnreadable`] if no mapping can be found
    /// or one of its entries is not a tensor.
    pub fn adapt<'a, S>(&self, source: &'a S) -> Result<Vec<NamedTensor<'a>>, AdapterError>
    where
        S: StateSource + ?Sized,
    {
        let entries = self.resolve(source)?;

        entries
            .iter()
            .map(|(name, value)| {
                let tensor = value.as_tensor().ok_or_else(|| {
                    AdapterError::unreadable(format!(
                        "entry '{name}' is a {}, not a tensor",
                        value.kind()
                    ))
                })?;
                Ok(NamedTensor::new(self.export_name(name), tensor))
            })
            .collect()
    }

    fn export_name(&self, name: &str) -> String {
        let mut name = name;
        for prefix in &self.strip_prefixes {
            if let Some(stripped) = name.strip_prefix(prefix.as_str()) {
                name = stripped;
            }
        }
        name.to_string()
    }
}
