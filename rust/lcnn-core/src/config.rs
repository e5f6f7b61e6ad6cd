// rust/lcnn-core/src/config.rs

//! Configuration for archive export.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{LcnnError, Result};

/// Default destination of an exported archive.
pub const DEFAULT_OUTPUT_PATH: &str = "./model_weights.bin";

// Top-level export configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub storage: StorageConfig,
    pub writer: WriterConfig,
    pub adapter: AdapterConfig,
    pub output: OutputConfig,
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Base path that relative archive paths resolve against.
    pub base_path: PathBuf,
    // Buffer size in bytes for I/O operations.
    pub buffer_size: usize,
    // Whether to use memory-mapped I/O when reading archives.
    pub use_mmap: bool,
    // File size threshold (bytes) above which to use mmap.
    pub mmap_threshold: u64,
}

/// What to do with double-precision source tensors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoublePrecision {
    /// Round to the nearest f32, like every other element type.
    #[default]
    Narrow,
    /// Fail with `WriterError::UnsupportedDType`.
    Reject,
}

impl FromStr for DoublePrecision {
    type Err = LcnnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "narrow" => Ok(Self::Narrow),
            "reject" => Ok(Self::Reject),
            other => Err(LcnnError::config(format!(
                "double_precision must be 'narrow' or 'reject', got '{other}'"
            ))),
        }
    }
}

// Archive writer options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    // Whether to write to a temp file and rename it into place.
    pub atomic_writes: bool,
    pub double_precision: DoublePrecision,
}

// Checkpoint adapter options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    // Wrapper keys probed in order before falling back to the whole checkpoint.
    pub wrapper_keys: Vec<String>,
    // Prefixes removed from parameter names (e.g. "_orig_mod.").
    pub strip_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("."),
            buffer_size: 64 * 1024, // 64 KB
            use_mmap: true,
            mmap_threshold: 1024 * 1024, // 1 MB
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            atomic_writes: true,
            double_precision: DoublePrecision::Narrow,
        }
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            wrapper_keys: vec!["model_state_dict".to_string(), "state_dict".to_string()],
            strip_prefixes: Vec::new(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_OUTPUT_PATH),
        }
    }
}

impl FromStr for ExportConfig {
    type Err = LcnnError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| LcnnError::config_with_source("failed to parse TOML config", e))
    }
}

impl ExportConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LcnnError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `LCNN_` and use underscores
    // to separate nested fields, e.g. `LCNN_STORAGE_BUFFER_SIZE` overrides
    // `storage.buffer_size`. Values that fail to parse are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("LCNN_STORAGE_BASE_PATH") {
            self.storage.base_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("LCNN_STORAGE_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                self.storage.buffer_size = v;
            }
        }
        if let Ok(val) = std::env::var("LCNN_STORAGE_USE_MMAP") {
            if let Ok(v) = val.parse() {
                self.storage.use_mmap = v;
            }
        }
        if let Ok(val) = std::env::var("LCNN_STORAGE_MMAP_THRESHOLD") {
            if let Ok(v) = val.parse() {
                self.storage.mmap_threshold = v;
            }
        }

        if let Ok(val) = std::env::var("LCNN_WRITER_ATOMIC_WRITES") {
            if let Ok(v) = val.parse() {
                self.writer.atomic_writes = v;
            }
        }
        if let Ok(val) = std::env::var("LCNN_WRITER_DOUBLE_PRECISION") {
            if let Ok(v) = val.parse() {
                self.writer.double_precision = v;
            }
        }

        if let Ok(val) = std::env::var("LCNN_OUTPUT_PATH") {
            self.output.path = PathBuf::from(val);
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.storage.buffer_size == 0 {
            return Err(LcnnError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }

        if self.adapter.wrapper_keys.iter().any(|k| k.is_empty()) {
            return Err(LcnnError::config(
                "adapter.wrapper_keys must not contain empty keys",
            ));
        }

        if self.adapter.strip_prefixes.iter().any(|p| p.is_empty()) {
            return Err(LcnnError::config(
                "adapter.strip_prefixes must not contain empty prefixes",
            ));
        }

        if self.output.path.as_os_str().is_empty() {
            return Err(LcnnError::config("output.path must not be empty"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ExportConfig::default();

        assert_eq!(config.storage.base_path, PathBuf::from("."));
        assert_eq!(config.storage.buffer_size, 64 * 1024);
        assert!(config.storage.use_mmap);
        assert_eq!(config.storage.mmap_threshold, 1024 * 1024);

        assert!(config.writer.atomic_writes);
        assert_eq!(config.writer.double_precision, DoublePrecision::Narrow);

        assert_eq!(
            config.adapter.wrapper_keys,
            vec!["model_state_dict".to_string(), "state_dict".to_string()]
        );
        assert!(config.adapter.strip_prefixes.is_empty());

        assert_eq!(config.output.path, PathBuf::from(DEFAULT_OUTPUT_PATH));
    }

    #[test]
    fn test_default_validates() {
        assert!(ExportConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_str_empty() {
        let config: ExportConfig = "".parse().unwrap();
        assert!(config.validate().is_ok());
        assert!(config.writer.atomic_writes);
    }

    #[test]
    fn test_from_str_full() {
        let toml = r#"
            [storage]
            base_path = "/data/export"
            buffer_size = 131072
            use_mmap = false
            mmap_threshold = 2097152

            [writer]
            atomic_writes = false
            double_precision = "reject"

            [adapter]
            wrapper_keys = ["ema_state_dict", "model_state_dict"]
            strip_prefixes = ["_orig_mod.", "module."]

            [output]
            path = "weights/model_weights.bin"
        "#;

        let config: ExportConfig = toml.parse().unwrap();

        assert_eq!(config.storage.base_path, PathBuf::from("/data/export"));
        assert_eq!(config.storage.buffer_size, 131072);
        assert!(!config.storage.use_mmap);
        assert_eq!(config.storage.mmap_threshold, 2097152);

        assert!(!config.writer.atomic_writes);
        assert_eq!(config.writer.double_precision, DoublePrecision::Reject);

        assert_eq!(config.adapter.wrapper_keys[0], "ema_state_dict");
        assert_eq!(config.adapter.strip_prefixes.len(), 2);

        assert_eq!(
            config.output.path,
            PathBuf::from("weights/model_weights.bin")
        );
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: std::result::Result<ExportConfig, _> = "invalid = [".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_str_unknown_precision() {
        let result: std::result::Result<ExportConfig, _> =
            "[writer]\ndouble_precision = \"keep\"".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [output]
            path = "/tmp/weights.bin"
            "#
        )
        .unwrap();

        let config = ExportConfig::from_file(file.path()).unwrap();
        assert_eq!(config.output.path, PathBuf::from("/tmp/weights.bin"));
    }

    #[test]
    fn test_from_file_not_found() {
        let result = ExportConfig::from_file("/nonexistent/lcnn.toml");
        assert!(matches!(result, Err(LcnnError::Storage { .. })));
    }

    #[test]
    fn test_validate_invalid_buffer_size() {
        let mut config = ExportConfig::default();
        config.storage.buffer_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_wrapper_key() {
        let mut config = ExportConfig::default();
        config.adapter.wrapper_keys.push(String::new());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("wrapper_keys"));
    }

    #[test]
    fn test_double_precision_from_str() {
        assert_eq!(
            "Reject".parse::<DoublePrecision>().unwrap(),
            DoublePrecision::Reject
        );
        assert!("widen".parse::<DoublePrecision>().is_err());
    }

    fn clear_lcnn_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("LCNN_") {
                std::env::remove_var(&key);
            }
        }
    }

    // Environment variable tests are combined into a single test to avoid
    // race conditions when tests run in parallel, since env vars are global state.
    #[test]
    fn test_env_overrides() {
        clear_lcnn_env_vars();

        std::env::set_var("LCNN_STORAGE_BUFFER_SIZE", "32768");
        std::env::set_var("LCNN_WRITER_ATOMIC_WRITES", "false");
        std::env::set_var("LCNN_WRITER_DOUBLE_PRECISION", "reject");
        std::env::set_var("LCNN_OUTPUT_PATH", "/env/weights.bin");

        let config = ExportConfig::default().with_env_overrides();

        assert_eq!(config.storage.buffer_size, 32768);
        assert!(!config.writer.atomic_writes);
        assert_eq!(config.writer.double_precision, DoublePrecision::Reject);
        assert_eq!(config.output.path, PathBuf::from("/env/weights.bin"));

        clear_lcnn_env_vars();

        // Invalid values should be ignored (keep defaults)
        std::env::set_var("LCNN_STORAGE_BUFFER_SIZE", "not_a_number");
        std::env::set_var("LCNN_WRITER_DOUBLE_PRECISION", "sideways");

        let config = ExportConfig::default().with_env_overrides();

        assert_eq!(config.storage.buffer_size, 64 * 1024);
        assert_eq!(config.writer.double_precision, DoublePrecision::Narrow);

        clear_lcnn_env_vars();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let original = ExportConfig::default();
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: ExportConfig = toml_str.parse().unwrap();

        assert_eq!(original.storage.buffer_size, parsed.storage.buffer_size);
        assert_eq!(original.adapter.wrapper_keys, parsed.adapter.wrapper_keys);
        assert_eq!(
            original.writer.double_precision,
            parsed.writer.double_precision
        );
        assert_eq!(original.output.path, parsed.output.path);
    }
}
