//! Checkpoint to archive export pipeline.

use std::sync::Arc;

use tracing::{debug, info};

use lcnn_core::archive::{format::truncate_name, Archive};
use lcnn_core::{
    ArchiveReader, ArchiveSummary, ArchiveWriter, CheckpointAdapter, CheckpointValue,
    ExportConfig, LocalStorage, NamedTensor, ReaderError, Result, StorageBackend,
};

/// Number of parameters listed from each end of the archive.
const PREVIEW: usize = 5;

/// Outcome of one export.
#[derive(Debug)]
pub struct ExportReport {
    pub summary: ArchiveSummary,
    /// Whether the archive was read back and matched the checkpoint.
    pub verified: bool,
}

/// Adapts `checkpoint` and writes it to `config.output.path`.
pub fn export(checkpoint: &CheckpointValue, config: &ExportConfig, verify: bool) -> Result<ExportReport> {
    let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&config.storage)?);

    let adapter = CheckpointAdapter::from_config(&config.adapter);
    let tensors = adapter.adapt(checkpoint)?;
    log_preview(&tensors);

    let writer = ArchiveWriter::new(storage.clone(), config.writer.clone());
    let summary = writer.write(&config.output.path, &tensors)?;

    if verify {
        let archive = ArchiveReader::new(storage).read(&summary.path)?;
        compare(&archive, &tensors)?;
        info!(records = archive.records.len(), "archive verified");
    }

    Ok(ExportReport {
        summary,
        verified: verify,
    })
}

fn log_preview(tensors: &[NamedTensor<'_>]) {
    info!(count = tensors.len(), "parameters to export");

    let head = tensors.len().min(PREVIEW);
    let tail_start = tensors.len().saturating_sub(PREVIEW).max(head);
    for t in tensors[..head].iter().chain(&tensors[tail_start..]) {
        info!(name = %t.name, shape = ?t.tensor.shape(), dtype = %t.tensor.dtype(), "parameter");
    }
    if tail_start > head {
        debug!(omitted = tail_start - head, "parameters not listed");
    }
}

/// Checks that `archive` holds exactly `tensors`, converted to f32.
fn compare(archive: &Archive, tensors: &[NamedTensor<'_>]) -> std::result::Result<(), ReaderError> {
    let mismatch = |index: usize, message: String| ReaderError::Inconsistent {
        index: index as u32,
        message,
    };

    if archive.records.len() != tensors.len() {
        return Err(mismatch(
            archive.records.len(),
            format!(
                "archive holds {} records, checkpoint has {} parameters",
                archive.records.len(),
                tensors.len()
            ),
        ));
    }

    for (index, (record, tensor)) in archive.records.iter().zip(tensors).enumerate() {
        if record.name != truncate_name(&tensor.name) {
            return Err(mismatch(
                index,
                format!("name '{}' does not match '{}'", record.name, tensor.name),
            ));
        }

        let shape_matches = record.shape.len() == tensor.tensor.ndim()
            && record
                .shape
                .iter()
                .zip(tensor.tensor.shape())
                .all(|(&a, &b)| a as usize == b);
        if !shape_matches {
            return Err(mismatch(
                index,
                format!(
                    "shape {:?} of '{}' does not match {:?}",
                    record.shape,
                    record.name,
                    tensor.tensor.shape()
                ),
            ));
        }

        let expected = tensor
            .tensor
            .data()
            .to_f32()
            .ok_or_else(|| mismatch(index, format!("'{}' has no f32 form", record.name)))?;
        let bits_match = record.data.len() == expected.len()
            && record
                .data
                .iter()
                .zip(expected.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits());
        if !bits_match {
            return Err(mismatch(
                index,
                format!("data of '{}' differs from the checkpoint", record.name),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lcnn_core::archive::ArchiveHeader;
    use lcnn_core::{LcnnError, ParameterRecord, Tensor, TensorData, WriterError};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> ExportConfig {
        let mut config = ExportConfig::default();
        config.storage.base_path = dir.path().to_path_buf();
        config.output.path = PathBuf::from("model_weights.bin");
        config
    }

    fn resnet_like() -> CheckpointValue {
        let state = CheckpointValue::map([
            (
                "conv1.weight",
                CheckpointValue::Tensor(Tensor::from_f32(vec![2, 1, 1, 1], vec![0.5, -0.5])),
            ),
            (
                "bn1.num_batches_tracked",
                CheckpointValue::Tensor(Tensor::new(vec![], TensorData::I64(vec![100]))),
            ),
            (
                "fc.bias",
                CheckpointValue::Tensor(Tensor::new(vec![2], TensorData::F64(vec![0.1, 0.2]))),
            ),
        ]);
        CheckpointValue::map([
            ("epoch", CheckpointValue::Int(90)),
            ("model_state_dict", state),
        ])
    }

    #[test]
    fn test_export_and_verify() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        let report = export(&resnet_like(), &config, true).unwrap();

        assert!(report.verified);
        assert_eq!(report.summary.stats.records, 3);
        let on_disk = std::fs::metadata(dir.path().join("model_weights.bin")).unwrap();
        assert_eq!(report.summary.file_size, on_disk.len());
    }

    #[test]
    fn test_export_empty_state_dict() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        let report = export(&CheckpointValue::Map(Vec::new()), &config, true).unwrap();
        assert_eq!(report.summary.stats.records, 0);
        assert_eq!(report.summary.file_size, 12);
    }

    #[test]
    fn test_unreadable_checkpoint_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        let err = export(&CheckpointValue::Int(1), &config, false).unwrap_err();
        assert!(matches!(err, LcnnError::Adapter(_)));
        assert!(!dir.path().join("model_weights.bin").exists());
    }

    #[test]
    fn test_bool_buffer_fails_export() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let checkpoint = CheckpointValue::map([(
            "mask",
            CheckpointValue::Tensor(Tensor::new(vec![1], TensorData::Bool(vec![true]))),
        )]);

        let err = export(&checkpoint, &config, false).unwrap_err();
        assert!(matches!(err, LcnnError::Writer(WriterError::UnsupportedDType { .. })));
    }

    #[test]
    fn test_compare_detects_differences() {
        let t = Tensor::from_f32(vec![2], vec![1.0, 2.0]);
        let tensors = [NamedTensor::new("w", &t)];

        let good = Archive {
            header: ArchiveHeader::new(1),
            records: vec![ParameterRecord {
                name: "w".to_string(),
                shape: vec![2],
                data: vec![1.0, 2.0],
            }],
        };
        assert!(compare(&good, &tensors).is_ok());

        let mut bad_data = good.clone();
        bad_data.records[0].data[1] = 2.5;
        assert!(compare(&bad_data, &tensors).is_err());

        let mut bad_shape = good.clone();
        bad_shape.records[0].shape = vec![1, 2];
        assert!(compare(&bad_shape, &tensors).is_err());

        let mut bad_name = good;
        bad_name.records[0].name = "v".to_string();
        assert!(compare(&bad_name, &tensors).is_err());
    }
}
