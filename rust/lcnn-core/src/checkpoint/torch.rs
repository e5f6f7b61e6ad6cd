// rust/lcnn-core/src/checkpoint/torch.rs

//! Loader for `torch.save` zip checkpoints.
//!
//! ```text
//! <archive>/data.pkl      <- pickled object tree
//! <archive>/data/<key>    <- raw storage bytes, one record per storage
//! <archive>/byteorder     <- "little" or "big" (absent in old files)
//! ```
//!
//! `<archive>` is whatever top-level directory the saver chose, so it is
//! discovered from the location of `data.pkl`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use half::{bf16, f16};
use tracing::{debug, info, warn};
use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::{LcnnError, LoadError, Result};
use crate::tensor::{element_count, DType, Tensor, TensorData};

use super::pickle::{PickleMachine, TensorSpec, Value};
use super::CheckpointValue;

/// Nesting limit for the object tree.
const MAX_DEPTH: usize = 128;

/// Loads the checkpoint at `path`.
///
/// # Errors
///
/// Returns [`LcnnError::Load`] naming the file if it is not a readable
/// `torch.save` zip or its contents cannot be reconstructed.
pub fn load_checkpoint(path: &Path) -> Result<CheckpointValue> {
    let mut checkpoint = TorchCheckpoint::open(path).map_err(|e| LcnnError::load(path, e))?;
    let value = checkpoint.load().map_err(|e| LcnnError::load(path, e))?;

    info!(
        path = %path.display(),
        storages = checkpoint.storages.len(),
        "checkpoint loaded"
    );
    Ok(value)
}

/// An open `torch.save` zip archive.
pub struct TorchCheckpoint<R: Read + Seek> {
    archive: ZipArchive<R>,
    prefix: String,
    /// Decoded storages by key, shared by every tensor that views them.
    storages: HashMap<String, TensorData>,
}

impl TorchCheckpoint<File> {
    pub fn open(path: &Path) -> std::result::Result<Self, LoadError> {
        let file = File::open(path)?;
        Self::from_archive(ZipArchive::new(file)?)
    }
}

impl<R: Read + Seek> TorchCheckpoint<R> {
    pub fn from_archive(archive: ZipArchive<R>) -> std::result::Result<Self, LoadError> {
        let prefix = archive
            .file_names()
            .filter_map(|name| name.strip_suffix("data.pkl"))
            .find(|prefix| prefix.is_empty() || prefix.ends_with('/'))
            .map(str::to_string)
            .ok_or(ZipError::FileNotFound)?;

        Ok(Self {
            archive,
            prefix,
            storages: HashMap::new(),
        })
    }

    /// Reconstructs the pickled object tree, reading every referenced storage.
    pub fn load(&mut self) -> std::result::Result<CheckpointValue, LoadError> {
        self.check_byteorder()?;

        let pickle = self.read_record("data.pkl")?;
        let root = PickleMachine::new(&pickle).run()?;

        self.convert(&root, "", 0)
    }

    fn check_byteorder(&mut self) -> std::result::Result<(), LoadError> {
        let name = format!("{}byteorder", self.prefix);
        let mut order = String::new();
        match self.archive.by_name(&name) {
            Ok(mut file) => {
                file.read_to_string(&mut order)?;
            }
            Err(ZipError::FileNotFound) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        match order.trim() {
            "little" => Ok(()),
            other => Err(LoadError::UnsupportedStorage(format!(
                "{other}-endian storages"
            ))),
        }
    }

    fn read_record(&mut self, name: &str) -> std::result::Result<Vec<u8>, LoadError> {
        let full = format!("{}{name}", self.prefix);
        let mut file = self.archive.by_name(&full)?;
        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn convert(
        &mut self,
        value: &Value,
        path: &str,
        depth: usize,
    ) -> std::result::Result<CheckpointValue, LoadError> {
        if depth > MAX_DEPTH {
            return Err(LoadError::pickle(format!(
                "object tree nested deeper than {MAX_DEPTH} levels at '{path}'"
            )));
        }

        let converted = match value {
            Value::None => CheckpointValue::None,
            Value::Bool(b) => CheckpointValue::Bool(*b),
            Value::Int(i) => CheckpointValue::Int(*i),
            Value::Float(f) => CheckpointValue::Float(*f),
            Value::Str(s) => CheckpointValue::Str(s.clone()),
            Value::Tuple(items) => CheckpointValue::List(self.convert_all(items, path, depth)?),
            Value::List(items) => {
                let items = items.borrow().clone();
                CheckpointValue::List(self.convert_all(&items, path, depth)?)
            }
            Value::Dict(entries) => {
                let entries = entries.borrow().clone();
                let mut out = Vec::with_capacity(entries.len());
                for (key, value) in &entries {
                    let key = map_key(key)?;
                    let child = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{path}.{key}")
                    };
                    out.push((key, self.convert(value, &child, depth + 1)?));
                }
                CheckpointValue::Map(out)
            }
            Value::Tensor(spec) => CheckpointValue::Tensor(self.tensor(spec, path)?),
            Value::Global { module, name } => CheckpointValue::Opaque(format!("{module}.{name}")),
            Value::Storage(storage) => {
                CheckpointValue::Opaque(format!("storage<{}>", storage.dtype))
            }
            Value::Object(name) => CheckpointValue::Opaque(name.clone()),
        };
        Ok(converted)
    }

    fn convert_all(
        &mut self,
        items: &[Value],
        path: &str,
        depth: usize,
    ) -> std::result::Result<Vec<CheckpointValue>, LoadError> {
        items
            .iter()
            .enumerate()
            .map(|(i, item)| self.convert(item, &format!("{path}[{i}]"), depth + 1))
            .collect()
    }

    /// Materializes a tensor view as a row-major buffer.
    fn tensor(&mut self, spec: &TensorSpec, name: &str) -> std::result::Result<Tensor, LoadError> {
        let storage = self.storage(spec)?;
        let storage_elems = storage.len();

        let out_of_bounds = |max_index: usize| LoadError::OutOfBounds {
            name: name.to_string(),
            storage_elems,
            max_index,
        };

        let numel = element_count(spec.shape.iter().copied())
            .ok_or_else(|| out_of_bounds(usize::MAX))?;
        if numel == 0 {
            return Ok(Tensor::new(spec.shape.clone(), empty_like(storage)));
        }

        let max_index = spec
            .shape
            .iter()
            .zip(&spec.stride)
            .try_fold(spec.offset, |acc, (&dim, &stride)| {
                (dim - 1).checked_mul(stride).and_then(|s| acc.checked_add(s))
            })
            .ok_or_else(|| out_of_bounds(usize::MAX))?;
        if max_index >= storage_elems {
            return Err(out_of_bounds(max_index));
        }

        let view = View {
            offset: spec.offset,
            shape: &spec.shape,
            stride: &spec.stride,
            numel,
        };
        Ok(Tensor::new(spec.shape.clone(), view.gather(storage)))
    }

    fn storage(&mut self, spec: &TensorSpec) -> std::result::Result<&TensorData, LoadError> {
        let key = &spec.storage.key;
        if !self.storages.contains_key(key) {
            let bytes = self.read_record(&format!("data/{key}"))?;
            let data = decode_storage(spec.storage.dtype, &bytes);
            if data.len() != spec.storage.numel {
                warn!(
                    key = %key,
                    declared = spec.storage.numel,
                    actual = data.len(),
                    "storage size differs from its declaration"
                );
            }
            debug!(key = %key, dtype = %spec.storage.dtype, elems = data.len(), "storage loaded");
            self.storages.insert(key.clone(), data);
        }
        self.storages
            .get(key)
            .ok_or_else(|| LoadError::pickle(format!("storage '{key}' vanished from cache")))
    }
}

fn map_key(key: &Value) -> std::result::Result<String, LoadError> {
    match key {
        Value::Str(s) => Ok(s.clone()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Bool(b) => Ok(if *b { "True" } else { "False" }.to_string()),
        Value::Float(f) => Ok(f.to_string()),
        _ => Err(LoadError::pickle("mapping key is not a string or number")),
    }
}

/// Decodes little-endian storage bytes. Trailing bytes that do not form a
/// whole element are ignored.
fn decode_storage(dtype: DType, bytes: &[u8]) -> TensorData {
    let n = bytes.len() / dtype.size_bytes();
    let bytes = &bytes[..n * dtype.size_bytes()];

    match dtype {
        DType::F32 => {
            let mut v = vec![0f32; n];
            LittleEndian::read_f32_into(bytes, &mut v);
            TensorData::F32(v)
        }
        DType::F64 => {
            let mut v = vec![0f64; n];
            LittleEndian::read_f64_into(bytes, &mut v);
            TensorData::F64(v)
        }
        DType::F16 => {
            let mut bits = vec![0u16; n];
            LittleEndian::read_u16_into(bytes, &mut bits);
            TensorData::F16(bits.into_iter().map(f16::from_bits).collect())
        }
        DType::BF16 => {
            let mut bits = vec![0u16; n];
            LittleEndian::read_u16_into(bytes, &mut bits);
            TensorData::BF16(bits.into_iter().map(bf16::from_bits).collect())
        }
        DType::I64 => {
            let mut v = vec![0i64; n];
            LittleEndian::read_i64_into(bytes, &mut v);
            TensorData::I64(v)
        }
        DType::I32 => {
            let mut v = vec![0i32; n];
            LittleEndian::read_i32_into(bytes, &mut v);
            TensorData::I32(v)
        }
        DType::I16 => {
            let mut v = vec![0i16; n];
            LittleEndian::read_i16_into(bytes, &mut v);
            TensorData::I16(v)
        }
        DType::I8 => TensorData::I8(bytes.iter().map(|&b| b as i8).collect()),
        DType::U8 => TensorData::U8(bytes.to_vec()),
        DType::Bool => TensorData::Bool(bytes.iter().map(|&b| b != 0).collect()),
    }
}

fn empty_like(data: &TensorData) -> TensorData {
    match data {
        TensorData::F16(_) => TensorData::F16(Vec::new()),
        TensorData::BF16(_) => TensorData::BF16(Vec::new()),
        TensorData::F32(_) => TensorData::F32(Vec::new()),
        TensorData::F64(_) => TensorData::F64(Vec::new()),
        TensorData::I8(_) => TensorData::I8(Vec::new()),
        TensorData::U8(_) => TensorData::U8(Vec::new()),
        TensorData::I16(_) => TensorData::I16(Vec::new()),
        TensorData::I32(_) => TensorData::I32(Vec::new()),
        TensorData::I64(_) => TensorData::I64(Vec::new()),
        TensorData::Bool(_) => TensorData::Bool(Vec::new()),
    }
}

/// A bounds-checked strided view into a storage.
struct View<'s> {
    offset: usize,
    shape: &'s [usize],
    stride: &'s [usize],
    numel: usize,
}

impl View<'_> {
    fn is_contiguous(&self) -> bool {
        let mut expected = 1usize;
        for (&dim, &stride) in self.shape.iter().zip(self.stride).rev() {
            if dim != 1 && stride != expected {
                return false;
            }
            expected = expected.saturating_mul(dim);
        }
        true
    }

    fn gather(&self, storage: &TensorData) -> TensorData {
        match storage {
            TensorData::F16(v) => TensorData::F16(self.gather_slice(v)),
            TensorData::BF16(v) => TensorData::BF16(self.gather_slice(v)),
            TensorData::F32(v) => TensorData::F32(self.gather_slice(v)),
            TensorData::F64(v) => TensorData::F64(self.gather_slice(v)),
            TensorData::I8(v) => TensorData::I8(self.gather_slice(v)),
            TensorData::U8(v) => TensorData::U8(self.gather_slice(v)),
            TensorData::I16(v) => TensorData::I16(self.gather_slice(v)),
            TensorData::I32(v) => TensorData::I32(self.gather_slice(v)),
            TensorData::I64(v) => TensorData::I64(self.gather_slice(v)),
            TensorData::Bool(v) => TensorData::Bool(self.gather_slice(v)),
        }
    }

    /// Copies the view out in row-major order. Bounds were checked by the caller.
    fn gather_slice<T: Copy>(&self, src: &[T]) -> Vec<T> {
        if self.is_contiguous() {
            return src[self.offset..self.offset + self.numel].to_vec();
        }

        let ndim = self.shape.len();
        let mut out = Vec::with_capacity(self.numel);
        let mut index = vec![0usize; ndim];
        let mut pos = self.offset;

        loop {
            out.push(src[pos]);

            let mut d = ndim;
            loop {
                if d == 0 {
                    return out;
                }
                d -= 1;
                index[d] += 1;
                pos += self.stride[d];
                if index[d] < self.shape[d] {
                    break;
                }
                pos -= self.stride[d] * self.shape[d];
                index[d] = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;
    use zip::{CompressionMethod, ZipWriter};

    /// Emits pickle bytes the way `torch.save` lays them out.
    struct Pickle(Vec<u8>);

    impl Pickle {
        fn new() -> Self {
            Pickle(vec![0x80, 0x02])
        }

        fn op(mut self, op: u8) -> Self {
            self.0.push(op);
            self
        }

        fn global(mut self, module: &str, name: &str) -> Self {
            self.0.push(b'c');
            self.0.extend_from_slice(format!("{module}\n{name}\n").as_bytes());
            self
        }

        fn str(mut self, s: &str) -> Self {
            self.0.push(b'X');
            self.0.extend_from_slice(&(s.len() as u32).to_le_bytes());
            self.0.extend_from_slice(s.as_bytes());
            self
        }

        fn int(mut self, v: u8) -> Self {
            self.0.extend_from_slice(&[b'K', v]);
            self
        }

        fn ints(self, values: &[u8]) -> Self {
            let mut p = self.op(b'(');
            for &v in values {
                p = p.int(v);
            }
            p.op(b't')
        }

        fn ordered_dict(self) -> Self {
            self.global("collections", "OrderedDict").op(b')').op(b'R')
        }

        /// `_rebuild_tensor_v2(storage, offset, shape, stride, False, OrderedDict())`
        fn tensor(
            self,
            storage_class: &str,
            key: &str,
            numel: u8,
            offset: u8,
            shape: &[u8],
            stride: &[u8],
        ) -> Self {
            self.global("torch._utils", "_rebuild_tensor_v2")
                .op(b'(')
                .op(b'(')
                .str("storage")
                .global("torch", storage_class)
                .str(key)
                .str("cpu")
                .int(numel)
                .op(b't')
                .op(b'Q')
                .int(offset)
                .ints(shape)
                .ints(stride)
                .op(0x89)
                .ordered_dict()
                .op(b't')
                .op(b'R')
        }

        fn finish(self) -> Vec<u8> {
            self.op(b'.').0
        }
    }

    fn zip_checkpoint(records: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        for (name, bytes) in records {
            zip.start_file(*name, options).unwrap();
            zip.write_all(bytes).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn load(bytes: Vec<u8>) -> std::result::Result<CheckpointValue, LoadError> {
        TorchCheckpoint::from_archive(ZipArchive::new(Cursor::new(bytes))?)?.load()
    }

    fn two_tensor_state_dict() -> Vec<u8> {
        let pickle = Pickle::new()
            .ordered_dict()
            .op(b'(')
            .str("conv1.weight")
            .tensor("FloatStorage", "0", 6, 0, &[2, 3], &[3, 1])
            .str("fc.bias")
            .tensor("FloatStorage", "1", 4, 0, &[4], &[1])
            .op(b'u')
            .finish();

        zip_checkpoint(&[
            ("model/data.pkl", pickle),
            ("model/byteorder", b"little".to_vec()),
            ("model/data/0", f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])),
            ("model/data/1", f32_bytes(&[0.1, 0.2, 0.3, 0.4])),
        ])
    }

    #[test]
    fn test_load_state_dict() {
        let value = load(two_tensor_state_dict()).unwrap();

        let CheckpointValue::Map(entries) = value else {
            panic!("expected a mapping");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "conv1.weight");
        assert_eq!(
            entries[0].1,
            CheckpointValue::Tensor(Tensor::from_f32(
                vec![2, 3],
                vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
            ))
        );
        assert_eq!(entries[1].0, "fc.bias");
    }

    #[test]
    fn test_load_training_wrapper() {
        let pickle = Pickle::new()
            .op(b'}')
            .op(b'(')
            .str("epoch")
            .int(5)
            .str("model_state_dict")
            .ordered_dict()
            .op(b'(')
            .str("w")
            .tensor("FloatStorage", "0", 2, 0, &[2], &[1])
            .op(b'u')
            .op(b'u')
            .finish();
        let bytes = zip_checkpoint(&[
            ("archive/data.pkl", pickle),
            ("archive/data/0", f32_bytes(&[7.0, 8.0])),
        ]);

        let value = load(bytes).unwrap();
        use crate::checkpoint::StateSource;
        assert_eq!(value.lookup("epoch"), Some(&CheckpointValue::Int(5)));
        let inner = value.lookup("model_state_dict").unwrap();
        assert!(inner.lookup("w").and_then(|v| v.as_tensor()).is_some());
    }

    #[test]
    fn test_shared_storage_with_offset() {
        let pickle = Pickle::new()
            .ordered_dict()
            .op(b'(')
            .str("a")
            .tensor("FloatStorage", "0", 6, 0, &[2], &[1])
            .str("b")
            .tensor("FloatStorage", "0", 6, 2, &[4], &[1])
            .op(b'u')
            .finish();
        let bytes = zip_checkpoint(&[
            ("m/data.pkl", pickle),
            ("m/data/0", f32_bytes(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0])),
        ]);

        let CheckpointValue::Map(entries) = load(bytes).unwrap() else {
            panic!("expected a mapping");
        };
        assert_eq!(entries[1].1.as_tensor().unwrap().data(), &TensorData::F32(vec![2.0, 3.0, 4.0, 5.0]));
    }

    #[test]
    fn test_transposed_view_is_materialized() {
        // A (2, 3) tensor transposed to (3, 2) with strides (1, 3).
        let pickle = Pickle::new()
            .ordered_dict()
            .op(b'(')
            .str("t")
            .tensor("FloatStorage", "0", 6, 0, &[3, 2], &[1, 3])
            .op(b'u')
            .finish();
        let bytes = zip_checkpoint(&[
            ("m/data.pkl", pickle),
            ("m/data/0", f32_bytes(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0])),
        ]);

        let CheckpointValue::Map(entries) = load(bytes).unwrap() else {
            panic!("expected a mapping");
        };
        assert_eq!(
            entries[0].1.as_tensor().unwrap().data(),
            &TensorData::F32(vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0])
        );
    }

    #[test]
    fn test_integer_and_half_storages() {
        let pickle = Pickle::new()
            .ordered_dict()
            .op(b'(')
            .str("bn.num_batches_tracked")
            .tensor("LongStorage", "0", 1, 0, &[], &[])
            .str("h")
            .tensor("HalfStorage", "1", 2, 0, &[2], &[1])
            .op(b'u')
            .finish();
        let half_bytes: Vec<u8> = [f16::from_f32(0.5), f16::from_f32(-2.0)]
            .iter()
            .flat_map(|h| h.to_bits().to_le_bytes())
            .collect();
        let bytes = zip_checkpoint(&[
            ("m/data.pkl", pickle),
            ("m/data/0", 937i64.to_le_bytes().to_vec()),
            ("m/data/1", half_bytes),
        ]);

        let CheckpointValue::Map(entries) = load(bytes).unwrap() else {
            panic!("expected a mapping");
        };
        let tracked = entries[0].1.as_tensor().unwrap();
        assert!(tracked.shape().is_empty());
        assert_eq!(tracked.data(), &TensorData::I64(vec![937]));

        let h = entries[1].1.as_tensor().unwrap();
        assert_eq!(h.data().to_f32().unwrap().as_ref(), &[0.5, -2.0]);
    }

    #[test]
    fn test_view_past_storage_is_out_of_bounds() {
        let pickle = Pickle::new()
            .ordered_dict()
            .op(b'(')
            .str("w")
            .tensor("FloatStorage", "0", 4, 2, &[4], &[1])
            .op(b'u')
            .finish();
        let bytes = zip_checkpoint(&[
            ("m/data.pkl", pickle),
            ("m/data/0", f32_bytes(&[0.0; 4])),
        ]);

        let err = load(bytes).unwrap_err();
        assert!(matches!(
            err,
            LoadError::OutOfBounds {
                storage_elems: 4,
                max_index: 5,
                ..
            }
        ));
    }

    #[test]
    fn test_big_endian_rejected() {
        let mut records = vec![("m/data.pkl", Pickle::new().op(b'N').finish())];
        records.push(("m/byteorder", b"big".to_vec()));

        let err = load(zip_checkpoint(&records)).unwrap_err();
        assert!(matches!(err, LoadError::UnsupportedStorage(_)));
    }

    #[test]
    fn test_unknown_storage_type() {
        let pickle = Pickle::new()
            .ordered_dict()
            .op(b'(')
            .str("c")
            .tensor("ComplexFloatStorage", "0", 1, 0, &[1], &[1])
            .op(b'u')
            .finish();
        let err = load(zip_checkpoint(&[("m/data.pkl", pickle)])).unwrap_err();
        assert!(matches!(err, LoadError::UnsupportedStorage(name) if name == "torch.ComplexFloatStorage"));
    }

    #[test]
    fn test_missing_pickle_record() {
        let bytes = zip_checkpoint(&[("m/other.bin", vec![0u8; 4])]);
        assert!(matches!(load(bytes), Err(LoadError::Zip(ZipError::FileNotFound))));
    }

    #[test]
    fn test_load_checkpoint_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("model.pt");
        std::fs::write(&path, two_tensor_state_dict()).unwrap();

        let value = load_checkpoint(&path).unwrap();
        assert_eq!(value.kind(), "mapping");

        let err = load_checkpoint(&dir.path().join("missing.pt")).unwrap_err();
        assert!(matches!(err, LcnnError::Load { .. }));
    }

    #[test]
    fn test_not_a_zip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("legacy.pt");
        std::fs::write(&path, b"\x80\x02N.").unwrap();

        let err = load_checkpoint(&path).unwrap_err();
        assert!(matches!(
            err,
            LcnnError::Load {
                source: LoadError::Zip(_),
                ..
            }
        ));
    }
}
