// rust/lcnn-core/src/tensor.rs

//! In-memory tensor types shared by the checkpoint adapter and the archive
//! writer/reader.

use std::borrow::Cow;
use std::fmt;

use half::{bf16, f16};

/// Element type of a source tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    I8,
    U8,
    I16,
    I32,
    I64,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            DType::I8 | DType::U8 | DType::Bool => 1,
            DType::F16 | DType::BF16 | DType::I16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I8 => "i8",
            DType::U8 => "u8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Flat, row-major element buffer of a tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    Bool(Vec<bool>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F16(_) => DType::F16,
            TensorData::BF16(_) => DType::BF16,
            TensorData::F32(_) => DType::F32,
            TensorData::F64(_) => DType::F64,
            TensorData::I8(_) => DType::I8,
            TensorData::U8(_) => DType::U8,
            TensorData::I16(_) => DType::I16,
            TensorData::I32(_) => DType::I32,
            TensorData::I64(_) => DType::I64,
            TensorData::Bool(_) => DType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F16(v) => v.len(),
            TensorData::BF16(v) => v.len(),
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
            TensorData::I8(v) => v.len(),
            TensorData::U8(v) => v.len(),
            TensorData::I16(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converts the elements to f32.
    ///
    /// Half precision and integer types are widened, f64 is narrowed with
    /// round-to-nearest. Returns `None` for element types that have no float
    /// interpretation.
    pub fn to_f32(&self) -> Option<Cow<'_, [f32]>> {
        let converted = match self {
            TensorData::F32(v) => return Some(Cow::Borrowed(v.as_slice())),
            TensorData::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
            TensorData::BF16(v) => v.iter().map(|x| x.to_f32()).collect(),
            TensorData::F64(v) => v.iter().map(|&x| x as f32).collect(),
            TensorData::I8(v) => v.iter().map(|&x| x as f32).collect(),
            TensorData::U8(v) => v.iter().map(|&x| x as f32).collect(),
            TensorData::I16(v) => v.iter().map(|&x| x as f32).collect(),
            TensorData::I32(v) => v.iter().map(|&x| x as f32).collect(),
            TensorData::I64(v) => v.iter().map(|&x| x as f32).collect(),
            TensorData::Bool(_) => return None,
        };
        Some(Cow::Owned(converted))
    }
}

/// A shaped tensor as found in a checkpoint.
///
/// The shape and buffer are not cross-checked on construction; the archive
/// writer verifies `data.len() == product(shape)` before emitting it.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: TensorData) -> Self {
        Self { shape, data }
    }

    pub fn from_f32(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self::new(shape, TensorData::F32(data))
    }

    /// A zero-dimensional tensor holding one value.
    pub fn scalar(value: f32) -> Self {
        Self::from_f32(Vec::new(), vec![value])
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements implied by the shape, `None` on overflow.
    pub fn numel(&self) -> Option<usize> {
        element_count(self.shape.iter().copied())
    }
}

/// A tensor paired with the name it is exported under.
#[derive(Debug, Clone)]
pub struct NamedTensor<'a> {
    pub name: String,
    pub tensor: &'a Tensor,
}

impl<'a> NamedTensor<'a> {
    pub fn new(name: impl Into<String>, tensor: &'a Tensor) -> Self {
        Self {
            name: name.into(),
            tensor,
        }
    }
}

/// One record of an LCNN archive: a name, a shape and row-major f32 data.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterRecord {
    pub name: String,
    pub shape: Vec<u32>,
    pub data: Vec<f32>,
}

impl ParameterRecord {
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Converts the record into an f32 `Tensor`.
    pub fn to_tensor(&self) -> Tensor {
        Tensor::from_f32(
            self.shape.iter().map(|&d| d as usize).collect(),
            self.data.clone(),
        )
    }

    /// Bitwise equality, so NaN payloads and signed zeros compare exactly.
    pub fn bits_eq(&self, other: &ParameterRecord) -> bool {
        self.name == other.name
            && self.shape == other.shape
            && self.data.len() == other.data.len()
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

/// Product of the dimensions, with the empty product defined as 1.
pub fn element_count(dims: impl IntoIterator<Item = usize>) -> Option<usize> {
    dims.into_iter().try_fold(1usize, |acc, d| acc.checked_mul(d))
}
