// rust/lcnn-core/src/checkpoint/pickle.rs

//! A restricted pickle virtual machine for `torch.save` payloads.
//!
//! Only the opcodes and globals that appear in saved state dictionaries and
//! training checkpoints are understood. Nothing is ever imported or called:
//! tensor rebuild functions are recognized by name and turned into
//! [`TensorSpec`]s that point into the zip's storage records, and any other
//! class becomes an opaque object.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::LoadError;
use crate::tensor::DType;

const PROTO: u8 = 0x80;
const FRAME: u8 = 0x95;
const STOP: u8 = b'.';
const MARK: u8 = b'(';
const GLOBAL: u8 = b'c';
const STACK_GLOBAL: u8 = 0x93;
const BINPUT: u8 = b'q';
const LONG_BINPUT: u8 = b'r';
const MEMOIZE: u8 = 0x94;
const BINGET: u8 = b'h';
const LONG_BINGET: u8 = b'j';
const NONE: u8 = b'N';
const NEWTRUE: u8 = 0x88;
const NEWFALSE: u8 = 0x89;
const BININT: u8 = b'J';
const BININT1: u8 = b'K';
const BININT2: u8 = b'M';
const LONG1: u8 = 0x8a;
const LONG4: u8 = 0x8b;
const BINFLOAT: u8 = b'G';
const SHORT_BINSTRING: u8 = b'U';
const BINUNICODE: u8 = b'X';
const SHORT_BINUNICODE: u8 = 0x8c;
const BINUNICODE8: u8 = 0x8d;
const SHORT_BINBYTES: u8 = b'C';
const BINBYTES: u8 = b'B';
const EMPTY_TUPLE: u8 = b')';
const TUPLE: u8 = b't';
const TUPLE1: u8 = 0x85;
const TUPLE2: u8 = 0x86;
const TUPLE3: u8 = 0x87;
const EMPTY_LIST: u8 = b']';
const LIST: u8 = b'l';
const APPEND: u8 = b'a';
const APPENDS: u8 = b'e';
const EMPTY_DICT: u8 = b'}';
const DICT: u8 = b'd';
const SETITEM: u8 = b's';
const SETITEMS: u8 = b'u';
const BINPERSID: u8 = b'Q';
const REDUCE: u8 = b'R';
const NEWOBJ: u8 = 0x81;
const BUILD: u8 = b'b';

const HIGHEST_PROTOCOL: u8 = 5;

pub(crate) type Shared<T> = Rc<RefCell<T>>;

/// A storage record referenced by a persistent id.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StorageRef {
    pub dtype: DType,
    /// Record name under `data/` in the zip.
    pub key: String,
    /// Element count declared in the persistent id.
    pub numel: usize,
}

/// A tensor view over a storage, as described by `_rebuild_tensor_v2`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TensorSpec {
    pub storage: StorageRef,
    pub offset: usize,
    pub shape: Vec<usize>,
    pub stride: Vec<usize>,
}

#[derive(Debug, Clone)]
pub(crate) enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Value>),
    List(Shared<Vec<Value>>),
    Dict(Shared<Vec<(Value, Value)>>),
    Global { module: String, name: String },
    Storage(StorageRef),
    Tensor(TensorSpec),
    /// Instance of a class this machine does not model.
    Object(String),
}

impl Value {
    fn new_dict() -> Self {
        Value::Dict(Rc::new(RefCell::new(Vec::new())))
    }

    fn new_list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }
}

/// Maps a legacy typed-storage class to its element type.
pub(crate) fn storage_dtype(module: &str, name: &str) -> Result<DType, LoadError> {
    let dtype = match (module, name) {
        ("torch", "FloatStorage") => DType::F32,
        ("torch", "DoubleStorage") => DType::F64,
        ("torch", "HalfStorage") => DType::F16,
        ("torch", "BFloat16Storage") => DType::BF16,
        ("torch", "LongStorage") => DType::I64,
        ("torch", "IntStorage") => DType::I32,
        ("torch", "ShortStorage") => DType::I16,
        ("torch", "CharStorage") => DType::I8,
        ("torch", "ByteStorage") => DType::U8,
        ("torch", "BoolStorage") => DType::Bool,
        _ => return Err(LoadError::UnsupportedStorage(format!("{module}.{name}"))),
    };
    Ok(dtype)
}

pub(crate) struct PickleMachine<'a> {
    bytes: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    marks: Vec<usize>,
    memo: HashMap<u32, Value>,
}

impl<'a> PickleMachine<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    /// Executes the stream up to `STOP` and returns the top of the stack.
    pub fn run(mut self) -> Result<Value, LoadError> {
        loop {
            let at = self.pos;
            let op = self.read_u8()?;
            match op {
                PROTO => {
                    let version = self.read_u8()?;
                    if version > HIGHEST_PROTOCOL {
                        return Err(LoadError::pickle(format!(
                            "unsupported pickle protocol {version}"
                        )));
                    }
                }
                FRAME => {
                    self.take(8)?;
                }
                STOP => return self.pop(),
                MARK => self.marks.push(self.stack.len()),

                GLOBAL => {
                    let module = self.read_line()?;
                    let name = self.read_line()?;
                    self.stack.push(Value::Global { module, name });
                }
                STACK_GLOBAL => {
                    let name = self.pop_str()?;
                    let module = self.pop_str()?;
                    self.stack.push(Value::Global { module, name });
                }

                BINPUT => {
                    let idx = self.read_u8()? as u32;
                    self.memo_put(idx)?;
                }
                LONG_BINPUT => {
                    let idx = self.read_u32()?;
                    self.memo_put(idx)?;
                }
                MEMOIZE => {
                    let idx = self.memo.len() as u32;
                    self.memo_put(idx)?;
                }
                BINGET => {
                    let idx = self.read_u8()? as u32;
                    self.memo_get(idx)?;
                }
                LONG_BINGET => {
                    let idx = self.read_u32()?;
                    self.memo_get(idx)?;
                }

                NONE => self.stack.push(Value::None),
                NEWTRUE => self.stack.push(Value::Bool(true)),
                NEWFALSE => self.stack.push(Value::Bool(false)),
                BININT => {
                    let v = LittleEndian::read_i32(self.take(4)?);
                    self.stack.push(Value::Int(v as i64));
                }
                BININT1 => {
                    let v = self.read_u8()?;
                    self.stack.push(Value::Int(v as i64));
                }
                BININT2 => {
                    let v = LittleEndian::read_u16(self.take(2)?);
                    self.stack.push(Value::Int(v as i64));
                }
                LONG1 => {
                    let len = self.read_u8()? as usize;
                    let v = self.read_long(len)?;
                    self.stack.push(Value::Int(v));
                }
                LONG4 => {
                    let len = self.read_u32()? as usize;
                    let v = self.read_long(len)?;
                    self.stack.push(Value::Int(v));
                }
                BINFLOAT => {
                    let v = BigEndian::read_f64(self.take(8)?);
                    self.stack.push(Value::Float(v));
                }

                SHORT_BINSTRING => {
                    let len = self.read_u8()? as usize;
                    let s = String::from_utf8_lossy(self.take(len)?).into_owned();
                    self.stack.push(Value::Str(s));
                }
                SHORT_BINUNICODE => {
                    let len = self.read_u8()? as usize;
                    let s = self.read_utf8(len)?;
                    self.stack.push(Value::Str(s));
                }
                BINUNICODE => {
                    let len = self.read_u32()? as usize;
                    let s = self.read_utf8(len)?;
                    self.stack.push(Value::Str(s));
                }
                BINUNICODE8 => {
                    let len = self.read_len8()?;
                    let s = self.read_utf8(len)?;
                    self.stack.push(Value::Str(s));
                }
                SHORT_BINBYTES => {
                    let len = self.read_u8()? as usize;
                    self.take(len)?;
                    self.stack.push(Value::Object("builtins.bytes".to_string()));
                }
                BINBYTES => {
                    let len = self.read_u32()? as usize;
                    self.take(len)?;
                    self.stack.push(Value::Object("builtins.bytes".to_string()));
                }

                EMPTY_TUPLE => self.stack.push(Value::Tuple(Vec::new())),
                TUPLE => {
                    let items = self.pop_to_mark()?;
                    self.stack.push(Value::Tuple(items));
                }
                TUPLE1 => {
                    let a = self.pop()?;
                    self.stack.push(Value::Tuple(vec![a]));
                }
                TUPLE2 => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Value::Tuple(vec![a, b]));
                }
                TUPLE3 => {
                    let c = self.pop()?;
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Value::Tuple(vec![a, b, c]));
                }

                EMPTY_LIST => self.stack.push(Value::new_list(Vec::new())),
                LIST => {
                    let items = self.pop_to_mark()?;
                    self.stack.push(Value::new_list(items));
                }
                APPEND => {
                    let item = self.pop()?;
                    self.extend_list(vec![item])?;
                }
                APPENDS => {
                    let items = self.pop_to_mark()?;
                    self.extend_list(items)?;
                }

                EMPTY_DICT => self.stack.push(Value::new_dict()),
                DICT => {
                    let items = self.pop_to_mark()?;
                    let dict = Value::new_dict();
                    self.stack.push(dict);
                    self.set_items(items)?;
                }
                SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.set_items(vec![key, value])?;
                }
                SETITEMS => {
                    let items = self.pop_to_mark()?;
                    self.set_items(items)?;
                }

                BINPERSID => {
                    let pid = self.pop()?;
                    let storage = persistent_load(pid)?;
                    self.stack.push(storage);
                }
                REDUCE => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let out = reduce(callable, args)?;
                    self.stack.push(out);
                }
                NEWOBJ => {
                    let _args = self.pop()?;
                    let class = self.pop()?;
                    self.stack.push(Value::Object(qualified_name(&class)));
                }
                BUILD => {
                    // Instance state (e.g. an OrderedDict's `_metadata`) is not part of its items.
                    let _state = self.pop()?;
                }

                other => {
                    return Err(LoadError::pickle(format!(
                        "unsupported opcode 0x{other:02x} at offset {at}"
                    )))
                }
            }
        }
    }

    fn pop(&mut self) -> Result<Value, LoadError> {
        self.stack
            .pop()
            .ok_or_else(|| LoadError::pickle("stack underflow"))
    }

    fn pop_str(&mut self) -> Result<String, LoadError> {
        match self.pop()? {
            Value::Str(s) => Ok(s),
            _ => Err(LoadError::pickle("STACK_GLOBAL expects string operands")),
        }
    }

    fn pop_to_mark(&mut self) -> Result<Vec<Value>, LoadError> {
        let mark = self
            .marks
            .pop()
            .ok_or_else(|| LoadError::pickle("missing MARK"))?;
        if mark > self.stack.len() {
            return Err(LoadError::pickle("MARK is above the top of the stack"));
        }
        Ok(self.stack.split_off(mark))
    }

    fn extend_list(&mut self, items: Vec<Value>) -> Result<(), LoadError> {
        match self.stack.last() {
            Some(Value::List(list)) => {
                list.borrow_mut().extend(items);
                Ok(())
            }
            _ => Err(LoadError::pickle("APPEND target is not a list")),
        }
    }

    fn set_items(&mut self, items: Vec<Value>) -> Result<(), LoadError> {
        if items.len() % 2 != 0 {
            return Err(LoadError::pickle("SETITEMS expects key/value pairs"));
        }
        match self.stack.last() {
            Some(Value::Dict(dict)) => {
                let mut dict = dict.borrow_mut();
                let mut items = items.into_iter();
                while let (Some(key), Some(value)) = (items.next(), items.next()) {
                    dict.push((key, value));
                }
                Ok(())
            }
            // Items of an object we do not model are dropped with it.
            Some(Value::Object(_)) => Ok(()),
            _ => Err(LoadError::pickle("SETITEM target is not a dict")),
        }
    }

    fn memo_put(&mut self, idx: u32) -> Result<(), LoadError> {
        let top = self
            .stack
            .last()
            .cloned()
            .ok_or_else(|| LoadError::pickle("memo store with empty stack"))?;
        self.memo.insert(idx, top);
        Ok(())
    }

    fn memo_get(&mut self, idx: u32) -> Result<(), LoadError> {
        let value = self
            .memo
            .get(&idx)
            .cloned()
            .ok_or_else(|| LoadError::pickle(format!("missing memo entry {idx}")))?;
        self.stack.push(value);
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], LoadError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| LoadError::pickle("unexpected end of pickle stream"))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, LoadError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, LoadError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn read_len8(&mut self) -> Result<usize, LoadError> {
        let len = LittleEndian::read_u64(self.take(8)?);
        usize::try_from(len).map_err(|_| LoadError::pickle("string length overflows usize"))
    }

    /// Little-endian two's complement integer of `len` bytes.
    fn read_long(&mut self, len: usize) -> Result<i64, LoadError> {
        if len > 8 {
            return Err(LoadError::pickle(format!(
                "integer of {len} bytes does not fit in 64 bits"
            )));
        }
        let bytes = self.take(len)?;
        if bytes.is_empty() {
            return Ok(0);
        }
        let fill = if bytes[len - 1] & 0x80 != 0 { 0xff } else { 0x00 };
        let mut buf = [fill; 8];
        buf[..len].copy_from_slice(bytes);
        Ok(i64::from_le_bytes(buf))
    }

    fn read_line(&mut self) -> Result<String, LoadError> {
        let rest = &self.bytes[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| LoadError::pickle("GLOBAL operand is missing its newline"))?;
        let line = std::str::from_utf8(&rest[..end])
            .map_err(|e| LoadError::pickle(format!("invalid UTF-8 in GLOBAL operand: {e}")))?
            .to_string();
        self.pos += end + 1;
        Ok(line)
    }

    fn read_utf8(&mut self, len: usize) -> Result<String, LoadError> {
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| LoadError::pickle(format!("invalid UTF-8 string: {e}")))
    }
}

fn qualified_name(value: &Value) -> String {
    match value {
        Value::Global { module, name } => format!("{module}.{name}"),
        Value::Object(name) => name.clone(),
        _ => "object".to_string(),
    }
}

/// Resolves `('storage', storage_type, key, location, numel)`.
fn persistent_load(pid: Value) -> Result<Value, LoadError> {
    let Value::Tuple(items) = pid else {
        return Err(LoadError::pickle("persistent id is not a tuple"));
    };
    let [kind, storage_type, key, _location, numel] = items.as_slice() else {
        return Err(LoadError::pickle(format!(
            "persistent id has {} fields, expected 5",
            items.len()
        )));
    };

    match kind {
        Value::Str(s) if s == "storage" => {}
        _ => return Err(LoadError::pickle("persistent id is not a storage reference")),
    }
    let Value::Global { module, name } = storage_type else {
        return Err(LoadError::pickle("storage type is not a class reference"));
    };
    let Value::Str(key) = key else {
        return Err(LoadError::pickle("storage key is not a string"));
    };

    Ok(Value::Storage(StorageRef {
        dtype: storage_dtype(module, name)?,
        key: key.clone(),
        numel: as_usize(numel)?,
    }))
}

fn reduce(callable: Value, args: Value) -> Result<Value, LoadError> {
    let Value::Global { module, name } = &callable else {
        return Ok(Value::Object(qualified_name(&callable)));
    };
    let Value::Tuple(args) = args else {
        return Err(LoadError::pickle(format!(
            "{module}.{name} called without an argument tuple"
        )));
    };

    match (module.as_str(), name.as_str()) {
        ("collections", "OrderedDict") | ("builtins", "dict") => Ok(Value::new_dict()),
        ("torch._utils", "_rebuild_tensor_v2") => rebuild_tensor(&args),
        ("torch._utils", "_rebuild_parameter")
        | ("torch._utils", "_rebuild_parameter_with_state") => match args.into_iter().next() {
            Some(tensor @ Value::Tensor(_)) => Ok(tensor),
            _ => Err(LoadError::pickle("_rebuild_parameter expects a tensor")),
        },
        _ => Ok(Value::Object(format!("{module}.{name}"))),
    }
}

/// `_rebuild_tensor_v2(storage, offset, size, stride, requires_grad, hooks[, metadata])`
fn rebuild_tensor(args: &[Value]) -> Result<Value, LoadError> {
    if !(6..=7).contains(&args.len()) {
        return Err(LoadError::pickle(format!(
            "_rebuild_tensor_v2 expects 6 or 7 arguments, got {}",
            args.len()
        )));
    }
    let Value::Storage(storage) = &args[0] else {
        return Err(LoadError::pickle("_rebuild_tensor_v2 expects a storage"));
    };
    let shape = as_usizes(&args[2])?;
    let stride = as_usizes(&args[3])?;
    if shape.len() != stride.len() {
        return Err(LoadError::pickle(format!(
            "tensor has {} dimensions but {} strides",
            shape.len(),
            stride.len()
        )));
    }

    Ok(Value::Tensor(TensorSpec {
        storage: storage.clone(),
        offset: as_usize(&args[1])?,
        shape,
        stride,
    }))
}

fn as_usize(value: &Value) -> Result<usize, LoadError> {
    match value {
        Value::Int(i) => usize::try_from(*i)
            .map_err(|_| LoadError::pickle(format!("expected a non-negative integer, got {i}"))),
        _ => Err(LoadError::pickle("expected an integer")),
    }
}

fn as_usizes(value: &Value) -> Result<Vec<usize>, LoadError> {
    match value {
        Value::Tuple(items) => items.iter().map(as_usize).collect(),
        _ => Err(LoadError::pickle("expected a tuple of integers")),
    }
}
