//! Ragged `.npy` arrays.
//!
//! numpy saves a list of differently sized arrays as a one-dimensional `dtype=object` array. The
//! `.npy` header carries `'descr': '|O'` and the payload is a pickle of the whole ndarray: one
//! `_reconstruct` call per array, each followed by a `BUILD` whose state holds the shape, the dtype
//! and the raw element bytes. The outer array's state holds the list of inner arrays.
//!
//! Only the pickle opcodes numpy emits for such arrays are understood. Inner arrays must be
//! two-dimensional `f4` or `f8` arrays; they are returned as `f32`.
use crate::error::{Result, SurfScoreError};
use ndarray::{Array2, ShapeBuilder};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";
const PICKLE_PROTOCOL: u8 = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaggedNpyError {
    #[error("not an .npy file")]
    BadMagic,

    #[error("unsupported .npy format version {0}")]
    Version(u8),

    #[error("not an object array (header `{0}`)")]
    NotObjectArray(String),

    #[error("pickle payload ends early")]
    Truncated,

    #[error("unsupported pickle opcode 0x{0:02x}")]
    Opcode(u8),

    #[error("malformed pickle: {0}")]
    Malformed(&'static str),

    #[error("element {index}: {message}")]
    Element { index: usize, message: String },
}

type Decoded<T> = std::result::Result<T, RaggedNpyError>;

/// True when the `.npy` header describes an object array.
pub fn is_object_array(bytes: &[u8]) -> bool {
    matches!(npy_header(bytes), Ok((header, _)) if header_is_object(header))
}

/// Writes `blocks` the way `np.save` writes a `dtype=object` list of `float32` arrays.
pub fn write_ragged(path: &Path, blocks: &[Array2<f32>]) -> Result<()> {
    fs::write(path, encode_ragged(blocks)).map_err(SurfScoreError::io(path))
}

/// Decodes an object-array `.npy` file into one `f32` block per element.
pub fn decode_ragged(bytes: &[u8]) -> Decoded<Vec<Array2<f32>>> {
    let (header, payload) = npy_header(bytes)?;
    if !header_is_object(header) {
        return Err(RaggedNpyError::NotObjectArray(header.trim().to_string()));
    }
    let mut machine = Unpickler::new(payload);
    let root = machine.run()?;
    machine.ndarray_list(&root)
}

pub fn encode_ragged(blocks: &[Array2<f32>]) -> Vec<u8> {
    let mut pickle = PickleWriter::default();
    pickle.object_array(blocks);

    let header = format!(
        "{{'descr': '|O', 'fortran_order': False, 'shape': ({},), }}",
        blocks.len()
    );
    // magic, version and length prefix take 10 bytes; the header ends in '\n' on a 64-byte boundary
    let unpadded = NPY_MAGIC.len() + 4 + header.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    let header_len = header.len() + padding + 1;

    let mut out = Vec::with_capacity(unpadded + padding + pickle.buf.len());
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header_len as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    out.extend(std::iter::repeat(b' ').take(padding));
    out.push(b'\n');
    out.extend_from_slice(&pickle.buf);
    out
}

/// Splits an `.npy` file into its header dictionary text and the data that follows.
fn npy_header(bytes: &[u8]) -> Decoded<(&str, &[u8])> {
    if bytes.len() < 10 || &bytes[..6] != NPY_MAGIC {
        return Err(RaggedNpyError::BadMagic);
    }
    let (len, start) = match bytes[6] {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            let raw = bytes.get(8..12).ok_or(RaggedNpyError::BadMagic)?;
            (u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize, 12)
        }
        major => return Err(RaggedNpyError::Version(major)),
    };
    let header = bytes
        .get(start..start + len)
        .and_then(|h| std::str::from_utf8(h).ok())
        .ok_or(RaggedNpyError::BadMagic)?;
    Ok((header, &bytes[start + len..]))
}

fn header_is_object(header: &str) -> bool {
    header.contains("'descr': '|O'")
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    None,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Global(String, String),
    /// Index into the unpickler's object table, so `BUILD` is seen through every memo reference.
    Object(usize),
}

#[derive(Debug)]
struct Reduced {
    callable: Value,
    args: Vec<Value>,
    state: Option<Value>,
}

struct Unpickler<'a> {
    data: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    marks: Vec<usize>,
    memo: HashMap<u32, Value>,
    objects: Vec<Reduced>,
}

impl<'a> Unpickler<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
            objects: Vec::new(),
        }
    }

    fn take(&mut self, n: usize) -> Decoded<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(RaggedNpyError::Truncated)?;
        let slice = self.data.get(self.pos..end).ok_or(RaggedNpyError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Decoded<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Decoded<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Decoded<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Decoded<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn sized(&mut self, len: u64) -> Decoded<&'a [u8]> {
        let len = usize::try_from(len).map_err(|_| RaggedNpyError::Truncated)?;
        self.take(len)
    }

    fn line(&mut self) -> Decoded<String> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(RaggedNpyError::Truncated)?;
        let text = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(text)
    }

    fn text(&mut self, len: u64) -> Decoded<Value> {
        let raw = self.sized(len)?;
        std::str::from_utf8(raw)
            .map(|s| Value::Str(s.to_string()))
            .map_err(|_| RaggedNpyError::Malformed("string is not utf-8"))
    }

    fn pop(&mut self) -> Decoded<Value> {
        self.stack
            .pop()
            .ok_or(RaggedNpyError::Malformed("stack underflow"))
    }

    fn pop_mark(&mut self) -> Decoded<Vec<Value>> {
        let mark = self
            .marks
            .pop()
            .ok_or(RaggedNpyError::Malformed("no mark on the stack"))?;
        if mark > self.stack.len() {
            return Err(RaggedNpyError::Malformed("mark above the stack top"));
        }
        Ok(self.stack.split_off(mark))
    }

    fn pop_n(&mut self, n: usize) -> Decoded<Vec<Value>> {
        if self.stack.len() < n {
            return Err(RaggedNpyError::Malformed("stack underflow"));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn top(&mut self) -> Decoded<&mut Value> {
        self.stack
            .last_mut()
            .ok_or(RaggedNpyError::Malformed("stack underflow"))
    }

    fn put(&mut self, key: u32) -> Decoded<()> {
        let value = self
            .stack
            .last()
            .cloned()
            .ok_or(RaggedNpyError::Malformed("memoize on an empty stack"))?;
        self.memo.insert(key, value);
        Ok(())
    }

    fn get(&mut self, key: u32) -> Decoded<()> {
        let value = self
            .memo
            .get(&key)
            .cloned()
            .ok_or(RaggedNpyError::Malformed("unknown memo key"))?;
        self.stack.push(value);
        Ok(())
    }

    fn extend_top(&mut self, items: Vec<Value>) -> Decoded<()> {
        match self.top()? {
            Value::List(list) => {
                list.extend(items);
                Ok(())
            }
            _ => Err(RaggedNpyError::Malformed("append to a non-list")),
        }
    }

    /// Executes opcodes until `STOP` and returns the pickled value.
    fn run(&mut self) -> Decoded<Value> {
        loop {
            let op = self.byte()?;
            match op {
                0x80 => {
                    self.byte()?;
                }
                0x95 => {
                    self.u64()?;
                }
                b'.' => return self.pop(),
                b'(' => self.marks.push(self.stack.len()),
                b'0' => {
                    self.pop()?;
                }
                b'N' => self.stack.push(Value::None),
                0x88 => self.stack.push(Value::Bool(true)),
                0x89 => self.stack.push(Value::Bool(false)),
                b'K' => {
                    let v = self.byte()?;
                    self.stack.push(Value::Int(v.into()));
                }
                b'M' => {
                    let v = self.u16()?;
                    self.stack.push(Value::Int(v.into()));
                }
                b'J' => {
                    let v = self.u32()? as i32;
                    self.stack.push(Value::Int(v.into()));
                }
                0x8a => {
                    let n = self.byte()? as usize;
                    let raw = self.take(n)?;
                    if n > 8 {
                        return Err(RaggedNpyError::Malformed("integer wider than 64 bits"));
                    }
                    let fill = if raw.last().is_some_and(|b| b & 0x80 != 0) { 0xff } else { 0 };
                    let mut buf = [fill; 8];
                    buf[..n].copy_from_slice(raw);
                    self.stack.push(Value::Int(i64::from_le_bytes(buf)));
                }
                b'X' => {
                    let len = self.u32()?;
                    let v = self.text(len.into())?;
                    self.stack.push(v);
                }
                0x8c => {
                    let len = self.byte()?;
                    let v = self.text(len.into())?;
                    self.stack.push(v);
                }
                0x8d => {
                    let len = self.u64()?;
                    let v = self.text(len)?;
                    self.stack.push(v);
                }
                b'C' => {
                    let len = self.byte()?;
                    let raw = self.sized(len.into())?;
                    self.stack.push(Value::Bytes(raw.to_vec()));
                }
                b'B' => {
                    let len = self.u32()?;
                    let raw = self.sized(len.into())?;
                    self.stack.push(Value::Bytes(raw.to_vec()));
                }
                0x8e => {
                    let len = self.u64()?;
                    let raw = self.sized(len)?;
                    self.stack.push(Value::Bytes(raw.to_vec()));
                }
                b'c' => {
                    let module = self.line()?;
                    let name = self.line()?;
                    self.stack.push(Value::Global(module, name));
                }
                0x93 => match (self.pop()?, self.pop()?) {
                    (Value::Str(name), Value::Str(module)) => {
                        self.stack.push(Value::Global(module, name))
                    }
                    _ => return Err(RaggedNpyError::Malformed("STACK_GLOBAL needs two strings")),
                },
                b')' => self.stack.push(Value::Tuple(Vec::new())),
                b't' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Tuple(items));
                }
                0x85..=0x87 => {
                    let items = self.pop_n((op - 0x84) as usize)?;
                    self.stack.push(Value::Tuple(items));
                }
                b']' => self.stack.push(Value::List(Vec::new())),
                b'l' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::List(items));
                }
                b'a' => {
                    let item = self.pop()?;
                    self.extend_top(vec![item])?;
                }
                b'e' => {
                    let items = self.pop_mark()?;
                    self.extend_top(items)?;
                }
                b'q' => {
                    let key = self.byte()?;
                    self.put(key.into())?;
                }
                b'r' => {
                    let key = self.u32()?;
                    self.put(key)?;
                }
                0x94 => {
                    let key = self.memo.len() as u32;
                    self.put(key)?;
                }
                b'h' => {
                    let key = self.byte()?;
                    self.get(key.into())?;
                }
                b'j' => {
                    let key = self.u32()?;
                    self.get(key)?;
                }
                b'R' => {
                    let args = match self.pop()? {
                        Value::Tuple(args) => args,
                        _ => return Err(RaggedNpyError::Malformed("REDUCE arguments are not a tuple")),
                    };
                    let callable = self.pop()?;
                    self.objects.push(Reduced {
                        callable,
                        args,
                        state: None,
                    });
                    self.stack.push(Value::Object(self.objects.len() - 1));
                }
                b'b' => {
                    let state = self.pop()?;
                    let idx = match self.top()? {
                        Value::Object(idx) => *idx,
                        _ => return Err(RaggedNpyError::Malformed("BUILD on a non-object")),
                    };
                    self.objects[idx].state = Some(state);
                }
                other => return Err(RaggedNpyError::Opcode(other)),
            }
        }
    }

    fn object(&self, value: &Value) -> Decoded<&Reduced> {
        match value {
            Value::Object(idx) => Ok(&self.objects[*idx]),
            _ => Err(RaggedNpyError::Malformed("expected an ndarray")),
        }
    }

    /// The `(version, shape, dtype, is_fortran, data)` state of a reconstructed ndarray.
    fn ndarray_state<'v>(&'v self, value: &'v Value) -> Decoded<&'v [Value]> {
        let obj = self.object(value)?;
        let reconstruct = matches!(
            &obj.callable,
            Value::Global(module, name) if module.ends_with("multiarray") && name == "_reconstruct"
        );
        if !reconstruct {
            return Err(RaggedNpyError::Malformed("expected an ndarray"));
        }
        match &obj.state {
            Some(Value::Tuple(state)) if state.len() == 5 => Ok(state),
            _ => Err(RaggedNpyError::Malformed("ndarray state is not a 5-tuple")),
        }
    }

    /// Type code (`"f4"`, `"O8"`, ...) and byte order of a pickled `numpy.dtype`.
    fn dtype<'v>(&'v self, value: &'v Value) -> Decoded<(&'v str, &'v str)> {
        let obj = self.object(value)?;
        let code = match obj.args.first() {
            Some(Value::Str(code)) => code.as_str(),
            _ => return Err(RaggedNpyError::Malformed("dtype without a type code")),
        };
        let order = match &obj.state {
            Some(Value::Tuple(state)) => match state.get(1) {
                Some(Value::Str(order)) => order.as_str(),
                _ => "|",
            },
            _ => "|",
        };
        Ok((code, order))
    }

    fn ndarray_list(&self, root: &Value) -> Decoded<Vec<Array2<f32>>> {
        let state = self.ndarray_state(root)?;
        let (code, _) = self.dtype(&state[2])?;
        if !code.starts_with('O') {
            return Err(RaggedNpyError::Malformed("outer array is not an object array"));
        }
        let items = match &state[4] {
            Value::List(items) => items,
            _ => return Err(RaggedNpyError::Malformed("object array data is not a list")),
        };
        items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                self.block(item).map_err(|e| RaggedNpyError::Element {
                    index,
                    message: e.to_string(),
                })
            })
            .collect()
    }

    fn block(&self, value: &Value) -> Decoded<Array2<f32>> {
        let state = self.ndarray_state(value)?;
        let shape = match &state[1] {
            Value::Tuple(dims) => dims
                .iter()
                .map(|d| match d {
                    Value::Int(n) => usize::try_from(*n).ok(),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>(),
            _ => None,
        };
        let (rows, cols) = match shape.as_deref() {
            Some(&[rows, cols]) => (rows, cols),
            _ => return Err(RaggedNpyError::Malformed("element is not two-dimensional")),
        };
        let fortran = matches!(state[3], Value::Bool(true));
        let raw = match &state[4] {
            Value::Bytes(raw) => raw,
            _ => return Err(RaggedNpyError::Malformed("element data is not a byte string")),
        };

        let (code, order) = self.dtype(&state[2])?;
        let big_endian = order == ">";
        let values: Vec<f32> = match code {
            "f4" => raw
                .chunks_exact(4)
                .map(|c| {
                    let b = [c[0], c[1], c[2], c[3]];
                    if big_endian {
                        f32::from_be_bytes(b)
                    } else {
                        f32::from_le_bytes(b)
                    }
                })
                .collect(),
            "f8" => raw
                .chunks_exact(8)
                .map(|c| {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(c);
                    let v = if big_endian {
                        f64::from_be_bytes(b)
                    } else {
                        f64::from_le_bytes(b)
                    };
                    v as f32
                })
                .collect(),
            _ => return Err(RaggedNpyError::Malformed("element dtype is not f4 or f8")),
        };
        if values.len() != rows * cols {
            return Err(RaggedNpyError::Malformed("element data does not match its shape"));
        }
        let arr = Array2::from_shape_vec((rows, cols).set_f(fortran), values)
            .map_err(|_| RaggedNpyError::Malformed("element data does not match its shape"))?;
        Ok(arr.as_standard_layout().into_owned())
    }
}

/// Emits protocol 3 pickles shaped like numpy's, memoizing globals and dtypes.
#[derive(Default)]
struct PickleWriter {
    buf: Vec<u8>,
    memo: HashMap<String, u32>,
}

impl PickleWriter {
    fn recall(&mut self, key: &str) -> bool {
        match self.memo.get(key) {
            Some(&idx) => {
                self.get(idx);
                true
            }
            None => false,
        }
    }

    fn remember(&mut self, key: String) {
        let idx = self.memo.len() as u32;
        match u8::try_from(idx) {
            Ok(small) => self.buf.extend_from_slice(&[b'q', small]),
            Err(_) => {
                self.buf.push(b'r');
                self.buf.extend_from_slice(&idx.to_le_bytes());
            }
        }
        self.memo.insert(key, idx);
    }

    fn get(&mut self, idx: u32) {
        match u8::try_from(idx) {
            Ok(small) => self.buf.extend_from_slice(&[b'h', small]),
            Err(_) => {
                self.buf.push(b'j');
                self.buf.extend_from_slice(&idx.to_le_bytes());
            }
        }
    }

    fn global(&mut self, module: &str, name: &str) {
        let key = format!("{module}.{name}");
        if !self.recall(&key) {
            self.buf.push(b'c');
            self.buf.extend_from_slice(format!("{module}\n{name}\n").as_bytes());
            self.remember(key);
        }
    }

    fn int(&mut self, v: i64) {
        match v {
            0..=0xff => self.buf.extend_from_slice(&[b'K', v as u8]),
            0x100..=0xffff => {
                self.buf.push(b'M');
                self.buf.extend_from_slice(&(v as u16).to_le_bytes());
            }
            _ => {
                self.buf.push(b'J');
                self.buf.extend_from_slice(&(v as i32).to_le_bytes());
            }
        }
    }

    fn str(&mut self, s: &str) {
        self.buf.push(b'X');
        self.buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn bytes(&mut self, raw: &[u8]) {
        match u8::try_from(raw.len()) {
            Ok(len) => self.buf.extend_from_slice(&[b'C', len]),
            Err(_) => {
                self.buf.push(b'B');
                self.buf.extend_from_slice(&(raw.len() as u32).to_le_bytes());
            }
        }
        self.buf.extend_from_slice(raw);
    }

    /// `numpy.dtype(code, False, True)` with its `__setstate__` tuple.
    fn dtype(&mut self, code: &str, order: &str, flags: i64) {
        let key = format!("dtype:{order}{code}");
        if self.recall(&key) {
            return;
        }
        self.global("numpy", "dtype");
        self.str(code);
        self.buf.extend_from_slice(&[0x89, 0x88, 0x87, b'R']);
        self.remember(key);
        self.buf.push(b'(');
        self.int(3);
        self.str(order);
        self.buf.extend_from_slice(b"NNN");
        self.int(-1);
        self.int(-1);
        self.int(flags);
        self.buf.extend_from_slice(b"tb");
    }

    /// `_reconstruct(ndarray, (0,), b'b')`, leaving the new array on the stack.
    fn reconstruct(&mut self) {
        self.global("numpy.core.multiarray", "_reconstruct");
        self.global("numpy", "ndarray");
        self.int(0);
        self.buf.push(0x85);
        self.bytes(b"b");
        self.buf.extend_from_slice(&[0x87, b'R']);
    }

    fn block(&mut self, block: &Array2<f32>) {
        self.reconstruct();
        self.buf.push(b'(');
        self.int(1);
        self.int(block.nrows() as i64);
        self.int(block.ncols() as i64);
        self.buf.push(0x86);
        self.dtype("f4", "<", 0);
        self.buf.push(0x89);
        let raw: Vec<u8> = block.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.bytes(&raw);
        self.buf.extend_from_slice(b"tb");
    }

    fn object_array(&mut self, blocks: &[Array2<f32>]) {
        self.buf.extend_from_slice(&[0x80, PICKLE_PROTOCOL]);
        self.reconstruct();
        self.buf.push(b'(');
        self.int(1);
        self.int(blocks.len() as i64);
        self.buf.push(0x85);
        self.dtype("O8", "|", 63);
        self.buf.push(0x89);
        self.buf.push(b']');
        if !blocks.is_empty() {
            self.buf.push(b'(');
            for block in blocks {
                self.block(block);
            }
            self.buf.push(b'e');
        }
        self.buf.extend_from_slice(b"tb.");
    }
}
