//! Compact tagged binary format used for data frames.
//!
//! Every node is a one-byte type tag followed by its payload. Object members
//! carry their name in front of the tag:
//!
//! ```text
//! member  := [name_len: u32 BE][name: name_len bytes] node
//! node    := '{' member* '}'
//!          | '[' node* ']'
//!          | 'S' [len: u32 BE][len bytes]
//!          | 'B' [len: u32 BE][len bytes]
//!          | 'l' [i32 BE]
//!          | 'L' [i64 BE]
//!          | 'D' [f64 BE]
//! ```
//!
//! Strings and names are narrow: one byte per UTF-16 code unit, keeping only
//! the low byte. Text outside Latin-1 does not survive a round trip.
//!
//! The encoder computes an upper bound for the whole tree first and writes
//! into a buffer of exactly that capacity. The decoder yields a
//! [`serde_json::Value`], with blobs rendered as base64 strings.

use crate::error::CodecError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{Map, Number, Value};

pub const TAG_OBJECT_BEGIN: u8 = b'{';
pub const TAG_OBJECT_END: u8 = b'}';
pub const TAG_ARRAY_BEGIN: u8 = b'[';
pub const TAG_ARRAY_END: u8 = b']';
pub const TAG_STRING: u8 = b'S';
pub const TAG_INT32: u8 = b'l';
pub const TAG_INT64: u8 = b'L';
pub const TAG_BLOB: u8 = b'B';
pub const TAG_DOUBLE: u8 = b'D';

/// Fixed per-node allowance in the size pre-pass: tag plus a length word.
const NODE_OVERHEAD: usize = 5;

/// Maximum container nesting accepted by the decoder.
pub const MAX_DEPTH: usize = 128;

/// A tree the encoder can write.
///
/// There is no floating-point or boolean variant: outbound floats and
/// booleans travel as strings.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Object(Vec<(String, WireValue)>),
    Array(Vec<WireValue>),
    String(String),
    Int32(i32),
    Int64(i64),
    Blob(Bytes),
}

impl WireValue {
    /// Converts a JSON value. Returns `None` for `null`, which has no wire form.
    ///
    /// Nulls nested in objects or arrays are skipped.
    pub fn from_json(value: &Value) -> Option<WireValue> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(WireValue::String(b.to_string())),
            Value::Number(n) => Some(number_to_wire(n)),
            Value::String(s) => Some(WireValue::String(s.clone())),
            Value::Array(items) => Some(WireValue::Array(
                items.iter().filter_map(WireValue::from_json).collect(),
            )),
            Value::Object(map) => Some(WireValue::Object(
                map.iter()
                    .filter_map(|(k, v)| WireValue::from_json(v).map(|w| (k.clone(), w)))
                    .collect(),
            )),
        }
    }

    /// The JSON value the decoder produces for this tree.
    pub fn to_json(&self) -> Value {
        match self {
            WireValue::Object(members) => {
                let mut map = Map::with_capacity(members.len());
                for (name, value) in members {
                    map.insert(narrow(name), value.to_json());
                }
                Value::Object(map)
            }
            WireValue::Array(items) => Value::Array(items.iter().map(WireValue::to_json).collect()),
            WireValue::String(s) => Value::String(narrow(s)),
            WireValue::Int32(v) => Value::from(*v),
            WireValue::Int64(v) => Value::from(*v),
            WireValue::Blob(b) => Value::String(BASE64.encode(b)),
        }
    }

    /// Upper bound on the encoded size of this tree.
    pub fn size_bound(&self) -> usize {
        self.node_bound(None)
    }

    fn node_bound(&self, name: Option<&str>) -> usize {
        let name_cost = name.map_or(0, |n| 4 + n.encode_utf16().count() * 2);
        let payload = match self {
            WireValue::Object(members) => {
                members
                    .iter()
                    .map(|(n, v)| v.node_bound(Some(n)))
                    .sum::<usize>()
                    + 1
            }
            WireValue::Array(items) => items.iter().map(|v| v.node_bound(None)).sum::<usize>() + 1,
            WireValue::String(s) => s.encode_utf16().count() * 2,
            WireValue::Int32(_) => 4,
            WireValue::Int64(_) => 8,
            WireValue::Blob(b) => b.len(),
        };
        NODE_OVERHEAD + name_cost + payload
    }
}

impl From<&str> for WireValue {
    fn from(s: &str) -> Self {
        WireValue::String(s.to_string())
    }
}

impl From<String> for WireValue {
    fn from(s: String) -> Self {
        WireValue::String(s)
    }
}

impl From<i32> for WireValue {
    fn from(v: i32) -> Self {
        WireValue::Int32(v)
    }
}

impl From<i64> for WireValue {
    fn from(v: i64) -> Self {
        WireValue::Int64(v)
    }
}

impl From<bool> for WireValue {
    fn from(v: bool) -> Self {
        WireValue::String(v.to_string())
    }
}

impl From<Bytes> for WireValue {
    fn from(b: Bytes) -> Self {
        WireValue::Blob(b)
    }
}

fn number_to_wire(n: &Number) -> WireValue {
    if let Some(v) = n.as_i64() {
        match i32::try_from(v) {
            Ok(small) => WireValue::Int32(small),
            Err(_) => WireValue::Int64(v),
        }
    } else {
        // u64 above i64::MAX and all floats
        WireValue::String(n.to_string())
    }
}

/// Applies the low-byte narrowing the wire performs on text.
fn narrow(s: &str) -> String {
    s.encode_utf16().map(|u| char::from(u as u8)).collect()
}

/// Writes [`WireValue`] trees.
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    /// Encodes a tree into a buffer sized by [`WireValue::size_bound`].
    pub fn encode(value: &WireValue) -> Bytes {
        let bound = value.size_bound();
        let mut encoder = Encoder {
            buf: BytesMut::with_capacity(bound),
        };
        encoder.write_node(value);
        debug_assert!(encoder.buf.len() <= bound);
        encoder.buf.freeze()
    }

    /// Encodes a JSON value. `null` encodes as an empty object.
    pub fn encode_json(value: &Value) -> Bytes {
        let wire = WireValue::from_json(value).unwrap_or(WireValue::Object(Vec::new()));
        Self::encode(&wire)
    }

    fn write_node(&mut self, value: &WireValue) {
        match value {
            WireValue::Object(members) => {
                self.buf.put_u8(TAG_OBJECT_BEGIN);
                for (name, member) in members {
                    self.write_narrow(name);
                    self.write_node(member);
                }
                self.buf.put_u8(TAG_OBJECT_END);
            }
            WireValue::Array(items) => {
                self.buf.put_u8(TAG_ARRAY_BEGIN);
                for item in items {
                    self.write_node(item);
                }
                self.buf.put_u8(TAG_ARRAY_END);
            }
            WireValue::String(s) => {
                self.buf.put_u8(TAG_STRING);
                self.write_narrow(s);
            }
            WireValue::Int32(v) => {
                self.buf.put_u8(TAG_INT32);
                self.buf.put_i32(*v);
            }
            WireValue::Int64(v) => {
                self.buf.put_u8(TAG_INT64);
                self.buf.put_i64(*v);
            }
            WireValue::Blob(b) => {
                self.buf.put_u8(TAG_BLOB);
                self.buf.put_u32(b.len() as u32);
                self.buf.put_slice(b);
            }
        }
    }

    fn write_narrow(&mut self, s: &str) {
        let units = s.encode_utf16().count();
        self.buf.put_u32(units as u32);
        for unit in s.encode_utf16() {
            self.buf.put_u8(unit as u8);
        }
    }
}

/// Reads a single encoded tree.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            depth: 0,
        }
    }

    /// Decodes the root node.
    pub fn decode(mut self) -> Result<Value, CodecError> {
        if self.buf.is_empty() {
            return Err(CodecError::Empty);
        }
        self.read_node()
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if n > self.remaining() {
            return Err(CodecError::Truncated {
                offset: self.pos,
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn peek(&self) -> Result<u8, CodecError> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(CodecError::Truncated {
                offset: self.pos,
                needed: 1,
                available: 0,
            })
    }

    fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_len(&mut self) -> Result<usize, CodecError> {
        Ok(u32::from_be_bytes(self.read_fixed()?) as usize)
    }

    fn read_narrow(&mut self) -> Result<String, CodecError> {
        let len = self.read_len()?;
        Ok(self.take(len)?.iter().map(|&b| char::from(b)).collect())
    }

    fn enter(&mut self) -> Result<(), CodecError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(CodecError::TooDeep(MAX_DEPTH));
        }
        Ok(())
    }

    fn read_node(&mut self) -> Result<Value, CodecError> {
        let offset = self.pos;
        let tag = self.take(1)?[0];
        match tag {
            TAG_OBJECT_BEGIN => self.read_object(),
            TAG_ARRAY_BEGIN => self.read_list(),
            TAG_STRING => Ok(Value::String(self.read_narrow()?)),
            TAG_BLOB => {
                let len = self.read_len()?;
                Ok(Value::String(BASE64.encode(self.take(len)?)))
            }
            TAG_INT32 => Ok(Value::from(i32::from_be_bytes(self.read_fixed()?))),
            TAG_INT64 => Ok(Value::from(i64::from_be_bytes(self.read_fixed()?))),
            TAG_DOUBLE => {
                let v = f64::from_be_bytes(self.read_fixed()?);
                Ok(Number::from_f64(v).map_or(Value::Null, Value::Number))
            }
            other => Err(CodecError::UnknownTag { tag: other, offset }),
        }
    }

    fn read_object(&mut self) -> Result<Value, CodecError> {
        self.enter()?;
        let mut map = Map::new();
        loop {
            if self.peek()? == TAG_OBJECT_END {
                self.pos += 1;
                break;
            }
            let name = self.read_narrow()?;
            let value = self.read_node()?;
            map.insert(name, value);
        }
        self.depth -= 1;
        Ok(Value::Object(map))
    }

    fn read_list(&mut self) -> Result<Value, CodecError> {
        self.enter()?;
        let mut items = Vec::new();
        loop {
            if self.peek()? == TAG_ARRAY_END {
                self.pos += 1;
                break;
            }
            items.push(self.read_node()?);
        }
        self.depth -= 1;
        Ok(Value::Array(items))
    }
}

/// Encodes a tree.
pub fn encode(value: &WireValue) -> Bytes {
    Encoder::encode(value)
}

/// Decodes a buffer holding one tree.
pub fn decode(buf: &[u8]) -> Result<Value, CodecError> {
    Decoder::new(buf).decode()
}
