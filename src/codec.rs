//! Row payload codec.
//!
//! Payload bytes are opaque to frames. Tables and indexes resolve a [`Schema`]
//! once at registration time and use a [`Codec`] built from it to move between
//! typed values and the bytes stored after each row header.

use std::fmt::Display;

use crate::error::{FrameError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Int,
    Long,
    Bool,
    Text,
    Bytes,
}

/// A single column value. Ordering is by variant first, then by value, so keys
/// of one schema always compare column-wise.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Int(i32),
    Long(i64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Int(_) => ColumnType::Int,
            Value::Long(_) => ColumnType::Long,
            Value::Bool(_) => ColumnType::Bool,
            Value::Text(_) => ColumnType::Text,
            Value::Bytes(_) => ColumnType::Bytes,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "'{v}'"),
            Value::Bytes(v) => write!(f, "0x{}", v.iter().map(|b| format!("{b:02x}")).collect::<String>()),
        }
    }
}

/// An index key: the ordered key-column values of one index entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(pub Vec<Value>);

impl Key {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key(vec![Value::Long(value)])
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, ")")
    }
}

/// Static column list for a table or an index key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<ColumnType>,
}

impl Schema {
    pub fn new(columns: Vec<ColumnType>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[ColumnType] {
        &self.columns
    }
}

pub trait Codec: Send + Sync {
    fn encode(&self, values: &[Value]) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>>;
}

/// Fixed-width big-endian integers, one byte for booleans, and a 4-byte length
/// prefix for variable-length columns.
#[derive(Debug, Clone)]
pub struct SchemaCodec {
    schema: Schema,
}

impl SchemaCodec {
    const INT_BYTES: usize = 4;
    const LONG_BYTES: usize = 8;

    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn encode_key(&self, key: &Key) -> Result<Vec<u8>> {
        self.encode(key.values())
    }

    pub fn decode_key(&self, bytes: &[u8]) -> Result<Key> {
        self.decode(bytes).map(Key)
    }

    fn take<'a>(bytes: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8]> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                FrameError::Codec(format!(
                    "payload truncated: need {len} bytes at offset {offset}, have {}",
                    bytes.len()
                ))
            })?;
        let slice = &bytes[*offset..end];
        *offset = end;
        Ok(slice)
    }
}

impl Codec for SchemaCodec {
    fn encode(&self, values: &[Value]) -> Result<Vec<u8>> {
        if values.len() != self.schema.columns.len() {
            return Err(FrameError::Codec(format!(
                "expected {} values, got {}",
                self.schema.columns.len(),
                values.len()
            )));
        }
        let mut out = Vec::new();
        for (column, value) in self.schema.columns.iter().zip(values) {
            match (column, value) {
                (ColumnType::Int, Value::Int(v)) => out.extend_from_slice(&v.to_be_bytes()),
                (ColumnType::Long, Value::Long(v)) => out.extend_from_slice(&v.to_be_bytes()),
                (ColumnType::Bool, Value::Bool(v)) => out.push(u8::from(*v)),
                (ColumnType::Text, Value::Text(v)) => {
                    out.extend_from_slice(&(v.len() as u32).to_be_bytes());
                    out.extend_from_slice(v.as_bytes());
                }
                (ColumnType::Bytes, Value::Bytes(v)) => {
                    out.extend_from_slice(&(v.len() as u32).to_be_bytes());
                    out.extend_from_slice(v);
                }
                (column, value) => {
                    return Err(FrameError::Codec(format!(
                        "value {value} does not match column type {column:?}"
                    )))
                }
            }
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>> {
        let mut offset = 0;
        let mut values = Vec::with_capacity(self.schema.columns.len());
        for column in &self.schema.columns {
            let value = match column {
                ColumnType::Int => {
                    let raw = Self::take(bytes, &mut offset, Self::INT_BYTES)?;
                    Value::Int(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
                }
                ColumnType::Long => {
                    let raw = Self::take(bytes, &mut offset, Self::LONG_BYTES)?;
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(raw);
                    Value::Long(i64::from_be_bytes(buf))
                }
                ColumnType::Bool => {
                    let raw = Self::take(bytes, &mut offset, 1)?;
                    Value::Bool(raw[0] != 0)
                }
                ColumnType::Text | ColumnType::Bytes => {
                    let raw = Self::take(bytes, &mut offset, Self::INT_BYTES)?;
                    let len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
                    let data = Self::take(bytes, &mut offset, len)?.to_vec();
                    if *column == ColumnType::Text {
                        Value::Text(
                            String::from_utf8(data)
                                .map_err(|e| FrameError::Codec(format!("invalid utf-8: {e}")))?,
                        )
                    } else {
                        Value::Bytes(data)
                    }
                }
            };
            values.push(value);
        }
        if offset != bytes.len() {
            return Err(FrameError::Codec(format!(
                "{} trailing bytes after last column",
                bytes.len() - offset
            )));
        }
        Ok(values)
    }
}
