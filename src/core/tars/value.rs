use bytes::Bytes;
use std::collections::BTreeMap;

use crate::error::{ProtocolError, Result};

/// Wire type nibble carried in every field head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WireType {
    Byte = 0,
    Short = 1,
    Int = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    String1 = 6,
    String4 = 7,
    Map = 8,
    List = 9,
    StructBegin = 10,
    StructEnd = 11,
    ZeroByte = 12,
    SimpleList = 13,
}

impl WireType {
    /// Width rank for integer wire types, used when widening on read
    pub(crate) fn int_rank(self) -> Option<u8> {
        match self {
            WireType::ZeroByte => Some(0),
            WireType::Byte => Some(1),
            WireType::Short => Some(2),
            WireType::Int => Some(3),
            WireType::Long => Some(4),
            _ => None,
        }
    }
}

impl TryFrom<u8> for WireType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => WireType::Byte,
            1 => WireType::Short,
            2 => WireType::Int,
            3 => WireType::Long,
            4 => WireType::Float,
            5 => WireType::Double,
            6 => WireType::String1,
            7 => WireType::String4,
            8 => WireType::Map,
            9 => WireType::List,
            10 => WireType::StructBegin,
            11 => WireType::StructEnd,
            12 => WireType::ZeroByte,
            13 => WireType::SimpleList,
            other => {
                return Err(ProtocolError::MalformedEncoding(format!(
                    "Unknown wire type {other}"
                )))
            }
        })
    }
}

/// In-memory form of any tag-value encoded datum
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    String(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Struct(Struct),
}

impl Value {
    /// Any integer variant widened to `i64`
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Byte(v) => Some(v.into()),
            Value::Short(v) => Some(v.into()),
            Value::Int(v) => Some(v.into()),
            Value::Long(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&Struct> {
        match self {
            Value::Struct(s) => Some(s),
            _ => None,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v.into())
            }
        })*
    };
}

value_from! {
    i8 => Byte,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    bool => Bool,
    String => String,
    &str => String,
    Bytes => Bytes,
    Vec<u8> => Bytes,
    Struct => Struct,
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

/// A struct body: fields keyed by tag, iterated in ascending tag order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Struct {
    fields: BTreeMap<u8, Value>,
}

impl Struct {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, tag: u8, value: impl Into<Value>) -> Self {
        self.fields.insert(tag, value.into());
        self
    }

    pub fn insert(&mut self, tag: u8, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(tag, value.into())
    }

    pub fn get(&self, tag: u8) -> Option<&Value> {
        self.fields.get(&tag)
    }

    pub fn remove(&mut self, tag: u8) -> Option<Value> {
        self.fields.remove(&tag)
    }

    pub fn contains(&self, tag: u8) -> bool {
        self.fields.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &Value)> {
        self.fields.iter().map(|(tag, value)| (*tag, value))
    }

    /// Integer field widened to `i64`, or `MissingField`
    pub fn require_i64(&self, tag: u8) -> Result<i64> {
        self.get(tag)
            .and_then(Value::as_i64)
            .ok_or(ProtocolError::MissingField { tag })
    }

    pub fn require_bytes(&self, tag: u8) -> Result<&Bytes> {
        self.get(tag)
            .and_then(Value::as_bytes)
            .ok_or(ProtocolError::MissingField { tag })
    }

    pub fn require_str(&self, tag: u8) -> Result<&str> {
        self.get(tag)
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField { tag })
    }
}

impl FromIterator<(u8, Value)> for Struct {
    fn from_iter<I: IntoIterator<Item = (u8, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Struct {
    type Item = (u8, Value);
    type IntoIter = std::collections::btree_map::IntoIter<u8, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}
