use bytes::Bytes;

use super::shape::{Shape, StructShape};
use super::value::{Struct, Value, WireType};
use super::{MAX_DEPTH, MAX_STRING4_LEN};
use crate::error::{constants, ProtocolError, Result};

/// Decoded field head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Head {
    pub tag: u8,
    pub ty: WireType,
}

/// Cursor over an encoded buffer.
///
/// The reader never trusts declared lengths: every count is checked against the bytes
/// that remain before anything is allocated.
#[derive(Debug)]
pub struct TarsReader<'a> {
    buf: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> TarsReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            depth: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtocolError::malformed(constants::ERR_TRUNCATED));
        }
        let buf: &'a [u8] = self.buf;
        let out = &buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_head(&mut self) -> Result<Head> {
        let [b] = self.take_array::<1>()?;
        let ty = WireType::try_from(b & 0x0F)?;
        let mut tag = b >> 4;
        if tag == 15 {
            let [escaped] = self.take_array::<1>()?;
            tag = escaped;
        }
        Ok(Head { tag, ty })
    }

    /// Head of the next field without consuming it
    pub fn peek_head(&mut self) -> Result<Head> {
        let start = self.pos;
        let head = self.read_head();
        self.pos = start;
        head
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ProtocolError::malformed(constants::ERR_DEPTH_EXCEEDED));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Integer payload of any integer wire type, widened
    pub fn read_int(&mut self, ty: WireType) -> Result<i64> {
        Ok(match ty {
            WireType::ZeroByte => 0,
            WireType::Byte => i8::from_be_bytes(self.take_array()?).into(),
            WireType::Short => i16::from_be_bytes(self.take_array()?).into(),
            WireType::Int => i32::from_be_bytes(self.take_array()?).into(),
            WireType::Long => i64::from_be_bytes(self.take_array()?),
            other => {
                return Err(ProtocolError::MalformedEncoding(format!(
                    "Expected integer, found {other:?}"
                )))
            }
        })
    }

    /// Element count of a list, map or simple list; always the next field at tag 0.
    ///
    /// Each element costs at least one byte, so counts above the remaining input are rejected.
    fn read_count(&mut self) -> Result<usize> {
        let head = self.read_head()?;
        if head.tag != 0 {
            return Err(ProtocolError::MalformedEncoding(format!(
                "Length field must use tag 0, found {}",
                head.tag
            )));
        }
        let len = self.read_int(head.ty)?;
        let len = usize::try_from(len)
            .map_err(|_| ProtocolError::malformed(constants::ERR_NEGATIVE_LENGTH))?;
        if len > self.remaining() {
            return Err(ProtocolError::malformed(constants::ERR_TRUNCATED));
        }
        Ok(len)
    }

    fn read_string_body(&mut self, ty: WireType) -> Result<String> {
        let len = match ty {
            WireType::String1 => usize::from(self.take_array::<1>()?[0]),
            WireType::String4 => {
                let len = u32::from_be_bytes(self.take_array()?) as usize;
                if len > MAX_STRING4_LEN {
                    return Err(ProtocolError::MalformedEncoding(format!(
                        "String length {len} exceeds limit"
                    )));
                }
                len
            }
            other => {
                return Err(ProtocolError::MalformedEncoding(format!(
                    "Expected string, found {other:?}"
                )))
            }
        };
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| ProtocolError::malformed(constants::ERR_INVALID_UTF8))
    }

    fn read_simple_list_body(&mut self) -> Result<Bytes> {
        let element = self.read_head()?;
        if element.ty != WireType::Byte {
            return Err(ProtocolError::MalformedEncoding(format!(
                "Simple list element type must be Byte, found {:?}",
                element.ty
            )));
        }
        let len = self.read_count()?;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    /// Skip one field body without materializing it
    pub fn skip_field(&mut self, ty: WireType) -> Result<()> {
        match ty {
            WireType::ZeroByte => {}
            WireType::Byte => {
                self.take(1)?;
            }
            WireType::Short => {
                self.take(2)?;
            }
            WireType::Int | WireType::Float => {
                self.take(4)?;
            }
            WireType::Long | WireType::Double => {
                self.take(8)?;
            }
            WireType::String1 => {
                let len = usize::from(self.take_array::<1>()?[0]);
                self.take(len)?;
            }
            WireType::String4 => {
                let len = u32::from_be_bytes(self.take_array()?) as usize;
                self.take(len)?;
            }
            WireType::SimpleList => {
                self.read_head()?;
                let len = self.read_count()?;
                self.take(len)?;
            }
            WireType::List => {
                self.enter()?;
                let count = self.read_count()?;
                for _ in 0..count {
                    let head = self.read_head()?;
                    self.skip_field(head.ty)?;
                }
                self.leave();
            }
            WireType::Map => {
                self.enter()?;
                let count = self.read_count()?;
                for _ in 0..count * 2 {
                    let head = self.read_head()?;
                    self.skip_field(head.ty)?;
                }
                self.leave();
            }
            WireType::StructBegin => self.skip_to_struct_end()?,
            WireType::StructEnd => {}
        }
        Ok(())
    }

    /// Skip every field up to and including the closing struct-end marker
    pub fn skip_to_struct_end(&mut self) -> Result<()> {
        self.enter()?;
        loop {
            let head = self.read_head()?;
            if head.ty == WireType::StructEnd {
                break;
            }
            self.skip_field(head.ty)?;
        }
        self.leave();
        Ok(())
    }

    /// Advance to the field carrying `tag` within the current struct level.
    ///
    /// Unrelated fields are skipped. Returns `None` once the level ends, leaving the
    /// struct-end marker unconsumed.
    pub fn skip_to_tag(&mut self, tag: u8) -> Result<Option<Head>> {
        while !self.is_empty() {
            let head = self.peek_head()?;
            if head.ty == WireType::StructEnd {
                return Ok(None);
            }
            self.read_head()?;
            if head.tag == tag {
                return Ok(Some(head));
            }
            self.skip_field(head.ty)?;
        }
        Ok(None)
    }

    /// Read one field body, coercing the wire type into `shape`
    pub fn read_shaped(&mut self, head: Head, shape: &Shape) -> Result<Value> {
        let ty = head.ty;
        let int_within = |max_rank: u8| ty.int_rank().is_some_and(|rank| rank <= max_rank);
        let mismatch = || {
            ProtocolError::MalformedEncoding(format!(
                "Tag {} has wire type {ty:?}, cannot decode as {shape:?}",
                head.tag
            ))
        };

        Ok(match shape {
            Shape::Any => self.read_any(head)?,
            Shape::Byte if int_within(1) => Value::Byte(self.read_int(ty)? as i8),
            Shape::Short if int_within(2) => Value::Short(self.read_int(ty)? as i16),
            Shape::Int if int_within(3) => Value::Int(self.read_int(ty)? as i32),
            Shape::Long if int_within(4) => Value::Long(self.read_int(ty)?),
            Shape::Bool if int_within(1) => match self.read_int(ty)? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                _ => return Err(ProtocolError::malformed(constants::ERR_INVALID_BOOL)),
            },
            Shape::Float => match ty {
                WireType::ZeroByte => Value::Float(0.0),
                WireType::Float => Value::Float(f32::from_be_bytes(self.take_array()?)),
                _ => return Err(mismatch()),
            },
            Shape::Double => match ty {
                WireType::ZeroByte => Value::Double(0.0),
                WireType::Float => Value::Double(f32::from_be_bytes(self.take_array()?).into()),
                WireType::Double => Value::Double(f64::from_be_bytes(self.take_array()?)),
                _ => return Err(mismatch()),
            },
            Shape::String if matches!(ty, WireType::String1 | WireType::String4) => {
                Value::String(self.read_string_body(ty)?)
            }
            Shape::Bytes => match ty {
                WireType::SimpleList => Value::Bytes(self.read_simple_list_body()?),
                WireType::List => {
                    self.enter()?;
                    let count = self.read_count()?;
                    let mut out = Vec::with_capacity(count);
                    for _ in 0..count {
                        let element = self.read_head()?;
                        if !element.ty.int_rank().is_some_and(|rank| rank <= 1) {
                            return Err(mismatch());
                        }
                        out.push(self.read_int(element.ty)? as u8);
                    }
                    self.leave();
                    Value::Bytes(out.into())
                }
                _ => return Err(mismatch()),
            },
            Shape::List(element) if ty == WireType::List => {
                self.enter()?;
                let count = self.read_count()?;
                let mut out = Vec::with_capacity(count);
                for _ in 0..count {
                    let head = self.read_head()?;
                    out.push(self.read_shaped(head, element)?);
                }
                self.leave();
                Value::List(out)
            }
            Shape::Map(key, value) if ty == WireType::Map => {
                self.enter()?;
                let count = self.read_count()?;
                let mut out = Vec::with_capacity(count);
                for _ in 0..count {
                    let k_head = self.read_head()?;
                    let k = self.read_shaped(k_head, key)?;
                    let v_head = self.read_head()?;
                    let v = self.read_shaped(v_head, value)?;
                    out.push((k, v));
                }
                self.leave();
                Value::Map(out)
            }
            Shape::Tuple(elements) if ty == WireType::List => {
                self.enter()?;
                if self.read_count()? != elements.len() {
                    return Err(mismatch());
                }
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    let head = self.read_head()?;
                    out.push(self.read_shaped(head, element)?);
                }
                self.leave();
                Value::List(out)
            }
            Shape::Entries(entries) if ty == WireType::Map => {
                self.enter()?;
                if self.read_count()? != entries.len() {
                    return Err(mismatch());
                }
                let mut out = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    let k_head = self.read_head()?;
                    let k = self.read_shaped(k_head, key)?;
                    let v_head = self.read_head()?;
                    let v = self.read_shaped(v_head, value)?;
                    out.push((k, v));
                }
                self.leave();
                Value::Map(out)
            }
            Shape::Struct(fields) if ty == WireType::StructBegin => {
                self.enter()?;
                let decoded = self.read_struct(fields, true)?;
                self.leave();
                Value::Struct(decoded)
            }
            _ => return Err(mismatch()),
        })
    }

    /// Read fields until the level ends (struct-end when `nested`, end of input otherwise).
    ///
    /// The first occurrence of a tag wins; unknown tags are skipped.
    pub fn read_struct(&mut self, shape: &StructShape, nested: bool) -> Result<Struct> {
        let mut out = Struct::new();
        loop {
            if !nested && self.is_empty() {
                break;
            }
            let head = self.read_head()?;
            if head.ty == WireType::StructEnd {
                break;
            }
            match shape.get(head.tag) {
                Some(field) if !out.contains(head.tag) => {
                    let value = self.read_shaped(head, &field.shape)?;
                    out.insert(head.tag, value);
                }
                _ => self.skip_field(head.ty)?,
            }
        }
        shape.complete(&mut out)?;
        Ok(out)
    }

    /// Natural value of a field without a declared shape
    pub fn read_any(&mut self, head: Head) -> Result<Value> {
        let ty = head.ty;
        Ok(match ty {
            WireType::ZeroByte | WireType::Byte => Value::Byte(self.read_int(ty)? as i8),
            WireType::Short => Value::Short(self.read_int(ty)? as i16),
            WireType::Int => Value::Int(self.read_int(ty)? as i32),
            WireType::Long => Value::Long(self.read_int(ty)?),
            WireType::Float => Value::Float(f32::from_be_bytes(self.take_array()?)),
            WireType::Double => Value::Double(f64::from_be_bytes(self.take_array()?)),
            WireType::String1 | WireType::String4 => Value::String(self.read_string_body(ty)?),
            WireType::SimpleList => Value::Bytes(self.read_simple_list_body()?),
            WireType::List => self.read_shaped(head, &Shape::list_of(Shape::Any))?,
            WireType::Map => self.read_shaped(head, &Shape::map_of(Shape::Any, Shape::Any))?,
            WireType::StructBegin => {
                self.enter()?;
                let decoded = self.read_any_struct(true)?;
                self.leave();
                Value::Struct(decoded)
            }
            WireType::StructEnd => {
                return Err(ProtocolError::malformed("Unexpected struct end"));
            }
        })
    }

    /// Every field of the current level, decoded by wire type
    pub fn read_any_struct(&mut self, nested: bool) -> Result<Struct> {
        let mut out = Struct::new();
        loop {
            if !nested && self.is_empty() {
                break;
            }
            let head = self.read_head()?;
            if head.ty == WireType::StructEnd {
                break;
            }
            if out.contains(head.tag) {
                self.skip_field(head.ty)?;
            } else {
                let value = self.read_any(head)?;
                out.insert(head.tag, value);
            }
        }
        Ok(out)
    }
}
