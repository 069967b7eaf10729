use bytes::{BufMut, Bytes, BytesMut};

use super::value::{Struct, Value, WireType};

/// Streaming encoder for tag-value fields.
///
/// Integers are written in the narrowest wire type that holds the value, so a
/// `Long` of 5 costs two bytes and a zero costs only its head.
#[derive(Debug, Default)]
pub struct TarsWriter {
    buf: BytesMut,
}

impl TarsWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn write_head(&mut self, tag: u8, ty: WireType) {
        if tag < 15 {
            self.buf.put_u8((tag << 4) | ty as u8);
        } else {
            self.buf.put_u8(0xF0 | ty as u8);
            self.buf.put_u8(tag);
        }
    }

    pub fn write_i8(&mut self, tag: u8, v: i8) {
        if v == 0 {
            self.write_head(tag, WireType::ZeroByte);
        } else {
            self.write_head(tag, WireType::Byte);
            self.buf.put_i8(v);
        }
    }

    pub fn write_i16(&mut self, tag: u8, v: i16) {
        match i8::try_from(v) {
            Ok(narrow) => self.write_i8(tag, narrow),
            Err(_) => {
                self.write_head(tag, WireType::Short);
                self.buf.put_i16(v);
            }
        }
    }

    pub fn write_i32(&mut self, tag: u8, v: i32) {
        match i16::try_from(v) {
            Ok(narrow) => self.write_i16(tag, narrow),
            Err(_) => {
                self.write_head(tag, WireType::Int);
                self.buf.put_i32(v);
            }
        }
    }

    pub fn write_i64(&mut self, tag: u8, v: i64) {
        match i32::try_from(v) {
            Ok(narrow) => self.write_i32(tag, narrow),
            Err(_) => {
                self.write_head(tag, WireType::Long);
                self.buf.put_i64(v);
            }
        }
    }

    pub fn write_bool(&mut self, tag: u8, v: bool) {
        self.write_i8(tag, i8::from(v));
    }

    pub fn write_f32(&mut self, tag: u8, v: f32) {
        self.write_head(tag, WireType::Float);
        self.buf.put_f32(v);
    }

    pub fn write_f64(&mut self, tag: u8, v: f64) {
        self.write_head(tag, WireType::Double);
        self.buf.put_f64(v);
    }

    pub fn write_string(&mut self, tag: u8, v: &str) {
        let bytes = v.as_bytes();
        match u8::try_from(bytes.len()) {
            Ok(len) => {
                self.write_head(tag, WireType::String1);
                self.buf.put_u8(len);
            }
            Err(_) => {
                self.write_head(tag, WireType::String4);
                self.buf.put_u32(bytes.len() as u32);
            }
        }
        self.buf.put_slice(bytes);
    }

    /// Raw bytes as a simple list: element-type head, length field, payload
    pub fn write_bytes(&mut self, tag: u8, v: &[u8]) {
        self.write_head(tag, WireType::SimpleList);
        self.write_head(0, WireType::Byte);
        self.write_len(v.len());
        self.buf.put_slice(v);
    }

    pub fn write_list(&mut self, tag: u8, items: &[Value]) {
        self.write_head(tag, WireType::List);
        self.write_len(items.len());
        for item in items {
            self.write_value(0, item);
        }
    }

    pub fn write_map(&mut self, tag: u8, entries: &[(Value, Value)]) {
        self.write_head(tag, WireType::Map);
        self.write_len(entries.len());
        for (key, value) in entries {
            self.write_value(0, key);
            self.write_value(1, value);
        }
    }

    pub fn write_struct(&mut self, tag: u8, value: &Struct) {
        self.write_head(tag, WireType::StructBegin);
        self.write_fields(value);
        self.write_head(0, WireType::StructEnd);
    }

    /// Fields of `value` without begin/end markers, as used for packet bodies
    pub fn write_fields(&mut self, value: &Struct) {
        for (tag, field) in value.iter() {
            self.write_value(tag, field);
        }
    }

    pub fn write_value(&mut self, tag: u8, value: &Value) {
        match value {
            Value::Byte(v) => self.write_i8(tag, *v),
            Value::Short(v) => self.write_i16(tag, *v),
            Value::Int(v) => self.write_i32(tag, *v),
            Value::Long(v) => self.write_i64(tag, *v),
            Value::Float(v) => self.write_f32(tag, *v),
            Value::Double(v) => self.write_f64(tag, *v),
            Value::Bool(v) => self.write_bool(tag, *v),
            Value::String(v) => self.write_string(tag, v),
            Value::Bytes(v) => self.write_bytes(tag, v),
            Value::List(items) => self.write_list(tag, items),
            Value::Map(entries) => self.write_map(tag, entries),
            Value::Struct(s) => self.write_struct(tag, s),
        }
    }

    // Counts are bounded by the payload limit, far below i32::MAX
    fn write_len(&mut self, len: usize) {
        self.write_i32(0, i32::try_from(len).unwrap_or(i32::MAX));
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}
