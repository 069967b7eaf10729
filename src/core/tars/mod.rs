//! # Structured Binary Codec
//!
//! Tag-value encoding used for every protocol payload.
//!
//! ## Wire Format
//! ```text
//! head:  [tag:4 | type:4]            tag < 15
//!        [0xF  | type:4] [tag:8]     tag >= 15
//! body:  depends on type; integers shrink to the smallest type holding the value
//! ```
//!
//! ## Features
//! - **Variable-width integers**: decoders widen whatever width is on the wire
//! - **Shape-driven decoding**: fields are coerced into a declared [`Shape`], with
//!   required, optional and defaulted fields
//! - **Skip-to-tag**: unrelated fields, nested lists and structs included, are skipped
//!   by length computation without being materialized
//! - **Schema-less decoding**: [`decode_any`] for diagnostics and unknown packets
//!
//! ## Security
//! - Declared counts are checked against the remaining input before allocation
//! - Nesting depth is bounded by [`MAX_DEPTH`]

mod reader;
mod shape;
mod value;
mod writer;

pub use reader::{Head, TarsReader};
pub use shape::{FieldShape, Presence, Shape, StructShape};
pub use value::{Struct, Value, WireType};
pub use writer::TarsWriter;

use bytes::Bytes;

use crate::error::Result;

/// Maximum nesting of lists, maps and structs
pub const MAX_DEPTH: usize = 64;

/// Largest accepted long-string body
pub const MAX_STRING4_LEN: usize = 100 * 1024 * 1024;

/// Encode the fields of `value` as a top-level body (no begin/end markers)
pub fn encode(value: &Struct) -> Bytes {
    let mut writer = TarsWriter::with_capacity(64);
    writer.write_fields(value);
    writer.finish()
}

/// Encode a single field
pub fn encode_value(tag: u8, value: &Value) -> Bytes {
    let mut writer = TarsWriter::new();
    writer.write_value(tag, value);
    writer.finish()
}

/// Decode a top-level body against `shape`
pub fn decode(bytes: &[u8], shape: &StructShape) -> Result<Struct> {
    TarsReader::new(bytes).read_struct(shape, false)
}

/// Decode only the top-level field `tag`, skipping everything before it.
///
/// Returns the first occurrence, or `None` when the tag is absent.
pub fn decode_field(bytes: &[u8], tag: u8, shape: &Shape) -> Result<Option<Value>> {
    let mut reader = TarsReader::new(bytes);
    match reader.skip_to_tag(tag)? {
        Some(head) => reader.read_shaped(head, shape).map(Some),
        None => Ok(None),
    }
}

/// Decode a top-level body without a shape
pub fn decode_any(bytes: &[u8]) -> Result<Struct> {
    TarsReader::new(bytes).read_any_struct(false)
}

/// A Rust type with a fixed tag-value layout
pub trait Structured: Sized {
    fn shape() -> StructShape;

    fn to_struct(&self) -> Struct;

    fn from_struct(value: Struct) -> Result<Self>;

    fn to_bytes(&self) -> Bytes {
        encode(&self.to_struct())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_struct(decode(bytes, &Self::shape())?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;

    fn fixture() -> Struct {
        Struct::new()
            .with(0, 444i32)
            .with(
                1,
                Struct::new()
                    .with(0, 123i32)
                    .with(123, Struct::new().with(5, 123123i32)),
            )
            .with(4, 5i32)
    }

    #[test]
    fn test_nested_struct_fixture_round_trip() {
        let value = fixture();
        let bytes = encode(&value);
        let decoded = decode(&bytes, &StructShape::of(&value)).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_mixed_list_and_map_round_trip() {
        let value = Struct::new()
            .with(0, Value::List(vec![Value::Int(1), Value::String("a".into())]))
            .with(
                1,
                Value::Map(vec![
                    (Value::Int(1), Value::Bool(true)),
                    (Value::String("k".into()), Value::Struct(Struct::new().with(0, 9i32))),
                ]),
            )
            .with(2, Value::List(vec![Value::Long(3), Value::Long(4)]));
        let shape = StructShape::of(&value);
        assert!(matches!(shape.get(0).unwrap().shape, Shape::Tuple(_)));
        assert!(matches!(shape.get(1).unwrap().shape, Shape::Entries(_)));
        assert_eq!(shape.get(2).unwrap().shape, Shape::list_of(Shape::Long));

        let decoded = decode(&encode(&value), &shape).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_tuple_length_mismatch_rejected() {
        let bytes = encode(&Struct::new().with(0, Value::List(vec![Value::Int(1)])));
        let shape = StructShape::new().required(0, Shape::Tuple(vec![Shape::Int, Shape::Int]));
        assert!(matches!(
            decode(&bytes, &shape),
            Err(ProtocolError::MalformedEncoding(_))
        ));
    }

    #[test]
    fn test_head_layout() {
        // Int 444 fits a Short; tag 0
        assert_eq!(&encode_value(0, &Value::Int(444))[..], &[0x01, 0x01, 0xBC]);
        // Zero collapses to a bare head
        assert_eq!(&encode_value(3, &Value::Long(0))[..], &[0x3C]);
        // Tag 123 needs the escape byte
        assert_eq!(&encode_value(123, &Value::Byte(7))[..], &[0xF0, 123, 7]);
    }

    #[test]
    fn test_long_written_narrow_and_widened() {
        let bytes = encode(&Struct::new().with(2, 5i64));
        assert_eq!(&bytes[..], &[0x20, 5]);
        let shape = StructShape::new().required(2, Shape::Long);
        assert_eq!(decode(&bytes, &shape).unwrap().get(2), Some(&Value::Long(5)));
    }

    #[test]
    fn test_narrow_shape_rejects_wide_wire_type() {
        let bytes = encode(&Struct::new().with(0, 70_000i32));
        let shape = StructShape::new().required(0, Shape::Short);
        assert!(matches!(
            decode(&bytes, &shape),
            Err(ProtocolError::MalformedEncoding(_))
        ));
    }

    #[test]
    fn test_long_string_uses_string4() {
        let text = "x".repeat(300);
        let bytes = encode_value(1, &Value::String(text.clone()));
        assert_eq!(bytes[0], 0x10 | WireType::String4 as u8);
        let decoded = decode(&bytes, &StructShape::new().required(1, Shape::String)).unwrap();
        assert_eq!(decoded.require_str(1).unwrap(), text);
    }

    #[test]
    fn test_missing_required_and_defaults() {
        let bytes = encode(&Struct::new().with(0, 1i32));
        let shape = StructShape::new()
            .required(0, Shape::Int)
            .optional(1, Shape::String)
            .with_default(2, Shape::Bool, true);
        let decoded = decode(&bytes, &shape).unwrap();
        assert!(!decoded.contains(1));
        assert_eq!(decoded.get(2), Some(&Value::Bool(true)));

        let strict = StructShape::new().required(7, Shape::Int);
        assert!(matches!(
            decode(&bytes, &strict),
            Err(ProtocolError::MissingField { tag: 7 })
        ));
    }

    #[test]
    fn test_unknown_tags_are_skipped() {
        let value = fixture()
            .with(9, vec![Value::List(vec![Value::Int(1)]), Value::List(vec![])])
            .with(200, Value::Map(vec![(Value::from("k"), Value::from(vec![1u8, 2]))]));
        let bytes = encode(&value);
        let shape = StructShape::new().required(4, Shape::Int);
        let decoded = decode(&bytes, &shape).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.get(4), Some(&Value::Int(5)));
    }

    #[test]
    fn test_skip_to_tag_partial_decode() {
        let bytes = encode(&fixture());
        assert_eq!(
            decode_field(&bytes, 4, &Shape::Int).unwrap(),
            Some(Value::Int(5))
        );
        assert_eq!(decode_field(&bytes, 2, &Shape::Int).unwrap(), None);
    }

    #[test]
    fn test_fields_in_any_order() {
        let mut writer = TarsWriter::new();
        writer.write_i32(4, 5);
        writer.write_i32(0, 444);
        let bytes = writer.finish();
        let shape = StructShape::new()
            .required(0, Shape::Int)
            .required(4, Shape::Int);
        let decoded = decode(&bytes, &shape).unwrap();
        assert_eq!(decoded.require_i64(0).unwrap(), 444);
        assert_eq!(decoded.require_i64(4).unwrap(), 5);
    }

    #[test]
    fn test_truncated_input() {
        let bytes = encode(&fixture());
        let cut = &bytes[..bytes.len() - 3];
        assert!(matches!(
            decode(cut, &StructShape::of(&fixture())),
            Err(ProtocolError::MalformedEncoding(_))
        ));
    }

    #[test]
    fn test_unknown_wire_type() {
        assert!(matches!(
            decode_any(&[0x0E]),
            Err(ProtocolError::MalformedEncoding(_))
        ));
    }

    #[test]
    fn test_hostile_count_is_rejected() {
        // list at tag 0 claiming i32::MAX elements
        let mut writer = TarsWriter::new();
        writer.write_head(0, WireType::List);
        writer.write_i32(0, i32::MAX);
        let bytes = writer.finish();
        assert!(decode_any(&bytes).is_err());
    }

    #[test]
    fn test_depth_limit() {
        let mut writer = TarsWriter::new();
        for _ in 0..=MAX_DEPTH {
            writer.write_head(0, WireType::StructBegin);
        }
        let bytes = writer.finish();
        assert!(decode_any(&bytes).is_err());
    }

    #[test]
    fn test_byte_list_decodes_as_bytes() {
        let list = Value::List(vec![Value::Byte(1), Value::Byte(0), Value::Byte(-1)]);
        let bytes = encode_value(0, &list);
        let decoded = decode_field(&bytes, 0, &Shape::Bytes).unwrap().unwrap();
        assert_eq!(decoded, Value::Bytes(Bytes::from_static(&[1, 0, 0xFF])));
    }

    #[test]
    fn test_decode_any_reports_wire_widths() {
        let bytes = encode(&Struct::new().with(0, 0i64).with(1, 300i64).with(2, "hi"));
        let decoded = decode_any(&bytes).unwrap();
        assert_eq!(decoded.get(0), Some(&Value::Byte(0)));
        assert_eq!(decoded.get(1), Some(&Value::Short(300)));
        assert_eq!(decoded.get(2), Some(&Value::String("hi".into())));
    }

    struct Ping {
        id: i64,
        note: Option<String>,
    }

    impl Structured for Ping {
        fn shape() -> StructShape {
            StructShape::new()
                .required(0, Shape::Long)
                .optional(1, Shape::String)
        }

        fn to_struct(&self) -> Struct {
            let mut s = Struct::new().with(0, self.id);
            if let Some(note) = &self.note {
                s.insert(1, note.as_str());
            }
            s
        }

        fn from_struct(value: Struct) -> Result<Self> {
            Ok(Self {
                id: value.require_i64(0)?,
                note: value.get(1).and_then(Value::as_str).map(str::to_owned),
            })
        }
    }

    #[test]
    fn test_structured_trait() {
        let ping = Ping {
            id: 1 << 40,
            note: Some("ok".into()),
        };
        let back = Ping::from_bytes(&ping.to_bytes()).unwrap();
        assert_eq!(back.id, 1 << 40);
        assert_eq!(back.note.as_deref(), Some("ok"));
    }
}
