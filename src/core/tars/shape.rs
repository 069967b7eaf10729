use super::value::{Struct, Value};
use crate::error::{ProtocolError, Result};

/// Declared type a decoder coerces the wire data into
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Bool,
    String,
    Bytes,
    List(Box<Shape>),
    Map(Box<Shape>, Box<Shape>),
    /// A list of exactly these element shapes, in order
    Tuple(Vec<Shape>),
    /// A map of exactly these key and value shapes, in wire order
    Entries(Vec<(Shape, Shape)>),
    Struct(StructShape),
    /// Whatever the wire type naturally decodes to
    Any,
}

impl Shape {
    pub fn list_of(element: Shape) -> Self {
        Shape::List(Box::new(element))
    }

    pub fn map_of(key: Shape, value: Shape) -> Self {
        Shape::Map(Box::new(key), Box::new(value))
    }

    /// Infer the shape that decodes `value`'s own encoding back to `value`.
    ///
    /// Lists and maps whose entries share one shape get `List`/`Map`; mixed ones get
    /// a positional `Tuple`/`Entries`.
    pub fn of(value: &Value) -> Shape {
        match value {
            Value::Byte(_) => Shape::Byte,
            Value::Short(_) => Shape::Short,
            Value::Int(_) => Shape::Int,
            Value::Long(_) => Shape::Long,
            Value::Float(_) => Shape::Float,
            Value::Double(_) => Shape::Double,
            Value::Bool(_) => Shape::Bool,
            Value::String(_) => Shape::String,
            Value::Bytes(_) => Shape::Bytes,
            Value::List(items) => {
                let shapes: Vec<Shape> = items.iter().map(Shape::of).collect();
                match shapes.first() {
                    None => Shape::list_of(Shape::Any),
                    Some(first) if shapes.iter().all(|s| s == first) => Shape::list_of(first.clone()),
                    Some(_) => Shape::Tuple(shapes),
                }
            }
            Value::Map(entries) => {
                let shapes: Vec<(Shape, Shape)> = entries
                    .iter()
                    .map(|(k, v)| (Shape::of(k), Shape::of(v)))
                    .collect();
                match shapes.first() {
                    None => Shape::map_of(Shape::Any, Shape::Any),
                    Some(first) if shapes.iter().all(|s| s == first) => {
                        Shape::map_of(first.0.clone(), first.1.clone())
                    }
                    Some(_) => Shape::Entries(shapes),
                }
            }
            Value::Struct(s) => Shape::Struct(StructShape::of(s)),
        }
    }
}

/// How a decoder treats a field that is absent on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Presence {
    Required,
    Optional,
    Default(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldShape {
    pub tag: u8,
    pub shape: Shape,
    pub presence: Presence,
}

/// Field declarations of one struct, looked up by tag
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructShape {
    fields: Vec<FieldShape>,
}

impl StructShape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(self, tag: u8, shape: Shape) -> Self {
        self.field(tag, shape, Presence::Required)
    }

    pub fn optional(self, tag: u8, shape: Shape) -> Self {
        self.field(tag, shape, Presence::Optional)
    }

    pub fn with_default(self, tag: u8, shape: Shape, default: impl Into<Value>) -> Self {
        self.field(tag, shape, Presence::Default(default.into()))
    }

    fn field(mut self, tag: u8, shape: Shape, presence: Presence) -> Self {
        self.fields.retain(|f| f.tag != tag);
        self.fields.push(FieldShape {
            tag,
            shape,
            presence,
        });
        self
    }

    /// Every field of `value` becomes a required field of its own shape
    pub fn of(value: &Struct) -> Self {
        Self {
            fields: value
                .iter()
                .map(|(tag, v)| FieldShape {
                    tag,
                    shape: Shape::of(v),
                    presence: Presence::Required,
                })
                .collect(),
        }
    }

    pub fn get(&self, tag: u8) -> Option<&FieldShape> {
        self.fields.iter().find(|f| f.tag == tag)
    }

    pub fn fields(&self) -> &[FieldShape] {
        &self.fields
    }

    /// Fill defaults and reject missing required fields
    pub(crate) fn complete(&self, decoded: &mut Struct) -> Result<()> {
        for field in &self.fields {
            if decoded.contains(field.tag) {
                continue;
            }
            match &field.presence {
                Presence::Required => return Err(ProtocolError::MissingField { tag: field.tag }),
                Presence::Optional => {}
                Presence::Default(value) => {
                    decoded.insert(field.tag, value.clone());
                }
            }
        }
        Ok(())
    }
}
