//! Codecs: (de)serializers bound to wire type ids.
//!
//! A codec is a node in a tree mirroring the server's type descriptors.
//! The kind set is fixed by the protocol, so the tree is a tagged union
//! matched exhaustively, and composite codecs own their children
//! (`Arc`-shared for structural identity: one type id, one codec instance).

pub mod compiler;
pub mod scalars;

use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::proto::{Cardinality, TypeOperation};
use crate::value::{Range, Value};
use crate::wire::{Reader, Writer};

pub use scalars::ScalarCodec;

/// v2 provenance carried by schema-backed codecs: the type's schema name,
/// whether it is schema-defined, and its ancestor codecs. v1 codecs have
/// none.
#[derive(Debug, Clone)]
pub struct CodecMetadata {
    pub schema_name: String,
    pub is_schema_defined: bool,
    pub ancestors: Vec<Arc<Codec>>,
}

/// One named field of an object codec.
#[derive(Debug, Clone)]
pub struct ObjectField {
    pub name: String,
    pub codec: Arc<Codec>,
    pub cardinality: Option<Cardinality>,
}

/// The closed set of codec shapes.
#[derive(Debug, Clone)]
pub enum CodecShape {
    /// Decodes nothing and encodes nothing; the codec for absent data.
    Null,
    Scalar(ScalarCodec),
    Enumeration { members: Vec<String> },
    Array { element: Arc<Codec> },
    Set { element: Arc<Codec> },
    Tuple { elements: Vec<Arc<Codec>> },
    Object { fields: Vec<ObjectField> },
    SparseObject { fields: Vec<ObjectField> },
    Range { element: Arc<Codec> },
    MultiRange { element: Arc<Codec> },
    Compound {
        operation: TypeOperation,
        components: Vec<Arc<Codec>>,
    },
}

/// A (de)serializer bound to one wire type id.
#[derive(Debug, Clone)]
pub struct Codec {
    pub id: Uuid,
    pub metadata: Option<CodecMetadata>,
    pub shape: CodecShape,
}

// Range flag bits.
const RANGE_EMPTY: u8 = 0x01;
const RANGE_INC_LOWER: u8 = 0x02;
const RANGE_INC_UPPER: u8 = 0x04;
const RANGE_INF_LOWER: u8 = 0x08;
const RANGE_INF_UPPER: u8 = 0x10;

impl Codec {
    pub fn new(id: Uuid, shape: CodecShape) -> Self {
        Codec {
            id,
            metadata: None,
            shape,
        }
    }

    pub fn with_metadata(mut self, metadata: Option<CodecMetadata>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.shape {
            CodecShape::Null => "null",
            CodecShape::Scalar(s) => s.kind_name(),
            CodecShape::Enumeration { .. } => "enumeration",
            CodecShape::Array { .. } => "array",
            CodecShape::Set { .. } => "set",
            CodecShape::Tuple { .. } => "tuple",
            CodecShape::Object { .. } => "object",
            CodecShape::SparseObject { .. } => "sparse object",
            CodecShape::Range { .. } => "range",
            CodecShape::MultiRange { .. } => "multirange",
            CodecShape::Compound { .. } => "compound",
        }
    }

    /// Decodes one value from the reader, which must span exactly this
    /// value's payload.
    pub fn decode(&self, r: &mut Reader<'_>) -> Result<Value> {
        match &self.shape {
            CodecShape::Null => {
                r.skip(r.remaining())?;
                Ok(Value::Nothing)
            }
            CodecShape::Scalar(scalar) => scalar.decode(r),
            CodecShape::Enumeration { .. } => Ok(Value::Enum(read_all_str(r)?)),
            CodecShape::Array { element } => {
                Ok(Value::Array(decode_array_elements(r, element, false)?))
            }
            CodecShape::Set { element } => {
                // A set of arrays wraps each element in an envelope tuple.
                let envelope = matches!(element.shape, CodecShape::Array { .. });
                Ok(Value::Set(decode_array_elements(r, element, envelope)?))
            }
            CodecShape::Tuple { elements } => {
                let count = r.read_i32()?;
                if count as usize != elements.len() {
                    return Err(Error::Protocol(format!(
                        "tuple length {count} does not match descriptor length {}",
                        elements.len()
                    )));
                }
                let mut out = Vec::with_capacity(elements.len());
                for codec in elements {
                    r.skip(4)?; // reserved
                    out.push(decode_element(r, codec)?);
                }
                Ok(Value::Tuple(out))
            }
            CodecShape::Object { fields } => {
                let count = r.read_i32()?;
                if count as usize != fields.len() {
                    return Err(Error::Protocol(format!(
                        "object element count {count} does not match shape size {}",
                        fields.len()
                    )));
                }
                let mut out = Vec::with_capacity(fields.len());
                for field in fields {
                    r.skip(4)?; // reserved
                    out.push((field.name.clone(), decode_element(r, &field.codec)?));
                }
                Ok(Value::Object(out))
            }
            CodecShape::SparseObject { fields } => {
                let count = r.read_i32()?;
                let mut out = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    let index = r.read_i32()?;
                    let field = fields.get(index as usize).ok_or_else(|| {
                        Error::Protocol(format!("sparse element index {index} out of range"))
                    })?;
                    out.push((field.name.clone(), decode_element(r, &field.codec)?));
                }
                Ok(Value::SparseObject(out))
            }
            CodecShape::Range { element } => Ok(Value::Range(decode_range(r, element)?)),
            CodecShape::MultiRange { element } => {
                let count = r.read_i32()?;
                let mut out = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    let len = r.read_i32()?;
                    let mut scoped = r.read_scoped(len.max(0) as usize)?;
                    out.push(decode_range(&mut scoped, element)?);
                    scoped.finish("multirange element");
                }
                Ok(Value::MultiRange(out))
            }
            CodecShape::Compound {
                components,
                ..
            } => {
                // The payload is encoded with whichever component the value
                // actually is; without a discriminator, try them in order.
                let snapshot = r.remaining();
                for codec in components {
                    let mut attempt = Reader::new(r.peek_rest());
                    if let Ok(value) = codec.decode(&mut attempt) {
                        if attempt.is_empty() {
                            r.skip(snapshot)?;
                            return Ok(value);
                        }
                    }
                }
                Err(Error::Protocol(
                    "no compound component accepted the payload".into(),
                ))
            }
        }
    }

    /// Encodes one value onto the writer.
    pub fn encode(&self, w: &mut Writer, value: &Value) -> Result<()> {
        match (&self.shape, value) {
            (CodecShape::Null, _) => Ok(()),
            (CodecShape::Scalar(scalar), value) => scalar.encode(w, value),
            (CodecShape::Enumeration { members }, Value::Enum(name) | Value::Str(name)) => {
                if !members.is_empty() && !members.iter().any(|m| m == name) {
                    return Err(Error::Configuration(format!(
                        "`{name}` is not a member of the enumeration"
                    )));
                }
                w.write_raw(name.as_bytes());
                Ok(())
            }
            (CodecShape::Array { element }, Value::Array(items)) => {
                encode_array_elements(w, element, items)
            }
            (CodecShape::Set { .. }, _) => Err(Error::Configuration(
                "set values only flow server-to-client and cannot be encoded".into(),
            )),
            (CodecShape::Tuple { elements }, Value::Tuple(items)) => {
                if elements.len() != items.len() {
                    return Err(Error::Configuration(format!(
                        "tuple length {} does not match descriptor length {}",
                        items.len(),
                        elements.len()
                    )));
                }
                w.write_i32(items.len() as i32);
                for (codec, item) in elements.iter().zip(items) {
                    w.write_i32(0); // reserved
                    encode_element(w, codec, item)?;
                }
                Ok(())
            }
            (CodecShape::Object { fields }, Value::Object(items) | Value::SparseObject(items)) => {
                w.write_i32(fields.len() as i32);
                for field in fields {
                    w.write_i32(0); // reserved
                    match items.iter().find(|(n, _)| *n == field.name) {
                        Some((_, item)) => encode_element(w, &field.codec, item)?,
                        None => w.write_i32(-1),
                    }
                }
                Ok(())
            }
            (CodecShape::SparseObject { fields }, Value::SparseObject(items)) => {
                w.write_i32(items.len() as i32);
                for (name, item) in items {
                    let index = fields.iter().position(|f| f.name == *name).ok_or_else(|| {
                        Error::Configuration(format!("unknown sparse field `{name}`"))
                    })?;
                    w.write_i32(index as i32);
                    encode_element(w, &fields[index].codec, item)?;
                }
                Ok(())
            }
            (CodecShape::Range { element }, Value::Range(range)) => encode_range(w, element, range),
            (CodecShape::MultiRange { element }, Value::MultiRange(ranges)) => {
                w.write_i32(ranges.len() as i32);
                for range in ranges {
                    let mut inner = Writer::new();
                    encode_range(&mut inner, element, range)?;
                    w.write_bytes(inner.as_slice());
                }
                Ok(())
            }
            (CodecShape::Compound { components, .. }, value) => {
                for codec in components {
                    let mut attempt = Writer::new();
                    if codec.encode(&mut attempt, value).is_ok() {
                        w.write_raw(attempt.as_slice());
                        return Ok(());
                    }
                }
                Err(Error::Configuration(format!(
                    "no compound component accepts a {} value",
                    value.kind_name()
                )))
            }
            (_, value) => Err(Error::Configuration(format!(
                "cannot encode a {} value with a {} codec",
                value.kind_name(),
                self.kind_name()
            ))),
        }
    }
}

fn read_all_str(r: &mut Reader<'_>) -> Result<String> {
    let bytes = r.peek_rest().to_vec();
    r.skip(bytes.len())?;
    String::from_utf8(bytes).map_err(|e| Error::Protocol(format!("invalid UTF-8: {e}")))
}

fn decode_element(r: &mut Reader<'_>, codec: &Codec) -> Result<Value> {
    let len = r.read_i32()?;
    if len < 0 {
        return Ok(Value::Nothing);
    }
    let mut scoped = r.read_scoped(len as usize)?;
    let value = codec.decode(&mut scoped)?;
    scoped.finish(codec.kind_name());
    Ok(value)
}

fn encode_element(w: &mut Writer, codec: &Codec, value: &Value) -> Result<()> {
    if matches!(value, Value::Nothing) {
        w.write_i32(-1);
        return Ok(());
    }
    let mut inner = Writer::new();
    codec.encode(&mut inner, value)?;
    w.write_bytes(inner.as_slice());
    Ok(())
}

fn decode_array_elements(
    r: &mut Reader<'_>,
    element: &Codec,
    envelope: bool,
) -> Result<Vec<Value>> {
    let dimensions = r.read_i32()?;
    r.skip(8)?; // reserved

    if dimensions == 0 {
        // The empty encoding still carries placeholder bounds.
        r.skip(r.remaining())?;
        return Ok(Vec::new());
    }
    if dimensions != 1 {
        return Err(Error::Protocol(format!(
            "expected a one-dimensional collection, got {dimensions} dimensions"
        )));
    }

    let upper = r.read_i32()?;
    let lower = r.read_i32()?;
    let count = (upper - lower + 1).max(0) as usize;

    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        if envelope {
            // Each element arrives wrapped in a one-element envelope tuple.
            let len = r.read_i32()?;
            let mut scoped = r.read_scoped(len.max(0) as usize)?;
            scoped.skip(4)?; // envelope element count
            scoped.skip(4)?; // reserved
            out.push(decode_element(&mut scoped, element)?);
            scoped.finish("set envelope");
        } else {
            out.push(decode_element(r, element)?);
        }
    }
    Ok(out)
}

fn encode_array_elements(w: &mut Writer, element: &Codec, items: &[Value]) -> Result<()> {
    if items.is_empty() {
        w.write_i32(0); // no dimensions
        w.write_i32(0);
        w.write_i32(0);
        // trailing (upper, lower) of an empty collection
        w.write_i32(0);
        w.write_i32(1);
        return Ok(());
    }

    w.write_i32(1); // one dimension
    w.write_i32(0); // reserved
    w.write_i32(0); // reserved
    w.write_i32(items.len() as i32); // upper
    w.write_i32(1); // lower

    for item in items {
        encode_element(w, element, item)?;
    }
    Ok(())
}

fn decode_range(r: &mut Reader<'_>, element: &Codec) -> Result<Range> {
    let flags = r.read_u8()?;

    if flags & RANGE_EMPTY != 0 {
        return Ok(Range::empty());
    }

    let lower = if flags & RANGE_INF_LOWER == 0 {
        Some(Box::new(decode_element(r, element)?))
    } else {
        None
    };
    let upper = if flags & RANGE_INF_UPPER == 0 {
        Some(Box::new(decode_element(r, element)?))
    } else {
        None
    };

    Ok(Range {
        lower,
        upper,
        inc_lower: flags & RANGE_INC_LOWER != 0,
        inc_upper: flags & RANGE_INC_UPPER != 0,
        empty: false,
    })
}

fn encode_range(w: &mut Writer, element: &Codec, range: &Range) -> Result<()> {
    let mut flags = 0u8;
    if range.empty {
        flags |= RANGE_EMPTY;
    } else {
        if range.inc_lower {
            flags |= RANGE_INC_LOWER;
        }
        if range.inc_upper {
            flags |= RANGE_INC_UPPER;
        }
        if range.lower.is_none() {
            flags |= RANGE_INF_LOWER;
        }
        if range.upper.is_none() {
            flags |= RANGE_INF_UPPER;
        }
    }
    w.write_u8(flags);

    if range.empty {
        return Ok(());
    }
    if let Some(lower) = &range.lower {
        encode_element(w, element, lower)?;
    }
    if let Some(upper) = &range.upper {
        encode_element(w, element, upper)?;
    }
    Ok(())
}

/// Serializes query arguments with the parse result's input codec. `None`
/// arguments against a null input codec produce an empty payload.
pub fn encode_arguments(input: &Codec, arguments: Option<&Value>) -> Result<Bytes> {
    match (&input.shape, arguments) {
        (CodecShape::Null, None) => Ok(Bytes::new()),
        (CodecShape::Null, Some(_)) => Err(Error::Configuration(
            "query takes no arguments, but arguments were supplied".into(),
        )),
        (_, None) => Err(Error::Configuration(
            "query takes arguments, but none were supplied".into(),
        )),
        (_, Some(value)) => {
            let mut w = Writer::new();
            input.encode(&mut w, value)?;
            Ok(w.into_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::scalars::{self, ScalarCodec};

    fn scalar(codec: ScalarCodec) -> Arc<Codec> {
        Arc::new(Codec::new(codec.type_id(), CodecShape::Scalar(codec)))
    }

    fn round_trip(codec: &Codec, value: Value) -> Value {
        let mut w = Writer::new();
        codec.encode(&mut w, &value).unwrap();
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        let decoded = codec.decode(&mut r).unwrap();
        assert!(r.is_empty(), "codec left {} byte(s) unread", r.remaining());
        decoded
    }

    #[test]
    fn test_array_round_trip() {
        let codec = Codec::new(
            Uuid::from_u128(0xA1),
            CodecShape::Array {
                element: scalar(ScalarCodec::Int64),
            },
        );

        let value = Value::Array(vec![Value::Int64(1), Value::Int64(-2), Value::Int64(3)]);
        assert_eq!(round_trip(&codec, value.clone()), value);

        let empty = Value::Array(vec![]);
        assert_eq!(round_trip(&codec, empty.clone()), empty);
    }

    #[test]
    fn test_tuple_round_trip() {
        let codec = Codec::new(
            Uuid::from_u128(0xA2),
            CodecShape::Tuple {
                elements: vec![scalar(ScalarCodec::Str), scalar(ScalarCodec::Bool)],
            },
        );

        let value = Value::Tuple(vec![Value::Str("ok".into()), Value::Bool(true)]);
        assert_eq!(round_trip(&codec, value.clone()), value);
    }

    #[test]
    fn test_object_round_trip() {
        let codec = Codec::new(
            Uuid::from_u128(0xA3),
            CodecShape::Object {
                fields: vec![
                    ObjectField {
                        name: "id".into(),
                        codec: scalar(ScalarCodec::Uuid),
                        cardinality: Some(Cardinality::One),
                    },
                    ObjectField {
                        name: "note".into(),
                        codec: scalar(ScalarCodec::Str),
                        cardinality: Some(Cardinality::AtMostOne),
                    },
                ],
            },
        );

        let value = Value::Object(vec![
            ("id".into(), Value::Uuid(Uuid::from_u128(42))),
            ("note".into(), Value::Nothing),
        ]);
        assert_eq!(round_trip(&codec, value.clone()), value);
    }

    #[test]
    fn test_range_round_trip() {
        let codec = Codec::new(
            Uuid::from_u128(0xA4),
            CodecShape::Range {
                element: scalar(ScalarCodec::Int32),
            },
        );

        let value = Value::Range(Range {
            lower: Some(Box::new(Value::Int32(1))),
            upper: None,
            inc_lower: true,
            inc_upper: false,
            empty: false,
        });
        assert_eq!(round_trip(&codec, value.clone()), value);

        let empty = Value::Range(Range::empty());
        assert_eq!(round_trip(&codec, empty.clone()), empty);
    }

    #[test]
    fn test_type_mismatch_is_configuration_error() {
        let codec = Codec::new(
            Uuid::from_u128(0xA5),
            CodecShape::Array {
                element: scalar(ScalarCodec::Int64),
            },
        );

        let mut w = Writer::new();
        let err = codec.encode(&mut w, &Value::Bool(true)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_null_codec_arguments() {
        let null = Codec::new(scalars::NULL_CODEC_ID, CodecShape::Null);
        assert!(encode_arguments(&null, None).unwrap().is_empty());
        assert!(encode_arguments(&null, Some(&Value::Bool(true))).is_err());
    }
}
