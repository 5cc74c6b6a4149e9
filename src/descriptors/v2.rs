//! Version 2 descriptor decoding.
//!
//! Layout: `[u32 length][1 byte kind][16 byte type id, omitted for pure
//! annotations][kind-specific fields]`. Most kinds additionally carry a
//! schema name, an is-schema-defined flag, and an ancestor position list,
//! provenance information v1 descriptors lack.
//!
//! The length prefix makes unknown annotation-range tags skippable without
//! understanding their contents; a descriptor that decodes short of its
//! declared length is logged as format drift and the remainder skipped.

use crate::descriptors::{read_metadata, ShapeElement, TupleElement, TypeDescriptor};
use crate::error::{Error, Result};
use crate::proto::{Cardinality, TypeOperation};
use crate::wire::Reader;

const SET: u8 = 0x00;
const OBJECT_OUTPUT_SHAPE: u8 = 0x01;
const SCALAR: u8 = 0x03;
const TUPLE: u8 = 0x04;
const NAMED_TUPLE: u8 = 0x05;
const ARRAY: u8 = 0x06;
const ENUMERATION: u8 = 0x07;
const INPUT_SHAPE: u8 = 0x08;
const RANGE: u8 = 0x09;
const OBJECT: u8 = 0x0A;
const COMPOUND: u8 = 0x0B;
const MULTI_RANGE: u8 = 0x0C;
const TYPE_ANNOTATION_TEXT: u8 = 0xFF;

fn read_shape_element(r: &mut Reader<'_>) -> Result<ShapeElement> {
    let flags = r.read_u32()?;
    let cardinality = Cardinality::try_from(r.read_u8()?)?;
    let name = r.read_str()?;
    let position = r.read_u16()?;
    let source_position = r.read_u16()?;
    Ok(ShapeElement {
        flags,
        cardinality: Some(cardinality),
        name,
        position,
        source_position: Some(source_position),
    })
}

/// Decodes the descriptor at the reader's position, consuming exactly its
/// declared length.
pub fn decode_one(r: &mut Reader<'_>) -> Result<TypeDescriptor> {
    let length = r.read_u32()? as usize;
    let mut body = r.read_scoped(length)?;
    let kind = body.read_u8()?;

    let descriptor = match kind {
        TYPE_ANNOTATION_TEXT => TypeDescriptor::Annotation {
            id: None,
            text: body.read_str()?,
        },
        // Length-prefixed entries make the whole annotation range
        // skippable even without knowing the layout.
        0x80..=0xFE => {
            tracing::debug!(kind, "skipping unknown type annotation");
            body.skip(body.remaining())?;
            TypeDescriptor::Annotation {
                id: None,
                text: String::new(),
            }
        }
        _ => {
            let id = body.read_uuid()?;
            match kind {
                SET => TypeDescriptor::Set {
                    id,
                    element: body.read_u16()?,
                    metadata: None,
                },
                OBJECT_OUTPUT_SHAPE => {
                    let is_ephemeral_free_shape = body.read_bool()?;
                    let object_position = body.read_u16()?;
                    TypeDescriptor::ObjectShape {
                        id,
                        elements: body.read_u16_counted(read_shape_element)?,
                        is_ephemeral_free_shape,
                        object_position: Some(object_position),
                    }
                }
                SCALAR => TypeDescriptor::Scalar {
                    id,
                    base: None,
                    metadata: Some(read_metadata(&mut body)?),
                },
                TUPLE => {
                    let metadata = read_metadata(&mut body)?;
                    TypeDescriptor::Tuple {
                        id,
                        elements: body.read_u16_counted(|r| r.read_u16())?,
                        metadata: Some(metadata),
                    }
                }
                NAMED_TUPLE => {
                    let metadata = read_metadata(&mut body)?;
                    TypeDescriptor::NamedTuple {
                        id,
                        elements: body.read_u16_counted(|r| {
                            Ok(TupleElement {
                                name: r.read_str()?,
                                position: r.read_u16()?,
                            })
                        })?,
                        metadata: Some(metadata),
                    }
                }
                ARRAY => {
                    let metadata = read_metadata(&mut body)?;
                    TypeDescriptor::Array {
                        id,
                        element: body.read_u16()?,
                        dimensions: body.read_u16_counted(|r| r.read_i32())?,
                        metadata: Some(metadata),
                    }
                }
                ENUMERATION => {
                    let metadata = read_metadata(&mut body)?;
                    TypeDescriptor::Enumeration {
                        id,
                        members: body.read_u16_counted(|r| r.read_str())?,
                        metadata: Some(metadata),
                    }
                }
                INPUT_SHAPE => TypeDescriptor::InputShape {
                    id,
                    elements: body.read_u16_counted(read_shape_element)?,
                },
                RANGE => {
                    let metadata = read_metadata(&mut body)?;
                    TypeDescriptor::Range {
                        id,
                        element: body.read_u16()?,
                        metadata: Some(metadata),
                    }
                }
                OBJECT => {
                    let schema_name = body.read_str()?;
                    let is_schema_defined = body.read_bool()?;
                    TypeDescriptor::Object {
                        id,
                        metadata: Some(crate::descriptors::DescriptorMetadata {
                            schema_name,
                            is_schema_defined,
                            ancestors: Vec::new(),
                        }),
                    }
                }
                COMPOUND => {
                    let schema_name = body.read_str()?;
                    let is_schema_defined = body.read_bool()?;
                    let operation = TypeOperation::try_from(body.read_u8()?)?;
                    TypeDescriptor::Compound {
                        id,
                        operation,
                        components: body.read_u16_counted(|r| r.read_u16())?,
                        metadata: Some(crate::descriptors::DescriptorMetadata {
                            schema_name,
                            is_schema_defined,
                            ancestors: Vec::new(),
                        }),
                    }
                }
                MULTI_RANGE => {
                    let metadata = read_metadata(&mut body)?;
                    TypeDescriptor::MultiRange {
                        id,
                        element: body.read_u16()?,
                        metadata: Some(metadata),
                    }
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unknown v2 type descriptor tag {other:#04x}"
                    )))
                }
            }
        }
    };

    body.finish("v2 type descriptor");
    Ok(descriptor)
}
