//! Version 1 descriptor decoding.
//!
//! Layout: `[1 byte kind][16 byte type id][kind-specific fields]`, no
//! per-descriptor length prefix. Tags in the reserved annotation range
//! `0x80..=0xFE` decode as opaque `[id][string]` annotations and are
//! tolerated for forward compatibility; any other unknown tag is a hard
//! decode error.

use crate::descriptors::{ShapeElement, TupleElement, TypeDescriptor};
use crate::error::{Error, Result};
use crate::proto::Cardinality;
use crate::wire::Reader;

const SET: u8 = 0x00;
const OBJECT_SHAPE: u8 = 0x01;
const BASE_SCALAR: u8 = 0x02;
const SCALAR: u8 = 0x03;
const TUPLE: u8 = 0x04;
const NAMED_TUPLE: u8 = 0x05;
const ARRAY: u8 = 0x06;
const ENUMERATION: u8 = 0x07;
const INPUT_SHAPE: u8 = 0x08;
const RANGE: u8 = 0x09;
const SCALAR_TYPE_NAME_ANNOTATION: u8 = 0xFF;

fn read_shape_element(r: &mut Reader<'_>) -> Result<ShapeElement> {
    let flags = r.read_u32()?;
    let cardinality = Cardinality::try_from(r.read_u8()?)?;
    let name = r.read_str()?;
    let position = r.read_u16()?;
    Ok(ShapeElement {
        flags,
        cardinality: Some(cardinality),
        name,
        position,
        source_position: None,
    })
}

/// Decodes the descriptor at the reader's position.
pub fn decode_one(r: &mut Reader<'_>) -> Result<TypeDescriptor> {
    let kind = r.read_u8()?;
    let id = r.read_uuid()?;

    let descriptor = match kind {
        SET => TypeDescriptor::Set {
            id,
            element: r.read_u16()?,
            metadata: None,
        },
        OBJECT_SHAPE => TypeDescriptor::ObjectShape {
            id,
            elements: r.read_u16_counted(read_shape_element)?,
            is_ephemeral_free_shape: false,
            object_position: None,
        },
        BASE_SCALAR => TypeDescriptor::BaseScalar { id },
        SCALAR => TypeDescriptor::Scalar {
            id,
            base: Some(r.read_u16()?),
            metadata: None,
        },
        TUPLE => TypeDescriptor::Tuple {
            id,
            elements: r.read_u16_counted(|r| r.read_u16())?,
            metadata: None,
        },
        NAMED_TUPLE => TypeDescriptor::NamedTuple {
            id,
            elements: r.read_u16_counted(|r| {
                Ok(TupleElement {
                    name: r.read_str()?,
                    position: r.read_u16()?,
                })
            })?,
            metadata: None,
        },
        ARRAY => TypeDescriptor::Array {
            id,
            element: r.read_u16()?,
            dimensions: r.read_u16_counted(|r| r.read_i32())?,
            metadata: None,
        },
        ENUMERATION => TypeDescriptor::Enumeration {
            id,
            members: r.read_u16_counted(|r| r.read_str())?,
            metadata: None,
        },
        INPUT_SHAPE => TypeDescriptor::InputShape {
            id,
            elements: r.read_u16_counted(read_shape_element)?,
        },
        RANGE => TypeDescriptor::Range {
            id,
            element: r.read_u16()?,
            metadata: None,
        },
        SCALAR_TYPE_NAME_ANNOTATION => TypeDescriptor::Annotation {
            id: Some(id),
            text: r.read_str()?,
        },
        // Reserved annotation range: skip, don't fail, so newer servers can
        // attach annotations older clients ignore.
        0x80..=0xFE => {
            let text = r.read_str()?;
            tracing::debug!(kind, "skipping unknown type annotation");
            TypeDescriptor::Annotation { id: Some(id), text }
        }
        other => {
            return Err(Error::Protocol(format!(
                "unknown v1 type descriptor tag {other:#04x}"
            )))
        }
    };

    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Writer;
    use uuid::Uuid;

    fn decode_all(bytes: &[u8]) -> Result<Vec<TypeDescriptor>> {
        let mut r = Reader::new(bytes);
        let mut out = Vec::new();
        while !r.is_empty() {
            out.push(decode_one(&mut r)?);
        }
        Ok(out)
    }

    #[test]
    fn test_decode_base_scalar_then_array() {
        let scalar_id = Uuid::from_u128(0x105);
        let array_id = Uuid::from_u128(0xABCD);

        let mut w = Writer::new();
        w.write_u8(BASE_SCALAR);
        w.write_uuid(scalar_id);

        w.write_u8(ARRAY);
        w.write_uuid(array_id);
        w.write_u16(0); // element position: the scalar
        w.write_u16(1); // one dimension
        w.write_i32(-1);

        let bytes = w.into_bytes();
        let descriptors = decode_all(&bytes).unwrap();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(
            descriptors[0],
            TypeDescriptor::BaseScalar { id: scalar_id }
        );
        match &descriptors[1] {
            TypeDescriptor::Array {
                id,
                element,
                dimensions,
                ..
            } => {
                assert_eq!(*id, array_id);
                assert_eq!(*element, 0);
                assert_eq!(dimensions, &vec![-1]);
            }
            other => panic!("unexpected descriptor {}", other.kind_name()),
        }
    }

    #[test]
    fn test_decode_object_shape() {
        let mut w = Writer::new();
        w.write_u8(OBJECT_SHAPE);
        w.write_uuid(Uuid::from_u128(1));
        w.write_u16(1); // one element
        w.write_u32(0); // flags
        w.write_u8(0x6F); // at most one
        w.write_str("name");
        w.write_u16(0);

        let bytes = w.into_bytes();
        let descriptors = decode_all(&bytes).unwrap();
        match &descriptors[0] {
            TypeDescriptor::ObjectShape { elements, .. } => {
                assert_eq!(elements.len(), 1);
                assert_eq!(elements[0].name, "name");
                assert_eq!(elements[0].cardinality, Some(Cardinality::AtMostOne));
            }
            other => panic!("unexpected descriptor {}", other.kind_name()),
        }
    }

    #[test]
    fn test_unknown_annotation_tag_is_skipped() {
        let mut w = Writer::new();
        w.write_u8(0x93); // reserved annotation range
        w.write_uuid(Uuid::from_u128(7));
        w.write_str("future extension");

        let bytes = w.into_bytes();
        let descriptors = decode_all(&bytes).unwrap();
        assert!(matches!(
            &descriptors[0],
            TypeDescriptor::Annotation { text, .. } if text == "future extension"
        ));
    }

    #[test]
    fn test_unknown_tag_outside_annotation_range_fails() {
        let mut w = Writer::new();
        w.write_u8(0x42);
        w.write_uuid(Uuid::from_u128(7));

        let bytes = w.into_bytes();
        assert!(matches!(decode_all(&bytes), Err(Error::Protocol(_))));
    }
}
