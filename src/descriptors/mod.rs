//! Type descriptor streams.
//!
//! A `CommandDataDescription` or `StateDataDescription` payload embeds a
//! flat sequence of descriptors that together describe one codec DAG. The
//! sequence is decoded left to right; composite descriptors refer to
//! *earlier* entries by their position in the sequence (never forward).
//! That invariant is what lets the codec compiler run in a single pass.
//!
//! The two protocol versions use disjoint tag tables and disjoint field
//! layouts; each lives in its own submodule.

pub mod v1;
pub mod v2;

use uuid::Uuid;

use crate::error::Result;
use crate::proto::{Cardinality, TypeOperation};
use crate::wire::Reader;

/// v2 extras: the schema name of the type, whether it is schema-defined,
/// and the positions of its ancestor types. v1 descriptors carry none of
/// this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorMetadata {
    pub schema_name: String,
    pub is_schema_defined: bool,
    pub ancestors: Vec<u16>,
}

/// One element of an object or input shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeElement {
    pub flags: u32,
    pub cardinality: Option<Cardinality>,
    pub name: String,
    pub position: u16,
    /// v2 only: the position of the element's source type.
    pub source_position: Option<u16>,
}

/// One element of a named tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleElement {
    pub name: String,
    pub position: u16,
}

/// One decoded protocol type descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDescriptor {
    Set {
        id: Uuid,
        element: u16,
        metadata: Option<DescriptorMetadata>,
    },
    ObjectShape {
        id: Uuid,
        elements: Vec<ShapeElement>,
        /// v2 only: free shapes have no backing object type.
        is_ephemeral_free_shape: bool,
        /// v2 only: position of the backing `Object` descriptor.
        object_position: Option<u16>,
    },
    BaseScalar {
        id: Uuid,
    },
    Scalar {
        id: Uuid,
        /// v1 links a derived scalar to its base by position.
        base: Option<u16>,
        metadata: Option<DescriptorMetadata>,
    },
    Tuple {
        id: Uuid,
        elements: Vec<u16>,
        metadata: Option<DescriptorMetadata>,
    },
    NamedTuple {
        id: Uuid,
        elements: Vec<TupleElement>,
        metadata: Option<DescriptorMetadata>,
    },
    Array {
        id: Uuid,
        element: u16,
        dimensions: Vec<i32>,
        metadata: Option<DescriptorMetadata>,
    },
    Enumeration {
        id: Uuid,
        members: Vec<String>,
        metadata: Option<DescriptorMetadata>,
    },
    InputShape {
        id: Uuid,
        elements: Vec<ShapeElement>,
    },
    Range {
        id: Uuid,
        element: u16,
        metadata: Option<DescriptorMetadata>,
    },
    MultiRange {
        id: Uuid,
        element: u16,
        metadata: Option<DescriptorMetadata>,
    },
    /// v2 metadata-only descriptor for a schema object type; produces no
    /// codec of its own.
    Object {
        id: Uuid,
        metadata: Option<DescriptorMetadata>,
    },
    Compound {
        id: Uuid,
        operation: TypeOperation,
        components: Vec<u16>,
        metadata: Option<DescriptorMetadata>,
    },
    /// An opaque or name-bearing type annotation. Occupies a position in
    /// the sequence but produces no codec.
    Annotation {
        id: Option<Uuid>,
        text: String,
    },
}

impl TypeDescriptor {
    /// The type id this descriptor binds, if any.
    pub fn id(&self) -> Option<Uuid> {
        match self {
            TypeDescriptor::Set { id, .. }
            | TypeDescriptor::ObjectShape { id, .. }
            | TypeDescriptor::BaseScalar { id }
            | TypeDescriptor::Scalar { id, .. }
            | TypeDescriptor::Tuple { id, .. }
            | TypeDescriptor::NamedTuple { id, .. }
            | TypeDescriptor::Array { id, .. }
            | TypeDescriptor::Enumeration { id, .. }
            | TypeDescriptor::InputShape { id, .. }
            | TypeDescriptor::Range { id, .. }
            | TypeDescriptor::MultiRange { id, .. }
            | TypeDescriptor::Object { id, .. }
            | TypeDescriptor::Compound { id, .. } => Some(*id),
            TypeDescriptor::Annotation { id, .. } => *id,
        }
    }

    pub fn metadata(&self) -> Option<&DescriptorMetadata> {
        match self {
            TypeDescriptor::Set { metadata, .. }
            | TypeDescriptor::Scalar { metadata, .. }
            | TypeDescriptor::Tuple { metadata, .. }
            | TypeDescriptor::NamedTuple { metadata, .. }
            | TypeDescriptor::Array { metadata, .. }
            | TypeDescriptor::Enumeration { metadata, .. }
            | TypeDescriptor::Range { metadata, .. }
            | TypeDescriptor::MultiRange { metadata, .. }
            | TypeDescriptor::Object { metadata, .. }
            | TypeDescriptor::Compound { metadata, .. } => metadata.as_ref(),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            TypeDescriptor::Set { .. } => "set",
            TypeDescriptor::ObjectShape { .. } => "object shape",
            TypeDescriptor::BaseScalar { .. } => "base scalar",
            TypeDescriptor::Scalar { .. } => "scalar",
            TypeDescriptor::Tuple { .. } => "tuple",
            TypeDescriptor::NamedTuple { .. } => "named tuple",
            TypeDescriptor::Array { .. } => "array",
            TypeDescriptor::Enumeration { .. } => "enumeration",
            TypeDescriptor::InputShape { .. } => "input shape",
            TypeDescriptor::Range { .. } => "range",
            TypeDescriptor::MultiRange { .. } => "multirange",
            TypeDescriptor::Object { .. } => "object",
            TypeDescriptor::Compound { .. } => "compound",
            TypeDescriptor::Annotation { .. } => "annotation",
        }
    }
}

pub(crate) fn read_metadata(r: &mut Reader<'_>) -> Result<DescriptorMetadata> {
    let schema_name = r.read_str()?;
    let is_schema_defined = r.read_bool()?;
    let ancestors = r.read_u16_counted(|r| r.read_u16())?;
    Ok(DescriptorMetadata {
        schema_name,
        is_schema_defined,
        ancestors,
    })
}
