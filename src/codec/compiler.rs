//! The codec compiler and its caches.
//!
//! Compilation walks a descriptor sequence left to right, maintaining a
//! growing position-indexed list of already-built codecs. Only backward
//! references are legal, so one pass suffices; a reference to a position
//! that is not yet built is a [`Error::MissingCodec`], fatal for that
//! parse and never retryable.
//!
//! Two caches live here:
//! - the interning cache, type id → codec: two descriptor sequences that
//!   produce the same type id must yield the *same* codec instance, and
//! - the per-query cache, (query hash, cardinality, format, state id) →
//!   codec pair, letting repeated executions skip descriptor decoding
//!   entirely. Keying on the state descriptor id makes invalidation on a
//!   state-type change automatic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::codec::{scalars, Codec, CodecMetadata, CodecShape, ObjectField};
use crate::descriptors::{DescriptorMetadata, TypeDescriptor};
use crate::error::{Error, Result};
use crate::proto::{Capabilities, Cardinality, IoFormat};

/// Per-pool codec cache. Read-mostly: concurrent readers clone `Arc`s;
/// writers intern under short mutex sections. Interning is idempotent:
/// racing builders converge on one winner.
pub struct CodecCache {
    codecs: Mutex<HashMap<Uuid, Arc<Codec>>>,
    queries: Mutex<HashMap<QueryCacheKey, QueryCodecs>>,
    null: Arc<Codec>,
}

impl CodecCache {
    pub const NULL_CODEC_ID: Uuid = scalars::NULL_CODEC_ID;

    pub fn new() -> Self {
        CodecCache {
            codecs: Mutex::new(HashMap::new()),
            queries: Mutex::new(HashMap::new()),
            null: Arc::new(Codec::new(Self::NULL_CODEC_ID, CodecShape::Null)),
        }
    }

    pub fn null_codec(&self) -> Arc<Codec> {
        self.null.clone()
    }

    /// Looks up a codec by type id: built-in scalars first, then the
    /// general cache.
    pub fn get(&self, id: Uuid) -> Option<Arc<Codec>> {
        if id == Self::NULL_CODEC_ID {
            return Some(self.null.clone());
        }
        if let Some(scalar) = scalars::built_in(id) {
            return Some(self.intern(id, || Codec::new(id, CodecShape::Scalar(scalar))));
        }
        self.codecs.lock().unwrap().get(&id).cloned()
    }

    /// Interns `build`'s result under `id`. If another builder won the
    /// race, its codec is returned and the new one discarded.
    pub fn intern<F: FnOnce() -> Codec>(&self, id: Uuid, build: F) -> Arc<Codec> {
        let mut codecs = self.codecs.lock().unwrap();
        codecs
            .entry(id)
            .or_insert_with(|| Arc::new(build()))
            .clone()
    }

    pub fn cached_query(&self, key: &QueryCacheKey) -> Option<QueryCodecs> {
        self.queries.lock().unwrap().get(key).cloned()
    }

    pub fn update_query(&self, key: QueryCacheKey, codecs: QueryCodecs) {
        self.queries.lock().unwrap().insert(key, codecs);
    }

    #[cfg(test)]
    pub fn query_cache_len(&self) -> usize {
        self.queries.lock().unwrap().len()
    }
}

impl Default for CodecCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CodecCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecCache")
            .field("codecs", &self.codecs.lock().unwrap().len())
            .field("queries", &self.queries.lock().unwrap().len())
            .finish()
    }
}

/// Key of the per-query result cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryCacheKey {
    query_hash: u64,
    cardinality: Cardinality,
    format: IoFormat,
    state_id: Uuid,
}

impl QueryCacheKey {
    pub fn new(query: &str, cardinality: Cardinality, format: IoFormat, state_id: Uuid) -> Self {
        QueryCacheKey {
            query_hash: knuth_hash(query),
            cardinality,
            format,
            state_id,
        }
    }
}

fn knuth_hash(text: &str) -> u64 {
    let mut h: u64 = 3074457345618258791;
    for b in text.bytes() {
        h = h.wrapping_add(b as u64);
        h = h.wrapping_mul(3074457345618258799);
    }
    h
}

/// A cached parse outcome: the codec pair plus the capabilities and
/// cardinality the server granted.
#[derive(Debug, Clone)]
pub struct QueryCodecs {
    pub input_id: Uuid,
    pub input: Arc<Codec>,
    pub output_id: Uuid,
    pub output: Arc<Codec>,
    pub capabilities: Capabilities,
    pub cardinality: Cardinality,
}

fn missing(position: u16, kind: &str) -> Error {
    Error::MissingCodec(format!(
        "{kind} descriptor references position {position}, which is not yet built"
    ))
}

/// Compiles a decoded descriptor sequence into the codec for `id`.
///
/// `codecs[i]` is `None` for positions that produce no codec (annotations,
/// v2 object descriptors); referencing one of those is as fatal as a
/// forward reference.
pub fn compile(cache: &CodecCache, id: Uuid, descriptors: &[TypeDescriptor]) -> Result<Arc<Codec>> {
    if id == CodecCache::NULL_CODEC_ID || descriptors.is_empty() {
        return Ok(cache.null_codec());
    }

    let mut codecs: Vec<Option<Arc<Codec>>> = Vec::with_capacity(descriptors.len());

    for descriptor in descriptors {
        let built = build_one(cache, descriptor, &codecs, descriptors)?;
        codecs.push(built);
    }

    let last = codecs
        .iter()
        .rev()
        .find_map(|c| c.clone())
        .ok_or_else(|| Error::MissingCodec("descriptor sequence built no codec".into()))?;

    // The stream's overall id must resolve to the codec it described.
    if last.id != id {
        tracing::warn!(
            expected = %id,
            got = %last.id,
            "descriptor stream root does not match the declared type id"
        );
    }

    Ok(last)
}

fn resolve(
    codecs: &[Option<Arc<Codec>>],
    position: u16,
    kind: &str,
) -> Result<Arc<Codec>> {
    codecs
        .get(position as usize)
        .cloned()
        .flatten()
        .ok_or_else(|| missing(position, kind))
}

fn resolve_metadata(
    codecs: &[Option<Arc<Codec>>],
    metadata: Option<&DescriptorMetadata>,
) -> Result<Option<CodecMetadata>> {
    let Some(meta) = metadata else {
        return Ok(None);
    };

    let mut ancestors = Vec::with_capacity(meta.ancestors.len());
    for position in &meta.ancestors {
        ancestors.push(resolve(codecs, *position, "ancestor")?);
    }

    Ok(Some(CodecMetadata {
        schema_name: meta.schema_name.clone(),
        is_schema_defined: meta.is_schema_defined,
        ancestors,
    }))
}

fn build_one(
    cache: &CodecCache,
    descriptor: &TypeDescriptor,
    codecs: &[Option<Arc<Codec>>],
    descriptors: &[TypeDescriptor],
) -> Result<Option<Arc<Codec>>> {
    // Structural identity first: same type id, same codec instance.
    if let Some(id) = descriptor.id() {
        if !matches!(descriptor, TypeDescriptor::Annotation { .. }) {
            if let Some(existing) = cache.get(id) {
                return Ok(Some(existing));
            }
        }
    }

    let built = match descriptor {
        TypeDescriptor::BaseScalar { id } | TypeDescriptor::Scalar { id, base: None, .. } => {
            // Non-built-in scalars must already be interned; reaching here
            // without one is an error.
            return Err(Error::MissingCodec(format!(
                "no registered codec for scalar type {id}"
            )));
        }
        TypeDescriptor::Scalar {
            id,
            base: Some(base),
            metadata,
        } => {
            let base = resolve(codecs, *base, "scalar")?;
            let metadata = resolve_metadata(codecs, metadata.as_ref())?;
            Some(cache.intern(*id, || {
                Codec::new(*id, base.shape.clone()).with_metadata(metadata)
            }))
        }
        TypeDescriptor::Set {
            id,
            element,
            metadata,
        } => {
            let element = resolve(codecs, *element, "set")?;
            let metadata = resolve_metadata(codecs, metadata.as_ref())?;
            Some(cache.intern(*id, || {
                Codec::new(*id, CodecShape::Set { element }).with_metadata(metadata)
            }))
        }
        TypeDescriptor::Array {
            id,
            element,
            metadata,
            ..
        } => {
            let element = resolve(codecs, *element, "array")?;
            let metadata = resolve_metadata(codecs, metadata.as_ref())?;
            Some(cache.intern(*id, || {
                Codec::new(*id, CodecShape::Array { element }).with_metadata(metadata)
            }))
        }
        TypeDescriptor::Range {
            id,
            element,
            metadata,
        } => {
            let element = resolve(codecs, *element, "range")?;
            let metadata = resolve_metadata(codecs, metadata.as_ref())?;
            Some(cache.intern(*id, || {
                Codec::new(*id, CodecShape::Range { element }).with_metadata(metadata)
            }))
        }
        TypeDescriptor::MultiRange {
            id,
            element,
            metadata,
        } => {
            let element = resolve(codecs, *element, "multirange")?;
            let metadata = resolve_metadata(codecs, metadata.as_ref())?;
            Some(cache.intern(*id, || {
                Codec::new(*id, CodecShape::MultiRange { element }).with_metadata(metadata)
            }))
        }
        TypeDescriptor::Tuple {
            id,
            elements,
            metadata,
        } => {
            let mut children = Vec::with_capacity(elements.len());
            for position in elements {
                children.push(resolve(codecs, *position, "tuple")?);
            }
            let metadata = resolve_metadata(codecs, metadata.as_ref())?;
            Some(cache.intern(*id, || {
                Codec::new(
                    *id,
                    CodecShape::Tuple {
                        elements: children,
                    },
                )
                .with_metadata(metadata)
            }))
        }
        TypeDescriptor::NamedTuple {
            id,
            elements,
            metadata,
        } => {
            let mut fields = Vec::with_capacity(elements.len());
            for element in elements {
                fields.push(ObjectField {
                    name: element.name.clone(),
                    codec: resolve(codecs, element.position, "named tuple")?,
                    cardinality: None,
                });
            }
            let metadata = resolve_metadata(codecs, metadata.as_ref())?;
            Some(cache.intern(*id, || {
                Codec::new(*id, CodecShape::Object { fields }).with_metadata(metadata)
            }))
        }
        TypeDescriptor::ObjectShape {
            id,
            elements,
            object_position,
            is_ephemeral_free_shape,
        } => {
            let mut fields = Vec::with_capacity(elements.len());
            for element in elements {
                fields.push(ObjectField {
                    name: element.name.clone(),
                    codec: resolve(codecs, element.position, "object shape")?,
                    cardinality: element.cardinality,
                });
            }

            // v2 shapes with a backing object type inherit its provenance.
            let metadata = match (*is_ephemeral_free_shape, object_position) {
                (false, Some(position)) => {
                    let backing = descriptors
                        .get(*position as usize)
                        .ok_or_else(|| missing(*position, "object shape"))?;
                    resolve_metadata(codecs, backing.metadata())?
                }
                _ => None,
            };

            Some(cache.intern(*id, || {
                Codec::new(*id, CodecShape::Object { fields }).with_metadata(metadata)
            }))
        }
        TypeDescriptor::InputShape { id, elements } => {
            let mut fields = Vec::with_capacity(elements.len());
            for element in elements {
                fields.push(ObjectField {
                    name: element.name.clone(),
                    codec: resolve(codecs, element.position, "input shape")?,
                    cardinality: element.cardinality,
                });
            }
            Some(cache.intern(*id, || {
                Codec::new(*id, CodecShape::SparseObject { fields })
            }))
        }
        TypeDescriptor::Enumeration {
            id,
            members,
            metadata,
        } => {
            let members = members.clone();
            let metadata = resolve_metadata(codecs, metadata.as_ref())?;
            Some(cache.intern(*id, || {
                Codec::new(*id, CodecShape::Enumeration { members }).with_metadata(metadata)
            }))
        }
        TypeDescriptor::Compound {
            id,
            operation,
            components,
            metadata,
        } => {
            let mut children = Vec::with_capacity(components.len());
            for position in components {
                children.push(resolve(codecs, *position, "compound")?);
            }
            let metadata = resolve_metadata(codecs, metadata.as_ref())?;
            Some(cache.intern(*id, || {
                Codec::new(
                    *id,
                    CodecShape::Compound {
                        operation: *operation,
                        components: children,
                    },
                )
                .with_metadata(metadata)
            }))
        }
        // Annotations and bare object descriptors occupy a position but
        // produce no codec.
        TypeDescriptor::Object { .. } | TypeDescriptor::Annotation { .. } => None,
    };

    Ok(built)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::scalars::{INT64_ID, STR_ID};
    use crate::descriptors::{ShapeElement, TupleElement};

    fn array_descriptor(id: Uuid, element: u16) -> TypeDescriptor {
        TypeDescriptor::Array {
            id,
            element,
            dimensions: vec![-1],
            metadata: None,
        }
    }

    #[test]
    fn test_compile_scalar_array() {
        let cache = CodecCache::new();
        let array_id = Uuid::from_u128(0xBEEF);
        let descriptors = vec![
            TypeDescriptor::BaseScalar { id: INT64_ID },
            array_descriptor(array_id, 0),
        ];

        let codec = compile(&cache, array_id, &descriptors).unwrap();
        assert_eq!(codec.id, array_id);
        assert!(matches!(codec.shape, CodecShape::Array { .. }));
    }

    #[test]
    fn test_codec_identity_same_id_same_instance() {
        let cache = CodecCache::new();
        let array_id = Uuid::from_u128(0xBEEF);
        let descriptors = vec![
            TypeDescriptor::BaseScalar { id: INT64_ID },
            array_descriptor(array_id, 0),
        ];

        let first = compile(&cache, array_id, &descriptors).unwrap();
        let second = compile(&cache, array_id, &descriptors).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_forward_reference_is_missing_codec() {
        let cache = CodecCache::new();
        let array_id = Uuid::from_u128(0xBEEF);
        // The array references position 1, which is not yet built.
        let descriptors = vec![
            array_descriptor(array_id, 1),
            TypeDescriptor::BaseScalar { id: INT64_ID },
        ];

        let err = compile(&cache, array_id, &descriptors).unwrap_err();
        assert!(matches!(err, Error::MissingCodec(_)));
    }

    #[test]
    fn test_unknown_scalar_is_missing_codec() {
        let cache = CodecCache::new();
        let unknown = Uuid::from_u128(0x5EED);
        let descriptors = vec![TypeDescriptor::BaseScalar { id: unknown }];

        let err = compile(&cache, unknown, &descriptors).unwrap_err();
        assert!(matches!(err, Error::MissingCodec(_)));
    }

    #[test]
    fn test_reference_to_annotation_position_is_missing_codec() {
        let cache = CodecCache::new();
        let array_id = Uuid::from_u128(0xBEEF);
        let descriptors = vec![
            TypeDescriptor::Annotation {
                id: Some(Uuid::from_u128(1)),
                text: "note".into(),
            },
            array_descriptor(array_id, 0),
        ];

        let err = compile(&cache, array_id, &descriptors).unwrap_err();
        assert!(matches!(err, Error::MissingCodec(_)));
    }

    #[test]
    fn test_object_shape_fields() {
        let cache = CodecCache::new();
        let shape_id = Uuid::from_u128(0xCAFE);
        let descriptors = vec![
            TypeDescriptor::BaseScalar { id: STR_ID },
            TypeDescriptor::NamedTuple {
                id: shape_id,
                elements: vec![TupleElement {
                    name: "title".into(),
                    position: 0,
                }],
                metadata: None,
            },
        ];

        let codec = compile(&cache, shape_id, &descriptors).unwrap();
        match &codec.shape {
            CodecShape::Object { fields } => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].name, "title");
            }
            other => panic!("expected an object codec, got {other:?}"),
        }
    }

    #[test]
    fn test_input_shape_builds_sparse_object() {
        let cache = CodecCache::new();
        let input_id = Uuid::from_u128(0xF00D);
        let descriptors = vec![
            TypeDescriptor::BaseScalar { id: INT64_ID },
            TypeDescriptor::InputShape {
                id: input_id,
                elements: vec![ShapeElement {
                    flags: 0,
                    cardinality: Some(Cardinality::One),
                    name: "limit".into(),
                    position: 0,
                    source_position: None,
                }],
            },
        ];

        let codec = compile(&cache, input_id, &descriptors).unwrap();
        assert!(matches!(codec.shape, CodecShape::SparseObject { .. }));
    }

    #[test]
    fn test_query_cache_keying() {
        let state_a = Uuid::nil();
        let state_b = Uuid::from_u128(9);

        let base = QueryCacheKey::new("select 1", Cardinality::Many, IoFormat::Binary, state_a);
        let same = QueryCacheKey::new("select 1", Cardinality::Many, IoFormat::Binary, state_a);
        assert_eq!(base, same);

        // Changing any one component forces a different key.
        assert_ne!(
            base,
            QueryCacheKey::new("select 2", Cardinality::Many, IoFormat::Binary, state_a)
        );
        assert_ne!(
            base,
            QueryCacheKey::new("select 1", Cardinality::AtMostOne, IoFormat::Binary, state_a)
        );
        assert_ne!(
            base,
            QueryCacheKey::new("select 1", Cardinality::Many, IoFormat::Json, state_a)
        );
        assert_ne!(
            base,
            QueryCacheKey::new("select 1", Cardinality::Many, IoFormat::Binary, state_b)
        );
    }

    #[test]
    fn test_query_cache_store_and_miss_on_state_change() {
        let cache = CodecCache::new();
        let array_id = Uuid::from_u128(0xBEEF);
        let descriptors = vec![
            TypeDescriptor::BaseScalar { id: INT64_ID },
            array_descriptor(array_id, 0),
        ];
        let codec = compile(&cache, array_id, &descriptors).unwrap();

        let key = QueryCacheKey::new("select 1", Cardinality::Many, IoFormat::Binary, Uuid::nil());
        cache.update_query(
            key,
            QueryCodecs {
                input_id: CodecCache::NULL_CODEC_ID,
                input: cache.null_codec(),
                output_id: array_id,
                output: codec,
                capabilities: Capabilities::READ_ONLY,
                cardinality: Cardinality::Many,
            },
        );
        assert_eq!(cache.query_cache_len(), 1);
        assert!(cache.cached_query(&key).is_some());

        // A new server state type makes every lookup miss without any
        // explicit eviction.
        let rekeyed = QueryCacheKey::new(
            "select 1",
            Cardinality::Many,
            IoFormat::Binary,
            Uuid::from_u128(0x51A7E),
        );
        assert!(cache.cached_query(&rekeyed).is_none());
    }

    #[test]
    fn test_null_codec_for_nil_id() {
        let cache = CodecCache::new();
        let codec = compile(&cache, CodecCache::NULL_CODEC_ID, &[]).unwrap();
        assert!(matches!(codec.shape, CodecShape::Null));
    }
}
