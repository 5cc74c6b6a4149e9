//! The version 2 protocol dialect.
//!
//! Shares framing and message codes with v1 but nothing at the descriptor
//! level: entries are length-prefixed, tags form a different table, and
//! schema-backed descriptors carry name/schema-defined/ancestor metadata
//! that flows into the built codecs.

use std::sync::Arc;

use uuid::Uuid;

use crate::codec::compiler::{self, CodecCache};
use crate::codec::Codec;
use crate::connect::ConnectionOptions;
use crate::descriptors::{v2, TypeDescriptor};
use crate::duplex::Connect;
use crate::error::Result;
use crate::messages::server::ServerMessage;
use crate::messages::{ClientMessage, Frame};
use crate::proto::{
    ExecuteResult, ParseResult, ProtocolContext, ProtocolProvider, ProtocolVersion,
    QueryParameters,
};
use crate::wire::Reader;

#[derive(Debug, Clone, Copy, Default)]
pub struct V2Provider;

impl ProtocolProvider for V2Provider {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::of(2, 0)
    }

    fn read_packet(&self, frame: &Frame) -> Result<ServerMessage> {
        crate::messages::server::decode(frame)
    }

    fn read_descriptor(&self, r: &mut Reader<'_>) -> Result<TypeDescriptor> {
        v2::decode_one(r)
    }

    fn build_codec(&self, cache: &CodecCache, id: Uuid, data: &[u8]) -> Result<Arc<Codec>> {
        let descriptors = self.read_descriptors(data)?;
        compiler::compile(cache, id, &descriptors)
    }

    fn handshake(&self, options: &ConnectionOptions) -> ClientMessage {
        ClientMessage::ClientHandshake {
            major: self.version().major,
            minor: self.version().minor,
            params: options.handshake_params(),
        }
    }

    async fn parse_query<C: Connect>(
        &self,
        cx: &mut ProtocolContext<'_, C>,
        params: &QueryParameters,
    ) -> Result<ParseResult> {
        crate::proto::run_parse(self, cx, params).await
    }

    async fn execute_query<C: Connect>(
        &self,
        cx: &mut ProtocolContext<'_, C>,
        params: &QueryParameters,
        parsed: &ParseResult,
    ) -> Result<ExecuteResult> {
        crate::proto::run_execute(self, cx, params, parsed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::scalars::INT64_ID;
    use crate::codec::CodecShape;
    use crate::wire::Writer;

    #[test]
    fn test_build_codec_carries_metadata() {
        let provider = V2Provider;
        let cache = CodecCache::new();
        let array_id = Uuid::from_u128(0xB0C);

        let mut w = Writer::new();
        w.write_with_length(|w| {
            w.write_u8(0x03); // scalar
            w.write_uuid(INT64_ID);
            w.write_str("std::int64");
            w.write_bool(true);
            w.write_u16(0);
        });
        w.write_with_length(|w| {
            w.write_u8(0x06); // array
            w.write_uuid(array_id);
            w.write_str("array<std::int64>");
            w.write_bool(false);
            w.write_u16(1); // one ancestor: the scalar
            w.write_u16(0);
            w.write_u16(0); // element position
            w.write_u16(1); // one dimension
            w.write_i32(-1);
        });

        let bytes = w.into_bytes();
        let codec = provider.build_codec(&cache, array_id, &bytes).unwrap();
        assert!(matches!(codec.shape, CodecShape::Array { .. }));

        let metadata = codec.metadata.as_ref().expect("v2 codecs carry metadata");
        assert_eq!(metadata.schema_name, "array<std::int64>");
        assert!(!metadata.is_schema_defined);
        assert_eq!(metadata.ancestors.len(), 1);
        assert_eq!(metadata.ancestors[0].id, INT64_ID);
    }

    #[test]
    fn test_v1_and_v2_tag_tables_are_disjoint_for_base_scalars() {
        // Tag 0x02 is a base scalar in v1 and unassigned in v2.
        let provider = V2Provider;
        let mut w = Writer::new();
        w.write_with_length(|w| {
            w.write_u8(0x02);
            w.write_uuid(INT64_ID);
        });

        let bytes = w.into_bytes();
        assert!(provider.read_descriptors(&bytes).is_err());
    }
}
