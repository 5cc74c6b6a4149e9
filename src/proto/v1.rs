//! The version 1 protocol dialect.

use std::sync::Arc;

use uuid::Uuid;

use crate::codec::compiler::{self, CodecCache};
use crate::codec::Codec;
use crate::connect::ConnectionOptions;
use crate::descriptors::{v1, TypeDescriptor};
use crate::duplex::Connect;
use crate::error::Result;
use crate::messages::server::ServerMessage;
use crate::messages::{ClientMessage, Frame};
use crate::proto::{
    ExecuteResult, ParseResult, ProtocolContext, ProtocolProvider, ProtocolVersion,
    QueryParameters,
};
use crate::wire::Reader;

/// Protocol 1.x. Descriptors are unprefixed `[tag][id][fields]` entries and
/// codecs carry no schema metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct V1Provider;

impl ProtocolProvider for V1Provider {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::of(1, 0)
    }

    fn read_packet(&self, frame: &Frame) -> Result<ServerMessage> {
        crate::messages::server::decode(frame)
    }

    fn read_descriptor(&self, r: &mut Reader<'_>) -> Result<TypeDescriptor> {
        v1::decode_one(r)
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
    fn test_build_codec_from_v1_stream() {
        let provider = V1Provider;
        let cache = CodecCache::new();
        let array_id = Uuid::from_u128(0xB0B);

        let mut w = Writer::new();
        w.write_u8(0x02); // base scalar
        w.write_uuid(INT64_ID);
        w.write_u8(0x06); // array
        w.write_uuid(array_id);
        w.write_u16(0);
        w.write_u16(1);
        w.write_i32(-1);

        let bytes = w.into_bytes();
        let codec = provider.build_codec(&cache, array_id, &bytes).unwrap();
        assert!(matches!(codec.shape, CodecShape::Array { .. }));
        assert!(codec.metadata.is_none());
    }
}
