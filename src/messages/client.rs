//! Client→server messages and their payload encodings.

use bytes::{Bytes, BytesMut};
use uuid::Uuid;

use crate::messages::{frame, ClientCode};
use crate::proto::{Capabilities, Cardinality, CompilationFlags, IoFormat};
use crate::wire::Writer;

/// Fields shared by the `Parse` and `Execute` payloads.
#[derive(Debug, Clone)]
pub struct QueryHeader {
    pub capabilities: Capabilities,
    pub compilation_flags: CompilationFlags,
    pub implicit_limit: u64,
    pub format: IoFormat,
    pub cardinality: Cardinality,
    pub query: String,
    pub state_id: Uuid,
    pub state_data: Bytes,
}

impl QueryHeader {
    fn encode(&self, w: &mut Writer) {
        w.write_u16(0); // annotations (zero of them)
        w.write_u64(self.capabilities.bits());
        w.write_u64(self.compilation_flags.bits());
        w.write_u64(self.implicit_limit);
        w.write_u8(self.format.into());
        w.write_u8(self.cardinality.into());
        w.write_str(&self.query);
        w.write_uuid(self.state_id);
        w.write_bytes(&self.state_data);
    }
}

/// One client→server message, ready to be framed onto the wire.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    ClientHandshake {
        major: u16,
        minor: u16,
        params: Vec<(String, String)>,
    },
    AuthenticationSaslInitialResponse {
        method: String,
        payload: Bytes,
    },
    AuthenticationSaslResponse {
        payload: Bytes,
    },
    Parse(QueryHeader),
    Execute {
        header: QueryHeader,
        input_id: Uuid,
        output_id: Uuid,
        arguments: Bytes,
    },
    Dump,
    Restore {
        jobs: u16,
        header_data: Bytes,
    },
    RestoreBlock {
        data: Bytes,
    },
    RestoreEof,
    Sync,
    Terminate,
}

impl ClientMessage {
    pub fn code(&self) -> ClientCode {
        match self {
            ClientMessage::ClientHandshake { .. } => ClientCode::CLIENT_HANDSHAKE,
            ClientMessage::AuthenticationSaslInitialResponse { .. } => {
                ClientCode::SASL_INITIAL_RESPONSE
            }
            ClientMessage::AuthenticationSaslResponse { .. } => ClientCode::SASL_RESPONSE,
            ClientMessage::Parse(_) => ClientCode::PARSE,
            ClientMessage::Execute { .. } => ClientCode::EXECUTE,
            ClientMessage::Dump => ClientCode::DUMP,
            ClientMessage::Restore { .. } => ClientCode::RESTORE,
            ClientMessage::RestoreBlock { .. } => ClientCode::RESTORE_BLOCK,
            ClientMessage::RestoreEof => ClientCode::RESTORE_EOF,
            ClientMessage::Sync => ClientCode::SYNC,
            ClientMessage::Terminate => ClientCode::TERMINATE,
        }
    }

    /// Frames this message onto `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        frame(buf, self.code(), |w| self.encode_payload(w));
    }

    fn encode_payload(&self, w: &mut Writer) {
        match self {
            ClientMessage::ClientHandshake {
                major,
                minor,
                params,
            } => {
                w.write_u16(*major);
                w.write_u16(*minor);
                w.write_u16(params.len() as u16);
                for (key, value) in params {
                    w.write_str(key);
                    w.write_str(value);
                }
                w.write_u16(0); // protocol extensions
            }
            ClientMessage::AuthenticationSaslInitialResponse { method, payload } => {
                w.write_str(method);
                w.write_bytes(payload);
            }
            ClientMessage::AuthenticationSaslResponse { payload } => {
                w.write_bytes(payload);
            }
            ClientMessage::Parse(header) => header.encode(w),
            ClientMessage::Execute {
                header,
                input_id,
                output_id,
                arguments,
            } => {
                header.encode(w);
                w.write_uuid(*input_id);
                w.write_uuid(*output_id);
                w.write_bytes(arguments);
            }
            ClientMessage::Dump => {
                w.write_u16(0); // annotations
            }
            ClientMessage::Restore { jobs, header_data } => {
                w.write_u16(0); // annotations
                w.write_u16(*jobs);
                w.write_bytes(header_data);
            }
            ClientMessage::RestoreBlock { data } => {
                w.write_bytes(data);
            }
            ClientMessage::RestoreEof | ClientMessage::Sync | ClientMessage::Terminate => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_is_empty_frame() {
        let mut buf = BytesMut::new();
        ClientMessage::Sync.encode_into(&mut buf);
        assert_eq!(buf.as_ref(), &[b'S', 0, 0, 0, 4]);
    }

    #[test]
    fn test_handshake_layout() {
        let mut buf = BytesMut::new();
        ClientMessage::ClientHandshake {
            major: 1,
            minor: 0,
            params: vec![("user".into(), "alice".into())],
        }
        .encode_into(&mut buf);

        let mut expected = BytesMut::new();
        use bytes::BufMut;
        expected.put_u8(b'V');
        expected.put_u32(4 + 2 + 2 + 2 + (4 + 4) + (4 + 5) + 2);
        expected.put_u16(1); // major
        expected.put_u16(0); // minor
        expected.put_u16(1); // one param
        expected.put_u32(4);
        expected.put_slice(b"user");
        expected.put_u32(5);
        expected.put_slice(b"alice");
        expected.put_u16(0); // extensions

        assert_eq!(buf.as_ref(), expected.as_ref());
    }

    #[test]
    fn test_parse_layout() {
        let header = QueryHeader {
            capabilities: Capabilities::MODIFICATIONS,
            compilation_flags: CompilationFlags::NONE,
            implicit_limit: 0,
            format: IoFormat::Binary,
            cardinality: Cardinality::Many,
            query: "select 1".into(),
            state_id: Uuid::nil(),
            state_data: Bytes::new(),
        };

        let mut buf = BytesMut::new();
        ClientMessage::Parse(header).encode_into(&mut buf);

        // code + length + annotations + caps + flags + limit + format +
        // cardinality + query + state id + state data
        let expected_len = 4 + 2 + 8 + 8 + 8 + 1 + 1 + (4 + 8) + 16 + 4;
        assert_eq!(buf[0], b'P');
        assert_eq!(
            u32::from_be_bytes(buf[1..5].try_into().unwrap()),
            expected_len as u32
        );
        assert_eq!(buf.len(), expected_len + 1);
        // format and cardinality bytes sit right after the three u64s
        assert_eq!(buf[5 + 2 + 24], u8::from(IoFormat::Binary));
        assert_eq!(buf[5 + 2 + 25], u8::from(Cardinality::Many));
    }
}
