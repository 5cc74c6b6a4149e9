//! Server→client messages and their payload decodings.

use bytes::Bytes;
use uuid::Uuid;

use crate::error::{Error, ErrorCode, ErrorSeverity, Result, ServerError};
use crate::messages::{Frame, ServerCode};
use crate::proto::{Capabilities, Cardinality, TransactionState};
use crate::wire::Reader;

/// Authentication sub-status carried in an `Authentication` message.
#[derive(Debug, Clone)]
pub enum AuthenticationStatus {
    Ok,
    /// The server requires SASL authentication; `methods` lists the
    /// mechanisms it accepts.
    RequiredSasl { methods: Vec<String> },
    SaslContinue { data: Bytes },
    SaslFinal { data: Bytes },
}

impl std::fmt::Display for AuthenticationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AuthenticationStatus::Ok => "AuthenticationOk",
            AuthenticationStatus::RequiredSasl { .. } => "AuthenticationRequiredSasl",
            AuthenticationStatus::SaslContinue { .. } => "AuthenticationSaslContinue",
            AuthenticationStatus::SaslFinal { .. } => "AuthenticationSaslFinal",
        };
        f.write_str(name)
    }
}

/// Log severity attached to a server `LogMessage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    Debug,
    Info,
    Notice,
    Warning,
}

impl TryFrom<u8> for LogSeverity {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x14 => Ok(LogSeverity::Debug),
            0x28 => Ok(LogSeverity::Info),
            0x3C => Ok(LogSeverity::Notice),
            0x50 => Ok(LogSeverity::Warning),
            other => Err(Error::Protocol(format!(
                "unknown log severity {other:#04x}"
            ))),
        }
    }
}

/// The decoded form of a `CommandDataDescription` message: everything the
/// codec compiler needs to build the input and output codecs for a parsed
/// query.
#[derive(Debug, Clone)]
pub struct CommandDataDescription {
    pub capabilities: Capabilities,
    pub cardinality: Cardinality,
    pub input_type_id: Uuid,
    pub input_type_descriptors: Bytes,
    pub output_type_id: Uuid,
    pub output_type_descriptors: Bytes,
}

/// One decoded server→client message.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    ServerHandshake {
        major: u16,
        minor: u16,
        extensions: Vec<String>,
    },
    Authentication(AuthenticationStatus),
    CommandComplete {
        capabilities: Capabilities,
        status: String,
        state_id: Uuid,
        state_data: Bytes,
    },
    CommandDataDescription(CommandDataDescription),
    StateDataDescription {
        id: Uuid,
        descriptors: Bytes,
    },
    Data {
        payload: Bytes,
    },
    DumpHeader {
        data: Bytes,
    },
    DumpBlock {
        data: Bytes,
    },
    ErrorResponse(ServerError),
    LogMessage {
        severity: LogSeverity,
        code: u32,
        text: String,
    },
    ParameterStatus {
        name: String,
        value: Bytes,
    },
    ReadyForCommand {
        transaction_state: TransactionState,
    },
    RestoreReady {
        jobs: u16,
    },
    ServerKeyData {
        key: [u8; 32],
    },
}

impl ServerMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::ServerHandshake { .. } => "ServerHandshake",
            ServerMessage::Authentication(_) => "Authentication",
            ServerMessage::CommandComplete { .. } => "CommandComplete",
            ServerMessage::CommandDataDescription(_) => "CommandDataDescription",
            ServerMessage::StateDataDescription { .. } => "StateDataDescription",
            ServerMessage::Data { .. } => "Data",
            ServerMessage::DumpHeader { .. } => "DumpHeader",
            ServerMessage::DumpBlock { .. } => "DumpBlock",
            ServerMessage::ErrorResponse(_) => "ErrorResponse",
            ServerMessage::LogMessage { .. } => "LogMessage",
            ServerMessage::ParameterStatus { .. } => "ParameterStatus",
            ServerMessage::ReadyForCommand { .. } => "ReadyForCommand",
            ServerMessage::RestoreReady { .. } => "RestoreReady",
            ServerMessage::ServerKeyData { .. } => "ServerKeyData",
        }
    }
}

fn read_annotations(r: &mut Reader<'_>) -> Result<()> {
    let count = r.read_u16()?;
    for _ in 0..count {
        let _name = r.read_str()?;
        let _value = r.read_str()?;
    }
    Ok(())
}

/// Decodes a frame into a [`ServerMessage`].
///
/// Payload layouts are shared between the protocol versions; version
/// differences live in the descriptor streams the payloads embed, which stay
/// opaque here.
pub fn decode(frame: &Frame) -> Result<ServerMessage> {
    let payload = frame.payload.clone();
    let mut r = Reader::new(&payload);

    let message = match frame.code {
        ServerCode::SERVER_HANDSHAKE => {
            let major = r.read_u16()?;
            let minor = r.read_u16()?;
            let extensions = r.read_u16_counted(|r| {
                let name = r.read_str()?;
                read_annotations(r)?;
                Ok(name)
            })?;
            ServerMessage::ServerHandshake {
                major,
                minor,
                extensions,
            }
        }
        ServerCode::AUTHENTICATION => {
            let status = match r.read_u32()? {
                0x0 => AuthenticationStatus::Ok,
                0xA => AuthenticationStatus::RequiredSasl {
                    methods: r.read_u32_counted(|r| r.read_str())?,
                },
                0xB => AuthenticationStatus::SaslContinue {
                    data: Bytes::copy_from_slice(r.read_byte_array()?),
                },
                0xC => AuthenticationStatus::SaslFinal {
                    data: Bytes::copy_from_slice(r.read_byte_array()?),
                },
                other => {
                    return Err(Error::Protocol(format!(
                        "unknown authentication status {other:#x}"
                    )))
                }
            };
            ServerMessage::Authentication(status)
        }
        ServerCode::COMMAND_COMPLETE => {
            read_annotations(&mut r)?;
            let capabilities = Capabilities::from_bits(r.read_u64()?);
            let status = r.read_str()?;
            let state_id = r.read_uuid()?;
            let state_data = Bytes::copy_from_slice(r.read_byte_array()?);
            ServerMessage::CommandComplete {
                capabilities,
                status,
                state_id,
                state_data,
            }
        }
        ServerCode::COMMAND_DATA_DESCRIPTION => {
            read_annotations(&mut r)?;
            let capabilities = Capabilities::from_bits(r.read_u64()?);
            let cardinality = Cardinality::try_from(r.read_u8()?)?;
            let input_type_id = r.read_uuid()?;
            let input_type_descriptors = Bytes::copy_from_slice(r.read_byte_array()?);
            let output_type_id = r.read_uuid()?;
            let output_type_descriptors = Bytes::copy_from_slice(r.read_byte_array()?);
            ServerMessage::CommandDataDescription(CommandDataDescription {
                capabilities,
                cardinality,
                input_type_id,
                input_type_descriptors,
                output_type_id,
                output_type_descriptors,
            })
        }
        ServerCode::STATE_DATA_DESCRIPTION => {
            let id = r.read_uuid()?;
            let descriptors = Bytes::copy_from_slice(r.read_byte_array()?);
            ServerMessage::StateDataDescription { id, descriptors }
        }
        ServerCode::DATA => {
            // always one element per Data message
            let count = r.read_u16()?;
            if count != 1 {
                return Err(Error::Protocol(format!(
                    "expected exactly one element in a data message, got {count}"
                )));
            }
            let payload = Bytes::copy_from_slice(r.read_byte_array()?);
            ServerMessage::Data { payload }
        }
        ServerCode::DUMP_HEADER => {
            let data = payload.clone();
            r.skip(r.remaining())?;
            ServerMessage::DumpHeader { data }
        }
        ServerCode::DUMP_BLOCK => {
            let data = payload.clone();
            r.skip(r.remaining())?;
            ServerMessage::DumpBlock { data }
        }
        ServerCode::ERROR_RESPONSE => {
            let severity = ErrorSeverity::try_from(r.read_u8()?)?;
            let code = ErrorCode::from(r.read_u32()?);
            let message = r.read_str()?;
            let attributes = r.read_u16_counted(|r| {
                let code = r.read_u16()?;
                let value = Bytes::copy_from_slice(r.read_byte_array()?);
                Ok((code, value))
            })?;
            ServerMessage::ErrorResponse(ServerError::new(severity, code, message, attributes))
        }
        ServerCode::LOG_MESSAGE => {
            let severity = LogSeverity::try_from(r.read_u8()?)?;
            let code = r.read_u32()?;
            let text = r.read_str()?;
            read_annotations(&mut r)?;
            ServerMessage::LogMessage {
                severity,
                code,
                text,
            }
        }
        ServerCode::PARAMETER_STATUS => {
            let name = r.read_str()?;
            let value = Bytes::copy_from_slice(r.read_byte_array()?);
            ServerMessage::ParameterStatus { name, value }
        }
        ServerCode::READY_FOR_COMMAND => {
            read_annotations(&mut r)?;
            let transaction_state = TransactionState::try_from(r.read_u8()?)?;
            ServerMessage::ReadyForCommand { transaction_state }
        }
        ServerCode::RESTORE_READY => {
            read_annotations(&mut r)?;
            let jobs = r.read_u16()?;
            ServerMessage::RestoreReady { jobs }
        }
        ServerCode::SERVER_KEY_DATA => {
            let mut key = [0u8; 32];
            let mut scoped = r.read_scoped(32)?;
            for slot in key.iter_mut() {
                *slot = scoped.read_u8()?;
            }
            ServerMessage::ServerKeyData { key }
        }
        code => {
            return Err(Error::Protocol(format!(
                "unsupported message type {code}"
            )))
        }
    };

    r.finish(message.name());
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::frame_server;

    #[test]
    fn test_decode_ready_for_command() {
        let frame = frame_server(ServerCode::READY_FOR_COMMAND, |w| {
            w.write_u16(0); // annotations
            w.write_u8(0x49); // not in transaction
        });

        match decode(&frame).unwrap() {
            ServerMessage::ReadyForCommand { transaction_state } => {
                assert_eq!(transaction_state, TransactionState::NotInTransaction);
            }
            other => panic!("unexpected message {}", other.name()),
        }
    }

    #[test]
    fn test_decode_server_handshake() {
        let frame = frame_server(ServerCode::SERVER_HANDSHAKE, |w| {
            w.write_u16(2);
            w.write_u16(0);
            w.write_u16(0); // extensions
        });

        match decode(&frame).unwrap() {
            ServerMessage::ServerHandshake { major, minor, .. } => {
                assert_eq!((major, minor), (2, 0));
            }
            other => panic!("unexpected message {}", other.name()),
        }
    }

    #[test]
    fn test_decode_error_response() {
        let frame = frame_server(ServerCode::ERROR_RESPONSE, |w| {
            w.write_u8(0x78); // Error severity
            w.write_u32(ErrorCode::QUERY_SYNTAX.into());
            w.write_str("unexpected token");
            w.write_u16(1); // one attribute
            w.write_u16(0x0001); // hint
            w.write_bytes(b"check your braces");
        });

        match decode(&frame).unwrap() {
            ServerMessage::ErrorResponse(err) => {
                assert_eq!(err.code, ErrorCode::QUERY_SYNTAX);
                assert_eq!(err.message, "unexpected token");
                assert_eq!(err.hint().as_deref(), Some("check your braces"));
            }
            other => panic!("unexpected message {}", other.name()),
        }
    }

    #[test]
    fn test_decode_authentication_sasl() {
        let frame = frame_server(ServerCode::AUTHENTICATION, |w| {
            w.write_u32(0xA);
            w.write_u32(1);
            w.write_str("SCRAM-SHA-256");
        });

        match decode(&frame).unwrap() {
            ServerMessage::Authentication(AuthenticationStatus::RequiredSasl { methods }) => {
                assert_eq!(methods, vec!["SCRAM-SHA-256".to_string()]);
            }
            other => panic!("unexpected message {}", other.name()),
        }
    }

    #[test]
    fn test_unknown_code_is_protocol_error() {
        let frame = frame_server(ServerCode::from(0x21), |_| {});
        assert!(matches!(decode(&frame), Err(Error::Protocol(_))));
    }
}
