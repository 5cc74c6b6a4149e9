//! Message framing for the Quarry binary protocol.
//!
//! Every message on the wire is `[1 byte message code][u32 big-endian
//! length, including these 4 bytes][payload]`. The code identifies the type
//! of message and the layout of its payload.

pub mod client;
pub mod server;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

pub use client::ClientMessage;
pub use server::ServerMessage;

// The server never legitimately produces frames anywhere near this size;
// the cap keeps a misbehaving peer from OOMing the client.
const MAX_FRAME_SIZE_BYTES: usize = 1 << 30; // 1GiB

/// A client→server message code.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientCode(u8);

impl ClientCode {
    pub const CLIENT_HANDSHAKE: Self = Self(0x56); // 'V'
    pub const SASL_INITIAL_RESPONSE: Self = Self(0x70); // 'p'
    pub const SASL_RESPONSE: Self = Self(0x72); // 'r'
    pub const PARSE: Self = Self(0x50); // 'P'
    pub const EXECUTE: Self = Self(0x4F); // 'O'
    pub const DUMP: Self = Self(0x3E); // '>'
    pub const RESTORE: Self = Self(0x3C); // '<'
    pub const RESTORE_BLOCK: Self = Self(0x3D); // '='
    pub const RESTORE_EOF: Self = Self(0x2E); // '.'
    pub const SYNC: Self = Self(0x53); // 'S'
    pub const TERMINATE: Self = Self(0x58); // 'X'
}

impl From<u8> for ClientCode {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<ClientCode> for u8 {
    fn from(value: ClientCode) -> Self {
        value.0
    }
}

impl std::fmt::Display for ClientCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            ClientCode::CLIENT_HANDSHAKE => "ClientHandshake",
            ClientCode::SASL_INITIAL_RESPONSE => "AuthenticationSaslInitialResponse",
            ClientCode::SASL_RESPONSE => "AuthenticationSaslResponse",
            ClientCode::PARSE => "Parse",
            ClientCode::EXECUTE => "Execute",
            ClientCode::DUMP => "Dump",
            ClientCode::RESTORE => "Restore",
            ClientCode::RESTORE_BLOCK => "RestoreBlock",
            ClientCode::RESTORE_EOF => "RestoreEof",
            ClientCode::SYNC => "Sync",
            ClientCode::TERMINATE => "Terminate",
            _ => "Unknown",
        };
        write!(f, "{name}({})", self.0 as char)
    }
}

impl std::fmt::Debug for ClientCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientCode({})", self.0 as char)
    }
}

/// A server→client message code.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerCode(u8);

impl ServerCode {
    pub const AUTHENTICATION: Self = Self(0x52); // 'R'
    pub const COMMAND_COMPLETE: Self = Self(0x43); // 'C'
    pub const COMMAND_DATA_DESCRIPTION: Self = Self(0x54); // 'T'
    pub const STATE_DATA_DESCRIPTION: Self = Self(0x73); // 's'
    pub const DATA: Self = Self(0x44); // 'D'
    pub const DUMP_HEADER: Self = Self(0x40); // '@'
    pub const DUMP_BLOCK: Self = Self(0x3D); // '='
    pub const ERROR_RESPONSE: Self = Self(0x45); // 'E'
    pub const LOG_MESSAGE: Self = Self(0x4C); // 'L'
    pub const PARAMETER_STATUS: Self = Self(0x53); // 'S'
    pub const READY_FOR_COMMAND: Self = Self(0x5A); // 'Z'
    pub const RESTORE_READY: Self = Self(0x2B); // '+'
    pub const SERVER_HANDSHAKE: Self = Self(0x76); // 'v'
    pub const SERVER_KEY_DATA: Self = Self(0x4B); // 'K'
}

impl From<u8> for ServerCode {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<ServerCode> for u8 {
    fn from(value: ServerCode) -> Self {
        value.0
    }
}

impl std::fmt::Display for ServerCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            ServerCode::AUTHENTICATION => "Authentication",
            ServerCode::COMMAND_COMPLETE => "CommandComplete",
            ServerCode::COMMAND_DATA_DESCRIPTION => "CommandDataDescription",
            ServerCode::STATE_DATA_DESCRIPTION => "StateDataDescription",
            ServerCode::DATA => "Data",
            ServerCode::DUMP_HEADER => "DumpHeader",
            ServerCode::DUMP_BLOCK => "DumpBlock",
            ServerCode::ERROR_RESPONSE => "ErrorResponse",
            ServerCode::LOG_MESSAGE => "LogMessage",
            ServerCode::PARAMETER_STATUS => "ParameterStatus",
            ServerCode::READY_FOR_COMMAND => "ReadyForCommand",
            ServerCode::RESTORE_READY => "RestoreReady",
            ServerCode::SERVER_HANDSHAKE => "ServerHandshake",
            ServerCode::SERVER_KEY_DATA => "ServerKeyData",
            _ => "Unknown",
        };
        write!(f, "{name}({})", self.0 as char)
    }
}

impl std::fmt::Debug for ServerCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ServerCode({})", self.0 as char)
    }
}

/// One inbound framed message: code plus payload, payload owned by the
/// frame and released when the frame is dropped.
#[derive(Debug, Clone)]
pub struct Frame {
    pub code: ServerCode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(code: impl Into<ServerCode>, payload: impl Into<Bytes>) -> Self {
        Frame {
            code: code.into(),
            payload: payload.into(),
        }
    }

    /// Re-frames this message as raw wire bytes. Used by mock servers in
    /// tests; the client itself only reads frames.
    pub fn to_wire_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 5);
        use bytes::BufMut;
        buf.put_u8(self.code.into());
        buf.put_u32(self.payload.len() as u32 + 4);
        buf.put(self.payload.clone());
        buf.freeze()
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} byte(s)", self.code, self.payload.len())
    }
}

/// Reads one framed message off the stream.
pub async fn read_frame<S>(stream: &mut S) -> std::io::Result<Frame>
where
    S: AsyncRead + Unpin,
{
    let code: ServerCode = stream.read_u8().await?.into();
    let declared = stream.read_u32().await? as usize;

    if declared < 4 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {declared} is shorter than its own length field"),
        ));
    }

    let len = declared - 4;
    if len > MAX_FRAME_SIZE_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame size {len}B exceeds {MAX_FRAME_SIZE_BYTES}B"),
        ));
    }

    let mut payload = BytesMut::zeroed(len);
    stream.read_exact(&mut payload).await?;

    Ok(Frame::new(code, payload.freeze()))
}

/// Frames `payload_fn`'s output under `code`, appending to `buf`. The
/// length field is backfilled once the payload size is known and includes
/// itself.
pub fn frame(buf: &mut BytesMut, code: ClientCode, payload_fn: impl FnOnce(&mut crate::wire::Writer)) {
    use bytes::BufMut;

    let mut w = crate::wire::Writer::new();
    payload_fn(&mut w);
    let payload = w.into_bytes();

    buf.put_u8(code.into());
    buf.put_u32(payload.len() as u32 + 4);
    buf.put(payload);
}

/// Builds a server-side frame from a payload closure. The client never
/// sends these; they exist for protocol tests and in-process mock servers.
pub fn frame_server(code: ServerCode, payload_fn: impl FnOnce(&mut crate::wire::Writer)) -> Frame {
    let mut w = crate::wire::Writer::new();
    payload_fn(&mut w);
    Frame::new(code, w.into_bytes())
}
