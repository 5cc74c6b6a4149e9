//! The duplexing transport.
//!
//! Every protocol exchange (query parse, authentication, dump/restore) is
//! an interleaved send-then-receive-loop: send one or more packets, then
//! read inbound messages one at a time and feed them to a handler until the
//! handler signals completion on a shared token. Absent that signal the
//! loop continues indefinitely.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::messages::{read_frame, ClientMessage, Frame};

/// Produces transport streams on demand, for both the initial connection
/// and reconnects. TLS setup stays outside the crate: a connector may hand
/// back any already-upgraded stream.
pub trait Connect: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    fn connect(
        &mut self,
    ) -> impl std::future::Future<Output = std::io::Result<Self::Stream>> + Send;
}

/// Plain-TCP connector, the default transport.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        TcpConnector {
            host: host.into(),
            port,
        }
    }
}

impl Connect for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&mut self) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Completion token shared between a duplex loop and its handler. The
/// handler must call [`finish_duplexing`](DuplexToken::finish_duplexing) or
/// [`finish_exceptionally`](DuplexToken::finish_exceptionally) to end the
/// loop.
#[derive(Debug, Default)]
pub struct DuplexToken {
    outcome: Option<Result<()>>,
}

impl DuplexToken {
    pub fn finish_duplexing(&mut self) {
        if self.outcome.is_none() {
            self.outcome = Some(Ok(()));
        }
    }

    pub fn finish_exceptionally(&mut self, error: Error) {
        if self.outcome.is_none() {
            self.outcome = Some(Err(error));
        }
    }

    fn take(&mut self) -> Option<Result<()>> {
        self.outcome.take()
    }
}

/// One step of a duplex exchange. Handlers receive each inbound frame along
/// with the duplexer (so mid-exchange sends, e.g. SASL responses, go out on
/// the same connection) and the completion token.
pub trait DuplexHandler<C: Connect> {
    #[allow(async_fn_in_trait)]
    async fn handle(
        &mut self,
        frame: Frame,
        conn: &mut Duplexer<C>,
        token: &mut DuplexToken,
    ) -> Result<()>;
}

/// The transport: frames and writes outbound packets, reads inbound frames,
/// and drives duplex exchanges.
///
/// Within one duplexer, sends are written in call order and inbound
/// messages are delivered in arrival order to one consumer at a time.
pub struct Duplexer<C: Connect> {
    connector: C,
    stream: Option<C::Stream>,
    /// Arrived-but-unconsumed messages, drained before touching the socket.
    inbound: VecDeque<Frame>,
    message_timeout: Duration,
    desynchronized: bool,
}

impl<C: Connect> std::fmt::Debug for Duplexer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Duplexer")
            .field("connected", &self.stream.is_some())
            .field("inbound", &self.inbound.len())
            .field("message_timeout", &self.message_timeout)
            .field("desynchronized", &self.desynchronized)
            .finish()
    }
}

impl<C: Connect> Duplexer<C> {
    pub fn new(connector: C, message_timeout: Duration) -> Self {
        Duplexer {
            connector,
            stream: None,
            inbound: VecDeque::new(),
            message_timeout,
            desynchronized: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some() && !self.desynchronized
    }

    /// A timed-out message wait leaves the connection in an unknown
    /// position in the stream; the owner must reconnect before reuse.
    pub fn is_desynchronized(&self) -> bool {
        self.desynchronized
    }

    /// Establishes (or re-establishes) the transport. Pending inbound
    /// messages from the previous connection are discarded.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.inbound.clear();
        self.desynchronized = false;
        let stream = self.connector.connect().await?;
        self.stream = Some(stream);
        tracing::debug!("transport connected");
        Ok(())
    }

    /// Frames and writes `packets` in call order, transparently connecting
    /// first if the transport is down. A send that fails on a stale
    /// connection is retried once on a fresh one.
    pub async fn send(&mut self, packets: &[ClientMessage]) -> Result<()> {
        if self.stream.is_none() || self.desynchronized {
            self.reconnect().await?;
        }

        match self.write_packets(packets).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::debug!(%err, "send failed, reconnecting and retrying once");
                self.stream = None;
                self.reconnect().await?;
                self.write_packets(packets).await.map_err(Error::from)
            }
        }
    }

    async fn write_packets(&mut self, packets: &[ClientMessage]) -> std::io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .expect("send invoked without a connected stream");

        let mut buf = BytesMut::new();
        for packet in packets {
            tracing::debug!(code = %packet.code(), "C->S");
            packet.encode_into(&mut buf);
        }

        stream.write_all(&buf).await?;
        stream.flush().await
    }

    /// Returns the next inbound message, pulling from the FIFO of
    /// already-arrived messages before awaiting a new frame off the wire.
    /// The wait is bounded by the configured message timeout.
    pub async fn read_next(&mut self) -> Result<Frame> {
        if let Some(frame) = self.inbound.pop_front() {
            tracing::debug!(code = %frame.code, "S->C (queued)");
            return Ok(frame);
        }

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Protocol("cannot read from a closed connection".into()))?;

        let frame = match tokio::time::timeout(self.message_timeout, read_frame(stream)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(io)) => {
                self.stream = None;
                return Err(Error::Transport(io));
            }
            Err(_) => {
                self.desynchronized = true;
                return Err(Error::Timeout(self.message_timeout));
            }
        };

        tracing::debug!(code = %frame.code, "S->C");
        Ok(frame)
    }

    /// Pushes a message back to the front of the inbound FIFO.
    pub fn unread(&mut self, frame: Frame) {
        self.inbound.push_front(frame);
    }

    /// The core request/response pattern: send, then repeatedly read and
    /// hand each message to `handler` until it completes the token.
    /// Transport loss mid-exchange fails the pending exchange rather than
    /// hanging it.
    pub async fn duplex<H>(&mut self, handler: &mut H, packets: &[ClientMessage]) -> Result<()>
    where
        H: DuplexHandler<C>,
    {
        self.send(packets).await?;

        let mut token = DuplexToken::default();
        loop {
            let frame = self.read_next().await?;
            handler.handle(frame, self, &mut token).await?;

            if let Some(outcome) = token.take() {
                return outcome;
            }
        }
    }

    /// [`duplex`](Self::duplex) with a trailing `Sync` so the server
    /// flushes its response pipeline.
    pub async fn duplex_and_sync<H>(
        &mut self,
        handler: &mut H,
        packets: &[ClientMessage],
    ) -> Result<()>
    where
        H: DuplexHandler<C>,
    {
        let mut with_sync = packets.to_vec();
        with_sync.push(ClientMessage::Sync);
        self.duplex(handler, &with_sync).await
    }

    /// Reads and discards messages until the server reports readiness,
    /// realigning the stream after an abandoned exchange.
    pub async fn drain_to_ready(&mut self) -> Result<crate::proto::TransactionState> {
        loop {
            let frame = self.read_next().await?;
            if let crate::messages::ServerMessage::ReadyForCommand { transaction_state } =
                crate::messages::server::decode(&frame)?
            {
                return Ok(transaction_state);
            }
            tracing::debug!(code = %frame.code, "discarding message while re-syncing");
        }
    }

    /// Politely closes the connection, sending `Terminate` when the socket
    /// is still writable.
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let mut buf = BytesMut::new();
            ClientMessage::Terminate.encode_into(&mut buf);
            // The peer may already be gone; a failed farewell is not an error.
            let _ = stream.write_all(&buf).await;
            let _ = stream.shutdown().await;
        }
        self.inbound.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{frame_server, ServerCode};
    use tokio::io::{duplex, DuplexStream};

    struct FixedConnector {
        streams: Vec<DuplexStream>,
    }

    impl Connect for FixedConnector {
        type Stream = DuplexStream;

        async fn connect(&mut self) -> std::io::Result<DuplexStream> {
            self.streams.pop().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "no more streams")
            })
        }
    }

    fn pair() -> (Duplexer<FixedConnector>, DuplexStream) {
        let (client, server) = duplex(1 << 16);
        let duplexer = Duplexer::new(
            FixedConnector {
                streams: vec![client],
            },
            Duration::from_millis(200),
        );
        (duplexer, server)
    }

    struct CountingHandler {
        seen: usize,
        finish_after: usize,
    }

    impl<C: Connect> DuplexHandler<C> for CountingHandler {
        async fn handle(
            &mut self,
            _frame: Frame,
            _conn: &mut Duplexer<C>,
            token: &mut DuplexToken,
        ) -> crate::error::Result<()> {
            self.seen += 1;
            if self.seen >= self.finish_after {
                token.finish_duplexing();
            }
            Ok(())
        }
    }

    struct FailingHandler;

    impl<C: Connect> DuplexHandler<C> for FailingHandler {
        async fn handle(
            &mut self,
            _frame: Frame,
            _conn: &mut Duplexer<C>,
            token: &mut DuplexToken,
        ) -> crate::error::Result<()> {
            token.finish_exceptionally(Error::Configuration("boom".into()));
            Ok(())
        }
    }

    async fn push_frames(server: &mut DuplexStream, count: usize) {
        for _ in 0..count {
            let frame = frame_server(ServerCode::LOG_MESSAGE, |w| {
                w.write_u8(0x28);
                w.write_u32(0);
                w.write_str("hello");
                w.write_u16(0);
            });
            server.write_all(&frame.to_wire_bytes()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_duplex_runs_until_finished() {
        let (mut duplexer, mut server) = pair();
        duplexer.reconnect().await.unwrap();
        push_frames(&mut server, 3).await;

        let mut handler = CountingHandler {
            seen: 0,
            finish_after: 3,
        };
        duplexer.duplex(&mut handler, &[]).await.unwrap();
        assert_eq!(handler.seen, 3);
    }

    #[tokio::test]
    async fn test_duplex_without_finish_never_returns() {
        let (mut duplexer, mut server) = pair();
        duplexer.reconnect().await.unwrap();
        // More messages than the bounded guard will ever consume.
        push_frames(&mut server, 5).await;

        let mut handler = CountingHandler {
            seen: 0,
            finish_after: usize::MAX,
        };
        // The loop must still be running when the guard fires.
        let guard = tokio::time::timeout(Duration::from_millis(50), async {
            duplexer.duplex(&mut handler, &[]).await
        })
        .await;
        assert!(guard.is_err(), "duplex returned without a completion signal");
        assert_eq!(handler.seen, 5);
    }

    #[tokio::test]
    async fn test_finish_exceptionally_propagates_exact_error() {
        let (mut duplexer, mut server) = pair();
        duplexer.reconnect().await.unwrap();
        push_frames(&mut server, 1).await;

        let err = duplexer.duplex(&mut FailingHandler, &[]).await.unwrap_err();
        match err {
            Error::Configuration(msg) => assert_eq!(msg, "boom"),
            other => panic!("expected the handler's own error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_read_next_prefers_queued_messages() {
        let (mut duplexer, _server) = pair();
        duplexer.reconnect().await.unwrap();
        duplexer.unread(Frame::new(ServerCode::DATA, bytes::Bytes::new()));

        let frame = duplexer.read_next().await.unwrap();
        assert_eq!(frame.code, ServerCode::DATA);
    }

    #[tokio::test]
    async fn test_read_next_timeout_marks_desynchronized() {
        let (mut duplexer, _server) = pair();
        duplexer.reconnect().await.unwrap();

        let err = duplexer.read_next().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(duplexer.is_desynchronized());
        assert!(!duplexer.is_connected());
    }

    #[tokio::test]
    async fn test_send_reconnects_when_down() {
        let (client, server) = duplex(1 << 16);
        let mut duplexer = Duplexer::new(
            FixedConnector {
                streams: vec![client],
            },
            Duration::from_millis(200),
        );

        // Never connected; the send must establish the transport itself.
        duplexer.send(&[ClientMessage::Sync]).await.unwrap();

        let mut server = server;
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, &[b'S', 0, 0, 0, 4]);
    }

    #[tokio::test]
    async fn test_disconnect_mid_duplex_fails_exchange() {
        let (mut duplexer, server) = pair();
        duplexer.reconnect().await.unwrap();
        drop(server); // peer goes away

        let mut handler = CountingHandler {
            seen: 0,
            finish_after: 1,
        };
        let err = duplexer.duplex(&mut handler, &[]).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
