use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex as AsyncMutex;

use quarry_client::messages::{frame_server, Frame, ServerCode};
use quarry_client::wire::Writer;
use quarry_client::{
    AuthenticationMode, Connect, ConnectionBuilder, Error, ErrorCode, TransactionSettings, Value,
};

/// Connector handing out pre-created in-memory streams.
#[derive(Debug)]
struct PipeConnector {
    streams: Arc<std::sync::Mutex<Vec<DuplexStream>>>,
}

impl Connect for PipeConnector {
    type Stream = DuplexStream;

    async fn connect(&mut self) -> std::io::Result<DuplexStream> {
        self.streams.lock().unwrap().pop().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "no more streams")
        })
    }
}

fn pipe() -> (PipeConnector, DuplexStream) {
    let (client_side, server_side) = duplex(1 << 20);
    (
        PipeConnector {
            streams: Arc::new(std::sync::Mutex::new(vec![client_side])),
        },
        server_side,
    )
}

/// The server half of a scripted exchange.
struct MockServer {
    stream: DuplexStream,
}

impl MockServer {
    async fn read_client_frame(&mut self) -> (u8, Bytes) {
        let code = self.stream.read_u8().await.expect("client frame code");
        let len = self.stream.read_u32().await.expect("client frame length") as usize - 4;
        let mut payload = BytesMut::zeroed(len);
        self.stream
            .read_exact(&mut payload)
            .await
            .expect("client frame payload");
        (code, payload.freeze())
    }

    async fn expect(&mut self, expected: u8) -> Bytes {
        let (code, payload) = self.read_client_frame().await;
        assert_eq!(
            code as char, expected as char,
            "unexpected client message code"
        );
        payload
    }

    async fn send(&mut self, frame: Frame) {
        self.stream
            .write_all(&frame.to_wire_bytes())
            .await
            .expect("server write");
    }

    async fn send_authentication_ok(&mut self) {
        self.send(frame_server(ServerCode::AUTHENTICATION, |w| {
            w.write_u32(0)
        }))
        .await;
    }

    async fn send_ready(&mut self) {
        self.send(frame_server(ServerCode::READY_FOR_COMMAND, |w| {
            w.write_u16(0);
            w.write_u8(0x49); // not in transaction
        }))
        .await;
    }

    async fn accept_handshake(&mut self) {
        self.expect(b'V').await;
        self.send_authentication_ok().await;
        self.send_ready().await;
    }
}

/// The v2 descriptor stream for a bare `int64` result.
fn int64_descriptor_stream() -> Bytes {
    let mut w = Writer::new();
    w.write_with_length(|w| {
        w.write_u8(0x03); // scalar
        w.write_uuid(uuid::Uuid::from_u128(0x105));
        w.write_str("std::int64");
        w.write_bool(true);
        w.write_u16(0); // no ancestors
    });
    w.into_bytes()
}

fn command_data_description() -> Frame {
    frame_server(ServerCode::COMMAND_DATA_DESCRIPTION, |w| {
        w.write_u16(0); // annotations
        w.write_u64(0); // capabilities
        w.write_u8(0x6D); // many
        w.write_uuid(uuid::Uuid::nil()); // input: null codec
        w.write_i32(0);
        w.write_uuid(uuid::Uuid::from_u128(0x105)); // output: int64
        let descriptors = int64_descriptor_stream();
        w.write_bytes(&descriptors);
    })
}

fn data_frame(value: i64) -> Frame {
    frame_server(ServerCode::DATA, |w| {
        w.write_u16(1);
        w.write_bytes(&value.to_be_bytes());
    })
}

fn command_complete() -> Frame {
    frame_server(ServerCode::COMMAND_COMPLETE, |w| {
        w.write_u16(0); // annotations
        w.write_u64(0); // capabilities
        w.write_str("SELECT");
        w.write_uuid(uuid::Uuid::nil());
        w.write_i32(0); // no state data
    })
}

fn error_response(code: ErrorCode) -> Frame {
    frame_server(ServerCode::ERROR_RESPONSE, |w| {
        w.write_u8(0x78); // error severity
        w.write_u32(code.into());
        w.write_str("scripted failure");
        w.write_u16(0); // no attributes
    })
}

#[tokio::test]
async fn test_handshake_selects_latest_protocol() {
    let (connector, server_side) = pipe();
    let server = tokio::spawn(async move {
        let mut server = MockServer {
            stream: server_side,
        };
        server.accept_handshake().await;
        server
    });

    let client = ConnectionBuilder::new("alice")
        .connect_with(connector)
        .await
        .unwrap();

    assert_eq!(client.protocol_version().to_string(), "2.0");
    server.await.unwrap();
}

#[tokio::test]
async fn test_handshake_negotiates_v1() {
    let (connector, server_side) = pipe();
    let server = tokio::spawn(async move {
        let mut server = MockServer {
            stream: server_side,
        };
        server.expect(b'V').await;
        // The server only speaks 1.0; the client must fix the connection
        // on the v1 provider for the rest of the session.
        server
            .send(frame_server(ServerCode::SERVER_HANDSHAKE, |w| {
                w.write_u16(1);
                w.write_u16(0);
                w.write_u16(0); // extensions
            }))
            .await;
        server.send_authentication_ok().await;
        server.send_ready().await;
        server
    });

    let client = ConnectionBuilder::new("alice")
        .connect_with(connector)
        .await
        .unwrap();

    assert_eq!(client.protocol_version().to_string(), "1.0");
    server.await.unwrap();
}

#[tokio::test]
async fn test_scram_authentication() {
    let (connector, server_side) = pipe();
    let server = tokio::spawn(async move {
        let mut server = MockServer {
            stream: server_side,
        };
        server.expect(b'V').await;
        server
            .send(frame_server(ServerCode::AUTHENTICATION, |w| {
                w.write_u32(0xA);
                w.write_u32(1);
                w.write_str("SCRAM-SHA-256");
            }))
            .await;

        // The client opens with a SASL initial response naming the
        // mechanism.
        let payload = server.expect(b'p').await;
        let mut r = quarry_client::wire::Reader::new(&payload);
        assert_eq!(r.read_str().unwrap(), "SCRAM-SHA-256");

        // A full SCRAM exchange needs real server-side crypto; ending the
        // handshake with an authentication failure still proves the client
        // engaged the mechanism and surfaced the server's verdict.
        server
            .send(error_response(ErrorCode::AUTHENTICATION_ERROR))
            .await;
        server
    });

    let err = ConnectionBuilder::new("alice")
        .auth(AuthenticationMode::Password("hunter2".into()))
        .connect_with(connector)
        .await
        .unwrap_err();

    match err {
        Error::Server(server_err) => {
            assert_eq!(server_err.code, ErrorCode::AUTHENTICATION_ERROR);
        }
        other => panic!("expected the server's auth error, got {other}"),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn test_query_parses_executes_and_decodes() {
    let (connector, server_side) = pipe();
    let server = tokio::spawn(async move {
        let mut server = MockServer {
            stream: server_side,
        };
        server.accept_handshake().await;

        server.expect(b'P').await; // parse
        server.expect(b'S').await; // sync
        server.send(command_data_description()).await;
        server.send_ready().await;

        server.expect(b'O').await; // execute
        server.expect(b'S').await; // sync
        server.send(data_frame(7)).await;
        server.send(data_frame(11)).await;
        server.send(command_complete()).await;
        server.send_ready().await;
        server
    });

    let mut client = ConnectionBuilder::new("alice")
        .connect_with(connector)
        .await
        .unwrap();

    let rows = client.query("select Item.size", None).await.unwrap();
    assert_eq!(rows, vec![Value::Int64(7), Value::Int64(11)]);
    server.await.unwrap();
}

#[tokio::test]
async fn test_repeated_query_skips_second_parse() {
    let parse_count = Arc::new(AtomicUsize::new(0));
    let (connector, server_side) = pipe();

    let server_parse_count = parse_count.clone();
    let server = tokio::spawn(async move {
        let mut server = MockServer {
            stream: server_side,
        };
        server.accept_handshake().await;

        // First round: parse + execute.
        server.expect(b'P').await;
        server_parse_count.fetch_add(1, Ordering::SeqCst);
        server.expect(b'S').await;
        server.send(command_data_description()).await;
        server.send_ready().await;

        server.expect(b'O').await;
        server.expect(b'S').await;
        server.send(data_frame(1)).await;
        server.send(command_complete()).await;
        server.send_ready().await;

        // Second round: the codec pair is cached, so the very next client
        // message must be the execute.
        server.expect(b'O').await;
        server.expect(b'S').await;
        server.send(data_frame(2)).await;
        server.send(command_complete()).await;
        server.send_ready().await;
        server
    });

    let mut client = ConnectionBuilder::new("alice")
        .connect_with(connector)
        .await
        .unwrap();

    let first = client.query("select Item.size", None).await.unwrap();
    let second = client.query("select Item.size", None).await.unwrap();

    assert_eq!(first, vec![Value::Int64(1)]);
    assert_eq!(second, vec![Value::Int64(2)]);
    assert_eq!(parse_count.load(Ordering::SeqCst), 1);
    server.await.unwrap();
}

#[tokio::test]
async fn test_server_error_is_surfaced_and_stream_realigned() {
    let (connector, server_side) = pipe();
    let server = tokio::spawn(async move {
        let mut server = MockServer {
            stream: server_side,
        };
        server.accept_handshake().await;

        server.expect(b'P').await;
        server.expect(b'S').await;
        server
            .send(error_response(ErrorCode::QUERY_SYNTAX))
            .await;
        server.send_ready().await;

        // The stream must be clean for the next exchange.
        server.expect(b'P').await;
        server.expect(b'S').await;
        server.send(command_data_description()).await;
        server.send_ready().await;
        server.expect(b'O').await;
        server.expect(b'S').await;
        server.send(data_frame(3)).await;
        server.send(command_complete()).await;
        server.send_ready().await;
        server
    });

    let mut client = ConnectionBuilder::new("alice")
        .connect_with(connector)
        .await
        .unwrap();

    let err = client.query("selec oops", None).await.unwrap_err();
    match &err {
        Error::Server(server_err) => assert_eq!(server_err.code, ErrorCode::QUERY_SYNTAX),
        other => panic!("expected a server error, got {other}"),
    }

    let rows = client.query("select Item.size", None).await.unwrap();
    assert_eq!(rows, vec![Value::Int64(3)]);
    server.await.unwrap();
}

async fn respond_execute_ok(server: &mut MockServer) {
    server.expect(b'O').await;
    server.expect(b'S').await;
    server.send(command_complete()).await;
    server.send_ready().await;
}

async fn respond_execute_error(server: &mut MockServer, code: ErrorCode) {
    server.expect(b'O').await;
    server.expect(b'S').await;
    server.send(error_response(code)).await;
    server.send_ready().await;
}

#[tokio::test]
async fn test_transaction_retries_retryable_statement() {
    let (connector, server_side) = pipe();
    let server = tokio::spawn(async move {
        let mut server = MockServer {
            stream: server_side,
        };
        server.accept_handshake().await;

        respond_execute_ok(&mut server).await; // start transaction

        // The statement conflicts twice, then succeeds within the budget.
        respond_execute_error(&mut server, ErrorCode::TRANSACTION_CONFLICT).await;
        respond_execute_error(&mut server, ErrorCode::TRANSACTION_SERIALIZATION).await;
        respond_execute_ok(&mut server).await;

        respond_execute_ok(&mut server).await; // commit
        server
    });

    let client = ConnectionBuilder::new("alice")
        .connect_with(connector)
        .await
        .unwrap();
    let client = Arc::new(AsyncMutex::new(client));

    let settings = TransactionSettings {
        retry_attempts: 2,
        ..TransactionSettings::default()
    };
    quarry_client::Transaction::run(client, settings, |tx| {
        Box::pin(async move { tx.execute("update Item set { touched := true }", None).await })
    })
    .await
    .unwrap();

    server.await.unwrap();
}

#[tokio::test]
async fn test_transaction_rolls_back_on_fatal_statement() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let (connector, server_side) = pipe();

    let server_attempts = attempts.clone();
    let server = tokio::spawn(async move {
        let mut server = MockServer {
            stream: server_side,
        };
        server.accept_handshake().await;

        respond_execute_ok(&mut server).await; // start transaction

        server_attempts.fetch_add(1, Ordering::SeqCst);
        respond_execute_error(&mut server, ErrorCode::CONSTRAINT_VIOLATION).await;

        respond_execute_ok(&mut server).await; // rollback
        server
    });

    let client = ConnectionBuilder::new("alice")
        .connect_with(connector)
        .await
        .unwrap();
    let client = Arc::new(AsyncMutex::new(client));

    let err = quarry_client::Transaction::run(
        client,
        TransactionSettings::default(),
        |tx| Box::pin(async move { tx.execute("insert Item { id := 1 }", None).await }),
    )
    .await
    .unwrap_err();

    match err {
        Error::Server(server_err) => {
            assert_eq!(server_err.code, ErrorCode::CONSTRAINT_VIOLATION);
        }
        other => panic!("expected the statement's error, got {other}"),
    }
    // A non-retryable failure is attempted exactly once.
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    server.await.unwrap();
}

#[tokio::test]
async fn test_transaction_budget_exhaustion_wraps_error() {
    let (connector, server_side) = pipe();
    let server = tokio::spawn(async move {
        let mut server = MockServer {
            stream: server_side,
        };
        server.accept_handshake().await;

        respond_execute_ok(&mut server).await; // start transaction

        // retry_attempts = 1 allows two tries; both conflict.
        respond_execute_error(&mut server, ErrorCode::TRANSACTION_CONFLICT).await;
        respond_execute_error(&mut server, ErrorCode::TRANSACTION_CONFLICT).await;

        respond_execute_ok(&mut server).await; // rollback
        server
    });

    let client = ConnectionBuilder::new("alice")
        .connect_with(connector)
        .await
        .unwrap();
    let client = Arc::new(AsyncMutex::new(client));

    let settings = TransactionSettings {
        retry_attempts: 1,
        ..TransactionSettings::default()
    };
    let err = quarry_client::Transaction::run(client, settings, |tx| {
        Box::pin(async move { tx.execute("update Item set { touched := true }", None).await })
    })
    .await
    .unwrap_err();

    match err {
        Error::Transaction { attempts, source } => {
            assert_eq!(attempts, 2);
            assert!(matches!(*source, Error::Server(_)));
        }
        other => panic!("expected a wrapped transaction error, got {other}"),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn test_dump_round_trip() {
    let (connector, server_side) = pipe();
    let server = tokio::spawn(async move {
        let mut server = MockServer {
            stream: server_side,
        };
        server.accept_handshake().await;

        server.expect(b'>').await; // dump
        server.expect(b'S').await; // sync
        server
            .send(frame_server(ServerCode::DUMP_HEADER, |w| {
                w.write_raw(b"header-bytes")
            }))
            .await;
        server
            .send(frame_server(ServerCode::DUMP_BLOCK, |w| {
                w.write_raw(b"block-one")
            }))
            .await;
        server.send(command_complete()).await;
        server.send_ready().await;
        server
    });

    let mut client = ConnectionBuilder::new("alice")
        .connect_with(connector)
        .await
        .unwrap();

    let (header, blocks) = client.dump().await.unwrap();
    assert_eq!(header.as_ref(), b"header-bytes");
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].as_ref(), b"block-one");
    server.await.unwrap();
}
