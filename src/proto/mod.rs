//! The versioned protocol layer.
//!
//! Two incompatible wire dialects exist. They share framing and message
//! codes but differ in descriptor tags, descriptor layouts, and the
//! codec-building rules. Each dialect is a self-contained
//! [`ProtocolProvider`] implementation; [`Provider`] dispatches on the
//! version negotiated during the handshake, which is fixed for the life of
//! the connection.

pub mod v1;
pub mod v2;

use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::codec::compiler::{CodecCache, QueryCacheKey, QueryCodecs};
use crate::codec::Codec;
use crate::connect::{ClientConfig, ConnectionOptions};
use crate::descriptors::TypeDescriptor;
use crate::duplex::{Connect, DuplexHandler, DuplexToken, Duplexer};
use crate::error::{Error, Result};
use crate::messages::client::QueryHeader;
use crate::messages::server::ServerMessage;
use crate::messages::{ClientMessage, Frame};
use crate::wire::Reader;

pub use crate::session::SessionState;

/// A negotiated protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const fn of(major: u16, minor: u16) -> Self {
        ProtocolVersion { major, minor }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Server-granted permission flags attached to a parsed query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capabilities(u64);

impl Capabilities {
    pub const READ_ONLY: Self = Self(0);
    pub const MODIFICATIONS: Self = Self(1);
    pub const SESSION_CONFIG: Self = Self(1 << 1);
    pub const TRANSACTION: Self = Self(1 << 2);
    pub const DDL: Self = Self(1 << 3);
    pub const PERSISTENT_CONFIG: Self = Self(1 << 4);
    pub const ALL: Self = Self(u64::MAX);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Flags sent with parse/execute controlling server-side compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompilationFlags(u64);

impl CompilationFlags {
    pub const NONE: Self = Self(0);
    pub const IMPLICIT_TYPE_IDS: Self = Self(1);
    pub const IMPLICIT_TYPE_NAMES: Self = Self(1 << 1);
    pub const EXPLICIT_OBJECT_IDS: Self = Self(1 << 2);

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Server-declared result multiplicity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    NoResult,
    AtMostOne,
    One,
    Many,
    AtLeastOne,
}

impl From<Cardinality> for u8 {
    fn from(value: Cardinality) -> Self {
        match value {
            Cardinality::NoResult => 0x6E,
            Cardinality::AtMostOne => 0x6F,
            Cardinality::One => 0x41,
            Cardinality::Many => 0x6D,
            Cardinality::AtLeastOne => 0x4D,
        }
    }
}

impl TryFrom<u8> for Cardinality {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x6E => Ok(Cardinality::NoResult),
            0x6F => Ok(Cardinality::AtMostOne),
            0x41 => Ok(Cardinality::One),
            0x6D => Ok(Cardinality::Many),
            0x4D => Ok(Cardinality::AtLeastOne),
            other => Err(Error::Protocol(format!(
                "unknown cardinality {other:#04x}"
            ))),
        }
    }
}

/// Requested output format for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoFormat {
    Binary,
    Json,
    JsonElements,
    None,
}

impl From<IoFormat> for u8 {
    fn from(value: IoFormat) -> Self {
        match value {
            IoFormat::Binary => 0x62,
            IoFormat::Json => 0x6A,
            IoFormat::JsonElements => 0x4A,
            IoFormat::None => 0x6E,
        }
    }
}

/// Server-side transaction status reported by `ReadyForCommand`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    NotInTransaction,
    InTransaction,
    InFailedTransaction,
}

impl TryFrom<u8> for TransactionState {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x49 => Ok(TransactionState::NotInTransaction),
            0x54 => Ok(TransactionState::InTransaction),
            0x45 => Ok(TransactionState::InFailedTransaction),
            other => Err(Error::Protocol(format!(
                "unknown transaction state {other:#04x}"
            ))),
        }
    }
}

/// Set operation of a compound type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeOperation {
    Union,
    Intersection,
}

impl TryFrom<u8> for TypeOperation {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(TypeOperation::Union),
            1 => Ok(TypeOperation::Intersection),
            other => Err(Error::Protocol(format!(
                "unknown type operation {other:#04x}"
            ))),
        }
    }
}

/// Everything a single query execution needs from the caller.
#[derive(Debug, Clone)]
pub struct QueryParameters {
    pub query: String,
    pub arguments: Option<crate::value::Value>,
    pub capabilities: Capabilities,
    pub cardinality: Cardinality,
    pub format: IoFormat,
    pub implicit_type_names: bool,
}

impl QueryParameters {
    pub fn new(query: impl Into<String>, cardinality: Cardinality, format: IoFormat) -> Self {
        QueryParameters {
            query: query.into(),
            arguments: None,
            capabilities: Capabilities::ALL,
            cardinality,
            format,
            implicit_type_names: false,
        }
    }

    pub fn cache_key(&self, state_id: Uuid) -> QueryCacheKey {
        QueryCacheKey::new(&self.query, self.cardinality, self.format, state_id)
    }
}

/// The outcome of a successful parse: a codec pair plus protocol metadata.
/// Created per parse, consumed by the following execute, then discarded.
/// The codecs themselves are long-lived and owned by the cache.
#[derive(Debug, Clone)]
pub struct ParseResult {
    pub input_id: Uuid,
    pub input: Arc<Codec>,
    pub output_id: Uuid,
    pub output: Arc<Codec>,
    pub capabilities: Capabilities,
    pub cardinality: Cardinality,
    pub state_data: Bytes,
}

/// The raw result of executing a query: one undecoded payload per `Data`
/// message, paired with the codec that decodes them.
#[derive(Debug, Clone)]
pub struct ExecuteResult {
    pub output: Arc<Codec>,
    pub data: Vec<Bytes>,
}

/// Mutable per-exchange context threaded through provider operations.
pub struct ProtocolContext<'a, C: Connect> {
    pub duplexer: &'a mut Duplexer<C>,
    pub cache: &'a CodecCache,
    pub session: &'a mut SessionState,
    pub config: &'a ClientConfig,
}

/// One protocol dialect: message decoding, descriptor decoding, codec
/// building, and the parse/execute exchanges.
///
/// The two implementations are independent; common machinery lives in free
/// functions they both call.
pub trait ProtocolProvider: Sized + Send + Sync {
    fn version(&self) -> ProtocolVersion;

    /// Decodes an inbound frame into a message.
    fn read_packet(&self, frame: &Frame) -> Result<ServerMessage>;

    /// Decodes one type descriptor at the reader's position.
    fn read_descriptor(&self, r: &mut Reader<'_>) -> Result<TypeDescriptor>;

    /// Decodes a whole descriptor stream into its position-indexed sequence.
    fn read_descriptors(&self, data: &[u8]) -> Result<Vec<TypeDescriptor>> {
        let mut r = Reader::new(data);
        let mut out = Vec::new();
        while !r.is_empty() {
            out.push(self.read_descriptor(&mut r)?);
        }
        Ok(out)
    }

    /// Builds (or reuses) the codec identified by `id` from a descriptor
    /// stream, interning every part in `cache`.
    fn build_codec(&self, cache: &CodecCache, id: Uuid, data: &[u8]) -> Result<Arc<Codec>>;

    fn handshake(&self, options: &ConnectionOptions) -> ClientMessage;

    fn sync(&self) -> ClientMessage {
        ClientMessage::Sync
    }

    fn terminate(&self) -> ClientMessage {
        ClientMessage::Terminate
    }

    /// Resolves a query to its codec pair, consulting the per-query cache
    /// before going to the server.
    #[allow(async_fn_in_trait)]
    async fn parse_query<C: Connect>(
        &self,
        cx: &mut ProtocolContext<'_, C>,
        params: &QueryParameters,
    ) -> Result<ParseResult>;

    /// Executes a previously parsed query, collecting raw data payloads.
    #[allow(async_fn_in_trait)]
    async fn execute_query<C: Connect>(
        &self,
        cx: &mut ProtocolContext<'_, C>,
        params: &QueryParameters,
        parsed: &ParseResult,
    ) -> Result<ExecuteResult>;
}

/// Version-keyed dispatch over the two providers. Selected once per
/// connection during the handshake.
#[derive(Debug, Clone)]
pub enum Provider {
    V1(v1::V1Provider),
    V2(v2::V2Provider),
}

impl Provider {
    /// The provider for the newest dialect this client speaks; the
    /// handshake starts here and downgrades if the server asks.
    pub fn latest() -> Self {
        Provider::V2(v2::V2Provider)
    }

    /// Selects a provider for a server-announced version, if supported.
    pub fn for_version(version: ProtocolVersion) -> Option<Self> {
        match version.major {
            1 => Some(Provider::V1(v1::V1Provider)),
            2 => Some(Provider::V2(v2::V2Provider)),
            _ => None,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        match self {
            Provider::V1(p) => p.version(),
            Provider::V2(p) => p.version(),
        }
    }

    pub fn read_packet(&self, frame: &Frame) -> Result<ServerMessage> {
        match self {
            Provider::V1(p) => p.read_packet(frame),
            Provider::V2(p) => p.read_packet(frame),
        }
    }

    pub fn read_descriptors(&self, data: &[u8]) -> Result<Vec<TypeDescriptor>> {
        match self {
            Provider::V1(p) => p.read_descriptors(data),
            Provider::V2(p) => p.read_descriptors(data),
        }
    }

    pub fn build_codec(&self, cache: &CodecCache, id: Uuid, data: &[u8]) -> Result<Arc<Codec>> {
        match self {
            Provider::V1(p) => p.build_codec(cache, id, data),
            Provider::V2(p) => p.build_codec(cache, id, data),
        }
    }

    pub fn handshake(&self, options: &ConnectionOptions) -> ClientMessage {
        match self {
            Provider::V1(p) => p.handshake(options),
            Provider::V2(p) => p.handshake(options),
        }
    }

    pub fn sync(&self) -> ClientMessage {
        match self {
            Provider::V1(p) => p.sync(),
            Provider::V2(p) => p.sync(),
        }
    }

    pub fn terminate(&self) -> ClientMessage {
        match self {
            Provider::V1(p) => p.terminate(),
            Provider::V2(p) => p.terminate(),
        }
    }

    pub async fn parse_query<C: Connect>(
        &self,
        cx: &mut ProtocolContext<'_, C>,
        params: &QueryParameters,
    ) -> Result<ParseResult> {
        match self {
            Provider::V1(p) => p.parse_query(cx, params).await,
            Provider::V2(p) => p.parse_query(cx, params).await,
        }
    }

    pub async fn execute_query<C: Connect>(
        &self,
        cx: &mut ProtocolContext<'_, C>,
        params: &QueryParameters,
        parsed: &ParseResult,
    ) -> Result<ExecuteResult> {
        match self {
            Provider::V1(p) => p.execute_query(cx, params, parsed).await,
            Provider::V2(p) => p.execute_query(cx, params, parsed).await,
        }
    }
}

const MAX_PARSE_ATTEMPTS: u32 = 2;

fn compilation_flags(params: &QueryParameters, config: &ClientConfig) -> CompilationFlags {
    let mut flags = CompilationFlags::NONE;
    if config.implicit_type_ids {
        flags = flags.union(CompilationFlags::IMPLICIT_TYPE_IDS);
    }
    if params.implicit_type_names {
        flags = flags.union(CompilationFlags::IMPLICIT_TYPE_NAMES);
    }
    if !config.explicit_object_ids {
        flags = flags.union(CompilationFlags::EXPLICIT_OBJECT_IDS);
    }
    flags
}

struct ParseExchange<'p, P> {
    provider: &'p P,
    cache: &'p CodecCache,
    session: &'p mut SessionState,
    query: &'p str,
    cache_key: QueryCacheKey,
    capabilities: Capabilities,
    cardinality: Cardinality,
    state_data: Bytes,
    state_updated: bool,
    /// Set when a state mismatch leaves this round void; the next
    /// `ReadyForCommand` then re-arms the exchange instead of completing it.
    retrying: bool,
    codecs: Option<QueryCodecs>,
    complete: bool,
}

impl<P: ProtocolProvider, C: Connect> DuplexHandler<C> for ParseExchange<'_, P> {
    async fn handle(
        &mut self,
        frame: Frame,
        _conn: &mut Duplexer<C>,
        token: &mut DuplexToken,
    ) -> Result<()> {
        let message = self.provider.read_packet(&frame)?;
        tracing::debug!(message = message.name(), "parse duplex step");

        match message {
            ServerMessage::CommandDataDescription(desc) => {
                self.capabilities = desc.capabilities;
                self.cardinality = desc.cardinality;

                let input = self.provider.build_codec(
                    self.cache,
                    desc.input_type_id,
                    &desc.input_type_descriptors,
                )?;
                let output = self.provider.build_codec(
                    self.cache,
                    desc.output_type_id,
                    &desc.output_type_descriptors,
                )?;

                let codecs = QueryCodecs {
                    input_id: desc.input_type_id,
                    input,
                    output_id: desc.output_type_id,
                    output,
                    capabilities: desc.capabilities,
                    cardinality: desc.cardinality,
                };
                self.cache.update_query(self.cache_key, codecs.clone());
                self.codecs = Some(codecs);
            }
            ServerMessage::StateDataDescription { id, descriptors } => {
                update_state_codec(self.provider, self.cache, self.session, id, &descriptors)?;
                self.state_data = self.session.serialize_state()?;
                self.state_updated = true;
            }
            ServerMessage::LogMessage { severity, text, .. } => {
                crate::connect::log_server_message(severity, &text);
            }
            ServerMessage::ErrorResponse(err) => {
                self.retrying = handle_command_error(self.query, self.state_updated, err, token);
            }
            ServerMessage::ReadyForCommand { transaction_state } => {
                self.session.transaction_state = transaction_state;
                self.complete = self.codecs.is_some() && !self.retrying;
                self.retrying = false;
                token.finish_duplexing();
            }
            other => {
                tracing::debug!(message = other.name(), "ignoring message during parse");
            }
        }

        Ok(())
    }
}

/// Shared parse machinery. Both providers delegate here; what differs per
/// version (descriptor decoding, codec construction) reaches this code only
/// through the `provider` callbacks.
pub(crate) async fn run_parse<P: ProtocolProvider, C: Connect>(
    provider: &P,
    cx: &mut ProtocolContext<'_, C>,
    params: &QueryParameters,
) -> Result<ParseResult> {
    let duplexer = &mut *cx.duplexer;
    let session = &mut *cx.session;
    let cache = cx.cache;
    let config = cx.config;

    let state_data = session.serialize_state()?;

    if params.format == IoFormat::None && params.arguments.is_none() {
        // Nothing flows in either direction; skip the round-trip entirely.
        let null = cache.null_codec();
        return Ok(ParseResult {
            input_id: CodecCache::NULL_CODEC_ID,
            input: null.clone(),
            output_id: CodecCache::NULL_CODEC_ID,
            output: null,
            capabilities: params.capabilities,
            cardinality: params.cardinality,
            state_data,
        });
    }

    let cache_key = params.cache_key(session.state_descriptor_id);
    if let Some(cached) = cache.cached_query(&cache_key) {
        tracing::debug!("query codecs cached, skipping parse round-trip");
        return Ok(ParseResult {
            input_id: cached.input_id,
            input: cached.input,
            output_id: cached.output_id,
            output: cached.output,
            capabilities: cached.capabilities,
            cardinality: cached.cardinality,
            state_data,
        });
    }

    let mut attempts = 0;
    let mut exchange = ParseExchange {
        provider,
        cache,
        session,
        query: &params.query,
        cache_key,
        capabilities: params.capabilities,
        cardinality: params.cardinality,
        state_data,
        state_updated: false,
        retrying: false,
        codecs: None,
        complete: false,
    };

    loop {
        if attempts > MAX_PARSE_ATTEMPTS {
            return Err(Error::Protocol(format!(
                "failed to parse query after {attempts} attempts"
            )));
        }
        attempts += 1;
        tracing::debug!(attempts, "sending parse");

        let header = QueryHeader {
            capabilities: exchange.capabilities,
            compilation_flags: compilation_flags(params, config),
            implicit_limit: config.implicit_limit,
            format: params.format,
            cardinality: exchange.cardinality,
            query: params.query.clone(),
            state_id: exchange.session.state_descriptor_id,
            state_data: exchange.state_data.clone(),
        };

        duplexer
            .duplex_and_sync(&mut exchange, &[ClientMessage::Parse(header)])
            .await?;

        if exchange.complete {
            break;
        }
    }

    let codecs = exchange.codecs.ok_or_else(|| {
        Error::Protocol("parse completed without a command data description".into())
    })?;

    Ok(ParseResult {
        input_id: codecs.input_id,
        input: codecs.input,
        output_id: codecs.output_id,
        output: codecs.output,
        capabilities: exchange.capabilities,
        cardinality: exchange.cardinality,
        state_data: exchange.state_data,
    })
}

struct ExecuteExchange<'p, P> {
    provider: &'p P,
    cache: &'p CodecCache,
    session: &'p mut SessionState,
    query: &'p str,
    state_data: Bytes,
    state_updated: bool,
    retrying: bool,
    data: Vec<Bytes>,
    complete: bool,
}

impl<P: ProtocolProvider, C: Connect> DuplexHandler<C> for ExecuteExchange<'_, P> {
    async fn handle(
        &mut self,
        frame: Frame,
        _conn: &mut Duplexer<C>,
        token: &mut DuplexToken,
    ) -> Result<()> {
        let message = self.provider.read_packet(&frame)?;
        tracing::debug!(message = message.name(), "execute duplex step");

        match message {
            ServerMessage::Data { payload } => {
                self.data.push(payload);
            }
            ServerMessage::StateDataDescription { id, descriptors } => {
                update_state_codec(self.provider, self.cache, self.session, id, &descriptors)?;
                self.state_data = self.session.serialize_state()?;
                self.state_updated = true;
            }
            ServerMessage::CommandComplete {
                state_id,
                state_data,
                ..
            } => {
                self.session.apply_command_state(state_id, state_data);
            }
            ServerMessage::LogMessage { severity, text, .. } => {
                crate::connect::log_server_message(severity, &text);
            }
            ServerMessage::ErrorResponse(err) => {
                self.retrying = handle_command_error(self.query, self.state_updated, err, token);
            }
            ServerMessage::ReadyForCommand { transaction_state } => {
                self.session.transaction_state = transaction_state;
                if self.retrying {
                    // The voided round's rows must not leak into the retry.
                    self.data.clear();
                    self.retrying = false;
                } else {
                    self.complete = true;
                }
                token.finish_duplexing();
            }
            other => {
                tracing::debug!(message = other.name(), "ignoring message during execute");
            }
        }

        Ok(())
    }
}

/// Shared execute machinery, mirroring [`run_parse`].
pub(crate) async fn run_execute<P: ProtocolProvider, C: Connect>(
    provider: &P,
    cx: &mut ProtocolContext<'_, C>,
    params: &QueryParameters,
    parsed: &ParseResult,
) -> Result<ExecuteResult> {
    let duplexer = &mut *cx.duplexer;
    let session = &mut *cx.session;
    let cache = cx.cache;
    let config = cx.config;

    let arguments = crate::codec::encode_arguments(&parsed.input, params.arguments.as_ref())?;

    let mut attempts = 0;
    let mut exchange = ExecuteExchange {
        provider,
        cache,
        session,
        query: &params.query,
        state_data: parsed.state_data.clone(),
        state_updated: false,
        retrying: false,
        data: Vec::new(),
        complete: false,
    };

    loop {
        if attempts > MAX_PARSE_ATTEMPTS {
            return Err(Error::Protocol(format!(
                "failed to execute query after {attempts} attempts"
            )));
        }
        attempts += 1;

        let header = QueryHeader {
            capabilities: parsed.capabilities,
            compilation_flags: compilation_flags(params, config),
            implicit_limit: config.implicit_limit,
            format: params.format,
            cardinality: parsed.cardinality,
            query: params.query.clone(),
            state_id: exchange.session.state_descriptor_id,
            state_data: exchange.state_data.clone(),
        };

        duplexer
            .duplex_and_sync(
                &mut exchange,
                &[ClientMessage::Execute {
                    header,
                    input_id: parsed.input_id,
                    output_id: parsed.output_id,
                    arguments: arguments.clone(),
                }],
            )
            .await?;

        if exchange.complete {
            break;
        }
    }

    Ok(ExecuteResult {
        output: parsed.output.clone(),
        data: exchange.data,
    })
}

/// Routes a command-phase error: a state mismatch that followed a state
/// update means the exchange should re-run with the new state (returns
/// `true`); anything else fails the completion token.
fn handle_command_error(
    query: &str,
    state_updated: bool,
    err: crate::error::ServerError,
    token: &mut DuplexToken,
) -> bool {
    tracing::debug!(code = %err.code, "command phase error");

    if err.code == crate::error::ErrorCode::STATE_MISMATCH {
        if state_updated {
            return true;
        }
        // The server must announce the new state type before this is
        // actionable; without it the retry would fail identically.
        token.finish_exceptionally(Error::Protocol(
            "server reported a state mismatch without supplying a new state descriptor".into(),
        ));
    } else {
        token.finish_exceptionally(Error::Server(err.with_query(query)));
    }
    false
}

fn update_state_codec<P: ProtocolProvider>(
    provider: &P,
    cache: &CodecCache,
    session: &mut SessionState,
    id: Uuid,
    descriptors: &[u8],
) -> Result<()> {
    let codec = match cache.get(id) {
        Some(codec) => codec,
        None => provider.build_codec(cache, id, descriptors)?,
    };

    session.state_descriptor_id = id;
    session.state_codec = Some(codec);
    Ok(())
}
