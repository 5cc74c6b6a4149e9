//! The client handle: one connection driving the parse→execute lifecycle,
//! plus the pooled multi-client front end.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::Mutex as AsyncMutex;

use crate::codec::compiler::CodecCache;
use crate::connect::{ClientConfig, ConnectionOptions, HandshakeExchange};
use crate::duplex::{Connect, DuplexHandler, DuplexToken, Duplexer};
use crate::error::{Error, Result};
use crate::messages::server::ServerMessage;
use crate::messages::{ClientMessage, Frame};
use crate::pool::{PoolContract, PoolHolder};
use crate::proto::{
    Cardinality, ExecuteResult, IoFormat, ProtocolContext, Provider, ProtocolVersion,
    QueryParameters, SessionState, TransactionState,
};
use crate::transaction::{Transaction, TransactionSettings};
use crate::value::Value;
use crate::wire::Reader;

/// One established connection to the server.
#[derive(Debug)]
pub struct Client<C: Connect> {
    duplexer: Duplexer<C>,
    provider: Provider,
    cache: Arc<CodecCache>,
    session: SessionState,
    options: ConnectionOptions,
    config: ClientConfig,
    server_parameters: Vec<(String, Bytes)>,
    server_key: Option<[u8; 32]>,
    suggested_pool_concurrency: Option<usize>,
    server_config: Option<Value>,
}

impl<C: Connect> Client<C> {
    /// Opens the transport and performs the full handshake.
    pub(crate) async fn establish(
        connector: C,
        options: ConnectionOptions,
        config: ClientConfig,
    ) -> Result<Self> {
        Self::establish_with_cache(connector, options, config, Arc::new(CodecCache::new())).await
    }

    /// As [`establish`](Self::establish), sharing a pool-wide codec cache.
    pub(crate) async fn establish_with_cache(
        connector: C,
        options: ConnectionOptions,
        config: ClientConfig,
        cache: Arc<CodecCache>,
    ) -> Result<Self> {
        let mut client = Client {
            duplexer: Duplexer::new(connector, config.message_timeout),
            provider: Provider::latest(),
            cache,
            session: SessionState::new(),
            options,
            config,
            server_parameters: Vec::new(),
            server_key: None,
            suggested_pool_concurrency: None,
            server_config: None,
        };
        client.duplexer.reconnect().await?;
        client.handshake().await?;
        Ok(client)
    }

    /// The protocol version fixed for this connection at handshake time.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.provider.version()
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.session.transaction_state
    }

    pub fn is_connected(&self) -> bool {
        self.duplexer.is_connected()
    }

    /// The pool concurrency the server suggested during startup, if any.
    pub fn suggested_pool_concurrency(&self) -> Option<usize> {
        self.suggested_pool_concurrency
    }

    pub fn server_parameter(&self, name: &str) -> Option<&[u8]> {
        self.server_parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_ref())
    }

    /// The server's `system_config` object announced at startup, if any.
    pub fn server_config(&self) -> Option<&Value> {
        self.server_config.as_ref()
    }

    /// Opaque per-connection key data the server sent at startup.
    pub fn server_key(&self) -> Option<&[u8; 32]> {
        self.server_key.as_ref()
    }

    /// Sets a session global, carried to the server as sparse state on the
    /// next statement.
    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.session.set_state_field(name, value);
    }

    async fn handshake(&mut self) -> Result<()> {
        let mut exchange = HandshakeExchange::new(&self.options, self.provider.clone());
        let hello = exchange.provider.handshake(&self.options);
        self.duplexer.duplex(&mut exchange, &[hello]).await?;

        // The version the handshake settled on is fixed from here; only a
        // reconnect re-queries it.
        let provider = exchange.provider.clone();
        let transaction_state = exchange.transaction_state;
        let parameters = std::mem::take(&mut exchange.parameters);
        let server_key = exchange.server_key;
        let state_description = exchange.state_description.take();
        let negotiated = exchange.negotiated;
        drop(exchange);

        if let Some(version) = negotiated {
            tracing::debug!(%version, "connection fixed at negotiated protocol version");
        }
        self.provider = provider;
        self.session.transaction_state = transaction_state;
        self.server_key = server_key;

        if let Some((id, descriptors)) = state_description {
            let codec = self.provider.build_codec(&self.cache, id, &descriptors)?;
            self.session.state_descriptor_id = id;
            self.session.state_codec = Some(codec);
        }

        for (name, value) in &parameters {
            match name.as_str() {
                "suggested_pool_concurrency" => {
                    let text = String::from_utf8_lossy(value);
                    match text.trim().parse::<usize>() {
                        Ok(n) => self.suggested_pool_concurrency = Some(n),
                        Err(_) => {
                            tracing::warn!(%text, "suggested_pool_concurrency was not numeric")
                        }
                    }
                }
                "system_config" => match self.decode_system_config(value) {
                    Ok(config) => self.server_config = Some(config),
                    Err(err) => tracing::warn!(%err, "failed to decode system_config"),
                },
                _ => {}
            }
        }
        self.server_parameters = parameters;

        Ok(())
    }

    /// `system_config` arrives as a descriptor-prefixed encoded object:
    /// `[u32 descriptor length + 16][16B type id][descriptors][u32 length]
    /// [payload]`.
    fn decode_system_config(&self, value: &[u8]) -> Result<Value> {
        let mut r = Reader::new(value);
        let descriptor_len = (r.read_u32()? as usize).saturating_sub(16);
        let id = r.read_uuid()?;
        let descriptors = r.read_scoped(descriptor_len)?;

        let codec = match self.cache.get(id) {
            Some(codec) => codec,
            None => self
                .provider
                .build_codec(&self.cache, id, descriptors.peek_rest())?,
        };

        r.skip(4)?; // payload length, the payload runs to the end
        let config = codec.decode(&mut r)?;
        r.finish("system_config");
        Ok(config)
    }

    /// Re-establishes the transport and redoes the handshake, re-querying
    /// the protocol version.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.duplexer.reconnect().await?;
        self.provider = Provider::latest();
        self.handshake().await
    }

    /// Closes the connection politely.
    pub async fn close(&mut self) -> Result<()> {
        self.duplexer.disconnect().await
    }

    async fn run_query(&mut self, params: QueryParameters) -> Result<ExecuteResult> {
        let provider = self.provider.clone();

        let outcome = {
            let mut cx = ProtocolContext {
                duplexer: &mut self.duplexer,
                cache: &self.cache,
                session: &mut self.session,
                config: &self.config,
            };
            match provider.parse_query(&mut cx, &params).await {
                Ok(parsed) => provider.execute_query(&mut cx, &params, &parsed).await,
                Err(err) => Err(err),
            }
        };

        if let Err(err) = &outcome {
            // A command error arrives before the server's ReadyForCommand;
            // realign the stream so the next exchange starts clean.
            if matches!(err, Error::Server(_)) && self.duplexer.is_connected() {
                if let Ok(state) = self.duplexer.drain_to_ready().await {
                    self.session.transaction_state = state;
                }
            }
        }

        outcome
    }

    fn decode_result(result: &ExecuteResult) -> Result<Vec<Value>> {
        result
            .data
            .iter()
            .map(|payload| {
                let mut r = Reader::new(payload);
                let value = result.output.decode(&mut r)?;
                r.finish("result payload");
                Ok(value)
            })
            .collect()
    }

    /// Runs a query returning every result element.
    pub async fn query(&mut self, query: &str, arguments: Option<Value>) -> Result<Vec<Value>> {
        let mut params = QueryParameters::new(query, Cardinality::Many, IoFormat::Binary);
        params.arguments = arguments;
        let result = self.run_query(params).await?;
        Self::decode_result(&result)
    }

    /// Runs a query expected to return at most one element.
    pub async fn query_single(
        &mut self,
        query: &str,
        arguments: Option<Value>,
    ) -> Result<Option<Value>> {
        let mut params = QueryParameters::new(query, Cardinality::AtMostOne, IoFormat::Binary);
        params.arguments = arguments;
        let result = self.run_query(params).await?;
        Ok(Self::decode_result(&result)?.into_iter().next())
    }

    /// Runs a query expected to return exactly one element. The expected
    /// cardinality is enforced server-side.
    pub async fn query_required_single(
        &mut self,
        query: &str,
        arguments: Option<Value>,
    ) -> Result<Value> {
        let mut params = QueryParameters::new(query, Cardinality::One, IoFormat::Binary);
        params.arguments = arguments;
        let result = self.run_query(params).await?;
        Self::decode_result(&result)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::Protocol("server promised exactly one result but sent none".into())
            })
    }

    /// Runs a query returning its results as one JSON document.
    pub async fn query_json(&mut self, query: &str, arguments: Option<Value>) -> Result<String> {
        let mut params = QueryParameters::new(query, Cardinality::Many, IoFormat::Json);
        params.arguments = arguments;
        let result = self.run_query(params).await?;
        match Self::decode_result(&result)?.into_iter().next() {
            Some(Value::Json(text)) | Some(Value::Str(text)) => Ok(text),
            Some(other) => Err(Error::Protocol(format!(
                "expected a json payload, got {}",
                other.kind_name()
            ))),
            None => Ok("[]".to_string()),
        }
    }

    /// Runs a statement, discarding any results.
    pub async fn execute(&mut self, query: &str, arguments: Option<Value>) -> Result<()> {
        let cardinality = Cardinality::Many;
        let mut params = QueryParameters::new(query, cardinality, IoFormat::None);
        params.arguments = arguments;
        self.run_query(params).await.map(|_| ())
    }

    /// Streams a full database dump: the header followed by its blocks.
    pub async fn dump(&mut self) -> Result<(Bytes, Vec<Bytes>)> {
        let mut exchange = DumpExchange::default();
        self.duplexer
            .duplex_and_sync(&mut exchange, &[ClientMessage::Dump])
            .await?;
        if self.duplexer.is_connected() {
            if let Ok(state) = self.duplexer.drain_to_ready().await {
                self.session.transaction_state = state;
            }
        }

        let header = exchange
            .header
            .ok_or_else(|| Error::Protocol("dump completed without a header".into()))?;
        Ok((header, exchange.blocks))
    }

    /// Replays a dump into the (empty) target database.
    pub async fn restore(&mut self, header: Bytes, blocks: Vec<Bytes>) -> Result<()> {
        let mut ready = RestoreReadyExchange::default();
        self.duplexer
            .duplex(
                &mut ready,
                &[ClientMessage::Restore {
                    jobs: 1,
                    header_data: header,
                }],
            )
            .await?;

        let mut packets: Vec<ClientMessage> = blocks
            .into_iter()
            .map(|data| ClientMessage::RestoreBlock { data })
            .collect();
        packets.push(ClientMessage::RestoreEof);

        let mut complete = RestoreCompleteExchange::default();
        self.duplexer.duplex(&mut complete, &packets).await
    }
}

#[derive(Default)]
struct DumpExchange {
    header: Option<Bytes>,
    blocks: Vec<Bytes>,
}

impl<C: Connect> DuplexHandler<C> for DumpExchange {
    async fn handle(
        &mut self,
        frame: Frame,
        _conn: &mut Duplexer<C>,
        token: &mut DuplexToken,
    ) -> Result<()> {
        match crate::messages::server::decode(&frame)? {
            ServerMessage::DumpHeader { data } => self.header = Some(data),
            ServerMessage::DumpBlock { data } => self.blocks.push(data),
            ServerMessage::CommandComplete { .. } => token.finish_duplexing(),
            ServerMessage::ErrorResponse(err) => {
                token.finish_exceptionally(Error::Server(err));
            }
            other => {
                tracing::debug!(message = other.name(), "ignoring message during dump");
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct RestoreReadyExchange;

impl<C: Connect> DuplexHandler<C> for RestoreReadyExchange {
    async fn handle(
        &mut self,
        frame: Frame,
        _conn: &mut Duplexer<C>,
        token: &mut DuplexToken,
    ) -> Result<()> {
        match crate::messages::server::decode(&frame)? {
            ServerMessage::RestoreReady { .. } => token.finish_duplexing(),
            ServerMessage::ErrorResponse(err) => {
                token.finish_exceptionally(Error::Server(err));
            }
            other => {
                tracing::debug!(message = other.name(), "ignoring message during restore");
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct RestoreCompleteExchange;

impl<C: Connect> DuplexHandler<C> for RestoreCompleteExchange {
    async fn handle(
        &mut self,
        frame: Frame,
        _conn: &mut Duplexer<C>,
        token: &mut DuplexToken,
    ) -> Result<()> {
        match crate::messages::server::decode(&frame)? {
            ServerMessage::CommandComplete { .. } => token.finish_duplexing(),
            ServerMessage::ErrorResponse(err) => {
                token.finish_exceptionally(Error::Server(err));
            }
            other => {
                tracing::debug!(message = other.name(), "ignoring message during restore");
            }
        }
        Ok(())
    }
}

/// A pool of client handles sharing one codec cache.
///
/// Leases are bounded by a [`PoolHolder`]; callers queue in arrival order
/// when every slot is out. A `suggested_pool_concurrency` announced by the
/// server resizes the pool in place.
pub struct ClientPool<C: Connect + Clone> {
    connector: C,
    options: ConnectionOptions,
    config: ClientConfig,
    holder: PoolHolder,
    cache: Arc<CodecCache>,
    idle: Arc<Mutex<Vec<Client<C>>>>,
}

impl<C: Connect + Clone> ClientPool<C> {
    pub fn new(connector: C, options: ConnectionOptions, config: ClientConfig) -> Self {
        let holder = PoolHolder::new(config.pool_size);
        ClientPool {
            connector,
            options,
            config,
            holder,
            cache: Arc::new(CodecCache::new()),
            idle: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn available_slots(&self) -> usize {
        self.holder.size().saturating_sub(self.holder.in_use())
    }

    /// Leases a client, opening a fresh connection when no idle handle
    /// exists.
    pub async fn acquire(&self) -> Result<PooledClient<C>> {
        let contract = self.holder.acquire_contract().await;

        let reused = self.idle.lock().unwrap().pop();
        let client = match reused {
            Some(client) if client.is_connected() => client,
            _ => {
                let client = Client::establish_with_cache(
                    self.connector.clone(),
                    self.options.clone(),
                    self.config.clone(),
                    self.cache.clone(),
                )
                .await?;
                if let Some(suggested) = client.suggested_pool_concurrency() {
                    self.holder.resize(suggested);
                }
                client
            }
        };

        Ok(PooledClient {
            client: Some(client),
            idle: self.idle.clone(),
            contract: Some(contract),
        })
    }

    /// Runs `body` in a transaction using the pool's configured retry
    /// budget.
    pub async fn transaction_default<T, F>(&self, body: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a Transaction<C>) -> BoxFuture<'a, Result<T>>,
    {
        let settings = TransactionSettings {
            retry_attempts: self.config.retry_attempts,
            ..TransactionSettings::default()
        };
        self.transaction(settings, body).await
    }

    /// Runs `body` in a retrying transaction on a leased client.
    pub async fn transaction<T, F>(&self, settings: TransactionSettings, body: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a Transaction<C>) -> BoxFuture<'a, Result<T>>,
    {
        let mut leased = self.acquire().await?;
        let client = leased.client.take().expect("lease always holds a client");

        let shared = Arc::new(AsyncMutex::new(client));
        let result = Transaction::run(shared.clone(), settings, body).await;

        match Arc::try_unwrap(shared) {
            Ok(mutex) => leased.client = Some(mutex.into_inner()),
            Err(_) => tracing::warn!("transaction body leaked its client handle"),
        }

        result
    }
}

/// A leased client. Dereferences to [`Client`]; dropping returns the
/// handle to the pool and releases the slot, waking the next waiter.
pub struct PooledClient<C: Connect> {
    client: Option<Client<C>>,
    idle: Arc<Mutex<Vec<Client<C>>>>,
    contract: Option<PoolContract>,
}

impl<C: Connect> std::ops::Deref for PooledClient<C> {
    type Target = Client<C>;

    fn deref(&self) -> &Client<C> {
        self.client.as_ref().expect("lease already released")
    }
}

impl<C: Connect> std::ops::DerefMut for PooledClient<C> {
    fn deref_mut(&mut self) -> &mut Client<C> {
        self.client.as_mut().expect("lease already released")
    }
}

impl<C: Connect> Drop for PooledClient<C> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if client.is_connected() {
                self.idle.lock().unwrap().push(client);
            }
        }
        // Dropping the contract returns the slot.
        self.contract.take();
    }
}
