//! Connection configuration and establishment.
//!
//! The builder collects target and credential options, opens a transport
//! through a [`Connect`] implementation, and drives the handshake:
//! client-handshake, optional protocol-version negotiation, SCRAM-SHA-256
//! authentication, then server parameters until `ReadyForCommand`.
//! Credential/DSN file resolution and TLS setup live outside this crate;
//! any pre-upgraded stream works.

use std::time::Duration;

use bytes::Bytes;
use scram::ScramClient;

use crate::client::Client;
use crate::duplex::{Connect, DuplexHandler, DuplexToken, Duplexer, TcpConnector};
use crate::error::{Error, Result};
use crate::messages::server::{AuthenticationStatus, ServerMessage};
use crate::messages::{ClientMessage, Frame};
use crate::proto::{Provider, ProtocolVersion, TransactionState};

/// Authentication mode for a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthenticationMode {
    /// Trust authentication (no password required).
    Trust,
    /// SCRAM-SHA-256 password authentication.
    Password(String),
}

/// Resolved connection target and credentials.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,
    pub branch: Option<String>,
    pub secret_key: Option<String>,
    pub auth: AuthenticationMode,
}

impl ConnectionOptions {
    /// The key/value parameters sent in the client handshake.
    pub fn handshake_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("user".to_string(), self.user.clone()),
            ("database".to_string(), self.database.clone()),
        ];
        if let Some(branch) = &self.branch {
            params.push(("branch".to_string(), branch.clone()));
        }
        if let Some(secret_key) = &self.secret_key {
            params.push(("secret_key".to_string(), secret_key.clone()));
        }
        params
    }
}

/// Client behavior knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on any single message wait.
    pub message_timeout: Duration,
    /// Server-side cap on implicit result set sizes; zero means none.
    pub implicit_limit: u64,
    pub implicit_type_ids: bool,
    pub explicit_object_ids: bool,
    /// Per-statement retry budget inside transactions.
    pub retry_attempts: u32,
    /// Concurrent leases the client pool hands out.
    pub pool_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            message_timeout: Duration::from_secs(15),
            implicit_limit: 0,
            implicit_type_ids: false,
            explicit_object_ids: true,
            retry_attempts: 2,
            pool_size: 10,
        }
    }
}

/// Builder for configuring and establishing connections.
///
/// Defaults to trust authentication and the newest supported protocol.
pub struct ConnectionBuilder {
    options: ConnectionOptions,
    config: ClientConfig,
}

impl ConnectionBuilder {
    pub fn new(user: impl Into<String>) -> Self {
        let user = user.into();
        ConnectionBuilder {
            options: ConnectionOptions {
                host: "localhost".into(),
                port: 5656,
                database: user.clone(),
                user,
                branch: None,
                secret_key: None,
                auth: AuthenticationMode::Trust,
            },
            config: ClientConfig::default(),
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.options.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.options.port = port;
        self
    }

    /// Sets the database name. Defaults to the user name.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.options.database = database.into();
        self
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.options.branch = Some(branch.into());
        self
    }

    pub fn secret_key(mut self, key: impl Into<String>) -> Self {
        self.options.secret_key = Some(key.into());
        self
    }

    pub fn auth(mut self, auth: AuthenticationMode) -> Self {
        self.options.auth = auth;
        self
    }

    pub fn message_timeout(mut self, timeout: Duration) -> Self {
        self.config.message_timeout = timeout;
        self
    }

    pub fn implicit_limit(mut self, limit: u64) -> Self {
        self.config.implicit_limit = limit;
        self
    }

    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.config.retry_attempts = attempts;
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size;
        self
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connects over plain TCP to the configured host and port.
    pub async fn connect(self) -> Result<Client<TcpConnector>> {
        let connector = TcpConnector::new(self.options.host.clone(), self.options.port);
        self.connect_with(connector).await
    }

    /// Connects over a caller-supplied transport, e.g. an in-memory pipe in
    /// tests or a stream already upgraded to TLS.
    pub async fn connect_with<C: Connect>(self, connector: C) -> Result<Client<C>> {
        Client::establish(connector, self.options, self.config).await
    }
}

enum AuthPhase<'a> {
    NotStarted,
    AwaitingServerFirst(scram::client::ServerFirst<'a>),
    AwaitingServerFinal(scram::client::ServerFinal),
    Complete,
}

/// The handshake exchange: one state machine fed by the duplex loop.
pub(crate) struct HandshakeExchange<'a> {
    pub options: &'a ConnectionOptions,
    pub provider: Provider,
    /// Version the server asked for when it differs from ours.
    pub negotiated: Option<ProtocolVersion>,
    pub transaction_state: TransactionState,
    pub parameters: Vec<(String, Bytes)>,
    pub server_key: Option<[u8; 32]>,
    pub state_description: Option<(uuid::Uuid, Bytes)>,
    auth: AuthPhase<'a>,
}

impl<'a> HandshakeExchange<'a> {
    pub fn new(options: &'a ConnectionOptions, provider: Provider) -> Self {
        HandshakeExchange {
            options,
            provider,
            negotiated: None,
            transaction_state: TransactionState::NotInTransaction,
            parameters: Vec::new(),
            server_key: None,
            state_description: None,
            auth: AuthPhase::NotStarted,
        }
    }

    fn password(&self) -> Result<&'a str> {
        match &self.options.auth {
            AuthenticationMode::Password(password) => Ok(password),
            AuthenticationMode::Trust => Err(Error::Configuration(
                "server requires a password, but none was configured".into(),
            )),
        }
    }

    fn start_sasl(&mut self, methods: &[String]) -> Result<ClientMessage> {
        const MECHANISM: &str = "SCRAM-SHA-256";

        if !methods.iter().any(|m| m == MECHANISM) {
            return Err(Error::Configuration(format!(
                "no supported authentication mechanism; server offers {methods:?}"
            )));
        }

        let scram = ScramClient::new(&self.options.user, self.password()?, None);
        let (server_first, client_first) = scram.client_first();
        self.auth = AuthPhase::AwaitingServerFirst(server_first);

        Ok(ClientMessage::AuthenticationSaslInitialResponse {
            method: MECHANISM.to_string(),
            payload: Bytes::from(client_first.into_bytes()),
        })
    }

    fn continue_sasl(&mut self, data: &[u8]) -> Result<ClientMessage> {
        let phase = std::mem::replace(&mut self.auth, AuthPhase::NotStarted);
        let AuthPhase::AwaitingServerFirst(scram) = phase else {
            return Err(Error::Protocol(
                "server sent SASL continue outside an authentication exchange".into(),
            ));
        };

        let server_first = std::str::from_utf8(data)
            .map_err(|e| Error::Protocol(format!("invalid SASL payload: {e}")))?;
        let scram = scram
            .handle_server_first(server_first)
            .map_err(|e| Error::Configuration(format!("SCRAM handshake failed: {e}")))?;
        let (server_final, client_final) = scram.client_final();
        self.auth = AuthPhase::AwaitingServerFinal(server_final);

        Ok(ClientMessage::AuthenticationSaslResponse {
            payload: Bytes::from(client_final.into_bytes()),
        })
    }

    fn finish_sasl(&mut self, data: &[u8]) -> Result<()> {
        let phase = std::mem::replace(&mut self.auth, AuthPhase::Complete);
        let AuthPhase::AwaitingServerFinal(scram) = phase else {
            return Err(Error::Protocol(
                "server sent SASL final outside an authentication exchange".into(),
            ));
        };

        let server_final = std::str::from_utf8(data)
            .map_err(|e| Error::Protocol(format!("invalid SASL payload: {e}")))?;
        scram
            .handle_server_final(server_final)
            .map_err(|e| Error::Configuration(format!("server signature mismatch: {e}")))?;
        Ok(())
    }
}

impl<C: Connect> DuplexHandler<C> for HandshakeExchange<'_> {
    async fn handle(
        &mut self,
        frame: Frame,
        conn: &mut Duplexer<C>,
        token: &mut DuplexToken,
    ) -> Result<()> {
        let message = self.provider.read_packet(&frame)?;
        tracing::debug!(message = message.name(), "handshake step");

        match message {
            ServerMessage::ServerHandshake { major, minor, .. } => {
                let ours = self.provider.version();
                let theirs = ProtocolVersion::of(major, minor);
                if theirs != ours {
                    match Provider::for_version(theirs) {
                        Some(provider) => {
                            tracing::debug!(%theirs, "negotiated protocol downgrade");
                            self.provider = provider;
                            self.negotiated = Some(theirs);
                        }
                        None if theirs.major != ours.major => {
                            token.finish_exceptionally(Error::Configuration(format!(
                                "server requires protocol {theirs}, this client speaks {ours}"
                            )));
                        }
                        None => {
                            tracing::warn!(
                                %theirs, %ours,
                                "minor protocol mismatch; functionality may be limited"
                            );
                        }
                    }
                }
            }
            ServerMessage::Authentication(status) => match status {
                AuthenticationStatus::Ok => {
                    self.auth = AuthPhase::Complete;
                }
                AuthenticationStatus::RequiredSasl { methods } => {
                    let response = self.start_sasl(&methods)?;
                    conn.send(&[response]).await?;
                }
                AuthenticationStatus::SaslContinue { data } => {
                    let response = self.continue_sasl(&data)?;
                    conn.send(&[response]).await?;
                }
                AuthenticationStatus::SaslFinal { data } => {
                    self.finish_sasl(&data)?;
                }
            },
            ServerMessage::ParameterStatus { name, value } => {
                self.parameters.push((name, value));
            }
            ServerMessage::ServerKeyData { key } => {
                self.server_key = Some(key);
            }
            ServerMessage::StateDataDescription { id, descriptors } => {
                self.state_description = Some((id, descriptors));
            }
            ServerMessage::LogMessage { severity, text, .. } => {
                log_server_message(severity, &text);
            }
            ServerMessage::ErrorResponse(err) => {
                token.finish_exceptionally(Error::Server(err));
            }
            ServerMessage::ReadyForCommand { transaction_state } => {
                self.transaction_state = transaction_state;
                token.finish_duplexing();
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected message during handshake: {}",
                    other.name()
                )));
            }
        }

        Ok(())
    }
}

pub(crate) fn log_server_message(severity: crate::messages::server::LogSeverity, text: &str) {
    use crate::messages::server::LogSeverity;
    match severity {
        LogSeverity::Debug => tracing::debug!(target: "quarry_client::server", "{text}"),
        LogSeverity::Info | LogSeverity::Notice => {
            tracing::info!(target: "quarry_client::server", "{text}")
        }
        LogSeverity::Warning => tracing::warn!(target: "quarry_client::server", "{text}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = ConnectionBuilder::new("alice");
        assert_eq!(builder.options().user, "alice");
        assert_eq!(builder.options().database, "alice");
        assert_eq!(builder.options().auth, AuthenticationMode::Trust);
    }

    #[test]
    fn test_handshake_params() {
        let builder = ConnectionBuilder::new("alice")
            .database("catalog")
            .branch("main");
        let params = builder.options().handshake_params();
        assert!(params.contains(&("user".to_string(), "alice".to_string())));
        assert!(params.contains(&("database".to_string(), "catalog".to_string())));
        assert!(params.contains(&("branch".to_string(), "main".to_string())));
    }

    #[test]
    fn test_password_required() {
        let options = ConnectionBuilder::new("alice").options().clone();
        let mut exchange = HandshakeExchange::new(&options, Provider::latest());
        let err = exchange
            .start_sasl(&["SCRAM-SHA-256".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_unsupported_mechanism() {
        let options = ConnectionBuilder::new("alice")
            .auth(AuthenticationMode::Password("hunter2".into()))
            .options()
            .clone();
        let mut exchange = HandshakeExchange::new(&options, Provider::latest());
        let err = exchange
            .start_sasl(&["OAUTHBEARER".to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
