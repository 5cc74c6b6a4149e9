//! Asynchronous client for the Quarry query server's binary protocol.
//!
//! The crate is organized around the protocol core: length-prefixed
//! [`messages`], position-addressed type [`descriptors`], a [`codec`]
//! compiler with structural-identity caching, two versioned protocol
//! providers under [`proto`], and the duplexing transport in [`duplex`]
//! that every exchange, from queries to authentication and dump/restore,
//! runs through. Pooling and transactional retry sit directly on top.
//!
//! ```no_run
//! use quarry_client::{AuthenticationMode, ConnectionBuilder};
//!
//! # async fn example() -> quarry_client::Result<()> {
//! let mut client = ConnectionBuilder::new("alice")
//!     .host("localhost")
//!     .port(5656)
//!     .auth(AuthenticationMode::Password("secret".into()))
//!     .connect()
//!     .await?;
//!
//! let rows = client.query("select Item { name }", None).await?;
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod descriptors;
pub mod duplex;
pub mod messages;
pub mod proto;
pub mod value;
pub mod wire;

mod client;
mod connect;
mod error;
mod pool;
mod session;
mod transaction;

pub use client::{Client, ClientPool, PooledClient};
pub use connect::{AuthenticationMode, ClientConfig, ConnectionBuilder, ConnectionOptions};
pub use duplex::{Connect, TcpConnector};
pub use error::{Error, ErrorCode, ErrorSeverity, Result, ServerError};
pub use pool::{PoolContract, PoolHolder};
pub use proto::{Capabilities, Cardinality, IoFormat, ProtocolVersion, TransactionState};
pub use session::SessionState;
pub use transaction::{Isolation, Transaction, TransactionSettings, TransactionStatus};
pub use value::{ShapeAdapter, Value};
