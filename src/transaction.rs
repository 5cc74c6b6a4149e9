//! Transactions: serialized statements with server-driven retry.
//!
//! A transaction binds to one client handle. Statements execute one at a
//! time under a non-reentrant async lock; each statement gets a bounded
//! retry budget consumed only by errors the server marks retryable. A
//! failure outside the budget rolls the transaction back before
//! propagating; success of the body commits.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::Mutex as AsyncMutex;

use crate::client::Client;
use crate::duplex::Connect;
use crate::error::{Error, Result};
use crate::value::Value;

/// Client-side transaction lifecycle. `Committed` and `RolledBack` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Initial,
    InTransaction,
    Committed,
    RolledBack,
}

/// Server-side isolation level requested at `start transaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    #[default]
    Serializable,
    RepeatableRead,
}

impl Isolation {
    fn as_sql(self) -> &'static str {
        match self {
            Isolation::Serializable => "serializable",
            Isolation::RepeatableRead => "repeatable read",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransactionSettings {
    pub isolation: Isolation,
    pub read_only: bool,
    pub deferrable: bool,
    /// Statement retries allowed beyond the first attempt.
    pub retry_attempts: u32,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        TransactionSettings {
            isolation: Isolation::Serializable,
            read_only: false,
            deferrable: false,
            retry_attempts: 2,
        }
    }
}

impl TransactionSettings {
    fn start_statement(&self) -> String {
        let mut stmt = format!("start transaction isolation {}", self.isolation.as_sql());
        stmt.push_str(if self.read_only {
            ", read only"
        } else {
            ", read write"
        });
        if self.deferrable {
            stmt.push_str(", deferrable");
        }
        stmt
    }
}

/// An in-flight transaction over a shared client handle.
pub struct Transaction<C: Connect> {
    client: Arc<AsyncMutex<Client<C>>>,
    settings: TransactionSettings,
    status: Mutex<TransactionStatus>,
    /// Serializes statements within the transaction. Not re-entrant:
    /// issuing a statement from inside another statement's critical
    /// section deadlocks.
    statement_lock: AsyncMutex<()>,
}

impl<C: Connect> Transaction<C> {
    pub fn new(client: Arc<AsyncMutex<Client<C>>>, settings: TransactionSettings) -> Self {
        Transaction {
            client,
            settings,
            status: Mutex::new(TransactionStatus::Initial),
            statement_lock: AsyncMutex::new(()),
        }
    }

    pub fn status(&self) -> TransactionStatus {
        *self.status.lock().unwrap()
    }

    fn set_status(&self, status: TransactionStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Runs `body` inside a transaction: BEGIN, the body, then COMMIT on
    /// success or ROLLBACK on failure. The error that caused a rollback is
    /// propagated unchanged.
    pub async fn run<T, F>(
        client: Arc<AsyncMutex<Client<C>>>,
        settings: TransactionSettings,
        body: F,
    ) -> Result<T>
    where
        F: for<'a> FnOnce(&'a Transaction<C>) -> BoxFuture<'a, Result<T>>,
    {
        let tx = Transaction::new(client, settings);
        tx.start().await?;

        match body(&tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(%rollback_err, "rollback after a failed transaction body");
                }
                Err(err)
            }
        }
    }

    async fn start(&self) -> Result<()> {
        if self.status() != TransactionStatus::Initial {
            return Err(Error::Configuration(
                "transaction was already started".into(),
            ));
        }
        let statement = self.settings.start_statement();
        self.client.lock().await.execute(&statement, None).await?;
        self.set_status(TransactionStatus::InTransaction);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.expect_in_transaction()?;
        self.client.lock().await.execute("commit", None).await?;
        self.set_status(TransactionStatus::Committed);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.expect_in_transaction()?;
        self.client.lock().await.execute("rollback", None).await?;
        self.set_status(TransactionStatus::RolledBack);
        Ok(())
    }

    fn expect_in_transaction(&self) -> Result<()> {
        match self.status() {
            TransactionStatus::InTransaction => Ok(()),
            status => Err(Error::Configuration(format!(
                "transaction is {status:?}, expected InTransaction"
            ))),
        }
    }

    /// Runs a statement returning its full result set.
    pub async fn query(&self, query: &str, arguments: Option<Value>) -> Result<Vec<Value>>
    where
        C: 'static,
    {
        let _statement = self.statement_lock.lock().await;
        self.with_retry(|client| {
            let query = query.to_string();
            let arguments = arguments.clone();
            Box::pin(async move { client.lock().await.query(&query, arguments).await })
        })
        .await
    }

    /// Runs a statement returning at most one element.
    pub async fn query_single(&self, query: &str, arguments: Option<Value>) -> Result<Option<Value>>
    where
        C: 'static,
    {
        let _statement = self.statement_lock.lock().await;
        self.with_retry(|client| {
            let query = query.to_string();
            let arguments = arguments.clone();
            Box::pin(async move { client.lock().await.query_single(&query, arguments).await })
        })
        .await
    }

    /// Runs a statement discarding any result.
    pub async fn execute(&self, query: &str, arguments: Option<Value>) -> Result<()>
    where
        C: 'static,
    {
        let _statement = self.statement_lock.lock().await;
        self.with_retry(|client| {
            let query = query.to_string();
            let arguments = arguments.clone();
            Box::pin(async move { client.lock().await.execute(&query, arguments).await })
        })
        .await
    }

    async fn with_retry<T, F>(&self, mut attempt: F) -> Result<T>
    where
        C: 'static,
        F: FnMut(Arc<AsyncMutex<Client<C>>>) -> BoxFuture<'static, Result<T>>,
    {
        run_with_retry(self.settings.retry_attempts, || attempt(self.client.clone())).await
    }
}

/// Retries `attempt` while it fails with server-flagged retryable errors,
/// up to `retry_attempts` retries beyond the first try. The final failure
/// is wrapped in [`Error::Transaction`]; a non-retryable error propagates
/// after a single attempt.
pub(crate) async fn run_with_retry<T, F, Fut>(retry_attempts: u32, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if err.should_retry() => {
                if attempts > retry_attempts {
                    return Err(Error::Transaction {
                        attempts,
                        source: Box::new(err),
                    });
                }
                tracing::debug!(attempts, "retrying statement after retryable error");
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, ErrorSeverity, ServerError};

    fn retryable_error() -> Error {
        Error::Server(ServerError::new(
            ErrorSeverity::Error,
            ErrorCode::TRANSACTION_CONFLICT,
            "serialization conflict".into(),
            vec![],
        ))
    }

    fn fatal_error() -> Error {
        Error::Server(ServerError::new(
            ErrorSeverity::Error,
            ErrorCode::CONSTRAINT_VIOLATION,
            "unique constraint".into(),
            vec![],
        ))
    }

    #[tokio::test]
    async fn test_retryable_error_exhausts_budget() {
        let calls = std::cell::Cell::new(0u32);
        let err = run_with_retry(2, || {
            calls.set(calls.get() + 1);
            async { Err::<(), _>(retryable_error()) }
        })
        .await
        .unwrap_err();

        // retry_attempts + 1 total attempts, then the wrapper.
        assert_eq!(calls.get(), 3);
        match err {
            Error::Transaction { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(source.should_retry());
            }
            other => panic!("expected a transaction error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_error_attempts_once() {
        let calls = std::cell::Cell::new(0u32);
        let err = run_with_retry(5, || {
            calls.set(calls.get() + 1);
            async { Err::<(), _>(fatal_error()) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.get(), 1);
        assert!(matches!(err, Error::Server(_)));
    }

    #[tokio::test]
    async fn test_success_after_retry() {
        let calls = std::cell::Cell::new(0u32);
        let value = run_with_retry(2, || {
            calls.set(calls.get() + 1);
            let attempt = calls.get();
            async move {
                if attempt < 3 {
                    Err(retryable_error())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
    }

    #[test]
    fn test_start_statement_rendering() {
        let settings = TransactionSettings {
            isolation: Isolation::Serializable,
            read_only: true,
            deferrable: true,
            retry_attempts: 0,
        };
        assert_eq!(
            settings.start_statement(),
            "start transaction isolation serializable, read only, deferrable"
        );
    }
}
