//! Store gateway boundary.
//!
//! The lock and the write transaction only ever talk to the backing store
//! through these two traits: a session that executes single statements
//! (autocommit) and opens transactions, and the transaction it opens.
//!
//! ## Rollback
//!
//! Dropping a [`SessionTransaction`] without calling `commit` discards every
//! statement executed through it. `rollback` does the same eagerly and reports
//! failures.

use async_trait::async_trait;
use thiserror::Error;

use super::mutation::Mutation;

/// Transaction isolation levels understood by the gateways.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Gateway fault.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A unique constraint rejected the statement (SQLSTATE `23505`).
    #[error("unique constraint violated in {operation}: {message}")]
    UniqueViolation { operation: String, message: String },

    /// Any other database-reported failure.
    #[error("database error in {operation}{}: {message}", code_suffix(.code))]
    Database {
        operation: String,
        code: Option<String>,
        message: String,
    },

    /// The connection pool was closed.
    #[error("connection pool closed in {0}")]
    PoolClosed(String),

    /// Network, protocol or driver failure.
    #[error("connection error in {operation}: {message}")]
    Connection { operation: String, message: String },
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" [{c}]")).unwrap_or_default()
}

impl StoreError {
    pub fn database(
        operation: impl Into<String>,
        code: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self::Database {
            operation: operation.into(),
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }
}

/// An open session on the backing store.
///
/// Sessions are cheap handles (a pool or a shared table set); clone one per
/// worker or per lock.
#[async_trait]
pub trait StoreSession: Send + Sync {
    /// Schema (table-name prefix) the session operates in.
    fn schema_name(&self) -> &str;

    /// Human-readable description for logs.
    fn describe(&self) -> String {
        format!("schema: {}", self.schema_name())
    }

    /// Execute one statement outside any explicit transaction.
    ///
    /// Returns the number of affected rows.
    async fn execute(&self, mutation: &Mutation) -> Result<u64, StoreError>;

    /// Begin a transaction at the given isolation level.
    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn SessionTransaction>, StoreError>;
}

/// A transaction opened by [`StoreSession::begin`].
#[async_trait]
pub trait SessionTransaction: Send {
    /// Execute one statement inside the transaction.
    async fn execute(&mut self, mutation: &Mutation) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_error_message_includes_code() {
        let err = StoreError::database("trim_list", Some("40001"), "could not serialize access");
        assert_eq!(
            err.to_string(),
            "database error in trim_list [40001]: could not serialize access"
        );

        let err = StoreError::database("trim_list", None, "oops");
        assert_eq!(err.to_string(), "database error in trim_list: oops");
    }

    #[test]
    fn isolation_levels_render_as_sql() {
        assert_eq!(IsolationLevel::RepeatableRead.as_sql(), "REPEATABLE READ");
    }
}
