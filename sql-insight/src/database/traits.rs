//! Database provider trait
//!
//! This trait defines the interface that all database implementations must provide.

use crate::connection::EngineKind;
use crate::result::{ResultSet, ScalarValue};
use crate::schema::SchemaSnapshot;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Bounds applied to a single statement execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Wall-clock limit for running the statement and materializing its rows
    pub timeout: Duration,

    /// Maximum estimated size of the materialized rows, checked row by row
    pub max_result_bytes: usize,
}

/// Database provider trait for schema discovery and read-only data access
///
/// A provider owns the pool for one connection descriptor. Every call checks
/// a session out of the pool and returns it before the call completes, on
/// success and on failure alike.
#[async_trait]
pub trait DatabaseProvider: Send + Sync + 'static {
    /// Engine this provider talks to
    fn engine(&self) -> EngineKind;

    /// Discover every table and column visible to the connection
    ///
    /// # Returns
    ///
    /// A complete snapshot, or an error. Partial snapshots are never returned.
    async fn introspect(&self) -> Result<SchemaSnapshot, DatabaseError>;

    /// Run one already validated, read-only statement
    ///
    /// # Arguments
    ///
    /// * `sql` - Validated SQL statement
    /// * `limits` - Timeout and result size bound
    ///
    /// # Returns
    ///
    /// Every row of the result, or an error. Rows are streamed and the size
    /// limit is enforced while they arrive. A timed-out session is closed
    /// instead of being returned to the pool.
    async fn fetch(&self, sql: &str, limits: &ExecutionLimits) -> Result<ResultSet, DatabaseError>;

    /// Close the pool and wait for checked-out sessions to be returned
    async fn close(&self);
}

/// Database error type
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A session could not be opened
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Catalog queries failed
    #[error("Introspection failed: {0}")]
    Introspection(String),

    /// The statement failed inside the engine
    #[error("Database error: {0}")]
    Query(String),

    /// Query timeout
    #[error("Query timeout exceeded ({0:?})")]
    Timeout(Duration),

    /// Result set too large
    #[error("Result set too large (at least {actual} bytes, max {limit})")]
    TooLarge { limit: usize, actual: usize },
}

impl From<sqlx::Error> for DatabaseError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Configuration(_) => DatabaseError::Connection(error.to_string()),
            sqlx::Error::Database(database_error) => {
                DatabaseError::Query(database_error.message().to_string())
            }
            other => DatabaseError::Query(other.to_string()),
        }
    }
}

/// Running size of a result while its rows are converted
///
/// Binary cells are charged their payload length, not the length of the
/// placeholder that stands in for them.
#[derive(Debug)]
pub(crate) struct ResultBudget {
    limit: usize,
    used: usize,
}

impl ResultBudget {
    pub(crate) fn new(limits: &ExecutionLimits) -> Self {
        Self {
            limit: limits.max_result_bytes,
            used: 0,
        }
    }

    /// Add `bytes` to the total, failing as soon as it passes the limit
    pub(crate) fn charge(&mut self, bytes: usize) -> Result<(), DatabaseError> {
        self.used = self.used.saturating_add(bytes);
        if self.used > self.limit {
            return Err(DatabaseError::TooLarge {
                limit: self.limit,
                actual: self.used,
            });
        }
        Ok(())
    }

    pub(crate) fn charge_header(&mut self, columns: &[(String, Option<String>)]) -> Result<(), DatabaseError> {
        self.charge(columns.iter().map(|(name, _)| name.len()).sum())
    }

    pub(crate) fn charge_row(&mut self, row: &[ScalarValue]) -> Result<(), DatabaseError> {
        self.charge(row.iter().map(ScalarValue::estimated_bytes).sum())
    }
}

/// Wrap catalog query failures as introspection errors
pub(crate) fn introspection_error(error: sqlx::Error) -> DatabaseError {
    match DatabaseError::from(error) {
        DatabaseError::Connection(message) => DatabaseError::Connection(message),
        other => DatabaseError::Introspection(other.to_string()),
    }
}

/// A column whose type has no typed or text decoding
pub(crate) fn unsupported_type(column: &str, type_name: &str) -> DatabaseError {
    DatabaseError::Query(format!(
        "Column '{}' has unsupported type {}; cast it to text in the query",
        column, type_name
    ))
}
