//! # sql-insight
//!
//! Ask a relational database a question in plain language and get back a safe,
//! bounded query, its rows, a chart description and a short narrative.
//!
//! ## Pipeline
//!
//! 1. Schema introspection of the target connection
//! 2. Query synthesis (explicit SQL passes through, questions go to a [`SqlGenerator`])
//! 3. Validation: single read-only statement, grounded in the schema, row bounded
//! 4. Execution with a timeout and a result size limit
//! 5. Chart selection and insight generation, in parallel
//!
//! A later request can feed the same query to the trend analyzer for a
//! forward-looking report.
//!
//! ## Supported engines
//!
//! - SQLite, PostgreSQL and MySQL through sqlx
//! - SQL Server connection strings are understood and queries are validated
//!   with its dialect, but no driver is compiled in
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use axum::Router;
//! use sql_insight::{EngineConfig, QueryEngine, QueryEngineLayer};
//! use sql_insight::llm::providers::pattern::PatternSqlGenerator;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = QueryEngine::new(EngineConfig::default(), Arc::new(PatternSqlGenerator::new()));
//!
//!     let app: Router = QueryEngineLayer::new("/api", engine).into_router();
//!
//!     // Serve the application...
//! }
//! ```

// Public modules
pub mod api;
pub mod cache;
pub mod chart;
pub mod collaborators;
pub mod config;
pub mod connection;
pub mod database;
pub mod executor;
pub mod insight;
pub mod layer;
pub mod llm;
pub mod pipeline;
pub mod result;
pub mod schema;
pub mod synthesizer;
pub mod trend;
pub mod validator;

// Public exports
pub use cache::SchemaCache;
pub use chart::{ChartHint, ChartKind, ChartSpec};
pub use config::EngineConfig;
pub use connection::{ConnectionDescriptor, EngineKind};
pub use layer::QueryEngineLayer;
pub use llm::{LlmError, SqlGenerator};
pub use pipeline::{ExecuteResponse, PredictiveRequest, PredictiveResponse, QueryEngine, QueryRequest};
pub use result::{ResultColumn, ResultSet, ScalarValue, SemanticType};
pub use schema::{ColumnInfo, KeyRole, SchemaSnapshot, TableSchema};
pub use synthesizer::{CandidateQuery, Provenance};
pub use trend::{TrendDirection, TrendReport};
pub use validator::{UnsafeRule, ValidatedQuery};

// Re-export database providers
pub use database::traits::DatabaseProvider;

#[cfg(feature = "sqlite")]
pub use database::sqlite::SqliteProvider;

#[cfg(feature = "postgres")]
pub use database::postgres::PostgresProvider;

#[cfg(feature = "mysql")]
pub use database::mysql::MySqlProvider;

// Error type
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The database could not be reached or the connection string is unusable
    #[error("Connection error: {0}")]
    Connection(String),

    /// Metadata queries failed while building the schema snapshot
    #[error("Introspection error: {0}")]
    Introspection(String),

    /// The question cannot be answered from the tables and columns available
    #[error("Ungrounded query: {0}")]
    UngroundedQuery(String),

    /// The candidate query broke a safety rule
    #[error("Unsafe query, rule '{rule}' violated: {detail}")]
    UnsafeQuery { rule: UnsafeRule, detail: String },

    /// The engine rejected the query
    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Query timed out after {} seconds", .0.as_secs_f64())]
    ExecutionTimeout(Duration),

    #[error("Result too large: about {actual} bytes, limit is {limit} bytes")]
    ResultTooLarge { limit: usize, actual: usize },

    /// Fewer than two ordered data points to analyze
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// The request itself is malformed (no question or SQL, zero row limit)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The SQL generator backend failed
    #[error("SQL generator error: {0}")]
    Generator(String),
}

/// Transport-level class of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The request or the query derived from it is at fault
    Client,
    /// Execution or infrastructure failed
    Service,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::UngroundedQuery(_)
            | Error::UnsafeQuery { .. }
            | Error::InsufficientData(_)
            | Error::InvalidRequest(_) => ErrorClass::Client,
            Error::Connection(_)
            | Error::Introspection(_)
            | Error::Execution(_)
            | Error::ExecutionTimeout(_)
            | Error::ResultTooLarge { .. }
            | Error::Generator(_) => ErrorClass::Service,
        }
    }

    /// Stable name of the error kind, as reported to API clients
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Connection(_) => "ConnectionError",
            Error::Introspection(_) => "IntrospectionError",
            Error::UngroundedQuery(_) => "UngroundedQueryError",
            Error::UnsafeQuery { .. } => "UnsafeQueryError",
            Error::Execution(_) => "ExecutionError",
            Error::ExecutionTimeout(_) => "ExecutionTimeoutError",
            Error::ResultTooLarge { .. } => "ResultTooLargeError",
            Error::InsufficientData(_) => "InsufficientDataError",
            Error::InvalidRequest(_) => "InvalidRequestError",
            Error::Generator(_) => "GeneratorError",
        }
    }

    pub(crate) fn unsafe_query(rule: UnsafeRule, detail: impl Into<String>) -> Self {
        Error::UnsafeQuery {
            rule,
            detail: detail.into(),
        }
    }
}

impl From<LlmError> for Error {
    fn from(error: LlmError) -> Self {
        match error {
            LlmError::Ungrounded(message) => Error::UngroundedQuery(message),
            other => Error::Generator(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
