//! Database abstraction layer
//!
//! This module provides a database-agnostic interface for schema discovery
//! and read-only query execution.

pub mod traits;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

// Re-export the main trait
pub use traits::{DatabaseError, DatabaseProvider, ExecutionLimits};

use crate::config::EngineConfig;
use crate::connection::{ConnectionDescriptor, EngineKind};
use crate::schema::{ColumnInfo, KeyRole, SchemaSnapshot, TableSchema};
use crate::Error;
use tracing::info;

/// Open a provider (and its pool) for the descriptor's engine
///
/// Fails with [`Error::Connection`] when the engine is not compiled in or the
/// database cannot be reached.
pub async fn connect(
    descriptor: &ConnectionDescriptor,
    config: &EngineConfig,
) -> Result<Box<dyn DatabaseProvider>, Error> {
    info!(target_database = %descriptor, engine = %descriptor.engine(), "opening connection pool");

    let provider: Result<Box<dyn DatabaseProvider>, DatabaseError> = match descriptor.engine() {
        #[cfg(feature = "sqlite")]
        EngineKind::Sqlite => sqlite::SqliteProvider::connect(descriptor, config)
            .await
            .map(|provider| Box::new(provider) as Box<dyn DatabaseProvider>),

        #[cfg(feature = "postgres")]
        EngineKind::Postgres => postgres::PostgresProvider::connect(descriptor, config)
            .await
            .map(|provider| Box::new(provider) as Box<dyn DatabaseProvider>),

        #[cfg(feature = "mysql")]
        EngineKind::MySql => mysql::MySqlProvider::connect(descriptor, config)
            .await
            .map(|provider| Box::new(provider) as Box<dyn DatabaseProvider>),

        #[allow(unreachable_patterns)]
        engine => {
            return Err(Error::Connection(format!(
                "no driver for {} is available in this build",
                engine
            )))
        }
    };

    provider.map_err(|error| Error::Connection(error.to_string()))
}

/// Build a complete schema snapshot through the provider
pub async fn introspect(provider: &dyn DatabaseProvider) -> Result<SchemaSnapshot, Error> {
    let snapshot = provider.introspect().await?;
    info!(
        engine = %provider.engine(),
        tables = snapshot.tables.len(),
        "schema introspected"
    );
    Ok(snapshot)
}

impl From<DatabaseError> for Error {
    fn from(error: DatabaseError) -> Self {
        match error {
            DatabaseError::Connection(message) => Error::Connection(message),
            DatabaseError::Introspection(message) => Error::Introspection(message),
            DatabaseError::Query(message) => Error::Execution(message),
            DatabaseError::Timeout(timeout) => Error::ExecutionTimeout(timeout),
            DatabaseError::TooLarge { limit, actual } => Error::ResultTooLarge { limit, actual },
        }
    }
}

/// Group catalog rows `(table, column, type, nullable, key_role)` into a snapshot
///
/// Rows must be ordered by table and then by ordinal position. `key_role` is
/// 2 for primary key members, 1 for foreign key members, 0 otherwise.
#[allow(dead_code)]
pub(crate) fn assemble_snapshot(
    engine: EngineKind,
    rows: Vec<(String, String, String, bool, i64)>,
) -> SchemaSnapshot {
    let mut tables: Vec<TableSchema> = Vec::new();

    for (table, column, data_type, nullable, key_role) in rows {
        let key_role = match key_role {
            2 => KeyRole::Primary,
            1 => KeyRole::Foreign,
            _ => KeyRole::None,
        };
        let column = ColumnInfo::new(column, data_type, nullable, key_role);

        match tables.last_mut() {
            Some(current) if current.name == table => current.columns.push(column),
            _ => tables.push(TableSchema::new(table, vec![column])),
        }
    }

    SchemaSnapshot::new(engine, tables)
}
