//! SQLite database provider implementation

use crate::config::EngineConfig;
use crate::connection::{ConnectionDescriptor, EngineKind};
use crate::database::traits::{introspection_error, DatabaseError, DatabaseProvider, ExecutionLimits, ResultBudget};
use crate::result::{ResultSet, ScalarValue};
use crate::schema::{ColumnInfo, KeyRole, SchemaSnapshot, TableSchema};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Executor, Row, Sqlite, SqlitePool, Statement, TypeInfo, ValueRef};
use std::collections::HashSet;
use std::str::FromStr;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

/// SQLite database provider
pub struct SqliteProvider {
    pool: SqlitePool,
}

impl SqliteProvider {
    /// Create a new SQLite provider
    ///
    /// # Arguments
    ///
    /// * `pool` - SQLite connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a read-only pool for the descriptor
    ///
    /// The database file must already exist.
    pub async fn connect(descriptor: &ConnectionDescriptor, config: &EngineConfig) -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::from_str(descriptor.driver_uri())
            .map_err(|error| DatabaseError::Connection(error.to_string()))?
            .read_only(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect_with(options)
            .await
            .map_err(|error| DatabaseError::Connection(error.to_string()))?;

        Ok(Self::new(pool))
    }

    /// Convert one SQLite row into typed cells, charging them to the budget
    fn row_to_values(row: &SqliteRow, budget: &mut ResultBudget) -> Result<Vec<ScalarValue>, DatabaseError> {
        let values = (0..row.columns().len())
            .map(|index| Self::extract_column_value(row, index, budget))
            .collect::<Result<Vec<_>, _>>()?;
        budget.charge_row(&values)?;
        Ok(values)
    }

    /// Extract a column value from a SQLite row
    fn extract_column_value(
        row: &SqliteRow,
        index: usize,
        budget: &mut ResultBudget,
    ) -> Result<ScalarValue, DatabaseError> {
        let raw = row
            .try_get_raw(index)
            .map_err(|error| DatabaseError::Query(error.to_string()))?;

        if raw.is_null() {
            return Ok(ScalarValue::Null);
        }

        // SQLite reports storage classes: INTEGER, REAL, TEXT, BLOB, NULL
        let type_name = raw.type_info().name().to_ascii_uppercase();

        match type_name.as_str() {
            "INTEGER" | "INT" | "BIGINT" | "INT8" => {
                if let Ok(value) = row.try_get::<i64, _>(index) {
                    return Ok(ScalarValue::Integer(value));
                }
            }
            "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => {
                if let Ok(value) = row.try_get::<f64, _>(index) {
                    return Ok(ScalarValue::Float(value));
                }
            }
            "BOOLEAN" | "BOOL" => {
                if let Ok(value) = row.try_get::<bool, _>(index) {
                    return Ok(ScalarValue::Boolean(value));
                }
            }
            "BLOB" => {
                if let Ok(bytes) = row.try_get::<&[u8], _>(index) {
                    budget.charge(bytes.len())?;
                    return Ok(ScalarValue::binary(bytes.len()));
                }
            }
            _ => {
                // TEXT, and the DATE/DATETIME affinities SQLite stores as text
                if let Ok(value) = row.try_get::<String, _>(index) {
                    return Ok(ScalarValue::Text(value));
                }
            }
        }

        // Fallback: try common types in order
        if let Ok(value) = row.try_get::<i64, _>(index) {
            return Ok(ScalarValue::Integer(value));
        }
        if let Ok(value) = row.try_get::<f64, _>(index) {
            return Ok(ScalarValue::Float(value));
        }
        if let Ok(value) = row.try_get::<String, _>(index) {
            return Ok(ScalarValue::Text(value));
        }

        Ok(ScalarValue::Null)
    }

    /// Column names and declared types; expression columns have no declared type
    fn column_metadata<'a>(columns: impl Iterator<Item = &'a sqlx::sqlite::SqliteColumn>) -> Vec<(String, Option<String>)> {
        columns
            .map(|column| {
                let type_name = column.type_info().name();
                let declared = (!type_name.eq_ignore_ascii_case("NULL")).then(|| type_name.to_string());
                (column.name().to_string(), declared)
            })
            .collect()
    }

    async fn run_query(
        connection: &mut PoolConnection<Sqlite>,
        sql: &str,
        limits: &ExecutionLimits,
    ) -> Result<ResultSet, DatabaseError> {
        let mut budget = ResultBudget::new(limits);
        let mut columns = None;
        let mut values = Vec::new();

        let mut rows = sqlx::query(sql).fetch(&mut **connection);
        while let Some(row) = rows.next().await {
            let row = row?;
            if columns.is_none() {
                let metadata = Self::column_metadata(row.columns().iter());
                budget.charge_header(&metadata)?;
                columns = Some(metadata);
            }
            values.push(Self::row_to_values(&row, &mut budget)?);
        }
        drop(rows);

        let columns = match columns {
            Some(columns) => columns,
            None => {
                // No rows to read the shape from, ask the prepared statement instead
                let statement = (&mut **connection).prepare(sql).await?;
                Self::column_metadata(statement.columns().iter())
            }
        };

        Ok(ResultSet::new(columns, values))
    }

    async fn introspect_table(
        connection: &mut PoolConnection<Sqlite>,
        table: &str,
    ) -> Result<TableSchema, DatabaseError> {
        let quoted = EngineKind::Sqlite.quote_identifier(table);

        // PRAGMA foreign_key_list returns: id, seq, table, from, to, on_update, on_delete, match
        let foreign_key_rows = sqlx::query(&format!("PRAGMA foreign_key_list({})", quoted))
            .fetch_all(&mut **connection)
            .await
            .map_err(introspection_error)?;
        let mut foreign_columns = HashSet::new();
        for row in foreign_key_rows {
            let column: String = row.try_get("from").map_err(introspection_error)?;
            foreign_columns.insert(column);
        }

        // PRAGMA table_info returns: cid, name, type, notnull, dflt_value, pk
        let column_rows = sqlx::query(&format!("PRAGMA table_info({})", quoted))
            .fetch_all(&mut **connection)
            .await
            .map_err(introspection_error)?;

        let mut columns = Vec::with_capacity(column_rows.len());
        for row in column_rows {
            let name: String = row.try_get("name").map_err(introspection_error)?;
            let data_type: String = row.try_get("type").map_err(introspection_error)?;
            let not_null: i64 = row.try_get("notnull").map_err(introspection_error)?;
            let primary_key: i64 = row.try_get("pk").map_err(introspection_error)?;

            let key_role = if primary_key > 0 {
                KeyRole::Primary
            } else if foreign_columns.contains(&name) {
                KeyRole::Foreign
            } else {
                KeyRole::None
            };

            columns.push(ColumnInfo::new(name, data_type, not_null == 0, key_role));
        }

        Ok(TableSchema::new(table, columns))
    }
}

#[async_trait]
impl DatabaseProvider for SqliteProvider {
    fn engine(&self) -> EngineKind {
        EngineKind::Sqlite
    }

    async fn introspect(&self) -> Result<SchemaSnapshot, DatabaseError> {
        let mut connection = self.pool.acquire().await?;

        let table_names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&mut *connection)
        .await
        .map_err(introspection_error)?;

        let mut tables = Vec::with_capacity(table_names.len());
        for name in table_names {
            tables.push(Self::introspect_table(&mut connection, &name).await?);
        }

        debug!(tables = tables.len(), "introspected SQLite schema");
        Ok(SchemaSnapshot::new(EngineKind::Sqlite, tables))
    }

    async fn fetch(&self, sql: &str, limits: &ExecutionLimits) -> Result<ResultSet, DatabaseError> {
        let mut connection = self.pool.acquire().await?;

        let outcome = tokio::time::timeout(limits.timeout, Self::run_query(&mut connection, sql, limits)).await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                // The session may still be busy; close it rather than return it to the pool
                warn!(timeout = ?limits.timeout, "SQLite query timed out, closing session");
                drop(connection.detach());
                Err(DatabaseError::Timeout(limits.timeout))
            }
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn seeded_provider() -> SqliteProvider {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        sqlx::query(
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL, revenue REAL, signed_up DATE)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER REFERENCES customers(id), total REAL)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO customers (name, revenue, signed_up) VALUES ('Acme', 1200.5, '2024-01-03'), ('Globex', 800, '2024-02-11'), ('Initech', NULL, '2024-03-09')",
        )
        .execute(&pool)
        .await
        .unwrap();

        SqliteProvider::new(pool)
    }

    fn limits() -> ExecutionLimits {
        ExecutionLimits {
            timeout: Duration::from_secs(5),
            max_result_bytes: 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn test_introspect_reads_columns_in_order_with_keys() {
        let provider = seeded_provider().await;
        let snapshot = provider.introspect().await.unwrap();

        let customers = snapshot.table("customers").unwrap();
        let names: Vec<&str> = customers.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name", "revenue", "signed_up"]);
        assert_eq!(customers.columns[0].key_role, KeyRole::Primary);
        assert!(!customers.columns[1].nullable);

        let orders = snapshot.table("orders").unwrap();
        assert_eq!(orders.column("customer_id").unwrap().key_role, KeyRole::Foreign);
    }

    #[tokio::test]
    async fn test_fetch_returns_typed_rows() {
        let provider = seeded_provider().await;
        let result = provider
            .fetch("SELECT name, revenue FROM customers ORDER BY id", &limits())
            .await
            .unwrap();

        assert_eq!(result.row_count(), 3);
        assert_eq!(result.rows()[0][0], ScalarValue::Text("Acme".to_string()));
        assert_eq!(result.rows()[0][1], ScalarValue::Float(1200.5));
        assert!(result.rows()[2][1].is_null());
    }

    #[tokio::test]
    async fn test_fetch_empty_result_keeps_columns() {
        let provider = seeded_provider().await;
        let result = provider
            .fetch("SELECT name, revenue FROM customers WHERE 1 = 0", &limits())
            .await
            .unwrap();

        assert!(result.is_empty());
        assert_eq!(result.column_names(), vec!["name", "revenue"]);
    }

    #[tokio::test]
    async fn test_fetch_reports_engine_errors() {
        let provider = seeded_provider().await;
        let error = provider
            .fetch("SELECT missing FROM customers", &limits())
            .await
            .unwrap_err();
        assert!(matches!(error, DatabaseError::Query(_)));
    }

    #[tokio::test]
    async fn test_fetch_enforces_result_size() {
        let provider = seeded_provider().await;
        let tiny = ExecutionLimits {
            timeout: Duration::from_secs(5),
            max_result_bytes: 8,
        };
        let error = provider.fetch("SELECT * FROM customers", &tiny).await.unwrap_err();
        assert!(matches!(error, DatabaseError::TooLarge { limit: 8, .. }));
    }

    #[tokio::test]
    async fn test_fetch_counts_blob_payload_against_limit() {
        let provider = seeded_provider().await;
        let tight = ExecutionLimits {
            timeout: Duration::from_secs(5),
            max_result_bytes: 1024,
        };

        let error = provider
            .fetch("SELECT randomblob(5000000) AS payload FROM customers", &tight)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            DatabaseError::TooLarge { limit: 1024, actual } if actual >= 5_000_000
        ));

        let small = provider
            .fetch("SELECT randomblob(16) AS payload FROM customers LIMIT 1", &tight)
            .await
            .unwrap();
        assert_eq!(small.rows()[0][0], ScalarValue::Text("[BLOB: 16 bytes]".to_string()));
    }

    #[tokio::test]
    async fn test_fetch_stops_at_first_row_over_limit() {
        let provider = seeded_provider().await;
        let tight = ExecutionLimits {
            timeout: Duration::from_secs(5),
            max_result_bytes: 64 * 1024,
        };

        let error = provider
            .fetch(
                "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 1000000) \
                 SELECT i, hex(zeroblob(50)) AS filler FROM n",
                &tight,
            )
            .await
            .unwrap_err();
        assert!(matches!(error, DatabaseError::TooLarge { actual, .. } if actual < 64 * 1024 + 200));

        // The abandoned statement does not block the session
        let result = provider.fetch("SELECT COUNT(*) AS total FROM customers", &limits()).await.unwrap();
        assert_eq!(result.rows()[0][0], ScalarValue::Integer(3));
    }

    #[tokio::test]
    async fn test_connect_is_read_only() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("shop.db");

        let writable = SqlitePoolOptions::new()
            .connect_with(SqliteConnectOptions::new().filename(&path).create_if_missing(true))
            .await
            .unwrap();
        sqlx::query("CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT)")
            .execute(&writable)
            .await
            .unwrap();
        writable.close().await;

        let descriptor = ConnectionDescriptor::parse(&format!("sqlite://{}", path.display())).unwrap();
        let provider = SqliteProvider::connect(&descriptor, &EngineConfig::default())
            .await
            .unwrap();

        let error = provider
            .fetch("INSERT INTO items (label) VALUES ('x')", &limits())
            .await
            .unwrap_err();
        assert!(matches!(error, DatabaseError::Query(_)));
        provider.close().await;
    }

    #[tokio::test]
    async fn test_connect_missing_file_fails() {
        let directory = tempfile::tempdir().unwrap();
        let descriptor =
            ConnectionDescriptor::parse(&format!("sqlite://{}", directory.path().join("absent.db").display()))
                .unwrap();
        let error = SqliteProvider::connect(&descriptor, &EngineConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(error, DatabaseError::Connection(_)));
    }
}
