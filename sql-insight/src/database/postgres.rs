//! PostgreSQL database provider implementation

use crate::config::EngineConfig;
use crate::connection::{ConnectionDescriptor, EngineKind};
use crate::database::assemble_snapshot;
use crate::database::traits::{
    introspection_error, unsupported_type, DatabaseError, DatabaseProvider, ExecutionLimits, ResultBudget,
};
use crate::result::{ResultSet, ScalarValue};
use crate::schema::SchemaSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::pool::PoolConnection;
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{Column, Executor, PgPool, Postgres, Row, Statement, TypeInfo};
use std::str::FromStr;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

/// Catalog query listing every column of the current schema with its key role
///
/// `key_role` is 2 for primary key members, 1 for foreign key members, else 0.
const COLUMNS_QUERY: &str = r#"
    SELECT
        c.table_name::text AS table_name,
        c.column_name::text AS column_name,
        c.data_type::text AS data_type,
        (c.is_nullable = 'YES') AS nullable,
        COALESCE(MAX(CASE tc.constraint_type
            WHEN 'PRIMARY KEY' THEN 2
            WHEN 'FOREIGN KEY' THEN 1
            ELSE 0 END), 0)::int8 AS key_role
    FROM information_schema.columns c
    LEFT JOIN information_schema.key_column_usage kcu
      ON kcu.table_schema = c.table_schema
      AND kcu.table_name = c.table_name
      AND kcu.column_name = c.column_name
    LEFT JOIN information_schema.table_constraints tc
      ON tc.constraint_schema = kcu.constraint_schema
      AND tc.constraint_name = kcu.constraint_name
    WHERE c.table_schema = current_schema()
    GROUP BY c.table_name, c.column_name, c.data_type, c.is_nullable, c.ordinal_position
    ORDER BY c.table_name, c.ordinal_position
"#;

/// PostgreSQL database provider
pub struct PostgresProvider {
    pool: PgPool,
}

impl PostgresProvider {
    /// Create a new PostgreSQL provider
    ///
    /// # Arguments
    ///
    /// * `pool` - PostgreSQL connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool whose sessions default to read-only transactions
    ///
    /// The server-side `statement_timeout` mirrors the execution timeout so
    /// abandoned statements do not keep running after the session is dropped.
    pub async fn connect(descriptor: &ConnectionDescriptor, config: &EngineConfig) -> Result<Self, DatabaseError> {
        let mut parameters = vec![
            ("default_transaction_read_only", "on".to_string()),
            (
                "statement_timeout",
                config.execution_timeout().as_millis().to_string(),
            ),
        ];
        if let Some(schema) = descriptor.default_schema() {
            parameters.push(("search_path", schema.to_string()));
        }

        let options = PgConnectOptions::from_str(descriptor.driver_uri())
            .map_err(|error| DatabaseError::Connection(error.to_string()))?
            .options(parameters);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .connect_with(options)
            .await
            .map_err(|error| DatabaseError::Connection(error.to_string()))?;

        Ok(Self::new(pool))
    }

    /// Convert one PostgreSQL row into typed cells, charging them to the budget
    fn row_to_values(row: &PgRow, budget: &mut ResultBudget) -> Result<Vec<ScalarValue>, DatabaseError> {
        let mut values = Vec::with_capacity(row.columns().len());

        for (index, column) in row.columns().iter().enumerate() {
            let type_name = column.type_info().name().to_ascii_uppercase();

            let value = match type_name.as_str() {
                "BOOL" => row
                    .try_get::<Option<bool>, _>(index)?
                    .map_or(ScalarValue::Null, ScalarValue::Boolean),
                "INT2" => row
                    .try_get::<Option<i16>, _>(index)?
                    .map_or(ScalarValue::Null, |v| ScalarValue::Integer(v.into())),
                "INT4" => row
                    .try_get::<Option<i32>, _>(index)?
                    .map_or(ScalarValue::Null, |v| ScalarValue::Integer(v.into())),
                "INT8" => row
                    .try_get::<Option<i64>, _>(index)?
                    .map_or(ScalarValue::Null, ScalarValue::Integer),
                "FLOAT4" => row
                    .try_get::<Option<f32>, _>(index)?
                    .map_or(ScalarValue::Null, |v| ScalarValue::Float(v.into())),
                "FLOAT8" => row
                    .try_get::<Option<f64>, _>(index)?
                    .map_or(ScalarValue::Null, ScalarValue::Float),
                "NUMERIC" => row
                    .try_get::<Option<Decimal>, _>(index)?
                    .and_then(|v| v.to_f64())
                    .map_or(ScalarValue::Null, ScalarValue::Float),
                "TIMESTAMP" => row
                    .try_get::<Option<NaiveDateTime>, _>(index)?
                    .map_or(ScalarValue::Null, ScalarValue::Temporal),
                "TIMESTAMPTZ" => row
                    .try_get::<Option<DateTime<Utc>>, _>(index)?
                    .map_or(ScalarValue::Null, |v| ScalarValue::Temporal(v.naive_utc())),
                "DATE" => row
                    .try_get::<Option<NaiveDate>, _>(index)?
                    .and_then(|v| v.and_hms_opt(0, 0, 0))
                    .map_or(ScalarValue::Null, ScalarValue::Temporal),
                "TIME" => row
                    .try_get::<Option<NaiveTime>, _>(index)?
                    .map_or(ScalarValue::Null, |v| ScalarValue::Text(v.to_string())),
                "UUID" => row
                    .try_get::<Option<sqlx::types::Uuid>, _>(index)?
                    .map_or(ScalarValue::Null, |v| ScalarValue::Text(v.to_string())),
                "JSON" | "JSONB" => row
                    .try_get::<Option<serde_json::Value>, _>(index)?
                    .map_or(ScalarValue::Null, |v| ScalarValue::Text(v.to_string())),
                "BYTEA" => match row.try_get::<Option<&[u8]>, _>(index)? {
                    Some(bytes) => {
                        budget.charge(bytes.len())?;
                        ScalarValue::binary(bytes.len())
                    }
                    None => ScalarValue::Null,
                },
                "INTERVAL" => row
                    .try_get::<Option<PgInterval>, _>(index)?
                    .map_or(ScalarValue::Null, |v| ScalarValue::Text(interval_text(&v))),
                "TEXT[]" | "VARCHAR[]" | "BPCHAR[]" | "NAME[]" => array_text(row.try_get::<Option<Vec<String>>, _>(index)?),
                "INT2[]" => array_text(row.try_get::<Option<Vec<i16>>, _>(index)?),
                "INT4[]" => array_text(row.try_get::<Option<Vec<i32>>, _>(index)?),
                "INT8[]" => array_text(row.try_get::<Option<Vec<i64>>, _>(index)?),
                "FLOAT4[]" => array_text(row.try_get::<Option<Vec<f32>>, _>(index)?),
                "FLOAT8[]" => array_text(row.try_get::<Option<Vec<f64>>, _>(index)?),
                "BOOL[]" => array_text(row.try_get::<Option<Vec<bool>>, _>(index)?),
                _ => {
                    // TEXT, VARCHAR, BPCHAR, NAME, CITEXT; other types must be cast in the query
                    row.try_get::<Option<String>, _>(index)
                        .map_err(|_| unsupported_type(column.name(), &type_name))?
                        .map_or(ScalarValue::Null, ScalarValue::Text)
                }
            };

            values.push(value);
        }

        budget.charge_row(&values)?;
        Ok(values)
    }

    fn column_metadata<'a>(columns: impl Iterator<Item = &'a sqlx::postgres::PgColumn>) -> Vec<(String, Option<String>)> {
        columns
            .map(|column| (column.name().to_string(), Some(column.type_info().name().to_string())))
            .collect()
    }

    async fn run_query(
        connection: &mut PoolConnection<Postgres>,
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
                let statement = (&mut **connection).prepare(sql).await?;
                Self::column_metadata(statement.columns().iter())
            }
        };

        Ok(ResultSet::new(columns, values))
    }
}

/// ISO 8601 duration, e.g. `P1M2DT3.5S`
fn interval_text(interval: &PgInterval) -> String {
    let seconds = interval.microseconds as f64 / 1_000_000.0;
    format!("P{}M{}DT{}S", interval.months, interval.days, seconds)
}

/// Arrays render as JSON text
fn array_text<T: serde::Serialize>(values: Option<Vec<T>>) -> ScalarValue {
    values
        .and_then(|values| serde_json::to_string(&values).ok())
        .map_or(ScalarValue::Null, ScalarValue::Text)
}

#[async_trait]
impl DatabaseProvider for PostgresProvider {
    fn engine(&self) -> EngineKind {
        EngineKind::Postgres
    }

    async fn introspect(&self) -> Result<SchemaSnapshot, DatabaseError> {
        let mut connection = self.pool.acquire().await?;

        let rows = sqlx::query(COLUMNS_QUERY)
            .fetch_all(&mut *connection)
            .await
            .map_err(introspection_error)?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            columns.push((
                row.try_get::<String, _>("table_name").map_err(introspection_error)?,
                row.try_get::<String, _>("column_name").map_err(introspection_error)?,
                row.try_get::<String, _>("data_type").map_err(introspection_error)?,
                row.try_get::<bool, _>("nullable").map_err(introspection_error)?,
                row.try_get::<i64, _>("key_role").map_err(introspection_error)?,
            ));
        }

        let snapshot = assemble_snapshot(EngineKind::Postgres, columns);
        debug!(tables = snapshot.tables.len(), "introspected PostgreSQL schema");
        Ok(snapshot)
    }

    async fn fetch(&self, sql: &str, limits: &ExecutionLimits) -> Result<ResultSet, DatabaseError> {
        let mut connection = self.pool.acquire().await?;

        let outcome = tokio::time::timeout(limits.timeout, Self::run_query(&mut connection, sql, limits)).await;

        match outcome {
            Ok(Err(error @ DatabaseError::TooLarge { .. })) => {
                // Unread rows are still in flight on the session
                warn!(limit = limits.max_result_bytes, "PostgreSQL result too large, closing session");
                drop(connection.detach());
                Err(error)
            }
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?limits.timeout, "PostgreSQL query timed out, closing session");
                drop(connection.detach());
                Err(DatabaseError::Timeout(limits.timeout))
            }
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
