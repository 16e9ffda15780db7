//! MySQL database provider implementation

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
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::{Column, Executor, MySql, MySqlPool, Row, Statement, TypeInfo};
use std::str::FromStr;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

/// Catalog query listing every column of the connected database with its key role
const COLUMNS_QUERY: &str = r#"
    SELECT
        CAST(c.TABLE_NAME AS CHAR) AS table_name,
        CAST(c.COLUMN_NAME AS CHAR) AS column_name,
        CAST(c.COLUMN_TYPE AS CHAR) AS data_type,
        CAST(c.IS_NULLABLE = 'YES' AS SIGNED) AS nullable,
        CAST(CASE
            WHEN c.COLUMN_KEY = 'PRI' THEN 2
            WHEN EXISTS (
                SELECT 1 FROM information_schema.KEY_COLUMN_USAGE k
                WHERE k.TABLE_SCHEMA = c.TABLE_SCHEMA
                  AND k.TABLE_NAME = c.TABLE_NAME
                  AND k.COLUMN_NAME = c.COLUMN_NAME
                  AND k.REFERENCED_TABLE_NAME IS NOT NULL
            ) THEN 1
            ELSE 0 END AS SIGNED) AS key_role
    FROM information_schema.COLUMNS c
    WHERE c.TABLE_SCHEMA = DATABASE()
    ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION
"#;

/// MySQL database provider
pub struct MySqlProvider {
    pool: MySqlPool,
}

impl MySqlProvider {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Open a pool whose sessions are read-only and carry a statement time limit
    pub async fn connect(descriptor: &ConnectionDescriptor, config: &EngineConfig) -> Result<Self, DatabaseError> {
        let mut options = MySqlConnectOptions::from_str(descriptor.driver_uri())
            .map_err(|error| DatabaseError::Connection(error.to_string()))?;
        if let Some(schema) = descriptor.default_schema() {
            options = options.database(schema);
        }

        let max_execution_time = config.execution_timeout().as_millis();

        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .after_connect(move |connection, _metadata| {
                Box::pin(async move {
                    sqlx::query("SET SESSION TRANSACTION READ ONLY")
                        .execute(&mut *connection)
                        .await?;
                    sqlx::query(&format!("SET SESSION MAX_EXECUTION_TIME = {}", max_execution_time))
                        .execute(&mut *connection)
                        .await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await
            .map_err(|error| DatabaseError::Connection(error.to_string()))?;

        Ok(Self::new(pool))
    }

    /// Convert one MySQL row into typed cells
    fn row_to_values(row: &MySqlRow, budget: &mut ResultBudget) -> Result<Vec<ScalarValue>, DatabaseError> {
        let mut values = Vec::with_capacity(row.columns().len());

        for (index, column) in row.columns().iter().enumerate() {
            let type_name = column.type_info().name().to_ascii_uppercase();

            let value = match type_name.as_str() {
                "BOOLEAN" => row
                    .try_get::<Option<bool>, _>(index)?
                    .map_or(ScalarValue::Null, ScalarValue::Boolean),
                "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => row
                    .try_get::<Option<i64>, _>(index)?
                    .map_or(ScalarValue::Null, ScalarValue::Integer),
                name if name.ends_with(" UNSIGNED") => row
                    .try_get::<Option<u64>, _>(index)?
                    .map_or(ScalarValue::Null, |v| match i64::try_from(v) {
                        Ok(value) => ScalarValue::Integer(value),
                        Err(_) => ScalarValue::Float(v as f64),
                    }),
                "FLOAT" => row
                    .try_get::<Option<f32>, _>(index)?
                    .map_or(ScalarValue::Null, |v| ScalarValue::Float(v.into())),
                "DOUBLE" => row
                    .try_get::<Option<f64>, _>(index)?
                    .map_or(ScalarValue::Null, ScalarValue::Float),
                "DECIMAL" => row
                    .try_get::<Option<Decimal>, _>(index)?
                    .and_then(|v| v.to_f64())
                    .map_or(ScalarValue::Null, ScalarValue::Float),
                "DATETIME" => row
                    .try_get::<Option<NaiveDateTime>, _>(index)?
                    .map_or(ScalarValue::Null, ScalarValue::Temporal),
                "TIMESTAMP" => row
                    .try_get::<Option<DateTime<Utc>>, _>(index)?
                    .map_or(ScalarValue::Null, |v| ScalarValue::Temporal(v.naive_utc())),
                "DATE" => row
                    .try_get::<Option<NaiveDate>, _>(index)?
                    .and_then(|v| v.and_hms_opt(0, 0, 0))
                    .map_or(ScalarValue::Null, ScalarValue::Temporal),
                "TIME" => row
                    .try_get::<Option<NaiveTime>, _>(index)?
                    .map_or(ScalarValue::Null, |v| ScalarValue::Text(v.to_string())),
                "YEAR" => row
                    .try_get::<Option<u16>, _>(index)
                    .map_err(|_| unsupported_type(column.name(), &type_name))?
                    .map_or(ScalarValue::Null, |v| ScalarValue::Integer(v.into())),
                "JSON" => row
                    .try_get::<Option<serde_json::Value>, _>(index)?
                    .map_or(ScalarValue::Null, |v| ScalarValue::Text(v.to_string())),
                "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" => {
                    match row.try_get::<Option<&[u8]>, _>(index)? {
                        Some(bytes) => {
                            budget.charge(bytes.len())?;
                            ScalarValue::binary(bytes.len())
                        }
                        None => ScalarValue::Null,
                    }
                }
                _ => row
                    .try_get::<Option<String>, _>(index)
                    .map_err(|_| unsupported_type(column.name(), &type_name))?
                    .map_or(ScalarValue::Null, ScalarValue::Text),
            };

            values.push(value);
        }

        budget.charge_row(&values)?;
        Ok(values)
    }

    fn column_metadata<'a>(columns: impl Iterator<Item = &'a sqlx::mysql::MySqlColumn>) -> Vec<(String, Option<String>)> {
        columns
            .map(|column| (column.name().to_string(), Some(column.type_info().name().to_string())))
            .collect()
    }

    async fn run_query(
        connection: &mut PoolConnection<MySql>,
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

#[async_trait]
impl DatabaseProvider for MySqlProvider {
    fn engine(&self) -> EngineKind {
        EngineKind::MySql
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
                row.try_get::<i64, _>("nullable").map_err(introspection_error)? != 0,
                row.try_get::<i64, _>("key_role").map_err(introspection_error)?,
            ));
        }

        let snapshot = assemble_snapshot(EngineKind::MySql, columns);
        debug!(tables = snapshot.tables.len(), "introspected MySQL schema");
        Ok(snapshot)
    }

    async fn fetch(&self, sql: &str, limits: &ExecutionLimits) -> Result<ResultSet, DatabaseError> {
        let mut connection = self.pool.acquire().await?;

        let outcome = tokio::time::timeout(limits.timeout, Self::run_query(&mut connection, sql, limits)).await;

        match outcome {
            Ok(Err(error @ DatabaseError::TooLarge { .. })) => {
                // Unread rows are still in flight on the session
                warn!(limit = limits.max_result_bytes, "MySQL result too large, closing session");
                drop(connection.detach());
                Err(error)
            }
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?limits.timeout, "MySQL query timed out, closing session");
                drop(connection.detach());
                Err(DatabaseError::Timeout(limits.timeout))
            }
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
