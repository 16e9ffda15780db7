//! Query execution
//!
//! Runs a validated query through a provider under the configured timeout and
//! result size limit. The provider checks a session out of its pool for the
//! duration of the call and hands it back (or discards it on timeout) before
//! returning.

use std::time::Instant;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::database::DatabaseProvider;
use crate::result::ResultSet;
use crate::validator::ValidatedQuery;
use crate::Error;

/// Rows of a finished query and how long the engine took
#[derive(Debug, Clone)]
pub struct Execution {
    pub result: ResultSet,
    pub elapsed_ms: u64,
}

/// Execute a validated query
pub async fn execute(
    query: &ValidatedQuery,
    provider: &dyn DatabaseProvider,
    config: &EngineConfig,
) -> Result<Execution, Error> {
    let limits = config.execution_limits();
    let started = Instant::now();

    let outcome = provider.fetch(&query.sql, &limits).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(result) => {
            info!(
                engine = %provider.engine(),
                rows = result.row_count(),
                elapsed_ms,
                "query executed"
            );
            Ok(Execution { result, elapsed_ms })
        }
        Err(error) => {
            warn!(engine = %provider.engine(), elapsed_ms, %error, "query failed");
            Err(error.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::EngineKind;
    use crate::database::{DatabaseError, ExecutionLimits};
    use crate::result::ScalarValue;
    use crate::schema::SchemaSnapshot;
    use crate::synthesizer::{CandidateQuery, Provenance};
    use crate::validator::StatementKind;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Provider that replays a canned outcome and records what it was asked
    struct ScriptedProvider {
        outcome: Mutex<Option<Result<ResultSet, DatabaseError>>>,
        seen: Mutex<Vec<(String, ExecutionLimits)>>,
    }

    impl ScriptedProvider {
        fn new(outcome: Result<ResultSet, DatabaseError>) -> Self {
            Self {
                outcome: Mutex::new(Some(outcome)),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DatabaseProvider for ScriptedProvider {
        fn engine(&self) -> EngineKind {
            EngineKind::Sqlite
        }

        async fn introspect(&self) -> Result<SchemaSnapshot, DatabaseError> {
            Ok(SchemaSnapshot::new(EngineKind::Sqlite, Vec::new()))
        }

        async fn fetch(&self, sql: &str, limits: &ExecutionLimits) -> Result<ResultSet, DatabaseError> {
            self.seen.lock().unwrap().push((sql.to_string(), *limits));
            self.outcome
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(DatabaseError::Query("already used".to_string())))
        }

        async fn close(&self) {}
    }

    fn validated(sql: &str) -> ValidatedQuery {
        ValidatedQuery {
            candidate: CandidateQuery::new(sql, Provenance::UserProvided),
            sql: sql.to_string(),
            statement_kind: StatementKind::Select,
            referenced_tables: vec!["customers".to_string()],
            row_bound: 1000,
        }
    }

    #[tokio::test]
    async fn test_passes_configured_limits() {
        let rows = ResultSet::new(
            vec![("n".to_string(), Some("INTEGER".to_string()))],
            vec![vec![ScalarValue::Integer(1)]],
        );
        let provider = ScriptedProvider::new(Ok(rows));
        let config = EngineConfig {
            execution_timeout_seconds: 7,
            max_result_bytes: 4096,
            ..EngineConfig::default()
        };

        let execution = execute(&validated("SELECT 1 AS n LIMIT 1000"), &provider, &config)
            .await
            .unwrap();
        assert_eq!(execution.result.row_count(), 1);

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[0].0, "SELECT 1 AS n LIMIT 1000");
        assert_eq!(seen[0].1.timeout, Duration::from_secs(7));
        assert_eq!(seen[0].1.max_result_bytes, 4096);
    }

    #[tokio::test]
    async fn test_maps_provider_errors() {
        let cases = vec![
            (DatabaseError::Timeout(Duration::from_secs(1)), "ExecutionTimeoutError"),
            (DatabaseError::TooLarge { limit: 10, actual: 20 }, "ResultTooLargeError"),
            (DatabaseError::Query("no such column".to_string()), "ExecutionError"),
            (DatabaseError::Connection("pool closed".to_string()), "ConnectionError"),
        ];

        for (error, kind) in cases {
            let provider = ScriptedProvider::new(Err(error));
            let error = execute(&validated("SELECT 1"), &provider, &EngineConfig::default())
                .await
                .unwrap_err();
            assert_eq!(error.kind(), kind);
        }
    }
}
