//! Request pipeline
//!
//! [`QueryEngine`] runs one request end to end: open the connection,
//! introspect (or reuse a cached snapshot), synthesize, validate, execute,
//! then select a chart and write insights in parallel. The connection pool
//! belongs to the request and is closed on every exit path.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::SchemaCache;
use crate::chart::{self, ChartHint, ChartKind, ChartSpec};
use crate::config::EngineConfig;
use crate::connection::ConnectionDescriptor;
use crate::database::{self, DatabaseProvider};
use crate::executor::{self, Execution};
use crate::insight::{self, DataSummary, UNAVAILABLE_INSIGHT};
use crate::llm::SqlGenerator;
use crate::result::ResultSet;
use crate::schema::SchemaSnapshot;
use crate::synthesizer::{CandidateQuery, Provenance, QuerySynthesizer};
use crate::trend::{self, ColumnTrend};
use crate::validator::{self, ValidatedQuery};
use crate::Error;

/// Ask a question or run a query
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(default)]
    pub natural_language_query: Option<String>,

    /// Explicit SQL; takes precedence over the question
    #[serde(default, alias = "query")]
    pub sql_query: Option<String>,

    #[serde(alias = "databaseConnection")]
    pub connection: ConnectionDescriptor,

    #[serde(default, alias = "chartType")]
    pub chart_type_hint: ChartHint,

    /// Maximum rows to return; the engine default when absent
    #[serde(default)]
    pub row_limit: Option<u64>,
}

impl QueryRequest {
    pub fn question(connection: ConnectionDescriptor, question: impl Into<String>) -> Self {
        Self {
            natural_language_query: Some(question.into()),
            sql_query: None,
            connection,
            chart_type_hint: ChartHint::Auto,
            row_limit: None,
        }
    }

    pub fn sql(connection: ConnectionDescriptor, sql: impl Into<String>) -> Self {
        Self {
            natural_language_query: None,
            sql_query: Some(sql.into()),
            connection,
            chart_type_hint: ChartHint::Auto,
            row_limit: None,
        }
    }

    /// At least one of the question and the SQL must be non-blank
    pub fn validate(&self) -> Result<(), Error> {
        let present = |text: &Option<String>| text.as_deref().is_some_and(|text| !text.trim().is_empty());
        if present(&self.natural_language_query) || present(&self.sql_query) {
            Ok(())
        } else {
            Err(Error::InvalidRequest(
                "either naturalLanguageQuery or sqlQuery is required".to_string(),
            ))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMetadata {
    pub row_count: usize,
    pub columns: Vec<String>,
    pub chart_type: ChartKind,
    pub execution_time_ms: u64,
    pub provenance: Provenance,
    pub referenced_tables: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    /// SQL that was executed, row bound included
    pub sql_query: String,
    pub rows: ResultSet,
    pub chart: ChartSpec,
    pub insights: String,
    pub metadata: QueryMetadata,
}

/// Project trends from an earlier query
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictiveRequest {
    #[serde(alias = "query")]
    pub sql_query: String,

    #[serde(alias = "databaseConnection")]
    pub connection: ConnectionDescriptor,

    #[serde(default)]
    pub natural_language_query: Option<String>,

    #[serde(default, alias = "chartType")]
    pub chart_type_hint: ChartHint,

    #[serde(default)]
    pub row_limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictiveResponse {
    pub predictions: String,
    pub axis: Option<String>,
    pub trends: BTreeMap<String, ColumnTrend>,
    pub data_summary: DataSummary,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartSpec>,
}

/// The query-derivation engine
///
/// Holds no per-request state; a single engine serves concurrent requests.
pub struct QueryEngine {
    config: EngineConfig,
    synthesizer: QuerySynthesizer,
    schema_cache: Option<Arc<SchemaCache>>,
}

impl QueryEngine {
    /// Create an engine; schema snapshots are cached when the config gives a TTL
    pub fn new(config: EngineConfig, generator: Arc<dyn SqlGenerator>) -> Self {
        let schema_cache = config.schema_cache_ttl().map(|ttl| Arc::new(SchemaCache::new(ttl)));
        Self {
            config,
            synthesizer: QuerySynthesizer::new(generator),
            schema_cache,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn schema_cache(&self) -> Option<&SchemaCache> {
        self.schema_cache.as_deref()
    }

    /// Answer a question or run explicit SQL
    pub async fn execute(&self, request: QueryRequest) -> Result<ExecuteResponse, Error> {
        request.validate()?;
        let row_limit = self.config.effective_row_limit(request.row_limit)?;

        let provider = database::connect(&request.connection, &self.config).await?;
        let outcome = self
            .derive_and_run(&request, provider.as_ref(), row_limit)
            .await;
        provider.close().await;
        let (validated, execution) = outcome?;

        let result = Arc::new(execution.result);
        let (chart, insights) = describe(
            Arc::clone(&result),
            request.chart_type_hint,
            self.config.low_cardinality_threshold,
            request.natural_language_query.clone(),
        )
        .await;
        let result = Arc::try_unwrap(result).unwrap_or_else(|shared| (*shared).clone());

        info!(
            rows = result.row_count(),
            chart = %chart.kind,
            elapsed_ms = execution.elapsed_ms,
            "request answered"
        );

        Ok(ExecuteResponse {
            metadata: QueryMetadata {
                row_count: result.row_count(),
                columns: result.column_names(),
                chart_type: chart.kind,
                execution_time_ms: execution.elapsed_ms,
                provenance: validated.candidate.provenance,
                referenced_tables: validated.referenced_tables,
            },
            sql_query: validated.sql,
            rows: result,
            chart,
            insights,
        })
    }

    /// Re-run an earlier query and describe its trends
    pub async fn predictive_analysis(&self, request: PredictiveRequest) -> Result<PredictiveResponse, Error> {
        if request.sql_query.trim().is_empty() {
            return Err(Error::InvalidRequest("sqlQuery is required".to_string()));
        }
        let row_limit = self.config.effective_row_limit(request.row_limit)?;

        let provider = database::connect(&request.connection, &self.config).await?;
        let outcome: Result<Execution, Error> = async {
            let snapshot = self.snapshot(&request.connection, provider.as_ref()).await?;
            let candidate = CandidateQuery::new(request.sql_query.as_str(), Provenance::UserProvided);
            let validated = validator::validate(&candidate, &snapshot, row_limit)?;
            self.run(&request.connection, &validated, provider.as_ref()).await
        }
        .await;
        provider.close().await;
        let execution = outcome?;
        let result = execution.result;

        let report = trend::analyze(&result, self.config.trend_noise_threshold)?;
        let chart = match request.chart_type_hint {
            ChartHint::None => None,
            hint => Some(chart::select(&result, hint, self.config.low_cardinality_threshold)),
        };

        let predictions = match request.natural_language_query.as_deref().map(str::trim) {
            Some(question) if !question.is_empty() => format!("For \"{}\": {}", question, report.narrative),
            _ => report.narrative,
        };

        info!(rows = result.row_count(), trends = report.trends.len(), "predictive analysis done");
        Ok(PredictiveResponse {
            predictions,
            axis: report.axis,
            trends: report.trends,
            data_summary: insight::summarize(&result),
            chart,
        })
    }

    async fn derive_and_run(
        &self,
        request: &QueryRequest,
        provider: &dyn DatabaseProvider,
        row_limit: u64,
    ) -> Result<(ValidatedQuery, Execution), Error> {
        let snapshot = self.snapshot(&request.connection, provider).await?;
        let candidate = self
            .synthesizer
            .synthesize(
                request.sql_query.as_deref(),
                request.natural_language_query.as_deref(),
                &snapshot,
            )
            .await?;
        let validated = validator::validate(&candidate, &snapshot, row_limit)?;
        let execution = self.run(&request.connection, &validated, provider).await?;
        Ok((validated, execution))
    }

    async fn run(
        &self,
        descriptor: &ConnectionDescriptor,
        validated: &ValidatedQuery,
        provider: &dyn DatabaseProvider,
    ) -> Result<Execution, Error> {
        let outcome = executor::execute(validated, provider, &self.config).await;
        if let (Err(Error::Execution(_)), Some(cache)) = (&outcome, &self.schema_cache) {
            // The engine may know a newer schema than the cached snapshot
            cache.invalidate(descriptor).await;
        }
        outcome
    }

    async fn snapshot(
        &self,
        descriptor: &ConnectionDescriptor,
        provider: &dyn DatabaseProvider,
    ) -> Result<Arc<SchemaSnapshot>, Error> {
        if let Some(cache) = &self.schema_cache {
            if let Some(snapshot) = cache.get(descriptor).await {
                debug!(target_database = %descriptor, "using cached schema");
                return Ok(snapshot);
            }
        }

        let snapshot = Arc::new(database::introspect(provider).await?);
        if let Some(cache) = &self.schema_cache {
            cache.insert(descriptor, Arc::clone(&snapshot)).await;
        }
        Ok(snapshot)
    }
}

/// Chart selection and insight generation, side by side
async fn describe(
    result: Arc<ResultSet>,
    hint: ChartHint,
    low_cardinality_threshold: usize,
    question: Option<String>,
) -> (ChartSpec, String) {
    let chart_task = tokio::task::spawn_blocking({
        let result = Arc::clone(&result);
        move || chart::select(&result, hint, low_cardinality_threshold)
    });
    let insight_task = tokio::task::spawn_blocking(move || insight::generate(&result, question.as_deref()));

    let (chart, insights) = tokio::join!(chart_task, insight_task);

    let chart = chart.unwrap_or_else(|error| {
        warn!(%error, "chart selection failed");
        ChartSpec {
            error: Some("chart selection failed".to_string()),
            ..ChartSpec::none()
        }
    });
    let insights = insights.unwrap_or_else(|error| {
        warn!(%error, "insight generation failed");
        UNAVAILABLE_INSIGHT.to_string()
    });
    (chart, insights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::providers::pattern::PatternSqlGenerator;

    #[test]
    fn test_query_request_from_json() {
        let request: QueryRequest = serde_json::from_str(
            r#"{
                "naturalLanguageQuery": "top 10 customers by revenue",
                "connection": "sqlite://data/shop.db",
                "chartTypeHint": "bar",
                "rowLimit": 50
            }"#,
        )
        .unwrap();
        assert_eq!(request.natural_language_query.as_deref(), Some("top 10 customers by revenue"));
        assert_eq!(request.chart_type_hint, ChartHint::Bar);
        assert_eq!(request.row_limit, Some(50));
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_query_request_accepts_short_names() {
        let request: QueryRequest = serde_json::from_str(
            r#"{"query": "SELECT 1", "databaseConnection": "sqlite::memory:", "chartType": "none"}"#,
        )
        .unwrap();
        assert_eq!(request.sql_query.as_deref(), Some("SELECT 1"));
        assert_eq!(request.chart_type_hint, ChartHint::None);
        assert_eq!(request.row_limit, None);
    }

    #[test]
    fn test_query_request_needs_question_or_sql() {
        let connection = ConnectionDescriptor::parse("sqlite::memory:").unwrap();
        let mut request = QueryRequest::question(connection, "  ");
        assert!(matches!(request.validate(), Err(Error::InvalidRequest(_))));
        request.sql_query = Some("SELECT 1".to_string());
        assert!(request.validate().is_ok());
    }

    #[tokio::test]
    async fn test_invalid_requests_fail_before_connecting() {
        let engine = QueryEngine::new(EngineConfig::default(), Arc::new(PatternSqlGenerator::new()));
        let connection = ConnectionDescriptor::parse("postgres://nobody@unreachable.invalid/db").unwrap();

        let mut request = QueryRequest::sql(connection.clone(), "SELECT 1");
        request.row_limit = Some(0);
        assert!(matches!(engine.execute(request).await, Err(Error::InvalidRequest(_))));

        let predictive = PredictiveRequest {
            sql_query: " ".to_string(),
            connection,
            natural_language_query: None,
            chart_type_hint: ChartHint::Auto,
            row_limit: None,
        };
        assert!(matches!(
            engine.predictive_analysis(predictive).await,
            Err(Error::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_describe_runs_both_stages() {
        let result = Arc::new(ResultSet::new(
            vec![("name".to_string(), Some("TEXT".to_string())), ("revenue".to_string(), Some("REAL".to_string()))],
            vec![
                vec![crate::result::ScalarValue::Text("Acme".into()), crate::result::ScalarValue::Float(10.0)],
                vec![crate::result::ScalarValue::Text("Globex".into()), crate::result::ScalarValue::Float(5.0)],
            ],
        ));
        let (chart, insights) = describe(result, ChartHint::Auto, 12, None).await;
        assert_eq!(chart.kind, ChartKind::Bar);
        assert!(insights.starts_with("The query returned 2 rows"));
    }

    #[test]
    fn test_cache_follows_config() {
        let generator: Arc<dyn SqlGenerator> = Arc::new(PatternSqlGenerator::new());
        let cached = QueryEngine::new(EngineConfig::default(), Arc::clone(&generator));
        assert!(cached.schema_cache().is_some());

        let uncached = QueryEngine::new(
            EngineConfig {
                schema_cache_ttl_seconds: 0,
                ..EngineConfig::default()
            },
            generator,
        );
        assert!(uncached.schema_cache().is_none());
    }
}
