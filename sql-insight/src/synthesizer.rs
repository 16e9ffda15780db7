//! Query synthesis
//!
//! Produces the single candidate query for a request. Explicit SQL passes
//! through untouched; a question goes to the configured [`SqlGenerator`]
//! together with the schema snapshot, and the answer must name only tables
//! and columns that exist.

use serde::Serialize;
use sqlparser::tokenizer::Tokenizer;
use std::sync::Arc;
use tracing::{debug, info};

use crate::llm::{extract_sql, starts_with_sql_keyword, SqlGenerator};
use crate::schema::SchemaSnapshot;
use crate::validator::{count_statements, grounding_violation, UnsafeRule};
use crate::Error;

/// Where a candidate query came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Provenance {
    /// Derived from a natural-language question
    Generated,
    /// Supplied verbatim by the caller
    UserProvided,
}

/// A proposed SQL statement, not yet validated
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateQuery {
    pub sql: String,
    pub provenance: Provenance,
}

impl CandidateQuery {
    pub fn new(sql: impl Into<String>, provenance: Provenance) -> Self {
        Self {
            sql: sql.into(),
            provenance,
        }
    }
}

/// Turns requests into candidate queries
#[derive(Clone)]
pub struct QuerySynthesizer {
    generator: Arc<dyn SqlGenerator>,
}

impl QuerySynthesizer {
    pub fn new(generator: Arc<dyn SqlGenerator>) -> Self {
        Self { generator }
    }

    /// Produce one candidate for the request
    ///
    /// `sql` wins over `question` when both are present. Generated SQL that
    /// names unknown tables or columns fails with [`Error::UngroundedQuery`];
    /// generator output that is not a single SQL statement fails with
    /// [`Error::UnsafeQuery`].
    pub async fn synthesize(
        &self,
        sql: Option<&str>,
        question: Option<&str>,
        snapshot: &SchemaSnapshot,
    ) -> Result<CandidateQuery, Error> {
        if let Some(sql) = sql.filter(|sql| !sql.trim().is_empty()) {
            debug!("using caller-provided SQL");
            return Ok(CandidateQuery::new(sql, Provenance::UserProvided));
        }

        let question = question
            .map(str::trim)
            .filter(|question| !question.is_empty())
            .ok_or_else(|| Error::InvalidRequest("either a question or a SQL query is required".to_string()))?;

        if snapshot.is_empty() {
            return Err(Error::UngroundedQuery(format!(
                "'{}' cannot be answered: the database has no tables",
                question
            )));
        }

        info!(%question, "generating SQL");
        let raw = self.generator.generate_sql(question, snapshot).await?;
        let sql = extract_sql(&raw);
        let sql = sql.trim();

        if sql.is_empty() || !starts_with_sql_keyword(sql) {
            return Err(Error::unsafe_query(
                UnsafeRule::Malformed,
                "the generator did not return a SQL statement",
            ));
        }

        let dialect = snapshot.engine.dialect();
        let tokens = Tokenizer::new(dialect.as_ref(), sql)
            .tokenize()
            .map_err(|error| Error::unsafe_query(UnsafeRule::Malformed, error.to_string()))?;
        let statements = count_statements(&tokens);
        if statements > 1 {
            return Err(Error::unsafe_query(
                UnsafeRule::MultipleStatements,
                format!("the generator returned {} statements", statements),
            ));
        }

        if let Some(detail) = grounding_violation(sql, snapshot) {
            return Err(Error::UngroundedQuery(format!(
                "'{}' cannot be answered from the schema: {}",
                question, detail
            )));
        }

        debug!(%sql, "generated SQL");
        Ok(CandidateQuery::new(sql, Provenance::Generated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::EngineKind;
    use crate::llm::LlmError;
    use crate::schema::{ColumnInfo, KeyRole, TableSchema};
    use async_trait::async_trait;

    struct CannedGenerator(&'static str);

    #[async_trait]
    impl SqlGenerator for CannedGenerator {
        async fn generate_sql(&self, _question: &str, _schema: &SchemaSnapshot) -> Result<String, LlmError> {
            Ok(self.0.to_string())
        }
    }

    struct Unanswerable;

    #[async_trait]
    impl SqlGenerator for Unanswerable {
        async fn generate_sql(&self, question: &str, _schema: &SchemaSnapshot) -> Result<String, LlmError> {
            Err(LlmError::Ungrounded(format!("no table matches '{}'", question)))
        }
    }

    fn snapshot() -> SchemaSnapshot {
        SchemaSnapshot::new(
            EngineKind::Sqlite,
            vec![TableSchema::new(
                "customers",
                vec![
                    ColumnInfo::new("id", "INTEGER", false, KeyRole::Primary),
                    ColumnInfo::new("name", "TEXT", false, KeyRole::None),
                    ColumnInfo::new("revenue", "REAL", true, KeyRole::None),
                ],
            )],
        )
    }

    fn synthesizer(generator: impl SqlGenerator + 'static) -> QuerySynthesizer {
        QuerySynthesizer::new(Arc::new(generator))
    }

    #[tokio::test]
    async fn test_explicit_sql_passes_through_verbatim() {
        let synthesizer = synthesizer(CannedGenerator("SELECT 1"));
        let candidate = synthesizer
            .synthesize(Some("select  name from customers"), Some("ignored"), &snapshot())
            .await
            .unwrap();
        assert_eq!(candidate.sql, "select  name from customers");
        assert_eq!(candidate.provenance, Provenance::UserProvided);
    }

    #[tokio::test]
    async fn test_generated_sql_is_extracted_from_code_fences() {
        let synthesizer = synthesizer(CannedGenerator("```sql\nSELECT name FROM customers\n```"));
        let candidate = synthesizer
            .synthesize(None, Some("list customer names"), &snapshot())
            .await
            .unwrap();
        assert_eq!(candidate.sql, "SELECT name FROM customers");
        assert_eq!(candidate.provenance, Provenance::Generated);
    }

    #[tokio::test]
    async fn test_unknown_table_is_ungrounded() {
        let synthesizer = synthesizer(CannedGenerator("SELECT total FROM invoices"));
        let error = synthesizer
            .synthesize(None, Some("total invoices"), &snapshot())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::UngroundedQuery(_)));
    }

    #[tokio::test]
    async fn test_unknown_column_is_ungrounded() {
        let synthesizer = synthesizer(CannedGenerator("SELECT email FROM customers"));
        let error = synthesizer
            .synthesize(None, Some("customer emails"), &snapshot())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::UngroundedQuery(_)));
    }

    #[tokio::test]
    async fn test_generator_refusal_is_ungrounded() {
        let error = synthesizer(Unanswerable)
            .synthesize(None, Some("weather tomorrow"), &snapshot())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::UngroundedQuery(_)));
    }

    #[tokio::test]
    async fn test_prose_and_stacked_output_are_unsafe() {
        let error = synthesizer(CannedGenerator("I am not sure what you mean."))
            .synthesize(None, Some("huh"), &snapshot())
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            Error::UnsafeQuery {
                rule: UnsafeRule::Malformed,
                ..
            }
        ));

        let error = synthesizer(CannedGenerator("SELECT name FROM customers; DROP TABLE customers"))
            .synthesize(None, Some("names"), &snapshot())
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            Error::UnsafeQuery {
                rule: UnsafeRule::MultipleStatements,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_requires_question_or_sql() {
        let error = synthesizer(CannedGenerator("SELECT 1"))
            .synthesize(None, Some("   "), &snapshot())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_empty_schema_cannot_ground_questions() {
        let empty = SchemaSnapshot::new(EngineKind::Sqlite, Vec::new());
        let error = synthesizer(CannedGenerator("SELECT 1"))
            .synthesize(None, Some("how many customers"), &empty)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::UngroundedQuery(_)));
    }
}
