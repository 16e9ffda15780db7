//! SQL generation capability
//!
//! Turning a question into SQL is the one non-deterministic step of the
//! pipeline, so it sits behind [`SqlGenerator`]. The default backend is a
//! deterministic pattern translator; HTTP model backends are opt-in.

pub mod providers;

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::schema::SchemaSnapshot;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM connection error: {0}")]
    Connection(String),

    #[error("LLM response error: {0}")]
    Response(String),

    #[error("LLM configuration error: {0}")]
    Config(String),

    /// The question cannot be mapped onto the schema
    #[error("{0}")]
    Ungrounded(String),
}

/// Translates a question into a single SQL statement for the snapshot's engine
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate_sql(&self, question: &str, schema: &SchemaSnapshot) -> Result<String, LlmError>;
}

/// Generator backend selection
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// "pattern", "ollama" or "remote"
    #[serde(default = "default_backend")]
    pub backend: String,

    #[serde(default = "default_model")]
    pub model: String,

    pub api_key: Option<String>,
    pub api_url: Option<String>,
}

fn default_backend() -> String {
    "pattern".to_string()
}

fn default_model() -> String {
    "sqlcoder".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            model: default_model(),
            api_key: None,
            api_url: None,
        }
    }
}

/// Build the generator named by the configuration
pub fn build_generator(config: &LlmConfig) -> Result<Arc<dyn SqlGenerator>, LlmError> {
    let generator: Arc<dyn SqlGenerator> = match config.backend.as_str() {
        "pattern" => Arc::new(providers::pattern::PatternSqlGenerator::new()),
        "ollama" => Arc::new(providers::ollama::OllamaProvider::new(config)?),
        "remote" => Arc::new(providers::remote::RemoteLlmProvider::new(config)?),
        other => {
            return Err(LlmError::Config(format!(
                "Unsupported LLM backend: {}",
                other
            )))
        }
    };
    Ok(generator)
}

/// Prompt shared by the model backends
pub(crate) fn build_prompt(question: &str, schema: &SchemaSnapshot) -> String {
    format!(
        r#"### Instructions:
Your task is to convert a question into a single read-only SQL query for {engine}, given a database schema.
Adhere to these rules:
- **Use only the tables and columns in the schema below**, spelled exactly as shown
- **Deliberately go through the question and database schema word by word** to appropriately answer the question
- **Use Table Aliases** to prevent ambiguity. For example, `SELECT table1.col1, table2.col1 FROM table1 JOIN table2 ON table1.id = table2.id`.
- When creating a ratio, always cast the numerator as float
- Write exactly one SELECT statement and no explanation
- If the schema cannot answer the question, respond with `UNANSWERABLE`

### Input:
Generate a SQL query that answers the question `{question}`.
This query will run on a {engine} database with the following tables and columns:

{schema}

### Response:
Based on your instructions, here is the SQL query I have generated to answer the question `{question}`:
```sql
"#,
        engine = schema.engine,
        question = question,
        schema = schema.to_ddl(),
    )
}

/// Marker a model returns when the schema cannot answer the question
pub(crate) const UNANSWERABLE: &str = "UNANSWERABLE";

const SQL_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "INSERT", "UPDATE", "DELETE", "CREATE", "ALTER", "DROP", "VALUES", "TABLE", "EXPLAIN",
];

/// Whether text starts like a SQL statement
pub fn starts_with_sql_keyword(text: &str) -> bool {
    let upper = text.trim_start().to_ascii_uppercase();
    SQL_KEYWORDS.iter().any(|keyword| {
        upper.starts_with(keyword)
            && upper[keyword.len()..]
                .chars()
                .next()
                .map_or(true, |next| !next.is_ascii_alphanumeric() && next != '_')
    })
}

/// Pull the SQL out of a model response
///
/// Tries a ```sql fenced block, then any fenced block, then the first line
/// starting with a SQL keyword (continued until a closing fence or `;`).
/// Falls back to the whole response, trimmed.
pub fn extract_sql(content: &str) -> String {
    if let Some(start) = content.find("```sql") {
        let after = &content[start + 6..];
        let end = after.find("```").unwrap_or(after.len());
        let sql = after[..end].trim();
        debug!(%sql, "extracted SQL from sql code block");
        return sql.to_string();
    }

    if let Some(start) = content.find("```") {
        let after = &content[start + 3..];
        if let Some(end) = after.find("```") {
            let sql = after[..end].trim();
            debug!(%sql, "extracted SQL from code block");
            return sql.to_string();
        }
    }

    let lines: Vec<&str> = content.lines().collect();
    for (index, line) in lines.iter().enumerate() {
        if !starts_with_sql_keyword(line) {
            continue;
        }

        let mut sql = line.trim().to_string();
        if !sql.ends_with(';') {
            for next_line in &lines[index + 1..] {
                let next_line = next_line.trim();
                if next_line.starts_with("```") {
                    break;
                }
                sql.push(' ');
                sql.push_str(next_line);
                if next_line.ends_with(';') {
                    break;
                }
            }
        }

        debug!(%sql, "extracted SQL by line scanning");
        return sql.trim().to_string();
    }

    content.trim().to_string()
}
