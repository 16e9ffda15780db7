use crate::llm::{build_prompt, extract_sql, LlmConfig, LlmError, SqlGenerator, UNANSWERABLE};
use crate::schema::SchemaSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

pub struct OllamaProvider {
    client: reqwest::Client,
    api_url: String,
    model: String,
}

#[derive(Serialize, Debug)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize, Debug)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize, Debug)]
struct OllamaResponse {
    response: String,
}

impl OllamaProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_url = config
            .api_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434/api/generate".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl SqlGenerator for OllamaProvider {
    async fn generate_sql(&self, question: &str, schema: &SchemaSnapshot) -> Result<String, LlmError> {
        let request = OllamaRequest {
            model: &self.model,
            prompt: build_prompt(question, schema),
            stream: false,
            options: OllamaOptions { temperature: 0.0 },
        };

        info!(model = %self.model, "Sending request to Ollama");
        debug!(api_url = %self.api_url, "Ollama endpoint");

        let response = self
            .client
            .post(&self.api_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(%status, %body, "Ollama API returned an error");
            return Err(LlmError::Response(format!(
                "Ollama API responded with status code: {} - {}",
                status, body
            )));
        }

        let ollama_response: OllamaResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Response(format!("Failed to parse Ollama response: {}", e)))?;

        debug!(response = %ollama_response.response, "Raw response from Ollama");

        let sql = extract_sql(&ollama_response.response);
        if sql.trim().is_empty() {
            return Err(LlmError::Response("Failed to extract SQL from response".to_string()));
        }
        if sql.to_ascii_uppercase().contains(UNANSWERABLE) {
            return Err(LlmError::Ungrounded(format!(
                "the model could not answer '{}' from the schema",
                question
            )));
        }

        Ok(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::EngineKind;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    /// Serve one canned reply on a local port and return the endpoint URL
    async fn serve(status: StatusCode, reply: Value) -> String {
        let app = Router::new().route(
            "/api/generate",
            post(move |Json(request): Json<Value>| async move {
                assert_eq!(request["stream"], json!(false));
                (status, Json(reply))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/api/generate", address)
    }

    fn provider(api_url: String) -> OllamaProvider {
        OllamaProvider::new(&LlmConfig {
            backend: "ollama".to_string(),
            api_url: Some(api_url),
            ..LlmConfig::default()
        })
        .unwrap()
    }

    fn schema() -> SchemaSnapshot {
        SchemaSnapshot::new(EngineKind::Sqlite, Vec::new())
    }

    #[tokio::test]
    async fn test_generate_sql_extracts_fenced_query() {
        let url = serve(
            StatusCode::OK,
            json!({ "response": "```sql\nSELECT name FROM customers LIMIT 5\n```" }),
        )
        .await;

        let sql = provider(url).generate_sql("five customers", &schema()).await.unwrap();
        assert_eq!(sql, "SELECT name FROM customers LIMIT 5");
    }

    #[tokio::test]
    async fn test_generate_sql_unanswerable_is_ungrounded() {
        let url = serve(StatusCode::OK, json!({ "response": "UNANSWERABLE" })).await;

        let error = provider(url).generate_sql("who won the cup", &schema()).await.unwrap_err();
        assert!(matches!(error, LlmError::Ungrounded(_)));
    }

    #[tokio::test]
    async fn test_generate_sql_error_status_is_response_error() {
        let url = serve(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "model not loaded" })).await;

        let error = provider(url).generate_sql("five customers", &schema()).await.unwrap_err();
        match error {
            LlmError::Response(message) => {
                assert!(message.contains("500"));
                assert!(message.contains("model not loaded"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generate_sql_unreachable_is_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let error = provider(format!("http://{}/api/generate", address))
            .generate_sql("five customers", &schema())
            .await
            .unwrap_err();
        assert!(matches!(error, LlmError::Connection(_)));
    }
}
