//! QueryEngineLayer - Axum integration layer
//!
//! Mounts the engine's endpoints under a base path so they can be merged
//! into an existing Axum application.

use axum::{routing::get, routing::post, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::{execute_handler, health_handler, predictive_analysis_handler};
use crate::pipeline::QueryEngine;

/// Router factory for a [`QueryEngine`]
///
/// # Example
///
/// ```rust,no_run
/// use axum::Router;
/// use sql_insight::llm::providers::pattern::PatternSqlGenerator;
/// use sql_insight::{EngineConfig, QueryEngine, QueryEngineLayer};
/// use std::sync::Arc;
///
/// let engine = QueryEngine::new(EngineConfig::default(), Arc::new(PatternSqlGenerator::new()));
/// let app = Router::new().merge(QueryEngineLayer::new("/api", engine).into_router());
/// ```
pub struct QueryEngineLayer {
    base_path: String,
    engine: Arc<QueryEngine>,
}

impl QueryEngineLayer {
    /// # Arguments
    ///
    /// * `base_path` - URL prefix for the endpoints (e.g. "/api"); "" or "/" mounts them at the root
    /// * `engine` - The engine that answers requests
    pub fn new(base_path: impl Into<String>, engine: QueryEngine) -> Self {
        Self::shared(base_path, Arc::new(engine))
    }

    /// Mount an engine that is also used elsewhere
    pub fn shared(base_path: impl Into<String>, engine: Arc<QueryEngine>) -> Self {
        Self {
            base_path: base_path.into().trim_end_matches('/').to_string(),
            engine,
        }
    }

    /// Convert into an Axum Router that can be merged
    ///
    /// The returned router includes:
    /// - `POST {base_path}/execute`
    /// - `POST {base_path}/predictive-analysis`
    /// - `GET {base_path}/health`
    /// - Permissive CORS and HTTP request tracing
    pub fn into_router(self) -> Router {
        let api_router = Router::new()
            .route("/execute", post(execute_handler))
            .route("/predictive-analysis", post(predictive_analysis_handler))
            .route("/health", get(health_handler))
            .with_state(self.engine);

        // Axum 0.8 does not allow nesting at the root
        let router = if self.base_path.is_empty() {
            Router::new().merge(api_router)
        } else {
            Router::new().nest(&self.base_path, api_router)
        };

        router
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::llm::providers::pattern::PatternSqlGenerator;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn router(base_path: &str) -> Router {
        let engine = QueryEngine::new(EngineConfig::default(), Arc::new(PatternSqlGenerator::new()));
        QueryEngineLayer::new(base_path, engine).into_router()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        for (base_path, uri) in [("/api", "/api/health"), ("/", "/health")] {
            let response = router(base_path)
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(json_body(response).await["status"], "healthy");
        }
    }

    #[tokio::test]
    async fn test_execute_rejects_empty_request() {
        let response = router("/api")
            .oneshot(post_json("/api/execute", r#"{"connection": "sqlite::memory:"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["kind"], "InvalidRequestError");
    }

    #[tokio::test]
    async fn test_missing_driver_is_bad_gateway() {
        let response = router("/api")
            .oneshot(post_json(
                "/api/execute",
                r#"{"sqlQuery": "SELECT 1", "connection": "mssql://sa:pw@localhost/warehouse"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(response).await;
        assert_eq!(body["kind"], "ConnectionError");
        assert!(!body["error"].as_str().unwrap().contains("pw"));
    }

    #[tokio::test]
    async fn test_predictive_analysis_route_exists() {
        let response = router("/api")
            .oneshot(post_json(
                "/api/predictive-analysis",
                r#"{"sqlQuery": "", "connection": "sqlite::memory:"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
