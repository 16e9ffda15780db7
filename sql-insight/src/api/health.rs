//! Liveness endpoint

use axum::response::Json;
use serde_json::{json, Value};

/// Handler for GET /health
///
/// The engine holds no connections between requests, so there is nothing to
/// probe beyond the process itself.
pub async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
