//! Trend projection endpoint

use axum::{extract::State, response::Json};
use std::sync::Arc;

use crate::api::ApiError;
use crate::pipeline::{PredictiveRequest, PredictiveResponse, QueryEngine};

/// Handler for POST /predictive-analysis
///
/// Re-validates and re-runs an earlier query, then reports per-column trends
/// along its date or ordered column.
///
/// Request body:
/// ```json
/// {
///   "sqlQuery": "SELECT month, revenue FROM monthly_revenue ORDER BY month",
///   "connection": "sqlite://data/shop.db",
///   "chartTypeHint": "line"
/// }
/// ```
///
/// Response:
/// ```json
/// {
///   "predictions": "Across month from 2024-01 to 2024-06: revenue is increasing (+100%) ...",
///   "axis": "month",
///   "trends": { "revenue": { "direction": "increasing", "changePercentage": 100.0 } },
///   "dataSummary": { "rowCount": 6, "columns": ["month", "revenue"], "numericColumns": ["revenue"], "statistics": {...} },
///   "chart": {...}
/// }
/// ```
pub async fn predictive_analysis_handler(
    State(engine): State<Arc<QueryEngine>>,
    Json(request): Json<PredictiveRequest>,
) -> Result<Json<PredictiveResponse>, ApiError> {
    let response = engine.predictive_analysis(request).await?;
    Ok(Json(response))
}
