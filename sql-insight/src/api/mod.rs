//! REST API endpoints
//!
//! Handlers translate engine errors into HTTP statuses: request and safety
//! failures are client errors, execution and infrastructure failures are
//! service errors. Error bodies look like
//!
//! ```json
//! { "error": "Unsafe query, rule 'not_read_only' violated: ...", "kind": "UnsafeQueryError", "rule": "not_read_only" }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tracing::{error, warn};

use crate::validator::UnsafeRule;
use crate::{Error, ErrorClass};

pub mod execute;
pub mod health;
pub mod predict;

// Re-export handlers for convenience
pub use execute::execute_handler;
pub use health::health_handler;
pub use predict::predictive_analysis_handler;

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<UnsafeRule>,
}

/// Engine error on its way out as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match (&self.0, self.0.class()) {
            (Error::UngroundedQuery(_) | Error::InsufficientData(_), _) => StatusCode::UNPROCESSABLE_ENTITY,
            (Error::ExecutionTimeout(_), _) => StatusCode::GATEWAY_TIMEOUT,
            (Error::Connection(_) | Error::Introspection(_) | Error::Generator(_), _) => StatusCode::BAD_GATEWAY,
            (_, ErrorClass::Client) => StatusCode::BAD_REQUEST,
            (_, ErrorClass::Service) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self.0.class() {
            ErrorClass::Client => warn!(%status, error = %self.0, "request rejected"),
            ErrorClass::Service => error!(%status, error = %self.0, "request failed"),
        }

        let rule = match &self.0 {
            Error::UnsafeQuery { rule, .. } => Some(*rule),
            _ => None,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind(),
            rule,
        };
        (status, Json(body)).into_response()
    }
}
