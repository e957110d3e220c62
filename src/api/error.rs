//! HTTP mapping for [`GatewayError`].
//!
//! Every error body carries `error` (the stable kind) and `message`. Quota
//! denials add `used`/`limit`, plan conflicts add the blocking `tokens` and
//! upstream failures add truncated `details`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::error::GatewayError;

/// Status code for an error kind.
pub fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
        GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        GatewayError::Unauthorized(_) | GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
        GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::Conflict { .. } => StatusCode::CONFLICT,
        GatewayError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
        GatewayError::Persistence(_)
        | GatewayError::Config(_)
        | GatewayError::Internal(_)
        | GatewayError::Io(_)
        | GatewayError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = status_for(&self);

        let mut body = if status.is_server_error() {
            // Server-side faults are logged in full but not echoed to clients.
            error!(kind = self.kind(), "request failed: {self}");
            json!({ "error": self.kind(), "message": "internal server error" })
        } else {
            json!({ "error": self.kind(), "message": self.to_string() })
        };

        match &self {
            GatewayError::QuotaExceeded { used, limit } => {
                body["used"] = json!(used);
                body["limit"] = json!(limit);
            }
            GatewayError::Conflict { tokens, .. } if !tokens.is_empty() => {
                body["tokens"] = json!(tokens);
            }
            GatewayError::Upstream(details) => {
                body["details"] = json!(details);
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}
