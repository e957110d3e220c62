//! Client routes: chat and usage.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::api::middleware::client_token;
use crate::api::server::AppState;
use crate::error::{GatewayError, Result};
use crate::service::UsageReport;

/// POST /chat: forward `{message}` upstream on behalf of a metered token.
pub async fn post_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>> {
    let token = client_token(&headers);

    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            // Credentials are checked before the body is judged.
            state.gateway.resolve_caller(token.as_deref()).await?;
            return Err(GatewayError::Validation(rejection.body_text()));
        }
    };
    let message = body.get("message").and_then(Value::as_str).unwrap_or("");

    let outcome = state
        .gateway
        .chat(token.as_deref(), message, state.upstream.as_ref())
        .await?;

    Ok(Json(json!({
        "reply": outcome.reply,
        "usage": {
            "used": outcome.usage.used,
            "limit": outcome.usage.limit,
            "period": outcome.usage.period,
        },
    })))
}

/// GET /usage: current-period usage for the presented token.
pub async fn get_usage(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<UsageReport>> {
    let token = client_token(&headers);
    let caller = state.gateway.resolve_caller(token.as_deref()).await?;
    Ok(Json(state.gateway.usage_of(&caller)))
}
