//! Health endpoint.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::api::server::AppState;

/// GET / and GET /health: liveness plus snapshot durability.
pub async fn get_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "app": "tollgate",
        "version": env!("CARGO_PKG_VERSION"),
        "now": chrono::Utc::now().to_rfc3339(),
        "durability": state.gateway.durability(),
    }))
}
