//! Admin routes for the plan catalog and token assignments.
//!
//! All routes sit behind [`admin_middleware`](crate::api::middleware::admin_middleware);
//! handlers receive the verified secret as an [`AdminSecret`] extension.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::api::middleware::AdminSecret;
use crate::api::server::AppState;
use crate::error::{GatewayError, Result};
use crate::registry::Snapshot;
use crate::service::{PlanOp, PlanState, UserOp, UserState};

type Body = std::result::Result<Json<Value>, JsonRejection>;

fn json_body(body: Body) -> Result<Value> {
    body.map(|Json(v)| v)
        .map_err(|rejection| GatewayError::Validation(rejection.body_text()))
}

fn required_str<'a>(body: &'a Value, field: &str) -> Result<&'a str> {
    body.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Validation(format!("{field} is required")))
}

fn secret(ext: &AdminSecret) -> Option<&str> {
    Some(ext.0.as_str())
}

fn unexpected<T>(what: &str) -> Result<T> {
    Err(GatewayError::Internal(format!("unexpected {what} result")))
}

// ------------------------------------------------------------------
// Snapshot
// ------------------------------------------------------------------

/// GET /admin/snapshot
pub async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminSecret>,
) -> Result<Json<Snapshot>> {
    Ok(Json(state.gateway.admin_snapshot(secret(&admin)).await?))
}

// ------------------------------------------------------------------
// Plans
// ------------------------------------------------------------------

/// GET /admin/plans
pub async fn list_plans(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminSecret>,
) -> Result<Json<Value>> {
    match state
        .gateway
        .admin_mutate_plan(secret(&admin), PlanOp::List)
        .await?
    {
        PlanState::Listed(plans) => Ok(Json(json!({ "plans": plans }))),
        _ => unexpected("plan list"),
    }
}

/// GET /admin/plans/{name}
pub async fn get_plan(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminSecret>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    match state
        .gateway
        .admin_mutate_plan(secret(&admin), PlanOp::Get { name })
        .await?
    {
        PlanState::Found(plan) => Ok(Json(json!(plan))),
        _ => unexpected("plan get"),
    }
}

/// PUT /admin/plans/{name} with `{monthlyMessages, price}`.
pub async fn upsert_plan(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminSecret>,
    Path(name): Path<String>,
    body: Body,
) -> Result<Json<Value>> {
    let body = json_body(body)?;
    let monthly_messages = body
        .get("monthlyMessages")
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            GatewayError::Validation("monthlyMessages must be an integer".to_string())
        })?;
    let price = required_str(&body, "price")?.to_string();

    match state
        .gateway
        .admin_mutate_plan(
            secret(&admin),
            PlanOp::Upsert {
                name,
                monthly_messages,
                price,
            },
        )
        .await?
    {
        PlanState::Upserted(plan) => Ok(Json(json!(plan))),
        _ => unexpected("plan upsert"),
    }
}

/// DELETE /admin/plans/{name}
pub async fn delete_plan(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminSecret>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    match state
        .gateway
        .admin_mutate_plan(secret(&admin), PlanOp::Remove { name })
        .await?
    {
        PlanState::Removed(plan) => Ok(Json(json!({ "removed": plan }))),
        _ => unexpected("plan remove"),
    }
}

// ------------------------------------------------------------------
// Users
// ------------------------------------------------------------------

/// GET /admin/users
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminSecret>,
) -> Result<Json<Value>> {
    match state
        .gateway
        .admin_mutate_user(secret(&admin), UserOp::List)
        .await?
    {
        UserState::Listed(users) => Ok(Json(json!({ "users": users }))),
        _ => unexpected("user list"),
    }
}

/// PUT /admin/users/{token} with `{plan}`.
pub async fn assign_user(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminSecret>,
    Path(token): Path<String>,
    body: Body,
) -> Result<Json<Value>> {
    let body = json_body(body)?;
    let plan = required_str(&body, "plan")?.to_string();

    match state
        .gateway
        .admin_mutate_user(secret(&admin), UserOp::Assign { token, plan })
        .await?
    {
        UserState::Assigned(user) => Ok(Json(json!(user))),
        _ => unexpected("user assign"),
    }
}

/// DELETE /admin/users/{token}
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminSecret>,
    Path(token): Path<String>,
) -> Result<Json<Value>> {
    match state
        .gateway
        .admin_mutate_user(secret(&admin), UserOp::Remove { token })
        .await?
    {
        UserState::Removed(user) => Ok(Json(json!({ "removed": user }))),
        _ => unexpected("user remove"),
    }
}

/// POST /admin/users/{token}/rename with `{newToken}`.
pub async fn rename_user(
    State(state): State<Arc<AppState>>,
    Extension(admin): Extension<AdminSecret>,
    Path(token): Path<String>,
    body: Body,
) -> Result<Json<Value>> {
    let body = json_body(body)?;
    let to = required_str(&body, "newToken")?.to_string();

    match state
        .gateway
        .admin_mutate_user(secret(&admin), UserOp::Rename { from: token, to })
        .await?
    {
        UserState::Renamed { from, user } => Ok(Json(json!({
            "from": from,
            "token": user.token,
            "plan": user.plan,
            "used": user.used,
        }))),
        _ => unexpected("user rename"),
    }
}
