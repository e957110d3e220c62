//! Credential extraction and the admin gate.
//!
//! Client tokens are read from `Authorization: Bearer <token>` or
//! `x-client-token`. The admin secret is read from `x-admin-secret` or
//! `Authorization: Bearer <secret>`.

use axum::{
    extract::State,
    http::{HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;

use super::server::AppState;
use crate::auth::bearer_token;

pub const CLIENT_TOKEN_HEADER: &str = "x-client-token";
pub const ADMIN_SECRET_HEADER: &str = "x-admin-secret";

/// Admin secret presented on a request that passed [`admin_middleware`].
#[derive(Debug, Clone)]
pub struct AdminSecret(pub String);

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    header(headers, "authorization").and_then(bearer_token)
}

/// Client token presented on a request, if any.
pub fn client_token(headers: &HeaderMap) -> Option<String> {
    bearer(headers)
        .or_else(|| header(headers, CLIENT_TOKEN_HEADER))
        .map(str::to_string)
}

/// Admin secret presented on a request, if any.
pub fn admin_secret(headers: &HeaderMap) -> Option<String> {
    header(headers, ADMIN_SECRET_HEADER)
        .or_else(|| bearer(headers))
        .map(str::to_string)
}

/// Reject requests without a valid admin secret before they reach a handler.
///
/// On success the secret is attached as an [`AdminSecret`] extension for the
/// handler to pass on to the gateway.
pub async fn admin_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let secret = admin_secret(request.headers());

    if let Err(e) = state.gateway.authorize_admin(secret.as_deref()) {
        warn!(
            path = %request.uri().path(),
            presented = secret.is_some(),
            "admin: request refused"
        );
        return e.into_response();
    }

    request
        .extensions_mut()
        .insert(AdminSecret(secret.unwrap_or_default()));
    next.run(request).await
}

// ============================================================================
// Tests
// ============================================================================
