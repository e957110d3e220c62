//! Axum API server for Tollgate.

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, HeaderValue, Method};
use axum::middleware as axum_mw;
use axum::routing::{get, post, put};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::middleware::{ADMIN_SECRET_HEADER, CLIENT_TOKEN_HEADER};
use super::routes::{admin, chat, health};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::service::Gateway;
use crate::upstream::CompletionClient;

/// Shared state for all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    /// Completion service that chat requests are forwarded to.
    pub upstream: Arc<dyn CompletionClient>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, upstream: Arc<dyn CompletionClient>) -> Self {
        Self { gateway, upstream }
    }
}

/// CORS layer for the configured browser origins.
///
/// Origins that are not valid header values are skipped with a warning.
/// Requests from other origins get no CORS headers, so browsers refuse them.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "cors: ignoring invalid origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            HeaderName::from_static("content-type"),
            HeaderName::from_static("authorization"),
            HeaderName::from_static(CLIENT_TOKEN_HEADER),
            HeaderName::from_static(ADMIN_SECRET_HEADER),
        ])
}

/// Build the axum router with all API routes.
pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    let shared_state = Arc::new(state);

    // Admin routes: the middleware runs only for matched routes, so unknown
    // paths still 404 instead of 403.
    let admin_routes = Router::new()
        .route("/admin/snapshot", get(admin::get_snapshot))
        .route("/admin/plans", get(admin::list_plans))
        .route(
            "/admin/plans/{name}",
            get(admin::get_plan)
                .put(admin::upsert_plan)
                .delete(admin::delete_plan),
        )
        .route("/admin/users", get(admin::list_users))
        .route(
            "/admin/users/{token}",
            put(admin::assign_user).delete(admin::delete_user),
        )
        .route("/admin/users/{token}/rename", post(admin::rename_user))
        .route_layer(axum_mw::from_fn_with_state(
            shared_state.clone(),
            super::middleware::admin_middleware,
        ));

    Router::new()
        .route("/", get(health::get_health))
        .route("/health", get(health::get_health))
        .route("/chat", post(chat::post_chat))
        .route("/usage", get(chat::get_usage))
        .merge(admin_routes)
        .layer(DefaultBodyLimit::max(config.body_limit_bytes))
        .layer(cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(shared_state)
}

/// Bind and serve until the process is stopped.
pub async fn start_server(config: &ServerConfig, state: AppState) -> Result<()> {
    let app = build_router(state, config);
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Tollgate listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
