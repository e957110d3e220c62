//! Router fixtures shared by the route tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::util::ServiceExt;

use super::server::{build_router, AppState};
use crate::config::ServerConfig;
use crate::error::{GatewayError, Result};
use crate::registry::{MemorySnapshotStore, PlanTerms, Snapshot};
use crate::service::Gateway;
use crate::upstream::CompletionClient;

pub const SECRET: &str = "s3cret";

/// Upstream that answers every prompt with a fixed reply.
#[derive(Default)]
pub struct StaticUpstream {
    pub calls: AtomicUsize,
}

#[async_trait]
impl CompletionClient for StaticUpstream {
    fn name(&self) -> &str {
        "static"
    }

    async fn complete(&self, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("Olá!".to_string())
    }
}

pub struct FailingUpstream;

#[async_trait]
impl CompletionClient for FailingUpstream {
    fn name(&self) -> &str {
        "failing"
    }

    async fn complete(&self, _prompt: &str) -> Result<String> {
        Err(GatewayError::Upstream("HTTP 500: model overloaded".into()))
    }
}

/// `free` (3 msgs) and `pro` (1000 msgs); `client-A` on free, `X` on pro.
pub fn seed() -> Snapshot {
    let mut s = Snapshot::default();
    s.plans.insert(
        "free".into(),
        PlanTerms {
            monthly_messages: 3,
            price: "R$ 0".into(),
        },
    );
    s.plans.insert(
        "pro".into(),
        PlanTerms {
            monthly_messages: 1000,
            price: "R$ 29,90".into(),
        },
    );
    s.users.insert("client-A".into(), "free".into());
    s.users.insert("X".into(), "pro".into());
    s
}

pub struct TestApp {
    pub router: Router,
    pub gateway: Arc<Gateway>,
    pub store: Arc<MemorySnapshotStore>,
}

impl TestApp {
    pub async fn with_upstream(upstream: Arc<dyn CompletionClient>) -> Self {
        let store = Arc::new(MemorySnapshotStore::with_snapshot(seed()));
        let gateway = Arc::new(
            Gateway::load_or_default(store.clone(), Snapshot::default(), Some(SECRET.into()))
                .await
                .unwrap(),
        );
        let router = build_router(
            AppState::new(gateway.clone(), upstream),
            &ServerConfig::default(),
        );
        Self {
            router,
            gateway,
            store,
        }
    }

    pub async fn new() -> Self {
        Self::with_upstream(Arc::new(StaticUpstream::default())).await
    }

    /// Send a request and decode the JSON body (`Null` when empty).
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let resp = self.router.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }
}

/// Request builder with the admin secret attached.
pub fn admin(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-admin-secret", SECRET);
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// `POST /chat` as `token`.
pub fn chat(token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/chat")
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}
