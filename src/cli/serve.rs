//! `tollgate serve`: load the registry and run the HTTP gateway.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use tollgate::api::{start_server, AppState};
use tollgate::config::Config;
use tollgate::service::Gateway;
use tollgate::upstream::OpenAiClient;

use super::open_store;

pub async fn cmd_serve(mut config: Config, port: Option<u16>, bind: Option<String>) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(bind) = bind {
        config.server.bind = bind;
    }

    let upstream =
        OpenAiClient::from_config(&config.upstream).context("cannot start without an upstream")?;

    let store = open_store(&config);
    let gateway = Gateway::load_or_default(
        store,
        config.defaults.clone(),
        config.admin.effective_secret().map(String::from),
    )
    .await
    .context("failed to load the registry snapshot")?;

    info!(
        model = %config.upstream.model,
        admin = gateway.admin_enabled(),
        "gateway ready"
    );

    let state = AppState::new(Arc::new(gateway), Arc::new(upstream));
    start_server(&config.server, state)
        .await
        .with_context(|| {
            format!(
                "server on {}:{} stopped with an error",
                config.server.bind, config.server.port
            )
        })
}
