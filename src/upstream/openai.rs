//! OpenAI-compatible chat completions client.
//!
//! Sends `POST {api_base}/chat/completions` with a fixed system prompt and
//! the caller's message, then extracts `choices[0].message.content`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{truncate_diagnostic, CompletionClient, MAX_DIAGNOSTIC_BYTES};
use crate::config::UpstreamConfig;
use crate::error::{GatewayError, Result};

/// Reply used when the upstream answers successfully but without content.
pub const EMPTY_REPLY_FALLBACK: &str = "Desculpe, não consegui gerar uma resposta.";

pub struct OpenAiClient {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
    system_prompt: String,
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("api_base", &self.api_base)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiClient {
    /// Build a client from config. Fails if no API key is configured.
    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                GatewayError::Config(
                    "upstream API key is not set (OPENAI_API_KEY or upstream.apiKey)".to_string(),
                )
            })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
        })
    }

    fn request_body(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": self.system_prompt },
                { "role": "user", "content": prompt },
            ],
        })
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_base);
        debug!(model = %self.model, "upstream: sending completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(|e| transport_error("request failed", &e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error("failed to read response", &e))?;

        if !status.is_success() {
            warn!(status = status.as_u16(), "upstream: completion request failed");
            return Err(GatewayError::Upstream(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate_diagnostic(&text, MAX_DIAGNOSTIC_BYTES)
            )));
        }

        parse_completion(&text)
    }
}

/// Upstream error for a transport failure, with the cause truncated like
/// response bodies are.
fn transport_error(context: &str, cause: &dyn std::fmt::Display) -> GatewayError {
    GatewayError::Upstream(format!(
        "{context}: {}",
        truncate_diagnostic(&cause.to_string(), MAX_DIAGNOSTIC_BYTES)
    ))
}

/// Extract the reply text from a chat completions response body.
pub fn parse_completion(body: &str) -> Result<String> {
    let data: Value = serde_json::from_str(body).map_err(|_| {
        GatewayError::Upstream(format!(
            "invalid JSON from upstream: {}",
            truncate_diagnostic(body, MAX_DIAGNOSTIC_BYTES)
        ))
    })?;

    let reply = data["choices"][0]["message"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .unwrap_or(EMPTY_REPLY_FALLBACK);
    Ok(reply.to_string())
}
