//! Upstream completion service.
//!
//! The gateway only needs one capability from the upstream: turn a prompt
//! into reply text or fail. [`CompletionClient`] is that seam; the shipped
//! implementation is [`openai::OpenAiClient`].

pub mod openai;

use async_trait::async_trait;

use crate::error::Result;

pub use openai::OpenAiClient;

/// Maximum bytes of upstream diagnostic text surfaced to callers.
pub const MAX_DIAGNOSTIC_BYTES: usize = 512;

/// Something that can complete a prompt.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Send `prompt` upstream and return the reply text.
    ///
    /// Any failure (transport, non-2xx status, unparsable body) is reported as
    /// [`crate::error::GatewayError::Upstream`].
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Cut `text` to at most `max_bytes`, on a char boundary, marking the cut.
pub fn truncate_diagnostic(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}… [truncated, {} bytes total]", &text[..end], text.len())
}
