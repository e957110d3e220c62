//! Error types for Tollgate.
//!
//! Every fallible operation in the library returns [`Result<T>`]. The HTTP
//! layer maps each variant onto a status code in `api::error`; the binary
//! wraps these in `anyhow` for context.

use thiserror::Error;

/// All errors surfaced by the gateway core and its collaborators.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed admin or chat input.
    #[error("validation error: {0}")]
    Validation(String),

    /// No token, or a blank one, was presented.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Token was presented but is not recognised.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Admin secret missing, wrong, or the admin surface is disabled.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A referenced plan or user does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate key, or a plan deletion blocked by assigned tokens.
    #[error("conflict: {message}")]
    Conflict {
        message: String,
        /// Tokens that block the operation (sorted). Empty for plain duplicates.
        tokens: Vec<String>,
    },

    /// The caller has used up the monthly allowance of their plan.
    #[error("quota exceeded: {used}/{limit} messages used this month")]
    QuotaExceeded { used: u64, limit: u64 },

    /// The upstream completion service failed or returned garbage.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Snapshot could not be read or written.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Invalid or incomplete configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Registry integrity fault (e.g. a user pointing at a vanished plan).
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// Shorthand for a duplicate-key conflict with no blocking tokens.
    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
            tokens: Vec::new(),
        }
    }

    /// Stable machine-readable kind, used as the `error` field in JSON bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::Upstream(_) => "upstream_error",
            Self::Persistence(_) | Self::Io(_) | Self::Json(_) => "persistence_error",
            Self::Config(_) => "config_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
