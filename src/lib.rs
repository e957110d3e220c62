//! Tollgate: a metered chat gateway.
//!
//! Clients identify themselves with a token; each token is assigned to a
//! plan with a monthly message allowance. Requests within the allowance are
//! forwarded to an OpenAI-compatible completion service and counted;
//! requests beyond it are refused. Operators manage plans and tokens through
//! a secret-protected admin surface, and every change is saved to a durable
//! snapshot.
//!
//! Entry point for embedding is [`service::Gateway`]; [`api::build_router`]
//! wraps it in an axum router.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod quota;
pub mod registry;
pub mod service;
pub mod upstream;
pub mod usage;

pub use error::{GatewayError, Result};
pub use service::Gateway;
