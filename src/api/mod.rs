//! HTTP surface for the gateway: the chat routes, the secret-gated admin
//! routes and a health check.

pub mod error;
pub mod middleware;
pub mod routes;
pub mod server;

pub use server::{build_router, start_server, AppState};

#[cfg(test)]
pub(crate) mod testing;
