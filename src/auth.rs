//! Caller and admin authentication.
//!
//! - [`resolve_caller`] turns a raw client token into a [`Caller`] with its
//!   plan, or fails with `Unauthenticated` / `Unauthorized` / `Internal`.
//! - [`verify_admin_secret`] gates the admin surface on a pre-shared secret.
//!   An unset secret disables the admin surface entirely.

use subtle::ConstantTimeEq;
use tracing::error;
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::registry::{Plan, Registry};

/// An authenticated client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub token: String,
    pub plan_name: String,
    pub plan: Plan,
}

/// Resolve a raw token against the registry.
///
/// - missing or blank → `Unauthenticated`
/// - not assigned → `Unauthorized`
/// - assigned to a plan that no longer exists → `Internal` (integrity fault,
///   never treated as unlimited)
pub fn resolve_caller(registry: &Registry, raw: Option<&str>) -> Result<Caller> {
    let token = raw.map(str::trim).unwrap_or_default();
    if token.is_empty() {
        return Err(GatewayError::Unauthenticated(
            "missing client token".to_string(),
        ));
    }

    let plan_name = registry
        .plan_of(token)
        .ok_or_else(|| GatewayError::Unauthorized("unknown client token".to_string()))?;

    let plan = registry.plan(plan_name).map_err(|_| {
        error!(
            token = %redact(token),
            plan = plan_name,
            "registry integrity fault: token assigned to missing plan"
        );
        GatewayError::Internal(format!("plan '{plan_name}' for this token is missing"))
    })?;

    Ok(Caller {
        token: token.to_string(),
        plan_name: plan_name.to_string(),
        plan,
    })
}

/// Check a presented admin secret against the configured one.
///
/// `configured` of `None` (or empty) means the admin surface is disabled and
/// every request is refused.
pub fn verify_admin_secret(configured: Option<&str>, presented: Option<&str>) -> Result<()> {
    let Some(expected) = configured.filter(|s| !s.is_empty()) else {
        return Err(GatewayError::Forbidden(
            "admin access is disabled".to_string(),
        ));
    };
    let Some(presented) = presented.filter(|s| !s.is_empty()) else {
        return Err(GatewayError::Forbidden("missing admin secret".to_string()));
    };

    let expected = expected.as_bytes();
    let presented = presented.as_bytes();
    // ct_eq on slices of different length returns 0 without leaking position.
    if bool::from(expected.ct_eq(presented)) {
        Ok(())
    } else {
        Err(GatewayError::Forbidden("invalid admin secret".to_string()))
    }
}

/// Strip a `Bearer ` prefix (case-sensitive) from an `Authorization` value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Log-safe form of a token: first four characters followed by `…`.
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{prefix}…")
}

/// Random 64-character hex string suitable as an admin secret.
pub fn generate_secret() -> String {
    let a = Uuid::new_v4().simple().to_string();
    let b = Uuid::new_v4().simple().to_string();
    format!("{a}{b}")
}

// ============================================================================
// Tests
// ============================================================================
