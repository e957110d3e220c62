//! Monthly quota decision.
//!
//! [`admit`] is a pure function over a plan and a usage reading taken at call
//! time. The reading and the later increment are separate steps with the
//! upstream call in between, so the limit is soft: two requests that both
//! observe `limit - 1` can both be admitted and finish at `limit + 1`.
//! Closing that gap would mean holding a per-token lock across the upstream
//! call, which the gateway does not do.

use crate::error::GatewayError;
use crate::registry::Plan;

/// Fraction of the allowance at or above which admitted requests are logged.
pub const WARNING_THRESHOLD: f64 = 0.8;

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Below the monthly limit.
    Allow { used: u64, limit: u64 },
    /// At or over the monthly limit.
    Deny { used: u64, limit: u64 },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    /// Fraction of the allowance consumed *after* this request would count.
    pub fn utilisation(&self) -> f64 {
        match *self {
            Self::Allow { used, limit } | Self::Deny { used, limit } if limit > 0 => {
                (used.saturating_add(1)) as f64 / limit as f64
            }
            _ => 1.0,
        }
    }

    /// `Ok(())` when allowed, `QuotaExceeded` otherwise.
    pub fn into_result(self) -> crate::error::Result<()> {
        match self {
            Self::Allow { .. } => Ok(()),
            Self::Deny { used, limit } => Err(GatewayError::QuotaExceeded { used, limit }),
        }
    }
}

/// Decide whether a caller on `plan` who has already sent `used` messages
/// this month may send another.
pub fn admit(plan: &Plan, used: u64) -> Admission {
    let limit = plan.monthly_messages;
    if used >= limit {
        Admission::Deny { used, limit }
    } else {
        Admission::Allow { used, limit }
    }
}
