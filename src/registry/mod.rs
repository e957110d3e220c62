//! Plan catalog and token-to-plan assignments.
//!
//! [`Registry`] is the plain, unsynchronized data structure. All operations
//! validate against the current state *before* touching it, so a failed call
//! leaves the registry exactly as it was. Synchronization and persistence are
//! layered on top by [`crate::service::Gateway`].
//!
//! # Example
//!
//! ```rust
//! use tollgate::registry::Registry;
//!
//! let mut registry = Registry::default();
//! registry.upsert_plan("free", 3, "R$ 0").unwrap();
//! registry.assign("token-a", "free").unwrap();
//!
//! assert_eq!(registry.plan_of("token-a"), Some("free"));
//! assert!(registry.remove_plan("free").is_err()); // still referenced
//! ```

pub mod snapshot;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GatewayError, Result};

pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, Snapshot, SnapshotStore};

/// Monthly allowance and display price of a plan, as stored in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanTerms {
    /// Messages allowed per calendar month. Always > 0 once loaded.
    pub monthly_messages: u64,
    /// Free-form display price, e.g. `"R$ 29,90"`.
    pub price: String,
}

/// A named plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub name: String,
    pub monthly_messages: u64,
    pub price: String,
}

impl Plan {
    fn from_terms(name: &str, terms: &PlanTerms) -> Self {
        Self {
            name: name.to_string(),
            monthly_messages: terms.monthly_messages,
            price: terms.price.clone(),
        }
    }
}

/// A client token and the plan it is assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub token: String,
    pub plan: String,
}

/// A snapshot entry dropped during [`Registry::from_snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectedEntry {
    /// Plan with a zero limit or blank price/name.
    Plan { name: String, reason: String },
    /// User whose plan is missing (or was itself rejected).
    User { token: String, plan: String },
}

impl std::fmt::Display for RejectedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plan { name, reason } => write!(f, "plan '{name}': {reason}"),
            Self::User { token, plan } => write!(
                f,
                "user '{}': references unknown plan '{plan}'",
                crate::auth::redact(token)
            ),
        }
    }
}

/// In-memory plan and user registries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    plans: HashMap<String, PlanTerms>,
    users: HashMap<String, String>,
}

impl Registry {
    /// Build a registry from a snapshot, dropping entries that would break
    /// registry invariants.
    ///
    /// Plans with a zero limit or blank price are rejected first; users that
    /// point at a missing or rejected plan are rejected next. Rejected tokens
    /// will resolve as unknown rather than gaining any default allowance.
    pub fn from_snapshot(snapshot: Snapshot) -> (Self, Vec<RejectedEntry>) {
        let mut rejected = Vec::new();
        let mut plans = HashMap::with_capacity(snapshot.plans.len());

        for (name, terms) in snapshot.plans {
            let limit = i64::try_from(terms.monthly_messages).unwrap_or(i64::MAX);
            match validate_plan(&name, limit, &terms.price) {
                Ok(()) => {
                    plans.insert(name, terms);
                }
                Err(e) => rejected.push(RejectedEntry::Plan {
                    name,
                    reason: e.to_string(),
                }),
            }
        }

        let mut users = HashMap::with_capacity(snapshot.users.len());
        for (token, plan) in snapshot.users {
            if token.trim().is_empty() || !plans.contains_key(&plan) {
                rejected.push(RejectedEntry::User { token, plan });
            } else {
                users.insert(token, plan);
            }
        }

        for entry in &rejected {
            warn!("registry: rejected snapshot entry: {entry}");
        }

        (Self { plans, users }, rejected)
    }

    /// Build a registry without load-time filtering.
    #[cfg(test)]
    pub(crate) fn unchecked(snapshot: Snapshot) -> Self {
        Self {
            plans: snapshot.plans.into_iter().collect(),
            users: snapshot.users.into_iter().collect(),
        }
    }

    /// Serializable image of the current state.
    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            plans: self
                .plans
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            users: self
                .users
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    // ------------------------------------------------------------------
    // Plans
    // ------------------------------------------------------------------

    /// Insert or replace a plan.
    ///
    /// `monthly_messages` is taken signed so that negative admin input is
    /// reported as a validation error rather than wrapping.
    pub fn upsert_plan(&mut self, name: &str, monthly_messages: i64, price: &str) -> Result<Plan> {
        validate_plan(name, monthly_messages, price)?;
        let terms = PlanTerms {
            monthly_messages: monthly_messages.unsigned_abs(),
            price: price.trim().to_string(),
        };
        let plan = Plan::from_terms(name, &terms);
        self.plans.insert(name.to_string(), terms);
        Ok(plan)
    }

    /// Remove a plan that no user references.
    pub fn remove_plan(&mut self, name: &str) -> Result<Plan> {
        let plan = self.plan(name)?;
        let tokens = self.tokens_on(name);
        if !tokens.is_empty() {
            return Err(GatewayError::Conflict {
                message: format!(
                    "plan '{name}' is still assigned to {} user(s)",
                    tokens.len()
                ),
                tokens,
            });
        }
        self.plans.remove(name);
        Ok(plan)
    }

    pub fn plan(&self, name: &str) -> Result<Plan> {
        self.plans
            .get(name)
            .map(|terms| Plan::from_terms(name, terms))
            .ok_or_else(|| GatewayError::NotFound(format!("plan '{name}'")))
    }

    /// All plans, sorted by name.
    pub fn plans(&self) -> Vec<Plan> {
        let mut plans: Vec<Plan> = self
            .plans
            .iter()
            .map(|(name, terms)| Plan::from_terms(name, terms))
            .collect();
        plans.sort_by(|a, b| a.name.cmp(&b.name));
        plans
    }

    /// Tokens assigned to `plan`, sorted.
    pub fn tokens_on(&self, plan: &str) -> Vec<String> {
        let mut tokens: Vec<String> = self
            .users
            .iter()
            .filter(|(_, p)| p.as_str() == plan)
            .map(|(t, _)| t.clone())
            .collect();
        tokens.sort();
        tokens
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Create or reassign a token.
    pub fn assign(&mut self, token: &str, plan: &str) -> Result<User> {
        validate_token(token)?;
        if !self.plans.contains_key(plan) {
            return Err(GatewayError::NotFound(format!("plan '{plan}'")));
        }
        self.users.insert(token.to_string(), plan.to_string());
        Ok(User {
            token: token.to_string(),
            plan: plan.to_string(),
        })
    }

    pub fn remove_user(&mut self, token: &str) -> Result<User> {
        let plan = self
            .users
            .remove(token)
            .ok_or_else(|| GatewayError::NotFound("user".to_string()))?;
        Ok(User {
            token: token.to_string(),
            plan,
        })
    }

    /// Move the assignment of `old` to `new`.
    ///
    /// Counter migration is the caller's job; this only touches the map.
    pub fn rename_user(&mut self, old: &str, new: &str) -> Result<User> {
        validate_token(new)?;
        if !self.users.contains_key(old) {
            return Err(GatewayError::NotFound("user".to_string()));
        }
        if self.users.contains_key(new) {
            return Err(GatewayError::duplicate("new token is already assigned"));
        }
        let plan = self
            .users
            .remove(old)
            .ok_or_else(|| GatewayError::NotFound("user".to_string()))?;
        self.users.insert(new.to_string(), plan.clone());
        Ok(User {
            token: new.to_string(),
            plan,
        })
    }

    /// Plan name assigned to `token`, if any.
    pub fn plan_of(&self, token: &str) -> Option<&str> {
        self.users.get(token).map(String::as_str)
    }

    /// All users, sorted by token.
    pub fn users(&self) -> Vec<User> {
        let mut users: Vec<User> = self
            .users
            .iter()
            .map(|(token, plan)| User {
                token: token.clone(),
                plan: plan.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.token.cmp(&b.token));
        users
    }

    /// Tokens whose plan is missing. Empty whenever the registry is consistent.
    pub fn dangling_users(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self
            .users
            .iter()
            .filter(|(_, plan)| !self.plans.contains_key(plan.as_str()))
            .map(|(token, _)| token.clone())
            .collect();
        tokens.sort();
        tokens
    }
}

fn validate_plan(name: &str, monthly_messages: i64, price: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(GatewayError::Validation(
            "plan name must not be empty".to_string(),
        ));
    }
    if name.trim() != name {
        return Err(GatewayError::Validation(
            "plan name must not have surrounding whitespace".to_string(),
        ));
    }
    if monthly_messages <= 0 {
        return Err(GatewayError::Validation(format!(
            "monthlyMessages must be a positive integer, got {monthly_messages}"
        )));
    }
    if price.trim().is_empty() {
        return Err(GatewayError::Validation(
            "price must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_token(token: &str) -> Result<()> {
    if token.trim().is_empty() || token.trim() != token {
        return Err(GatewayError::Validation(
            "token must be non-empty and have no surrounding whitespace".to_string(),
        ));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
