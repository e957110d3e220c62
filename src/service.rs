//! The metering gateway service.
//!
//! [`Gateway`] owns the plan/user registry, the usage counters and the
//! snapshot store, and exposes the operations the transport layer calls:
//!
//! - [`resolve_caller`](Gateway::resolve_caller) → who is this token?
//! - [`check_and_reserve`](Gateway::check_and_reserve) → may they send one more?
//! - [`record_success`](Gateway::record_success) → count a forwarded message
//! - [`chat`](Gateway::chat) → all of the above around an upstream call
//! - [`admin_mutate_plan`](Gateway::admin_mutate_plan) /
//!   [`admin_mutate_user`](Gateway::admin_mutate_user) → secret-gated admin ops
//!
//! # Locking
//!
//! - The registry sits behind a `RwLock`. Chat requests take a read lock only
//!   long enough to resolve the token; admin mutations take the write lock
//!   only for the in-memory change.
//! - Admin mutations are additionally serialized by `admin_lock`, held across
//!   the mutation *and* the snapshot save, so snapshots are written in the
//!   same order mutations were applied.
//! - Counters are sharded (`dashmap`). The increment after a successful
//!   upstream call runs under a registry read lock and is skipped when the
//!   token was removed or renamed meanwhile. No lock at all is held across
//!   the upstream call.
//!
//! # Example
//!
//! ```rust
//! # tokio_test::block_on(async {
//! use std::sync::Arc;
//! use tollgate::registry::{MemorySnapshotStore, Snapshot};
//! use tollgate::service::{Gateway, UserOp};
//!
//! let store = Arc::new(MemorySnapshotStore::new());
//! let gateway = Gateway::load_or_default(store, tollgate::config::default_registry(), Some("s3cret".into()))
//!     .await
//!     .unwrap();
//!
//! gateway
//!     .admin_mutate_user(Some("s3cret"), UserOp::Assign { token: "A".into(), plan: "free".into() })
//!     .await
//!     .unwrap();
//!
//! let caller = gateway.resolve_caller(Some("A")).await.unwrap();
//! assert!(gateway.check_and_reserve(&caller).is_allowed());
//! assert_eq!(gateway.record_success(&caller.token), 1);
//! # });
//! ```

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::auth::{self, Caller};
use crate::error::{GatewayError, Result};
use crate::quota::{self, Admission, WARNING_THRESHOLD};
use crate::registry::{Plan, Registry, Snapshot, SnapshotStore, User};
use crate::upstream::CompletionClient;
use crate::usage::{UsageCounter, UsagePeriod};

/// Admin operations on the plan catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOp {
    Upsert {
        name: String,
        monthly_messages: i64,
        price: String,
    },
    Remove {
        name: String,
    },
    Get {
        name: String,
    },
    List,
}

impl PlanOp {
    fn is_mutation(&self) -> bool {
        matches!(self, Self::Upsert { .. } | Self::Remove { .. })
    }
}

/// Result of a [`PlanOp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanState {
    Upserted(Plan),
    Removed(Plan),
    Found(Plan),
    Listed(Vec<Plan>),
}

/// Admin operations on token assignments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserOp {
    Assign { token: String, plan: String },
    Remove { token: String },
    Rename { from: String, to: String },
    List,
}

impl UserOp {
    fn is_mutation(&self) -> bool {
        !matches!(self, Self::List)
    }
}

/// A user together with its usage in the current period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserView {
    pub token: String,
    pub plan: String,
    pub used: u64,
}

/// Result of a [`UserOp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserState {
    Assigned(UserView),
    Removed(UserView),
    Renamed { from: String, user: UserView },
    Listed(Vec<UserView>),
}

/// Current-period usage of a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageReport {
    pub plan: String,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub period: String,
}

/// A completed chat exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatOutcome {
    pub reply: String,
    pub usage: UsageReport,
}

/// Whether the last snapshot save succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Durability {
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// The registry service object.
pub struct Gateway {
    registry: RwLock<Registry>,
    usage: UsageCounter,
    store: Arc<dyn SnapshotStore>,
    admin_secret: Option<String>,
    admin_lock: Mutex<()>,
    durability: std::sync::RwLock<Durability>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("store", &self.store.describe())
            .field("admin_enabled", &self.admin_secret.is_some())
            .finish()
    }
}

impl Gateway {
    /// Wrap an already-built registry.
    pub fn new(registry: Registry, store: Arc<dyn SnapshotStore>, admin_secret: Option<String>) -> Self {
        let admin_secret = admin_secret.filter(|s| !s.is_empty());
        if admin_secret.is_none() {
            warn!("admin secret is not configured: admin routes are disabled");
        }
        Self {
            registry: RwLock::new(registry),
            usage: UsageCounter::new(),
            store,
            admin_secret,
            admin_lock: Mutex::new(()),
            durability: std::sync::RwLock::new(Durability::default()),
        }
    }

    /// Load the registry from `store`, installing and saving `defaults` when
    /// the store is empty.
    ///
    /// A snapshot that cannot be read is an error: starting from defaults
    /// would overwrite the operator's data on the next admin write.
    pub async fn load_or_default(
        store: Arc<dyn SnapshotStore>,
        defaults: Snapshot,
        admin_secret: Option<String>,
    ) -> Result<Self> {
        let (snapshot, bootstrapped) = match store.load().await? {
            Some(snapshot) => (snapshot, false),
            None => (defaults, true),
        };

        let (registry, rejected) = Registry::from_snapshot(snapshot);
        if !rejected.is_empty() {
            warn!(
                rejected = rejected.len(),
                "registry: some snapshot entries were rejected and will not resolve"
            );
        }
        info!(
            store = %store.describe(),
            plans = registry.plans().len(),
            users = registry.users().len(),
            bootstrapped,
            "registry loaded"
        );

        let gateway = Self::new(registry, store, admin_secret);
        if bootstrapped {
            let snapshot = gateway.snapshot().await;
            gateway.persist(&snapshot).await;
        }
        Ok(gateway)
    }

    // ------------------------------------------------------------------
    // Chat path
    // ------------------------------------------------------------------

    /// Resolve a raw client token.
    pub async fn resolve_caller(&self, token: Option<&str>) -> Result<Caller> {
        let registry = self.registry.read().await;
        auth::resolve_caller(&registry, token)
    }

    /// Read-only quota decision for `caller` in the current period.
    pub fn check_and_reserve(&self, caller: &Caller) -> Admission {
        let period = UsagePeriod::current();
        self.usage.sweep_stale(&period);

        let used = self.usage.peek(&period, &caller.token);
        let admission = quota::admit(&caller.plan, used);
        if admission.is_allowed() && admission.utilisation() >= WARNING_THRESHOLD {
            info!(
                token = %auth::redact(&caller.token),
                plan = %caller.plan_name,
                used,
                limit = caller.plan.monthly_messages,
                "quota: approaching monthly limit"
            );
        }
        admission
    }

    /// Count one successful forward for `token`; returns the new count.
    pub fn record_success(&self, token: &str) -> u64 {
        self.usage.increment(&UsagePeriod::current(), token)
    }

    /// Increment the counter of `token` unless it was removed or renamed
    /// while its request was in flight.
    ///
    /// The read lock orders the increment against admin mutations, which
    /// take or migrate counters under the write lock. Returns the new count,
    /// or `None` when nothing was recorded.
    async fn record_if_assigned(&self, period: &UsagePeriod, token: &str) -> Option<u64> {
        let registry = self.registry.read().await;
        if registry.plan_of(token).is_none() {
            info!(
                token = %auth::redact(token),
                "usage: token revoked during upstream call, message not recorded"
            );
            return None;
        }
        let used = self.usage.increment(period, token);
        debug!(token = %auth::redact(token), used, "usage recorded");
        Some(used)
    }

    /// Current-period usage for `caller`.
    pub fn usage_of(&self, caller: &Caller) -> UsageReport {
        let period = UsagePeriod::current();
        let used = self.usage.peek(&period, &caller.token);
        report(caller, used, &period)
    }

    /// Authenticate, check quota, forward to the upstream and count the
    /// message on success.
    ///
    /// Denied, invalid and failed requests are never counted.
    pub async fn chat(
        &self,
        token: Option<&str>,
        prompt: &str,
        upstream: &dyn CompletionClient,
    ) -> Result<ChatOutcome> {
        let caller = self.resolve_caller(token).await?;

        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(GatewayError::Validation("message is empty".to_string()));
        }

        let admitted = match self.check_and_reserve(&caller) {
            Admission::Allow { used, .. } => used,
            Admission::Deny { used, limit } => {
                info!(
                    token = %auth::redact(&caller.token),
                    plan = %caller.plan_name,
                    used,
                    limit,
                    "quota: request denied"
                );
                return Err(GatewayError::QuotaExceeded { used, limit });
            }
        };

        let reply = upstream.complete(prompt).await.inspect_err(|e| {
            warn!(
                upstream = upstream.name(),
                token = %auth::redact(&caller.token),
                "upstream failed, usage not recorded: {e}"
            );
        })?;

        let period = UsagePeriod::current();
        let used = self
            .record_if_assigned(&period, &caller.token)
            .await
            .unwrap_or(admitted);

        Ok(ChatOutcome {
            reply,
            usage: report(&caller, used, &period),
        })
    }

    // ------------------------------------------------------------------
    // Admin
    // ------------------------------------------------------------------

    /// Check an admin secret without performing any operation.
    pub fn authorize_admin(&self, secret: Option<&str>) -> Result<()> {
        auth::verify_admin_secret(self.admin_secret.as_deref(), secret)
    }

    pub fn admin_enabled(&self) -> bool {
        self.admin_secret.is_some()
    }

    /// Run a plan catalog operation.
    pub async fn admin_mutate_plan(&self, secret: Option<&str>, op: PlanOp) -> Result<PlanState> {
        self.authorize_admin(secret)?;

        if !op.is_mutation() {
            let registry = self.registry.read().await;
            return match op {
                PlanOp::Get { name } => registry.plan(&name).map(PlanState::Found),
                _ => Ok(PlanState::Listed(registry.plans())),
            };
        }

        self.mutate(|registry, _| match op {
            PlanOp::Upsert {
                name,
                monthly_messages,
                price,
            } => {
                let plan = registry.upsert_plan(&name, monthly_messages, &price)?;
                info!(plan = %plan.name, limit = plan.monthly_messages, "admin: plan upserted");
                Ok(PlanState::Upserted(plan))
            }
            PlanOp::Remove { name } => {
                let plan = registry.remove_plan(&name)?;
                info!(plan = %plan.name, "admin: plan removed");
                Ok(PlanState::Removed(plan))
            }
            PlanOp::Get { .. } | PlanOp::List => Err(GatewayError::Internal(
                "read-only plan op routed to mutate".to_string(),
            )),
        })
        .await
    }

    /// Run a token assignment operation.
    ///
    /// Removing a token discards its current-period counter; renaming moves
    /// the counter to the new token.
    pub async fn admin_mutate_user(&self, secret: Option<&str>, op: UserOp) -> Result<UserState> {
        self.authorize_admin(secret)?;

        if !op.is_mutation() {
            let registry = self.registry.read().await;
            let period = UsagePeriod::current();
            let users = registry
                .users()
                .into_iter()
                .map(|u| self.view(u, &period))
                .collect();
            return Ok(UserState::Listed(users));
        }

        self.mutate(|registry, usage| {
            let period = UsagePeriod::current();
            match op {
                UserOp::Assign { token, plan } => {
                    let user = registry.assign(&token, &plan)?;
                    info!(token = %auth::redact(&token), plan = %plan, "admin: user assigned");
                    Ok(UserState::Assigned(self.view(user, &period)))
                }
                UserOp::Remove { token } => {
                    let user = registry.remove_user(&token)?;
                    let used = usage.take(&period, &token);
                    info!(token = %auth::redact(&token), "admin: user removed");
                    Ok(UserState::Removed(UserView {
                        token: user.token,
                        plan: user.plan,
                        used,
                    }))
                }
                UserOp::Rename { from, to } => {
                    let user = registry.rename_user(&from, &to)?;
                    let used = usage.migrate(&period, &from, &to);
                    info!(
                        from = %auth::redact(&from),
                        to = %auth::redact(&to),
                        used,
                        "admin: user renamed"
                    );
                    Ok(UserState::Renamed {
                        from,
                        user: UserView {
                            token: user.token,
                            plan: user.plan,
                            used,
                        },
                    })
                }
                UserOp::List => Err(GatewayError::Internal(
                    "read-only user op routed to mutate".to_string(),
                )),
            }
        })
        .await
    }

    /// Secret-gated export of the registry.
    pub async fn admin_snapshot(&self, secret: Option<&str>) -> Result<Snapshot> {
        self.authorize_admin(secret)?;
        Ok(self.snapshot().await)
    }

    /// Current registry image.
    pub async fn snapshot(&self) -> Snapshot {
        self.registry.read().await.to_snapshot()
    }

    pub fn durability(&self) -> Durability {
        match self.durability.read() {
            Ok(d) => d.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Apply `f` to a copy of the registry under the admin lock and the
    /// registry write lock, install the copy, then save it once. A failing
    /// `f` leaves the registry untouched and saves nothing.
    async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Registry, &UsageCounter) -> Result<T>,
    {
        let _serial = self.admin_lock.lock().await;

        let (out, snapshot) = {
            let mut registry = self.registry.write().await;
            let mut candidate = registry.clone();
            let out = f(&mut candidate, &self.usage)?;
            let dangling = candidate.dangling_users();
            if !dangling.is_empty() {
                error!(count = dangling.len(), "registry integrity fault after mutation");
                return Err(GatewayError::Internal(
                    "mutation left users without a plan".to_string(),
                ));
            }
            let snapshot = candidate.to_snapshot();
            *registry = candidate;
            (out, snapshot)
        };

        self.persist(&snapshot).await;
        Ok(out)
    }

    /// Save `snapshot`, recording (not propagating) failures.
    async fn persist(&self, snapshot: &Snapshot) {
        let result = self.store.save(snapshot).await;
        let mut durability = match self.durability.write() {
            Ok(d) => d,
            Err(poisoned) => poisoned.into_inner(),
        };
        match result {
            Ok(()) => {
                if durability.degraded {
                    info!(store = %self.store.describe(), "snapshot save recovered");
                }
                *durability = Durability::default();
            }
            Err(e) => {
                error!(
                    store = %self.store.describe(),
                    "snapshot save failed; in-memory registry remains authoritative but changes \
                     will not survive a restart: {e}"
                );
                *durability = Durability {
                    degraded: true,
                    last_error: Some(e.to_string()),
                };
            }
        }
    }

    fn view(&self, user: User, period: &UsagePeriod) -> UserView {
        let used = self.usage.peek(period, &user.token);
        UserView {
            token: user.token,
            plan: user.plan,
            used,
        }
    }
}

fn report(caller: &Caller, used: u64, period: &UsagePeriod) -> UsageReport {
    let limit = caller.plan.monthly_messages;
    UsageReport {
        plan: caller.plan_name.clone(),
        used,
        limit,
        remaining: limit.saturating_sub(used),
        period: period.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::snapshot::MockSnapshotStore;
    use crate::registry::{MemorySnapshotStore, PlanTerms};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::task::JoinHandle;

    const SECRET: &str = "s3cret";

    fn seed() -> Snapshot {
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
        s.users.insert("A".into(), "free".into());
        s.users.insert("X".into(), "pro".into());
        s
    }

    async fn gateway() -> (Gateway, Arc<MemorySnapshotStore>) {
        let store = Arc::new(MemorySnapshotStore::with_snapshot(seed()));
        let gw = Gateway::load_or_default(store.clone(), Snapshot::default(), Some(SECRET.into()))
            .await
            .unwrap();
        (gw, store)
    }

    /// Upstream fake that echoes the prompt and counts calls.
    #[derive(Default)]
    struct EchoUpstream {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionClient for EchoUpstream {
        fn name(&self) -> &str {
            "echo"
        }

        async fn complete(&self, prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("echo: {prompt}"))
        }
    }

    struct FailingUpstream;

    #[async_trait]
    impl CompletionClient for FailingUpstream {
        fn name(&self) -> &str {
            "failing"
        }

        async fn complete(&self, _prompt: &str) -> Result<String> {
            Err(GatewayError::Upstream("HTTP 500: boom".into()))
        }
    }

    /// Upstream that parks in `complete` until released.
    #[derive(Default)]
    struct GatedUpstream {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl CompletionClient for GatedUpstream {
        fn name(&self) -> &str {
            "gated"
        }

        async fn complete(&self, _prompt: &str) -> Result<String> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok("ok".to_string())
        }
    }

    /// Spawn a chat for `token` and wait until it is parked upstream.
    async fn start_gated_chat(
        gw: &Arc<Gateway>,
        token: &str,
    ) -> (Arc<GatedUpstream>, JoinHandle<Result<ChatOutcome>>) {
        let upstream = Arc::new(GatedUpstream::default());
        let task = {
            let gw = Arc::clone(gw);
            let upstream = Arc::clone(&upstream);
            let token = token.to_string();
            tokio::spawn(async move { gw.chat(Some(&token), "oi", upstream.as_ref()).await })
        };
        upstream.entered.notified().await;
        (upstream, task)
    }

    fn period() -> UsagePeriod {
        UsagePeriod::current()
    }

    // --- construction ---

    #[tokio::test]
    async fn test_bootstrap_installs_and_saves_defaults() {
        let store = Arc::new(MemorySnapshotStore::new());
        let gw = Gateway::load_or_default(store.clone(), seed(), None)
            .await
            .unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.stored().await, Some(seed()));
        assert_eq!(gw.snapshot().await, seed());
    }

    #[tokio::test]
    async fn test_existing_snapshot_is_not_rewritten_on_load() {
        let (_gw, store) = gateway().await;
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_load_failure_is_an_error() {
        let mut store = MockSnapshotStore::new();
        store
            .expect_load()
            .returning(|| Err(GatewayError::Persistence("unreadable".into())));
        store.expect_save().never();
        store.expect_describe().return_const("mock".to_string());

        let result = Gateway::load_or_default(Arc::new(store), seed(), None).await;
        assert!(matches!(result, Err(GatewayError::Persistence(_))));
    }

    // --- chat path ---

    #[tokio::test]
    async fn test_free_plan_scenario() {
        let (gw, _) = gateway().await;
        let upstream = EchoUpstream::default();

        for expected in 1..=3 {
            let out = gw.chat(Some("A"), "oi", &upstream).await.unwrap();
            assert_eq!(out.usage.used, expected);
            assert_eq!(out.usage.limit, 3);
        }

        match gw.chat(Some("A"), "oi", &upstream).await {
            Err(GatewayError::QuotaExceeded { used, limit }) => assert_eq!((used, limit), (3, 3)),
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 3, "denied request never forwarded");
        assert_eq!(gw.usage.peek(&period(), "A"), 3, "denial is not counted");

        // Raising the limit lets the next request through, counting from 3.
        gw.admin_mutate_plan(
            Some(SECRET),
            PlanOp::Upsert {
                name: "free".into(),
                monthly_messages: 10,
                price: "R$ 0".into(),
            },
        )
        .await
        .unwrap();
        let out = gw.chat(Some("A"), "oi", &upstream).await.unwrap();
        assert_eq!(out.usage.used, 4);
    }

    #[tokio::test]
    async fn test_limit_reached_after_l_successes() {
        let (gw, _) = gateway().await;
        let caller = gw.resolve_caller(Some("A")).await.unwrap();
        for _ in 0..caller.plan.monthly_messages {
            assert!(gw.check_and_reserve(&caller).is_allowed());
            gw.record_success(&caller.token);
        }
        assert_eq!(gw.usage.peek(&period(), "A"), 3);
        assert_eq!(
            gw.check_and_reserve(&caller),
            Admission::Deny { used: 3, limit: 3 }
        );
    }

    #[tokio::test]
    async fn test_upstream_failure_is_not_counted() {
        let (gw, _) = gateway().await;
        let result = gw.chat(Some("A"), "oi", &FailingUpstream).await;
        assert!(matches!(result, Err(GatewayError::Upstream(_))));
        assert_eq!(gw.usage.peek(&period(), "A"), 0);
    }

    #[tokio::test]
    async fn test_blank_prompt_is_validation_error_and_not_counted() {
        let (gw, _) = gateway().await;
        let upstream = EchoUpstream::default();
        let result = gw.chat(Some("A"), "   ", &upstream).await;
        assert!(matches!(result, Err(GatewayError::Validation(_))));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
        assert_eq!(gw.usage.peek(&period(), "A"), 0);
    }

    #[tokio::test]
    async fn test_chat_auth_failures() {
        let (gw, _) = gateway().await;
        let upstream = EchoUpstream::default();
        assert!(matches!(
            gw.chat(None, "oi", &upstream).await,
            Err(GatewayError::Unauthenticated(_))
        ));
        assert!(matches!(
            gw.chat(Some("nobody"), "oi", &upstream).await,
            Err(GatewayError::Unauthorized(_))
        ));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_record_success_is_exact() {
        let (gw, _) = gateway().await;
        let gw = Arc::new(gw);
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..200 {
            let gw = Arc::clone(&gw);
            tasks.spawn(async move { gw.record_success("X") });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }
        assert_eq!(gw.usage.peek(&period(), "X"), 200);
    }

    #[tokio::test]
    async fn test_admin_mutation_completes_while_chat_is_upstream() {
        let (gw, _) = gateway().await;
        let gw = Arc::new(gw);
        let (upstream, chat) = start_gated_chat(&gw, "A").await;

        let upsert = gw.admin_mutate_plan(
            Some(SECRET),
            PlanOp::Upsert {
                name: "free".into(),
                monthly_messages: 10,
                price: "R$ 0".into(),
            },
        );
        tokio::time::timeout(Duration::from_secs(5), upsert)
            .await
            .expect("admin mutation blocked by an in-flight chat")
            .unwrap();
        assert_eq!(gw.record_success("X"), 1);
        assert!(gw.resolve_caller(Some("A")).await.is_ok());

        upstream.release.notify_one();
        let out = chat.await.unwrap().unwrap();
        assert_eq!(out.usage.used, 1);
        assert_eq!(gw.usage.peek(&period(), "A"), 1);
    }

    #[tokio::test]
    async fn test_remove_during_chat_leaves_no_counter_behind() {
        let (gw, _) = gateway().await;
        let gw = Arc::new(gw);
        gw.record_success("A");
        let (upstream, chat) = start_gated_chat(&gw, "A").await;

        gw.admin_mutate_user(Some(SECRET), UserOp::Remove { token: "A".into() })
            .await
            .unwrap();
        upstream.release.notify_one();
        let out = chat.await.unwrap().unwrap();
        assert_eq!(out.reply, "ok");
        assert_eq!(gw.usage.peek(&period(), "A"), 0);

        gw.admin_mutate_user(
            Some(SECRET),
            UserOp::Assign {
                token: "A".into(),
                plan: "free".into(),
            },
        )
        .await
        .unwrap();
        let caller = gw.resolve_caller(Some("A")).await.unwrap();
        assert_eq!(gw.usage_of(&caller).used, 0);
    }

    #[tokio::test]
    async fn test_rename_during_chat_keeps_new_token_count() {
        let (gw, _) = gateway().await;
        let gw = Arc::new(gw);
        gw.record_success("A");
        let (upstream, chat) = start_gated_chat(&gw, "A").await;

        gw.admin_mutate_user(
            Some(SECRET),
            UserOp::Rename {
                from: "A".into(),
                to: "B".into(),
            },
        )
        .await
        .unwrap();
        upstream.release.notify_one();
        chat.await.unwrap().unwrap();

        assert_eq!(gw.usage.peek(&period(), "A"), 0, "no counter for the old token");
        assert_eq!(gw.usage.peek(&period(), "B"), 1);
        assert_eq!(gw.usage.len(), 1);
    }

    #[tokio::test]
    async fn test_usage_of_reports_remaining() {
        let (gw, _) = gateway().await;
        let caller = gw.resolve_caller(Some("A")).await.unwrap();
        gw.record_success("A");
        let report = gw.usage_of(&caller);
        assert_eq!(report.used, 1);
        assert_eq!(report.remaining, 2);
        assert_eq!(report.plan, "free");
        assert_eq!(report.period, period().to_string());
    }

    // --- admin: auth ---

    #[tokio::test]
    async fn test_admin_requires_secret() {
        let (gw, store) = gateway().await;
        for secret in [None, Some(""), Some("wrong")] {
            let result = gw
                .admin_mutate_user(
                    secret,
                    UserOp::Assign {
                        token: "B".into(),
                        plan: "free".into(),
                    },
                )
                .await;
            assert!(matches!(result, Err(GatewayError::Forbidden(_))));
        }
        assert_eq!(store.save_count(), 0);
        assert!(gw.resolve_caller(Some("B")).await.is_err());
    }

    #[tokio::test]
    async fn test_admin_disabled_without_configured_secret() {
        let store = Arc::new(MemorySnapshotStore::with_snapshot(seed()));
        let gw = Gateway::load_or_default(store, Snapshot::default(), Some(String::new()))
            .await
            .unwrap();
        assert!(!gw.admin_enabled());
        assert!(gw.admin_snapshot(Some("")).await.is_err());
        assert!(gw.admin_mutate_plan(Some("anything"), PlanOp::List).await.is_err());
    }

    // --- admin: plans ---

    #[tokio::test]
    async fn test_each_successful_mutation_saves_once() {
        let (gw, store) = gateway().await;
        gw.admin_mutate_plan(
            Some(SECRET),
            PlanOp::Upsert {
                name: "basic".into(),
                monthly_messages: 50,
                price: "R$ 9,90".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(store.save_count(), 1);

        gw.admin_mutate_user(
            Some(SECRET),
            UserOp::Assign {
                token: "B".into(),
                plan: "basic".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(store.save_count(), 2);
        assert_eq!(store.stored().await.unwrap().users["B"], "basic");

        // Reads never save.
        gw.admin_mutate_plan(Some(SECRET), PlanOp::List).await.unwrap();
        gw.admin_mutate_user(Some(SECRET), UserOp::List).await.unwrap();
        gw.admin_snapshot(Some(SECRET)).await.unwrap();
        assert_eq!(store.save_count(), 2);
    }

    #[tokio::test]
    async fn test_remove_referenced_plan_conflicts_without_mutation_or_save() {
        let mut store = MockSnapshotStore::new();
        store.expect_load().returning(|| Ok(Some(seed())));
        store.expect_save().never();
        store.expect_describe().return_const("mock".to_string());
        let gw = Gateway::load_or_default(Arc::new(store), Snapshot::default(), Some(SECRET.into()))
            .await
            .unwrap();

        let before = gw.snapshot().await;
        match gw
            .admin_mutate_plan(Some(SECRET), PlanOp::Remove { name: "pro".into() })
            .await
        {
            Err(GatewayError::Conflict { tokens, .. }) => assert_eq!(tokens, vec!["X"]),
            other => panic!("expected Conflict, got {other:?}"),
        }
        assert_eq!(gw.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_successful_mutation_saves_exactly_once_with_new_state() {
        let mut store = MockSnapshotStore::new();
        store.expect_load().returning(|| Ok(Some(seed())));
        store
            .expect_save()
            .withf(|s: &Snapshot| s.plans["free"].monthly_messages == 7)
            .times(1)
            .returning(|_| Ok(()));
        store.expect_describe().return_const("mock".to_string());
        let gw = Gateway::load_or_default(Arc::new(store), Snapshot::default(), Some(SECRET.into()))
            .await
            .unwrap();

        let state = gw
            .admin_mutate_plan(
                Some(SECRET),
                PlanOp::Upsert {
                    name: "free".into(),
                    monthly_messages: 7,
                    price: "R$ 0".into(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(state, PlanState::Upserted(p) if p.monthly_messages == 7));
    }

    #[tokio::test]
    async fn test_invalid_upsert_is_validation_error_without_save() {
        let (gw, store) = gateway().await;
        let result = gw
            .admin_mutate_plan(
                Some(SECRET),
                PlanOp::Upsert {
                    name: "free".into(),
                    monthly_messages: 0,
                    price: "R$ 0".into(),
                },
            )
            .await;
        assert!(matches!(result, Err(GatewayError::Validation(_))));
        assert_eq!(store.save_count(), 0);
        let plan = gw.admin_mutate_plan(Some(SECRET), PlanOp::Get { name: "free".into() }).await;
        assert!(matches!(plan, Ok(PlanState::Found(p)) if p.monthly_messages == 3));
    }

    #[tokio::test]
    async fn test_save_failure_keeps_mutation_and_flags_durability() {
        let (gw, store) = gateway().await;
        store.set_failing(true);

        gw.admin_mutate_user(
            Some(SECRET),
            UserOp::Assign {
                token: "B".into(),
                plan: "pro".into(),
            },
        )
        .await
        .expect("persistence failure must not fail the mutation");

        assert!(gw.resolve_caller(Some("B")).await.is_ok());
        let durability = gw.durability();
        assert!(durability.degraded);
        assert!(durability.last_error.is_some());

        store.set_failing(false);
        gw.admin_mutate_user(Some(SECRET), UserOp::Remove { token: "B".into() })
            .await
            .unwrap();
        assert!(!gw.durability().degraded);
    }

    // --- admin: users ---

    #[tokio::test]
    async fn test_rename_preserves_count_and_revokes_old_token() {
        let (gw, _) = gateway().await;
        gw.record_success("A");
        gw.record_success("A");

        let state = gw
            .admin_mutate_user(
                Some(SECRET),
                UserOp::Rename {
                    from: "A".into(),
                    to: "A2".into(),
                },
            )
            .await
            .unwrap();
        match state {
            UserState::Renamed { from, user } => {
                assert_eq!(from, "A");
                assert_eq!(user.token, "A2");
                assert_eq!(user.used, 2);
            }
            other => panic!("expected Renamed, got {other:?}"),
        }

        assert!(matches!(
            gw.resolve_caller(Some("A")).await,
            Err(GatewayError::Unauthorized(_))
        ));
        let caller = gw.resolve_caller(Some("A2")).await.unwrap();
        assert_eq!(gw.usage_of(&caller).used, 2);
        assert_eq!(gw.usage.peek(&period(), "A"), 0);
    }

    #[tokio::test]
    async fn test_rename_onto_assigned_token_conflicts() {
        let (gw, store) = gateway().await;
        let result = gw
            .admin_mutate_user(
                Some(SECRET),
                UserOp::Rename {
                    from: "A".into(),
                    to: "X".into(),
                },
            )
            .await;
        assert!(matches!(result, Err(GatewayError::Conflict { .. })));
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_user_purges_current_counter() {
        let (gw, _) = gateway().await;
        gw.record_success("A");

        let state = gw
            .admin_mutate_user(Some(SECRET), UserOp::Remove { token: "A".into() })
            .await
            .unwrap();
        assert!(matches!(state, UserState::Removed(ref u) if u.used == 1));
        assert_eq!(gw.usage.peek(&period(), "A"), 0);

        // Re-adding the token starts fresh.
        gw.admin_mutate_user(
            Some(SECRET),
            UserOp::Assign {
                token: "A".into(),
                plan: "free".into(),
            },
        )
        .await
        .unwrap();
        let caller = gw.resolve_caller(Some("A")).await.unwrap();
        assert_eq!(gw.usage_of(&caller).used, 0);
    }

    #[tokio::test]
    async fn test_assign_unknown_plan_is_not_found() {
        let (gw, store) = gateway().await;
        let result = gw
            .admin_mutate_user(
                Some(SECRET),
                UserOp::Assign {
                    token: "B".into(),
                    plan: "gold".into(),
                },
            )
            .await;
        assert!(matches!(result, Err(GatewayError::NotFound(_))));
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_list_users_includes_usage() {
        let (gw, _) = gateway().await;
        gw.record_success("X");
        match gw.admin_mutate_user(Some(SECRET), UserOp::List).await.unwrap() {
            UserState::Listed(users) => {
                assert_eq!(users.len(), 2);
                assert_eq!(users[0].token, "A");
                assert_eq!(users[1].used, 1);
            }
            other => panic!("expected Listed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_admin_writes_produce_consistent_snapshot() {
        let (gw, store) = gateway().await;
        let gw = Arc::new(gw);
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..20 {
            let gw = Arc::clone(&gw);
            tasks.spawn(async move {
                gw.admin_mutate_user(
                    Some(SECRET),
                    UserOp::Assign {
                        token: format!("user-{i}"),
                        plan: "free".into(),
                    },
                )
                .await
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap().unwrap();
        }
        assert_eq!(store.save_count(), 20);
        // The last save reflects every mutation.
        assert_eq!(store.stored().await.unwrap(), gw.snapshot().await);
        assert_eq!(gw.snapshot().await.users.len(), 22);
    }
}
