//! Durable registry snapshots.
//!
//! A [`Snapshot`] is the full image of the plan and user registries. It is
//! read once at startup and rewritten in full after each admin mutation.
//! Usage counters are deliberately not part of it: a restart starts every
//! token at zero for the current month.
//!
//! [`FileSnapshotStore`] writes to a temporary file in the target directory,
//! fsyncs it, and renames it over the previous snapshot, so a crash mid-write
//! leaves the old file intact.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::PlanTerms;
use crate::error::{GatewayError, Result};

/// Serialized form of the registries.
///
/// ```json
/// { "plans": { "free": { "monthlyMessages": 30, "price": "R$ 0" } },
///   "users": { "token-a": "free" } }
/// ```
///
/// `BTreeMap` keeps keys sorted, so equal registries serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub plans: BTreeMap<String, PlanTerms>,
    #[serde(default)]
    pub users: BTreeMap<String, String>,
}

/// Persistence backend for registry snapshots.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Read the stored snapshot. `Ok(None)` means nothing has been stored yet.
    async fn load(&self) -> Result<Option<Snapshot>>;

    /// Replace the stored snapshot as a single durable operation.
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;

    /// Short human-readable description (path, "memory", ...).
    fn describe(&self) -> String;
}

// ============================================================================
// File store
// ============================================================================

/// JSON snapshot file on local disk.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(GatewayError::Persistence(format!(
                    "failed to read snapshot at {}: {e}",
                    self.path.display()
                )))
            }
        };

        if data.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&data).map(Some).map_err(|e| {
            GatewayError::Persistence(format!(
                "failed to parse snapshot at {}: {e}",
                self.path.display()
            ))
        })
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| GatewayError::Persistence(format!("failed to serialize snapshot: {e}")))?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomic(&path, &json))
            .await
            .map_err(|e| GatewayError::Persistence(format!("snapshot writer panicked: {e}")))??;

        debug!("saved registry snapshot to {}", self.path.display());
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Write `bytes` to a sibling temp file, fsync, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let persistence = |e: std::io::Error| {
        GatewayError::Persistence(format!(
            "failed to write snapshot at {}: {e}",
            path.display()
        ))
    };

    std::fs::create_dir_all(&dir).map_err(persistence)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(persistence)?;
    tmp.write_all(bytes).map_err(persistence)?;
    tmp.as_file().sync_all().map_err(persistence)?;

    // Registry tokens double as credentials.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))
            .map_err(persistence)?;
    }

    tmp.persist(path).map_err(|e| persistence(e.error))?;
    Ok(())
}

// ============================================================================
// Memory store
// ============================================================================

/// Snapshot store that keeps everything in memory.
///
/// Used by tests and by ephemeral deployments (`storage.snapshotPath = ":memory:"`).
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshot: Mutex<Option<Snapshot>>,
    saves: AtomicUsize,
    failing: AtomicBool,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `snapshot` already stored.
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            ..Self::default()
        }
    }

    /// Number of successful `save()` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make subsequent saves fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn stored(&self) -> Option<Snapshot> {
        self.snapshot.lock().await.clone()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.lock().await.clone())
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::Persistence(
                "memory store configured to fail".to_string(),
            ));
        }
        *self.snapshot.lock().await = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================
