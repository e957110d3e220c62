//! Gateway configuration.
//!
//! Resolution order (later wins):
//! 1. built-in defaults
//! 2. `~/.tollgate/config.json` (or the path given with `--config` /
//!    `TOLLGATE_CONFIG`)
//! 3. environment variables, including values loaded from `.env`
//!
//! | Variable | Field |
//! |---|---|
//! | `PORT` | `server.port` |
//! | `TOLLGATE_BIND` | `server.bind` |
//! | `TOLLGATE_CORS_ORIGINS` | `server.corsOrigins` (comma separated) |
//! | `TOLLGATE_ADMIN_SECRET` | `admin.secret` |
//! | `TOLLGATE_SNAPSHOT_PATH` | `storage.snapshotPath` |
//! | `OPENAI_API_KEY` | `upstream.apiKey` |
//! | `TOLLGATE_UPSTREAM_BASE` | `upstream.apiBase` |
//! | `TOLLGATE_MODEL` | `upstream.model` |

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::registry::{PlanTerms, Snapshot};

/// Snapshot path value selecting the in-memory store.
pub const MEMORY_SNAPSHOT: &str = ":memory:";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub server: ServerConfig,
    pub admin: AdminConfig,
    pub storage: StorageConfig,
    pub upstream: UpstreamConfig,
    /// Registry installed on first start, when no snapshot exists yet.
    pub defaults: Snapshot,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            admin: AdminConfig::default(),
            storage: StorageConfig::default(),
            upstream: UpstreamConfig::default(),
            defaults: default_registry(),
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Browser origins allowed by CORS. Requests without an `Origin` header
    /// are not affected.
    pub cors_origins: Vec<String>,
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            cors_origins: vec![
                "https://nomade-22.github.io".to_string(),
                "http://localhost:3000".to_string(),
            ],
            body_limit_bytes: 1024 * 1024,
        }
    }
}

/// Admin surface settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Pre-shared admin secret. Unset or empty disables admin routes.
    pub secret: Option<String>,
}

impl AdminConfig {
    /// The secret, with empty values normalised to `None`.
    pub fn effective_secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.trim().is_empty())
    }
}

/// Snapshot persistence settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageConfig {
    /// Snapshot file. `None` → `~/.tollgate/registry.json`; `":memory:"`
    /// keeps the registry in memory only.
    pub snapshot_path: Option<String>,
}

impl StorageConfig {
    /// `None` when the in-memory store is selected.
    pub fn resolved_path(&self) -> Option<PathBuf> {
        match self.snapshot_path.as_deref() {
            Some(MEMORY_SNAPSHOT) => None,
            Some(path) => Some(PathBuf::from(path)),
            None => Some(Config::dir().join("registry.json")),
        }
    }
}

/// Upstream completion service settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpstreamConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub system_prompt: String,
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            system_prompt: "Você é o IA Orçamentista. Responda com clareza, em R$ quando houver valores."
                .to_string(),
            timeout_secs: 60,
        }
    }
}

/// Default plan catalog: `free` and `pro`, no users.
pub fn default_registry() -> Snapshot {
    let mut snapshot = Snapshot::default();
    snapshot.plans.insert(
        "free".to_string(),
        PlanTerms {
            monthly_messages: 30,
            price: "R$ 0".to_string(),
        },
    );
    snapshot.plans.insert(
        "pro".to_string(),
        PlanTerms {
            monthly_messages: 1000,
            price: "R$ 29,90".to_string(),
        },
    );
    snapshot
}

impl Config {
    /// Base directory for Tollgate state: `~/.tollgate`.
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tollgate")
    }

    /// Default config file location.
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load config from `path` (or the default location) and apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::path);
        let mut config = Self::from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Read a config file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(GatewayError::Config(format!(
                    "failed to read config at {}: {e}",
                    path.display()
                )))
            }
        };
        serde_json::from_str(&data).map_err(|e| {
            GatewayError::Config(format!("failed to parse config at {}: {e}", path.display()))
        })
    }

    /// Apply overrides from an environment-like lookup.
    ///
    /// An unparsable `PORT` is a config error rather than a fallback to the
    /// default port.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(port) = get("PORT") {
            self.server.port = port.trim().parse().map_err(|_| {
                GatewayError::Config(format!("PORT must be a port number, got '{port}'"))
            })?;
        }
        if let Some(bind) = get("TOLLGATE_BIND") {
            self.server.bind = bind;
        }
        if let Some(origins) = get("TOLLGATE_CORS_ORIGINS") {
            self.server.cors_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(secret) = get("TOLLGATE_ADMIN_SECRET") {
            self.admin.secret = Some(secret);
        }
        if let Some(path) = get("TOLLGATE_SNAPSHOT_PATH") {
            self.storage.snapshot_path = Some(path);
        }
        if let Some(key) = get("OPENAI_API_KEY") {
            self.upstream.api_key = Some(key);
        }
        if let Some(base) = get("TOLLGATE_UPSTREAM_BASE") {
            self.upstream.api_base = base;
        }
        if let Some(model) = get("TOLLGATE_MODEL") {
            self.upstream.model = model;
        }
        Ok(())
    }
}
