//! Command-line interface: argument parsing and command dispatch.

pub mod registry;
pub mod secret;
pub mod serve;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use tollgate::config::Config;
use tollgate::registry::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};

/// Tollgate: metered chat gateway with plan quotas.
#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about)]
pub struct Cli {
    /// Config file (defaults to ~/.tollgate/config.json).
    #[arg(long, env = "TOLLGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, env = "TOLLGATE_LOG_FORMAT", default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP gateway.
    Serve {
        /// Listen port (overrides PORT and the config file).
        #[arg(long)]
        port: Option<u16>,
        /// Listen address (overrides TOLLGATE_BIND and the config file).
        #[arg(long)]
        bind: Option<String>,
    },
    /// Inspect the stored registry snapshot.
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },
    /// Print a freshly generated admin secret.
    Secret,
}

#[derive(Subcommand, Debug)]
pub enum RegistryAction {
    /// Print plans and users from the snapshot.
    Show {
        /// Print tokens in full instead of a redacted prefix.
        #[arg(long)]
        reveal: bool,
    },
    /// Validate the snapshot and report entries that would be rejected.
    Check,
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` level.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Run the parsed command.
pub async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Serve { port, bind } => serve::cmd_serve(config, port, bind).await,
        Command::Registry { action } => registry::cmd_registry(&config, action).await,
        Command::Secret => {
            secret::cmd_secret();
            Ok(())
        }
    }
}

/// Snapshot store selected by the storage config.
pub(crate) fn open_store(config: &Config) -> Arc<dyn SnapshotStore> {
    match config.storage.resolved_path() {
        Some(path) => Arc::new(FileSnapshotStore::new(path)),
        None => Arc::new(MemorySnapshotStore::new()),
    }
}
