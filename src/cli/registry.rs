//! `tollgate registry` subcommands: offline inspection of the snapshot.

use anyhow::{bail, Context, Result};

use tollgate::auth::redact;
use tollgate::config::Config;
use tollgate::registry::{Registry, Snapshot};

use super::{open_store, RegistryAction};

pub async fn cmd_registry(config: &Config, action: RegistryAction) -> Result<()> {
    let store = open_store(config);
    let location = store.describe();
    let stored = store
        .load()
        .await
        .with_context(|| format!("failed to read snapshot from {location}"))?;

    let Some(snapshot) = stored else {
        println!("No snapshot at {location}. The configured defaults are installed on first serve.");
        return Ok(());
    };

    match action {
        RegistryAction::Show { reveal } => {
            print!("{}", render_table(&snapshot, reveal));
            Ok(())
        }
        RegistryAction::Check => check(snapshot, &location),
    }
}

fn check(snapshot: Snapshot, location: &str) -> Result<()> {
    let (registry, rejected) = Registry::from_snapshot(snapshot);
    if rejected.is_empty() {
        println!(
            "{location}: OK ({} plans, {} users)",
            registry.plans().len(),
            registry.users().len()
        );
        return Ok(());
    }

    println!("{location}: {} rejected entries", rejected.len());
    for entry in &rejected {
        println!("  - {entry}");
    }
    bail!("snapshot has {} invalid entries", rejected.len())
}

/// Plans and users as aligned text tables.
pub(crate) fn render_table(snapshot: &Snapshot, reveal: bool) -> String {
    let mut out = String::new();

    out.push_str(&format!("{:<16} {:>10} {:<16}\n", "Plan", "Msgs/mo", "Price"));
    out.push_str(&format!("{}\n", "-".repeat(44)));
    for (name, terms) in &snapshot.plans {
        out.push_str(&format!(
            "{:<16} {:>10} {:<16}\n",
            name, terms.monthly_messages, terms.price
        ));
    }

    out.push('\n');
    out.push_str(&format!("{:<40} {:<16}\n", "Token", "Plan"));
    out.push_str(&format!("{}\n", "-".repeat(57)));
    if snapshot.users.is_empty() {
        out.push_str("(no users)\n");
    }
    for (token, plan) in &snapshot.users {
        let shown = if reveal { token.clone() } else { redact(token) };
        out.push_str(&format!("{:<40} {:<16}\n", shown, plan));
    }
    out
}
