//! # conduit-gateway
//!
//! Gateway server binary: loads settings, opens the audit store, wires the
//! server and runs until ctrl-c.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use conduit_server::{AppState, GatewayConfig, GatewayServer};
use conduit_settings::ConduitSettings;
use conduit_store::{AuditStore, ConnectionConfig, MemoryStore};
use tracing::{info, warn};

/// How long shutdown waits for background tasks.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Conduit real-time event gateway.
#[derive(Parser, Debug)]
#[command(name = "conduit-gateway", about = "Conduit real-time event gateway")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the `SQLite` audit database.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Settings file (default `~/.conduit/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level filter, e.g. `info` or `conduit_server=debug`.
    #[arg(long)]
    log_level: Option<String>,

    /// Broker identity of this instance.
    #[arg(long)]
    instance_id: Option<String>,
}

impl Cli {
    /// Fold command-line overrides into loaded settings.
    fn apply(&self, settings: &mut ConduitSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.log_level.clone_from(level);
        }
        if let Some(id) = &self.instance_id {
            settings.instance_id = Some(id.clone());
        }
        if let Some(path) = &self.db_path {
            settings.store.db_path = Some(path.to_string_lossy().into_owned());
        }
    }
}

fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".conduit").join("audit.db")
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(conduit_settings::settings_path);
    let mut settings = conduit_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings);

    conduit_core::logging::init_subscriber(&settings.log_level, settings.log_json);

    let db_path = settings
        .store
        .db_path
        .as_ref()
        .map_or_else(default_db_path, PathBuf::from);
    ensure_parent_dir(&db_path)?;
    let audit = AuditStore::open(
        &db_path.to_string_lossy(),
        &ConnectionConfig {
            pool_size: settings.store.pool_size,
            ..ConnectionConfig::default()
        },
    )
    .context("Failed to open audit store")?;

    let metrics = conduit_server::metrics::install_recorder().context("Failed to install metrics recorder")?;

    let config = GatewayConfig::from_settings(&settings);
    if config.jwt_secret.is_empty() {
        warn!("no JWT secret configured, every handshake will be rejected");
    }
    let state = AppState::new(config, Arc::new(MemoryStore::new()), Some(audit)).with_metrics(metrics);
    let server = GatewayServer::new(state);
    server.spawn_background_tasks();
    let (addr, serve) = server.listen().await.context("Failed to bind listener")?;
    info!(%addr, db = %db_path.display(), "conduit gateway started");

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    info!("shutdown requested");
    server.shutdown(Some(SHUTDOWN_TIMEOUT)).await;
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, serve).await.is_err() {
        warn!("server did not stop within {SHUTDOWN_TIMEOUT:?}");
    }
    info!("conduit gateway stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_optional() {
        let cli = Cli::parse_from(["conduit-gateway"]);
        assert!(cli.host.is_none());
        assert!(cli.port.is_none());
        assert!(cli.settings.is_none());
    }

    #[test]
    fn flags_override_settings() {
        let cli = Cli::parse_from([
            "conduit-gateway",
            "--host",
            "0.0.0.0",
            "--port",
            "0",
            "--db-path",
            "/tmp/x.db",
            "--log-level",
            "debug",
            "--instance-id",
            "gw-7",
        ]);
        let mut settings = ConduitSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 0);
        assert_eq!(settings.store.db_path.as_deref(), Some("/tmp/x.db"));
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.instance_id.as_deref(), Some("gw-7"));
    }

    #[test]
    fn unset_flags_keep_settings() {
        let cli = Cli::parse_from(["conduit-gateway", "--port", "9000"]);
        let mut settings = ConduitSettings::default();
        let host = settings.server.host.clone();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, host);
        assert_eq!(settings.server.port, 9000);
    }

    #[test]
    fn default_db_path_is_under_conduit_dir() {
        let path = default_db_path();
        assert!(path.ends_with(".conduit/audit.db"));
    }

    #[test]
    fn ensure_parent_dir_creates_missing_dirs() {
        let dir = std::env::temp_dir().join(format!("conduit-gw-test-{}", std::process::id()));
        let file = dir.join("nested").join("audit.db");
        ensure_parent_dir(&file).unwrap();
        assert!(file.parent().unwrap().is_dir());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
