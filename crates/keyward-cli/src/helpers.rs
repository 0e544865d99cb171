//! Shared helper functions used across CLI subcommands.
//!
//! Includes tracing initialization, configuration loading, and construction
//! of the database, endpoint registry and device-flow engine.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use keyward_auth::{
    AuthConfig, DeviceFlowEngine, EndpointRegistry, OwnerKey, ProviderClient, SystemClock,
};
use keyward_store::{CredentialStore, Database, SqliteSessionRepository};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Configuration and wiring
// ---------------------------------------------------------------------------

/// Load `.env`, then the TOML file at `path` with environment overrides.
pub fn load_config(path: &Path) -> Result<AuthConfig> {
    if let Ok(env_path) = dotenvy::dotenv() {
        tracing::debug!(path = %env_path.display(), "loaded .env");
    }
    let config = AuthConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    info!(
        path = %path.display(),
        endpoints = config.endpoints.len(),
        "configuration loaded"
    );
    Ok(config)
}

/// Open (creating if needed) and migrate the configured database.
pub async fn open_database(config: &AuthConfig) -> Result<Database> {
    let path = config.database_path.clone();
    let display_path = path.display().to_string();
    let db = Database::open_and_migrate(path)
        .await
        .with_context(|| format!("failed to open database at {display_path}"))?;
    info!(path = %display_path, "store initialized");
    Ok(db)
}

pub fn build_registry(config: &AuthConfig, db: Database) -> Arc<EndpointRegistry> {
    Arc::new(EndpointRegistry::new(
        config,
        Arc::new(SqliteSessionRepository::new(db)),
        ProviderClient::new(),
        Arc::new(SystemClock),
    ))
}

pub fn device_engine(config: &AuthConfig, db: Database) -> DeviceFlowEngine {
    DeviceFlowEngine::new(
        config.github.clone().unwrap_or_default(),
        ProviderClient::new(),
        CredentialStore::new(db),
        Arc::new(SystemClock),
    )
}

/// Credential owner for `--user`, or the shared owner when absent.
pub fn owner_key(user: Option<String>) -> String {
    match user {
        Some(id) => OwnerKey::User(id).to_string(),
        None => OwnerKey::Shared.to_string(),
    }
}

/// Resolves on Ctrl-C. A failure to install the handler never resolves.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

/// Format unix seconds for terminal output.
pub fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| secs.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_key_defaults_to_shared() {
        assert_eq!(owner_key(None), "shared");
        assert_eq!(owner_key(Some("u1".into())), "user:u1");
    }

    #[test]
    fn timestamps_render_in_utc() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 UTC");
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let config = load_config(Path::new("does/not/exist.toml")).unwrap();
        assert!(config.endpoints.is_empty());
    }
}
