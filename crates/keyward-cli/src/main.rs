//! CLI entry point for keyward.
//!
//! This binary provides the `keyward` command with subcommands for running
//! the callback server, linking GitHub accounts through the device flow,
//! and maintaining stored sessions.

mod cli;
mod helpers;

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use keyward_auth::{AuthConfig, PollOptions};
use keyward_web::{AppState, WebConfig, WebServer};
use tokio_util::sync::CancellationToken;
use tracing::info;

use cli::{Cli, Commands, EndpointAction, GithubAction, SessionAction};
use helpers::{
    build_registry, device_engine, format_timestamp, init_tracing, load_config, open_database,
    owner_key, shutdown_signal,
};

/// How often `serve` drops lapsed authorization attempts.
const PURGE_INTERVAL: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind, port } => {
            init_tracing("info");
            let config = load_config(&cli.config)?;
            cmd_serve(config, bind, port).await
        }
        Commands::Github { action } => {
            init_tracing("warn");
            let config = load_config(&cli.config)?;
            cmd_github(config, action).await
        }
        Commands::Sessions { action } => {
            init_tracing("warn");
            let config = load_config(&cli.config)?;
            cmd_sessions(config, action).await
        }
        Commands::Endpoints { action } => {
            init_tracing("warn");
            let config = load_config(&cli.config)?;
            cmd_endpoints(config, action).await
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommand: serve
// ---------------------------------------------------------------------------

async fn cmd_serve(config: AuthConfig, bind: String, port: u16) -> Result<()> {
    let db = open_database(&config).await?;
    let registry = build_registry(&config, db.clone());
    let origin = config.origin().context("invalid base_url")?;

    let shutdown = CancellationToken::new();
    let purge = tokio::spawn({
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        async move {
            let mut ticker = tokio::time::interval(PURGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = registry.purge_expired().await {
                            tracing::warn!(error = %e, "session purge failed");
                        }
                    }
                }
            }
        }
    });

    info!(
        base_url = %config.base_url,
        endpoints = registry.endpoints().len(),
        "starting keyward"
    );
    let server = WebServer::new(
        WebConfig {
            bind_addr: bind,
            port,
        },
        AppState::new(registry, origin, db),
    );
    let result = server
        .start({
            let shutdown = shutdown.clone();
            async move {
                shutdown_signal().await;
                shutdown.cancel();
            }
        })
        .await;

    shutdown.cancel();
    if let Err(e) = purge.await {
        tracing::warn!(error = %e, "purge task ended abnormally");
    }
    result.map_err(|e| anyhow!(e)).context("web server failed")
}

// ---------------------------------------------------------------------------
// Subcommand: github
// ---------------------------------------------------------------------------

async fn cmd_github(config: AuthConfig, action: GithubAction) -> Result<()> {
    let db = open_database(&config).await?;
    let engine = device_engine(&config, db);

    match action {
        GithubAction::Login { user, max_attempts } => {
            let owner = owner_key(user);
            let cancel = CancellationToken::new();
            let watcher = tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    shutdown_signal().await;
                    cancel.cancel();
                }
            });

            let mut options = PollOptions::with_cancel(cancel);
            if let Some(max) = max_attempts {
                options = options.max_attempts(max);
            }

            let result = engine
                .complete_auth(
                    &owner,
                    |ticket| {
                        println!();
                        println!("  Open {} and enter the code:", ticket.verification_uri);
                        println!();
                        println!("      {}", ticket.user_code);
                        println!();
                        println!("  Waiting for authorization (Ctrl-C to cancel)...");
                    },
                    options,
                )
                .await;
            watcher.abort();

            let result = result.context("GitHub login failed")?;
            println!();
            println!("  Linked GitHub account {}", result.identity.login);
            println!("  Scopes: {}", display_scope(&result.tokens.scope));
            println!();
        }
        GithubAction::Status { user } => {
            let owner = owner_key(user);
            match engine.status(&owner).await.context("failed to read credential")? {
                Some(credential) => {
                    println!();
                    println!("  GitHub account:   {}", credential.username);
                    println!("  Scopes:           {}", display_scope(&credential.scope));
                    println!("  Linked since:     {}", format_timestamp(credential.created_at));
                    if let Some(expires_at) = credential.expires_at {
                        println!("  Token expires:    {}", format_timestamp(expires_at));
                    }
                    println!();
                }
                None => println!("  No GitHub account linked for {owner}."),
            }
        }
        GithubAction::Logout { user } => {
            let owner = owner_key(user);
            if engine.logout(&owner).await.context("failed to unlink account")? {
                println!("  GitHub account unlinked for {owner}.");
            } else {
                println!("  No GitHub account linked for {owner}.");
            }
        }
    }
    Ok(())
}

fn display_scope(scope: &str) -> &str {
    if scope.is_empty() { "(none)" } else { scope }
}

// ---------------------------------------------------------------------------
// Subcommand: sessions
// ---------------------------------------------------------------------------

async fn cmd_sessions(config: AuthConfig, action: SessionAction) -> Result<()> {
    let db = open_database(&config).await?;
    let registry = build_registry(&config, db);

    match action {
        SessionAction::Purge => {
            let removed = registry
                .purge_expired()
                .await
                .context("failed to purge sessions")?;
            println!("  Removed {removed} expired session(s).");
        }
        SessionAction::List { endpoint } => {
            let manager = registry
                .per_user(&endpoint)
                .with_context(|| format!("unknown endpoint {endpoint:?}"))?;
            let sessions = manager
                .list_sessions()
                .await
                .context("failed to list sessions")?;
            if sessions.is_empty() {
                println!("  No user sessions for {endpoint}.");
                return Ok(());
            }
            println!();
            println!("  {:<24} {:<10} {:<24}", "USER", "STATUS", "EXPIRES");
            for session in sessions {
                let status = if session.consumed { "active" } else { "pending" };
                println!(
                    "  {:<24} {:<10} {:<24}",
                    session.user_id,
                    status,
                    format_timestamp(session.expires_at)
                );
            }
            println!();
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: endpoints
// ---------------------------------------------------------------------------

async fn cmd_endpoints(config: AuthConfig, action: EndpointAction) -> Result<()> {
    match action {
        EndpointAction::List => {
            if config.endpoints.is_empty() {
                println!("  No endpoints configured.");
                return Ok(());
            }
            let db = open_database(&config).await?;
            let registry = build_registry(&config, db);

            println!();
            println!("  {:<16} {:<24} {:<12}", "ID", "NAME", "SHARED");
            for endpoint in registry.endpoints() {
                let authorized = registry
                    .shared_tokens(&endpoint.id)
                    .await
                    .with_context(|| format!("failed to read tokens for {}", endpoint.id))?
                    .is_some();
                println!(
                    "  {:<16} {:<24} {:<12}",
                    endpoint.id,
                    endpoint.name,
                    if authorized { "authorized" } else { "-" }
                );
            }
            println!();
        }
    }
    Ok(())
}
