//! CLI argument definitions for keyward.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use keyward_auth::DEFAULT_CONFIG_PATH;

/// keyward -- OAuth credentials for tools and repositories.
#[derive(Parser)]
#[command(
    name = "keyward",
    version,
    about = "keyward -- OAuth credentials for tools and repositories",
    long_about = "Links GitHub accounts through the device flow and authorizes \
                  tool-serving endpoints with authorization code + PKCE."
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short, global = true, env = "KEYWARD_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the callback and API server.
    Serve {
        /// Address to bind the HTTP server to.
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,

        /// Port to listen on.
        #[arg(long, short, default_value_t = 3000)]
        port: u16,
    },

    /// Link, inspect or unlink a GitHub account (device flow).
    Github {
        #[command(subcommand)]
        action: GithubAction,
    },

    /// Maintain stored OAuth sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Inspect configured endpoints.
    Endpoints {
        #[command(subcommand)]
        action: EndpointAction,
    },
}

/// Actions for the GitHub device flow.
#[derive(Subcommand)]
pub enum GithubAction {
    /// Show a user code and wait until it is authorized.
    Login {
        /// Link the account to this user instead of the shared owner.
        #[arg(long, short)]
        user: Option<String>,
        /// Give up after this many token requests.
        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Show the linked account.
    Status {
        #[arg(long, short)]
        user: Option<String>,
    },
    /// Deactivate the linked account.
    Logout {
        #[arg(long, short)]
        user: Option<String>,
    },
}

/// Actions for stored OAuth sessions.
#[derive(Subcommand)]
pub enum SessionAction {
    /// Delete attempts that expired without completing.
    Purge,
    /// List per-user sessions of an endpoint.
    List {
        /// The endpoint id.
        endpoint: String,
    },
}

/// Actions for configured endpoints.
#[derive(Subcommand)]
pub enum EndpointAction {
    /// List endpoints and whether their shared client is authorized.
    List,
}
