//! HTTP boundary for keyward.
//!
//! This crate exposes the auth engine over axum:
//!
//! - The two OAuth redirect targets (`/oauth/callback` for the shared
//!   endpoint client, `/oauth/user/callback` for per-user sessions), which
//!   answer with the page that notifies the opener window.
//! - A small JSON API to start authorizations, inspect and revoke per-user
//!   grants, and probe health.

pub mod api;
pub mod oauth;
pub mod server;
pub mod state;

pub use server::WebServer;
pub use state::AppState;

/// Web server configuration.
#[derive(Debug, Clone)]
pub struct WebConfig {
    /// The address to bind the HTTP server to.
    pub bind_addr: String,
    /// The port to listen on.
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 3000,
        }
    }
}
