//! Shared application state for the web server.
//!
//! [`AppState`] is wrapped in an `Arc` and shared across all request
//! handlers. The two callback routers differ only in the exchanger behind
//! them.

use std::sync::Arc;

use keyward_auth::{CallbackRouter, EndpointRegistry, SharedCallbacks, UserCallbacks};
use keyward_store::Database;

/// Shared state accessible from every Axum handler.
#[derive(Clone)]
pub struct AppState {
    /// Configured endpoints and their providers.
    pub registry: Arc<EndpointRegistry>,

    /// Redeems redirects to `/oauth/callback`.
    pub shared_callbacks: CallbackRouter,

    /// Redeems redirects to `/oauth/user/callback`.
    pub user_callbacks: CallbackRouter,

    /// Origin allowed to receive the callback page's `postMessage`.
    pub origin: String,

    /// Database handle, used by the health probe.
    pub db: Database,
}

impl AppState {
    pub fn new(registry: Arc<EndpointRegistry>, origin: impl Into<String>, db: Database) -> Self {
        Self {
            shared_callbacks: CallbackRouter::new(Arc::new(SharedCallbacks(registry.clone()))),
            user_callbacks: CallbackRouter::new(Arc::new(UserCallbacks(registry.clone()))),
            registry,
            origin: origin.into(),
            db,
        }
    }
}
