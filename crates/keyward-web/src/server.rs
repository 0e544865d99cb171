//! Main web server setup and startup.
//!
//! [`WebServer`] composes the Axum router, registers all routes, and runs
//! the HTTP listener until the shutdown future resolves.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::http::Method;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::WebConfig;
use crate::api;
use crate::oauth;
use crate::state::AppState;

/// The keyward web server.
pub struct WebServer {
    config: WebConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: WebConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Return the `host:port` string this server will bind to.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.config.bind_addr, self.config.port)
    }

    /// Build the Axum router with all routes registered.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers(Any);

        Router::new()
            // OAuth redirect targets.
            .route("/oauth/callback", get(oauth::shared_callback))
            .route("/oauth/user/callback", get(oauth::user_callback))
            // REST API.
            .route("/api/health", get(api::health))
            .route("/api/endpoints", get(api::list_endpoints))
            .route("/api/endpoints/{id}/authorize", post(api::authorize_shared))
            .route(
                "/api/endpoints/{id}/users/{user_id}/authorize",
                post(api::authorize_user),
            )
            .route(
                "/api/endpoints/{id}/users/{user_id}/status",
                get(api::user_status).delete(api::revoke_user),
            )
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP listener cannot be bound.
    pub async fn start<F>(self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.addr();
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "starting web server");
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    pub async fn serve<F>(
        self,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        tracing::info!("web server stopped");
        Ok(())
    }
}
