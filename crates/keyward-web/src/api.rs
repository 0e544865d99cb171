//! REST API route handlers.
//!
//! Provides endpoints to start shared and per-user authorizations, inspect
//! or revoke a user's grant, list configured endpoints, and probe health.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use keyward_auth::AuthError;
use serde::Serialize;
use serde_json::{Value, json};

use crate::state::AppState;

type ApiResponse = (StatusCode, Json<Value>);

// ---------------------------------------------------------------------------
// GET /api/health
// ---------------------------------------------------------------------------

/// Response payload for the `/api/health` endpoint.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub database: bool,
    pub endpoints: usize,
}

pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let database = check_database_health(&state).await;
    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if database { "healthy" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            database,
            endpoints: state.registry.endpoints().len(),
        }),
    )
}

async fn check_database_health(state: &AppState) -> bool {
    let probe = state
        .db
        .execute(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await;
    match probe {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "database health check failed");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// GET /api/endpoints
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct EndpointSummary {
    pub id: String,
    pub name: String,
    /// Whether the shared client holds tokens.
    pub authorized: bool,
}

pub async fn list_endpoints(State(state): State<Arc<AppState>>) -> ApiResponse {
    let mut items = Vec::with_capacity(state.registry.endpoints().len());
    for endpoint in state.registry.endpoints() {
        let authorized = match state.registry.shared_tokens(&endpoint.id).await {
            Ok(tokens) => tokens.is_some(),
            Err(e) => return error_response(&e),
        };
        items.push(EndpointSummary {
            id: endpoint.id.clone(),
            name: endpoint.name.clone(),
            authorized,
        });
    }
    (StatusCode::OK, Json(json!(items)))
}

// ---------------------------------------------------------------------------
// POST /api/endpoints/{id}/authorize
// ---------------------------------------------------------------------------

/// Start an authorization for the endpoint's shared client.
pub async fn authorize_shared(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResponse {
    if state.registry.endpoint(&id).is_none() {
        return unknown_endpoint(&id);
    }
    match state.registry.authorize_shared(&id).await {
        Ok(start) => (StatusCode::OK, Json(json!(start))),
        Err(e) => error_response(&e),
    }
}

// ---------------------------------------------------------------------------
// /api/endpoints/{id}/users/{user_id}/...
// ---------------------------------------------------------------------------

/// POST `.../authorize`: start an authorization for one user.
pub async fn authorize_user(
    State(state): State<Arc<AppState>>,
    Path((id, user_id)): Path<(String, String)>,
) -> ApiResponse {
    let Some(manager) = state.registry.per_user(&id) else {
        return unknown_endpoint(&id);
    };
    match manager.start_authorization(&user_id).await {
        Ok(start) => (StatusCode::OK, Json(json!(start))),
        Err(e) => error_response(&e),
    }
}

/// GET `.../status`: whether the user holds tokens, and until when.
pub async fn user_status(
    State(state): State<Arc<AppState>>,
    Path((id, user_id)): Path<(String, String)>,
) -> ApiResponse {
    let Some(manager) = state.registry.per_user(&id) else {
        return unknown_endpoint(&id);
    };
    match manager.tokens_for_user(&user_id).await {
        Ok(Some(tokens)) => (
            StatusCode::OK,
            Json(json!({
                "authorized": true,
                "expires_at": tokens.expires_at,
                "scope": tokens.scope,
            })),
        ),
        Ok(None) => (StatusCode::OK, Json(json!({ "authorized": false }))),
        Err(e) => error_response(&e),
    }
}

/// DELETE `.../status`: forget everything stored for the user.
pub async fn revoke_user(
    State(state): State<Arc<AppState>>,
    Path((id, user_id)): Path<(String, String)>,
) -> ApiResponse {
    let Some(manager) = state.registry.per_user(&id) else {
        return unknown_endpoint(&id);
    };
    match manager.revoke_user(&user_id).await {
        Ok(removed) => (StatusCode::OK, Json(json!({ "revoked": removed > 0, "removed": removed }))),
        Err(e) => error_response(&e),
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

fn unknown_endpoint(id: &str) -> ApiResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "not_found", "message": format!("unknown endpoint {id:?}") })),
    )
}

fn error_response(err: &AuthError) -> ApiResponse {
    let (status, code) = match err {
        AuthError::InvalidRequest => (StatusCode::BAD_REQUEST, "invalid_request"),
        AuthError::InvalidState => (StatusCode::BAD_REQUEST, "invalid_state"),
        AuthError::Unauthorized { .. } => (StatusCode::UNAUTHORIZED, "unauthorized"),
        AuthError::Provider { .. } | AuthError::Network(_) | AuthError::TokenExchangeFailed { .. } => {
            (StatusCode::BAD_GATEWAY, "provider_error")
        }
        AuthError::Configuration { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }
    (status, Json(json!({ "error": code, "message": err.to_string() })))
}
