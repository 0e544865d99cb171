//! OAuth redirect targets.
//!
//! Both routes always answer with an HTML page; the status is 200 when the
//! code was redeemed and 400 for every failure.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use keyward_auth::{CallbackOutcome, CallbackParams, CallbackRouter, CallbackVariant, render_callback_page};

use crate::state::AppState;

// ---------------------------------------------------------------------------
// GET /oauth/callback
// ---------------------------------------------------------------------------

/// Redirect target of the shared endpoint client.
pub async fn shared_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, Html<String>) {
    respond(&state.shared_callbacks, CallbackVariant::Shared, &state.origin, &params).await
}

// ---------------------------------------------------------------------------
// GET /oauth/user/callback
// ---------------------------------------------------------------------------

/// Redirect target of per-user sessions.
pub async fn user_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, Html<String>) {
    respond(&state.user_callbacks, CallbackVariant::PerUser, &state.origin, &params).await
}

async fn respond(
    router: &CallbackRouter,
    variant: CallbackVariant,
    origin: &str,
    params: &CallbackParams,
) -> (StatusCode, Html<String>) {
    let outcome = router.handle(params).await;
    match &outcome {
        CallbackOutcome::Success { endpoint_id, .. } => {
            tracing::info!(?variant, endpoint_id = %endpoint_id, "oauth callback completed");
        }
        CallbackOutcome::Failure(failure) => {
            tracing::warn!(?variant, code = failure.code(), "oauth callback failed");
        }
    }
    let status = StatusCode::from_u16(outcome.http_status()).unwrap_or(StatusCode::BAD_REQUEST);
    (status, Html(render_callback_page(variant, &outcome, origin)))
}
