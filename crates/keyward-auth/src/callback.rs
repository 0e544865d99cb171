//! Inbound authorization-code redirects.
//!
//! [`CallbackRouter::handle`] decides the terminal outcome of one redirect
//! as plain data; [`render_callback_page`] turns an outcome into the HTML
//! document the browser shows. The document notifies `window.opener` with
//! a structured payload when one exists and closes itself.
//!
//! ```text
//! received ─┬─ error param ───────────────► Provider error
//!           ├─ missing code/state ────────► invalid_request
//!           ├─ state unknown / not pending ► invalid_state
//!           ├─ exchange fails ────────────► token_exchange_failed
//!           └─ exchange succeeds ─────────► success
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{AuthError, Result};

/// Query parameters of a redirect. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// A session that may still redeem an authorization code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCallback {
    pub state: String,
    pub endpoint_id: String,
    pub endpoint_name: String,
}

/// Performs the code exchange for one callback variant.
#[async_trait]
pub trait CodeExchanger: Send + Sync {
    /// The unconsumed, unexpired session `state` identifies, if any.
    async fn find_pending(&self, state: &str) -> Result<Option<PendingCallback>>;

    async fn exchange(&self, pending: &PendingCallback, code: &str) -> Result<()>;
}

/// Why a callback did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackFailure {
    /// The authorization server redirected with `error`.
    Provider {
        error: String,
        description: Option<String>,
    },
    InvalidRequest,
    InvalidState,
    TokenExchangeFailed { description: Option<String> },
}

impl CallbackFailure {
    /// Stable error code sent to the opener.
    pub fn code(&self) -> &str {
        match self {
            Self::Provider { error, .. } => error,
            Self::InvalidRequest => "invalid_request",
            Self::InvalidState => "invalid_state",
            Self::TokenExchangeFailed { .. } => "token_exchange_failed",
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            Self::Provider { description, .. } | Self::TokenExchangeFailed { description } => {
                description.as_deref()
            }
            Self::InvalidRequest => Some("The authorization response was incomplete."),
            Self::InvalidState => Some("The authorization session is unknown or has expired."),
        }
    }
}

/// Terminal outcome of one redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Success {
        endpoint_id: String,
        endpoint_name: String,
    },
    Failure(CallbackFailure),
}

impl CallbackOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// 200 for success, 400 otherwise.
    pub fn http_status(&self) -> u16 {
        if self.is_success() { 200 } else { 400 }
    }
}

/// Which flow a callback page belongs to; selects the message prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackVariant {
    Shared,
    PerUser,
}

impl CallbackVariant {
    pub fn message_prefix(self) -> &'static str {
        match self {
            Self::Shared => "TOOL_OAUTH",
            Self::PerUser => "TOOL_USER_OAUTH",
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CallbackRouter {
    exchanger: Arc<dyn CodeExchanger>,
}

impl CallbackRouter {
    pub fn new(exchanger: Arc<dyn CodeExchanger>) -> Self {
        Self { exchanger }
    }

    pub async fn handle(&self, params: &CallbackParams) -> CallbackOutcome {
        if let Some(error) = params.error.as_deref() {
            tracing::info!(error, "authorization server returned an error");
            return CallbackOutcome::Failure(CallbackFailure::Provider {
                error: error.to_string(),
                description: params.error_description.clone(),
            });
        }

        let (Some(code), Some(state)) = (
            params.code.as_deref().filter(|c| !c.is_empty()),
            params.state.as_deref().filter(|s| !s.is_empty()),
        ) else {
            tracing::info!("callback missing code or state");
            return CallbackOutcome::Failure(CallbackFailure::InvalidRequest);
        };

        let pending = match self.exchanger.find_pending(state).await {
            Ok(Some(pending)) => pending,
            Ok(None) => {
                tracing::info!("callback state does not match a pending session");
                return CallbackOutcome::Failure(CallbackFailure::InvalidState);
            }
            Err(e) => {
                tracing::warn!(error = %e, "session lookup failed");
                return CallbackOutcome::Failure(CallbackFailure::InvalidState);
            }
        };

        match self.exchanger.exchange(&pending, code).await {
            Ok(()) => {
                tracing::info!(endpoint_id = %pending.endpoint_id, "authorization completed");
                CallbackOutcome::Success {
                    endpoint_id: pending.endpoint_id,
                    endpoint_name: pending.endpoint_name,
                }
            }
            Err(AuthError::InvalidState) => {
                tracing::info!(endpoint_id = %pending.endpoint_id, "state redeemed by another callback");
                CallbackOutcome::Failure(CallbackFailure::InvalidState)
            }
            Err(e) => {
                tracing::warn!(endpoint_id = %pending.endpoint_id, error = %e, "token exchange failed");
                CallbackOutcome::Failure(CallbackFailure::TokenExchangeFailed {
                    description: e.exchange_description().map(str::to_string),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

const PAGE_STYLE: &str = r#"
        body {
            font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            height: 100vh;
            margin: 0;
            background: #f5f5f5;
            color: #333;
        }
        .card {
            text-align: center;
            padding: 3rem;
            background: white;
            border-radius: 12px;
            box-shadow: 0 2px 10px rgba(0,0,0,0.08);
        }
        p { color: #666; }"#;

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// JSON that is safe inside a `<script>` element.
fn script_json(value: &serde_json::Value) -> String {
    value
        .to_string()
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026")
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

/// The message posted to the opener.
pub fn callback_payload(variant: CallbackVariant, outcome: &CallbackOutcome) -> serde_json::Value {
    let prefix = variant.message_prefix();
    match outcome {
        CallbackOutcome::Success {
            endpoint_id,
            endpoint_name,
        } => json!({
            "type": format!("{prefix}_SUCCESS"),
            "success": true,
            "endpointId": endpoint_id,
            "endpointName": endpoint_name,
        }),
        CallbackOutcome::Failure(failure) => json!({
            "type": format!("{prefix}_ERROR"),
            "error": failure.code(),
            "error_description": failure.description(),
        }),
    }
}

/// Render the document for `outcome`. `target_origin` restricts who may
/// receive the posted message.
pub fn render_callback_page(
    variant: CallbackVariant,
    outcome: &CallbackOutcome,
    target_origin: &str,
) -> String {
    let (title, color, message) = match outcome {
        CallbackOutcome::Success { endpoint_name, .. } => (
            "Authorization Successful",
            "#22c55e",
            format!("{endpoint_name} is now connected."),
        ),
        CallbackOutcome::Failure(failure) => (
            "Authorization Failed",
            "#ef4444",
            match failure.description() {
                Some(description) => format!("{}: {description}", failure.code()),
                None => failure.code().to_string(),
            },
        ),
    };

    let payload = script_json(&callback_payload(variant, outcome));
    let origin = script_json(&serde_json::Value::String(target_origin.to_string()));
    let message = escape_html(&message);

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>{title}</title>
    <style>{PAGE_STYLE}
        h1 {{ color: {color}; margin-bottom: 0.5rem; }}
    </style>
</head>
<body>
    <div class="card">
        <h1>{title}</h1>
        <p>{message}</p>
        <p>This window will close automatically.</p>
    </div>
    <script>
        (function () {{
            var payload = {payload};
            try {{
                if (window.opener && !window.opener.closed) {{
                    window.opener.postMessage(payload, {origin});
                }}
            }} catch (e) {{}}
            setTimeout(function () {{
                try {{ window.close(); }} catch (e) {{}}
            }}, 1500);
        }})();
    </script>
</body>
</html>"#
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
