//! Token, client and session types shared by every flow.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Seconds before `expires_at` at which a token is already treated as
/// expired, so it is never sent when it could lapse mid-request.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Client id/secret for a provider or endpoint, loaded from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
}

/// A durable OAuth credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: String,
    /// Space-separated scopes as granted by the provider.
    #[serde(default)]
    pub scope: String,
    /// Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl TokenSet {
    /// Tokens without `expires_at` never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|at| now.timestamp() >= at - EXPIRY_SKEW_SECS)
    }

    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scope.split_whitespace()
    }
}

/// Token endpoint success body. Converted into [`TokenSet`] against the
/// caller's clock.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
}

impl TokenResponse {
    pub fn into_token_set(self, now: DateTime<Utc>) -> TokenSet {
        TokenSet {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_type: self.token_type.unwrap_or_else(|| "bearer".to_string()),
            scope: self.scope.unwrap_or_default(),
            expires_at: self.expires_in.map(|secs| now.timestamp() + secs),
        }
    }
}

/// Whose credentials a session holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OwnerKey {
    /// The endpoint's own shared client.
    Shared,
    /// One end-user of a shared endpoint definition.
    User(String),
}

impl OwnerKey {
    /// The nullable `owner_key` column value.
    pub fn as_column(&self) -> Option<&str> {
        match self {
            Self::Shared => None,
            Self::User(id) => Some(id),
        }
    }

    pub fn from_column(column: Option<String>) -> Self {
        column.map_or(Self::Shared, Self::User)
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => f.write_str("shared"),
            Self::User(id) => write!(f, "user:{id}"),
        }
    }
}

/// Registered client, as returned by dynamic client registration or
/// synthesized from configured credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInformation {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<i64>,
}

impl From<ClientCredentials> for ClientInformation {
    fn from(credentials: ClientCredentials) -> Self {
        Self {
            client_id: credentials.client_id,
            client_secret: credentials.client_secret,
            client_id_issued_at: None,
            client_secret_expires_at: None,
        }
    }
}

/// Metadata sent when registering a client (RFC 7591).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub client_name: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// An in-progress device authorization, shown to the user and polled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCodeTicket {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub poll_interval_secs: u64,
}

/// The subset of the GitHub `/user` object keyward keeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubUserIdentity {
    pub id: i64,
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Result of starting an authorization-code attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationStart {
    pub state: String,
    pub authorization_url: String,
}
