//! HTTP calls to provider endpoints.
//!
//! [`ProviderClient`] is stateless apart from the pooled `reqwest::Client`
//! it wraps; every call takes the URL it talks to, and calls that compute
//! expiry take the caller's `now` so the injected clock stays authoritative.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{AuthError, Result};
use crate::types::{
    ClientCredentials, ClientInformation, ClientMetadata, DeviceCodeTicket, GitHubUserIdentity,
    TokenResponse, TokenSet,
};

const USER_AGENT: &str = concat!("keyward/", env!("CARGO_PKG_VERSION"));

/// RFC 8628 device grant type.
pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Some providers send `verification_url` instead of `verification_uri`.
#[derive(Debug, Deserialize)]
struct RawDeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: Option<String>,
    verification_url: Option<String>,
    verification_uri_complete: Option<String>,
    expires_in: i64,
    #[serde(default = "default_interval")]
    interval: u64,
}

fn default_interval() -> u64 {
    5
}

/// A zero interval means the provider sent no usable value.
fn effective_interval(interval: u64) -> u64 {
    if interval == 0 { default_interval() } else { interval }
}

/// Token endpoint body that may be either a grant or an OAuth error.
/// GitHub answers device polls with HTTP 200 in both cases.
#[derive(Debug, Deserialize)]
struct RawTokenBody {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    token_type: Option<String>,
    scope: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl RawTokenBody {
    fn into_token_response(self) -> Option<TokenResponse> {
        let access_token = self.access_token?;
        Some(TokenResponse {
            access_token,
            refresh_token: self.refresh_token,
            expires_in: self.expires_in,
            token_type: self.token_type,
            scope: self.scope,
        })
    }
}

/// One answer from the device-flow token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicePollResponse {
    Token(TokenSet),
    Error {
        error: String,
        description: Option<String>,
    },
}

/// RFC 8414 authorization server metadata.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthorizationServerMetadata {
    #[serde(default)]
    pub issuer: Option<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

/// Parameters of an authorization-code exchange.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeRequest<'a> {
    pub token_url: &'a str,
    pub code: &'a str,
    pub redirect_uri: &'a str,
    pub client_id: &'a str,
    pub client_secret: Option<&'a str>,
    pub code_verifier: &'a str,
    pub resource: Option<&'a str>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ProviderClient {
    http: reqwest::Client,
}

impl ProviderClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured `reqwest::Client` (proxies, timeouts).
    pub fn with_http(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// `POST {url}` with `client_id` and `scope`.
    pub async fn request_device_code(
        &self,
        url: &str,
        client_id: &str,
        scope: &str,
        now: DateTime<Utc>,
    ) -> Result<DeviceCodeTicket> {
        tracing::debug!(url, "requesting device code");

        let response = self
            .http
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .form(&[("client_id", client_id), ("scope", scope)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Provider {
                status: status.as_u16(),
                message: format!("device code request failed: {body}"),
            });
        }

        let raw: RawDeviceCodeResponse = response.json().await?;
        let verification_uri = raw
            .verification_uri
            .or(raw.verification_url)
            .ok_or_else(|| AuthError::Provider {
                status: status.as_u16(),
                message: "device code response missing verification_uri".to_string(),
            })?;

        Ok(DeviceCodeTicket {
            device_code: raw.device_code,
            user_code: raw.user_code,
            verification_uri,
            verification_uri_complete: raw.verification_uri_complete,
            expires_at: chrono::Duration::try_seconds(raw.expires_in)
                .and_then(|lifetime| now.checked_add_signed(lifetime))
                .unwrap_or(now),
            poll_interval_secs: effective_interval(raw.interval),
        })
    }

    /// One device-flow token request. OAuth error bodies come back as
    /// [`DevicePollResponse::Error`] whatever the HTTP status; anything
    /// else unparseable is an [`AuthError::Provider`].
    pub async fn poll_device_token(
        &self,
        url: &str,
        credentials: &ClientCredentials,
        device_code: &str,
        now: DateTime<Utc>,
    ) -> Result<DevicePollResponse> {
        let mut params = vec![
            ("client_id", credentials.client_id.as_str()),
            ("device_code", device_code),
            ("grant_type", DEVICE_CODE_GRANT),
        ];
        if let Some(secret) = credentials.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }

        let response = self
            .http
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let raw = serde_json::from_str::<RawTokenBody>(&body).map_err(|_| AuthError::Provider {
            status: status.as_u16(),
            message: format!("unexpected token response: {body}"),
        })?;

        if let Some(error) = raw.error.clone() {
            return Ok(DevicePollResponse::Error {
                error,
                description: raw.error_description,
            });
        }
        match raw.into_token_response() {
            Some(token) if status.is_success() => {
                Ok(DevicePollResponse::Token(token.into_token_set(now)))
            }
            _ => Err(AuthError::Provider {
                status: status.as_u16(),
                message: "token response carried neither access_token nor error".to_string(),
            }),
        }
    }

    /// `GET {url}` with GitHub's `Authorization: token …` scheme.
    pub async fn fetch_github_user(
        &self,
        url: &str,
        access_token: &str,
    ) -> Result<GitHubUserIdentity> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::AUTHORIZATION, format!("token {access_token}"))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Provider {
                status: status.as_u16(),
                message: format!("userinfo request failed: {body}"),
            });
        }
        Ok(response.json().await?)
    }

    /// Redeem an authorization code and its PKCE verifier.
    pub async fn exchange_authorization_code(
        &self,
        request: ExchangeRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<TokenSet> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", request.code),
            ("redirect_uri", request.redirect_uri),
            ("client_id", request.client_id),
            ("code_verifier", request.code_verifier),
        ];
        if let Some(secret) = request.client_secret {
            params.push(("client_secret", secret));
        }
        if let Some(resource) = request.resource {
            params.push(("resource", resource));
        }

        tracing::debug!(token_url = request.token_url, "exchanging authorization code");
        self.token_request(request.token_url, &params, now).await
    }

    pub async fn refresh_token(
        &self,
        token_url: &str,
        client: &ClientInformation,
        refresh_token: &str,
        now: DateTime<Utc>,
    ) -> Result<TokenSet> {
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client.client_id.as_str()),
        ];
        if let Some(secret) = client.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }

        tracing::debug!(token_url, "refreshing access token");
        let mut tokens = self.token_request(token_url, &params, now).await?;
        // Providers may omit the refresh token when it is not rotated.
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token.to_string());
        }
        Ok(tokens)
    }

    /// Fetch RFC 8414 metadata for `issuer`, falling back to the OpenID
    /// configuration document.
    pub async fn discover(&self, issuer: &str) -> Result<AuthorizationServerMetadata> {
        let base = issuer.trim_end_matches('/');
        let mut last_status = 404;
        for suffix in [
            ".well-known/oauth-authorization-server",
            ".well-known/openid-configuration",
        ] {
            let url = format!("{base}/{suffix}");
            tracing::debug!(%url, "fetching authorization server metadata");
            let response = self
                .http
                .get(&url)
                .header(reqwest::header::ACCEPT, "application/json")
                .header(reqwest::header::USER_AGENT, USER_AGENT)
                .send()
                .await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response.json().await?);
            }
            last_status = status.as_u16();
        }
        Err(AuthError::Provider {
            status: last_status,
            message: format!("no authorization server metadata for {issuer}"),
        })
    }

    /// RFC 7591 dynamic client registration.
    pub async fn register_client(
        &self,
        registration_url: &str,
        metadata: &ClientMetadata,
    ) -> Result<ClientInformation> {
        tracing::debug!(registration_url, "registering client");
        let response = self
            .http
            .post(registration_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .json(metadata)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Provider {
                status: status.as_u16(),
                message: format!("client registration failed: {body}"),
            });
        }
        Ok(response.json().await?)
    }

    async fn token_request(
        &self,
        token_url: &str,
        params: &[(&str, &str)],
        now: DateTime<Utc>,
    ) -> Result<TokenSet> {
        let response = self
            .http
            .post(token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .form(params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let parsed = serde_json::from_str::<RawTokenBody>(&body);

        match parsed {
            Ok(raw) if raw.error.is_some() => Err(AuthError::TokenExchangeFailed {
                description: raw.error_description.or(raw.error),
            }),
            Ok(raw) if status.is_success() => match raw.into_token_response() {
                Some(token) => Ok(token.into_token_set(now)),
                None => Err(AuthError::Provider {
                    status: status.as_u16(),
                    message: "token response missing access_token".to_string(),
                }),
            },
            _ => Err(AuthError::Provider {
                status: status.as_u16(),
                message: body,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
