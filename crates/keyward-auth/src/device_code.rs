//! RFC 8628 Device Authorization Grant against GitHub.
//!
//! # Flow Overview
//!
//! 1. Request a device code; the ticket carries the `user_code` and the
//!    `verification_uri` to show the user.
//! 2. Sleep `interval` seconds, then poll the token endpoint.
//! 3. `authorization_pending` keeps polling, `slow_down` adds five seconds
//!    to the interval, `expired_token` / `access_denied` are terminal.
//!    Unrecognized errors are logged and polling continues.
//! 4. On success, fetch the GitHub identity and upsert the stored
//!    credential for the owner.
//!
//! Polling ends no later than the ticket's `expires_at` (judged by the
//! injected clock), on cancellation, or after `max_attempts` requests.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keyward_store::{CredentialStore, GitCredential, NewCredential};
use tokio_util::sync::CancellationToken;

use crate::client::{DevicePollResponse, ProviderClient};
use crate::clock::Clock;
use crate::config::GitHubProviderConfig;
use crate::error::{AuthError, Result};
use crate::types::{DeviceCodeTicket, GitHubUserIdentity, TokenSet};

/// Seconds added to the poll interval for every `slow_down` answer.
pub const SLOW_DOWN_INCREMENT_SECS: u64 = 5;

/// Floor for the poll interval, whatever the caller passes.
pub const MIN_POLL_INTERVAL_SECS: u64 = 1;

const PROVIDER: &str = "github";

// ---------------------------------------------------------------------------
// Poll control
// ---------------------------------------------------------------------------

/// Reported to the `on_poll` hook before each token request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollProgress {
    /// 1-based number of the request about to be sent.
    pub attempt: u32,
    pub interval_secs: u64,
}

/// Bounds on one polling run.
#[derive(Debug, Clone, Default)]
pub struct PollOptions {
    /// Give up with [`AuthError::PollLimitExceeded`] after this many
    /// requests. `None` polls until the ticket expires.
    pub max_attempts: Option<u32>,
    pub cancel: CancellationToken,
    /// Treated as `expired_token` once the clock passes it.
    pub deadline: Option<DateTime<Utc>>,
}

impl PollOptions {
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Outcome of a completed device authorization.
#[derive(Debug, Clone)]
pub struct DeviceAuthResult {
    pub tokens: TokenSet,
    pub identity: GitHubUserIdentity,
    pub credential: GitCredential,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct DeviceFlowEngine {
    config: GitHubProviderConfig,
    client: ProviderClient,
    credentials: CredentialStore,
    clock: Arc<dyn Clock>,
}

impl DeviceFlowEngine {
    pub fn new(
        config: GitHubProviderConfig,
        client: ProviderClient,
        credentials: CredentialStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            client,
            credentials,
            clock,
        }
    }

    /// Start an authorization attempt.
    ///
    /// # Errors
    ///
    /// [`AuthError::Configuration`] without a client id, or
    /// [`AuthError::Provider`] on a non-2xx answer.
    pub async fn request_device_code(&self) -> Result<DeviceCodeTicket> {
        let credentials = self.config.credentials()?;
        let ticket = self
            .client
            .request_device_code(
                &self.config.device_code_url,
                &credentials.client_id,
                &self.config.scope,
                self.clock.now(),
            )
            .await?;
        tracing::info!(
            verification_uri = %ticket.verification_uri,
            interval = ticket.poll_interval_secs,
            "device code issued"
        );
        Ok(ticket)
    }

    /// Poll until the provider issues a token.
    ///
    /// Every iteration sleeps first, so the provider never sees a request
    /// sooner than `interval_secs` after the previous one.
    pub async fn poll_for_token<F>(
        &self,
        device_code: &str,
        interval_secs: u64,
        options: &PollOptions,
        mut on_poll: F,
    ) -> Result<TokenSet>
    where
        F: FnMut(PollProgress) -> ControlFlow<()> + Send,
    {
        let credentials = self.config.credentials()?;
        let mut interval = interval_secs.max(MIN_POLL_INTERVAL_SECS);
        let mut attempt: u32 = 0;

        loop {
            if let Some(max) = options.max_attempts
                && attempt >= max
            {
                tracing::warn!(attempts = attempt, "device flow poll limit reached");
                return Err(AuthError::PollLimitExceeded { attempts: attempt });
            }
            attempt += 1;

            if on_poll(PollProgress {
                attempt,
                interval_secs: interval,
            })
            .is_break()
            {
                tracing::debug!(attempt, "polling stopped by caller");
                return Err(AuthError::Cancelled);
            }

            tokio::select! {
                biased;
                _ = options.cancel.cancelled() => {
                    tracing::debug!(attempt, "device flow cancelled");
                    return Err(AuthError::Cancelled);
                }
                _ = self.clock.sleep(Duration::from_secs(interval)) => {}
            }

            if let Some(deadline) = options.deadline
                && self.clock.now() >= deadline
            {
                tracing::info!(attempt, "device code expired before authorization");
                return Err(AuthError::AuthExpired);
            }

            let answer = tokio::select! {
                biased;
                _ = options.cancel.cancelled() => return Err(AuthError::Cancelled),
                answer = self.client.poll_device_token(
                    &self.config.token_url,
                    &credentials,
                    device_code,
                    self.clock.now(),
                ) => answer,
            };

            match answer {
                Ok(DevicePollResponse::Token(tokens)) => {
                    tracing::info!(attempt, "device flow completed");
                    return Ok(tokens);
                }
                Ok(DevicePollResponse::Error { error, description }) => match error.as_str() {
                    "authorization_pending" => {
                        tracing::trace!(attempt, "authorization pending");
                    }
                    "slow_down" => {
                        interval += SLOW_DOWN_INCREMENT_SECS;
                        tracing::debug!(attempt, interval, "slow_down received");
                    }
                    "expired_token" => return Err(AuthError::AuthExpired),
                    "access_denied" => return Err(AuthError::AuthDenied),
                    other => {
                        tracing::warn!(
                            attempt,
                            error = other,
                            description = description.as_deref().unwrap_or(""),
                            "unrecognized device flow error, continuing"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "device flow poll failed, continuing");
                }
            }
        }
    }

    /// Run the whole flow for `owner_key`: request a code, show it through
    /// `on_ticket`, poll, look up the GitHub identity and store the
    /// credential.
    pub async fn complete_auth<T>(
        &self,
        owner_key: &str,
        on_ticket: T,
        options: PollOptions,
    ) -> Result<DeviceAuthResult>
    where
        T: FnOnce(&DeviceCodeTicket) + Send,
    {
        let ticket = self.request_device_code().await?;
        on_ticket(&ticket);

        let options = PollOptions {
            deadline: Some(
                options
                    .deadline
                    .map_or(ticket.expires_at, |d| d.min(ticket.expires_at)),
            ),
            ..options
        };
        let tokens = self
            .poll_for_token(
                &ticket.device_code,
                ticket.poll_interval_secs,
                &options,
                |_| ControlFlow::Continue(()),
            )
            .await?;

        let identity = self
            .client
            .fetch_github_user(&self.config.userinfo_url, &tokens.access_token)
            .await?;

        let (credential, outcome) = self
            .credentials
            .upsert_active(
                owner_key,
                NewCredential {
                    provider: PROVIDER.to_string(),
                    provider_user_id: identity.id,
                    username: identity.login.clone(),
                    access_token: tokens.access_token.clone(),
                    refresh_token: tokens.refresh_token.clone(),
                    token_type: tokens.token_type.clone(),
                    scope: tokens.scope.clone(),
                    expires_at: tokens.expires_at,
                },
                self.clock.now().timestamp(),
            )
            .await?;
        tracing::info!(owner = owner_key, login = %identity.login, ?outcome, "github account linked");

        Ok(DeviceAuthResult {
            tokens,
            identity,
            credential,
        })
    }

    /// The owner's active credential, if any.
    pub async fn status(&self, owner_key: &str) -> Result<Option<GitCredential>> {
        Ok(self.credentials.get_active(owner_key).await?)
    }

    /// Deactivate the owner's credential. Returns whether one was active.
    pub async fn logout(&self, owner_key: &str) -> Result<bool> {
        let changed = self
            .credentials
            .deactivate(owner_key, self.clock.now().timestamp())
            .await?;
        tracing::info!(owner = owner_key, changed, "github credential deactivated");
        Ok(changed > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use keyward_store::Database;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::clock::ManualClock;

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    async fn engine(server: &MockServer) -> (DeviceFlowEngine, Arc<ManualClock>) {
        let config = GitHubProviderConfig {
            client_id: Some("cid".to_string()),
            client_secret: None,
            scope: "repo".to_string(),
            device_code_url: format!("{}/login/device/code", server.uri()),
            token_url: format!("{}/login/oauth/access_token", server.uri()),
            userinfo_url: format!("{}/user", server.uri()),
        };
        let clock = Arc::new(ManualClock::new(start()));
        let store = CredentialStore::new(Database::open_in_memory_migrated().await.unwrap());
        let engine = DeviceFlowEngine::new(config, ProviderClient::new(), store, clock.clone());
        (engine, clock)
    }

    async fn mount_poll_answers(server: &MockServer, answers: &[serde_json::Value]) {
        // Earlier mounts take priority; each answer is served once.
        for answer in answers {
            Mock::given(method("POST"))
                .and(path("/login/oauth/access_token"))
                .respond_with(ResponseTemplate::new(200).set_body_json(answer.clone()))
                .up_to_n_times(1)
                .mount(server)
                .await;
        }
    }

    #[tokio::test]
    async fn slow_down_increases_interval_by_five_each_time() {
        let server = MockServer::start().await;
        mount_poll_answers(
            &server,
            &[
                json!({ "error": "slow_down" }),
                json!({ "error": "slow_down" }),
                json!({ "access_token": "tok" }),
            ],
        )
        .await;
        let (engine, clock) = engine(&server).await;

        let mut seen = Vec::new();
        let tokens = engine
            .poll_for_token("dc", 5, &PollOptions::default(), |p| {
                seen.push(p.interval_secs);
                ControlFlow::Continue(())
            })
            .await
            .unwrap();

        assert_eq!(tokens.access_token, "tok");
        assert_eq!(seen, vec![5, 10, 15]);
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(15)
            ]
        );
    }

    #[tokio::test]
    async fn zero_interval_still_waits_between_requests() {
        let server = MockServer::start().await;
        mount_poll_answers(
            &server,
            &[
                json!({ "error": "authorization_pending" }),
                json!({ "access_token": "tok" }),
            ],
        )
        .await;
        let (engine, clock) = engine(&server).await;

        engine
            .poll_for_token("dc", 0, &PollOptions::default(), |_| ControlFlow::Continue(()))
            .await
            .unwrap();
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(1)]
        );
    }

    #[tokio::test]
    async fn access_denied_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "error": "access_denied" })),
            )
            .expect(1)
            .mount(&server)
            .await;
        let (engine, _) = engine(&server).await;

        let err = engine
            .poll_for_token("dc", 1, &PollOptions::default(), |_| ControlFlow::Continue(()))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AuthDenied));
    }

    #[tokio::test]
    async fn expired_token_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({ "error": "expired_token" })),
            )
            .expect(1)
            .mount(&server)
            .await;
        let (engine, _) = engine(&server).await;

        let err = engine
            .poll_for_token("dc", 1, &PollOptions::default(), |_| ControlFlow::Continue(()))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AuthExpired));
    }

    #[tokio::test]
    async fn unknown_errors_keep_polling() {
        let server = MockServer::start().await;
        mount_poll_answers(
            &server,
            &[
                json!({ "error": "temporarily_unavailable" }),
                json!({ "access_token": "tok" }),
            ],
        )
        .await;
        let (engine, _) = engine(&server).await;

        let tokens = engine
            .poll_for_token("dc", 1, &PollOptions::default(), |_| ControlFlow::Continue(()))
            .await
            .unwrap();
        assert_eq!(tokens.access_token, "tok");
    }

    #[tokio::test]
    async fn deadline_expires_while_pending() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "error": "authorization_pending" })),
            )
            .mount(&server)
            .await;
        let (engine, _) = engine(&server).await;

        let options = PollOptions::default().deadline(start() + chrono::Duration::seconds(12));
        let err = engine
            .poll_for_token("dc", 5, &options, |_| ControlFlow::Continue(()))
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::AuthExpired));
        // Requests at t+5 and t+10; the third wake-up at t+15 is past the deadline.
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn max_attempts_bounds_polling() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "error": "authorization_pending" })),
            )
            .mount(&server)
            .await;
        let (engine, _) = engine(&server).await;

        let err = engine
            .poll_for_token(
                "dc",
                1,
                &PollOptions::default().max_attempts(3),
                |_| ControlFlow::Continue(()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::PollLimitExceeded { attempts: 3 }));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn on_poll_break_cancels_before_request() {
        let server = MockServer::start().await;
        let (engine, _) = engine(&server).await;

        let err = engine
            .poll_for_token("dc", 1, &PollOptions::default(), |_| ControlFlow::Break(()))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_token_stops_polling() {
        let server = MockServer::start().await;
        let (engine, _) = engine(&server).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = engine
            .poll_for_token(
                "dc",
                1,
                &PollOptions::with_cancel(cancel),
                |_| ControlFlow::Continue(()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Cancelled));
    }

    #[tokio::test]
    async fn missing_client_id_is_configuration_error() {
        let server = MockServer::start().await;
        let store = CredentialStore::new(Database::open_in_memory_migrated().await.unwrap());
        let engine = DeviceFlowEngine::new(
            GitHubProviderConfig {
                device_code_url: server.uri(),
                ..GitHubProviderConfig::default()
            },
            ProviderClient::new(),
            store,
            Arc::new(ManualClock::new(start())),
        );

        let err = engine.request_device_code().await.unwrap_err();
        assert!(matches!(err, AuthError::Configuration { .. }));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn complete_auth_stores_and_updates_credential() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login/device/code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "device_code": "dc",
                "user_code": "ABCD-1234",
                "verification_uri": "https://github.com/login/device",
                "expires_in": 900,
                "interval": 5
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/login/oauth/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "gho_abc",
                "token_type": "bearer",
                "scope": "repo"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "id": 7, "login": "octocat" })),
            )
            .mount(&server)
            .await;
        let (engine, _) = engine(&server).await;

        let mut shown = None;
        let first = engine
            .complete_auth("user-1", |t| shown = Some(t.user_code.clone()), PollOptions::default())
            .await
            .unwrap();
        assert_eq!(shown.as_deref(), Some("ABCD-1234"));
        assert_eq!(first.identity.login, "octocat");
        assert_eq!(first.credential.access_token, "gho_abc");

        let second = engine
            .complete_auth("user-1", |_| {}, PollOptions::default())
            .await
            .unwrap();
        assert_eq!(first.credential.id, second.credential.id);

        let status = engine.status("user-1").await.unwrap().unwrap();
        assert_eq!(status.username, "octocat");
        assert!(engine.logout("user-1").await.unwrap());
        assert!(engine.status("user-1").await.unwrap().is_none());
        assert!(!engine.logout("user-1").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_completions_for_one_owner_keep_one_active_credential() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login/device/code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "device_code": "dc",
                "user_code": "ABCD-1234",
                "verification_uri": "https://github.com/login/device",
                "expires_in": 900,
                "interval": 5
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/login/oauth/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "gho_abc",
                "token_type": "bearer",
                "scope": "repo"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "id": 7, "login": "octocat" })),
            )
            .mount(&server)
            .await;
        let (engine, clock) = engine(&server).await;

        let (a, b) = tokio::join!(
            engine.complete_auth("u1", |_| {}, PollOptions::default()),
            engine.complete_auth("u1", |_| {}, PollOptions::default()),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.credential.id, b.credential.id);

        let active = engine.status("u1").await.unwrap().unwrap();
        assert_eq!(active.id, a.credential.id);
        assert!(active.created_at <= clock.now().timestamp());
        assert!(engine.logout("u1").await.unwrap());
        assert!(engine.status("u1").await.unwrap().is_none());
    }
}
