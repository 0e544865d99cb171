//! Many end-users, one endpoint definition.
//!
//! [`PerUserSessionManager`] multiplexes the session store by user id.
//! Authorization starts through a [`PkceProvider`] scoped to
//! `(endpoint, User(id))`, but the callback-side exchange runs here, looked
//! up by `state` alone, because a single provider instance only ever
//! speaks for one owner.

use std::sync::Arc;

use async_trait::async_trait;
use keyward_store::{OAuthSessionRecord, SessionRepository};
use serde::Serialize;
use tokio::sync::OnceCell;

use crate::callback::{CodeExchanger, PendingCallback};
use crate::client::{ExchangeRequest, ProviderClient};
use crate::clock::Clock;
use crate::config::EndpointConfig;
use crate::error::{AuthError, Result};
use crate::provider::{
    OAuthClientProvider, PkceProvider, ProviderSettings, ResolvedEndpoint, SessionCache,
    new_session_cache, resolve_endpoint,
};
use crate::types::{AuthorizationStart, ClientInformation, OwnerKey, TokenSet};

/// A user's session row, decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSession {
    pub state: String,
    pub endpoint_id: String,
    pub user_id: String,
    #[serde(skip)]
    pub code_verifier: Option<String>,
    #[serde(skip)]
    pub tokens: Option<TokenSet>,
    pub created_at: i64,
    pub expires_at: i64,
    pub consumed: bool,
}

impl UserSession {
    fn from_record(record: OAuthSessionRecord) -> Result<Option<Self>> {
        let Some(user_id) = record.owner_key else {
            return Ok(None);
        };
        let tokens = record
            .tokens
            .as_deref()
            .map(|raw| serde_json::from_str::<TokenSet>(raw))
            .transpose()?;
        Ok(Some(Self {
            state: record.state,
            endpoint_id: record.endpoint_id,
            user_id,
            code_verifier: record.code_verifier,
            tokens,
            created_at: record.created_at,
            expires_at: record.expires_at,
            consumed: record.consumed_at.is_some(),
        }))
    }
}

pub struct PerUserSessionManager {
    endpoint: EndpointConfig,
    sessions: Arc<dyn SessionRepository>,
    client: ProviderClient,
    clock: Arc<dyn Clock>,
    settings: ProviderSettings,
    cache: SessionCache,
    resolved: OnceCell<ResolvedEndpoint>,
}

impl PerUserSessionManager {
    pub fn new(
        endpoint: EndpointConfig,
        sessions: Arc<dyn SessionRepository>,
        client: ProviderClient,
        clock: Arc<dyn Clock>,
        settings: ProviderSettings,
    ) -> Self {
        Self {
            endpoint,
            sessions,
            client,
            clock,
            settings,
            cache: new_session_cache(),
            resolved: OnceCell::new(),
        }
    }

    /// Share the session cache used by other providers of this repository.
    pub fn with_cache(mut self, cache: SessionCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    /// A provider speaking for `user_id` on this endpoint.
    pub fn provider_for_user(&self, user_id: &str) -> PkceProvider {
        let provider = PkceProvider::new(
            self.endpoint.clone(),
            OwnerKey::User(user_id.to_string()),
            self.sessions.clone(),
            self.client.clone(),
            self.clock.clone(),
            self.settings.clone(),
        )
        .with_cache(self.cache.clone());
        match self.resolved.get() {
            Some(resolved) => provider.with_resolved(resolved.clone()),
            None => provider,
        }
    }

    pub async fn start_authorization(&self, user_id: &str) -> Result<AuthorizationStart> {
        if user_id.trim().is_empty() {
            return Err(AuthError::InvalidRequest);
        }
        self.resolve().await?;
        let start = self.provider_for_user(user_id).authorize().await?;
        tracing::info!(endpoint_id = %self.endpoint.id, user_id, "user authorization started");
        Ok(start)
    }

    /// The live session `state` identifies on this endpoint.
    ///
    /// Expired rows, rows of other endpoints and the shared client's rows
    /// read as `None`. Consumed sessions are still returned.
    pub async fn get_session_by_state(&self, state: &str) -> Result<Option<UserSession>> {
        let Some(record) = self.sessions.get_by_state(state).await? else {
            return Ok(None);
        };
        if record.endpoint_id != self.endpoint.id {
            return Ok(None);
        }
        if record.is_expired(self.clock.now().timestamp()) {
            tracing::debug!(endpoint_id = %self.endpoint.id, "session expired");
            return Ok(None);
        }
        UserSession::from_record(record)
    }

    /// Attach tokens to the session for `state` and mark it consumed.
    pub async fn save_tokens(&self, state: &str, tokens: &TokenSet) -> Result<()> {
        let mut record = self
            .sessions
            .get_by_state(state)
            .await?
            .filter(|r| r.endpoint_id == self.endpoint.id && r.owner_key.is_some())
            .ok_or(AuthError::InvalidState)?;
        record.tokens = Some(serde_json::to_string(tokens)?);
        if record.consumed_at.is_none() {
            record.consumed_at = Some(self.clock.now().timestamp());
        }
        self.sessions.put(&record).await?;
        self.cache.invalidate_all();
        Ok(())
    }

    /// Redeem `code` for the session `state` identifies.
    ///
    /// The state is claimed before the token request, so of two callbacks
    /// carrying it only one reaches the provider. A failed exchange
    /// releases the claim.
    pub async fn exchange_code(&self, state: &str, code: &str) -> Result<TokenSet> {
        let session = self
            .get_session_by_state(state)
            .await?
            .filter(|s| !s.consumed)
            .ok_or(AuthError::InvalidState)?;
        let verifier = session
            .code_verifier
            .clone()
            .ok_or_else(|| AuthError::unauthorized("no code verifier for session"))?;

        let claimed_at = self.clock.now().timestamp();
        let claimed = self.sessions.claim_state(state, claimed_at).await?;
        self.cache.invalidate_all();
        if !claimed {
            tracing::info!(endpoint_id = %self.endpoint.id, "state already redeemed");
            return Err(AuthError::InvalidState);
        }

        let tokens = match self.redeem(&session.user_id, &verifier, code).await {
            Ok(tokens) => tokens,
            Err(e) => {
                self.release_claim(state, claimed_at).await;
                return Err(e);
            }
        };
        self.save_tokens(state, &tokens).await?;
        tracing::info!(endpoint_id = %self.endpoint.id, user_id = %session.user_id, "user tokens stored");
        Ok(tokens)
    }

    pub async fn tokens_for_user(&self, user_id: &str) -> Result<Option<TokenSet>> {
        self.provider_for_user(user_id).tokens().await
    }

    /// Delete everything stored for `user_id`. Returns rows removed.
    pub async fn revoke_user(&self, user_id: &str) -> Result<u64> {
        let removed = self
            .sessions
            .delete_by_owner(&self.endpoint.id, Some(user_id))
            .await?;
        self.cache.invalidate_all();
        tracing::info!(endpoint_id = %self.endpoint.id, user_id, removed, "user revoked");
        Ok(removed)
    }

    /// Remove lapsed attempts that never completed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let removed = self
            .sessions
            .delete_expired(self.clock.now().timestamp())
            .await?;
        self.cache.invalidate_all();
        if removed > 0 {
            tracing::info!(removed, "expired sessions purged");
        }
        Ok(removed)
    }

    /// Every user session of this endpoint, newest first.
    pub async fn list_sessions(&self) -> Result<Vec<UserSession>> {
        let mut sessions = Vec::new();
        for record in self.sessions.list_by_endpoint(&self.endpoint.id).await? {
            if let Some(session) = UserSession::from_record(record)? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    async fn redeem(&self, user_id: &str, verifier: &str, code: &str) -> Result<TokenSet> {
        let client = self.client_for_user(user_id).await?;
        let endpoint = self.resolve().await?;
        self.client
            .exchange_authorization_code(
                ExchangeRequest {
                    token_url: &endpoint.token_url,
                    code,
                    redirect_uri: &self.settings.redirect_url,
                    client_id: &client.client_id,
                    client_secret: client.client_secret.as_deref(),
                    code_verifier: verifier,
                    resource: self.endpoint.resource.as_deref(),
                },
                self.clock.now(),
            )
            .await
    }

    async fn release_claim(&self, state: &str, claimed_at: i64) {
        if let Err(e) = self.sessions.release_claim(state, claimed_at).await {
            tracing::warn!(endpoint_id = %self.endpoint.id, error = %e, "failed to release state claim");
        }
        self.cache.invalidate_all();
    }

    async fn resolve(&self) -> Result<&ResolvedEndpoint> {
        self.resolved
            .get_or_try_init(|| resolve_endpoint(&self.client, &self.endpoint))
            .await
    }

    /// The user's stored registration, else the configured credentials.
    async fn client_for_user(&self, user_id: &str) -> Result<ClientInformation> {
        if let Some(info) = self.provider_for_user(user_id).client_information().await? {
            return Ok(info);
        }
        self.endpoint
            .credentials()
            .map(ClientInformation::from)
            .ok_or_else(|| {
                AuthError::config(format!("no client id for endpoint {:?}", self.endpoint.id))
            })
    }
}

#[async_trait]
impl CodeExchanger for PerUserSessionManager {
    async fn find_pending(&self, state: &str) -> Result<Option<PendingCallback>> {
        let pending = self
            .get_session_by_state(state)
            .await?
            .filter(|s| !s.consumed && s.code_verifier.is_some())
            .map(|s| PendingCallback {
                state: s.state,
                endpoint_id: s.endpoint_id,
                endpoint_name: self.endpoint.name.clone(),
            });
        Ok(pending)
    }

    async fn exchange(&self, pending: &PendingCallback, code: &str) -> Result<()> {
        self.exchange_code(&pending.state, code).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::DateTime;
    use keyward_store::{Database, SqliteSessionRepository};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::clock::ManualClock;

    async fn manager(base: &str) -> (PerUserSessionManager, Arc<ManualClock>) {
        let db = Database::open_in_memory_migrated().await.unwrap();
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let endpoint = EndpointConfig {
            id: "linear".to_string(),
            name: "Linear".to_string(),
            issuer: None,
            authorization_url: Some(format!("{base}/authorize")),
            token_url: Some(format!("{base}/token")),
            registration_url: None,
            client_id: Some("cid".to_string()),
            client_secret: None,
            scope: None,
            resource: None,
        };
        let manager = PerUserSessionManager::new(
            endpoint,
            Arc::new(SqliteSessionRepository::new(db)),
            ProviderClient::new(),
            clock.clone(),
            ProviderSettings::new("http://localhost:3000/oauth/user/callback"),
        );
        (manager, clock)
    }

    #[tokio::test]
    async fn start_authorization_creates_user_session() {
        let (manager, _) = manager("https://linear.example").await;
        let start = manager.start_authorization("u1").await.unwrap();

        let session = manager.get_session_by_state(&start.state).await.unwrap().unwrap();
        assert_eq!(session.user_id, "u1");
        assert!(!session.consumed);
        assert!(session.code_verifier.is_some());
        assert!(start.authorization_url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Foauth%2Fuser%2Fcallback"));
    }

    #[tokio::test]
    async fn empty_user_id_is_rejected() {
        let (manager, _) = manager("https://linear.example").await;
        assert!(matches!(
            manager.start_authorization(" ").await,
            Err(AuthError::InvalidRequest)
        ));
    }

    #[tokio::test]
    async fn expired_session_reads_as_absent() {
        let (manager, clock) = manager("https://linear.example").await;
        let start = manager.start_authorization("u1").await.unwrap();

        clock.advance(Duration::from_secs(601));
        assert!(manager.get_session_by_state(&start.state).await.unwrap().is_none());
        assert!(matches!(
            manager.exchange_code(&start.state, "code").await,
            Err(AuthError::InvalidState)
        ));
    }

    #[tokio::test]
    async fn exchange_stores_tokens_and_consumes_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("code=c1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "u1-token",
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;
        let (manager, _) = manager(&server.uri()).await;

        let start = manager.start_authorization("u1").await.unwrap();
        assert!(manager.find_pending(&start.state).await.unwrap().is_some());

        let tokens = manager.exchange_code(&start.state, "c1").await.unwrap();
        assert_eq!(tokens.access_token, "u1-token");
        assert_eq!(
            manager.tokens_for_user("u1").await.unwrap().unwrap().access_token,
            "u1-token"
        );

        let session = manager.get_session_by_state(&start.state).await.unwrap().unwrap();
        assert!(session.consumed);
        assert!(manager.find_pending(&start.state).await.unwrap().is_none());
        assert!(matches!(
            manager.exchange_code(&start.state, "c1").await,
            Err(AuthError::InvalidState)
        ));
    }

    #[tokio::test]
    async fn concurrent_exchanges_redeem_state_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "access_token": "u1-token" }))
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;
        let (manager, _) = manager(&server.uri()).await;
        let start = manager.start_authorization("u1").await.unwrap();

        let (a, b) = tokio::join!(
            manager.exchange_code(&start.state, "c1"),
            manager.exchange_code(&start.state, "c1"),
        );
        let (ok, rejected) = if a.is_ok() { (a, b) } else { (b, a) };
        assert_eq!(ok.unwrap().access_token, "u1-token");
        assert!(matches!(rejected, Err(AuthError::InvalidState)));
    }

    #[tokio::test]
    async fn failed_exchange_leaves_state_redeemable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({ "error": "invalid_grant" })),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "access_token": "u1-token" })),
            )
            .mount(&server)
            .await;
        let (manager, _) = manager(&server.uri()).await;
        let start = manager.start_authorization("u1").await.unwrap();

        assert!(manager.exchange_code(&start.state, "bad").await.is_err());
        assert!(manager.find_pending(&start.state).await.unwrap().is_some());

        let tokens = manager.exchange_code(&start.state, "good").await.unwrap();
        assert_eq!(tokens.access_token, "u1-token");
    }

    #[tokio::test]
    async fn revoke_removes_only_that_user() {
        let (manager, _) = manager("https://linear.example").await;
        manager.start_authorization("u1").await.unwrap();
        manager.start_authorization("u2").await.unwrap();

        assert_eq!(manager.revoke_user("u1").await.unwrap(), 1);
        assert_eq!(manager.revoke_user("u1").await.unwrap(), 0);

        let users: Vec<_> = manager
            .list_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.user_id)
            .collect();
        assert_eq!(users, vec!["u2"]);
    }

    #[tokio::test]
    async fn purge_drops_lapsed_attempts() {
        let (manager, clock) = manager("https://linear.example").await;
        manager.start_authorization("u1").await.unwrap();

        clock.advance(Duration::from_secs(700));
        assert_eq!(manager.purge_expired().await.unwrap(), 1);
        assert!(manager.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shared_rows_are_not_user_sessions() {
        let (manager, clock) = manager("https://linear.example").await;
        let now = clock.now().timestamp();
        manager
            .sessions
            .put(&OAuthSessionRecord::pending("shared-state", "linear", None, now, now + 600))
            .await
            .unwrap();

        assert!(manager.get_session_by_state("shared-state").await.unwrap().is_none());
    }
}
