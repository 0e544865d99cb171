//! Authorization Code + PKCE client provider for one `(endpoint, owner)`.
//!
//! A [`PkceProvider`] keeps no protocol state of its own beyond the current
//! `state` value: verifiers, client registrations and tokens live in the
//! session repository, keyed by `state` while an attempt is in flight and
//! by `(endpoint_id, owner_key)` afterwards.
//!
//! Every `redirect_to_authorization` rotates `state`. The in-flight session
//! row is re-keyed to the new value, so a URL from an earlier attempt can no
//! longer be redeemed.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use keyward_store::{CacheLayer, OAuthSessionRecord, SessionRepository};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::OnceCell;
use url::Url;

use crate::client::{ExchangeRequest, ProviderClient};
use crate::clock::Clock;
use crate::config::EndpointConfig;
use crate::error::{AuthError, Result};
use crate::pkce;
use crate::types::{AuthorizationStart, ClientInformation, ClientMetadata, OwnerKey, TokenSet};

/// Invoked with the final authorization URL, `state` included.
pub type RedirectHandler = Arc<dyn Fn(&Url) + Send + Sync>;

/// Session rows read through the provider cache.
pub type SessionCache = CacheLayer<Option<OAuthSessionRecord>>;

/// What `invalidate_credentials` was asked to drop.
///
/// Every scope currently removes all persisted data for the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationScope {
    All,
    Client,
    Tokens,
    Verifier,
}

impl fmt::Display for InvalidationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::All => "all",
            Self::Client => "client",
            Self::Tokens => "tokens",
            Self::Verifier => "verifier",
        })
    }
}

/// The capability set an OAuth client exposes to an authorization driver.
#[async_trait]
pub trait OAuthClientProvider: Send + Sync {
    fn redirect_url(&self) -> &str;

    fn client_metadata(&self) -> ClientMetadata;

    /// The current `state`, generated on first use.
    fn state(&self) -> Result<String>;

    async fn client_information(&self) -> Result<Option<ClientInformation>>;

    async fn save_client_information(&self, info: &ClientInformation) -> Result<()>;

    async fn tokens(&self) -> Result<Option<TokenSet>>;

    /// Store tokens from a completed exchange and consume the current state.
    async fn save_tokens(&self, tokens: &TokenSet) -> Result<()>;

    /// Rotate `state`, inject it into `authorization_url` and hand the URL
    /// to the redirect handler.
    async fn redirect_to_authorization(&self, authorization_url: Url) -> Result<()>;

    async fn save_code_verifier(&self, verifier: &str) -> Result<()>;

    /// The verifier saved for the current `state`.
    ///
    /// # Errors
    ///
    /// [`AuthError::Unauthorized`] when no live session matches the state.
    async fn code_verifier(&self) -> Result<String>;

    async fn invalidate_credentials(&self, scope: InvalidationScope) -> Result<()>;
}

/// Construction-time settings shared by every provider of a deployment.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub redirect_url: String,
    /// How long a `state` stays redeemable.
    pub session_ttl: Duration,
    /// Sent as `client_name` during dynamic registration.
    pub client_name: String,
}

impl ProviderSettings {
    pub fn new(redirect_url: impl Into<String>) -> Self {
        Self {
            redirect_url: redirect_url.into(),
            session_ttl: Duration::from_secs(600),
            client_name: "keyward".to_string(),
        }
    }

    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }
}

/// Authorization and token URLs, from configuration or discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub authorization_url: String,
    pub token_url: String,
    pub registration_url: Option<String>,
}

/// Configured authorization/token URLs, else RFC 8414 discovery from the
/// endpoint's issuer.
pub async fn resolve_endpoint(
    client: &ProviderClient,
    endpoint: &EndpointConfig,
) -> Result<ResolvedEndpoint> {
    if let (Some(authorization_url), Some(token_url)) =
        (&endpoint.authorization_url, &endpoint.token_url)
    {
        return Ok(ResolvedEndpoint {
            authorization_url: authorization_url.clone(),
            token_url: token_url.clone(),
            registration_url: endpoint.registration_url.clone(),
        });
    }
    let issuer = endpoint.issuer.as_deref().ok_or_else(|| {
        AuthError::config(format!(
            "endpoint {:?} has neither URLs nor an issuer",
            endpoint.id
        ))
    })?;
    let metadata = client.discover(issuer).await?;
    tracing::debug!(endpoint_id = %endpoint.id, "authorization server discovered");
    Ok(ResolvedEndpoint {
        authorization_url: metadata.authorization_endpoint,
        token_url: metadata.token_endpoint,
        registration_url: endpoint
            .registration_url
            .clone()
            .or(metadata.registration_endpoint),
    })
}

pub fn new_session_cache() -> SessionCache {
    CacheLayer::<Option<OAuthSessionRecord>>::builder("oauth_sessions").build()
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct PkceProvider {
    endpoint: EndpointConfig,
    owner: OwnerKey,
    sessions: Arc<dyn SessionRepository>,
    client: ProviderClient,
    clock: Arc<dyn Clock>,
    settings: ProviderSettings,
    current_state: Mutex<Option<String>>,
    cache: SessionCache,
    redirect: RedirectHandler,
    resolved: OnceCell<ResolvedEndpoint>,
}

impl PkceProvider {
    pub fn new(
        endpoint: EndpointConfig,
        owner: OwnerKey,
        sessions: Arc<dyn SessionRepository>,
        client: ProviderClient,
        clock: Arc<dyn Clock>,
        settings: ProviderSettings,
    ) -> Self {
        Self {
            endpoint,
            owner,
            sessions,
            client,
            clock,
            settings,
            current_state: Mutex::new(None),
            cache: new_session_cache(),
            redirect: Arc::new(|url: &Url| {
                tracing::info!(host = url.host_str().unwrap_or(""), "authorization redirect ready");
            }),
            resolved: OnceCell::new(),
        }
    }

    /// Share a session cache with other providers over the same repository,
    /// so a write through one instance is never hidden by another's cache.
    pub fn with_cache(mut self, cache: SessionCache) -> Self {
        self.cache = cache;
        self
    }

    /// Skip discovery with URLs resolved elsewhere.
    pub fn with_resolved(mut self, resolved: ResolvedEndpoint) -> Self {
        self.resolved = OnceCell::new_with(Some(resolved));
        self
    }

    pub fn with_redirect_handler(mut self, handler: RedirectHandler) -> Self {
        self.redirect = handler;
        self
    }

    /// Bind to the `state` an inbound callback carried.
    pub fn for_state(self, state: impl Into<String>) -> Self {
        *self.state_slot() = Some(state.into());
        self
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    pub fn owner(&self) -> &OwnerKey {
        &self.owner
    }

    pub fn current_state(&self) -> Option<String> {
        self.state_slot().clone()
    }

    /// Run one authorization attempt up to the redirect.
    pub async fn authorize(&self) -> Result<AuthorizationStart> {
        let client = self.ensure_client_information().await?;
        let endpoint = self.resolve_endpoint().await?;

        let verifier = pkce::generate_code_verifier()?;
        let challenge = pkce::code_challenge(&verifier);
        self.save_code_verifier(&verifier).await?;

        let mut url = Url::parse(&endpoint.authorization_url)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", &client.client_id);
            query.append_pair("redirect_uri", &self.settings.redirect_url);
            query.append_pair("code_challenge", &challenge);
            query.append_pair("code_challenge_method", "S256");
            if let Some(scope) = self.endpoint.scope.as_deref() {
                query.append_pair("scope", scope);
            }
            if let Some(resource) = self.endpoint.resource.as_deref() {
                query.append_pair("resource", resource);
            }
        }

        let url = self.prepare_redirect(url).await?;
        (self.redirect)(&url);
        let state = self
            .current_state()
            .ok_or_else(|| AuthError::unauthorized("state lost during redirect"))?;
        Ok(AuthorizationStart {
            state,
            authorization_url: url.to_string(),
        })
    }

    /// Redeem `code` with the verifier of the current state.
    ///
    /// The state is claimed before the token request and released again if
    /// the exchange fails, so it is redeemed at most once.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenSet> {
        let verifier = self.code_verifier().await?;
        let state = self
            .current_state()
            .ok_or_else(|| AuthError::unauthorized("no authorization in progress"))?;

        let claimed_at = self.now_secs();
        let claimed = self.sessions.claim_state(&state, claimed_at).await?;
        self.cache.invalidate_all();
        if !claimed {
            tracing::info!(endpoint_id = %self.endpoint.id, owner = %self.owner, "state already redeemed");
            return Err(AuthError::InvalidState);
        }

        let tokens = match self.redeem(code, &verifier).await {
            Ok(tokens) => tokens,
            Err(e) => {
                if let Err(release) = self.sessions.release_claim(&state, claimed_at).await {
                    tracing::warn!(endpoint_id = %self.endpoint.id, error = %release, "failed to release state claim");
                }
                self.cache.invalidate_all();
                return Err(e);
            }
        };
        self.save_tokens(&tokens).await?;
        Ok(tokens)
    }

    /// A usable access token, refreshed first when expired.
    pub async fn valid_access_token(&self) -> Result<String> {
        let tokens = self
            .tokens()
            .await?
            .ok_or_else(|| AuthError::unauthorized("endpoint is not authorized"))?;
        if !tokens.is_expired(self.clock.now()) {
            return Ok(tokens.access_token);
        }

        let refresh_token = tokens
            .refresh_token
            .as_deref()
            .ok_or_else(|| AuthError::unauthorized("access token expired"))?;
        let client = self.resolve_client().await?;
        let endpoint = self.resolve_endpoint().await?;

        tracing::debug!(endpoint_id = %self.endpoint.id, owner = %self.owner, "refreshing tokens");
        let refreshed = self
            .client
            .refresh_token(&endpoint.token_url, &client, refresh_token, self.clock.now())
            .await?;
        self.store_tokens(&refreshed, false).await?;
        Ok(refreshed.access_token)
    }

    /// Configured URLs, or discovery from the issuer. Cached per instance.
    pub async fn resolve_endpoint(&self) -> Result<&ResolvedEndpoint> {
        self.resolved
            .get_or_try_init(|| resolve_endpoint(&self.client, &self.endpoint))
            .await
    }

    // -- internals ----------------------------------------------------------

    fn state_slot(&self) -> MutexGuard<'_, Option<String>> {
        self.current_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn owns(&self, record: &OAuthSessionRecord) -> bool {
        record.endpoint_id == self.endpoint.id && record.owner_key.as_deref() == self.owner.as_column()
    }

    fn now_secs(&self) -> i64 {
        self.clock.now().timestamp()
    }

    fn state_expiry(&self, now: i64) -> i64 {
        let ttl = i64::try_from(self.settings.session_ttl.as_secs()).unwrap_or(i64::MAX);
        now.saturating_add(ttl)
    }

    fn owner_cache_key(&self) -> String {
        format!("owner:{}:{}", self.endpoint.id, self.owner)
    }

    async fn load_by_state(&self, state: &str) -> Result<Option<OAuthSessionRecord>> {
        let record = self
            .cache
            .get_or_try_insert_with(&format!("state:{state}"), || {
                self.sessions.get_by_state(state)
            })
            .await?;
        Ok(record.filter(|r| self.owns(r)))
    }

    async fn load_owner_row(&self) -> Result<Option<OAuthSessionRecord>> {
        let record = self
            .cache
            .get_or_try_insert_with(&self.owner_cache_key(), || {
                self.sessions
                    .get_by_owner(&self.endpoint.id, self.owner.as_column())
            })
            .await?;
        Ok(record)
    }

    async fn redeem(&self, code: &str, verifier: &str) -> Result<TokenSet> {
        let client = self.resolve_client().await?;
        let endpoint = self.resolve_endpoint().await?;
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

    /// The current state's row, consumed or not.
    async fn current_row(&self) -> Result<Option<OAuthSessionRecord>> {
        let Some(state) = self.current_state() else {
            return Ok(None);
        };
        self.load_by_state(&state).await
    }

    /// The current state's row if it is still an unconsumed attempt.
    async fn pending_row(&self) -> Result<Option<OAuthSessionRecord>> {
        let Some(state) = self.current_state() else {
            return Ok(None);
        };
        Ok(self
            .load_by_state(&state)
            .await?
            .filter(|r| !r.is_consumed()))
    }

    /// The current state, rotated first if a callback already redeemed it.
    async fn usable_state(&self) -> Result<String> {
        let state = self.state()?;
        match self.load_by_state(&state).await? {
            Some(row) if row.is_consumed() => {
                let fresh = pkce::generate_state()?;
                *self.state_slot() = Some(fresh.clone());
                Ok(fresh)
            }
            _ => Ok(state),
        }
    }

    /// A fresh row for `state` that carries the owner's registration and
    /// tokens forward, replacing every earlier row of the owner.
    async fn superseding_row(&self, state: &str) -> Result<OAuthSessionRecord> {
        let now = self.now_secs();
        let mut record = OAuthSessionRecord::pending(
            state,
            self.endpoint.id.clone(),
            self.owner.as_column().map(str::to_string),
            now,
            self.state_expiry(now),
        );
        if let Some(previous) = self.load_owner_row().await? {
            record.client_info = previous.client_info;
            record.tokens = previous.tokens;
        }
        Ok(record)
    }

    async fn write(&self, record: &OAuthSessionRecord) -> Result<()> {
        self.sessions.put(record).await?;
        self.cache.invalidate_all();
        Ok(())
    }

    async fn replace(&self, record: &OAuthSessionRecord) -> Result<()> {
        self.sessions.replace_for_owner(record).await?;
        self.cache.invalidate_all();
        Ok(())
    }

    /// Rotate `state` and return `url` carrying the new value.
    async fn prepare_redirect(&self, mut url: Url) -> Result<Url> {
        let new_state = pkce::generate_state()?;
        let previous = self.state_slot().replace(new_state.clone());

        let now = self.now_secs();
        let expires_at = self.state_expiry(now);
        let mut rekeyed = false;
        if let Some(old_state) = previous
            && let Some(row) = self.load_by_state(&old_state).await?
            && !row.is_consumed()
        {
            rekeyed = self
                .sessions
                .rekey_state(&old_state, &new_state, expires_at)
                .await?;
            self.cache.invalidate_all();
        }
        if !rekeyed {
            let record = self.superseding_row(&new_state).await?;
            self.replace(&record).await?;
        }

        let retained: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| key != "state")
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(retained)
            .append_pair("state", &new_state);

        tracing::info!(endpoint_id = %self.endpoint.id, owner = %self.owner, "authorization started");
        Ok(url)
    }

    /// Stored registration, else configured credentials.
    async fn resolve_client(&self) -> Result<ClientInformation> {
        if let Some(info) = self.client_information().await? {
            return Ok(info);
        }
        self.endpoint
            .credentials()
            .map(ClientInformation::from)
            .ok_or_else(|| {
                AuthError::config(format!("no client id for endpoint {:?}", self.endpoint.id))
            })
    }

    /// Stored registration, configured credentials, or a new dynamic
    /// registration, in that order.
    async fn ensure_client_information(&self) -> Result<ClientInformation> {
        if let Some(info) = self.client_information().await? {
            return Ok(info);
        }
        if let Some(credentials) = self.endpoint.credentials() {
            return Ok(credentials.into());
        }
        let endpoint = self.resolve_endpoint().await?;
        let registration_url = endpoint.registration_url.as_deref().ok_or_else(|| {
            AuthError::config(format!(
                "endpoint {:?} has no client id and no registration endpoint",
                self.endpoint.id
            ))
        })?;
        let info = self
            .client
            .register_client(registration_url, &self.client_metadata())
            .await?;
        tracing::info!(endpoint_id = %self.endpoint.id, "client registered dynamically");
        self.save_client_information(&info).await?;
        Ok(info)
    }

    /// Write tokens to the current state's row (consuming it when
    /// `consume` is set), else to the owner's latest row, else to a new row.
    async fn store_tokens(&self, tokens: &TokenSet, consume: bool) -> Result<()> {
        let json = encode(tokens)?;
        let now = self.now_secs();

        let target = match self.current_row().await? {
            Some(row) if consume => Some(row),
            _ => self.load_owner_row().await?,
        };
        match target {
            Some(mut row) => {
                row.tokens = json;
                if consume && row.consumed_at.is_none() {
                    row.consumed_at = Some(now);
                }
                self.write(&row).await?;
            }
            None => {
                let mut row = self.superseding_row(&self.usable_state().await?).await?;
                row.tokens = json;
                row.consumed_at = Some(now);
                self.replace(&row).await?;
            }
        }
        tracing::debug!(endpoint_id = %self.endpoint.id, owner = %self.owner, "tokens saved");
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(column: Option<&str>) -> Result<Option<T>> {
    column
        .map(|raw| serde_json::from_str::<T>(raw))
        .transpose()
        .map_err(AuthError::from)
}

fn encode<T: Serialize>(value: &T) -> Result<Option<String>> {
    Ok(Some(serde_json::to_string(value)?))
}

#[async_trait]
impl OAuthClientProvider for PkceProvider {
    fn redirect_url(&self) -> &str {
        &self.settings.redirect_url
    }

    fn client_metadata(&self) -> ClientMetadata {
        ClientMetadata {
            client_name: self.settings.client_name.clone(),
            redirect_uris: vec![self.settings.redirect_url.clone()],
            grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
            response_types: vec!["code".to_string()],
            token_endpoint_auth_method: if self.endpoint.client_secret.is_some() {
                "client_secret_post".to_string()
            } else {
                "none".to_string()
            },
            scope: self.endpoint.scope.clone(),
        }
    }

    fn state(&self) -> Result<String> {
        let mut slot = self.state_slot();
        if let Some(state) = slot.as_ref() {
            return Ok(state.clone());
        }
        let state = pkce::generate_state()?;
        *slot = Some(state.clone());
        Ok(state)
    }

    async fn client_information(&self) -> Result<Option<ClientInformation>> {
        let row = self.load_owner_row().await?;
        decode(row.as_ref().and_then(|r| r.client_info.as_deref()))
    }

    async fn save_client_information(&self, info: &ClientInformation) -> Result<()> {
        let client_info = encode(info)?;
        match self.load_owner_row().await? {
            Some(mut row) => {
                row.client_info = client_info;
                self.write(&row).await
            }
            None => {
                let mut row = self.superseding_row(&self.usable_state().await?).await?;
                row.client_info = client_info;
                self.replace(&row).await
            }
        }
    }

    async fn tokens(&self) -> Result<Option<TokenSet>> {
        let row = self.load_owner_row().await?;
        decode(row.as_ref().and_then(|r| r.tokens.as_deref()))
    }

    async fn save_tokens(&self, tokens: &TokenSet) -> Result<()> {
        self.store_tokens(tokens, true).await
    }

    async fn redirect_to_authorization(&self, authorization_url: Url) -> Result<()> {
        let url = self.prepare_redirect(authorization_url).await?;
        (self.redirect)(&url);
        Ok(())
    }

    async fn save_code_verifier(&self, verifier: &str) -> Result<()> {
        match self.pending_row().await? {
            Some(mut row) => {
                row.code_verifier = Some(verifier.to_string());
                self.write(&row).await
            }
            None => {
                let mut row = self.superseding_row(&self.usable_state().await?).await?;
                row.code_verifier = Some(verifier.to_string());
                self.replace(&row).await
            }
        }
    }

    async fn code_verifier(&self) -> Result<String> {
        let state = self
            .current_state()
            .ok_or_else(|| AuthError::unauthorized("no authorization in progress"))?;
        let row = self
            .load_by_state(&state)
            .await?
            .ok_or_else(|| AuthError::unauthorized("no session for current state"))?;
        if row.is_consumed() {
            return Err(AuthError::unauthorized("state already used"));
        }
        if row.is_expired(self.now_secs()) {
            return Err(AuthError::unauthorized("session expired"));
        }
        row.code_verifier
            .ok_or_else(|| AuthError::unauthorized("no code verifier saved"))
    }

    async fn invalidate_credentials(&self, scope: InvalidationScope) -> Result<()> {
        let removed = self
            .sessions
            .delete_by_owner(&self.endpoint.id, self.owner.as_column())
            .await?;
        self.state_slot().take();
        self.cache.invalidate_all();
        tracing::info!(
            endpoint_id = %self.endpoint.id,
            owner = %self.owner,
            %scope,
            removed,
            "credentials invalidated"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
