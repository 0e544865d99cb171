//! Configured endpoints and the providers that serve them.
//!
//! [`EndpointRegistry`] is built once from [`AuthConfig`] and hands out a
//! shared-owner [`PkceProvider`] or the [`PerUserSessionManager`] for each
//! endpoint. Every provider it creates shares one session cache, so a write
//! through one instance is visible to the next lookup through another.
//!
//! The two callback routes are backed by [`SharedCallbacks`] and
//! [`UserCallbacks`], which resolve an inbound `state` to the endpoint and
//! owner that started the attempt.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use keyward_store::{OAuthSessionRecord, SessionRepository};
use tokio::sync::OnceCell;

use crate::callback::{CodeExchanger, PendingCallback};
use crate::client::ProviderClient;
use crate::clock::Clock;
use crate::config::{AuthConfig, EndpointConfig};
use crate::error::{AuthError, Result};
use crate::per_user::PerUserSessionManager;
use crate::provider::{
    OAuthClientProvider, PkceProvider, ProviderSettings, ResolvedEndpoint, SessionCache,
    new_session_cache, resolve_endpoint,
};
use crate::types::{AuthorizationStart, OwnerKey, TokenSet};

pub struct EndpointRegistry {
    endpoints: Vec<EndpointConfig>,
    sessions: Arc<dyn SessionRepository>,
    client: ProviderClient,
    clock: Arc<dyn Clock>,
    shared_settings: ProviderSettings,
    cache: SessionCache,
    resolved: HashMap<String, OnceCell<ResolvedEndpoint>>,
    per_user: HashMap<String, Arc<PerUserSessionManager>>,
}

impl EndpointRegistry {
    pub fn new(
        config: &AuthConfig,
        sessions: Arc<dyn SessionRepository>,
        client: ProviderClient,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = new_session_cache();
        let shared_settings =
            ProviderSettings::new(config.shared_redirect_url()).session_ttl(config.session_ttl());
        let user_settings =
            ProviderSettings::new(config.user_redirect_url()).session_ttl(config.session_ttl());

        let per_user = config
            .endpoints
            .iter()
            .map(|endpoint| {
                let manager = PerUserSessionManager::new(
                    endpoint.clone(),
                    sessions.clone(),
                    client.clone(),
                    clock.clone(),
                    user_settings.clone(),
                )
                .with_cache(cache.clone());
                (endpoint.id.clone(), Arc::new(manager))
            })
            .collect();
        let resolved = config
            .endpoints
            .iter()
            .map(|endpoint| (endpoint.id.clone(), OnceCell::new()))
            .collect();

        tracing::debug!(endpoints = config.endpoints.len(), "endpoint registry built");

        Self {
            endpoints: config.endpoints.clone(),
            sessions,
            client,
            clock,
            shared_settings,
            cache,
            resolved,
            per_user,
        }
    }

    pub fn endpoints(&self) -> &[EndpointConfig] {
        &self.endpoints
    }

    pub fn endpoint(&self, id: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.id == id)
    }

    /// The shared-owner provider for endpoint `id`.
    pub fn shared_provider(&self, id: &str) -> Option<PkceProvider> {
        let endpoint = self.endpoint(id)?;
        let provider = PkceProvider::new(
            endpoint.clone(),
            OwnerKey::Shared,
            self.sessions.clone(),
            self.client.clone(),
            self.clock.clone(),
            self.shared_settings.clone(),
        )
        .with_cache(self.cache.clone());
        match self.resolved.get(id).and_then(OnceCell::get) {
            Some(resolved) => Some(provider.with_resolved(resolved.clone())),
            None => Some(provider),
        }
    }

    pub fn per_user(&self, id: &str) -> Option<Arc<PerUserSessionManager>> {
        self.per_user.get(id).cloned()
    }

    /// Start a shared authorization attempt for endpoint `id`.
    pub async fn authorize_shared(&self, id: &str) -> Result<AuthorizationStart> {
        let endpoint = self
            .endpoint(id)
            .ok_or_else(|| AuthError::config(format!("unknown endpoint {id:?}")))?;
        if let Some(cell) = self.resolved.get(id) {
            cell.get_or_try_init(|| resolve_endpoint(&self.client, endpoint))
                .await?;
        }
        let provider = self
            .shared_provider(id)
            .ok_or_else(|| AuthError::config(format!("unknown endpoint {id:?}")))?;
        let start = provider.authorize().await?;
        tracing::info!(endpoint_id = id, "shared authorization started");
        Ok(start)
    }

    /// Tokens held by the shared owner of endpoint `id`.
    pub async fn shared_tokens(&self, id: &str) -> Result<Option<TokenSet>> {
        match self.shared_provider(id) {
            Some(provider) => provider.tokens().await,
            None => Ok(None),
        }
    }

    /// Drop sessions whose attempt lapsed. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let removed = self.sessions.delete_expired(self.clock.now().timestamp()).await?;
        self.cache.invalidate_all();
        if removed > 0 {
            tracing::info!(removed, "purged expired oauth sessions");
        }
        Ok(removed)
    }

    async fn shared_row(&self, state: &str) -> Result<Option<OAuthSessionRecord>> {
        let now = self.clock.now().timestamp();
        let row = self.sessions.get_by_state(state).await?.filter(|row| {
            row.owner_key.is_none()
                && !row.is_consumed()
                && !row.is_expired(now)
                && row.code_verifier.is_some()
        });
        Ok(row)
    }
}

// ---------------------------------------------------------------------------
// Callback exchangers
// ---------------------------------------------------------------------------

/// Redeems callbacks that arrive at the shared redirect URL.
pub struct SharedCallbacks(pub Arc<EndpointRegistry>);

#[async_trait]
impl CodeExchanger for SharedCallbacks {
    async fn find_pending(&self, state: &str) -> Result<Option<PendingCallback>> {
        let Some(row) = self.0.shared_row(state).await? else {
            return Ok(None);
        };
        let Some(endpoint) = self.0.endpoint(&row.endpoint_id) else {
            tracing::warn!(endpoint_id = %row.endpoint_id, "session for an unconfigured endpoint");
            return Ok(None);
        };
        Ok(Some(PendingCallback {
            state: row.state,
            endpoint_id: endpoint.id.clone(),
            endpoint_name: endpoint.name.clone(),
        }))
    }

    async fn exchange(&self, pending: &PendingCallback, code: &str) -> Result<()> {
        let provider = self
            .0
            .shared_provider(&pending.endpoint_id)
            .ok_or(AuthError::InvalidState)?
            .for_state(pending.state.clone());
        provider.exchange_code(code).await?;
        Ok(())
    }
}

/// Redeems callbacks that arrive at the per-user redirect URL.
pub struct UserCallbacks(pub Arc<EndpointRegistry>);

#[async_trait]
impl CodeExchanger for UserCallbacks {
    async fn find_pending(&self, state: &str) -> Result<Option<PendingCallback>> {
        let Some(row) = self.0.sessions.get_by_state(state).await? else {
            return Ok(None);
        };
        match self.0.per_user(&row.endpoint_id) {
            Some(manager) => manager.find_pending(state).await,
            None => Ok(None),
        }
    }

    async fn exchange(&self, pending: &PendingCallback, code: &str) -> Result<()> {
        let manager = self
            .0
            .per_user(&pending.endpoint_id)
            .ok_or(AuthError::InvalidState)?;
        manager.exchange(pending, code).await
    }
}
