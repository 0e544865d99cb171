//! OAuth engine for keyward.
//!
//! This crate drives every flow keyward uses to obtain third-party
//! credentials:
//!
//! - **Device Authorization Grant** (RFC 8628) against GitHub, storing the
//!   resulting token as a git credential
//! - **Authorization Code + PKCE** (RFC 7636) for tool-serving endpoints,
//!   with RFC 8414 discovery and RFC 7591 dynamic client registration
//! - **Per-user sessions** multiplexing one endpoint across many end-users
//! - **Callback routing** that validates `state`, redeems the code and
//!   renders the page posted back to the opener window
//!
//! Sessions, client registrations and tokens live in [`keyward_store`].
//!
//! # Architecture
//!
//! ```text
//! EndpointRegistry
//! ├── PkceProvider           (shared owner, one per endpoint)
//! ├── PerUserSessionManager  (user owners, one per endpoint)
//! └── SharedCallbacks / UserCallbacks ──► CallbackRouter
//!
//! DeviceFlowEngine ──► ProviderClient ──► GitHub
//!        └──────────► CredentialStore
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use keyward_auth::{AuthConfig, EndpointRegistry, ProviderClient, SystemClock};
//! use keyward_store::{Database, SqliteSessionRepository};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = AuthConfig::load(Path::new("config/keyward.toml"))?;
//! let db = Database::open_and_migrate(config.database_path.clone()).await?;
//! let registry = EndpointRegistry::new(
//!     &config,
//!     Arc::new(SqliteSessionRepository::new(db)),
//!     ProviderClient::new(),
//!     Arc::new(SystemClock),
//! );
//!
//! let start = registry.authorize_shared("notion").await?;
//! println!("open {}", start.authorization_url);
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod client;
pub mod clock;
pub mod config;
pub mod device_code;
pub mod error;
pub mod per_user;
pub mod pkce;
pub mod provider;
pub mod registry;
pub mod types;

// Re-export key types at the crate root for convenience.
pub use callback::{
    CallbackFailure, CallbackOutcome, CallbackParams, CallbackRouter, CallbackVariant,
    CodeExchanger, PendingCallback, callback_payload, render_callback_page,
};
pub use client::ProviderClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuthConfig, DEFAULT_CONFIG_PATH, EndpointConfig, GitHubProviderConfig};
pub use device_code::{DeviceAuthResult, DeviceFlowEngine, PollOptions, PollProgress};
pub use error::{AuthError, Result};
pub use per_user::{PerUserSessionManager, UserSession};
pub use provider::{
    InvalidationScope, OAuthClientProvider, PkceProvider, ProviderSettings, RedirectHandler,
};
pub use registry::{EndpointRegistry, SharedCallbacks, UserCallbacks};
pub use types::{
    AuthorizationStart, ClientCredentials, ClientInformation, ClientMetadata, DeviceCodeTicket,
    GitHubUserIdentity, OwnerKey, TokenSet,
};
