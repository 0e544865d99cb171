//! # keyward-store
//!
//! Persistence for keyward: a SQLite database (WAL, blocking calls moved
//! onto the tokio blocking pool), versioned migrations, the OAuth session
//! repository, device-flow credentials, and a small `moka` read cache.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  CacheLayer (moka, seconds-long TTL)          │
//! ├──────────────────────────────────────────────┤
//! │  SessionRepository   (oauth_sessions)         │
//! │  CredentialStore     (git_credentials)        │
//! ├──────────────────────────────────────────────┤
//! │  Database (rusqlite WAL) + migrations          │
//! └──────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod credential;
pub mod db;
pub mod error;
pub mod migration;
pub mod oauth_session;

pub use cache::{CacheLayer, CacheLayerBuilder, CacheStats};
pub use credential::{CredentialStore, GitCredential, NewCredential, UpsertOutcome};
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use oauth_session::{OAuthSessionRecord, SessionRepository, SqliteSessionRepository};
