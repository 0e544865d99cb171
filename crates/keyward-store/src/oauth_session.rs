//! Persistence for authorization-code sessions.
//!
//! A row is keyed by its CSRF `state` while the authorization is in flight
//! and found through `(endpoint_id, owner_key)` once it completes. A NULL
//! `owner_key` marks the endpoint's shared client; any other value is a
//! user id.
//!
//! `client_info` and `tokens` are opaque JSON to this crate; the auth
//! engine owns their shape.

use async_trait::async_trait;
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::StoreResult;

const COLUMNS: &str = "state, endpoint_id, owner_key, code_verifier, client_info, tokens, \
                       consumed_at, created_at, expires_at";

/// One persisted OAuth session row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthSessionRecord {
    pub state: String,
    pub endpoint_id: String,
    /// `None` for the endpoint's shared client.
    pub owner_key: Option<String>,
    pub code_verifier: Option<String>,
    pub client_info: Option<String>,
    pub tokens: Option<String>,
    /// Set once a callback has redeemed `state`.
    pub consumed_at: Option<i64>,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds after which `state` can no longer be redeemed.
    pub expires_at: i64,
}

impl OAuthSessionRecord {
    /// A fresh, unconsumed session for `state`.
    pub fn pending(
        state: impl Into<String>,
        endpoint_id: impl Into<String>,
        owner_key: Option<String>,
        created_at: i64,
        expires_at: i64,
    ) -> Self {
        Self {
            state: state.into(),
            endpoint_id: endpoint_id.into(),
            owner_key,
            code_verifier: None,
            client_info: None,
            tokens: None,
            consumed_at: None,
            created_at,
            expires_at,
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            state: row.get(0)?,
            endpoint_id: row.get(1)?,
            owner_key: row.get(2)?,
            code_verifier: row.get(3)?,
            client_info: row.get(4)?,
            tokens: row.get(5)?,
            consumed_at: row.get(6)?,
            created_at: row.get(7)?,
            expires_at: row.get(8)?,
        })
    }
}

/// Repository contract for OAuth sessions.
///
/// Every write is a single statement or transaction keyed by state or
/// owner. Redeeming a state goes through [`SessionRepository::claim_state`],
/// never a read followed by a write.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Insert or overwrite the row for `record.state`.
    async fn put(&self, record: &OAuthSessionRecord) -> StoreResult<()>;

    async fn get_by_state(&self, state: &str) -> StoreResult<Option<OAuthSessionRecord>>;

    /// Most recently created row for the owner.
    async fn get_by_owner(
        &self,
        endpoint_id: &str,
        owner_key: Option<&str>,
    ) -> StoreResult<Option<OAuthSessionRecord>>;

    /// Atomically remove every row for the record's owner and insert it.
    async fn replace_for_owner(&self, record: &OAuthSessionRecord) -> StoreResult<()>;

    /// Move a row to a new state value and TTL. Returns `false` when no
    /// row had `old_state`.
    async fn rekey_state(&self, old_state: &str, new_state: &str, expires_at: i64)
    -> StoreResult<bool>;

    /// Mark `state` consumed at `now` if it is still unconsumed and
    /// unexpired. Returns `false` when another caller got there first or
    /// the state lapsed. Exactly one of any set of concurrent claims wins.
    async fn claim_state(&self, state: &str, now: i64) -> StoreResult<bool>;

    /// Undo a claim made at `claimed_at` so the state can be redeemed again.
    async fn release_claim(&self, state: &str, claimed_at: i64) -> StoreResult<bool>;

    async fn delete_by_state(&self, state: &str) -> StoreResult<bool>;

    /// Remove every row for the owner. Zero rows is not an error.
    async fn delete_by_owner(&self, endpoint_id: &str, owner_key: Option<&str>)
    -> StoreResult<u64>;

    /// Remove unconsumed, token-less rows whose `expires_at` is not after
    /// `now`. Rows still carrying tokens are kept; only their `state` has
    /// lapsed.
    async fn delete_expired(&self, now: i64) -> StoreResult<u64>;

    async fn list_by_endpoint(&self, endpoint_id: &str) -> StoreResult<Vec<OAuthSessionRecord>>;
}

/// [`SessionRepository`] over the keyward SQLite database.
#[derive(Clone)]
pub struct SqliteSessionRepository {
    db: Database,
}

impl SqliteSessionRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionRepository for SqliteSessionRepository {
    #[instrument(skip(self, record), fields(endpoint_id = %record.endpoint_id))]
    async fn put(&self, record: &OAuthSessionRecord) -> StoreResult<()> {
        let record = record.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO oauth_sessions (state, endpoint_id, owner_key, code_verifier, \
                     client_info, tokens, consumed_at, created_at, expires_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                     ON CONFLICT(state) DO UPDATE SET \
                     endpoint_id = excluded.endpoint_id, owner_key = excluded.owner_key, \
                     code_verifier = excluded.code_verifier, client_info = excluded.client_info, \
                     tokens = excluded.tokens, consumed_at = excluded.consumed_at, \
                     expires_at = excluded.expires_at",
                    params![
                        record.state,
                        record.endpoint_id,
                        record.owner_key,
                        record.code_verifier,
                        record.client_info,
                        record.tokens,
                        record.consumed_at,
                        record.created_at,
                        record.expires_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    #[instrument(skip_all)]
    async fn get_by_state(&self, state: &str) -> StoreResult<Option<OAuthSessionRecord>> {
        let state = state.to_string();
        self.db
            .execute(move |conn| {
                let record = conn
                    .query_row(
                        &format!("SELECT {COLUMNS} FROM oauth_sessions WHERE state = ?1"),
                        params![state],
                        OAuthSessionRecord::from_row,
                    )
                    .optional()?;
                Ok(record)
            })
            .await
    }

    #[instrument(skip(self))]
    async fn get_by_owner(
        &self,
        endpoint_id: &str,
        owner_key: Option<&str>,
    ) -> StoreResult<Option<OAuthSessionRecord>> {
        let endpoint_id = endpoint_id.to_string();
        let owner_key = owner_key.map(str::to_string);
        self.db
            .execute(move |conn| {
                let record = conn
                    .query_row(
                        &format!(
                            "SELECT {COLUMNS} FROM oauth_sessions \
                             WHERE endpoint_id = ?1 AND owner_key IS ?2 \
                             ORDER BY created_at DESC, rowid DESC LIMIT 1"
                        ),
                        params![endpoint_id, owner_key],
                        OAuthSessionRecord::from_row,
                    )
                    .optional()?;
                Ok(record)
            })
            .await
    }

    #[instrument(skip(self, record), fields(endpoint_id = %record.endpoint_id))]
    async fn replace_for_owner(&self, record: &OAuthSessionRecord) -> StoreResult<()> {
        let record = record.clone();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let superseded = tx.execute(
                    "DELETE FROM oauth_sessions WHERE endpoint_id = ?1 AND owner_key IS ?2",
                    params![record.endpoint_id, record.owner_key],
                )?;
                tx.execute(
                    "INSERT INTO oauth_sessions (state, endpoint_id, owner_key, code_verifier, \
                     client_info, tokens, consumed_at, created_at, expires_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        record.state,
                        record.endpoint_id,
                        record.owner_key,
                        record.code_verifier,
                        record.client_info,
                        record.tokens,
                        record.consumed_at,
                        record.created_at,
                        record.expires_at,
                    ],
                )?;
                tx.commit()?;
                if superseded > 0 {
                    debug!(superseded, "previous sessions for owner replaced");
                }
                Ok(())
            })
            .await
    }

    #[instrument(skip_all)]
    async fn rekey_state(
        &self,
        old_state: &str,
        new_state: &str,
        expires_at: i64,
    ) -> StoreResult<bool> {
        let old_state = old_state.to_string();
        let new_state = new_state.to_string();
        self.db
            .execute(move |conn| {
                let changed = conn.execute(
                    "UPDATE oauth_sessions SET state = ?2, expires_at = ?3 WHERE state = ?1",
                    params![old_state, new_state, expires_at],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    #[instrument(skip_all)]
    async fn claim_state(&self, state: &str, now: i64) -> StoreResult<bool> {
        let state = state.to_string();
        self.db
            .execute(move |conn| {
                let changed = conn.execute(
                    "UPDATE oauth_sessions SET consumed_at = ?2 \
                     WHERE state = ?1 AND consumed_at IS NULL AND expires_at > ?2",
                    params![state, now],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    #[instrument(skip_all)]
    async fn release_claim(&self, state: &str, claimed_at: i64) -> StoreResult<bool> {
        let state = state.to_string();
        self.db
            .execute(move |conn| {
                let changed = conn.execute(
                    "UPDATE oauth_sessions SET consumed_at = NULL \
                     WHERE state = ?1 AND consumed_at = ?2",
                    params![state, claimed_at],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    #[instrument(skip_all)]
    async fn delete_by_state(&self, state: &str) -> StoreResult<bool> {
        let state = state.to_string();
        self.db
            .execute(move |conn| {
                let deleted =
                    conn.execute("DELETE FROM oauth_sessions WHERE state = ?1", params![state])?;
                Ok(deleted > 0)
            })
            .await
    }

    #[instrument(skip(self))]
    async fn delete_by_owner(
        &self,
        endpoint_id: &str,
        owner_key: Option<&str>,
    ) -> StoreResult<u64> {
        let endpoint_id = endpoint_id.to_string();
        let owner_key = owner_key.map(str::to_string);
        self.db
            .execute(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM oauth_sessions WHERE endpoint_id = ?1 AND owner_key IS ?2",
                    params![endpoint_id, owner_key],
                )?;
                Ok(deleted as u64)
            })
            .await
    }

    #[instrument(skip(self))]
    async fn delete_expired(&self, now: i64) -> StoreResult<u64> {
        self.db
            .execute(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM oauth_sessions \
                     WHERE consumed_at IS NULL AND tokens IS NULL AND expires_at <= ?1",
                    params![now],
                )?;
                Ok(deleted as u64)
            })
            .await
    }

    #[instrument(skip(self))]
    async fn list_by_endpoint(&self, endpoint_id: &str) -> StoreResult<Vec<OAuthSessionRecord>> {
        let endpoint_id = endpoint_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM oauth_sessions WHERE endpoint_id = ?1 \
                     ORDER BY created_at DESC"
                ))?;
                let rows = stmt
                    .query_map(params![endpoint_id], OAuthSessionRecord::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}
