//! Source-control credentials obtained through the device flow.
//!
//! At most one active row exists per owner. [`CredentialStore::upsert_active`]
//! runs the read-then-write inside a single SQLite transaction, so two
//! completions for the same owner serialize (last writer wins) and
//! completions for different owners never touch each other's rows.

use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::StoreResult;

const COLUMNS: &str = "id, owner_key, provider, provider_user_id, username, access_token, \
                       refresh_token, token_type, scope, expires_at, active, created_at, updated_at";

/// A stored device-flow credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitCredential {
    pub id: String,
    pub owner_key: String,
    pub provider: String,
    pub provider_user_id: i64,
    pub username: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub scope: String,
    pub expires_at: Option<i64>,
    pub active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl GitCredential {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_key: row.get(1)?,
            provider: row.get(2)?,
            provider_user_id: row.get(3)?,
            username: row.get(4)?,
            access_token: row.get(5)?,
            refresh_token: row.get(6)?,
            token_type: row.get(7)?,
            scope: row.get(8)?,
            expires_at: row.get(9)?,
            active: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }
}

/// Fields written by an upsert.
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub provider: String,
    pub provider_user_id: i64,
    pub username: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub scope: String,
    pub expires_at: Option<i64>,
}

/// Whether an upsert created a row or updated the active one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

#[derive(Clone)]
pub struct CredentialStore {
    db: Database,
}

impl CredentialStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Update the owner's active credential in place, or create one.
    /// `now` (unix seconds) stamps `created_at` / `updated_at`.
    #[instrument(skip(self, credential), fields(provider = %credential.provider))]
    pub async fn upsert_active(
        &self,
        owner_key: &str,
        credential: NewCredential,
        now: i64,
    ) -> StoreResult<(GitCredential, UpsertOutcome)> {
        let owner_key = owner_key.to_string();
        let result = self
            .db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;

                let existing: Option<String> = tx
                    .query_row(
                        "SELECT id FROM git_credentials WHERE owner_key = ?1 AND active = 1 \
                         ORDER BY updated_at DESC LIMIT 1",
                        params![owner_key],
                        |row| row.get(0),
                    )
                    .optional()?;

                let (id, outcome) = match existing {
                    Some(id) => {
                        tx.execute(
                            "UPDATE git_credentials SET provider = ?2, provider_user_id = ?3, \
                             username = ?4, access_token = ?5, refresh_token = ?6, \
                             token_type = ?7, scope = ?8, expires_at = ?9, updated_at = ?10 \
                             WHERE id = ?1",
                            params![
                                id,
                                credential.provider,
                                credential.provider_user_id,
                                credential.username,
                                credential.access_token,
                                credential.refresh_token,
                                credential.token_type,
                                credential.scope,
                                credential.expires_at,
                                now,
                            ],
                        )?;
                        (id, UpsertOutcome::Updated)
                    }
                    None => {
                        let id = Uuid::now_v7().to_string();
                        tx.execute(
                            "INSERT INTO git_credentials (id, owner_key, provider, provider_user_id, \
                             username, access_token, refresh_token, token_type, scope, expires_at, \
                             active, created_at, updated_at) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11, ?11)",
                            params![
                                id,
                                owner_key,
                                credential.provider,
                                credential.provider_user_id,
                                credential.username,
                                credential.access_token,
                                credential.refresh_token,
                                credential.token_type,
                                credential.scope,
                                credential.expires_at,
                                now,
                            ],
                        )?;
                        (id, UpsertOutcome::Created)
                    }
                };

                let stored = tx.query_row(
                    &format!("SELECT {COLUMNS} FROM git_credentials WHERE id = ?1"),
                    params![id],
                    GitCredential::from_row,
                )?;
                tx.commit()?;
                Ok((stored, outcome))
            })
            .await?;

        info!(username = %result.0.username, outcome = ?result.1, "credential stored");
        Ok(result)
    }

    #[instrument(skip(self))]
    pub async fn get_active(&self, owner_key: &str) -> StoreResult<Option<GitCredential>> {
        let owner_key = owner_key.to_string();
        self.db
            .execute(move |conn| {
                let credential = conn
                    .query_row(
                        &format!(
                            "SELECT {COLUMNS} FROM git_credentials \
                             WHERE owner_key = ?1 AND active = 1 \
                             ORDER BY updated_at DESC LIMIT 1"
                        ),
                        params![owner_key],
                        GitCredential::from_row,
                    )
                    .optional()?;
                Ok(credential)
            })
            .await
    }

    /// Mark the owner's credentials inactive. Returns the number of rows
    /// changed; zero when the owner had none.
    #[instrument(skip(self))]
    pub async fn deactivate(&self, owner_key: &str, now: i64) -> StoreResult<u64> {
        let owner_key = owner_key.to_string();
        let changed = self
            .db
            .execute(move |conn| {
                let changed = conn.execute(
                    "UPDATE git_credentials SET active = 0, updated_at = ?2 \
                     WHERE owner_key = ?1 AND active = 1",
                    params![owner_key, now],
                )?;
                Ok(changed as u64)
            })
            .await?;
        debug!(changed, "credentials deactivated");
        Ok(changed)
    }
}
