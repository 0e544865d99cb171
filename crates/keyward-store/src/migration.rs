//! Versioned schema migrations.
//!
//! Each migration is a static SQL batch keyed by a version number. Applied
//! versions are recorded in `_migrations`, so running the full list again
//! is a no-op.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// Append new migrations at the end; never edit an applied one.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "oauth_sessions: in-flight and completed authorization-code sessions",
        sql: r#"
            CREATE TABLE oauth_sessions (
                state         TEXT PRIMARY KEY,
                endpoint_id   TEXT NOT NULL,
                owner_key     TEXT,
                code_verifier TEXT,
                client_info   TEXT,
                tokens        TEXT,
                consumed_at   INTEGER,
                created_at    INTEGER NOT NULL,
                expires_at    INTEGER NOT NULL
            );
            CREATE INDEX idx_oauth_sessions_owner ON oauth_sessions(endpoint_id, owner_key);
            CREATE INDEX idx_oauth_sessions_expiry ON oauth_sessions(expires_at);
        "#,
    },
    Migration {
        version: 2,
        description: "git_credentials: device-flow credentials keyed by owner",
        sql: r#"
            CREATE TABLE git_credentials (
                id               TEXT PRIMARY KEY,
                owner_key        TEXT NOT NULL,
                provider         TEXT NOT NULL,
                provider_user_id INTEGER NOT NULL,
                username         TEXT NOT NULL,
                access_token     TEXT NOT NULL,
                refresh_token    TEXT,
                token_type       TEXT NOT NULL,
                scope            TEXT NOT NULL DEFAULT '',
                expires_at       INTEGER,
                active           BOOLEAN NOT NULL DEFAULT 1,
                created_at       INTEGER NOT NULL,
                updated_at       INTEGER NOT NULL
            );
            CREATE INDEX idx_git_credentials_owner ON git_credentials(owner_key, active);
        "#,
    },
];

/// Bring the schema up to the newest migration.
///
/// Synchronous; callers on the runtime go through `Database::run_migrations`.
/// Each migration commits on its own, so a failure leaves every earlier
/// version applied.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(LEDGER_DDL)
        .map_err(|e| migration_error(0, "create ledger", e))?;

    let applied = current_version(conn)?;
    let mut ran = 0usize;
    for migration in MIGRATIONS.iter().skip_while(|m| m.version <= applied) {
        apply(conn, migration)?;
        ran += 1;
    }

    if ran == 0 {
        debug!(version = applied, "schema current");
    } else {
        info!(from = applied, applied = ran, "schema migrated");
    }
    Ok(())
}

/// Latest applied migration version, or 0 on a fresh database.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row("SELECT IFNULL(MAX(version), 0) FROM _migrations", [], |row| {
        row.get(0)
    })
    .map_err(|e| migration_error(0, "read ledger", e))
}

const LEDGER_DDL: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    version     INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at  INTEGER NOT NULL
);";

fn migration_error(version: u32, stage: &str, err: rusqlite::Error) -> StoreError {
    StoreError::Migration {
        version,
        message: format!("{stage}: {err}"),
    }
}

fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    let version = migration.version;
    debug!(version, description = migration.description, "applying migration");

    // Dropping the transaction without commit rolls it back.
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| migration_error(version, "begin", e))?;
    tx.execute_batch(migration.sql).map_err(|e| {
        warn!(version, error = %e, "migration rolled back");
        migration_error(version, "execute", e)
    })?;
    tx.execute(
        "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![version, migration.description, chrono::Utc::now().timestamp()],
    )
    .map_err(|e| migration_error(version, "record", e))?;
    tx.commit().map_err(|e| migration_error(version, "commit", e))
}
