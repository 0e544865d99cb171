//! SQLite connection handle.
//!
//! [`Database`] keeps one `rusqlite::Connection` behind an `Arc<Mutex<>>`
//! and runs every closure on the blocking pool, so async callers never
//! block the runtime on file I/O.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migration;

/// Cloneable, thread-safe handle to the keyward database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file at `path`.
    ///
    /// Blocks briefly on file I/O; call it during startup or from
    /// [`Database::open_and_migrate`].
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Migration {
                version: 0,
                message: format!("cannot create {}: {e}", parent.display()),
            })?;
        }

        let conn = Connection::open(path)?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database. Every handle cloned from the result
    /// shares the same connection, which makes it suitable for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory database");

        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open the database and bring the schema up to date.
    pub async fn open_and_migrate(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Self::open(&path)).await??;
        db.run_migrations().await?;
        Ok(db)
    }

    /// In-memory database with all migrations applied.
    pub async fn open_in_memory_migrated() -> StoreResult<Self> {
        let db = Self::open_in_memory()?;
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run all pending schema migrations.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        self.execute(migration::run_all).await
    }

    /// Run `f` against the connection on the blocking pool.
    ///
    /// ```ignore
    /// let live: i64 = db.execute(|conn| {
    ///     Ok(conn.query_row("SELECT count(*) FROM oauth_sessions", [], |r| r.get(0))?)
    /// }).await?;
    /// ```
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }

    /// Like [`Database::execute`] but hands out `&mut Connection` so the
    /// closure can open a transaction.
    pub async fn execute_mut<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await?
    }

    fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
        // WAL lets the callback server read while a device-flow poll writes.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;

        debug!("database pragmas applied");
        Ok(())
    }
}
