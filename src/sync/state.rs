//! Persisted last-known state of a synchronized pair. One SQLite file
//! per local tree, normally at `.davmirror/state.db` under the root.
//!
//! Rows hold what both sides looked like after the last pass that
//! touched them; the engine diffs fresh snapshots against these to tell
//! "changed since last sync" apart from "changed on the other side".

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use crate::errors::SyncError;

/// Last-known remote values for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileState {
    /// Whole seconds since the epoch, when the server reported one
    pub modified: Option<i64>,
    pub etag: Option<String>,
}

#[derive(Clone)]
pub struct StateDb {
    pool: SqlitePool,
}

impl StateDb {
    /// Opens (and creates if needed) the state database at `path`.
    pub async fn open(path: &Path) -> Result<Self, SyncError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(SyncError::State)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self, SyncError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:").map_err(SyncError::State)?)
            .await?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<(), SyncError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS local_files (
                   path TEXT PRIMARY KEY,
                   modified INTEGER NOT NULL
               )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS remote_entries (
                   path TEXT PRIMARY KEY,
                   modified INTEGER,
                   etag TEXT
               )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS sync_runs (
                   local_root TEXT NOT NULL,
                   remote_url TEXT NOT NULL,
                   last_sync INTEGER NOT NULL,
                   PRIMARY KEY (local_root, remote_url)
               )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Loads local path → last-known mtime.
    pub async fn load_local(&self) -> Result<HashMap<String, i64>, SyncError> {
        let rows = sqlx::query("SELECT path, modified FROM local_files")
            .fetch_all(&self.pool)
            .await?;

        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            map.insert(row.get::<String, _>("path"), row.get::<i64, _>("modified"));
        }
        Ok(map)
    }

    /// Loads remote path → last-known (mtime, etag).
    pub async fn load_remote(&self) -> Result<HashMap<String, RemoteFileState>, SyncError> {
        let rows = sqlx::query("SELECT path, modified, etag FROM remote_entries")
            .fetch_all(&self.pool)
            .await?;

        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            map.insert(
                row.get::<String, _>("path"),
                RemoteFileState {
                    modified: row.get::<Option<i64>, _>("modified"),
                    etag: row.get::<Option<String>, _>("etag"),
                },
            );
        }
        Ok(map)
    }

    /// Replaces both state tables in one transaction. Called once per
    /// completed pass; failed entries carry their prior rows in `local`
    /// and `remote`.
    pub async fn replace(
        &self,
        local: &HashMap<String, i64>,
        remote: &HashMap<String, RemoteFileState>,
    ) -> Result<(), SyncError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM local_files").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM remote_entries").execute(&mut *tx).await?;

        for (path, modified) in local {
            sqlx::query("INSERT INTO local_files (path, modified) VALUES ($1, $2)")
                .bind(path)
                .bind(modified)
                .execute(&mut *tx)
                .await?;
        }

        for (path, state) in remote {
            sqlx::query("INSERT INTO remote_entries (path, modified, etag) VALUES ($1, $2, $3)")
                .bind(path)
                .bind(state.modified)
                .bind(&state.etag)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(
            "State replaced: {} local rows, {} remote rows",
            local.len(),
            remote.len()
        );
        Ok(())
    }

    /// Timestamp of the last successful pass for this pair, if any.
    pub async fn last_sync(
        &self,
        local_root: &str,
        remote_url: &str,
    ) -> Result<Option<i64>, SyncError> {
        let row = sqlx::query(
            "SELECT last_sync FROM sync_runs WHERE local_root = $1 AND remote_url = $2",
        )
        .bind(local_root)
        .bind(remote_url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<i64, _>("last_sync")))
    }

    /// Records a successful pass.
    pub async fn record_sync(
        &self,
        local_root: &str,
        remote_url: &str,
        when: i64,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"INSERT INTO sync_runs (local_root, remote_url, last_sync)
               VALUES ($1, $2, $3)
               ON CONFLICT (local_root, remote_url) DO UPDATE SET
               last_sync = excluded.last_sync"#,
        )
        .bind(local_root)
        .bind(remote_url)
        .bind(when)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
