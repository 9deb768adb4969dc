// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bookmark persistence.
//!
//! The bookmark is the id of the last event log entry whose batch was fully
//! dispatched. On restart the cursor resumes strictly after it.
//!
//! ```text
//! read batch 101..=150 → dispatch every entry → persist bookmark 150
//!                        (crash here = re-read 101..=150, handlers are idempotent)
//! ```
//!
//! # Never Regresses
//!
//! Two cursor instances can briefly overlap (the lease is advisory), so the
//! upsert only ever moves the bookmark forward. A slower instance writing an
//! older id is a no-op.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes retry with exponential backoff up to
//! `SQLITE_RETRY_MAX_ATTEMPTS` before the error is surfaced.
//!
//! The same database holds outstanding gaps (see [`GapStore`]).

use crate::config::StoreConfig;
use crate::error::{BoxFuture, CursorError, Result};
use crate::gaps::{GapRecord, GapStore};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Durable storage for the last processed id.
pub trait BookmarkStore: Send + Sync {
    /// The persisted bookmark, `None` on first start.
    fn get(&self) -> BoxFuture<'_, Option<i64>>;

    /// Persist a new bookmark. Implementations must not move it backwards.
    fn set(&self, last_processed_id: i64) -> BoxFuture<'_, ()>;
}

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

/// SQLite-backed bookmark and gap store.
pub struct SqliteStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteStore {
    /// Open (creating if needed) the store described by `config`.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        info!(path = %path, wal = config.wal_mode, "Initializing cursor store");

        let pool = if config.is_in_memory() {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| CursorError::Config(format!("Invalid SQLite path: {}", e)))?;
            // Every connection to :memory: is a separate database; pin one.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            let journal = if config.wal_mode {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            };
            let options = SqliteConnectOptions::new()
                .filename(&path)
                .journal_mode(journal)
                .synchronous(SqliteSynchronous::Normal)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(2)
                .connect_with(options)
                .await?
        };

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bookmark (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_processed_id INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS gaps (
                id INTEGER PRIMARY KEY,
                first_seen_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let store = Self { pool, path };
        if let Some(bookmark) = store.load_bookmark().await? {
            info!(bookmark, "Restored bookmark from previous run");
        }
        Ok(store)
    }

    async fn load_bookmark(&self) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT last_processed_id FROM bookmark WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn store_bookmark(&self, last_processed_id: i64) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let pool = &self.pool;

        let result = execute_with_retry("bookmark_set", move || async move {
            sqlx::query(
                r#"
                INSERT INTO bookmark (id, last_processed_id, updated_at)
                VALUES (1, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    last_processed_id = excluded.last_processed_id,
                    updated_at = excluded.updated_at
                WHERE excluded.last_processed_id >= bookmark.last_processed_id
                "#,
            )
            .bind(last_processed_id)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        if result.rows_affected() == 0 {
            debug!(last_processed_id, "Bookmark write ignored, stored value is ahead");
        } else {
            debug!(last_processed_id, "Bookmark persisted");
            crate::metrics::set_bookmark(last_processed_id);
        }
        Ok(())
    }

    async fn load_gap_records(&self) -> Result<Vec<GapRecord>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as("SELECT id, first_seen_at FROM gaps ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, first_seen_ms) in rows {
            match DateTime::<Utc>::from_timestamp_millis(first_seen_ms) {
                Some(first_seen_at) => records.push(GapRecord { id, first_seen_at }),
                None => warn!(id, first_seen_ms, "Dropping gap with invalid timestamp"),
            }
        }
        Ok(records)
    }

    async fn insert_gaps(&self, gaps: &[GapRecord]) -> Result<()> {
        if gaps.is_empty() {
            return Ok(());
        }
        let pool = &self.pool;

        execute_with_retry("gaps_save", move || async move {
            let mut tx = pool.begin().await?;
            for gap in gaps {
                sqlx::query("INSERT INTO gaps (id, first_seen_at) VALUES (?, ?) ON CONFLICT(id) DO NOTHING")
                    .bind(gap.id)
                    .bind(gap.first_seen_at.timestamp_millis())
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await
        })
        .await?;

        debug!(count = gaps.len(), "Persisted gaps");
        Ok(())
    }

    async fn delete_gaps(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let pool = &self.pool;

        execute_with_retry("gaps_remove", move || async move {
            let mut tx = pool.begin().await?;
            for id in ids {
                sqlx::query("DELETE FROM gaps WHERE id = ?")
                    .bind(*id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await
        })
        .await?;

        debug!(count = ids.len(), "Deleted gaps");
        Ok(())
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("store_checkpoint", move || async move {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Cursor store closed");
    }
}

impl BookmarkStore for SqliteStore {
    fn get(&self) -> BoxFuture<'_, Option<i64>> {
        Box::pin(self.load_bookmark())
    }

    fn set(&self, last_processed_id: i64) -> BoxFuture<'_, ()> {
        Box::pin(self.store_bookmark(last_processed_id))
    }
}

impl GapStore for SqliteStore {
    fn load_gaps(&self) -> BoxFuture<'_, Vec<GapRecord>> {
        Box::pin(self.load_gap_records())
    }

    fn save_gaps<'a>(&'a self, gaps: &'a [GapRecord]) -> BoxFuture<'a, ()> {
        Box::pin(self.insert_gaps(gaps))
    }

    fn remove_gaps<'a>(&'a self, ids: &'a [i64]) -> BoxFuture<'a, ()> {
        Box::pin(self.delete_gaps(ids))
    }
}
