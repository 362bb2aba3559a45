use std::path::{Path, PathBuf};
use std::str::FromStr;

use futures::future::BoxFuture;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{ConnectOptions, Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{CacheBackend, CacheError, StoreStats};
use crate::time::now_ms;

/// Schema steps for the cache database. Every logical store shares one table,
/// so a step may only add to it; rows written by older versions must survive.
static MIGRATIONS: &[(i64, &str, &[&str])] = &[
    (
        1,
        "cache_entries",
        &["CREATE TABLE IF NOT EXISTS cache_entries (\
             store TEXT NOT NULL,\
             key TEXT NOT NULL,\
             value TEXT NOT NULL,\
             updated_at INTEGER NOT NULL,\
             PRIMARY KEY (store, key)\
           )"],
    ),
    (
        2,
        "cache_entries_size",
        &[
            "ALTER TABLE cache_entries ADD COLUMN size_bytes INTEGER NOT NULL DEFAULT 0",
            "UPDATE cache_entries SET size_bytes = length(value)",
        ],
    ),
    (
        3,
        "cache_entries_store_updated_idx",
        &["CREATE INDEX IF NOT EXISTS idx_cache_entries_store_updated \
           ON cache_entries(store, updated_at)"],
    ),
];

pub const SCHEMA_VERSION: i64 = 3;

#[derive(Debug, Clone)]
enum Target {
    File(PathBuf),
    Memory,
}

/// SQLite-backed cache. The pool is opened on first use and migrated to
/// [`SCHEMA_VERSION`].
pub struct SqliteCache {
    target: Target,
    pool: Mutex<Option<SqlitePool>>,
}

impl SqliteCache {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            target: Target::File(path.into()),
            pool: Mutex::new(None),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            target: Target::Memory,
            pool: Mutex::new(None),
        }
    }

    async fn pool(&self) -> Result<SqlitePool, CacheError> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }
        let pool = match &self.target {
            Target::File(path) => open_file_pool(path).await?,
            Target::Memory => {
                let options = SqliteConnectOptions::from_str("sqlite::memory:")?
                    .log_statements(log::LevelFilter::Off);
                memory_pool_options().connect_with(options).await?
            }
        };
        apply_migrations(&pool).await?;
        *guard = Some(pool.clone());
        Ok(pool)
    }

    /// Highest applied schema version, opening the database if needed.
    pub async fn schema_version(&self) -> Result<i64, CacheError> {
        let pool = self.pool().await?;
        let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM cache_migrations")
            .fetch_one(&pool)
            .await?;
        Ok(version.unwrap_or(0))
    }
}

/// Each in-memory connection is its own database, so the single connection
/// must never be reaped or recycled.
fn memory_pool_options() -> SqlitePoolOptions {
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
}

async fn open_file_pool(path: &Path) -> Result<SqlitePool, CacheError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| {
            CacheError::Storage(format!(
                "create cache directory {}: {err}",
                parent.display()
            ))
        })?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_secs(5))
        .log_statements(log::LevelFilter::Off);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;
    info!(target: "waterfall", event = "cache_open", path = %path.display());
    Ok(pool)
}

fn checksum(statements: &[&str]) -> String {
    let joined = statements.join(";\n");
    format!("{:x}", Sha256::digest(joined.as_bytes()))
}

pub(crate) async fn apply_migrations(pool: &SqlitePool) -> Result<(), CacheError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS cache_migrations (\
           version INTEGER PRIMARY KEY,\
           name TEXT NOT NULL,\
           applied_at INTEGER NOT NULL,\
           checksum TEXT NOT NULL\
         )",
    )
    .execute(pool)
    .await?;

    for (version, name, statements) in MIGRATIONS {
        let recorded: Option<String> =
            sqlx::query_scalar("SELECT checksum FROM cache_migrations WHERE version = ?")
                .bind(*version)
                .fetch_optional(pool)
                .await?;
        let expected = checksum(statements);
        if let Some(recorded) = recorded {
            if recorded != expected {
                warn!(
                    target: "waterfall",
                    event = "cache_migration_checksum_mismatch",
                    version = *version,
                    name = *name
                );
            }
            continue;
        }

        let mut tx = pool.begin().await?;
        for statement in statements.iter() {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query(
            "INSERT INTO cache_migrations (version, name, applied_at, checksum) VALUES (?, ?, ?, ?)",
        )
        .bind(*version)
        .bind(*name)
        .bind(now_ms())
        .bind(&expected)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(target: "waterfall", event = "cache_migration_applied", version = *version, name = *name);
    }
    Ok(())
}

impl CacheBackend for SqliteCache {
    fn get<'a>(
        &'a self,
        store: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Value>, CacheError>> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let raw: Option<String> =
                sqlx::query_scalar("SELECT value FROM cache_entries WHERE store = ? AND key = ?")
                    .bind(store)
                    .bind(key)
                    .fetch_optional(&pool)
                    .await?;
            match raw {
                Some(text) => Ok(Some(serde_json::from_str(&text)?)),
                None => Ok(None),
            }
        })
    }

    fn put<'a>(
        &'a self,
        store: &'a str,
        key: &'a str,
        value: Value,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let text = serde_json::to_string(&value)?;
            let pool = self.pool().await?;
            sqlx::query(
                "INSERT INTO cache_entries (store, key, value, updated_at, size_bytes) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(store, key) DO UPDATE SET \
                   value = excluded.value, \
                   updated_at = excluded.updated_at, \
                   size_bytes = excluded.size_bytes",
            )
            .bind(store)
            .bind(key)
            .bind(&text)
            .bind(now_ms())
            .bind(text.len() as i64)
            .execute(&pool)
            .await?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, store: &'a str, key: &'a str) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let pool = self.pool().await?;
            sqlx::query("DELETE FROM cache_entries WHERE store = ? AND key = ?")
                .bind(store)
                .bind(key)
                .execute(&pool)
                .await?;
            Ok(())
        })
    }

    fn clear<'a>(&'a self, store: &'a str) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let res = sqlx::query("DELETE FROM cache_entries WHERE store = ?")
                .bind(store)
                .execute(&pool)
                .await?;
            info!(
                target: "waterfall",
                event = "cache_cleared",
                store,
                removed = res.rows_affected()
            );
            Ok(())
        })
    }

    fn stats(&self) -> BoxFuture<'_, Result<Vec<StoreStats>, CacheError>> {
        Box::pin(async move {
            let pool = self.pool().await?;
            let rows = sqlx::query(
                "SELECT store, COUNT(*) AS entries, COALESCE(SUM(size_bytes), 0) AS bytes \
                 FROM cache_entries GROUP BY store ORDER BY store",
            )
            .fetch_all(&pool)
            .await?;
            rows.into_iter()
                .map(|row| -> Result<StoreStats, CacheError> {
                    Ok(StoreStats {
                        store: row.try_get("store")?,
                        entries: row.try_get::<i64, _>("entries")?.max(0) as u64,
                        bytes: row.try_get::<i64, _>("bytes")?.max(0) as u64,
                    })
                })
                .collect()
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let pool = self.pool.lock().await.take();
            if let Some(pool) = pool {
                pool.close().await;
                info!(target: "waterfall", event = "cache_closed");
            }
        })
    }
}
