//! Storage layer: SQLite pool setup, the swappable pool cell and the
//! tag-array column codec.
//!
//! The pipeline stages run their own user-supplied SQL; this crate only
//! owns connecting, migrating the reference schema, and the shared
//! conventions for how values land in columns.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Executor, SqlitePool};
use std::sync::{Arc, RwLock};

pub mod queries;

pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    connect_with_queries(database_url, Vec::new()).await
}

/// Connects to the database and arranges for every pool connection to
/// prepare the given statements right after it is opened. A statement
/// that fails to prepare fails the connection, so a bad user query
/// surfaces at (re)connect time instead of mid-scan.
pub async fn connect_with_queries(
    database_url: &str,
    prepare: Vec<String>,
) -> anyhow::Result<SqlitePool> {
    let mut url = database_url.to_string();
    if !database_url.starts_with("sqlite:") {
        let path = std::path::PathBuf::from(database_url);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let norm = path.to_string_lossy().replace('\\', "/");
        if path.is_absolute() {
            url = format!("sqlite:///{}?mode=rwc", norm.trim_start_matches('/'));
        } else {
            url = format!("sqlite://{}?mode=rwc", norm);
        }
    }
    let mut opts = SqlitePoolOptions::new();
    if url.contains("memory") {
        opts = opts.max_connections(1);
    } else {
        opts = opts.max_connections(5);
    }
    let prepare = Arc::new(prepare);
    let pool = opts
        .after_connect(move |conn, _meta| {
            let prepare = Arc::clone(&prepare);
            Box::pin(async move {
                for sql in prepare.iter() {
                    conn.prepare(sql.as_str()).await?;
                }
                Ok(())
            })
        })
        .connect(&url)
        .await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    // Applies the reference schema from crates/storage/migrations.
    // Safe to run multiple times (idempotent).
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// A single-writer cell holding the active pool.
///
/// Readers grab an `Arc` and keep using it for as long as their current
/// operation runs; publishing a replacement never blocks on them. The
/// replaced pool is drained and closed from a spawned task because its
/// in-flight users would otherwise block the swap itself.
#[derive(Default)]
pub struct SwapPool {
    inner: RwLock<Option<Arc<SqlitePool>>>,
}

impl SwapPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<SqlitePool>> {
        self.inner.read().expect("pool cell poisoned").clone()
    }

    pub fn set(&self, pool: SqlitePool) {
        let old = {
            let mut guard = self.inner.write().expect("pool cell poisoned");
            guard.replace(Arc::new(pool))
        };
        if let Some(old) = old {
            tokio::spawn(async move {
                old.close().await;
                tracing::debug!("replaced pool closed");
            });
        }
    }

    pub async fn close(&self) {
        let pool = self.inner.write().expect("pool cell poisoned").take();
        if let Some(pool) = pool {
            pool.close().await;
        }
    }
}

/// Tag sets persist as JSON integer arrays in TEXT columns.
pub fn encode_tags(tags: &[u64]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

pub fn decode_tags(raw: &str) -> Vec<u64> {
    if raw.is_empty() {
        return Vec::new();
    }
    serde_json::from_str(raw).unwrap_or_default()
}
