//! SQLite storage backend for blockrelay.
//!
//! Persists progress records and tracked collection addresses to a single
//! SQLite file. Uses `sqlx` with WAL mode.
//!
//! # Usage
//! ```rust,no_run
//! use blockrelay_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./relay.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use blockrelay_core::error::IngestError;
use blockrelay_core::progress::ProgressStore;
use blockrelay_core::tracked::TrackedAddressStore;
use blockrelay_core::types::{marker_key, range_key, HistoricalRange, ProgressMarker, Track};

fn storage_err(e: sqlx::Error) -> IngestError {
    IngestError::Storage(e.to_string())
}

/// SQLite-backed progress and tracked-address storage.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./relay.db"`) or a full
    /// SQLite URL (`"sqlite:./relay.db?mode=rwc"`). A database that cannot
    /// be opened yields [`IngestError::StoreUnavailable`].
    pub async fn open(path: &str) -> Result<Self, IngestError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| IngestError::StoreUnavailable(format!("{path}: {e}")))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        debug!(path, "sqlite store opened");
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Uses a single connection so every query sees the same database.
    pub async fn in_memory() -> Result<Self, IngestError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Close the pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init_schema(&self) -> Result<(), IngestError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS progress (
                key        TEXT    PRIMARY KEY,
                value      TEXT    NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tracked_addresses (
                chain_id INTEGER NOT NULL,
                address  TEXT    NOT NULL,
                PRIMARY KEY (chain_id, address)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    // ─── Key/value records ──────────────────────────────────────────────────────

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, IngestError> {
        let row = sqlx::query("SELECT value FROM progress WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        match row {
            None => Ok(None),
            Some(r) => {
                let value: String = r.get("value");
                serde_json::from_str(&value)
                    .map(Some)
                    .map_err(|e| IngestError::Other(format!("corrupt record '{key}': {e}")))
            }
        }
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), IngestError> {
        let json = serde_json::to_string(value)
            .map_err(|e| IngestError::Other(format!("serialize '{key}': {e}")))?;

        sqlx::query(
            "INSERT OR REPLACE INTO progress (key, value, updated_at)
             VALUES (?, ?, ?)",
        )
        .bind(key)
        .bind(&json)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(key, "progress record saved");
        Ok(())
    }

    async fn delete_key(&self, key: &str) -> Result<(), IngestError> {
        sqlx::query("DELETE FROM progress WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Every stored progress key, sorted.
    pub async fn keys(&self) -> Result<Vec<String>, IngestError> {
        let rows = sqlx::query("SELECT key FROM progress ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(rows.into_iter().map(|r| r.get("key")).collect())
    }
}

// ─── ProgressStore impl ─────────────────────────────────────────────────────

#[async_trait]
impl ProgressStore for SqliteStorage {
    async fn load_marker(
        &self,
        chain_id: u32,
        track: Track,
    ) -> Result<Option<ProgressMarker>, IngestError> {
        self.get_json(&marker_key(chain_id, track)).await
    }

    async fn save_marker(&self, marker: ProgressMarker) -> Result<(), IngestError> {
        self.put_json(&marker_key(marker.chain_id, marker.track), &marker)
            .await
    }

    async fn delete_marker(&self, chain_id: u32, track: Track) -> Result<(), IngestError> {
        self.delete_key(&marker_key(chain_id, track)).await
    }

    async fn load_range(&self, chain_id: u32) -> Result<Option<HistoricalRange>, IngestError> {
        self.get_json(&range_key(chain_id)).await
    }

    async fn save_range(&self, chain_id: u32, range: HistoricalRange) -> Result<(), IngestError> {
        self.put_json(&range_key(chain_id), &range).await
    }

    async fn delete_range(&self, chain_id: u32) -> Result<(), IngestError> {
        self.delete_key(&range_key(chain_id)).await
    }
}

// ─── TrackedAddressStore impl ───────────────────────────────────────────────

#[async_trait]
impl TrackedAddressStore for SqliteStorage {
    async fn list_tracked(&self, chain_id: u32) -> Result<Vec<String>, IngestError> {
        let rows = sqlx::query(
            "SELECT address FROM tracked_addresses WHERE chain_id = ? ORDER BY address",
        )
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows.into_iter().map(|r| r.get("address")).collect())
    }

    async fn add_tracked(&self, chain_id: u32, address: &str) -> Result<bool, IngestError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO tracked_addresses (chain_id, address) VALUES (?, ?)",
        )
        .bind(chain_id as i64)
        .bind(address.to_ascii_lowercase())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove_tracked(&self, chain_id: u32, address: &str) -> Result<bool, IngestError> {
        let result = sqlx::query(
            "DELETE FROM tracked_addresses WHERE chain_id = ? AND address = ?",
        )
        .bind(chain_id as i64)
        .bind(address.to_ascii_lowercase())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected() > 0)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
