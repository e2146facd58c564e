#![forbid(unsafe_code)]

// Durable per-actor state.
//
// Each worker persists one record under its address key so a restarted
// process can find workers whose timers had not fired yet.

use crate::error::StorageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock as StdRwLock;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    pub worker_id: String,
    pub file_count: usize,
    pub origin_uri: String,
    pub delay_ms: u64,
    /// Wall-clock fire time of the pending timer, if one is armed
    pub alarm_at_ms: Option<u64>,
}

#[async_trait]
pub trait ActorStorage: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<WorkerRecord>, StorageError>;
    async fn save(&self, key: &str, record: &WorkerRecord) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    async fn list(&self) -> Result<Vec<(String, WorkerRecord)>, StorageError>;
}

/// Process-local storage. Records do not survive a restart.
#[derive(Default)]
pub struct MemoryStorage {
    records: StdRwLock<HashMap<String, WorkerRecord>>,
    unavailable: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail, simulating a lost storage backend.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory storage disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ActorStorage for MemoryStorage {
    async fn load(&self, key: &str) -> Result<Option<WorkerRecord>, StorageError> {
        self.check()?;
        Ok(self.records.read().unwrap_or_else(|e| e.into_inner()).get(key).cloned())
    }

    async fn save(&self, key: &str, record: &WorkerRecord) -> Result<(), StorageError> {
        self.check()?;
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.records.write().unwrap_or_else(|e| e.into_inner()).remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(String, WorkerRecord)>, StorageError> {
        self.check()?;
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

/// SQLite-backed storage; records are stored as JSON keyed by worker address.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        info!("Worker state database opened at {}", database_url);
        Self::with_pool(pool).await
    }

    /// Single-connection in-memory database (each connection would otherwise
    /// get its own empty database).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS worker_state (
                key TEXT PRIMARY KEY,
                record TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

fn decode(key: &str, json: &str) -> Result<WorkerRecord, StorageError> {
    serde_json::from_str(json).map_err(|source| StorageError::Corrupt {
        key: key.to_string(),
        source,
    })
}

#[async_trait]
impl ActorStorage for SqliteStorage {
    async fn load(&self, key: &str) -> Result<Option<WorkerRecord>, StorageError> {
        let row = sqlx::query_as::<_, (String,)>("SELECT record FROM worker_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(json,)| decode(key, &json)).transpose()
    }

    async fn save(&self, key: &str, record: &WorkerRecord) -> Result<(), StorageError> {
        let json = serde_json::to_string(record).map_err(|source| StorageError::Corrupt {
            key: key.to_string(),
            source,
        })?;
        sqlx::query(
            "INSERT INTO worker_state (key, record) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET record = excluded.record, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(key)
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM worker_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(String, WorkerRecord)>, StorageError> {
        let rows = sqlx::query_as::<_, (String, String)>("SELECT key, record FROM worker_state ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|(key, json)| decode(&key, &json).map(|record| (key, record)))
            .collect()
    }
}
