//! Backing stores for manager hydrate/persist.
//!
//! The engine itself is store-agnostic; managers receive an
//! `Arc<dyn StateStore>` and decide what to load and save. State is kept as
//! one JSON document per `(user_id, manager)`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt state document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn load(&self, user_id: &str, manager: &str) -> Result<Option<Value>, StoreError>;

    /// Upsert the whole document.
    async fn save(&self, user_id: &str, manager: &str, state: Value) -> Result<(), StoreError>;
}

/// In-process store. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<(String, String), Value>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `save` calls served so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn peek(&self, user_id: &str, manager: &str) -> Option<Value> {
        self.entries
            .get(&(user_id.to_string(), manager.to_string()))
            .map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, user_id: &str, manager: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.peek(user_id, manager))
    }

    async fn save(&self, user_id: &str, manager: &str, state: Value) -> Result<(), StoreError> {
        self.entries
            .insert((user_id.to_string(), manager.to_string()), state);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// SQLite-backed store.
///
/// Uses `spawn_blocking` for async-safe SQLite access, one short-lived
/// connection per operation.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (and migrate) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = open_connection(&db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS manager_state (
                user_id TEXT NOT NULL,
                manager TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, manager)
            );",
        )?;
        info!(
            component = "store",
            event = "store.opened",
            path = %db_path.display(),
            "SQLite state store ready"
        );
        Ok(Self { db_path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }
}

fn open_connection(db_path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(db_path)?;

    // Set up connection for concurrent access
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn load(&self, user_id: &str, manager: &str) -> Result<Option<Value>, StoreError> {
        let db_path = self.db_path.clone();
        let user_id = user_id.to_string();
        let manager = manager.to_string();

        let raw = tokio::task::spawn_blocking(move || -> Result<Option<String>, StoreError> {
            let conn = open_connection(&db_path)?;
            let raw = conn
                .query_row(
                    "SELECT state FROM manager_state WHERE user_id = ?1 AND manager = ?2",
                    params![user_id, manager],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(raw)
        })
        .await??;

        raw.map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
            .transpose()
    }

    async fn save(&self, user_id: &str, manager: &str, state: Value) -> Result<(), StoreError> {
        let db_path = self.db_path.clone();
        let user_id = user_id.to_string();
        let manager = manager.to_string();
        let raw = serde_json::to_string(&state)?;

        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(&db_path)?;
            conn.execute(
                "INSERT INTO manager_state (user_id, manager, state, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, manager) DO UPDATE SET
                   state = excluded.state,
                   updated_at = excluded.updated_at",
                params![user_id, manager, raw, unix_millis()],
            )?;
            debug!(
                component = "store",
                event = "store.saved",
                user_id = %user_id,
                manager = %manager,
                bytes = raw.len(),
                "Persisted manager state"
            );
            Ok(())
        })
        .await?
    }
}
