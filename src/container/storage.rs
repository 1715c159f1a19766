//! Per-identity SQLite storage.
//!
//! One database file per actor holds:
//! - the persisted container status (a key-value slot),
//! - the `scheduled_tasks` table,
//! - the pending wake-up time.
//!
//! Status transitions driven by background events use
//! [`ActorStorage::compare_and_set_status`], which re-reads and writes inside
//! one transaction.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

const STATUS_KEY: &str = "__container_state";

/// Async-safe handle to one actor's storage.
///
/// Wraps `ActorStorage` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct StorageHandle {
    inner: Arc<std::sync::Mutex<ActorStorage>>,
}

impl StorageHandle {
    pub fn new(storage: ActorStorage) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(storage)),
        }
    }

    /// Run a closure with access to the storage on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ActorStorage) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let storage = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = storage
                .lock()
                .map_err(|e| anyhow::anyhow!("Storage lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("Storage task panicked")?
    }

    pub async fn status(&self) -> Result<ContainerStatus> {
        self.call(|s| s.get_status()).await
    }

    pub async fn set_status(&self, state: ProcessState) -> Result<()> {
        self.call(move |s| s.put_status(&ContainerStatus::new(state)))
            .await
    }

    /// Write `next` only if the stored state still equals `expected`.
    /// Returns whether the write happened.
    pub async fn compare_and_set_status(
        &self,
        expected: ProcessState,
        next: ProcessState,
    ) -> Result<bool> {
        self.call(move |s| s.compare_and_set_status(expected, next))
            .await
    }
}

/// SQLite-backed durable state for one actor: the status slot, the
/// scheduled-task table and the pending wake-up time.
pub struct ActorStorage {
    conn: Connection,
}

impl ActorStorage {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        let storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS kv (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS container_schedules (
                    id TEXT PRIMARY KEY NOT NULL,
                    callback TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    kind TEXT NOT NULL CHECK (kind IN ('absolute', 'delayed')),
                    delay_secs INTEGER,
                    fire_at INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS alarm (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    wake_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_container_schedules_fire_at
                    ON container_schedules(fire_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Key/value slot ───────────────────────────────────────────────

    pub fn get_value(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .with_context(|| format!("Failed to read key {}", key))
    }

    pub fn put_value(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .with_context(|| format!("Failed to write key {}", key))?;
        Ok(())
    }

    pub fn get_status(&self) -> Result<ContainerStatus> {
        match self.get_value(STATUS_KEY)? {
            Some(raw) => serde_json::from_str(&raw).context("Corrupt container status"),
            None => Ok(ContainerStatus::default()),
        }
    }

    pub fn put_status(&self, status: &ContainerStatus) -> Result<()> {
        let raw = serde_json::to_string(status).context("Failed to encode container status")?;
        self.put_value(STATUS_KEY, &raw)
    }

    pub fn compare_and_set_status(&self, expected: ProcessState, next: ProcessState) -> Result<bool> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin status transaction")?;
        let current = self.get_status()?;
        if current.state != expected {
            return Ok(false);
        }
        self.put_status(&ContainerStatus::new(next))?;
        tx.commit().context("Failed to commit status transaction")?;
        Ok(true)
    }

    // ── Scheduled tasks ──────────────────────────────────────────────

    pub fn insert_task(&self, task: &ScheduledTask) -> Result<()> {
        let payload =
            serde_json::to_string(&task.payload).context("Failed to encode task payload")?;
        let delay_secs = match task.kind {
            TaskKind::Delayed { delay_secs } => Some(delay_secs),
            TaskKind::Absolute => None,
        };
        self.conn
            .execute(
                "INSERT OR REPLACE INTO container_schedules
                    (id, callback, payload, kind, delay_secs, fire_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    task.id,
                    task.callback,
                    payload,
                    task.kind.as_str(),
                    delay_secs,
                    task.fire_at,
                    task.created_at
                ],
            )
            .context("Failed to insert scheduled task")?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, callback, payload, kind, delay_secs, fire_at, created_at
                 FROM container_schedules WHERE id = ?1",
                params![id],
                TaskRow::from_row,
            )
            .optional()
            .context("Failed to query scheduled task")?;
        row.map(TaskRow::into_task).transpose()
    }

    /// All pending tasks, earliest first.
    pub fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, callback, payload, kind, delay_secs, fire_at, created_at
             FROM container_schedules ORDER BY fire_at ASC, created_at ASC",
        )?;
        let rows = stmt
            .query_map([], TaskRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list scheduled tasks")?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    pub fn delete_task(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM container_schedules WHERE id = ?1", params![id])
            .context("Failed to delete scheduled task")?;
        Ok(affected > 0)
    }

    pub fn count_tasks(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM container_schedules", [], |row| {
                row.get(0)
            })
            .context("Failed to count scheduled tasks")
    }

    // ── Wake-up time ────────────────────────────────────────────────

    /// Pending wake-up as unix milliseconds.
    pub fn get_wake_time(&self) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT wake_at FROM alarm WHERE id = 1", [], |row| row.get(0))
            .optional()
            .context("Failed to read wake time")
    }

    pub fn set_wake_time(&self, wake_at_ms: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO alarm (id, wake_at) VALUES (1, ?1)",
                params![wake_at_ms],
            )
            .context("Failed to set wake time")?;
        Ok(())
    }

    pub fn clear_wake_time(&self) -> Result<()> {
        self.conn
            .execute("DELETE FROM alarm WHERE id = 1", [])
            .context("Failed to clear wake time")?;
        Ok(())
    }
}

/// Intermediate row type for scheduled tasks; converted into the model once
/// the JSON payload and kind have been validated.
struct TaskRow {
    id: String,
    callback: String,
    payload: String,
    kind: String,
    delay_secs: Option<i64>,
    fire_at: i64,
    created_at: i64,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            callback: row.get(1)?,
            payload: row.get(2)?,
            kind: row.get(3)?,
            delay_secs: row.get(4)?,
            fire_at: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_task(self) -> Result<ScheduledTask> {
        let payload = serde_json::from_str(&self.payload)
            .with_context(|| format!("Corrupt payload for task {}", self.id))?;
        let kind = match self.kind.as_str() {
            "absolute" => TaskKind::Absolute,
            "delayed" => TaskKind::Delayed {
                delay_secs: self.delay_secs.unwrap_or_default(),
            },
            other => anyhow::bail!("Invalid task kind '{}' for task {}", other, self.id),
        };
        Ok(ScheduledTask {
            id: self.id,
            callback: self.callback,
            payload,
            kind,
            fire_at: self.fire_at,
            created_at: self.created_at,
        })
    }
}
