use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Argument bag handed verbatim to a remote operation.
pub type Arguments = serde_json::Map<String, serde_json::Value>;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid timestamp in queue entry {0}: {1}")]
    InvalidTimestamp(String, String),
    #[error("Queue connection lock poisoned")]
    LockPoisoned,
    #[error("Database corruption detected: {0}")]
    DatabaseCorruption(String),
}

/// A state-changing call waiting to be replayed against the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Unique within the queue, always prefixed by the operation name
    pub id: String,
    /// Namespaced operation identifier, e.g. `sessions.start`
    pub operation_name: String,
    /// Exact payload the remote operation expects
    pub arguments: Arguments,
    /// When the operation was queued
    pub enqueued_at: DateTime<Utc>,
    /// Number of failed replays so far
    pub retry_count: u32,
}

impl QueuedOperation {
    pub fn new(operation_name: &str, arguments: Arguments) -> Self {
        Self {
            id: generate_operation_id(operation_name),
            operation_name: operation_name.to_string(),
            arguments,
            enqueued_at: Utc::now(),
            retry_count: 0,
        }
    }
}

/// Builds a queue id of the form `{operation_name}-{uuid}`.
pub fn generate_operation_id(operation_name: &str) -> String {
    format!("{}-{}", operation_name, uuid::Uuid::new_v4())
}

/// Operations of the durable store holding pending mutations.
///
/// Every method is a single-record (or single-statement) operation; no
/// cross-record transactions are needed because entries are independent.
pub trait QueueOps: Send + Sync {
    /// Persist a new operation with `retry_count = 0` and return its id
    fn enqueue(&self, operation_name: &str, arguments: Arguments) -> Result<String, QueueError>;

    /// All pending operations, oldest first
    fn list_all(&self) -> Result<Vec<QueuedOperation>, QueueError>;

    /// Look up a single operation
    fn get(&self, id: &str) -> Result<Option<QueuedOperation>, QueueError>;

    /// Remove an operation; unknown ids are a no-op
    fn remove(&self, id: &str) -> Result<(), QueueError>;

    /// Set the retry count; unknown ids are a no-op and the count never decreases
    fn update_retry_count(&self, id: &str, new_count: u32) -> Result<(), QueueError>;

    /// Number of pending operations
    fn count(&self) -> Result<usize, QueueError>;

    /// Drop every pending operation
    fn clear(&self) -> Result<usize, QueueError>;
}

pub struct Queue {
    conn: Mutex<Connection>,
}

impl QueueOps for Queue {
    fn enqueue(&self, operation_name: &str, arguments: Arguments) -> Result<String, QueueError> {
        let operation = QueuedOperation::new(operation_name, arguments);
        let data = serde_json::to_string(&operation.arguments)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO operations (id, operation_name, arguments, enqueued_at, retry_count)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                operation.id,
                operation.operation_name,
                data,
                operation.enqueued_at.to_rfc3339()
            ],
        )?;

        let current_count = Self::count_rows(&conn)?;
        tracing::info!(
            operation = "enqueue",
            operation_id = %operation.id,
            operation_name = %operation.operation_name,
            queue_size = current_count,
            "Operation added to queue"
        );

        Ok(operation.id)
    }

    fn list_all(&self) -> Result<Vec<QueuedOperation>, QueueError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, operation_name, arguments, enqueued_at, retry_count
             FROM operations ORDER BY seq ASC",
        )?;

        let rows = stmt.query_map([], Self::read_row)?;

        let mut operations = Vec::new();
        for row in rows {
            operations.push(Self::decode(row?)?);
        }

        Ok(operations)
    }

    fn get(&self, id: &str) -> Result<Option<QueuedOperation>, QueueError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, operation_name, arguments, enqueued_at, retry_count
                 FROM operations WHERE id = ?1",
                params![id],
                Self::read_row,
            )
            .optional()?;

        row.map(Self::decode).transpose()
    }

    fn remove(&self, id: &str) -> Result<(), QueueError> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM operations WHERE id = ?1", params![id])?;

        let current_count = Self::count_rows(&conn)?;
        tracing::info!(
            operation = "remove",
            operation_id = %id,
            removed = removed > 0,
            queue_size = current_count,
            "Operation removed from queue"
        );

        Ok(())
    }

    fn update_retry_count(&self, id: &str, new_count: u32) -> Result<(), QueueError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE operations SET retry_count = ?1 WHERE id = ?2 AND retry_count <= ?1",
            params![new_count, id],
        )?;

        tracing::debug!(
            operation = "update_retry_count",
            operation_id = %id,
            retry_count = new_count,
            updated = updated > 0,
            "Operation retry count updated"
        );

        Ok(())
    }

    fn count(&self) -> Result<usize, QueueError> {
        let conn = self.conn()?;
        Self::count_rows(&conn)
    }

    fn clear(&self) -> Result<usize, QueueError> {
        let conn = self.conn()?;
        let rows_affected = conn.execute("DELETE FROM operations", [])?;

        if rows_affected > 0 {
            tracing::info!(
                operation = "clear",
                entries_removed = rows_affected,
                "Queue cleared"
            );
        }

        Ok(rows_affected)
    }
}

type RawRow = (String, String, String, String, u32);

impl Queue {
    /// Open the queue at the default location (`~/.session-sync/queue.db`)
    pub fn new() -> Result<Self, QueueError> {
        let db_path = Self::default_db_path()?;
        Self::with_path(db_path)
    }

    /// Open (or create) the queue at a specific path
    pub fn with_path(db_path: PathBuf) -> Result<Self, QueueError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Self::open_with_corruption_handling(&db_path)?;
        Self::init_database(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Non-persistent queue, mostly for tests and dry runs
    pub fn in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        Self::init_database(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
        self.conn.lock().map_err(|_| QueueError::LockPoisoned)
    }

    fn count_rows(conn: &Connection) -> Result<usize, QueueError> {
        let count: usize = conn.query_row("SELECT COUNT(*) FROM operations", [], |row| row.get(0))?;
        Ok(count)
    }

    fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }

    fn decode(raw: RawRow) -> Result<QueuedOperation, QueueError> {
        let (id, operation_name, arguments, enqueued_at, retry_count) = raw;
        let arguments: Arguments = serde_json::from_str(&arguments)?;
        let enqueued_at = DateTime::parse_from_rfc3339(&enqueued_at)
            .map_err(|e| QueueError::InvalidTimestamp(id.clone(), e.to_string()))?
            .with_timezone(&Utc);

        Ok(QueuedOperation {
            id,
            operation_name,
            arguments,
            enqueued_at,
            retry_count,
        })
    }

    /// Initialize database schema and indexes
    fn init_database(conn: &Connection) -> Result<(), QueueError> {
        Self::create_schema(conn)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        if current_version < 1 {
            conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
        }

        Ok(())
    }

    fn create_schema(conn: &Connection) -> Result<(), QueueError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS operations (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                operation_name TEXT NOT NULL,
                arguments TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_operations_name ON operations(operation_name)",
            [],
        )?;

        Ok(())
    }

    /// Open database connection with corruption handling
    fn open_with_corruption_handling(db_path: &Path) -> Result<Connection, QueueError> {
        match Connection::open(db_path) {
            Ok(conn) => {
                if let Err(e) = Self::verify_database_integrity(&conn) {
                    tracing::warn!(path = %db_path.display(), error = %e, "Queue database failed integrity check");
                    drop(conn);
                    return Self::attempt_database_recovery(db_path);
                }
                Ok(conn)
            }
            Err(e) => {
                tracing::warn!(path = %db_path.display(), error = %e, "Queue database could not be opened");
                Self::attempt_database_recovery(db_path)
            }
        }
    }

    fn verify_database_integrity(conn: &Connection) -> Result<(), QueueError> {
        let result: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;

        if result.eq_ignore_ascii_case("ok") {
            Ok(())
        } else {
            Err(QueueError::DatabaseCorruption(format!(
                "Database integrity check failed: {}",
                result
            )))
        }
    }

    /// Move the damaged file aside and start from an empty database
    fn attempt_database_recovery(db_path: &Path) -> Result<Connection, QueueError> {
        let backup_path = db_path.with_extension("db.backup");

        if db_path.exists() {
            std::fs::copy(db_path, &backup_path).map_err(|e| {
                QueueError::DatabaseCorruption(format!("Failed to create backup: {}", e))
            })?;
            std::fs::remove_file(db_path).map_err(|e| {
                QueueError::DatabaseCorruption(format!("Failed to remove corrupted database: {}", e))
            })?;
            tracing::warn!(backup = %backup_path.display(), "Corrupted queue database backed up");
        }

        let conn = Connection::open(db_path)?;
        Self::create_schema(&conn)?;
        Ok(conn)
    }

    pub fn default_db_path() -> Result<PathBuf, QueueError> {
        let mut dir = dirs::home_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "Could not determine home directory")
        })?;

        dir.push(".session-sync");
        std::fs::create_dir_all(&dir)?;

        dir.push("queue.db");
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn args(value: serde_json::Value) -> Arguments {
        value.as_object().cloned().unwrap_or_default()
    }

    fn create_test_queue() -> Result<(tempfile::TempDir, Queue), QueueError> {
        let temp_dir = tempfile::tempdir()?;
        let queue = Queue::with_path(temp_dir.path().join("test_queue.db"))?;
        Ok((temp_dir, queue))
    }

    #[test]
    fn test_queue_error_variants() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        assert!(QueueError::Io(io_error).to_string().contains("IO error:"));

        let serde_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        assert!(QueueError::Serialization(serde_error)
            .to_string()
            .contains("Serialization error:"));

        assert_eq!(
            QueueError::LockPoisoned.to_string(),
            "Queue connection lock poisoned"
        );
        assert!(QueueError::DatabaseCorruption("bad page".to_string())
            .to_string()
            .contains("Database corruption detected: bad page"));
    }

    #[test]
    fn test_enqueue_returns_unique_ids_containing_name() -> Result<(), QueueError> {
        let queue = Queue::in_memory()?;

        let mut seen = HashSet::new();
        for _ in 0..20 {
            let id = queue.enqueue("sessions.start", Arguments::new())?;
            assert!(id.contains("sessions.start"));
            assert!(seen.insert(id), "ids must be unique");
        }

        assert_eq!(queue.count()?, 20);
        Ok(())
    }

    #[test]
    fn test_enqueue_persists_entry() -> Result<(), QueueError> {
        let (_temp_dir, queue) = create_test_queue()?;
        let payload = args(json!({"session_id": "s-1", "duration": 1500, "tags": ["deep"]}));

        let id = queue.enqueue("sessions.complete", payload.clone())?;

        let entry = queue.get(&id)?.expect("entry should exist");
        assert_eq!(entry.operation_name, "sessions.complete");
        assert_eq!(entry.arguments, payload);
        assert_eq!(entry.retry_count, 0);
        Ok(())
    }

    #[test]
    fn test_list_all_is_fifo() -> Result<(), QueueError> {
        let (_temp_dir, queue) = create_test_queue()?;

        let a = queue.enqueue("sessions.start", Arguments::new())?;
        let b = queue.enqueue("preferences.update", Arguments::new())?;
        let c = queue.enqueue("sessions.complete", Arguments::new())?;

        let ids: Vec<String> = queue.list_all()?.into_iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![a, b, c]);
        Ok(())
    }

    #[test]
    fn test_count_after_enqueues_and_removes() -> Result<(), QueueError> {
        let queue = Queue::in_memory()?;

        let ids: Vec<String> = (0..7)
            .map(|_| queue.enqueue("sessions.start", Arguments::new()))
            .collect::<Result<_, _>>()?;

        for id in ids.iter().take(3) {
            queue.remove(id)?;
        }

        assert_eq!(queue.count()?, 4);
        Ok(())
    }

    #[test]
    fn test_remove_is_idempotent() -> Result<(), QueueError> {
        let queue = Queue::in_memory()?;
        let keep = queue.enqueue("sessions.start", Arguments::new())?;
        let gone = queue.enqueue("sessions.complete", Arguments::new())?;

        queue.remove(&gone)?;
        let after_first = queue.list_all()?;

        queue.remove(&gone)?;
        queue.remove("never-existed")?;

        assert_eq!(queue.list_all()?, after_first);
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0].id, keep);
        Ok(())
    }

    #[test]
    fn test_update_retry_count() -> Result<(), QueueError> {
        let queue = Queue::in_memory()?;
        let id = queue.enqueue("preferences.update", Arguments::new())?;

        queue.update_retry_count(&id, 1)?;
        assert_eq!(queue.get(&id)?.map(|op| op.retry_count), Some(1));

        queue.update_retry_count(&id, 2)?;
        assert_eq!(queue.get(&id)?.map(|op| op.retry_count), Some(2));
        Ok(())
    }

    #[test]
    fn test_update_retry_count_never_decreases() -> Result<(), QueueError> {
        let queue = Queue::in_memory()?;
        let id = queue.enqueue("preferences.update", Arguments::new())?;

        queue.update_retry_count(&id, 3)?;
        queue.update_retry_count(&id, 1)?;

        assert_eq!(queue.get(&id)?.map(|op| op.retry_count), Some(3));
        Ok(())
    }

    #[test]
    fn test_update_retry_count_unknown_id_is_noop() -> Result<(), QueueError> {
        let queue = Queue::in_memory()?;
        queue.enqueue("sessions.start", Arguments::new())?;

        queue.update_retry_count("sessions.start-missing", 4)?;

        assert!(queue.list_all()?.iter().all(|op| op.retry_count == 0));
        Ok(())
    }

    #[test]
    fn test_clear() -> Result<(), QueueError> {
        let queue = Queue::in_memory()?;
        for _ in 0..3 {
            queue.enqueue("sessions.start", Arguments::new())?;
        }

        assert_eq!(queue.clear()?, 3);
        assert_eq!(queue.count()?, 0);
        assert_eq!(queue.clear()?, 0);
        Ok(())
    }

    #[test]
    fn test_queue_survives_reopen() -> Result<(), QueueError> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("queue.db");

        let id = {
            let queue = Queue::with_path(path.clone())?;
            let id = queue.enqueue("sessions.start", args(json!({"label": "focus"})))?;
            queue.update_retry_count(&id, 2)?;
            id
        };

        let reopened = Queue::with_path(path)?;
        let entry = reopened.get(&id)?.expect("entry should survive reopen");
        assert_eq!(entry.retry_count, 2);
        assert_eq!(entry.arguments.get("label"), Some(&json!("focus")));
        Ok(())
    }

    #[test]
    fn test_corrupted_database_is_recovered() -> Result<(), QueueError> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("queue.db");
        std::fs::write(&path, b"this is definitely not a sqlite database file, not at all")?;

        let queue = Queue::with_path(path.clone())?;
        assert_eq!(queue.count()?, 0);
        assert!(path.with_extension("db.backup").exists());
        Ok(())
    }

    #[test]
    fn test_schema_version_recorded() -> Result<(), QueueError> {
        let queue = Queue::in_memory()?;
        let version: i32 = queue.conn()?.query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(version, 1);
        Ok(())
    }
}
