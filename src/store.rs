use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::debug;

use crate::checkpoint::{CheckpointMode, CheckpointStore};
use crate::entity::{EntityType, Record};
use crate::error::{SyncError, SyncResult};
use crate::queue::{MutationQueue, Operation, QUEUE_SCHEMA, QueueEntry, QueueStatus};

/// Local replica plus mutation queue, sharing one SQLite connection.
///
/// Cheap to clone; every clone talks to the same database. The connection
/// lock is only held for the duration of a single local transaction, never
/// across a network call.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
}

impl LocalStore {
    /// Open (or create) a database file and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> SyncResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> SyncResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create queue, key/value and replica tables. Safe to call multiple times.
    pub fn init_schema(&self) -> SyncResult<()> {
        let conn = self.conn.lock();
        // In-memory databases answer "memory" and stay that way.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        conn.execute_batch(QUEUE_SCHEMA)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_kv (
k TEXT PRIMARY KEY,
v TEXT NOT NULL
);",
        )?;
        for entity in EntityType::ALL {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
id TEXT PRIMARY KEY,
updated_at TEXT,
body TEXT NOT NULL -- JSON snapshot
);",
                entity.local_table()
            ))?;
        }
        Ok(())
    }

    /// Write a new record and queue a `CREATE`. Returns the queue entry id.
    pub fn create(&self, entity: EntityType, record: &Record) -> SyncResult<i64> {
        self.with_tx(|tx| {
            put_record(tx, entity, record)?;
            MutationQueue::new(tx).enqueue(entity, &record.id, Operation::Create, Some(record))
        })
        .inspect(|entry| debug!(%entity, id = %record.id, entry, "local create queued"))
    }

    /// Replace an existing record and queue an `UPDATE`.
    pub fn update(&self, entity: EntityType, record: &Record) -> SyncResult<i64> {
        self.with_tx(|tx| {
            if get_record(tx, entity, &record.id)?.is_none() {
                return Err(SyncError::NotFound {
                    entity,
                    id: record.id.clone(),
                });
            }
            put_record(tx, entity, record)?;
            MutationQueue::new(tx).enqueue(entity, &record.id, Operation::Update, Some(record))
        })
        .inspect(|entry| debug!(%entity, id = %record.id, entry, "local update queued"))
    }

    /// Remove a record and queue a `DELETE`.
    pub fn delete(&self, entity: EntityType, id: &str) -> SyncResult<i64> {
        self.with_tx(|tx| {
            if !delete_record(tx, entity, id)? {
                return Err(SyncError::NotFound {
                    entity,
                    id: id.to_string(),
                });
            }
            MutationQueue::new(tx).enqueue(entity, id, Operation::Delete, None)
        })
        .inspect(|entry| debug!(%entity, id, entry, "local delete queued"))
    }

    pub fn get(&self, entity: EntityType, id: &str) -> SyncResult<Option<Record>> {
        get_record(&self.conn.lock(), entity, id)
    }

    /// All replica records of one type ordered by id.
    pub fn list(&self, entity: EntityType) -> SyncResult<Vec<Record>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT body FROM {} ORDER BY id ASC",
            entity.local_table()
        ))?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for body in rows {
            out.push(serde_json::from_str(&body?)?);
        }
        Ok(out)
    }

    pub fn pending_entries(&self) -> SyncResult<Vec<QueueEntry>> {
        MutationQueue::new(&self.conn.lock()).pending()
    }

    pub fn entries_with_status(&self, status: QueueStatus) -> SyncResult<Vec<QueueEntry>> {
        MutationQueue::new(&self.conn.lock()).entries_with_status(status)
    }

    pub fn queue_len(&self) -> SyncResult<usize> {
        MutationQueue::new(&self.conn.lock()).len()
    }

    /// Drop a stuck queue entry. Its local change will never reach the remote.
    pub fn discard(&self, entry_id: i64) -> SyncResult<bool> {
        MutationQueue::new(&self.conn.lock()).discard(entry_id)
    }

    /// Newest pull watermark under `mode`.
    pub fn checkpoint(&self, mode: CheckpointMode) -> SyncResult<Option<DateTime<Utc>>> {
        CheckpointStore::new(&self.conn.lock(), mode).latest()
    }

    /// Run `f` with the connection locked.
    pub fn with_conn<R, F>(&self, f: F) -> SyncResult<R>
    where
        F: FnOnce(&Connection) -> SyncResult<R>,
    {
        f(&self.conn.lock())
    }

    /// Execute closure `f` inside a transaction and commit if `f` returns Ok.
    pub fn with_tx<R, F>(&self, f: F) -> SyncResult<R>
    where
        F: FnOnce(&Transaction<'_>) -> SyncResult<R>,
    {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

/// Overwrite replica rows by id without touching the queue.
///
/// Runs on the caller's connection or transaction; the pull merge writes its
/// rows and the matching checkpoint through one transaction this way.
pub fn bulk_put(conn: &Connection, entity: EntityType, records: &[Record]) -> SyncResult<usize> {
    for record in records {
        put_record(conn, entity, record)?;
    }
    Ok(records.len())
}

fn put_record(conn: &Connection, entity: EntityType, record: &Record) -> SyncResult<()> {
    record.check_fields()?;
    let updated_at = record
        .updated_at
        .map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true));
    conn.execute(
        &format!(
            "INSERT INTO {}(id, updated_at, body) VALUES(?1, ?2, ?3)
ON CONFLICT(id) DO UPDATE SET updated_at=excluded.updated_at, body=excluded.body",
            entity.local_table()
        ),
        params![record.id, updated_at, serde_json::to_string(record)?],
    )?;
    Ok(())
}

fn get_record(conn: &Connection, entity: EntityType, id: &str) -> SyncResult<Option<Record>> {
    let body: Option<String> = conn
        .query_row(
            &format!("SELECT body FROM {} WHERE id = ?1", entity.local_table()),
            params![id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(body.as_deref().map(serde_json::from_str).transpose()?)
}

fn delete_record(conn: &Connection, entity: EntityType, id: &str) -> SyncResult<bool> {
    let n = conn.execute(
        &format!("DELETE FROM {} WHERE id = ?1", entity.local_table()),
        params![id],
    )?;
    Ok(n > 0)
}
