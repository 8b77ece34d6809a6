use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::entity::{EntityType, Record, UnknownTag};
use crate::error::{SyncError, SyncResult};

/// Logical operation captured in the mutation queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    /// Create and update are both sent as upserts.
    pub fn is_upsert(self) -> bool {
        !matches!(self, Operation::Delete)
    }
}

impl FromStr for Operation {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Operation::Create),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => Err(UnknownTag {
                kind: "operation",
                tag: other.to_string(),
            }),
        }
    }
}

/// Lifecycle of a queued entry. Successful entries are removed, not marked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Syncing,
    Failed,
    Conflict,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Syncing => "syncing",
            QueueStatus::Failed => "failed",
            QueueStatus::Conflict => "conflict",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "syncing" => Ok(QueueStatus::Syncing),
            "failed" => Ok(QueueStatus::Failed),
            "conflict" => Ok(QueueStatus::Conflict),
            other => Err(UnknownTag {
                kind: "queue status",
                tag: other.to_string(),
            }),
        }
    }
}

macro_rules! sql_text_enum {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: UnknownTag| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

sql_text_enum!(Operation);
sql_text_enum!(QueueStatus);

/// Local mutation waiting to be pushed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,                 // AUTOINCREMENT, enqueue order
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Option<Record>, // snapshot after the op, None for Delete
    pub local_timestamp: DateTime<Utc>,
    pub attempts: u32,
    pub status: QueueStatus,
    pub last_error: Option<String>,
}

pub(crate) const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mutation_queue (
id INTEGER PRIMARY KEY AUTOINCREMENT,
entity_type TEXT NOT NULL,
entity_id TEXT NOT NULL,
operation TEXT NOT NULL CHECK(operation IN ('CREATE','UPDATE','DELETE')),
payload TEXT, -- JSON (null for DELETE)
local_timestamp TEXT NOT NULL,
attempts INTEGER NOT NULL DEFAULT 0,
status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','syncing','failed','conflict')),
last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_mutation_queue_entity
ON mutation_queue(entity_type, id);
"#;

const ENTRY_COLUMNS: &str =
    "id, entity_type, entity_id, operation, payload, local_timestamp, attempts, status, last_error";

/// Queue operations bound to a connection or an open transaction.
///
/// `enqueue` never opens its own transaction, so an entry appended through a
/// [`rusqlite::Transaction`] commits or rolls back with the replica write
/// that accompanies it. The batch status updates do open one and must be
/// called on a plain connection.
pub struct MutationQueue<'c> {
    conn: &'c Connection,
}

impl<'c> MutationQueue<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Append a pending entry and return its id.
    pub fn enqueue(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        operation: Operation,
        payload: Option<&Record>,
    ) -> SyncResult<i64> {
        if operation.is_upsert() && payload.is_none() {
            return Err(SyncError::State("upsert enqueued without payload"));
        }
        if let Some(record) = payload {
            record.check_fields()?;
        }
        let payload = payload.map(serde_json::to_string).transpose()?;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        self.conn.execute(
            "INSERT INTO mutation_queue
(entity_type, entity_id, operation, payload, local_timestamp, attempts, status)
VALUES (?1, ?2, ?3, ?4, ?5, 0, 'pending')",
            params![entity_type, entity_id, operation, payload, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Every entry still in the queue, oldest first. Failed, conflicting and
    /// interrupted (`syncing`) entries are all included.
    pub fn pending(&self) -> SyncResult<Vec<QueueEntry>> {
        self.select(&format!(
            "SELECT {ENTRY_COLUMNS} FROM mutation_queue ORDER BY id ASC"
        ), [])
    }

    pub fn entries_with_status(&self, status: QueueStatus) -> SyncResult<Vec<QueueEntry>> {
        self.select(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM mutation_queue WHERE status = ?1 ORDER BY id ASC"
            ),
            params![status],
        )
    }

    pub fn get(&self, id: i64) -> SyncResult<Option<QueueEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM mutation_queue WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], read_entry)
            .optional()?)
    }

    pub fn len(&self) -> SyncResult<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM mutation_queue", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn mark_syncing(&self, ids: &[i64]) -> SyncResult<()> {
        self.set_status(ids, QueueStatus::Syncing)
    }

    /// Put entries back to `pending` without counting an attempt.
    pub fn release(&self, ids: &[i64]) -> SyncResult<()> {
        self.set_status(ids, QueueStatus::Pending)
    }

    /// Record a failed push: bump `attempts` and keep the error for display.
    pub fn mark_failed(&self, ids: &[i64], status: QueueStatus, error: &str) -> SyncResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        for id in ids {
            tx.execute(
                "UPDATE mutation_queue
SET status = ?2, attempts = attempts + 1, last_error = ?3
WHERE id = ?1",
                params![id, status, error],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Remove entries whose remote call has succeeded.
    pub fn remove(&self, ids: &[i64]) -> SyncResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        for id in ids {
            tx.execute("DELETE FROM mutation_queue WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Drop a single entry on operator request. Returns whether it existed.
    pub fn discard(&self, id: i64) -> SyncResult<bool> {
        let n = self
            .conn
            .execute("DELETE FROM mutation_queue WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    fn set_status(&self, ids: &[i64], status: QueueStatus) -> SyncResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        for id in ids {
            tx.execute(
                "UPDATE mutation_queue SET status = ?2 WHERE id = ?1",
                params![id, status],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn select<P: rusqlite::Params>(&self, sql: &str, params: P) -> SyncResult<Vec<QueueEntry>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, read_entry)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn read_entry(r: &rusqlite::Row<'_>) -> rusqlite::Result<QueueEntry> {
    let payload: Option<String> = r.get(4)?;
    let payload = payload
        .map(|raw| serde_json::from_str::<Record>(&raw))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    let local_timestamp: String = r.get(5)?;
    let local_timestamp = parse_timestamp(&local_timestamp)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
    let attempts: i64 = r.get(6)?;

    Ok(QueueEntry {
        id: r.get(0)?,
        entity_type: r.get(1)?,
        entity_id: r.get(2)?,
        operation: r.get(3)?,
        payload,
        local_timestamp,
        attempts: attempts as u32,
        status: r.get(7)?,
        last_error: r.get(8)?,
    })
}

pub(crate) fn parse_timestamp(value: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|source| SyncError::Timestamp {
            value: value.to_string(),
            source,
        })
}
