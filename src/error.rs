use thiserror::Error;

use crate::entity::{EntityType, UnknownTag};
use crate::gateway::{GatewayError, RemoteAction};

/// Result type used throughout the crate.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// A gateway call failed. Everything pushed before it stays pushed.
    #[error("remote {action} on {entity} failed: {source}")]
    Remote {
        entity: EntityType,
        action: RemoteAction,
        source: GatewayError,
    },
    /// `id` and `updated_at` live outside `Record::fields`; a copy inside
    /// would serialize as a duplicate key.
    #[error("record {id:?} carries reserved field {key:?}")]
    ReservedField { id: String, key: String },
    #[error("{entity} record {id:?} not found")]
    NotFound { entity: EntityType, id: String },
    #[error("invalid timestamp {value:?}: {source}")]
    Timestamp {
        value: String,
        source: chrono::ParseError,
    },
    #[error(transparent)]
    UnknownTag(#[from] UnknownTag),
    #[error("invalid state: {0}")]
    State(&'static str),
}

impl SyncError {
    /// True when calling `sync()` again later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote { source, .. } => source.is_retryable(),
            SyncError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
