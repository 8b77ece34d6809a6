//! Boundary to the remote authoritative store.
//!
//! Implementations talk to the concrete backend (REST, Postgres, ...). The
//! engine relies on three guarantees:
//!
//! - `push` is an upsert by id, so replaying a batch never duplicates rows;
//! - `delete` ignores ids that are already gone;
//! - `pull` returns records with `updated_at` strictly greater than `since`
//!   (everything when `since` is `None`), ascending by `updated_at`.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::entity::{EntityType, Record};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Network failure, timeout, or 5xx. Worth retrying later.
    #[error("transport: {0}")]
    Transport(String),
    /// Remote refused the payload (validation, permissions).
    #[error("rejected: {0}")]
    Rejected(String),
    /// Remote refused because of a concurrent change it will not overwrite.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transport(_))
    }
}

/// Which gateway call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteAction {
    Push,
    Delete,
    Pull,
}

impl fmt::Display for RemoteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RemoteAction::Push => "push",
            RemoteAction::Delete => "delete",
            RemoteAction::Pull => "pull",
        })
    }
}

/// Per-entity-type remote operations. The remote table is
/// [`EntityType::remote_table`].
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn push(&self, entity: EntityType, records: &[Record]) -> Result<(), GatewayError>;

    async fn delete(&self, entity: EntityType, ids: &[String]) -> Result<(), GatewayError>;

    async fn pull(
        &self,
        entity: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Record>, GatewayError>;
}
