//! Configuration for the sync engine.

use std::time::Duration;

use serde::Deserialize;

use crate::checkpoint::CheckpointMode;

/// Tuning knobs for [`SyncEngine`](crate::SyncEngine).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Combined or per-entity-type pull watermark.
    pub checkpoint_mode: CheckpointMode,
    /// Maximum records per push or delete call.
    pub push_batch_size: usize,
    /// Period for [`spawn_configured`](crate::spawn_configured); `None`
    /// leaves scheduling entirely to the caller.
    #[serde(with = "duration_secs")]
    pub sync_interval: Option<Duration>,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self {
            checkpoint_mode: CheckpointMode::Combined,
            push_batch_size: 500,
            sync_interval: None,
        }
    }

    pub fn with_checkpoint_mode(mut self, mode: CheckpointMode) -> Self {
        self.checkpoint_mode = mode;
        self
    }

    /// Values below 1 are treated as 1.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
