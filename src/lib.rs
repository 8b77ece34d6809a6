//! Offline-first sync for the registry's local replica.
//!
//! Local writes go through [`LocalStore`], which updates the replica and
//! appends to the mutation queue in one SQLite transaction. [`SyncEngine`]
//! later pushes the queue through a [`RemoteGateway`] in dependency order,
//! pulls newer remote records since the stored checkpoint, and overwrites
//! the replica with them (record-level last writer wins).

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod merge;
pub mod queue;
pub mod store;
pub mod trigger;

pub use checkpoint::{CheckpointMode, CheckpointStore};
pub use config::SyncConfig;
pub use engine::{SyncEngine, SyncOutcome, SyncReport, SyncStats};
pub use entity::{EntityType, Record};
pub use error::{SyncError, SyncResult};
pub use gateway::{GatewayError, RemoteAction, RemoteGateway};
pub use memory::{GatewayCall, MemoryGateway};
pub use queue::{MutationQueue, Operation, QueueEntry, QueueStatus};
pub use store::LocalStore;
pub use trigger::{PeriodicSync, spawn_configured, spawn_periodic};
