use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::batch::{self, BatchKind};
use crate::checkpoint::{CheckpointMode, CheckpointStore};
use crate::config::SyncConfig;
use crate::entity::EntityType;
use crate::error::{SyncError, SyncResult};
use crate::gateway::{GatewayError, RemoteAction, RemoteGateway};
use crate::merge;
use crate::queue::{MutationQueue, QueueStatus};
use crate::store::LocalStore;

/// Cumulative counters across cycles.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    /// Calls that found another cycle running.
    pub cycles_skipped: u64,
    pub records_pushed: u64,
    pub records_deleted: u64,
    pub records_pulled: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// What one completed cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub pushed: usize,
    pub deleted: usize,
    pub pulled: usize,
    /// Newest pull watermark after the cycle.
    pub checkpoint: Option<DateTime<Utc>>,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another cycle was in flight; nothing was done.
    AlreadyRunning,
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            SyncOutcome::AlreadyRunning => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, SyncOutcome::AlreadyRunning)
    }
}

/// Clears the running flag however the cycle ends, including when the
/// future is dropped mid-flight.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Push-then-pull reconciliation of a [`LocalStore`] against a remote.
///
/// Build one per process and share it (`Arc<SyncEngine<_>>`). At most one
/// cycle runs at a time; concurrent calls return
/// [`SyncOutcome::AlreadyRunning`] without touching the network.
pub struct SyncEngine<G: RemoteGateway> {
    store: LocalStore,
    gateway: Arc<G>,
    config: SyncConfig,
    running: AtomicBool,
    stats: RwLock<SyncStats>,
}

impl<G: RemoteGateway> SyncEngine<G> {
    pub fn new(store: LocalStore, gateway: Arc<G>, config: SyncConfig) -> Self {
        Self {
            store,
            gateway,
            config,
            running: AtomicBool::new(false),
            stats: RwLock::new(SyncStats::default()),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one full cycle: push the queue, then pull and merge.
    ///
    /// Errors leave the queue and checkpoint consistent; call again later.
    #[tracing::instrument(skip(self))]
    pub async fn sync(&self) -> SyncResult<SyncOutcome> {
        self.run(true, true).await
    }

    /// Push phase only.
    #[tracing::instrument(skip(self))]
    pub async fn push_pending(&self) -> SyncResult<SyncOutcome> {
        self.run(true, false).await
    }

    /// Pull phase only.
    #[tracing::instrument(skip(self))]
    pub async fn pull_remote(&self) -> SyncResult<SyncOutcome> {
        self.run(false, true).await
    }

    fn try_begin(&self) -> Option<CycleGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleGuard(&self.running))
    }

    async fn run(&self, push: bool, pull: bool) -> SyncResult<SyncOutcome> {
        let Some(_guard) = self.try_begin() else {
            debug!("sync already in progress, skipping");
            self.stats.write().cycles_skipped += 1;
            return Ok(SyncOutcome::AlreadyRunning);
        };

        let start = Instant::now();
        match self.cycle(push, pull).await {
            Ok(mut report) => {
                report.duration = start.elapsed();
                let mut stats = self.stats.write();
                stats.cycles_completed += 1;
                stats.records_pushed += report.pushed as u64;
                stats.records_deleted += report.deleted as u64;
                stats.records_pulled += report.pulled as u64;
                stats.last_success = Some(Utc::now());
                stats.last_error = None;
                info!(
                    pushed = report.pushed,
                    deleted = report.deleted,
                    pulled = report.pulled,
                    elapsed_ms = report.duration.as_millis() as u64,
                    "sync cycle complete"
                );
                Ok(SyncOutcome::Completed(report))
            }
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "sync cycle failed");
                let mut stats = self.stats.write();
                stats.cycles_failed += 1;
                stats.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn cycle(&self, push: bool, pull: bool) -> SyncResult<SyncReport> {
        let mut report = SyncReport::default();
        if push {
            (report.pushed, report.deleted) = self.push_phase().await?;
        }
        if pull {
            report.pulled = self.pull_phase().await?;
        }
        report.checkpoint = self.store.checkpoint(self.config.checkpoint_mode)?;
        Ok(report)
    }

    /// Send queued entries, removing each batch's entries once it is acked.
    /// Stops at the first failed batch so nothing is pushed ahead of a type
    /// it depends on.
    async fn push_phase(&self) -> SyncResult<(usize, usize)> {
        let entries = self.store.pending_entries()?;
        if entries.is_empty() {
            debug!("mutation queue empty");
            return Ok((0, 0));
        }
        let batches = batch::plan(&entries, self.config.push_batch_size)?;
        let mut outstanding: BTreeSet<i64> = entries.iter().map(|e| e.id).collect();
        let ids: Vec<i64> = outstanding.iter().copied().collect();
        self.store
            .with_conn(|c| MutationQueue::new(c).mark_syncing(&ids))?;
        debug!(entries = entries.len(), batches = batches.len(), "push started");

        let (mut pushed, mut deleted) = (0, 0);
        for batch in &batches {
            let result = match &batch.kind {
                BatchKind::Upsert(records) => self.gateway.push(batch.entity, records).await,
                BatchKind::Delete(ids) => self.gateway.delete(batch.entity, ids).await,
            };
            for id in &batch.entry_ids {
                outstanding.remove(id);
            }

            if let Err(source) = result {
                let status = match source {
                    GatewayError::Conflict(_) => QueueStatus::Conflict,
                    _ => QueueStatus::Failed,
                };
                let message = source.to_string();
                let rest: Vec<i64> = outstanding.iter().copied().collect();
                self.store.with_conn(|c| {
                    let queue = MutationQueue::new(c);
                    queue.mark_failed(&batch.entry_ids, status, &message)?;
                    queue.release(&rest)
                })?;
                warn!(
                    entity = %batch.entity,
                    action = %batch.action(),
                    count = batch.len(),
                    error = %source,
                    "push batch failed"
                );
                return Err(SyncError::Remote {
                    entity: batch.entity,
                    action: batch.action(),
                    source,
                });
            }

            self.store
                .with_conn(|c| MutationQueue::new(c).remove(&batch.entry_ids))?;
            match batch.kind {
                BatchKind::Upsert(_) => pushed += batch.len(),
                BatchKind::Delete(_) => deleted += batch.len(),
            }
            debug!(
                entity = %batch.entity,
                action = %batch.action(),
                count = batch.len(),
                "batch acknowledged"
            );
        }
        Ok((pushed, deleted))
    }

    /// Pull every type since its watermark and merge. Returns records merged.
    async fn pull_phase(&self) -> SyncResult<usize> {
        let mode = self.config.checkpoint_mode;
        let mut newest: Option<DateTime<Utc>> = None;
        let mut pulled = 0;

        for entity in EntityType::ALL {
            // Combined mode reads the same value every time: it only moves
            // after the loop.
            let since = self
                .store
                .with_conn(|c| CheckpointStore::new(c, mode).get(entity))?;
            let records = self
                .gateway
                .pull(entity, since)
                .await
                .map_err(|source| SyncError::Remote {
                    entity,
                    action: RemoteAction::Pull,
                    source,
                })?;

            let seen = self.store.with_tx(|tx| {
                let seen = merge::apply_pulled(tx, entity, &records)?;
                if let (CheckpointMode::PerEntityType, Some(at)) = (mode, seen) {
                    CheckpointStore::new(tx, mode).advance(entity, at)?;
                }
                Ok(seen)
            })?;
            newest = newest.max(seen);
            pulled += records.len();
            if !records.is_empty() {
                debug!(%entity, count = records.len(), ?since, "merged pulled records");
            }
        }

        if let (CheckpointMode::Combined, Some(at)) = (mode, newest) {
            let advanced = self
                .store
                .with_conn(|c| CheckpointStore::new(c, mode).advance_combined(at))?;
            if advanced {
                debug!(checkpoint = %at, "pull checkpoint advanced");
            }
        }
        Ok(pulled)
    }
}
