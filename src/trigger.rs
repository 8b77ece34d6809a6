//! Caller-side timer that calls [`SyncEngine::sync`] periodically.
//!
//! Failures are logged and the next tick simply tries again; there is no
//! backoff. Hosts that want one should drive `sync()` themselves.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::engine::{SyncEngine, SyncOutcome};
use crate::gateway::RemoteGateway;

/// Handle to a running periodic sync task. Dropping it stops the task.
pub struct PeriodicSync {
    handle: JoinHandle<()>,
}

impl PeriodicSync {
    /// Stop ticking. A cycle already in flight is aborted at its next await;
    /// the queue tolerates that like a crash.
    pub fn stop(self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PeriodicSync {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawn a task on the current tokio runtime that syncs every `interval`,
/// starting immediately.
pub fn spawn_periodic<G>(engine: Arc<SyncEngine<G>>, interval: Duration) -> PeriodicSync
where
    G: RemoteGateway + 'static,
{
    let period = interval.max(Duration::from_millis(1));
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match engine.sync().await {
                Ok(SyncOutcome::Completed(report)) => {
                    debug!(pulled = report.pulled, pushed = report.pushed, "periodic sync done")
                }
                Ok(SyncOutcome::AlreadyRunning) => debug!("periodic tick skipped"),
                Err(e) => warn!(error = %e, retryable = e.is_retryable(), "periodic sync failed"),
            }
        }
    });
    PeriodicSync { handle }
}

/// [`spawn_periodic`] with the engine's configured interval, if any.
pub fn spawn_configured<G>(engine: Arc<SyncEngine<G>>) -> Option<PeriodicSync>
where
    G: RemoteGateway + 'static,
{
    let interval = engine.config().sync_interval?;
    Some(spawn_periodic(engine, interval))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::entity::{EntityType, Record};
    use crate::memory::MemoryGateway;
    use crate::store::LocalStore;

    fn engine(config: SyncConfig) -> Arc<SyncEngine<MemoryGateway>> {
        Arc::new(SyncEngine::new(
            LocalStore::open_in_memory().unwrap(),
            Arc::new(MemoryGateway::new()),
            config,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_drain_the_queue_and_survive_failures() {
        let engine = engine(SyncConfig::default());
        engine.gateway().set_offline(true);
        engine
            .store()
            .create(EntityType::Member, &Record::new("m1"))
            .unwrap();

        let periodic = spawn_periodic(engine.clone(), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(engine.stats().cycles_failed, 1);
        assert_eq!(engine.store().queue_len().unwrap(), 1);

        engine.gateway().set_offline(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(engine.stats().cycles_completed, 1);
        assert_eq!(engine.store().queue_len().unwrap(), 0);
        assert!(engine.gateway().get(EntityType::Member, "m1").is_some());

        periodic.stop();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(engine.stats().cycles_completed, 1);
    }

    #[tokio::test]
    async fn configured_interval_is_optional() {
        assert!(spawn_configured(engine(SyncConfig::default())).is_none());
        let periodic = spawn_configured(engine(
            SyncConfig::default().with_sync_interval(Duration::from_secs(5)),
        ));
        assert!(periodic.is_some());
    }
}
