#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use registry_sync::{EntityType, LocalStore, MemoryGateway, SyncConfig, SyncEngine};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

pub fn engine_with(
    store: LocalStore,
    remote: Arc<MemoryGateway>,
    config: SyncConfig,
) -> SyncEngine<MemoryGateway> {
    init_tracing();
    SyncEngine::new(store, remote, config)
}

pub fn engine() -> SyncEngine<MemoryGateway> {
    engine_with(
        LocalStore::open_in_memory().unwrap(),
        Arc::new(MemoryGateway::new()),
        SyncConfig::default(),
    )
}

/// Replica and remote hold exactly the same records for every type.
pub fn assert_converged(store: &LocalStore, remote: &MemoryGateway) {
    for entity in EntityType::ALL {
        assert_eq!(
            store.list(entity).unwrap(),
            remote.records(entity),
            "{entity} diverged"
        );
    }
}
