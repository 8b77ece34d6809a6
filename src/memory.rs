//! In-process remote store implementing the gateway contract exactly.
//!
//! Stands in for the real backend in tests and demos. Every call is logged,
//! and transport faults can be injected per entity type and action.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use crate::entity::{EntityType, Record};
use crate::gateway::{GatewayError, RemoteAction, RemoteGateway};

/// One call received by the gateway, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Push {
        entity: EntityType,
        ids: Vec<String>,
    },
    Delete {
        entity: EntityType,
        ids: Vec<String>,
    },
    Pull {
        entity: EntityType,
        since: Option<DateTime<Utc>>,
    },
}

#[derive(Default)]
struct RemoteState {
    tables: HashMap<EntityType, BTreeMap<String, Record>>,
    calls: Vec<GatewayCall>,
    last_stamp: Option<DateTime<Utc>>,
    offline: bool,
    fail_next: HashMap<(EntityType, RemoteAction), GatewayError>,
    lose_ack: HashSet<(EntityType, RemoteAction)>,
}

impl RemoteState {
    /// Server clock: wall time, bumped so stamps are strictly increasing.
    fn next_stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + TimeDelta::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    fn check(&mut self, entity: EntityType, action: RemoteAction) -> Result<(), GatewayError> {
        if self.offline {
            return Err(GatewayError::Transport("offline".into()));
        }
        match self.fail_next.remove(&(entity, action)) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn ack(&mut self, entity: EntityType, action: RemoteAction) -> Result<(), GatewayError> {
        if self.lose_ack.remove(&(entity, action)) {
            return Err(GatewayError::Transport("connection reset before ack".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryGateway {
    state: Mutex<RemoteState>,
    latency: Duration,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` before it touches the store.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Insert a record as if another client had written it. Keeps the
    /// record's `updated_at` when present.
    pub fn seed(&self, entity: EntityType, mut record: Record) {
        let mut state = self.state.lock();
        match record.updated_at {
            Some(at) => state.last_stamp = state.last_stamp.max(Some(at)),
            None => record.updated_at = Some(state.next_stamp()),
        }
        state
            .tables
            .entry(entity)
            .or_default()
            .insert(record.id.clone(), record);
    }

    pub fn get(&self, entity: EntityType, id: &str) -> Option<Record> {
        self.state
            .lock()
            .tables
            .get(&entity)
            .and_then(|t| t.get(id))
            .cloned()
    }

    /// Records of one table ordered by id.
    pub fn records(&self, entity: EntityType) -> Vec<Record> {
        self.state
            .lock()
            .tables
            .get(&entity)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// While offline every call fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Fail the next `action` on `entity` with `error`, once.
    pub fn fail_next(&self, entity: EntityType, action: RemoteAction, error: GatewayError) {
        self.state.lock().fail_next.insert((entity, action), error);
    }

    /// Apply the next `action` on `entity` but report a transport failure,
    /// as when the response is lost on the way back.
    pub fn lose_next_ack(&self, entity: EntityType, action: RemoteAction) {
        self.state.lock().lose_ack.insert((entity, action));
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    async fn push(&self, entity: EntityType, records: &[Record]) -> Result<(), GatewayError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.calls.push(GatewayCall::Push {
            entity,
            ids: records.iter().map(|r| r.id.clone()).collect(),
        });
        state.check(entity, RemoteAction::Push)?;

        for record in records {
            let mut stored = record.clone();
            stored.updated_at = Some(state.next_stamp());
            state
                .tables
                .entry(entity)
                .or_default()
                .insert(stored.id.clone(), stored);
        }
        state.ack(entity, RemoteAction::Push)
    }

    async fn delete(&self, entity: EntityType, ids: &[String]) -> Result<(), GatewayError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.calls.push(GatewayCall::Delete {
            entity,
            ids: ids.to_vec(),
        });
        state.check(entity, RemoteAction::Delete)?;

        if let Some(table) = state.tables.get_mut(&entity) {
            for id in ids {
                table.remove(id);
            }
        }
        state.ack(entity, RemoteAction::Delete)
    }

    async fn pull(
        &self,
        entity: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Record>, GatewayError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.calls.push(GatewayCall::Pull { entity, since });
        state.check(entity, RemoteAction::Pull)?;

        let mut out: Vec<Record> = state
            .tables
            .get(&entity)
            .map(|t| {
                t.values()
                    .filter(|r| match (since, r.updated_at) {
                        (Some(since), Some(at)) => at > since,
                        (None, _) => true,
                        (Some(_), None) => false,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|r| r.updated_at);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn push_is_an_upsert_by_id() {
        let remote = MemoryGateway::new();
        let v1 = Record::new("m1").with("name", "Ana");
        let v2 = Record::new("m1").with("name", "Ana María");

        remote.push(EntityType::Member, &[v1.clone()]).await.unwrap();
        remote.push(EntityType::Member, &[v1]).await.unwrap();
        remote.push(EntityType::Member, &[v2]).await.unwrap();

        let rows = remote.records(EntityType::Member);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&json!("Ana María")));
        assert!(rows[0].updated_at.is_some());
    }

    #[tokio::test]
    async fn delete_of_missing_id_is_not_an_error() {
        let remote = MemoryGateway::new();
        remote
            .delete(EntityType::Receipt, &["nope".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pull_is_strictly_after_since_and_ascending() {
        let remote = MemoryGateway::new();
        remote.seed(
            EntityType::Member,
            Record::new("b").with_updated_at(ts("2024-01-03T00:00:00Z")),
        );
        remote.seed(
            EntityType::Member,
            Record::new("a").with_updated_at(ts("2024-01-02T00:00:00Z")),
        );
        remote.seed(
            EntityType::Member,
            Record::new("c").with_updated_at(ts("2024-01-01T00:00:00Z")),
        );

        let all = remote.pull(EntityType::Member, None).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);

        let newer = remote
            .pull(EntityType::Member, Some(ts("2024-01-02T00:00:00Z")))
            .await
            .unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].id, "b");
    }

    #[tokio::test]
    async fn stamps_after_seed_are_newer() {
        let remote = MemoryGateway::new();
        let future = ts("2999-01-01T00:00:00Z");
        remote.seed(EntityType::Member, Record::new("x").with_updated_at(future));
        remote
            .push(EntityType::Member, &[Record::new("y")])
            .await
            .unwrap();
        assert!(remote.get(EntityType::Member, "y").unwrap().updated_at.unwrap() > future);
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let remote = MemoryGateway::new();
        remote.fail_next(
            EntityType::Member,
            RemoteAction::Push,
            GatewayError::Rejected("bad dni".into()),
        );
        let m1 = [Record::new("m1")];
        assert_eq!(
            remote.push(EntityType::Member, &m1).await,
            Err(GatewayError::Rejected("bad dni".into()))
        );
        assert!(remote.records(EntityType::Member).is_empty());
        remote.push(EntityType::Member, &m1).await.unwrap();

        remote.lose_next_ack(EntityType::Member, RemoteAction::Push);
        let m2 = [Record::new("m2")];
        assert!(remote.push(EntityType::Member, &m2).await.is_err());
        assert!(remote.get(EntityType::Member, "m2").is_some());

        remote.set_offline(true);
        assert!(remote.pull(EntityType::Member, None).await.is_err());
        assert_eq!(remote.calls().len(), 4);
    }
}
