//! Turns the queue into the ordered list of gateway calls for one push phase.
//!
//! Upserts go first, type by type in dependency order. Deletes follow once
//! every upsert is through, dependents first. Several entries against the
//! same record collapse into the last one, and every collapsed entry rides
//! along with the batch that carries its record.

use std::collections::HashMap;

use crate::entity::{EntityType, Record};
use crate::error::{SyncError, SyncResult};
use crate::gateway::RemoteAction;
use crate::queue::{Operation, QueueEntry};

#[derive(Debug, Clone, PartialEq)]
pub enum BatchKind {
    Upsert(Vec<Record>),
    Delete(Vec<String>),
}

/// One gateway call plus the queue entries it settles.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub entity: EntityType,
    pub kind: BatchKind,
    pub entry_ids: Vec<i64>,
}

impl Batch {
    pub fn action(&self) -> RemoteAction {
        match self.kind {
            BatchKind::Upsert(_) => RemoteAction::Push,
            BatchKind::Delete(_) => RemoteAction::Delete,
        }
    }

    /// Number of records sent.
    pub fn len(&self) -> usize {
        match &self.kind {
            BatchKind::Upsert(records) => records.len(),
            BatchKind::Delete(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Latest {
    operation: Operation,
    payload: Option<Record>,
    entry_ids: Vec<i64>,
}

#[derive(Default)]
struct Group {
    order: Vec<String>,
    latest: HashMap<String, Latest>,
}

impl Group {
    fn add(&mut self, entry: &QueueEntry) {
        let latest = self
            .latest
            .entry(entry.entity_id.clone())
            .or_insert_with(|| {
                self.order.push(entry.entity_id.clone());
                Latest {
                    operation: entry.operation,
                    payload: None,
                    entry_ids: Vec::new(),
                }
            });
        latest.operation = entry.operation;
        latest.payload = entry.payload.clone();
        latest.entry_ids.push(entry.id);
    }

    fn batches(
        &self,
        entity: EntityType,
        deletes: bool,
        batch_size: usize,
    ) -> SyncResult<Vec<Batch>> {
        let ids: Vec<&String> = self
            .order
            .iter()
            .filter(|id| self.latest[*id].operation.is_upsert() != deletes)
            .collect();

        let mut out = Vec::new();
        for chunk in ids.chunks(batch_size.max(1)) {
            let mut entry_ids = Vec::new();
            let mut records = Vec::with_capacity(chunk.len());
            for id in chunk {
                let latest = &self.latest[*id];
                entry_ids.extend_from_slice(&latest.entry_ids);
                if !deletes {
                    let payload = latest
                        .payload
                        .clone()
                        .ok_or(SyncError::State("queued upsert has no payload"))?;
                    records.push(payload);
                }
            }
            entry_ids.sort_unstable();
            let kind = if deletes {
                BatchKind::Delete(chunk.iter().map(|id| id.to_string()).collect())
            } else {
                BatchKind::Upsert(records)
            };
            out.push(Batch {
                entity,
                kind,
                entry_ids,
            });
        }
        Ok(out)
    }
}

/// Build the ordered gateway calls for `entries` (queue order).
pub fn plan(entries: &[QueueEntry], batch_size: usize) -> SyncResult<Vec<Batch>> {
    let mut groups: HashMap<EntityType, Group> = HashMap::new();
    for entry in entries {
        groups.entry(entry.entity_type).or_default().add(entry);
    }

    let mut out = Vec::new();
    for entity in EntityType::ALL {
        if let Some(group) = groups.get(&entity) {
            out.extend(group.batches(entity, false, batch_size)?);
        }
    }
    for entity in EntityType::ALL.into_iter().rev() {
        if let Some(group) = groups.get(&entity) {
            out.extend(group.batches(entity, true, batch_size)?);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueStatus;
    use chrono::Utc;

    fn entry(id: i64, entity: EntityType, entity_id: &str, operation: Operation) -> QueueEntry {
        let payload = operation
            .is_upsert()
            .then(|| Record::new(entity_id).with("rev", id));
        QueueEntry {
            id,
            entity_type: entity,
            entity_id: entity_id.to_string(),
            operation,
            payload,
            local_timestamp: Utc::now(),
            attempts: 0,
            status: QueueStatus::Pending,
            last_error: None,
        }
    }

    fn shape(batches: &[Batch]) -> Vec<(EntityType, RemoteAction, Vec<String>)> {
        batches
            .iter()
            .map(|b| {
                let ids = match &b.kind {
                    BatchKind::Upsert(records) => records.iter().map(|r| r.id.clone()).collect(),
                    BatchKind::Delete(ids) => ids.clone(),
                };
                (b.entity, b.action(), ids)
            })
            .collect()
    }

    #[test]
    fn upserts_follow_dependency_order_regardless_of_queue_order() {
        let entries = vec![
            entry(1, EntityType::Receipt, "r1", Operation::Create),
            entry(2, EntityType::AssignmentSlip, "s1", Operation::Create),
            entry(3, EntityType::Member, "m1", Operation::Create),
        ];
        let batches = plan(&entries, 100).unwrap();
        assert_eq!(
            shape(&batches),
            vec![
                (EntityType::Member, RemoteAction::Push, vec!["m1".to_string()]),
                (EntityType::Receipt, RemoteAction::Push, vec!["r1".to_string()]),
                (EntityType::AssignmentSlip, RemoteAction::Push, vec!["s1".to_string()]),
            ]
        );
    }

    #[test]
    fn deletes_come_after_all_upserts_dependents_first() {
        let entries = vec![
            entry(1, EntityType::Member, "m1", Operation::Delete),
            entry(2, EntityType::Receipt, "r1", Operation::Delete),
            entry(3, EntityType::Receipt, "r2", Operation::Update),
            entry(4, EntityType::InventoryItem, "i1", Operation::Create),
        ];
        let batches = plan(&entries, 100).unwrap();
        assert_eq!(
            shape(&batches),
            vec![
                (EntityType::Receipt, RemoteAction::Push, vec!["r2".to_string()]),
                (EntityType::InventoryItem, RemoteAction::Push, vec!["i1".to_string()]),
                (EntityType::Receipt, RemoteAction::Delete, vec!["r1".to_string()]),
                (EntityType::Member, RemoteAction::Delete, vec!["m1".to_string()]),
            ]
        );
    }

    #[test]
    fn same_record_collapses_to_latest_operation() {
        let entries = vec![
            entry(1, EntityType::Member, "m1", Operation::Create),
            entry(2, EntityType::Member, "m2", Operation::Create),
            entry(3, EntityType::Member, "m1", Operation::Update),
            entry(4, EntityType::Member, "m2", Operation::Delete),
        ];
        let batches = plan(&entries, 100).unwrap();
        assert_eq!(batches.len(), 2);

        let BatchKind::Upsert(records) = &batches[0].kind else {
            panic!("expected upsert first");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("rev"), Some(&serde_json::json!(3)));
        assert_eq!(batches[0].entry_ids, vec![1, 3]);

        assert_eq!(batches[1].kind, BatchKind::Delete(vec!["m2".to_string()]));
        assert_eq!(batches[1].entry_ids, vec![2, 4]);
    }

    #[test]
    fn large_groups_are_chunked_in_queue_order() {
        let entries: Vec<QueueEntry> = (1..=5)
            .map(|i| entry(i, EntityType::MeritEntry, &format!("e{i}"), Operation::Create))
            .collect();
        let batches = plan(&entries, 2).unwrap();
        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(batches[2].entry_ids, vec![5]);
    }

    #[test]
    fn empty_queue_plans_nothing() {
        assert!(plan(&[], 10).unwrap().is_empty());
    }
}
