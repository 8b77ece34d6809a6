use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::{SyncError, SyncResult};

/// Entity types known to the replica and the remote schema.
///
/// The declaration order is the push order: every type may reference types
/// declared before it, never after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityType {
    Member,
    Relative,
    MeritEntry,
    Receipt,
    AssignmentSlip,
    InventoryItem,
}

/// A stored tag did not name a known variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} tag {tag:?}")]
pub struct UnknownTag {
    pub kind: &'static str,
    pub tag: String,
}

impl EntityType {
    /// All entity types in dependency (push) order.
    pub const ALL: [EntityType; 6] = [
        EntityType::Member,
        EntityType::Relative,
        EntityType::MeritEntry,
        EntityType::Receipt,
        EntityType::AssignmentSlip,
        EntityType::InventoryItem,
    ];

    /// Tag stored in the mutation queue.
    pub fn tag(self) -> &'static str {
        match self {
            EntityType::Member => "member",
            EntityType::Relative => "relative",
            EntityType::MeritEntry => "meritEntry",
            EntityType::Receipt => "receipt",
            EntityType::AssignmentSlip => "assignmentSlip",
            EntityType::InventoryItem => "inventoryItem",
        }
    }

    /// Table name on the remote store.
    pub fn remote_table(self) -> &'static str {
        match self {
            EntityType::Member => "members",
            EntityType::Relative => "relatives",
            EntityType::MeritEntry => "merit_entries",
            EntityType::Receipt => "receipts",
            EntityType::AssignmentSlip => "assignment_slips",
            EntityType::InventoryItem => "inventory_items",
        }
    }

    /// Replica table in the local SQLite database.
    pub fn local_table(self) -> &'static str {
        match self {
            EntityType::Member => "replica_members",
            EntityType::Relative => "replica_relatives",
            EntityType::MeritEntry => "replica_merit_entries",
            EntityType::Receipt => "replica_receipts",
            EntityType::AssignmentSlip => "replica_assignment_slips",
            EntityType::InventoryItem => "replica_inventory_items",
        }
    }

    /// Position in the push order; lower ranks are pushed first.
    pub fn rank(self) -> usize {
        self as usize
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for EntityType {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|e| e.tag() == s)
            .ok_or_else(|| UnknownTag {
                kind: "entity type",
                tag: s.to_string(),
            })
    }
}

impl ToSql for EntityType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.tag()))
    }
}

impl FromSql for EntityType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// A full record snapshot as held by the replica, queued for push, or
/// returned by a pull.
///
/// `updated_at` is assigned by the remote store; records created locally and
/// not yet pulled back carry `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            updated_at: None,
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Fails when `fields` shadows `id` or `updated_at`.
    pub fn check_fields(&self) -> SyncResult<()> {
        match Self::RESERVED.into_iter().find(|k| self.fields.contains_key(*k)) {
            Some(key) => Err(SyncError::ReservedField {
                id: self.id.clone(),
                key: key.to_string(),
            }),
            None => Ok(()),
        }
    }

    const RESERVED: [&'static str; 2] = ["id", "updated_at"];
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tags_round_trip_through_from_str() {
        for entity in EntityType::ALL {
            assert_eq!(entity.tag().parse::<EntityType>().unwrap(), entity);
        }
        let err = "procession".parse::<EntityType>().unwrap_err();
        assert_eq!(err.tag, "procession");
    }

    #[test]
    fn serde_tag_matches_queue_tag() {
        for entity in EntityType::ALL {
            let encoded = serde_json::to_value(entity).unwrap();
            assert_eq!(encoded, json!(entity.tag()));
        }
    }

    #[test]
    fn rank_follows_dependencies() {
        assert!(EntityType::Member.rank() < EntityType::Relative.rank());
        assert!(EntityType::Member.rank() < EntityType::Receipt.rank());
        assert!(EntityType::Member.rank() < EntityType::AssignmentSlip.rank());
        let ranks: Vec<usize> = EntityType::ALL.iter().map(|e| e.rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn shadowed_id_or_stamp_fails_the_field_check() {
        assert!(Record::new("m1").with("name", "Ana").check_fields().is_ok());

        let err = Record::new("m1").with("id", "m1").check_fields().unwrap_err();
        assert_eq!(err.to_string(), "record \"m1\" carries reserved field \"id\"");

        let shadowed = Record::new("m1")
            .with_updated_at(Utc::now())
            .with("updated_at", "2024-01-01T00:00:00Z");
        assert!(serde_json::from_str::<Record>(&serde_json::to_string(&shadowed).unwrap()).is_err());
        assert!(shadowed.check_fields().is_err());
    }

    #[test]
    fn record_flattens_entity_fields() {
        let raw = json!({
            "id": "r1",
            "updated_at": "2024-01-02T10:00:00Z",
            "member_id": "m1",
            "amount": 25
        });
        let record: Record = serde_json::from_value(raw).unwrap();
        assert_eq!(record.id, "r1");
        assert_eq!(
            record.updated_at.unwrap().to_rfc3339(),
            "2024-01-02T10:00:00+00:00"
        );
        assert_eq!(record.get("member_id"), Some(&json!("m1")));
        assert!(!record.fields.contains_key("id"));

        let local = Record::new("m1").with("name", "Ana");
        let encoded = serde_json::to_value(&local).unwrap();
        assert_eq!(encoded, json!({"id": "m1", "name": "Ana"}));
    }
}
