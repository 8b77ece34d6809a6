//! Pull-side merge: remote records replace local ones wholesale.
//!
//! Last writer wins at record granularity. A pulled record overwrites the
//! replica even when a local edit to it is still queued; that queued entry is
//! left alone and will push the local version again on the next cycle.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::warn;

use crate::entity::{EntityType, Record};
use crate::error::SyncResult;
use crate::store;

/// Newest `updated_at` among `records`, ignoring records without one.
pub fn newest_updated_at(records: &[Record]) -> Option<DateTime<Utc>> {
    records.iter().filter_map(|r| r.updated_at).max()
}

/// Overwrite replica rows with `records` and return the newest stamp seen.
///
/// Runs on the caller's transaction so a watermark written next to it lands
/// atomically with the rows.
pub fn apply_pulled(
    conn: &Connection,
    entity: EntityType,
    records: &[Record],
) -> SyncResult<Option<DateTime<Utc>>> {
    for record in records.iter().filter(|r| r.updated_at.is_none()) {
        warn!(%entity, id = %record.id, "pulled record has no updated_at");
    }
    store::bulk_put(conn, entity, records)?;
    Ok(newest_updated_at(records))
}
