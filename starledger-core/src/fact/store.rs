//! In-memory fact table keyed by (entity key, calendar key).
//!
//! Readers get cloned snapshots; writers hold the lock only for the duration
//! of one validated batch.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::domain::{CalendarKey, FactKey, FactRecord, SurrogateKey};

#[derive(Debug, Default)]
pub struct FactStore {
    rows: RwLock<BTreeMap<FactKey, FactRecord>>,
}

impl FactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from persisted records. A later record with the same key wins.
    pub fn from_records(records: Vec<FactRecord>) -> Self {
        Self {
            rows: RwLock::new(records.into_iter().map(|r| (r.key, r)).collect()),
        }
    }

    /// The fact at `key`, soft-deleted or not.
    pub fn get(&self, key: &FactKey) -> Option<FactRecord> {
        self.rows.read().unwrap().get(key).cloned()
    }

    /// Row count including soft-deleted facts.
    pub fn len(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every row, ordered by key.
    pub fn snapshot(&self) -> Vec<FactRecord> {
        self.rows.read().unwrap().values().cloned().collect()
    }

    /// Live (not soft-deleted) facts of an entity lineage, ascending by date.
    pub fn for_lineage(&self, lineage: &[SurrogateKey]) -> Vec<FactRecord> {
        let rows = self.rows.read().unwrap();
        let mut out: Vec<FactRecord> = lineage
            .iter()
            .flat_map(|&entity_key| {
                let lo = FactKey {
                    entity_key,
                    calendar_key: CalendarKey(i32::MIN),
                };
                let hi = FactKey {
                    entity_key,
                    calendar_key: CalendarKey(i32::MAX),
                };
                rows.range(lo..=hi).map(|(_, r)| r.clone())
            })
            .filter(|r| !r.deleted)
            .collect();
        out.sort_by_key(|r| r.key.calendar_key);
        out
    }

    /// The last `limit` live facts of a lineage strictly before `before`.
    pub fn history_before(
        &self,
        lineage: &[SurrogateKey],
        before: CalendarKey,
        limit: usize,
    ) -> Vec<FactRecord> {
        let mut live: Vec<FactRecord> = self
            .for_lineage(lineage)
            .into_iter()
            .filter(|r| r.key.calendar_key < before)
            .collect();
        let skip = live.len().saturating_sub(limit);
        live.drain(..skip);
        live
    }

    /// Swap in the contents of `other`, as reloaded from disk.
    pub fn replace_with(&self, other: FactStore) {
        *self.rows.write().unwrap() = other.rows.into_inner().unwrap();
    }

    pub(crate) fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<FactKey, FactRecord>> {
        self.rows.write().unwrap()
    }
}
