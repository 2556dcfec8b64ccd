//! Fact loader: validated, idempotent upserts.
//!
//! A batch is checked in full before the first write, then applied under one
//! write lock, so a batch is either loaded completely or not at all. Rows are
//! never removed; superseded rows are soft-deleted.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::AddAssign;
use thiserror::Error;

use super::FactStore;
use crate::domain::{FactKey, FactRecord, FactRow, SurrogateKey};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LoadError {
    #[error("invalid fact row {key:?}: {reason}")]
    InvalidRow { key: FactKey, reason: String },

    #[error("fact key {0:?} appears twice in one batch")]
    DuplicateKey(FactKey),
}

/// Row counts reported by one load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Live facts for the same date under another version of the entity,
    /// soft-deleted by this load.
    pub retired: usize,
}

impl LoadCounts {
    /// Rows whose stored state changed.
    pub fn changed(&self) -> usize {
        self.inserted + self.updated + self.retired
    }
}

impl AddAssign for LoadCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
        self.unchanged += rhs.unchanged;
        self.retired += rhs.retired;
    }
}

pub struct FactLoader<'a> {
    store: &'a FactStore,
}

impl<'a> FactLoader<'a> {
    pub fn new(store: &'a FactStore) -> Self {
        Self { store }
    }

    /// Upsert a batch: insert new keys, overwrite changed measures, leave
    /// identical rows untouched.
    pub fn load(&self, rows: &[FactRow], now: NaiveDateTime) -> Result<LoadCounts, LoadError> {
        self.load_entity(&[], rows, now)
    }

    /// Upsert one entity's batch. `lineage` lists every version key of the
    /// entity; a live fact on the same date under a different version is
    /// soft-deleted so each (entity, date) is counted at most once.
    pub fn load_entity(
        &self,
        lineage: &[SurrogateKey],
        rows: &[FactRow],
        now: NaiveDateTime,
    ) -> Result<LoadCounts, LoadError> {
        validate(rows)?;

        let mut table = self.store.write();
        let mut counts = LoadCounts::default();

        for row in rows {
            match table.get_mut(&row.key) {
                None => {
                    table.insert(
                        row.key,
                        FactRecord {
                            key: row.key,
                            category_key: row.category_key,
                            measures: row.measures.clone(),
                            deleted: row.deleted,
                            created_at: now,
                            updated_at: now,
                        },
                    );
                    counts.inserted += 1;
                }
                Some(existing) if existing.differs_from(row) => {
                    existing.category_key = row.category_key;
                    existing.measures = row.measures.clone();
                    existing.deleted = row.deleted;
                    existing.updated_at = now;
                    counts.updated += 1;
                }
                Some(_) => counts.unchanged += 1,
            }

            for &sibling in lineage.iter().filter(|&&k| k != row.key.entity_key) {
                let sibling_key = FactKey {
                    entity_key: sibling,
                    calendar_key: row.key.calendar_key,
                };
                if let Some(stale) = table.get_mut(&sibling_key) {
                    if !stale.deleted {
                        stale.deleted = true;
                        stale.updated_at = now;
                        counts.retired += 1;
                    }
                }
            }
        }

        Ok(counts)
    }
}

fn validate(rows: &[FactRow]) -> Result<(), LoadError> {
    let mut seen = HashSet::with_capacity(rows.len());
    for row in rows {
        if !seen.insert(row.key) {
            return Err(LoadError::DuplicateKey(row.key));
        }
        let m = &row.measures;
        let finite = [m.open, m.high, m.low, m.close]
            .iter()
            .chain(m.pct_change.iter())
            .chain(m.moving_averages.values().flatten())
            .all(|v| v.is_finite());
        if !finite {
            return Err(LoadError::InvalidRow {
                key: row.key,
                reason: "non-finite measure".into(),
            });
        }
    }
    Ok(())
}
