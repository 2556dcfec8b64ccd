//! Entity dimension: SCD type 2 over ticker master data.
//!
//! Versions live in an append-only arena indexed by surrogate key. A
//! per-natural-key lineage (ordered by `valid_from`) and a current pointer sit
//! on top. Rows are never removed. In-place changes are limited to closing a
//! version when it is superseded, moving the oldest version's start back, and
//! restating the attributes of the current version from its own start date.
//!
//! Writes are conditional: each one re-checks, under the write lock, the state
//! the caller planned against and fails with `DimensionError::Conflict` if it
//! moved. This plays the role of a uniqueness constraint on
//! `(natural_key, is_current)`.

use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::sync::RwLock;

use super::DimensionError;
use crate::domain::{EntityAttributes, EntityVersion, SurrogateKey};

#[derive(Debug, Default)]
struct Arena {
    /// `rows[i]` has surrogate key `i + 1`.
    rows: Vec<EntityVersion>,
    /// Arena indices per natural key, ascending by `valid_from`.
    lineage: HashMap<String, Vec<usize>>,
    current: HashMap<String, usize>,
}

impl Arena {
    fn push(
        &mut self,
        natural_key: &str,
        attributes: EntityAttributes,
        valid_from: NaiveDateTime,
        valid_to: Option<NaiveDateTime>,
        is_current: bool,
    ) -> SurrogateKey {
        let idx = self.rows.len();
        let key = SurrogateKey(idx as u64 + 1);
        self.rows.push(EntityVersion {
            key,
            natural_key: natural_key.to_string(),
            attributes,
            valid_from,
            valid_to,
            is_current,
        });
        let lineage = self.lineage.entry(natural_key.to_string()).or_default();
        let pos = lineage
            .iter()
            .position(|&i| self.rows[i].valid_from > valid_from)
            .unwrap_or(lineage.len());
        lineage.insert(pos, idx);
        if is_current {
            self.current.insert(natural_key.to_string(), idx);
        }
        key
    }

    fn conflict(natural_key: &str, reason: impl Into<String>) -> DimensionError {
        DimensionError::Conflict {
            natural_key: natural_key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Type-2 entity dimension table.
#[derive(Debug, Default)]
pub struct EntityDimension {
    arena: RwLock<Arena>,
}

impl EntityDimension {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the table from persisted rows, checking key density and the
    /// one-current-row rule.
    pub fn from_rows(mut rows: Vec<EntityVersion>) -> Result<Self, DimensionError> {
        rows.sort_by_key(|r| r.key);
        let mut arena = Arena::default();
        for (i, row) in rows.into_iter().enumerate() {
            if row.key.0 != i as u64 + 1 {
                return Err(DimensionError::Corrupt(format!(
                    "entity keys not dense: expected {}, found {}",
                    i + 1,
                    row.key
                )));
            }
            if row.is_current && arena.current.contains_key(&row.natural_key) {
                return Err(DimensionError::Corrupt(format!(
                    "two current versions for '{}'",
                    row.natural_key
                )));
            }
            arena.push(
                &row.natural_key,
                row.attributes,
                row.valid_from,
                row.valid_to,
                row.is_current,
            );
        }
        Ok(Self {
            arena: RwLock::new(arena),
        })
    }

    /// Every version, in surrogate key order.
    pub fn rows(&self) -> Vec<EntityVersion> {
        self.arena.read().unwrap().rows.clone()
    }

    /// Swap in the contents of `other`, e.g. a table reloaded from disk.
    pub fn replace_with(&self, other: EntityDimension) {
        *self.arena.write().unwrap() = other.arena.into_inner().unwrap();
    }

    /// Number of versions across all natural keys.
    pub fn len(&self) -> usize {
        self.arena.read().unwrap().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Version with surrogate key `key`.
    pub fn get(&self, key: SurrogateKey) -> Option<EntityVersion> {
        let arena = self.arena.read().unwrap();
        key.0
            .checked_sub(1)
            .and_then(|i| arena.rows.get(i as usize))
            .cloned()
    }

    /// The open-ended version of `natural_key`, if it has one.
    pub fn current(&self, natural_key: &str) -> Option<EntityVersion> {
        let arena = self.arena.read().unwrap();
        arena.current.get(natural_key).map(|&i| arena.rows[i].clone())
    }

    /// All versions of a natural key, oldest first.
    pub fn lineage(&self, natural_key: &str) -> Vec<EntityVersion> {
        let arena = self.arena.read().unwrap();
        arena
            .lineage
            .get(natural_key)
            .map(|idxs| idxs.iter().map(|&i| arena.rows[i].clone()).collect())
            .unwrap_or_default()
    }

    pub fn lineage_keys(&self, natural_key: &str) -> Vec<SurrogateKey> {
        self.lineage(natural_key).into_iter().map(|v| v.key).collect()
    }

    /// Every natural key with at least one version, sorted.
    pub fn natural_keys(&self) -> Vec<String> {
        let arena = self.arena.read().unwrap();
        let mut keys: Vec<String> = arena.lineage.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Create the first version of a natural key. Fails if any version
    /// already exists.
    pub fn insert_first(
        &self,
        natural_key: &str,
        attributes: EntityAttributes,
        valid_from: NaiveDateTime,
    ) -> Result<SurrogateKey, DimensionError> {
        let mut arena = self.arena.write().unwrap();
        if arena.lineage.contains_key(natural_key) {
            return Err(Arena::conflict(natural_key, "first version already created"));
        }
        Ok(arena.push(natural_key, attributes, valid_from, None, true))
    }

    /// Close `expected_current` at `effective` and insert a new current
    /// version. Fails if the current version is no longer `expected_current`
    /// or `effective` does not fall strictly after its start.
    pub fn supersede(
        &self,
        natural_key: &str,
        expected_current: SurrogateKey,
        attributes: EntityAttributes,
        effective: NaiveDateTime,
    ) -> Result<SurrogateKey, DimensionError> {
        let mut arena = self.arena.write().unwrap();
        let idx = match arena.current.get(natural_key) {
            Some(&idx) if arena.rows[idx].key == expected_current => idx,
            _ => return Err(Arena::conflict(natural_key, "current version moved")),
        };
        if effective <= arena.rows[idx].valid_from {
            return Err(Arena::conflict(
                natural_key,
                "effective time does not follow current version start",
            ));
        }
        let old = &mut arena.rows[idx];
        old.valid_to = Some(effective);
        old.is_current = false;
        Ok(arena.push(natural_key, attributes, effective, None, true))
    }

    /// Replace the attributes of `expected_current` when an observation on
    /// its own start date restates them. Fails if the current version moved
    /// or starts at a different time.
    pub fn restate(
        &self,
        natural_key: &str,
        expected_current: SurrogateKey,
        attributes: EntityAttributes,
        effective: NaiveDateTime,
    ) -> Result<SurrogateKey, DimensionError> {
        let mut arena = self.arena.write().unwrap();
        let idx = match arena.current.get(natural_key) {
            Some(&idx) if arena.rows[idx].key == expected_current => idx,
            _ => return Err(Arena::conflict(natural_key, "current version moved")),
        };
        let row = &mut arena.rows[idx];
        if row.valid_from != effective {
            return Err(Arena::conflict(natural_key, "current version start moved"));
        }
        row.attributes = attributes;
        Ok(expected_current)
    }

    /// Insert a closed historical version `[valid_from, first.valid_from)` in
    /// front of the oldest version. Fails if the oldest version changed.
    pub fn insert_before(
        &self,
        natural_key: &str,
        expected_first: SurrogateKey,
        attributes: EntityAttributes,
        valid_from: NaiveDateTime,
    ) -> Result<SurrogateKey, DimensionError> {
        let mut arena = self.arena.write().unwrap();
        let first = arena
            .lineage
            .get(natural_key)
            .and_then(|idxs| idxs.first())
            .map(|&i| arena.rows[i].clone());
        match first {
            Some(first) if first.key == expected_first && valid_from < first.valid_from => {
                Ok(arena.push(natural_key, attributes, valid_from, Some(first.valid_from), false))
            }
            _ => Err(Arena::conflict(natural_key, "oldest version moved")),
        }
    }

    /// Move the start of the oldest version back to `valid_from`. Fails if the
    /// oldest version changed or already starts at or before `valid_from`.
    pub fn extend_back(
        &self,
        natural_key: &str,
        expected_first: SurrogateKey,
        valid_from: NaiveDateTime,
    ) -> Result<SurrogateKey, DimensionError> {
        let mut arena = self.arena.write().unwrap();
        let first = arena
            .lineage
            .get(natural_key)
            .and_then(|idxs| idxs.first())
            .copied();
        match first {
            Some(idx)
                if arena.rows[idx].key == expected_first
                    && valid_from < arena.rows[idx].valid_from =>
            {
                arena.rows[idx].valid_from = valid_from;
                Ok(expected_first)
            }
            _ => Err(Arena::conflict(natural_key, "oldest version moved")),
        }
    }

    /// Check the SCD invariants for one natural key:
    /// - at most one current version
    /// - non-empty, contiguous intervals
    /// - the current version last and open-ended
    pub fn check_lineage(&self, natural_key: &str) -> Result<(), String> {
        let versions = self.lineage(natural_key);
        let current = versions.iter().filter(|v| v.is_current).count();
        if current > 1 {
            return Err(format!("{current} current versions"));
        }
        if let Some(empty) = versions
            .iter()
            .find(|v| v.valid_to.is_some_and(|to| to <= v.valid_from))
        {
            return Err(format!("version {} has an empty interval", empty.key));
        }
        for pair in versions.windows(2) {
            if pair[0].valid_to != Some(pair[1].valid_from) {
                return Err(format!(
                    "gap or overlap between versions {} and {}",
                    pair[0].key, pair[1].key
                ));
            }
        }
        if let Some(last) = versions.last() {
            if !last.is_current || last.valid_to.is_some() {
                return Err(format!("latest version {} is not open-ended and current", last.key));
            }
        }
        Ok(())
    }
}
