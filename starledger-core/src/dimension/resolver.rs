//! Natural key → surrogate key resolution across the three dimensions.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::{
    CalendarDimension, CategoryDimension, DimensionError, EntityDimension, UNCATEGORIZED,
};
use crate::domain::{
    CalendarKey, EntityAttributes, EntityReference, EntityVersion, SourceRecord, SurrogateKey,
};

/// Conflicting writes retried before giving up on one natural key.
pub const DEFAULT_MAX_RETRIES: u32 = 8;

/// What resolution did to the entity dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionAction {
    /// An existing version matched.
    Reused,
    /// First version of a new natural key.
    Created,
    /// Attributes changed: current version closed, new version opened.
    Versioned,
    /// Observation older than all known history: the oldest version was
    /// extended backwards, or a closed version was prepended.
    Backfilled,
    /// Observation on the current version's start date with different
    /// attributes: the version's attributes were replaced.
    Restated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityResolution {
    pub key: SurrogateKey,
    pub action: ResolutionAction,
}

/// Keys for all three dimensions of one source row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedKeys {
    pub entity: EntityResolution,
    pub calendar_key: CalendarKey,
    pub category_key: SurrogateKey,
}

/// Planned write against a lineage snapshot.
enum Plan {
    Existing(SurrogateKey),
    Create,
    Supersede(SurrogateKey),
    Restate(SurrogateKey),
    Prepend(SurrogateKey),
    Extend(SurrogateKey),
}

/// Lineage reads and conditional writes the resolver plans against.
///
/// Each write re-checks the state it was planned on and fails with
/// `DimensionError::Conflict` when that state moved.
pub trait VersionStore {
    fn lineage(&self, natural_key: &str) -> Vec<EntityVersion>;

    fn insert_first(
        &self,
        natural_key: &str,
        attributes: EntityAttributes,
        valid_from: NaiveDateTime,
    ) -> Result<SurrogateKey, DimensionError>;

    fn supersede(
        &self,
        natural_key: &str,
        expected_current: SurrogateKey,
        attributes: EntityAttributes,
        effective: NaiveDateTime,
    ) -> Result<SurrogateKey, DimensionError>;

    fn restate(
        &self,
        natural_key: &str,
        expected_current: SurrogateKey,
        attributes: EntityAttributes,
        effective: NaiveDateTime,
    ) -> Result<SurrogateKey, DimensionError>;

    fn insert_before(
        &self,
        natural_key: &str,
        expected_first: SurrogateKey,
        attributes: EntityAttributes,
        valid_from: NaiveDateTime,
    ) -> Result<SurrogateKey, DimensionError>;

    fn extend_back(
        &self,
        natural_key: &str,
        expected_first: SurrogateKey,
        valid_from: NaiveDateTime,
    ) -> Result<SurrogateKey, DimensionError>;
}

impl VersionStore for EntityDimension {
    fn lineage(&self, natural_key: &str) -> Vec<EntityVersion> {
        EntityDimension::lineage(self, natural_key)
    }

    fn insert_first(
        &self,
        natural_key: &str,
        attributes: EntityAttributes,
        valid_from: NaiveDateTime,
    ) -> Result<SurrogateKey, DimensionError> {
        EntityDimension::insert_first(self, natural_key, attributes, valid_from)
    }

    fn supersede(
        &self,
        natural_key: &str,
        expected_current: SurrogateKey,
        attributes: EntityAttributes,
        effective: NaiveDateTime,
    ) -> Result<SurrogateKey, DimensionError> {
        EntityDimension::supersede(self, natural_key, expected_current, attributes, effective)
    }

    fn restate(
        &self,
        natural_key: &str,
        expected_current: SurrogateKey,
        attributes: EntityAttributes,
        effective: NaiveDateTime,
    ) -> Result<SurrogateKey, DimensionError> {
        EntityDimension::restate(self, natural_key, expected_current, attributes, effective)
    }

    fn insert_before(
        &self,
        natural_key: &str,
        expected_first: SurrogateKey,
        attributes: EntityAttributes,
        valid_from: NaiveDateTime,
    ) -> Result<SurrogateKey, DimensionError> {
        EntityDimension::insert_before(self, natural_key, expected_first, attributes, valid_from)
    }

    fn extend_back(
        &self,
        natural_key: &str,
        expected_first: SurrogateKey,
        valid_from: NaiveDateTime,
    ) -> Result<SurrogateKey, DimensionError> {
        EntityDimension::extend_back(self, natural_key, expected_first, valid_from)
    }
}

/// Resolves dimension keys against borrowed dimension tables.
pub struct DimensionResolver<'a, E: VersionStore + ?Sized = EntityDimension> {
    entities: &'a E,
    calendar: &'a CalendarDimension,
    categories: &'a CategoryDimension,
    max_retries: u32,
}

impl DimensionResolver<'_> {
    /// Attributes in force for a source row: the row's own category wins over
    /// the reference table's.
    pub fn attributes_for(
        record: &SourceRecord,
        reference: Option<&EntityReference>,
    ) -> EntityAttributes {
        let category = record
            .category
            .clone()
            .or_else(|| reference.map(|r| r.category.clone()))
            .unwrap_or_else(|| UNCATEGORIZED.to_string());
        EntityAttributes {
            name: reference
                .map(|r| r.name.clone())
                .unwrap_or_else(|| record.natural_key.clone()),
            category,
            exchange: reference.and_then(|r| r.exchange.clone()),
        }
    }

    /// Validity timestamp for an observation on a business date.
    pub fn effective_time(date: NaiveDate) -> NaiveDateTime {
        date.and_time(chrono::NaiveTime::MIN)
    }
}

impl<'a, E: VersionStore + ?Sized> DimensionResolver<'a, E> {
    pub fn new(
        entities: &'a E,
        calendar: &'a CalendarDimension,
        categories: &'a CategoryDimension,
    ) -> Self {
        Self {
            entities,
            calendar,
            categories,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Conflicting attempts allowed after the first before giving up.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Resolve all dimension keys for one source row.
    pub fn resolve_record(
        &self,
        record: &SourceRecord,
        reference: Option<&EntityReference>,
    ) -> Result<ResolvedKeys, DimensionError> {
        let attributes = DimensionResolver::attributes_for(record, reference);
        let category_key = self.categories.resolve(&attributes.category);
        let calendar_key = self.calendar.resolve(record.date);
        let entity = self.resolve_entity(
            &record.natural_key,
            &attributes,
            DimensionResolver::effective_time(record.date),
        )?;
        Ok(ResolvedKeys {
            entity,
            calendar_key,
            category_key,
        })
    }

    /// Surrogate key of the entity version describing `natural_key` at
    /// `effective`, creating or versioning rows as needed.
    ///
    /// Writes are planned against a snapshot and applied conditionally. A
    /// conflict means another writer got there first: re-read and re-plan,
    /// which returns the winner's key when its attributes match.
    pub fn resolve_entity(
        &self,
        natural_key: &str,
        attributes: &EntityAttributes,
        effective: NaiveDateTime,
    ) -> Result<EntityResolution, DimensionError> {
        for attempt in 0..=self.max_retries {
            let lineage = self.entities.lineage(natural_key);
            let (outcome, action) = match plan(&lineage, attributes, effective) {
                Plan::Existing(key) => {
                    return Ok(EntityResolution {
                        key,
                        action: ResolutionAction::Reused,
                    })
                }
                Plan::Create => (
                    self.entities
                        .insert_first(natural_key, attributes.clone(), effective),
                    ResolutionAction::Created,
                ),
                Plan::Supersede(current) => (
                    self.entities
                        .supersede(natural_key, current, attributes.clone(), effective),
                    ResolutionAction::Versioned,
                ),
                Plan::Restate(current) => (
                    self.entities
                        .restate(natural_key, current, attributes.clone(), effective),
                    ResolutionAction::Restated,
                ),
                Plan::Prepend(first) => (
                    self.entities
                        .insert_before(natural_key, first, attributes.clone(), effective),
                    ResolutionAction::Backfilled,
                ),
                Plan::Extend(first) => (
                    self.entities.extend_back(natural_key, first, effective),
                    ResolutionAction::Backfilled,
                ),
            };
            match outcome {
                Ok(key) => {
                    tracing::debug!(
                        entity = natural_key,
                        key = key.0,
                        ?action,
                        "entity dimension changed"
                    );
                    return Ok(EntityResolution { key, action });
                }
                Err(DimensionError::Conflict { reason, .. }) => {
                    tracing::debug!(
                        entity = natural_key,
                        attempt,
                        %reason,
                        "dimension conflict, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(DimensionError::RetriesExhausted {
            natural_key: natural_key.to_string(),
            attempts: self.max_retries + 1,
        })
    }
}

fn plan(
    lineage: &[EntityVersion],
    attributes: &EntityAttributes,
    effective: NaiveDateTime,
) -> Plan {
    let Some(first) = lineage.first() else {
        return Plan::Create;
    };
    if effective < first.valid_from {
        return if first.attributes == *attributes {
            Plan::Extend(first.key)
        } else {
            Plan::Prepend(first.key)
        };
    }
    match lineage.iter().find(|v| v.is_current) {
        Some(current) if effective >= current.valid_from => {
            if current.attributes == *attributes {
                Plan::Existing(current.key)
            } else if effective == current.valid_from {
                Plan::Restate(current.key)
            } else {
                Plan::Supersede(current.key)
            }
        }
        // Late observation inside known history: it belongs to the version in
        // force on that date, whatever the attributes say now.
        _ => match lineage.iter().find(|v| v.covers(effective)) {
            Some(version) => Plan::Existing(version.key),
            None => Plan::Existing(first.key),
        },
    }
}
