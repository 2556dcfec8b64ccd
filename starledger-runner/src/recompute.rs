//! Explicit recomputation of derived measures from stored prices.
//!
//! Used after the moving-average windows change, or to repair facts. Prices,
//! keys and soft-delete markers are left as stored; only derived measures are
//! rewritten, through the fact loader.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use starledger_core::domain::FactRow;
use starledger_core::fact::{FactLoader, LoadCounts, LoadError};
use starledger_core::metrics::{MetricTransformer, PricePoint, TransformError};
use starledger_core::Warehouse;

#[derive(Debug, Error)]
pub enum RecomputeError {
    #[error("unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("recompute '{natural_key}': {source}")]
    Transform {
        natural_key: String,
        source: TransformError,
    },

    #[error("recompute '{natural_key}': {source}")]
    Load {
        natural_key: String,
        source: LoadError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecomputeReport {
    pub entities: usize,
    pub counts: LoadCounts,
    /// Entities that could not be recomputed, with the reason.
    pub errors: Vec<(String, String)>,
}

/// Recompute one entity's live facts. Returns the loader counts.
pub fn recompute_entity(
    warehouse: &Warehouse,
    transformer: &MetricTransformer,
    natural_key: &str,
    now: NaiveDateTime,
) -> Result<LoadCounts, RecomputeError> {
    let lineage = warehouse.entities.lineage_keys(natural_key);
    if lineage.is_empty() {
        return Err(RecomputeError::UnknownEntity(natural_key.to_string()));
    }

    let facts: Vec<_> = warehouse
        .facts
        .for_lineage(&lineage)
        .into_iter()
        .filter(|f| f.key.calendar_key.to_date().is_some())
        .collect();
    let points: Vec<PricePoint> = facts.iter().filter_map(PricePoint::from_fact).collect();
    let measures = transformer
        .transform_series(&[], &points)
        .map_err(|source| RecomputeError::Transform {
            natural_key: natural_key.to_string(),
            source,
        })?;

    let rows: Vec<FactRow> = facts
        .iter()
        .zip(measures)
        .map(|(f, m)| FactRow {
            key: f.key,
            category_key: f.category_key,
            measures: m,
            deleted: false,
        })
        .collect();

    FactLoader::new(&warehouse.facts)
        .load(&rows, now)
        .map_err(|source| RecomputeError::Load {
            natural_key: natural_key.to_string(),
            source,
        })
}

/// Recompute one entity, or every entity when `natural_key` is `None`.
/// Failures of individual entities are collected, not propagated.
pub fn recompute(
    warehouse: &Warehouse,
    transformer: &MetricTransformer,
    natural_key: Option<&str>,
    now: NaiveDateTime,
) -> Result<RecomputeReport, RecomputeError> {
    let keys = match natural_key {
        Some(key) => {
            if warehouse.entities.lineage_keys(key).is_empty() {
                return Err(RecomputeError::UnknownEntity(key.to_string()));
            }
            vec![key.to_string()]
        }
        None => warehouse.entities.natural_keys(),
    };

    let mut report = RecomputeReport::default();
    for key in keys {
        match recompute_entity(warehouse, transformer, &key, now) {
            Ok(counts) => {
                report.entities += 1;
                report.counts += counts;
            }
            Err(e) => {
                warn!(entity = %key, error = %e, "recompute failed");
                report.errors.push((key, e.to_string()));
            }
        }
    }
    info!(
        entities = report.entities,
        updated = report.counts.updated,
        unchanged = report.counts.unchanged,
        "recompute finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use starledger_core::dimension::DimensionResolver;
    use starledger_core::domain::{FactKey, SourceRecord};

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    /// Loads `n` days for E1 with a 2-point transformer.
    fn loaded(n: u32) -> Warehouse {
        let wh = Warehouse::new(vec![]);
        let short = MetricTransformer::new(&[2]).unwrap();
        let resolver = DimensionResolver::new(&wh.entities, &wh.calendar, &wh.categories);
        let records: Vec<SourceRecord> = (1..=n)
            .map(|d| SourceRecord {
                natural_key: "E1".into(),
                date: NaiveDate::from_ymd_opt(2024, 1, d).unwrap(),
                open: 10.0,
                high: 11.0 + d as f64,
                low: 9.0,
                close: 10.0 + d as f64,
                volume: 1,
                category: None,
                deleted: false,
                created_at: now(),
            })
            .collect();
        let points: Vec<PricePoint> = records.iter().map(PricePoint::from).collect();
        let measures = short.transform_series(&[], &points).unwrap();
        let rows: Vec<FactRow> = records
            .iter()
            .zip(measures)
            .map(|(r, m)| {
                let keys = resolver.resolve_record(r, None).unwrap();
                FactRow {
                    key: FactKey {
                        entity_key: keys.entity.key,
                        calendar_key: keys.calendar_key,
                    },
                    category_key: keys.category_key,
                    measures: m,
                    deleted: false,
                }
            })
            .collect();
        FactLoader::new(&wh.facts).load(&rows, now()).unwrap();
        wh
    }

    #[test]
    fn new_windows_rewrite_measures() {
        let wh = loaded(5);
        let report = recompute(&wh, &MetricTransformer::new(&[3]).unwrap(), None, now()).unwrap();
        assert_eq!(report.entities, 1);
        assert_eq!(report.counts.updated, 5);

        let facts = wh.facts.snapshot();
        assert_eq!(facts[1].measures.moving_average(3), None);
        assert_eq!(facts[2].measures.moving_average(3), Some(12.0));
        assert!(facts.iter().all(|f| f.measures.moving_average(2).is_none()));
    }

    #[test]
    fn recompute_with_same_windows_is_noop() {
        let wh = loaded(4);
        let report =
            recompute(&wh, &MetricTransformer::new(&[2]).unwrap(), Some("E1"), now()).unwrap();
        assert_eq!(report.counts.unchanged, 4);
        assert_eq!(report.counts.changed(), 0);
    }

    #[test]
    fn unknown_entity_is_an_error() {
        let wh = loaded(1);
        assert!(matches!(
            recompute(&wh, &MetricTransformer::default(), Some("NOPE"), now()),
            Err(RecomputeError::UnknownEntity(_))
        ));
    }
}
