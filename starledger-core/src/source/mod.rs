//! Operational source adapters and extraction.
//!
//! The `OperationalSource` trait abstracts over the transactional store so the
//! pipeline can run against CSV exports, an embedded in-memory table, or a
//! mock in tests. Extraction sits above the trait: it pulls every row changed
//! since the watermark, groups rows per entity and canonicalizes each window.

pub mod csv_file;
pub mod memory;

pub use csv_file::CsvSource;
pub use memory::MemorySource;

use chrono::{NaiveDate, NaiveDateTime};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::domain::{EntityReference, RejectedRow, SourceRecord};

/// Errors raised while reading the operational store.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("operational source unavailable: {0}")]
    Unavailable(String),

    #[error("malformed source file {file} at line {line}: {reason}")]
    Malformed {
        file: String,
        line: u64,
        reason: String,
    },

    #[error("source write failed: {0}")]
    Write(String),
}

/// Read interface over the operational store.
pub trait OperationalSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// All time-series rows whose change timestamp is strictly after
    /// `watermark` (every row when `None`).
    fn changed_since(
        &self,
        watermark: Option<NaiveDateTime>,
    ) -> Result<Vec<SourceRecord>, SourceError>;

    /// Current entity-reference rows.
    fn entity_references(&self) -> Result<Vec<EntityReference>, SourceError>;

    /// Rows changed since `watermark`, with undecodable rows reported per
    /// entity instead of failing the whole read. Sources that cannot recover
    /// a bad row's entity keep the default, which never rejects.
    fn scan_since(&self, watermark: Option<NaiveDateTime>) -> Result<SourceRows, SourceError> {
        Ok(SourceRows {
            records: self.changed_since(watermark)?,
            rejected: Vec::new(),
        })
    }
}

/// Result of [`OperationalSource::scan_since`].
#[derive(Debug, Clone, Default)]
pub struct SourceRows {
    pub records: Vec<SourceRecord>,
    pub rejected: Vec<RejectedRow>,
}

/// Rows extracted for a single entity, ordered by business date.
#[derive(Debug, Clone)]
pub struct EntityWindow {
    pub natural_key: String,
    /// One row per date (latest change wins), ascending by date.
    pub records: Vec<SourceRecord>,
    /// Rows that could not be decoded and were not superseded by a later
    /// valid row for the same date. Any entry fails the entity.
    pub rejected: Vec<RejectedRow>,
    /// Lowest change timestamp among all extracted rows of this entity,
    /// including superseded duplicates.
    pub first_change: NaiveDateTime,
    /// Highest change timestamp among all extracted rows of this entity.
    pub last_change: NaiveDateTime,
}

impl EntityWindow {
    pub fn first_date(&self) -> Option<NaiveDate> {
        self.records.first().map(|r| r.date)
    }
}

/// Everything one run extracted from the source.
#[derive(Debug, Clone, Default)]
pub struct ExtractedBatch {
    pub windows: BTreeMap<String, EntityWindow>,
    pub references: HashMap<String, EntityReference>,
    /// Raw row count before per-date deduplication.
    pub record_count: usize,
    /// BLAKE3 over the canonicalized rows.
    pub batch_hash: String,
}

impl ExtractedBatch {
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Highest change timestamp across the whole batch.
    pub fn high_water(&self) -> Option<NaiveDateTime> {
        self.windows.values().map(|w| w.last_change).max()
    }
}

/// Extract and canonicalize all rows changed since `watermark`.
pub fn extract(
    source: &dyn OperationalSource,
    watermark: Option<NaiveDateTime>,
) -> Result<ExtractedBatch, SourceError> {
    let scanned = source.scan_since(watermark)?;
    let references = source
        .entity_references()?
        .into_iter()
        .map(|r| (r.natural_key.clone(), r))
        .collect();
    let record_count = scanned.records.len() + scanned.rejected.len();

    let mut grouped: BTreeMap<String, (Vec<SourceRecord>, Vec<RejectedRow>)> = BTreeMap::new();
    for row in scanned.records {
        grouped.entry(row.natural_key.clone()).or_default().0.push(row);
    }
    for row in scanned.rejected {
        grouped.entry(row.natural_key.clone()).or_default().1.push(row);
    }

    let mut windows = BTreeMap::new();
    for (natural_key, (rows, rejected)) in grouped {
        if let Some(window) = canonicalize(natural_key.clone(), rows, rejected) {
            windows.insert(natural_key, window);
        }
    }

    let batch_hash = hash_windows(&windows);
    tracing::debug!(
        source = source.name(),
        rows = record_count,
        entities = windows.len(),
        "extracted source rows"
    );

    Ok(ExtractedBatch {
        windows,
        references,
        record_count,
        batch_hash,
    })
}

/// Sort by date and keep the latest change for duplicated dates. A rejected
/// row is dropped only when a later valid row restates its date.
fn canonicalize(
    natural_key: String,
    mut rows: Vec<SourceRecord>,
    rejected: Vec<RejectedRow>,
) -> Option<EntityWindow> {
    let changes = || {
        rows.iter()
            .map(|r| r.created_at)
            .chain(rejected.iter().map(|r| r.created_at))
    };
    let first_change = changes().min()?;
    let last_change = changes().max()?;

    rows.sort_by(|a, b| a.date.cmp(&b.date).then(a.created_at.cmp(&b.created_at)));
    let mut records: Vec<SourceRecord> = Vec::with_capacity(rows.len());
    for row in rows {
        match records.last_mut() {
            Some(last) if last.date == row.date => *last = row,
            _ => records.push(row),
        }
    }

    let rejected = rejected
        .into_iter()
        .filter(|bad| {
            !records.iter().any(|r| {
                Some(r.date) == bad.date && r.created_at > bad.created_at
            })
        })
        .collect();

    Some(EntityWindow {
        natural_key,
        records,
        rejected,
        first_change,
        last_change,
    })
}

fn hash_windows(windows: &BTreeMap<String, EntityWindow>) -> String {
    let mut hasher = blake3::Hasher::new();
    for window in windows.values() {
        for record in &window.records {
            if let Ok(bytes) = serde_json::to_vec(record) {
                hasher.update(&bytes);
            }
        }
    }
    hasher.finalize().to_hex().to_string()
}
