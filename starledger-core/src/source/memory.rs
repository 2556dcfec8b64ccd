//! In-memory operational source for embedding and tests.

use chrono::NaiveDateTime;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{OperationalSource, SourceError};
use crate::domain::{EntityReference, SourceRecord};

/// Operational tables held in memory. Rows can be appended while the pipeline
/// runs; `set_unavailable` simulates an outage.
#[derive(Debug, Default)]
pub struct MemorySource {
    records: Mutex<Vec<SourceRecord>>,
    references: Mutex<Vec<EntityReference>>,
    unavailable: AtomicBool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_records(&self, records: impl IntoIterator<Item = SourceRecord>) {
        self.records.lock().unwrap().extend(records);
    }

    /// Insert or replace the reference row for its natural key.
    pub fn upsert_reference(&self, reference: EntityReference) {
        let mut refs = self.references.lock().unwrap();
        match refs.iter_mut().find(|r| r.natural_key == reference.natural_key) {
            Some(existing) => *existing = reference,
            None => refs.push(reference),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), SourceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("memory source marked offline".into()));
        }
        Ok(())
    }
}

impl OperationalSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    fn changed_since(
        &self,
        watermark: Option<NaiveDateTime>,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        self.check_available()?;
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .filter(|r| watermark.map_or(true, |wm| r.created_at > wm))
            .cloned()
            .collect())
    }

    fn entity_references(&self) -> Result<Vec<EntityReference>, SourceError> {
        self.check_available()?;
        Ok(self.references.lock().unwrap().clone())
    }
}
