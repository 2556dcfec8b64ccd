//! Per-pipeline high-water mark over source change timestamps.
//!
//! All source rows with a change timestamp at or below `high_water` are
//! guaranteed to be reflected in the fact store. Only the orchestrator writes
//! it, once per completed run; the stores refuse to move it backwards.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use starledger_core::domain::RunId;
use starledger_core::persist::{self, PersistError};

use crate::orchestrator::RunState;

#[derive(Debug, Error)]
pub enum WatermarkError {
    #[error("watermark storage: {0}")]
    Storage(#[from] PersistError),

    #[error("watermark for '{pipeline}' would move backwards from {current} to {proposed}")]
    Regression {
        pipeline: String,
        current: NaiveDateTime,
        proposed: NaiveDateTime,
    },
}

/// Persisted watermark row of one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub pipeline: String,
    pub high_water: Option<NaiveDateTime>,
    pub last_run_id: Option<RunId>,
    pub last_status: Option<RunState>,
    #[serde(default)]
    pub records_processed: usize,
    pub updated_at: Option<NaiveDateTime>,
}

impl Watermark {
    /// Watermark of a pipeline that has never completed a run.
    pub fn initial(pipeline: &str) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            high_water: None,
            last_run_id: None,
            last_status: None,
            records_processed: 0,
            updated_at: None,
        }
    }
}

pub trait WatermarkStore: Send + Sync {
    /// Current watermark, or [`Watermark::initial`] if none was stored.
    fn load(&self, pipeline: &str) -> Result<Watermark, WatermarkError>;

    /// Replace the stored watermark. Fails with `Regression` if `high_water`
    /// would decrease.
    fn store(&self, watermark: &Watermark) -> Result<(), WatermarkError>;
}

fn check_monotonic(current: &Watermark, next: &Watermark) -> Result<(), WatermarkError> {
    match (current.high_water, next.high_water) {
        (Some(cur), Some(proposed)) if proposed < cur => Err(WatermarkError::Regression {
            pipeline: next.pipeline.clone(),
            current: cur,
            proposed,
        }),
        (Some(cur), None) => Err(WatermarkError::Regression {
            pipeline: next.pipeline.clone(),
            current: cur,
            proposed: NaiveDateTime::MIN,
        }),
        _ => Ok(()),
    }
}

/// One JSON file per pipeline: `{dir}/{pipeline}.json`.
#[derive(Debug)]
pub struct FileWatermarkStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileWatermarkStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path(&self, pipeline: &str) -> PathBuf {
        self.dir.join(format!("{pipeline}.json"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl WatermarkStore for FileWatermarkStore {
    fn load(&self, pipeline: &str) -> Result<Watermark, WatermarkError> {
        Ok(persist::read_json(&self.path(pipeline))?
            .unwrap_or_else(|| Watermark::initial(pipeline)))
    }

    fn store(&self, watermark: &Watermark) -> Result<(), WatermarkError> {
        let _guard = self.write_lock.lock().unwrap();
        check_monotonic(&self.load(&watermark.pipeline)?, watermark)?;
        persist::write_json_atomic(&self.path(&watermark.pipeline), watermark)?;
        Ok(())
    }
}

/// In-memory store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    rows: Mutex<HashMap<String, Watermark>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    fn load(&self, pipeline: &str) -> Result<Watermark, WatermarkError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(pipeline)
            .cloned()
            .unwrap_or_else(|| Watermark::initial(pipeline)))
    }

    fn store(&self, watermark: &Watermark) -> Result<(), WatermarkError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(current) = rows.get(&watermark.pipeline) {
            check_monotonic(current, watermark)?;
        }
        rows.insert(watermark.pipeline.clone(), watermark.clone());
        Ok(())
    }
}
