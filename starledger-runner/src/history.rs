//! Run history: JSONL append-only log of run records per pipeline.
//!
//! Every orchestrator state transition appends one line, so the file reads as
//! the audit trail of the pipeline. Lines are independent JSON objects; a torn
//! final line from a crash is skipped on read.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use starledger_core::domain::RunId;
use starledger_core::fact::LoadCounts;

use crate::orchestrator::RunState;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("run history {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("serialize run record: {0}")]
    Serialize(String),
}

/// Error summary of one failed entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityErrorSummary {
    pub natural_key: String,
    pub error: String,
}

/// One line of the run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub pipeline: String,
    pub state: RunState,
    pub started_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
    pub watermark_before: Option<NaiveDateTime>,
    pub watermark_after: Option<NaiveDateTime>,
    #[serde(default)]
    pub replay: bool,
    #[serde(default)]
    pub records_extracted: usize,
    #[serde(default)]
    pub entities_processed: usize,
    #[serde(default)]
    pub counts: LoadCounts,
    #[serde(default)]
    pub errors: Vec<EntityErrorSummary>,
    /// Run-level failure reason (source unavailable, persistence failed).
    #[serde(default)]
    pub message: Option<String>,
}

impl RunRecord {
    pub fn started(
        run_id: RunId,
        pipeline: &str,
        started_at: NaiveDateTime,
        watermark_before: Option<NaiveDateTime>,
        replay: bool,
    ) -> Self {
        Self {
            run_id,
            pipeline: pipeline.to_string(),
            state: RunState::Running,
            started_at,
            finished_at: None,
            watermark_before,
            watermark_after: watermark_before,
            replay,
            records_extracted: 0,
            entities_processed: 0,
            counts: LoadCounts::default(),
            errors: Vec::new(),
            message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

pub struct RunHistory {
    path: PathBuf,
}

impl RunHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn io_err(&self, e: io::Error) -> HistoryError {
        HistoryError::Io {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        }
    }

    pub fn append(&self, record: &RunRecord) -> Result<(), HistoryError> {
        let json =
            serde_json::to_string(record).map_err(|e| HistoryError::Serialize(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_err(e))?;
        writeln!(file, "{json}")
            .and_then(|_| file.flush())
            .map_err(|e| self.io_err(e))
    }

    /// Every record in append order. Malformed lines are skipped.
    pub fn read_all(&self) -> Result<Vec<RunRecord>, HistoryError> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(e)),
        };
        let mut records = Vec::new();
        for line in io::BufReader::new(file).lines() {
            let line = line.map_err(|e| self.io_err(e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "skipping malformed run record"
                ),
            }
        }
        Ok(records)
    }

    /// Latest record of any state.
    pub fn last(&self) -> Result<Option<RunRecord>, HistoryError> {
        Ok(self.read_all()?.pop())
    }

    /// Latest record of a finished run.
    pub fn last_completed(&self) -> Result<Option<RunRecord>, HistoryError> {
        Ok(self.read_all()?.into_iter().rev().find(RunRecord::is_terminal))
    }

    /// All records of one run, in order.
    pub fn for_run(&self, run_id: &RunId) -> Result<Vec<RunRecord>, HistoryError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| &r.run_id == run_id)
            .collect())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    #[test]
    fn append_and_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let history = RunHistory::new(dir.path().join("runs/prices.jsonl"));
        assert!(history.last().unwrap().is_none());

        let started = RunRecord::started(RunId("r1".into()), "prices", t0(), None, false);
        history.append(&started).unwrap();
        let mut done = started.clone();
        done.state = RunState::Succeeded;
        done.finished_at = Some(t0());
        history.append(&done).unwrap();

        let all = history.read_all().unwrap();
        assert_eq!(all, vec![started, done.clone()]);
        assert_eq!(history.last_completed().unwrap(), Some(done));
        assert_eq!(history.for_run(&RunId("r1".into())).unwrap().len(), 2);
    }

    #[test]
    fn torn_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prices.jsonl");
        let history = RunHistory::new(&path);
        history
            .append(&RunRecord::started(RunId("r1".into()), "prices", t0(), None, false))
            .unwrap();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "{{\"run_id\":\"r2\",\"pipel").unwrap();

        assert_eq!(history.read_all().unwrap().len(), 1);
        assert!(history.last_completed().unwrap().is_none());
    }
}
