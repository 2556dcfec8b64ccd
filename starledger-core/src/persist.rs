//! File persistence helpers shared by the warehouse and the runner.
//!
//! Every write goes to `{path}.tmp` first and is renamed into place, so a
//! reader never observes a half-written file.

use polars::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

use crate::dimension::DimensionError;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error at {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("parquet error: {0}")]
    Parquet(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("corrupt table {table}: {reason}")]
    Corrupt { table: String, reason: String },

    #[error(transparent)]
    Dimension(#[from] DimensionError),
}

impl PersistError {
    pub(crate) fn io(path: &Path, e: impl std::fmt::Display) -> Self {
        Self::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    }
}

/// Current UTC time truncated to microseconds, the precision persisted
/// timestamps keep.
pub fn timestamp_now() -> chrono::NaiveDateTime {
    let now = chrono::Utc::now();
    chrono::DateTime::from_timestamp_micros(now.timestamp_micros())
        .unwrap_or(now)
        .naive_utc()
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `bytes` to `path` via a temp file and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PersistError::io(parent, e))?;
    }
    let tmp = tmp_path(path);
    let mut file = fs::File::create(&tmp).map_err(|e| PersistError::io(&tmp, e))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| PersistError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        PersistError::io(path, e)
    })
}

pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), PersistError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| PersistError::Json(e.to_string()))?;
    write_atomic(path, &json)
}

/// Read a JSON file; `Ok(None)` when it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).map_err(|e| PersistError::io(path, e))?;
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| PersistError::Json(format!("{}: {e}", path.display())))
}

pub fn write_parquet_atomic(df: &DataFrame, path: &Path) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PersistError::io(parent, e))?;
    }
    let tmp = tmp_path(path);
    let file = fs::File::create(&tmp).map_err(|e| PersistError::io(&tmp, e))?;
    ParquetWriter::new(file)
        .finish(&mut df.clone())
        .map_err(|e| {
            let _ = fs::remove_file(&tmp);
            PersistError::Parquet(format!("write {}: {e}", path.display()))
        })?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        PersistError::io(path, e)
    })
}

/// Read a Parquet file; `Ok(None)` when it does not exist.
pub fn read_parquet(path: &Path) -> Result<Option<DataFrame>, PersistError> {
    if !path.exists() {
        return Ok(None);
    }
    let file = fs::File::open(path).map_err(|e| PersistError::io(path, e))?;
    ParquetReader::new(file)
        .finish()
        .map(Some)
        .map_err(|e| PersistError::Parquet(format!("read {}: {e}", path.display())))
}
