//! CSV export of the operational store.
//!
//! Layout: `{dir}/prices.csv` and `{dir}/entities.csv`, headers as the field
//! names of `SourceRecord` / `EntityReference`.

use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use super::{OperationalSource, SourceError, SourceRows};
use crate::domain::{EntityReference, RejectedRow, SourceRecord};

const PRICES_FILE: &str = "prices.csv";
const ENTITIES_FILE: &str = "entities.csv";

/// Reads operational rows from a directory of CSV exports.
pub struct CsvSource {
    dir: PathBuf,
}

/// Wire form of a price row: optional columns may be empty.
#[derive(Debug, Deserialize)]
struct PriceRow {
    natural_key: String,
    date: NaiveDate,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
    category: Option<String>,
    deleted: Option<bool>,
    created_at: NaiveDateTime,
}

impl From<PriceRow> for SourceRecord {
    fn from(row: PriceRow) -> Self {
        Self {
            natural_key: row.natural_key,
            date: row.date,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            category: row.category.filter(|c| !c.is_empty()),
            deleted: row.deleted.unwrap_or(false),
            created_at: row.created_at,
        }
    }
}

impl CsvSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a complete operational dataset (used by `seed` and tests).
    pub fn write(
        dir: &Path,
        records: &[SourceRecord],
        references: &[EntityReference],
    ) -> Result<(), SourceError> {
        fs::create_dir_all(dir).map_err(|e| SourceError::Write(format!("create dir: {e}")))?;
        write_rows(&dir.join(PRICES_FILE), records)?;
        write_rows(&dir.join(ENTITIES_FILE), references)?;
        Ok(())
    }

    fn read_rows<T>(&self, file: &str) -> Result<Vec<T>, SourceError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let path = self.dir.join(file);
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&path)
            .map_err(|e| SourceError::Unavailable(format!("{}: {e}", path.display())))?;

        let mut out = Vec::new();
        for result in reader.deserialize::<T>() {
            let row = result.map_err(|e| SourceError::Malformed {
                file: file.to_string(),
                line: e.position().map(|p| p.line()).unwrap_or(0),
                reason: e.to_string(),
            })?;
            out.push(row);
        }
        Ok(out)
    }

    /// Decode `prices.csv` row by row. A row that fails to decode becomes a
    /// [`RejectedRow`] when its `natural_key` and `created_at` columns are
    /// still readable; otherwise the whole file is malformed.
    fn scan_prices(&self) -> Result<SourceRows, SourceError> {
        let path = self.dir.join(PRICES_FILE);
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(&path)
            .map_err(|e| SourceError::Unavailable(format!("{}: {e}", path.display())))?;
        let malformed = |line: u64, reason: String| SourceError::Malformed {
            file: PRICES_FILE.to_string(),
            line,
            reason,
        };

        let headers = reader
            .headers()
            .map_err(|e| malformed(1, e.to_string()))?
            .clone();
        let column = |name: &str| headers.iter().position(|h| h == name);
        let (key_col, date_col, created_col) =
            (column("natural_key"), column("date"), column("created_at"));

        let mut rows = SourceRows::default();
        for result in reader.records() {
            let raw = result.map_err(|e| {
                malformed(e.position().map(|p| p.line()).unwrap_or(0), e.to_string())
            })?;
            let line = raw.position().map(|p| p.line()).unwrap_or(0);
            match raw.deserialize::<PriceRow>(Some(&headers)) {
                Ok(row) => rows.records.push(row.into()),
                Err(e) => {
                    let field = |col: Option<usize>| col.and_then(|i| raw.get(i));
                    let natural_key = field(key_col).filter(|k| !k.is_empty());
                    let created_at =
                        field(created_col).and_then(|t| t.parse::<NaiveDateTime>().ok());
                    let (Some(natural_key), Some(created_at)) = (natural_key, created_at) else {
                        return Err(malformed(line, e.to_string()));
                    };
                    tracing::debug!(entity = natural_key, line, error = %e, "rejected source row");
                    rows.rejected.push(RejectedRow {
                        natural_key: natural_key.to_string(),
                        date: field(date_col).and_then(|d| d.parse::<NaiveDate>().ok()),
                        created_at,
                        line,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(rows)
    }
}

fn write_rows<T: serde::Serialize>(path: &Path, rows: &[T]) -> Result<(), SourceError> {
    let tmp = path.with_extension("csv.tmp");
    let mut writer =
        csv::Writer::from_path(&tmp).map_err(|e| SourceError::Write(format!("open: {e}")))?;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|e| SourceError::Write(format!("serialize: {e}")))?;
    }
    writer
        .flush()
        .map_err(|e| SourceError::Write(format!("flush: {e}")))?;
    drop(writer);
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        SourceError::Write(format!("atomic rename failed: {e}"))
    })
}

impl OperationalSource for CsvSource {
    fn name(&self) -> &str {
        "csv"
    }

    /// Strict read: any undecodable row fails with `Malformed`.
    fn changed_since(
        &self,
        watermark: Option<NaiveDateTime>,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        let rows = self.scan_since(watermark)?;
        match rows.rejected.into_iter().next() {
            Some(bad) => Err(SourceError::Malformed {
                file: PRICES_FILE.to_string(),
                line: bad.line,
                reason: bad.reason,
            }),
            None => Ok(rows.records),
        }
    }

    fn scan_since(&self, watermark: Option<NaiveDateTime>) -> Result<SourceRows, SourceError> {
        let newer = |t: NaiveDateTime| watermark.map_or(true, |wm| t > wm);
        let mut rows = self.scan_prices()?;
        rows.records.retain(|r| newer(r.created_at));
        rows.rejected.retain(|r| newer(r.created_at));
        Ok(rows)
    }

    fn entity_references(&self) -> Result<Vec<EntityReference>, SourceError> {
        if !self.dir.join(ENTITIES_FILE).exists() {
            return Ok(Vec::new());
        }
        self.read_rows::<EntityReference>(ENTITIES_FILE)
    }
}
