use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// System-generated dimension row identifier (entity and category tables).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SurrogateKey(pub u64);

impl fmt::Display for SurrogateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Calendar dimension key: the date encoded as `yyyymmdd`.
///
/// Smart keys sort chronologically, so range filters on the fact table can
/// compare keys directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CalendarKey(pub i32);

impl CalendarKey {
    pub fn from_date(date: NaiveDate) -> Self {
        Self(date.year() * 10_000 + date.month() as i32 * 100 + date.day() as i32)
    }

    pub fn to_date(self) -> Option<NaiveDate> {
        let year = self.0 / 10_000;
        let month = (self.0 / 100 % 100) as u32;
        let day = (self.0 % 100) as u32;
        NaiveDate::from_ymd_opt(year, month, day)
    }
}

impl fmt::Display for CalendarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one pipeline run.
///
/// Derived with BLAKE3 over pipeline name, start time and a process-local
/// sequence number, truncated to 16 hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn derive(pipeline: &str, started_at: chrono::NaiveDateTime, sequence: u64) -> Self {
        let nanos = started_at.and_utc().timestamp_nanos_opt().unwrap_or_default();
        let material = format!("{pipeline}|{nanos}|{sequence}");
        let hex = blake3::hash(material.as_bytes()).to_hex();
        Self(hex[..16].to_string())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
