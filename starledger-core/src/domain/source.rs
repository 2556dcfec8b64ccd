//! Rows as they arrive from the operational store.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// One operational time-series row: a daily price record for a ticker.
///
/// `created_at` is the change timestamp the watermark is compared against.
/// `category` is the category observed on the row itself; when absent the
/// entity-reference table's current category applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub natural_key: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: NaiveDateTime,
}

impl SourceRecord {
    /// Basic price sanity: finite positive prices with high >= low and
    /// open/close inside the range.
    pub fn is_sane(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return false;
        }
        self.high >= self.low
            && self.open <= self.high
            && self.open >= self.low
            && self.close <= self.high
            && self.close >= self.low
    }
}

/// A time-series row that could not be decoded but whose entity and change
/// timestamp are still known, so the failure can be charged to that entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub natural_key: String,
    /// Business date, when it could be read.
    pub date: Option<NaiveDate>,
    pub created_at: NaiveDateTime,
    pub line: u64,
    pub reason: String,
}

impl std::fmt::Display for RejectedRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.reason)
    }
}

/// Operational entity-reference row (ticker master data).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityReference {
    pub natural_key: String,
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub exchange: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SourceRecord {
        SourceRecord {
            natural_key: "AAPL".into(),
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            open: 100.0,
            high: 105.0,
            low: 98.0,
            close: 103.0,
            volume: 10_000,
            category: None,
            deleted: false,
            created_at: NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_opt(18, 0, 0)
                .unwrap(),
        }
    }

    #[test]
    fn sane_record_passes() {
        assert!(sample().is_sane());
    }

    #[test]
    fn inverted_range_is_insane() {
        let mut r = sample();
        r.high = 90.0;
        assert!(!r.is_sane());
    }

    #[test]
    fn non_finite_price_is_insane() {
        let mut r = sample();
        r.close = f64::NAN;
        assert!(!r.is_sane());
        r.close = -1.0;
        assert!(!r.is_sane());
    }
}
