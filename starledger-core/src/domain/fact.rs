//! Fact table rows (subject area: daily prices).

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ids::{CalendarKey, SurrogateKey};

/// Numeric measures of one fact.
///
/// Derived measures are `None` when undefined (not enough history), never
/// zero-filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measures {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub pct_change: Option<f64>,
    /// Trailing moving average of close, keyed by window length.
    pub moving_averages: BTreeMap<u32, Option<f64>>,
}

impl Measures {
    pub fn moving_average(&self, window: u32) -> Option<f64> {
        self.moving_averages.get(&window).copied().flatten()
    }
}

/// Grain of the fact table: one row per entity version per calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactKey {
    pub entity_key: SurrogateKey,
    pub calendar_key: CalendarKey,
}

/// A transformed row handed to the fact loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRow {
    pub key: FactKey,
    pub category_key: SurrogateKey,
    pub measures: Measures,
    pub deleted: bool,
}

/// A stored fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRecord {
    pub key: FactKey,
    pub category_key: SurrogateKey,
    pub measures: Measures,
    pub deleted: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl FactRecord {
    /// Whether loading `row` over this record would change anything.
    pub fn differs_from(&self, row: &FactRow) -> bool {
        self.category_key != row.category_key
            || self.deleted != row.deleted
            || self.measures != row.measures
    }
}
