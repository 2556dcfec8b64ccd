//! Materialized aggregate rows and refresh/read scopes.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::ids::SurrogateKey;

/// One row of the `category_daily` aggregate, keyed by (category, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub category_key: SurrogateKey,
    pub category: String,
    pub date: NaiveDate,
    pub fact_count: u64,
    pub avg_close: f64,
    pub min_close: f64,
    pub max_close: f64,
    pub total_volume: u64,
    /// Mean of the defined percentage changes; `None` when no fact had one.
    pub avg_pct_change: Option<f64>,
    pub last_updated: NaiveDateTime,
}

/// Which part of the aggregate a refresh or read applies to.
///
/// `None` fields are unbounded, so `AggregateScope::default()` is the whole
/// table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateScope {
    pub categories: Option<Vec<String>>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl AggregateScope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn dates(from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            categories: None,
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = Some(categories);
        self
    }

    pub fn is_full(&self) -> bool {
        self.categories.is_none() && self.from.is_none() && self.to.is_none()
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |f| date >= f) && self.to.map_or(true, |t| date <= t)
    }

    pub fn contains_category(&self, category: &str) -> bool {
        self.categories
            .as_ref()
            .map_or(true, |cats| cats.iter().any(|c| c == category))
    }

    pub fn contains(&self, category: &str, date: NaiveDate) -> bool {
        self.contains_category(category) && self.contains_date(date)
    }
}
