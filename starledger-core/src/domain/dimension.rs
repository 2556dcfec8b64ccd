//! Dimension rows of the star schema.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Weekday};
use serde::{Deserialize, Serialize};

use super::ids::{CalendarKey, SurrogateKey};

/// Descriptive attributes tracked with type-2 history on the entity dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityAttributes {
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub exchange: Option<String>,
}

/// One version of an entity. `valid_to == None` means open-ended (+infinity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityVersion {
    pub key: SurrogateKey,
    pub natural_key: String,
    pub attributes: EntityAttributes,
    pub valid_from: NaiveDateTime,
    pub valid_to: Option<NaiveDateTime>,
    pub is_current: bool,
}

impl EntityVersion {
    /// Whether `at` falls inside `[valid_from, valid_to)`.
    pub fn covers(&self, at: NaiveDateTime) -> bool {
        at >= self.valid_from && self.valid_to.map_or(true, |end| at < end)
    }
}

/// Immutable calendar row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarDay {
    pub key: CalendarKey,
    pub date: NaiveDate,
    pub year: i32,
    pub quarter: u32,
    pub month: u32,
    pub day_of_week: Weekday,
    pub is_trading_day: bool,
}

impl CalendarDay {
    /// Derive all attributes from the date. Weekends and listed holidays are
    /// non-trading days.
    pub fn derive(date: NaiveDate, holidays: &[NaiveDate]) -> Self {
        let weekday = date.weekday();
        let weekend = matches!(weekday, Weekday::Sat | Weekday::Sun);
        Self {
            key: CalendarKey::from_date(date),
            date,
            year: date.year(),
            quarter: (date.month() - 1) / 3 + 1,
            month: date.month(),
            day_of_week: weekday,
            is_trading_day: !weekend && !holidays.contains(&date),
        }
    }
}

/// Category row. Only `description` may change after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub key: SurrogateKey,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}
