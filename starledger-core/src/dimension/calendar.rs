//! Calendar dimension: one immutable row per date.

use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::domain::{CalendarDay, CalendarKey};

/// Pre-populated date dimension.
///
/// Rows are fully derived from the date (plus the holiday list), so a date
/// outside the populated range is added on first use without breaking
/// immutability: whoever inserts it inserts the same row.
#[derive(Debug)]
pub struct CalendarDimension {
    days: RwLock<BTreeMap<CalendarKey, CalendarDay>>,
    holidays: Vec<NaiveDate>,
}

impl CalendarDimension {
    pub fn new(holidays: Vec<NaiveDate>) -> Self {
        Self {
            days: RwLock::new(BTreeMap::new()),
            holidays,
        }
    }

    /// Rebuild from persisted rows.
    pub fn from_rows(rows: Vec<CalendarDay>, holidays: Vec<NaiveDate>) -> Self {
        let days = rows.into_iter().map(|d| (d.key, d)).collect();
        Self {
            days: RwLock::new(days),
            holidays,
        }
    }

    /// Insert every date in `[start, end]` that is not present yet.
    /// Returns the number of rows added.
    pub fn populate(&self, start: NaiveDate, end: NaiveDate) -> usize {
        let mut days = self.days.write().unwrap();
        let mut added = 0;
        for date in start.iter_days().take_while(|d| *d <= end) {
            let key = CalendarKey::from_date(date);
            if let std::collections::btree_map::Entry::Vacant(slot) = days.entry(key) {
                slot.insert(CalendarDay::derive(date, &self.holidays));
                added += 1;
            }
        }
        added
    }

    /// Surrogate key for `date`, inserting the row if the date is outside
    /// the pre-populated range.
    pub fn resolve(&self, date: NaiveDate) -> CalendarKey {
        let key = CalendarKey::from_date(date);
        if self.days.read().unwrap().contains_key(&key) {
            return key;
        }
        self.days
            .write()
            .unwrap()
            .entry(key)
            .or_insert_with(|| CalendarDay::derive(date, &self.holidays));
        key
    }

    /// The row for `key`, if that date has been populated or resolved.
    pub fn get(&self, key: CalendarKey) -> Option<CalendarDay> {
        self.days.read().unwrap().get(&key).cloned()
    }

    /// Every row, ascending by date.
    pub fn rows(&self) -> Vec<CalendarDay> {
        self.days.read().unwrap().values().cloned().collect()
    }

    /// Holidays rows are derived with.
    pub fn holidays(&self) -> Vec<NaiveDate> {
        self.holidays.clone()
    }

    /// Swap in the rows of `other`, as reloaded from disk. The holiday list
    /// is kept.
    pub fn replace_with(&self, other: CalendarDimension) {
        *self.days.write().unwrap() = other.days.into_inner().unwrap();
    }

    pub fn len(&self) -> usize {
        self.days.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn populate_is_idempotent() {
        let cal = CalendarDimension::new(vec![]);
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
        assert_eq!(cal.populate(start, end), 366);
        assert_eq!(cal.populate(start, end), 0);
        assert_eq!(cal.len(), 366);
    }

    #[test]
    fn resolve_outside_range_adds_derived_row() {
        let cal = CalendarDimension::new(vec![]);
        let date = NaiveDate::from_ymd_opt(2030, 7, 4).unwrap();
        let key = cal.resolve(date);
        assert_eq!(key, CalendarKey(20300704));
        let row = cal.get(key).unwrap();
        assert_eq!(row.quarter, 3);
        assert_eq!(cal.resolve(date), key);
        assert_eq!(cal.len(), 1);
    }

    #[test]
    fn holidays_are_not_trading_days() {
        let holiday = NaiveDate::from_ymd_opt(2024, 12, 25).unwrap();
        let cal = CalendarDimension::new(vec![holiday]);
        let key = cal.resolve(holiday);
        assert!(!cal.get(key).unwrap().is_trading_day);
    }
}
