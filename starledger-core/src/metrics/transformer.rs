//! Metric transformer: ordered price window → measures of its latest point.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{pct_change, trailing_mean, TransformError};
use crate::domain::{FactRecord, Measures, SourceRecord};

/// Moving-average windows used when configuration does not name any.
pub const DEFAULT_WINDOWS: [u32; 2] = [7, 30];

/// One observation of an entity's price series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl From<&SourceRecord> for PricePoint {
    fn from(r: &SourceRecord) -> Self {
        Self {
            date: r.date,
            open: r.open,
            high: r.high,
            low: r.low,
            close: r.close,
            volume: r.volume,
        }
    }
}

impl PricePoint {
    /// The stored prices of a fact; `None` if its calendar key is not a date.
    pub fn from_fact(fact: &FactRecord) -> Option<Self> {
        let m = &fact.measures;
        Some(Self {
            date: fact.key.calendar_key.to_date()?,
            open: m.open,
            high: m.high,
            low: m.low,
            close: m.close,
            volume: m.volume,
        })
    }

    fn validate(&self) -> Result<(), TransformError> {
        let malformed = |reason: &str| TransformError::MalformedRecord {
            date: self.date,
            reason: reason.to_string(),
        };
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite()) {
            return Err(malformed("non-finite price"));
        }
        if prices.iter().any(|p| *p <= 0.0) {
            return Err(malformed("non-positive price"));
        }
        if self.high < self.low {
            return Err(malformed("high below low"));
        }
        if self.close > self.high || self.close < self.low {
            return Err(malformed("close outside high/low range"));
        }
        Ok(())
    }
}

/// Computes derived measures from committed history plus new points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricTransformer {
    windows: Vec<u32>,
}

impl Default for MetricTransformer {
    fn default() -> Self {
        Self {
            windows: DEFAULT_WINDOWS.to_vec(),
        }
    }
}

impl MetricTransformer {
    pub fn new(windows: &[u32]) -> Result<Self, TransformError> {
        if let Some(&bad) = windows.iter().find(|&&w| w == 0) {
            return Err(TransformError::InvalidWindow(bad));
        }
        let mut windows = windows.to_vec();
        windows.sort_unstable();
        windows.dedup();
        Ok(Self { windows })
    }

    pub fn windows(&self) -> &[u32] {
        &self.windows
    }

    /// History needed in front of the first new point for every window to be
    /// computable: the largest window minus the point itself.
    pub fn lookback(&self) -> usize {
        self.windows.last().map_or(0, |&w| w as usize - 1).max(1)
    }

    /// Measures for the latest point of `window`.
    ///
    /// `window` must be strictly ascending by date. The N-point average is
    /// defined only when the window holds at least N points.
    pub fn derive(&self, window: &[PricePoint]) -> Result<Measures, TransformError> {
        let latest = window.last().ok_or(TransformError::EmptyWindow)?;
        for pair in window.windows(2) {
            if pair[1].date <= pair[0].date {
                return Err(TransformError::OutOfOrder {
                    previous: pair[0].date,
                    next: pair[1].date,
                });
            }
        }
        latest.validate()?;

        let closes: Vec<f64> = window.iter().map(|p| p.close).collect();
        let previous = window.len().checked_sub(2).map(|i| window[i].close);

        Ok(Measures {
            open: latest.open,
            high: latest.high,
            low: latest.low,
            close: latest.close,
            volume: latest.volume,
            pct_change: previous.and_then(|prev| pct_change(prev, latest.close)),
            moving_averages: self
                .windows
                .iter()
                .map(|&w| (w, trailing_mean(&closes, w as usize)))
                .collect(),
        })
    }

    /// Measures for every point of `new_points`, each computed over the
    /// trailing window formed by `history` (already committed, ascending)
    /// followed by the new points up to and including it.
    ///
    /// All new points are validated before anything is returned, so a single
    /// malformed row fails the whole series.
    pub fn transform_series(
        &self,
        history: &[PricePoint],
        new_points: &[PricePoint],
    ) -> Result<Vec<Measures>, TransformError> {
        for p in new_points {
            p.validate()?;
        }
        let span = self.windows.last().copied().unwrap_or(1).max(2) as usize;
        let mut combined: Vec<PricePoint> = Vec::with_capacity(history.len() + new_points.len());
        combined.extend_from_slice(history);
        combined.extend_from_slice(new_points);

        let offset = history.len();
        (offset..combined.len())
            .map(|i| {
                let start = (i + 1).saturating_sub(span);
                self.derive(&combined[start..=i])
            })
            .collect()
    }

    /// Measures with every derived field undefined, for rows that do not take
    /// part in the series (soft-deleted at the source).
    pub fn undefined(&self, point: &PricePoint) -> Measures {
        Measures {
            open: point.open,
            high: point.high,
            low: point.low,
            close: point.close,
            volume: point.volume,
            pct_change: None,
            moving_averages: self.windows.iter().map(|&w| (w, None)).collect::<BTreeMap<_, _>>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(closes: &[f64]) -> Vec<PricePoint> {
        let base = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| PricePoint {
                date: base + chrono::Duration::days(i as i64),
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume: 1_000,
            })
            .collect()
    }

    #[test]
    fn derive_latest_point() {
        let t = MetricTransformer::new(&[3]).unwrap();
        let m = t.derive(&points(&[10.0, 11.0, 12.0, 13.2])).unwrap();
        assert!((m.moving_average(3).unwrap() - (11.0 + 12.0 + 13.2) / 3.0).abs() < 1e-10);
        assert!((m.pct_change.unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn single_point_has_no_pct_change() {
        let t = MetricTransformer::new(&[1]).unwrap();
        let m = t.derive(&points(&[10.0])).unwrap();
        assert_eq!(m.pct_change, None);
        assert_eq!(m.moving_average(1), Some(10.0));
    }

    #[test]
    fn series_defines_average_from_nth_point() {
        let t = MetricTransformer::new(&[30]).unwrap();
        let closes: Vec<f64> = (0..35).map(|i| 100.0 + i as f64).collect();
        let out = t.transform_series(&[], &points(&closes)).unwrap();
        assert_eq!(out.len(), 35);
        for (i, m) in out.iter().enumerate() {
            assert_eq!(m.moving_average(30).is_some(), i >= 29, "day {}", i + 1);
        }
    }

    #[test]
    fn history_feeds_the_window() {
        let t = MetricTransformer::new(&[3]).unwrap();
        let all = points(&[1.0, 2.0, 3.0, 4.0]);
        let out = t.transform_series(&all[..2], &all[2..]).unwrap();
        assert_eq!(out.len(), 2);
        assert!((out[0].moving_average(3).unwrap() - 2.0).abs() < 1e-10);
        assert!((out[1].moving_average(3).unwrap() - 3.0).abs() < 1e-10);
    }

    #[test]
    fn malformed_point_fails_series() {
        let t = MetricTransformer::default();
        let mut pts = points(&[10.0, 11.0]);
        pts[1].high = 5.0;
        assert!(matches!(
            t.transform_series(&[], &pts),
            Err(TransformError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn duplicate_dates_are_out_of_order() {
        let t = MetricTransformer::default();
        let mut pts = points(&[10.0, 11.0]);
        pts[1].date = pts[0].date;
        assert!(matches!(t.derive(&pts), Err(TransformError::OutOfOrder { .. })));
    }

    #[test]
    fn windows_are_sorted_and_zero_rejected() {
        assert_eq!(MetricTransformer::new(&[30, 7, 7]).unwrap().windows(), &[7, 30]);
        assert!(MetricTransformer::new(&[0]).is_err());
    }
}
