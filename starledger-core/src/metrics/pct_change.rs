//! Percentage change vs. the immediately preceding point.

/// `(current - previous) / previous * 100`, undefined for a zero or
/// non-finite base.
pub fn pct_change(previous: f64, current: f64) -> Option<f64> {
    if !previous.is_finite() || !current.is_finite() || previous == 0.0 {
        return None;
    }
    Some((current - previous) / previous * 100.0)
}
