//! Derived per-record metrics.
//!
//! Everything here is a pure function of an ordered price window: no store
//! access, no clocks. Replaying the same window yields bit-identical output.

pub mod moving_average;
pub mod pct_change;
pub mod transformer;

pub use moving_average::trailing_mean;
pub use pct_change::pct_change;
pub use transformer::{MetricTransformer, PricePoint, DEFAULT_WINDOWS};

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransformError {
    #[error("malformed record on {date}: {reason}")]
    MalformedRecord { date: NaiveDate, reason: String },

    #[error("window out of order: {next} does not follow {previous}")]
    OutOfOrder { previous: NaiveDate, next: NaiveDate },

    #[error("empty window")]
    EmptyWindow,

    #[error("invalid moving-average window {0}")]
    InvalidWindow(u32),
}
