//! Dimension tables and key resolution.
//!
//! - `EntityDimension`: type-2 slowly-changing dimension kept as an
//!   append-only arena of interval-stamped versions
//! - `CalendarDimension`: immutable, pre-populated date rows
//! - `CategoryDimension`: unique names, mutable description only
//! - `DimensionResolver`: natural key → surrogate key with optimistic
//!   insert-or-fetch and bounded retry on conflicts

pub mod calendar;
pub mod category;
pub mod entity;
pub mod resolver;

pub use calendar::CalendarDimension;
pub use category::CategoryDimension;
pub use entity::EntityDimension;
pub use resolver::{
    DimensionResolver, EntityResolution, ResolutionAction, ResolvedKeys, VersionStore,
    DEFAULT_MAX_RETRIES,
};

use thiserror::Error;

/// Category used when neither the row nor the reference table names one.
pub const UNCATEGORIZED: &str = "Uncategorized";

/// Errors from dimension tables.
#[derive(Debug, Error)]
pub enum DimensionError {
    /// A conditional write lost a race. The resolver retries these.
    #[error("dimension conflict on '{natural_key}': {reason}")]
    Conflict { natural_key: String, reason: String },

    #[error("gave up resolving '{natural_key}' after {attempts} conflicting attempts")]
    RetriesExhausted { natural_key: String, attempts: u32 },

    #[error("corrupt dimension data: {0}")]
    Corrupt(String),
}
