//! Domain types for the StarLedger warehouse

pub mod aggregate;
pub mod dimension;
pub mod fact;
pub mod ids;
pub mod source;

pub use aggregate::{AggregateRow, AggregateScope};
pub use dimension::{CalendarDay, Category, EntityAttributes, EntityVersion};
pub use fact::{FactKey, FactRecord, FactRow, Measures};
pub use ids::{CalendarKey, RunId, SurrogateKey};
pub use source::{EntityReference, RejectedRow, SourceRecord};
