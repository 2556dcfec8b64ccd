//! StarLedger Core: the dimensional model and the pure pieces of the ETL.
//!
//! - Domain types (source rows, dimension rows, facts, aggregates)
//! - Operational source adapters and change extraction
//! - Entity (SCD type 2), calendar and category dimensions with key resolution
//! - Metric transformer (moving averages, percentage change)
//! - Fact table with an idempotent loader
//! - Parquet/JSON persistence of the star schema

pub mod dimension;
pub mod domain;
pub mod fact;
pub mod metrics;
pub mod persist;
pub mod source;
pub mod warehouse;

pub use warehouse::{SaveState, Warehouse};

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: shared tables and domain types are Send + Sync, so
    /// the runner can hand them to worker threads behind an `Arc`.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<domain::SourceRecord>();
        require_sync::<domain::SourceRecord>();
        require_send::<domain::EntityVersion>();
        require_sync::<domain::EntityVersion>();
        require_send::<domain::FactRecord>();
        require_sync::<domain::FactRecord>();
        require_send::<domain::AggregateRow>();
        require_sync::<domain::AggregateRow>();

        require_send::<dimension::EntityDimension>();
        require_sync::<dimension::EntityDimension>();
        require_send::<dimension::CalendarDimension>();
        require_sync::<dimension::CalendarDimension>();
        require_send::<dimension::CategoryDimension>();
        require_sync::<dimension::CategoryDimension>();
        require_send::<fact::FactStore>();
        require_sync::<fact::FactStore>();
        require_send::<Warehouse>();
        require_sync::<Warehouse>();

        require_send::<source::MemorySource>();
        require_sync::<source::MemorySource>();
        require_send::<source::CsvSource>();
        require_sync::<source::CsvSource>();
    }

    /// Sources are used as trait objects across threads.
    #[test]
    fn operational_source_is_object_safe() {
        fn _takes(_: &dyn source::OperationalSource) {}
        let src = source::MemorySource::new();
        _takes(&src);
    }
}
