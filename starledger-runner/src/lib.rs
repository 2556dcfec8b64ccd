//! StarLedger Runner: pipeline orchestration on top of `starledger-core`.
//!
//! - TOML pipeline configuration and state directory layout
//! - Per-pipeline watermark store and run lock
//! - ETL orchestrator with partial-failure isolation
//! - JSONL run history
//! - Recomputation pass for derived measures
//! - Materialized view refresher with atomic publish
//! - Pipeline service for triggering and polling runs

pub mod config;
pub mod history;
pub mod orchestrator;
pub mod recompute;
pub mod refresher;
pub mod run_lock;
pub mod service;
pub mod watermark;

pub use config::{ConfigError, PipelineConfig, SourceConfig, StateLayout};
pub use history::{EntityErrorSummary, HistoryError, RunHistory, RunRecord};
pub use orchestrator::{
    advance_watermark, EntityError, EntityOutcome, EtlOrchestrator, RunError, RunOptions,
    RunReport, RunState,
};
pub use recompute::{recompute, RecomputeError, RecomputeReport};
pub use refresher::{
    AggregateRead, AggregateSnapshot, MaterializedViewRefresher, RefreshError, RefreshOutcome,
    RefreshSchedule, RefreshTrigger,
};
pub use run_lock::{LockError, RunGuard, RunLock};
pub use service::{PipelineService, RunStatus, RunTrigger, ServiceError};
pub use watermark::{
    FileWatermarkStore, MemoryWatermarkStore, Watermark, WatermarkError, WatermarkStore,
};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn orchestrator_is_send_sync() {
        assert_send::<EtlOrchestrator>();
        assert_sync::<EtlOrchestrator>();
    }

    #[test]
    fn refresher_is_send_sync() {
        assert_send::<MaterializedViewRefresher>();
        assert_sync::<MaterializedViewRefresher>();
        assert_send::<AggregateSnapshot>();
        assert_sync::<AggregateSnapshot>();
    }

    #[test]
    fn service_is_send_sync() {
        assert_send::<PipelineService>();
        assert_sync::<PipelineService>();
    }

    #[test]
    fn stores_are_send_sync() {
        assert_send::<FileWatermarkStore>();
        assert_sync::<FileWatermarkStore>();
        assert_send::<MemoryWatermarkStore>();
        assert_sync::<MemoryWatermarkStore>();
        assert_send::<RunLock>();
        assert_sync::<RunLock>();
    }

    #[test]
    fn records_are_send_sync() {
        assert_send::<RunRecord>();
        assert_sync::<RunRecord>();
        assert_send::<RunStatus>();
        assert_sync::<RunStatus>();
        assert_send::<PipelineConfig>();
        assert_sync::<PipelineConfig>();
    }
}
