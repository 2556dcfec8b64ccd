//! Pipeline service: the library surface for triggering and observing runs.
//!
//! Triggers return immediately. A run executes on its own thread while holding
//! the pipeline's run lock; callers poll [`PipelineService::run_status`].
//! View refreshes go through the refresher and are independent of runs.
//!
//! Several services may share one state directory. Every operation that
//! reads or writes the warehouse first reloads it if another process saved
//! since, under the run lock for writes.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use starledger_core::domain::{AggregateScope, RunId};
use starledger_core::persist::{self, PersistError};
use starledger_core::source::OperationalSource;
use starledger_core::Warehouse;

use crate::config::{ConfigError, PipelineConfig};
use crate::history::{EntityErrorSummary, HistoryError, RunRecord};
use crate::orchestrator::{EtlOrchestrator, RunError, RunOptions, RunReport, RunState};
use crate::recompute::{self, RecomputeError, RecomputeReport};
use crate::refresher::{
    AggregateRead, MaterializedViewRefresher, RefreshError, RefreshOutcome, RefreshSchedule,
    RefreshTrigger,
};
use crate::run_lock::{LockError, RunGuard, RunLock};
use crate::watermark::{FileWatermarkStore, WatermarkError, WatermarkStore};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Refresh(#[from] RefreshError),

    #[error(transparent)]
    Recompute(#[from] RecomputeError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Watermark(#[from] WatermarkError),

    #[error("could not start run thread: {0}")]
    Spawn(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunTrigger {
    Started { run_id: RunId },
    AlreadyRunning,
}

/// Answer to a run-status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub pipeline: String,
    /// `Running` while a run is in flight, else the outcome of the last run,
    /// or `Idle` if none ever finished.
    pub state: RunState,
    pub run_id: Option<RunId>,
    pub last_run_at: Option<NaiveDateTime>,
    pub high_water: Option<NaiveDateTime>,
    /// Source rows processed across all completed runs.
    pub records_processed: usize,
    pub errors: Vec<EntityErrorSummary>,
    pub message: Option<String>,
}

pub struct PipelineService {
    orchestrator: Arc<EtlOrchestrator>,
    watermarks: Arc<dyn WatermarkStore>,
    lock: RunLock,
    refresher: Arc<MaterializedViewRefresher>,
    refresh_interval: Option<Duration>,
    current: Arc<Mutex<Option<RunId>>>,
    last: Arc<Mutex<Option<RunRecord>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineService {
    pub fn new(
        orchestrator: Arc<EtlOrchestrator>,
        watermarks: Arc<dyn WatermarkStore>,
        refresher: Arc<MaterializedViewRefresher>,
    ) -> Self {
        Self {
            orchestrator,
            watermarks,
            lock: RunLock::in_process(),
            refresher,
            refresh_interval: None,
            current: Arc::default(),
            last: Arc::default(),
            worker: Mutex::new(None),
        }
    }

    pub fn with_lock(mut self, lock: RunLock) -> Self {
        self.lock = lock;
        self
    }

    /// Open the state directory `config` names with its configured source.
    pub fn open(config: &PipelineConfig) -> Result<Self, ServiceError> {
        Self::open_with_source(config, config.open_source())
    }

    /// Open the state directory `config` names, reading from `source`.
    pub fn open_with_source(
        config: &PipelineConfig,
        source: Arc<dyn OperationalSource>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let layout = config.layout();
        let warehouse = Arc::new(Warehouse::open(
            layout.root(),
            config.calendar.holidays.clone(),
        )?);
        let seeded = config.seed_dimensions(&warehouse);

        let orchestrator = Arc::new(EtlOrchestrator::from_config(
            config,
            Arc::clone(&warehouse),
            source,
        )?);
        let refresher = Arc::new(
            MaterializedViewRefresher::new(warehouse)
                .with_persistence(layout.aggregates_dir())?
                .with_min_interval(Duration::from_millis(config.refresh_min_interval_ms)),
        );
        info!(
            pipeline = %config.pipeline,
            state_dir = %layout.root().display(),
            calendar_days_added = seeded,
            "pipeline service opened"
        );

        let mut service = Self::new(
            orchestrator,
            Arc::new(FileWatermarkStore::new(layout.watermarks_dir())),
            refresher,
        )
        .with_lock(RunLock::with_dir(layout.locks_dir()));
        service.refresh_interval = config.refresh_interval_secs.map(Duration::from_secs);
        Ok(service)
    }

    pub fn pipeline(&self) -> &str {
        self.orchestrator.pipeline()
    }

    pub fn orchestrator(&self) -> &Arc<EtlOrchestrator> {
        &self.orchestrator
    }

    pub fn refresher(&self) -> &Arc<MaterializedViewRefresher> {
        &self.refresher
    }

    pub fn lock(&self) -> &RunLock {
        &self.lock
    }

    fn acquire(&self) -> Result<Option<RunGuard>, ServiceError> {
        match self.lock.try_acquire(self.pipeline()) {
            Ok(guard) => Ok(Some(guard)),
            Err(LockError::Held(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Start a run in the background. Returns `AlreadyRunning` without
    /// waiting if this pipeline is running here or in another process.
    pub fn trigger_run(&self, options: RunOptions) -> Result<RunTrigger, ServiceError> {
        let Some(guard) = self.acquire()? else {
            info!(pipeline = %self.pipeline(), "run already in progress");
            return Ok(RunTrigger::AlreadyRunning);
        };
        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| self.orchestrator.next_run_id());
        *self.current.lock().unwrap() = Some(run_id.clone());

        let orchestrator = Arc::clone(&self.orchestrator);
        let watermarks = Arc::clone(&self.watermarks);
        let current = Arc::clone(&self.current);
        let last = Arc::clone(&self.last);
        let options = RunOptions {
            run_id: Some(run_id.clone()),
            ..options
        };
        let spawned = thread::Builder::new()
            .name(format!("starledger-run-{}", self.pipeline()))
            .spawn(move || {
                let record = match orchestrator.run(watermarks.as_ref(), options.clone()) {
                    Ok(report) => report.record,
                    Err(e) => {
                        warn!(
                            pipeline = %orchestrator.pipeline(),
                            error = %e,
                            "run aborted"
                        );
                        aborted_record(&orchestrator, &options, &e)
                    }
                };
                *last.lock().unwrap() = Some(record);
                *current.lock().unwrap() = None;
                drop(guard);
            });

        match spawned {
            Ok(handle) => {
                // a previous worker has released the lock, so it is finishing
                if let Some(previous) = self.worker.lock().unwrap().replace(handle) {
                    let _ = previous.join();
                }
                Ok(RunTrigger::Started { run_id })
            }
            Err(e) => {
                *self.current.lock().unwrap() = None;
                Err(ServiceError::Spawn(e.to_string()))
            }
        }
    }

    /// Block until the last triggered run has finished.
    pub fn wait_for_run(&self) {
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Run synchronously on the calling thread.
    pub fn run_blocking(&self, options: RunOptions) -> Result<RunReport, ServiceError> {
        let Some(_guard) = self.acquire()? else {
            return Err(LockError::Held(self.pipeline().to_string()).into());
        };
        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| self.orchestrator.next_run_id());
        *self.current.lock().unwrap() = Some(run_id.clone());
        let result = self.orchestrator.run(
            self.watermarks.as_ref(),
            RunOptions {
                run_id: Some(run_id),
                ..options
            },
        );
        *self.current.lock().unwrap() = None;

        let report = result?;
        *self.last.lock().unwrap() = Some(report.record.clone());
        Ok(report)
    }

    pub fn run_status(&self) -> Result<RunStatus, ServiceError> {
        let watermark = self.watermarks.load(self.pipeline())?;
        let last = match self.last.lock().unwrap().clone() {
            Some(record) => Some(record),
            None => match self.orchestrator.history() {
                Some(history) => history.last_completed()?,
                None => None,
            },
        };

        let running = self.current.lock().unwrap().clone();
        let elsewhere = running.is_none() && self.lock.is_held(self.pipeline());
        let state = if running.is_some() || elsewhere {
            RunState::Running
        } else {
            last.as_ref().map_or(RunState::Idle, |r| r.state)
        };

        Ok(RunStatus {
            pipeline: self.pipeline().to_string(),
            state,
            run_id: running.or_else(|| last.as_ref().map(|r| r.run_id.clone())),
            last_run_at: last
                .as_ref()
                .map(|r| r.finished_at.unwrap_or(r.started_at)),
            high_water: watermark.high_water,
            records_processed: watermark.records_processed,
            errors: last.as_ref().map(|r| r.errors.clone()).unwrap_or_default(),
            message: last.and_then(|r| r.message),
        })
    }

    /// Reload the warehouse if no run holds the lock. A run in flight
    /// reloads on its own before it loads anything.
    fn sync_if_idle(&self) {
        let Ok(Some(_guard)) = self.acquire() else {
            return;
        };
        if let Err(e) = self.orchestrator.sync_warehouse() {
            warn!(pipeline = %self.pipeline(), error = %e, "warehouse reload failed");
        }
    }

    /// Start a view refresh in the background.
    pub fn trigger_refresh(&self, scope: AggregateScope) -> Result<RefreshTrigger, ServiceError> {
        self.sync_if_idle();
        Ok(self.refresher.trigger(scope)?)
    }

    /// Refresh and wait; joins a refresh already in flight.
    pub fn refresh(&self, scope: AggregateScope) -> Result<RefreshOutcome, ServiceError> {
        self.sync_if_idle();
        Ok(self.refresher.refresh(scope)?)
    }

    pub fn read_aggregate(&self, scope: &AggregateScope) -> AggregateRead {
        self.refresher.read(scope)
    }

    /// Start the configured refresh schedule; `None` when no interval is set.
    pub fn start_refresh_schedule(&self) -> Result<Option<RefreshSchedule>, ServiceError> {
        match self.refresh_interval {
            Some(interval) => Ok(Some(self.refresher.start_schedule(interval)?)),
            None => Ok(None),
        }
    }

    /// Rebuild derived measures under the pipeline's run lock, then persist.
    pub fn recompute(&self, natural_key: Option<&str>) -> Result<RecomputeReport, ServiceError> {
        let Some(_guard) = self.acquire()? else {
            return Err(LockError::Held(self.pipeline().to_string()).into());
        };
        self.orchestrator.sync_warehouse()?;
        let report = recompute::recompute(
            self.orchestrator.warehouse(),
            self.orchestrator.transformer(),
            natural_key,
            persist::timestamp_now(),
        )?;
        if report.counts.changed() > 0 {
            self.orchestrator.save_warehouse()?;
        }
        Ok(report)
    }
}

/// Terminal record for a run that ended on an infrastructure error.
fn aborted_record(orchestrator: &EtlOrchestrator, options: &RunOptions, error: &RunError) -> RunRecord {
    let now = persist::timestamp_now();
    let run_id = options
        .run_id
        .clone()
        .unwrap_or_else(|| orchestrator.next_run_id());
    let mut record = RunRecord::started(run_id, orchestrator.pipeline(), now, None, options.replay);
    record.state = RunState::Failed;
    record.finished_at = Some(now);
    record.message = Some(error.to_string());
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watermark::MemoryWatermarkStore;
    use chrono::NaiveDate;
    use starledger_core::domain::SourceRecord;
    use starledger_core::source::MemorySource;

    fn row(key: &str, day: u32) -> SourceRecord {
        let date = NaiveDate::from_ymd_opt(2024, 3, day).unwrap();
        SourceRecord {
            natural_key: key.into(),
            date,
            open: 10.0,
            high: 11.0,
            low: 9.0,
            close: 10.0 + day as f64,
            volume: 5,
            category: Some("Tech".into()),
            deleted: false,
            created_at: date.and_hms_opt(18, 0, 0).unwrap(),
        }
    }

    fn service() -> (Arc<MemorySource>, PipelineService) {
        let source = Arc::new(MemorySource::new());
        let warehouse = Arc::new(Warehouse::new(vec![]));
        let orchestrator = Arc::new(
            EtlOrchestrator::new("prices", Arc::clone(&warehouse), source.clone()).unwrap(),
        );
        let refresher = Arc::new(MaterializedViewRefresher::new(warehouse));
        let service = PipelineService::new(
            orchestrator,
            Arc::new(MemoryWatermarkStore::new()),
            refresher,
        );
        (source, service)
    }

    #[test]
    fn status_before_any_run_is_idle() {
        let (_, service) = service();
        let status = service.run_status().unwrap();
        assert_eq!(status.state, RunState::Idle);
        assert_eq!(status.run_id, None);
        assert!(status.errors.is_empty());
    }

    #[test]
    fn triggered_run_completes_in_background() {
        let (source, service) = service();
        source.push_records((1..=4).map(|d| row("E1", d)));

        let RunTrigger::Started { run_id } = service.trigger_run(RunOptions::default()).unwrap()
        else {
            panic!("expected the run to start");
        };
        service.wait_for_run();

        let status = service.run_status().unwrap();
        assert_eq!(status.state, RunState::Succeeded);
        assert_eq!(status.run_id, Some(run_id));
        assert_eq!(status.records_processed, 4);
        assert!(status.last_run_at.is_some());
    }

    #[test]
    fn trigger_while_locked_reports_already_running() {
        let (_, service) = service();
        let _held = service.lock().try_acquire("prices").unwrap();
        assert_eq!(
            service.trigger_run(RunOptions::default()).unwrap(),
            RunTrigger::AlreadyRunning
        );
        assert_eq!(service.run_status().unwrap().state, RunState::Running);
        assert!(service.run_blocking(RunOptions::default()).is_err());
    }

    #[test]
    fn refresh_and_read_through_the_service() {
        let (source, service) = service();
        source.push_records((1..=2).map(|d| row("E1", d)));
        service.run_blocking(RunOptions::default()).unwrap();

        service.refresh(AggregateScope::all()).unwrap();
        let read = service.read_aggregate(&AggregateScope::all());
        assert_eq!(read.rows.len(), 2);
        assert_eq!(read.rows[0].category, "Tech");
        assert!(read.last_refreshed.is_some());
    }
}
