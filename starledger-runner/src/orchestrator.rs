//! ETL orchestrator: one pipeline run, end to end.
//!
//! Idle → Running → {Succeeded, PartiallyFailed, Failed} → Idle.
//!
//! A run extracts source rows newer than the watermark, then processes each
//! entity independently on a private rayon pool: resolve dimension keys,
//! transform, load. One entity failing never affects another. The watermark
//! advances only past what was processed and never past a failed entity's
//! earliest change.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};

use starledger_core::dimension::{
    DimensionError, DimensionResolver, EntityResolution, ResolutionAction,
};
use starledger_core::domain::{
    CalendarKey, EntityAttributes, EntityReference, FactKey, FactRecord, FactRow, Measures,
    RejectedRow, RunId, SourceRecord,
};
use starledger_core::fact::{FactLoader, LoadCounts, LoadError};
use starledger_core::metrics::{MetricTransformer, PricePoint, TransformError};
use starledger_core::persist::PersistError;
use starledger_core::source::{self, EntityWindow, OperationalSource};
use starledger_core::Warehouse;

use crate::config::{ConfigError, PipelineConfig};
use crate::history::{EntityErrorSummary, HistoryError, RunHistory, RunRecord};
use crate::run_lock::LockError;
use crate::watermark::{Watermark, WatermarkError, WatermarkStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Running,
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::PartiallyFailed | RunState::Failed
        )
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        match (self, next) {
            (RunState::Idle, RunState::Running) => true,
            (RunState::Running, n) => n.is_terminal(),
            (s, RunState::Idle) => s.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::PartiallyFailed => "partially_failed",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Infrastructure errors; data problems are reported through the run record.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("illegal run state transition {from} → {to}")]
    IllegalTransition { from: RunState, to: RunState },

    #[error(transparent)]
    Watermark(#[from] WatermarkError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("worker pool: {0}")]
    Pool(String),
}

/// Why one entity could not be processed.
#[derive(Debug, Error)]
pub enum EntityError {
    #[error("malformed source row ({0})")]
    Malformed(RejectedRow),

    #[error("dimension resolution failed: {0}")]
    Dimension(#[from] DimensionError),

    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),

    #[error("load failed: {0}")]
    Load(#[from] LoadError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityLoad {
    pub counts: LoadCounts,
    /// Entity versions created, versioned or backfilled while resolving.
    pub dimension_changes: usize,
}

/// Result of processing one entity's window.
#[derive(Debug)]
pub struct EntityOutcome {
    pub natural_key: String,
    pub first_change: NaiveDateTime,
    pub last_change: NaiveDateTime,
    pub result: Result<EntityLoad, EntityError>,
}

impl EntityOutcome {
    pub fn is_loaded(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub record: RunRecord,
    pub outcomes: Vec<EntityOutcome>,
}

impl RunReport {
    pub fn state(&self) -> RunState {
        self.record.state
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Extract everything regardless of the watermark.
    pub replay: bool,
    /// Run id to use; generated when `None`.
    pub run_id: Option<RunId>,
}

/// Watermark after a run: the highest processed change timestamp, clamped to
/// just before the earliest change of any failed entity, and never below
/// `previous`.
pub fn advance_watermark(
    previous: Option<NaiveDateTime>,
    processed_high: Option<NaiveDateTime>,
    lowest_failed: Option<NaiveDateTime>,
) -> Option<NaiveDateTime> {
    let candidate = match (processed_high, lowest_failed) {
        (Some(high), Some(failed)) => Some(high.min(failed - Duration::nanoseconds(1))),
        (Some(high), None) => Some(high),
        (None, _) => None,
    };
    previous.max(candidate)
}

pub struct EtlOrchestrator {
    pipeline: String,
    warehouse: Arc<Warehouse>,
    source: Arc<dyn OperationalSource>,
    transformer: MetricTransformer,
    max_retries: u32,
    history: Option<RunHistory>,
    persist_dir: Option<PathBuf>,
    pool: rayon::ThreadPool,
    state: Mutex<RunState>,
    sequence: AtomicU64,
}

fn build_pool(threads: usize) -> Result<rayon::ThreadPool, RunError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("starledger-etl-{i}"))
        .build()
        .map_err(|e| RunError::Pool(e.to_string()))
}

fn now() -> NaiveDateTime {
    starledger_core::persist::timestamp_now()
}

impl EtlOrchestrator {
    pub fn new(
        pipeline: impl Into<String>,
        warehouse: Arc<Warehouse>,
        source: Arc<dyn OperationalSource>,
    ) -> Result<Self, RunError> {
        Ok(Self {
            pipeline: pipeline.into(),
            warehouse,
            source,
            transformer: MetricTransformer::default(),
            max_retries: starledger_core::dimension::DEFAULT_MAX_RETRIES,
            history: None,
            persist_dir: None,
            pool: build_pool(4)?,
            state: Mutex::new(RunState::Idle),
            sequence: AtomicU64::new(0),
        })
    }

    /// Orchestrator wired the way `config` describes: history and warehouse
    /// persistence under the state directory.
    pub fn from_config(
        config: &PipelineConfig,
        warehouse: Arc<Warehouse>,
        source: Arc<dyn OperationalSource>,
    ) -> Result<Self, RunError> {
        let layout = config.layout();
        Ok(Self::new(&config.pipeline, warehouse, source)?
            .with_transformer(config.transformer()?)
            .with_max_retries(config.max_retries)
            .with_worker_threads(config.worker_threads)?
            .with_history(RunHistory::new(layout.runs_file(&config.pipeline)))
            .with_persistence(layout.root()))
    }

    pub fn with_transformer(mut self, transformer: MetricTransformer) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Result<Self, RunError> {
        self.pool = build_pool(threads.max(1))?;
        Ok(self)
    }

    pub fn with_history(mut self, history: RunHistory) -> Self {
        self.history = Some(history);
        self
    }

    /// Save the warehouse under `state_dir` before the watermark advances.
    pub fn with_persistence(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.persist_dir = Some(state_dir.into());
        self
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn warehouse(&self) -> &Arc<Warehouse> {
        &self.warehouse
    }

    pub fn history(&self) -> Option<&RunHistory> {
        self.history.as_ref()
    }

    pub fn transformer(&self) -> &MetricTransformer {
        &self.transformer
    }

    /// Save the warehouse where runs persist it. No-op without persistence.
    pub fn save_warehouse(&self) -> Result<(), PersistError> {
        if let Some(dir) = &self.persist_dir {
            self.warehouse.save(dir, now())?;
        }
        Ok(())
    }

    /// Reload the warehouse if another process saved over it since this one
    /// last read or wrote it. Call with the pipeline's run lock held.
    pub fn sync_warehouse(&self) -> Result<bool, PersistError> {
        match &self.persist_dir {
            Some(dir) => self.warehouse.reload_if_changed(dir),
            None => Ok(false),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap()
    }

    pub fn next_run_id(&self) -> RunId {
        RunId::derive(
            &self.pipeline,
            now(),
            self.sequence.fetch_add(1, Ordering::Relaxed),
        )
    }

    fn transition(&self, next: RunState) -> Result<(), RunError> {
        let mut state = self.state.lock().unwrap();
        if !state.can_transition_to(next) {
            return Err(RunError::IllegalTransition {
                from: *state,
                to: next,
            });
        }
        *state = next;
        Ok(())
    }

    fn append(&self, record: &RunRecord) -> Result<(), RunError> {
        if let Some(history) = &self.history {
            history.append(record)?;
        }
        Ok(())
    }

    /// Execute one run. Returns `Err` only for infrastructure problems; a
    /// run that failed because of its data still returns a report.
    pub fn run(
        &self,
        watermarks: &dyn WatermarkStore,
        options: RunOptions,
    ) -> Result<RunReport, RunError> {
        self.transition(RunState::Running)?;
        let result = self.execute(watermarks, options);
        // terminal → Idle; an infrastructure error mid-run lands here too
        *self.state.lock().unwrap() = RunState::Idle;
        result
    }

    fn execute(
        &self,
        watermarks: &dyn WatermarkStore,
        options: RunOptions,
    ) -> Result<RunReport, RunError> {
        let run_id = options.run_id.unwrap_or_else(|| self.next_run_id());
        let started_at = now();
        let previous = watermarks.load(&self.pipeline)?;

        let mut record = RunRecord::started(
            run_id.clone(),
            &self.pipeline,
            started_at,
            previous.high_water,
            options.replay,
        );
        self.append(&record)?;
        info!(
            pipeline = %self.pipeline,
            run_id = %run_id.0,
            replay = options.replay,
            "run started"
        );

        if let Err(e) = self.sync_warehouse() {
            warn!(pipeline = %self.pipeline, error = %e, "warehouse reload failed");
            return self.finish(record, Vec::new(), RunState::Failed, Some(e.to_string()));
        }

        let since = if options.replay {
            None
        } else {
            previous.high_water
        };
        let batch = match source::extract(self.source.as_ref(), since) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(
                    pipeline = %self.pipeline,
                    run_id = %run_id.0,
                    error = %e,
                    "extraction failed"
                );
                return self.finish(record, Vec::new(), RunState::Failed, Some(e.to_string()));
            }
        };
        record.records_extracted = batch.record_count;

        let outcomes: Vec<EntityOutcome> = self.pool.install(|| {
            batch
                .windows
                .par_iter()
                .map(|(natural_key, window)| EntityOutcome {
                    natural_key: natural_key.clone(),
                    first_change: window.first_change,
                    last_change: window.last_change,
                    result: process_entity(
                        &self.warehouse,
                        &self.transformer,
                        self.max_retries,
                        window,
                        batch.references.get(natural_key),
                        started_at,
                    ),
                })
                .collect()
        });

        let state = tally(&mut record, &outcomes);
        if state == RunState::Failed {
            let message = format!("all {} entities failed", record.errors.len());
            return self.finish(record, outcomes, state, Some(message));
        }

        if let Err(e) = self.save_warehouse() {
            warn!(pipeline = %self.pipeline, error = %e, "warehouse save failed");
            return self.finish(record, outcomes, RunState::Failed, Some(e.to_string()));
        }

        let processed_high = outcomes
            .iter()
            .filter(|o| o.is_loaded())
            .map(|o| o.last_change)
            .max();
        let lowest_failed = outcomes
            .iter()
            .filter(|o| !o.is_loaded())
            .map(|o| o.first_change)
            .min();
        let high_water = advance_watermark(previous.high_water, processed_high, lowest_failed);

        let next = Watermark {
            pipeline: self.pipeline.clone(),
            high_water,
            last_run_id: Some(run_id.clone()),
            last_status: Some(state),
            records_processed: previous.records_processed + batch.record_count,
            updated_at: Some(now()),
        };
        if let Err(e) = watermarks.store(&next) {
            warn!(pipeline = %self.pipeline, error = %e, "watermark update failed");
            return self.finish(record, outcomes, RunState::Failed, Some(e.to_string()));
        }
        record.watermark_after = high_water;

        self.finish(record, outcomes, state, None)
    }

    fn finish(
        &self,
        mut record: RunRecord,
        outcomes: Vec<EntityOutcome>,
        state: RunState,
        message: Option<String>,
    ) -> Result<RunReport, RunError> {
        self.transition(state)?;
        record.state = state;
        record.finished_at = Some(now());
        record.message = message;
        self.append(&record)?;
        info!(
            pipeline = %self.pipeline,
            run_id = %record.run_id.0,
            state = %state,
            inserted = record.counts.inserted,
            updated = record.counts.updated,
            failed = record.errors.len(),
            "run finished"
        );
        Ok(RunReport { record, outcomes })
    }
}

/// Fold entity outcomes into `record` and pick the run's terminal state:
/// no failures succeed, all failing fails, anything between is partial.
pub(crate) fn tally(record: &mut RunRecord, outcomes: &[EntityOutcome]) -> RunState {
    for outcome in outcomes {
        match &outcome.result {
            Ok(load) => {
                record.counts += load.counts;
                record.entities_processed += 1;
            }
            Err(e) => {
                warn!(
                    pipeline = %record.pipeline,
                    run_id = %record.run_id.0,
                    entity = %outcome.natural_key,
                    error = %e,
                    "entity failed"
                );
                record.errors.push(EntityErrorSummary {
                    natural_key: outcome.natural_key.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
    match (record.errors.len(), outcomes.len()) {
        (0, _) => RunState::Succeeded,
        (f, total) if f == total => RunState::Failed,
        _ => RunState::PartiallyFailed,
    }
}

/// A slot of the series being transformed: a fact already stored, with the
/// attributes of the version it was loaded under, or an incoming source row
/// for that date.
enum Slot<'a> {
    Stored(FactRecord, EntityAttributes),
    Incoming(&'a SourceRecord),
}

/// Resolve, transform and load one entity's window.
///
/// The series recomputed is the window plus every stored fact from the
/// window's first date onward, so a late or corrected row also refreshes the
/// derived measures of the days after it. Transformation runs before any
/// write; a malformed row leaves the warehouse untouched.
///
/// Slots are resolved in date order. Stored facts are resolved again with the
/// attributes they were loaded under, so a correction that versions the
/// entity mid-history leaves every fact on the version covering its date.
pub(crate) fn process_entity(
    warehouse: &Warehouse,
    transformer: &MetricTransformer,
    max_retries: u32,
    window: &EntityWindow,
    reference: Option<&EntityReference>,
    now: NaiveDateTime,
) -> Result<EntityLoad, EntityError> {
    if let Some(bad) = window.rejected.first() {
        return Err(EntityError::Malformed(bad.clone()));
    }
    let natural_key = &window.natural_key;
    let Some(first_date) = window.first_date() else {
        return Ok(EntityLoad::default());
    };
    let first_key = CalendarKey::from_date(first_date);

    let lineage = warehouse.entities.lineage_keys(natural_key);
    let (before, tail): (Vec<FactRecord>, Vec<FactRecord>) = warehouse
        .facts
        .for_lineage(&lineage)
        .into_iter()
        .partition(|f| f.key.calendar_key < first_key);
    let history: Vec<PricePoint> = before[before.len().saturating_sub(transformer.lookback())..]
        .iter()
        .filter_map(PricePoint::from_fact)
        .collect();

    let mut series: BTreeMap<NaiveDate, Slot<'_>> = BTreeMap::new();
    for f in tail {
        let Some(date) = f.key.calendar_key.to_date() else {
            continue;
        };
        let version = warehouse.entities.get(f.key.entity_key).ok_or_else(|| {
            DimensionError::Corrupt(format!(
                "fact on {date} references unknown entity version {}",
                f.key.entity_key
            ))
        })?;
        series.insert(date, Slot::Stored(f, version.attributes));
    }
    let mut deletions = Vec::new();
    for record in &window.records {
        if record.deleted {
            series.remove(&record.date);
            deletions.push(record);
        } else {
            series.insert(record.date, Slot::Incoming(record));
        }
    }

    let points: Vec<PricePoint> = series
        .values()
        .filter_map(|slot| match slot {
            Slot::Stored(f, _) => PricePoint::from_fact(f),
            Slot::Incoming(r) => Some(PricePoint::from(*r)),
        })
        .collect();
    let measures = transformer.transform_series(&history, &points)?;

    let resolver = DimensionResolver::new(
        &warehouse.entities,
        &warehouse.calendar,
        &warehouse.categories,
    )
    .with_max_retries(max_retries);

    let mut resolutions: Vec<EntityResolution> = Vec::with_capacity(series.len());
    let mut rows = Vec::with_capacity(series.len() + deletions.len());
    for ((date, slot), m) in series.iter().zip(measures) {
        let row = match slot {
            Slot::Stored(f, attributes) => {
                let entity = resolver.resolve_entity(
                    natural_key,
                    attributes,
                    DimensionResolver::effective_time(*date),
                )?;
                resolutions.push(entity);
                FactRow {
                    key: FactKey {
                        entity_key: entity.key,
                        calendar_key: f.key.calendar_key,
                    },
                    category_key: f.category_key,
                    measures: m,
                    deleted: false,
                }
            }
            Slot::Incoming(r) => incoming_row(&resolver, r, reference, m, false, &mut resolutions)?,
        };
        rows.push(row);
    }
    for r in deletions {
        let undefined = transformer.undefined(&PricePoint::from(r));
        rows.push(incoming_row(&resolver, r, reference, undefined, true, &mut resolutions)?);
    }

    let lineage = warehouse.entities.lineage_keys(natural_key);
    let counts = FactLoader::new(&warehouse.facts).load_entity(&lineage, &rows, now)?;
    Ok(EntityLoad {
        counts,
        dimension_changes: resolutions
            .iter()
            .filter(|r| r.action != ResolutionAction::Reused)
            .count(),
    })
}

fn incoming_row(
    resolver: &DimensionResolver<'_>,
    record: &SourceRecord,
    reference: Option<&EntityReference>,
    measures: Measures,
    deleted: bool,
    resolutions: &mut Vec<EntityResolution>,
) -> Result<FactRow, EntityError> {
    let keys = resolver.resolve_record(record, reference)?;
    resolutions.push(keys.entity);
    Ok(FactRow {
        key: FactKey {
            entity_key: keys.entity.key,
            calendar_key: keys.calendar_key,
        },
        category_key: keys.category_key,
        measures,
        deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watermark::MemoryWatermarkStore;
    use starledger_core::domain::SourceRecord;
    use starledger_core::source::MemorySource;

    fn ts(day: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 2, day)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn row(key: &str, day: u32, close: f64) -> SourceRecord {
        SourceRecord {
            natural_key: key.into(),
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100,
            category: None,
            deleted: false,
            created_at: ts(day, 12),
        }
    }

    fn setup() -> (Arc<MemorySource>, EtlOrchestrator, MemoryWatermarkStore) {
        let source = Arc::new(MemorySource::new());
        let warehouse = Arc::new(Warehouse::new(vec![]));
        let orchestrator = EtlOrchestrator::new("prices", warehouse, source.clone())
            .unwrap()
            .with_worker_threads(2)
            .unwrap();
        (source, orchestrator, MemoryWatermarkStore::new())
    }

    #[test]
    fn state_machine_rejects_illegal_transitions() {
        assert!(RunState::Idle.can_transition_to(RunState::Running));
        assert!(RunState::Running.can_transition_to(RunState::PartiallyFailed));
        assert!(RunState::Failed.can_transition_to(RunState::Idle));
        assert!(!RunState::Idle.can_transition_to(RunState::Succeeded));
        assert!(!RunState::Running.can_transition_to(RunState::Running));
        assert!(!RunState::Succeeded.can_transition_to(RunState::Running));
    }

    #[test]
    fn watermark_advance_rules() {
        let prev = Some(ts(1, 0));
        // success
        assert_eq!(advance_watermark(prev, Some(ts(5, 0)), None), Some(ts(5, 0)));
        // clamped below the earliest failed change
        assert_eq!(
            advance_watermark(prev, Some(ts(5, 0)), Some(ts(3, 0))),
            Some(ts(3, 0) - Duration::nanoseconds(1))
        );
        // never backwards
        assert_eq!(advance_watermark(prev, Some(ts(5, 0)), Some(ts(1, 0))), prev);
        assert_eq!(advance_watermark(prev, None, Some(ts(3, 0))), prev);
        assert_eq!(advance_watermark(None, None, None), None);
    }

    #[test]
    fn run_loads_and_returns_to_idle() {
        let (source, orch, wm) = setup();
        source.push_records((1..=3).map(|d| row("E1", d, 10.0 + d as f64)));

        let report = orch.run(&wm, RunOptions::default()).unwrap();
        assert_eq!(report.state(), RunState::Succeeded);
        assert_eq!(report.record.counts.inserted, 3);
        assert_eq!(orch.state(), RunState::Idle);
        assert_eq!(wm.load("prices").unwrap().high_water, Some(ts(3, 12)));
    }

    #[test]
    fn unavailable_source_fails_without_touching_watermark() {
        let (source, orch, wm) = setup();
        source.set_unavailable(true);
        let report = orch.run(&wm, RunOptions::default()).unwrap();
        assert_eq!(report.state(), RunState::Failed);
        assert!(report.record.message.is_some());
        assert_eq!(wm.load("prices").unwrap(), Watermark::initial("prices"));
    }

    #[test]
    fn corrected_row_refreshes_following_days() {
        let (source, orch, wm) = setup();
        source.push_records((1..=3).map(|d| row("E1", d, 10.0)));
        orch.run(&wm, RunOptions::default()).unwrap();

        // restate day 2 later
        let mut fix = row("E1", 2, 13.0);
        fix.created_at = ts(10, 0);
        source.push_records([fix]);
        let report = orch.run(&wm, RunOptions::default()).unwrap();
        assert_eq!(report.state(), RunState::Succeeded);
        // day 2 close and day 3 pct change both change
        assert_eq!(report.record.counts.updated, 2);

        let facts = orch.warehouse().facts.snapshot();
        let day3 = facts
            .iter()
            .find(|f| f.key.calendar_key == CalendarKey(20240103))
            .unwrap();
        assert!(day3.measures.pct_change.unwrap() < 0.0);
    }

    #[test]
    fn deleted_source_row_soft_deletes_fact() {
        let (source, orch, wm) = setup();
        source.push_records((1..=3).map(|d| row("E1", d, 10.0)));
        orch.run(&wm, RunOptions::default()).unwrap();

        let mut gone = row("E1", 3, 10.0);
        gone.deleted = true;
        gone.created_at = ts(10, 0);
        source.push_records([gone]);
        orch.run(&wm, RunOptions::default()).unwrap();

        let live = orch
            .warehouse()
            .facts
            .for_lineage(&[starledger_core::domain::SurrogateKey(1)]);
        assert_eq!(live.len(), 2);
        assert_eq!(orch.warehouse().facts.len(), 3);
    }

    fn tagged(key: &str, day: u32, close: f64, category: &str) -> SourceRecord {
        SourceRecord {
            category: Some(category.into()),
            ..row(key, day, close)
        }
    }

    fn jan(day: u32) -> NaiveDateTime {
        DimensionResolver::effective_time(NaiveDate::from_ymd_opt(2024, 1, day).unwrap())
    }

    #[test]
    fn mid_history_correction_rekeys_following_facts() {
        let (source, orch, wm) = setup();
        source.push_records((1..=20).map(|d| tagged("E1", d, 10.0 + d as f64, "Tech")));
        orch.run(&wm, RunOptions::default()).unwrap();

        let mut fix = tagged("E1", 10, 20.0, "Energy");
        fix.created_at = ts(25, 0);
        source.push_records([fix]);
        let report = orch.run(&wm, RunOptions::default()).unwrap();
        assert_eq!(report.state(), RunState::Succeeded);

        let wh = orch.warehouse();
        let lineage = wh.entities.lineage("E1");
        let categories: Vec<&str> = lineage
            .iter()
            .map(|v| v.attributes.category.as_str())
            .collect();
        assert_eq!(categories, ["Tech", "Energy", "Tech"]);
        assert_eq!(lineage[1].valid_from, jan(10));
        assert_eq!(lineage[1].valid_to, Some(jan(11)));
        assert!(lineage[2].is_current);

        let live = wh.facts.for_lineage(&wh.entities.lineage_keys("E1"));
        assert_eq!(live.len(), 20);
        for fact in &live {
            let date = fact.key.calendar_key.to_date().unwrap();
            let version = wh.entities.get(fact.key.entity_key).unwrap();
            assert!(
                version.covers(DimensionResolver::effective_time(date)),
                "fact on {date} keyed to version starting {}",
                version.valid_from
            );
        }

        // replaying the same history settles on the same versions
        let options = RunOptions {
            replay: true,
            ..RunOptions::default()
        };
        let replay = orch.run(&wm, options).unwrap();
        assert_eq!(replay.state(), RunState::Succeeded);
        assert_eq!(wh.entities.lineage("E1").len(), 3);
    }

    #[test]
    fn second_correction_on_same_date_restates_version() {
        let (source, orch, wm) = setup();
        source.push_records((1..=3).map(|d| tagged("E1", d, 10.0, "Tech")));
        orch.run(&wm, RunOptions::default()).unwrap();

        let mut first = tagged("E1", 3, 10.0, "Energy");
        first.created_at = ts(10, 0);
        source.push_records([first]);
        orch.run(&wm, RunOptions::default()).unwrap();

        let mut second = tagged("E1", 3, 10.0, "Utilities");
        second.created_at = ts(11, 0);
        source.push_records([second]);
        let report = orch.run(&wm, RunOptions::default()).unwrap();
        assert_eq!(report.state(), RunState::Succeeded);

        let lineage = orch.warehouse().entities.lineage("E1");
        assert_eq!(lineage.len(), 2);
        assert_eq!(lineage[1].attributes.category, "Utilities");
        assert_eq!(lineage[1].valid_from, jan(3));
        assert!(lineage
            .iter()
            .all(|v| v.valid_to.map_or(true, |end| end > v.valid_from)));
    }

    #[test]
    fn rejected_row_fails_only_its_entity() {
        let wh = Warehouse::new(vec![]);
        let transformer = MetricTransformer::default();
        let window = EntityWindow {
            natural_key: "E1".into(),
            records: vec![row("E1", 1, 10.0)],
            rejected: vec![RejectedRow {
                natural_key: "E1".into(),
                date: NaiveDate::from_ymd_opt(2024, 1, 2),
                created_at: ts(2, 12),
                line: 3,
                reason: "invalid float literal".into(),
            }],
            first_change: ts(1, 12),
            last_change: ts(2, 12),
        };

        let err = process_entity(&wh, &transformer, 3, &window, None, ts(3, 0)).unwrap_err();
        assert!(matches!(err, EntityError::Malformed(ref r) if r.line == 3));
        assert!(wh.facts.is_empty());
        assert!(wh.entities.is_empty());
    }

    #[test]
    fn exhausted_retries_mark_run_partially_failed() {
        let mut record = RunRecord::started(RunId("r1".into()), "prices", ts(20, 0), None, false);
        let outcomes = vec![
            EntityOutcome {
                natural_key: "E1".into(),
                first_change: ts(1, 12),
                last_change: ts(5, 12),
                result: Ok(EntityLoad {
                    counts: LoadCounts {
                        inserted: 5,
                        ..LoadCounts::default()
                    },
                    dimension_changes: 1,
                }),
            },
            EntityOutcome {
                natural_key: "E2".into(),
                first_change: ts(3, 12),
                last_change: ts(4, 12),
                result: Err(EntityError::Dimension(DimensionError::RetriesExhausted {
                    natural_key: "E2".into(),
                    attempts: 1,
                })),
            },
        ];

        let state = tally(&mut record, &outcomes);
        assert_eq!(state, RunState::PartiallyFailed);
        assert_eq!(record.entities_processed, 1);
        assert_eq!(record.counts.inserted, 5);
        assert_eq!(record.errors.len(), 1);
        assert_eq!(record.errors[0].natural_key, "E2");
        assert!(record.errors[0].error.contains("conflicting attempts"));

        let processed_high = outcomes
            .iter()
            .filter(|o| o.is_loaded())
            .map(|o| o.last_change)
            .max();
        let lowest_failed = outcomes
            .iter()
            .filter(|o| !o.is_loaded())
            .map(|o| o.first_change)
            .min();
        assert_eq!(
            advance_watermark(None, processed_high, lowest_failed),
            Some(ts(3, 12) - Duration::nanoseconds(1))
        );
    }
}
