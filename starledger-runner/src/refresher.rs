//! Materialized view refresher for the `category_daily` aggregate.
//!
//! A refresh recomputes the rows in its scope from the live facts, stages the
//! full new table, persists it (Parquet first, metadata sidecar last) and then
//! swaps the published snapshot in one step. Readers hold an `Arc` of the
//! snapshot they started with, so they see either the old table or the new
//! one, never a mix.
//!
//! At most one refresh runs at a time. A blocking caller that arrives while a
//! refresh is in flight waits for it and shares its result; a trigger returns
//! `InProgress` immediately. Triggers arriving within the minimum interval of
//! the last refresh start are coalesced into it the same way.

use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use starledger_core::domain::{AggregateRow, AggregateScope, CalendarKey, RunId, SurrogateKey};
use starledger_core::persist::{self, PersistError};
use starledger_core::Warehouse;

pub const VIEW_NAME: &str = "category_daily";

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("aggregate computation: {0}")]
    Compute(String),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("stored aggregate is inconsistent: {0}")]
    Corrupt(String),

    /// The in-flight refresh this caller waited on failed.
    #[error("refresh failed: {0}")]
    Failed(String),

    #[error("could not start refresh thread: {0}")]
    Spawn(String),
}

impl From<PolarsError> for RefreshError {
    fn from(e: PolarsError) -> Self {
        RefreshError::Compute(e.to_string())
    }
}

/// Published state of the aggregate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateSnapshot {
    /// Sorted by (category, date).
    pub rows: Vec<AggregateRow>,
    pub last_refreshed: Option<NaiveDateTime>,
    pub refresh_id: Option<String>,
}

/// Rows of one read, with the refresh time of the snapshot they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRead {
    pub rows: Vec<AggregateRow>,
    pub last_refreshed: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefreshTrigger {
    Started { refresh_id: String },
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshOutcome {
    pub refresh_id: String,
    pub scope: AggregateScope,
    /// Rows recomputed inside the scope.
    pub rows_written: usize,
    /// Rows of the published table after the swap.
    pub total_rows: usize,
    pub refreshed_at: NaiveDateTime,
}

/// Sidecar written after the Parquet file; its presence marks a complete table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AggregateMeta {
    view: String,
    refresh_id: String,
    refreshed_at: NaiveDateTime,
    scope: AggregateScope,
    row_count: usize,
    data_hash: String,
}

#[derive(Debug, Default)]
struct Flight {
    running: Option<String>,
    started_at: Option<Instant>,
    generation: u64,
    last: Option<Result<RefreshOutcome, String>>,
}

pub struct MaterializedViewRefresher {
    warehouse: Arc<Warehouse>,
    persist_dir: Option<PathBuf>,
    min_interval: Duration,
    published: RwLock<Arc<AggregateSnapshot>>,
    flight: Mutex<Flight>,
    done: Condvar,
    sequence: AtomicU64,
    completed: AtomicU64,
}

impl MaterializedViewRefresher {
    pub fn new(warehouse: Arc<Warehouse>) -> Self {
        Self {
            warehouse,
            persist_dir: None,
            min_interval: Duration::ZERO,
            published: RwLock::new(Arc::new(AggregateSnapshot::default())),
            flight: Mutex::new(Flight::default()),
            done: Condvar::new(),
            sequence: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Persist refreshed tables under `dir` and publish the table already
    /// stored there. A stored table that fails its consistency check is
    /// discarded with a warning; the aggregate is rebuildable from the facts.
    pub fn with_persistence(mut self, dir: impl Into<PathBuf>) -> Result<Self, RefreshError> {
        let dir = dir.into();
        match load_snapshot(&dir) {
            Ok(Some(snapshot)) => {
                info!(
                    view = VIEW_NAME,
                    rows = snapshot.rows.len(),
                    "loaded stored aggregate"
                );
                self.published = RwLock::new(Arc::new(snapshot));
            }
            Ok(None) => {}
            Err(RefreshError::Corrupt(reason)) => {
                warn!(view = VIEW_NAME, %reason, "ignoring stored aggregate");
            }
            Err(e) => return Err(e),
        }
        self.persist_dir = Some(dir);
        Ok(self)
    }

    /// Coalesce triggers that arrive within `interval` of the last refresh
    /// start. Blocking refreshes are not affected.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<AggregateSnapshot> {
        Arc::clone(&self.published.read().unwrap())
    }

    /// Published rows inside `scope`.
    pub fn read(&self, scope: &AggregateScope) -> AggregateRead {
        let snapshot = self.snapshot();
        AggregateRead {
            rows: snapshot
                .rows
                .iter()
                .filter(|r| scope.contains(&r.category, r.date))
                .cloned()
                .collect(),
            last_refreshed: snapshot.last_refreshed,
        }
    }

    /// Number of refreshes that completed and published.
    pub fn refresh_count(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn is_refreshing(&self) -> bool {
        self.flight.lock().unwrap().running.is_some()
    }

    /// Refresh and block until done. If another refresh is already running,
    /// wait for it instead and return its result.
    pub fn refresh(&self, scope: AggregateScope) -> Result<RefreshOutcome, RefreshError> {
        match self.begin(false) {
            Ok(refresh_id) => self.execute(refresh_id, scope),
            Err(generation) => {
                debug!(view = VIEW_NAME, "joining in-flight refresh");
                self.wait_for(generation)
            }
        }
    }

    /// Start a refresh on a background thread and return immediately.
    pub fn trigger(self: &Arc<Self>, scope: AggregateScope) -> Result<RefreshTrigger, RefreshError> {
        let refresh_id = match self.begin(true) {
            Ok(id) => id,
            Err(_) => {
                debug!(view = VIEW_NAME, "refresh already in progress");
                return Ok(RefreshTrigger::InProgress);
            }
        };

        let this = Arc::clone(self);
        let id = refresh_id.clone();
        let spawned = thread::Builder::new()
            .name("starledger-refresh".into())
            .spawn(move || {
                let _ = this.execute(id, scope);
            });
        if let Err(e) = spawned {
            let reason = e.to_string();
            self.complete(&Err(RefreshError::Spawn(reason.clone())));
            return Err(RefreshError::Spawn(reason));
        }
        Ok(RefreshTrigger::Started { refresh_id })
    }

    /// Block until no refresh is running.
    pub fn wait_idle(&self) {
        let mut flight = self.flight.lock().unwrap();
        while flight.running.is_some() {
            flight = self.done.wait(flight).unwrap();
        }
    }

    /// Refresh the whole table every `interval` until the handle is stopped.
    /// A tick that finds a refresh in flight is skipped.
    pub fn start_schedule(
        self: &Arc<Self>,
        interval: Duration,
    ) -> Result<RefreshSchedule, RefreshError> {
        let (stop, ticks) = mpsc::channel::<()>();
        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("starledger-refresh-schedule".into())
            .spawn(move || loop {
                match ticks.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match this.begin(false) {
                        Ok(id) => {
                            if let Err(e) = this.execute(id, AggregateScope::all()) {
                                warn!(view = VIEW_NAME, error = %e, "scheduled refresh failed");
                            }
                        }
                        Err(_) => debug!(view = VIEW_NAME, "scheduled tick skipped"),
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| RefreshError::Spawn(e.to_string()))?;
        info!(view = VIEW_NAME, interval_secs = interval.as_secs(), "refresh schedule started");
        Ok(RefreshSchedule {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Claim the single flight slot. `Err` carries the current generation when
    /// a refresh is running, or when `coalesce` is set and the last one started
    /// less than `min_interval` ago.
    fn begin(&self, coalesce: bool) -> Result<String, u64> {
        let mut flight = self.flight.lock().unwrap();
        if flight.running.is_some() {
            return Err(flight.generation);
        }
        let recent = flight
            .started_at
            .is_some_and(|t| t.elapsed() < self.min_interval);
        if coalesce && recent {
            return Err(flight.generation);
        }
        let id = RunId::derive(
            VIEW_NAME,
            persist::timestamp_now(),
            self.sequence.fetch_add(1, Ordering::Relaxed),
        )
        .0;
        flight.running = Some(id.clone());
        flight.started_at = Some(Instant::now());
        Ok(id)
    }

    fn complete(&self, result: &Result<RefreshOutcome, RefreshError>) {
        let mut flight = self.flight.lock().unwrap();
        flight.running = None;
        flight.generation += 1;
        flight.last = Some(match result {
            Ok(outcome) => Ok(outcome.clone()),
            Err(e) => Err(e.to_string()),
        });
        self.done.notify_all();
    }

    fn wait_for(&self, generation: u64) -> Result<RefreshOutcome, RefreshError> {
        let mut flight = self.flight.lock().unwrap();
        while flight.generation == generation {
            flight = self.done.wait(flight).unwrap();
        }
        match &flight.last {
            Some(Ok(outcome)) => Ok(outcome.clone()),
            Some(Err(reason)) => Err(RefreshError::Failed(reason.clone())),
            None => Err(RefreshError::Failed("no refresh result".into())),
        }
    }

    fn execute(
        &self,
        refresh_id: String,
        scope: AggregateScope,
    ) -> Result<RefreshOutcome, RefreshError> {
        info!(view = VIEW_NAME, refresh_id = %refresh_id, ?scope, "refresh started");
        let result = self.refresh_and_publish(&refresh_id, &scope);
        match &result {
            Ok(outcome) => info!(
                view = VIEW_NAME,
                refresh_id = %refresh_id,
                rows = outcome.rows_written,
                total = outcome.total_rows,
                "refresh published"
            ),
            Err(e) => warn!(
                view = VIEW_NAME,
                refresh_id = %refresh_id,
                error = %e,
                "refresh failed; previous aggregate stays published"
            ),
        }
        self.complete(&result);
        result
    }

    fn refresh_and_publish(
        &self,
        refresh_id: &str,
        scope: &AggregateScope,
    ) -> Result<RefreshOutcome, RefreshError> {
        let refreshed_at = persist::timestamp_now();
        let staged = compute_rows(&self.warehouse, scope, refreshed_at)?;
        let rows_written = staged.len();

        let previous = self.snapshot();
        let mut rows: Vec<AggregateRow> = if scope.is_full() {
            staged
        } else {
            previous
                .rows
                .iter()
                .filter(|r| !scope.contains(&r.category, r.date))
                .cloned()
                .chain(staged)
                .collect()
        };
        rows.sort_by(|a, b| a.category.cmp(&b.category).then(a.date.cmp(&b.date)));

        let snapshot = AggregateSnapshot {
            rows,
            last_refreshed: Some(refreshed_at),
            refresh_id: Some(refresh_id.to_string()),
        };
        if let Some(dir) = &self.persist_dir {
            store_snapshot(dir, &snapshot, scope)?;
        }

        let total_rows = snapshot.rows.len();
        *self.published.write().unwrap() = Arc::new(snapshot);
        self.completed.fetch_add(1, Ordering::SeqCst);

        Ok(RefreshOutcome {
            refresh_id: refresh_id.to_string(),
            scope: scope.clone(),
            rows_written,
            total_rows,
            refreshed_at,
        })
    }
}

/// Handle of a running refresh schedule. Dropping it stops the schedule.
pub struct RefreshSchedule {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RefreshSchedule {
    /// Stop the schedule and wait for a tick in progress to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RefreshSchedule {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Aggregate the live facts inside `scope` into `category_daily` rows.
pub fn compute_rows(
    warehouse: &Warehouse,
    scope: &AggregateScope,
    refreshed_at: NaiveDateTime,
) -> Result<Vec<AggregateRow>, RefreshError> {
    let names: HashMap<SurrogateKey, String> = warehouse
        .categories
        .rows()
        .into_iter()
        .map(|c| (c.key, c.name))
        .collect();

    let mut category_keys = Vec::new();
    let mut categories = Vec::new();
    let mut calendar_keys = Vec::new();
    let mut closes = Vec::new();
    let mut volumes = Vec::new();
    let mut pct_changes = Vec::new();
    for fact in warehouse.facts.snapshot() {
        if fact.deleted {
            continue;
        }
        let Some(name) = names.get(&fact.category_key) else {
            continue;
        };
        if !scope.contains_category(name) {
            continue;
        }
        category_keys.push(fact.category_key.0);
        categories.push(name.clone());
        calendar_keys.push(fact.key.calendar_key.0);
        closes.push(fact.measures.close);
        volumes.push(fact.measures.volume);
        pct_changes.push(fact.measures.pct_change);
    }

    let df = DataFrame::new(vec![
        Column::new("category_key".into(), category_keys),
        Column::new("category".into(), categories),
        Column::new("calendar_key".into(), calendar_keys),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
        Column::new("pct_change".into(), pct_changes),
    ])?;

    let mut lf = df.lazy();
    if let Some(from) = scope.from {
        lf = lf.filter(col("calendar_key").gt_eq(lit(CalendarKey::from_date(from).0)));
    }
    if let Some(to) = scope.to {
        lf = lf.filter(col("calendar_key").lt_eq(lit(CalendarKey::from_date(to).0)));
    }
    let out = lf
        .group_by([col("category_key"), col("category"), col("calendar_key")])
        .agg([
            col("close").count().cast(DataType::UInt64).alias("fact_count"),
            col("close").mean().alias("avg_close"),
            col("close").min().alias("min_close"),
            col("close").max().alias("max_close"),
            col("volume").sum().cast(DataType::UInt64).alias("total_volume"),
            col("pct_change").mean().alias("avg_pct_change"),
        ])
        .sort(["category", "calendar_key"], SortMultipleOptions::default())
        .collect()?;

    let category_key = out.column("category_key")?.u64()?;
    let category = out.column("category")?.str()?;
    let calendar_key = out.column("calendar_key")?.i32()?;
    let fact_count = out.column("fact_count")?.u64()?;
    let avg_close = out.column("avg_close")?.f64()?;
    let min_close = out.column("min_close")?.f64()?;
    let max_close = out.column("max_close")?.f64()?;
    let total_volume = out.column("total_volume")?.u64()?;
    let avg_pct_change = out.column("avg_pct_change")?.f64()?;

    let mut rows = Vec::with_capacity(out.height());
    for i in 0..out.height() {
        let (Some(key), Some(name), Some(date)) = (
            category_key.get(i),
            category.get(i),
            calendar_key.get(i).and_then(|k| CalendarKey(k).to_date()),
        ) else {
            return Err(RefreshError::Compute(format!("null group key at row {i}")));
        };
        rows.push(AggregateRow {
            category_key: SurrogateKey(key),
            category: name.to_string(),
            date,
            fact_count: fact_count.get(i).unwrap_or(0),
            avg_close: avg_close.get(i).unwrap_or(f64::NAN),
            min_close: min_close.get(i).unwrap_or(f64::NAN),
            max_close: max_close.get(i).unwrap_or(f64::NAN),
            total_volume: total_volume.get(i).unwrap_or(0),
            avg_pct_change: avg_pct_change.get(i),
            last_updated: refreshed_at,
        });
    }
    Ok(rows)
}

fn table_path(dir: &Path) -> PathBuf {
    dir.join(format!("{VIEW_NAME}.parquet"))
}

fn meta_path(dir: &Path) -> PathBuf {
    dir.join(format!("{VIEW_NAME}.meta.json"))
}

fn rows_hash(rows: &[AggregateRow]) -> Result<String, RefreshError> {
    let bytes = serde_json::to_vec(rows).map_err(|e| PersistError::Json(e.to_string()))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

fn micros(t: NaiveDateTime) -> i64 {
    t.and_utc().timestamp_micros()
}

fn from_micros(us: i64) -> Option<NaiveDateTime> {
    chrono::DateTime::from_timestamp_micros(us).map(|t| t.naive_utc())
}

fn rows_to_dataframe(rows: &[AggregateRow]) -> Result<DataFrame, RefreshError> {
    let df = DataFrame::new(vec![
        Column::new(
            "category_key".into(),
            rows.iter().map(|r| r.category_key.0).collect::<Vec<u64>>(),
        ),
        Column::new(
            "category".into(),
            rows.iter().map(|r| r.category.clone()).collect::<Vec<String>>(),
        ),
        Column::new(
            "calendar_key".into(),
            rows.iter()
                .map(|r| CalendarKey::from_date(r.date).0)
                .collect::<Vec<i32>>(),
        ),
        Column::new(
            "fact_count".into(),
            rows.iter().map(|r| r.fact_count).collect::<Vec<u64>>(),
        ),
        Column::new(
            "avg_close".into(),
            rows.iter().map(|r| r.avg_close).collect::<Vec<f64>>(),
        ),
        Column::new(
            "min_close".into(),
            rows.iter().map(|r| r.min_close).collect::<Vec<f64>>(),
        ),
        Column::new(
            "max_close".into(),
            rows.iter().map(|r| r.max_close).collect::<Vec<f64>>(),
        ),
        Column::new(
            "total_volume".into(),
            rows.iter().map(|r| r.total_volume).collect::<Vec<u64>>(),
        ),
        Column::new(
            "avg_pct_change".into(),
            rows.iter()
                .map(|r| r.avg_pct_change)
                .collect::<Vec<Option<f64>>>(),
        ),
        Column::new(
            "last_updated".into(),
            rows.iter()
                .map(|r| micros(r.last_updated))
                .collect::<Vec<i64>>(),
        ),
    ])?;
    Ok(df)
}

fn dataframe_to_rows(df: &DataFrame) -> Result<Vec<AggregateRow>, RefreshError> {
    let corrupt = |e: PolarsError| RefreshError::Corrupt(e.to_string());
    let category_key = df.column("category_key").map_err(corrupt)?.u64().map_err(corrupt)?;
    let category = df.column("category").map_err(corrupt)?.str().map_err(corrupt)?;
    let calendar_key = df.column("calendar_key").map_err(corrupt)?.i32().map_err(corrupt)?;
    let fact_count = df.column("fact_count").map_err(corrupt)?.u64().map_err(corrupt)?;
    let avg_close = df.column("avg_close").map_err(corrupt)?.f64().map_err(corrupt)?;
    let min_close = df.column("min_close").map_err(corrupt)?.f64().map_err(corrupt)?;
    let max_close = df.column("max_close").map_err(corrupt)?.f64().map_err(corrupt)?;
    let total_volume = df.column("total_volume").map_err(corrupt)?.u64().map_err(corrupt)?;
    let avg_pct_change = df
        .column("avg_pct_change")
        .map_err(corrupt)?
        .f64()
        .map_err(corrupt)?;
    let last_updated = df.column("last_updated").map_err(corrupt)?.i64().map_err(corrupt)?;

    (0..df.height())
        .map(|i| {
            let missing = || RefreshError::Corrupt(format!("null value at row {i}"));
            let date: NaiveDate = calendar_key
                .get(i)
                .and_then(|k| CalendarKey(k).to_date())
                .ok_or_else(missing)?;
            Ok(AggregateRow {
                category_key: SurrogateKey(category_key.get(i).ok_or_else(missing)?),
                category: category.get(i).ok_or_else(missing)?.to_string(),
                date,
                fact_count: fact_count.get(i).ok_or_else(missing)?,
                avg_close: avg_close.get(i).ok_or_else(missing)?,
                min_close: min_close.get(i).ok_or_else(missing)?,
                max_close: max_close.get(i).ok_or_else(missing)?,
                total_volume: total_volume.get(i).ok_or_else(missing)?,
                avg_pct_change: avg_pct_change.get(i),
                last_updated: last_updated
                    .get(i)
                    .and_then(from_micros)
                    .ok_or_else(missing)?,
            })
        })
        .collect()
}

fn store_snapshot(
    dir: &Path,
    snapshot: &AggregateSnapshot,
    scope: &AggregateScope,
) -> Result<(), RefreshError> {
    let (Some(refresh_id), Some(refreshed_at)) = (&snapshot.refresh_id, snapshot.last_refreshed)
    else {
        return Err(RefreshError::Compute("snapshot has no refresh id".into()));
    };
    let df = rows_to_dataframe(&snapshot.rows)?;
    persist::write_parquet_atomic(&df, &table_path(dir))?;
    let meta = AggregateMeta {
        view: VIEW_NAME.to_string(),
        refresh_id: refresh_id.clone(),
        refreshed_at,
        scope: scope.clone(),
        row_count: snapshot.rows.len(),
        data_hash: rows_hash(&snapshot.rows)?,
    };
    persist::write_json_atomic(&meta_path(dir), &meta)?;
    Ok(())
}

fn load_snapshot(dir: &Path) -> Result<Option<AggregateSnapshot>, RefreshError> {
    let Some(meta) = persist::read_json::<AggregateMeta>(&meta_path(dir))? else {
        return Ok(None);
    };
    let df = persist::read_parquet(&table_path(dir))?
        .ok_or_else(|| RefreshError::Corrupt("metadata present but table missing".into()))?;
    let rows = dataframe_to_rows(&df)?;
    if rows.len() != meta.row_count {
        return Err(RefreshError::Corrupt(format!(
            "expected {} rows, found {}",
            meta.row_count,
            rows.len()
        )));
    }
    if rows_hash(&rows)? != meta.data_hash {
        return Err(RefreshError::Corrupt("data hash mismatch".into()));
    }
    Ok(Some(AggregateSnapshot {
        rows,
        last_refreshed: Some(meta.refreshed_at),
        refresh_id: Some(meta.refresh_id),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use starledger_core::domain::{FactKey, FactRow, Measures};
    use starledger_core::fact::FactLoader;
    use std::collections::BTreeMap;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn t0() -> NaiveDateTime {
        day(1).and_hms_opt(0, 0, 0).unwrap()
    }

    fn fact(entity: u64, d: u32, category: SurrogateKey, close: f64) -> FactRow {
        FactRow {
            key: FactKey {
                entity_key: SurrogateKey(entity),
                calendar_key: CalendarKey::from_date(day(d)),
            },
            category_key: category,
            measures: Measures {
                open: close,
                high: close,
                low: close,
                close,
                volume: 10,
                pct_change: (d > 1).then_some(1.0),
                moving_averages: BTreeMap::new(),
            },
            deleted: false,
        }
    }

    /// Two tech entities and one energy entity over three days.
    fn warehouse() -> Arc<Warehouse> {
        let wh = Warehouse::new(vec![]);
        let tech = wh.categories.resolve("Tech");
        let energy = wh.categories.resolve("Energy");
        let mut rows = Vec::new();
        for d in 1..=3 {
            rows.push(fact(1, d, tech, 10.0));
            rows.push(fact(2, d, tech, 20.0));
            rows.push(fact(3, d, energy, 50.0));
        }
        FactLoader::new(&wh.facts).load(&rows, t0()).unwrap();
        Arc::new(wh)
    }

    #[test]
    fn full_refresh_groups_by_category_and_day() {
        let refresher = MaterializedViewRefresher::new(warehouse());
        let outcome = refresher.refresh(AggregateScope::all()).unwrap();
        assert_eq!(outcome.rows_written, 6);
        assert_eq!(refresher.refresh_count(), 1);

        let read = refresher.read(&AggregateScope::all().with_categories(vec!["Tech".into()]));
        assert_eq!(read.rows.len(), 3);
        let first = &read.rows[0];
        assert_eq!(first.date, day(1));
        assert_eq!(first.fact_count, 2);
        assert_eq!(first.avg_close, 15.0);
        assert_eq!(first.min_close, 10.0);
        assert_eq!(first.max_close, 20.0);
        assert_eq!(first.total_volume, 20);
        assert_eq!(first.avg_pct_change, None);
        assert_eq!(read.rows[1].avg_pct_change, Some(1.0));
        assert_eq!(read.last_refreshed, Some(outcome.refreshed_at));
    }

    #[test]
    fn scoped_refresh_leaves_other_rows_untouched() {
        let wh = warehouse();
        let refresher = MaterializedViewRefresher::new(Arc::clone(&wh));
        refresher.refresh(AggregateScope::all()).unwrap();

        // change every close, refresh only Tech on day 2
        let tech = wh.categories.key_of("Tech").unwrap();
        let energy = wh.categories.key_of("Energy").unwrap();
        let mut rows = Vec::new();
        for d in 1..=3 {
            rows.push(fact(1, d, tech, 30.0));
            rows.push(fact(2, d, tech, 30.0));
            rows.push(fact(3, d, energy, 90.0));
        }
        FactLoader::new(&wh.facts).load(&rows, t0()).unwrap();

        let scope = AggregateScope::dates(day(2), day(2)).with_categories(vec!["Tech".into()]);
        let outcome = refresher.refresh(scope).unwrap();
        assert_eq!(outcome.rows_written, 1);
        assert_eq!(outcome.total_rows, 6);

        let all = refresher.read(&AggregateScope::all()).rows;
        let close_of = |cat: &str, d: u32| {
            all.iter()
                .find(|r| r.category == cat && r.date == day(d))
                .map(|r| r.avg_close)
        };
        assert_eq!(close_of("Tech", 2), Some(30.0));
        assert_eq!(close_of("Tech", 1), Some(15.0));
        assert_eq!(close_of("Energy", 2), Some(50.0));
    }

    #[test]
    fn deleted_facts_are_excluded() {
        let wh = warehouse();
        let tech = wh.categories.key_of("Tech").unwrap();
        let mut gone = fact(2, 1, tech, 20.0);
        gone.deleted = true;
        FactLoader::new(&wh.facts).load(&[gone], t0()).unwrap();

        let rows = compute_rows(&wh, &AggregateScope::dates(day(1), day(1)), t0()).unwrap();
        let tech_row = rows.iter().find(|r| r.category == "Tech").unwrap();
        assert_eq!(tech_row.fact_count, 1);
        assert_eq!(tech_row.avg_close, 10.0);
    }

    #[test]
    fn readers_keep_the_snapshot_they_started_with() {
        let refresher = MaterializedViewRefresher::new(warehouse());
        let before = refresher.snapshot();
        assert!(before.rows.is_empty());
        refresher.refresh(AggregateScope::all()).unwrap();
        assert!(before.rows.is_empty());
        assert_eq!(refresher.snapshot().rows.len(), 6);
    }

    #[test]
    fn trigger_while_running_reports_in_progress() {
        let refresher = Arc::new(MaterializedViewRefresher::new(warehouse()));
        // hold the flight slot as an in-flight refresh would
        let id = refresher.begin(false).unwrap();
        assert_eq!(
            refresher.trigger(AggregateScope::all()).unwrap(),
            RefreshTrigger::InProgress
        );
        assert!(refresher.is_refreshing());

        let _ = refresher.execute(id, AggregateScope::all());
        refresher.wait_idle();
        assert_eq!(refresher.refresh_count(), 1);

        match refresher.trigger(AggregateScope::all()).unwrap() {
            RefreshTrigger::Started { .. } => {}
            other => panic!("expected Started, got {other:?}"),
        }
        refresher.wait_idle();
        assert_eq!(refresher.refresh_count(), 2);
    }

    #[test]
    fn waiting_caller_shares_in_flight_result() {
        let refresher = Arc::new(MaterializedViewRefresher::new(warehouse()));
        let id = refresher.begin(false).unwrap();
        let generation = refresher.flight.lock().unwrap().generation;
        assert!(refresher.begin(false).is_err());

        let waiter = {
            let r = Arc::clone(&refresher);
            thread::spawn(move || r.wait_for(generation))
        };
        let outcome = refresher.execute(id.clone(), AggregateScope::all()).unwrap();
        let shared = waiter.join().unwrap().unwrap();

        assert_eq!(shared.refresh_id, id);
        assert_eq!(shared, outcome);
        assert_eq!(refresher.refresh_count(), 1);
    }

    #[test]
    fn persisted_aggregate_is_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let refresher = MaterializedViewRefresher::new(warehouse())
            .with_persistence(dir.path())
            .unwrap();
        refresher.refresh(AggregateScope::all()).unwrap();
        assert!(dir.path().join("category_daily.parquet").exists());
        assert!(dir.path().join("category_daily.meta.json").exists());

        let reopened = MaterializedViewRefresher::new(warehouse())
            .with_persistence(dir.path())
            .unwrap();
        assert_eq!(*reopened.snapshot(), *refresher.snapshot());
    }

    #[test]
    fn inconsistent_stored_aggregate_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let refresher = MaterializedViewRefresher::new(warehouse())
            .with_persistence(dir.path())
            .unwrap();
        refresher.refresh(AggregateScope::all()).unwrap();

        let mut meta: AggregateMeta = persist::read_json(&meta_path(dir.path()))
            .unwrap()
            .unwrap();
        meta.row_count = 99;
        persist::write_json_atomic(&meta_path(dir.path()), &meta).unwrap();

        let reopened = MaterializedViewRefresher::new(warehouse())
            .with_persistence(dir.path())
            .unwrap();
        assert!(reopened.snapshot().rows.is_empty());
    }

    #[test]
    fn triggers_within_min_interval_coalesce() {
        let refresher = Arc::new(
            MaterializedViewRefresher::new(warehouse()).with_min_interval(Duration::from_secs(60)),
        );
        assert!(matches!(
            refresher.trigger(AggregateScope::all()).unwrap(),
            RefreshTrigger::Started { .. }
        ));
        refresher.wait_idle();
        assert_eq!(
            refresher.trigger(AggregateScope::all()).unwrap(),
            RefreshTrigger::InProgress
        );
        // blocking refreshes still run
        refresher.refresh(AggregateScope::all()).unwrap();
        assert_eq!(refresher.refresh_count(), 2);
    }

    #[test]
    fn schedule_refreshes_until_stopped() {
        let refresher = Arc::new(MaterializedViewRefresher::new(warehouse()));
        let schedule = refresher.start_schedule(Duration::from_millis(10)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while refresher.refresh_count() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        schedule.stop();
        let count = refresher.refresh_count();
        assert!(count >= 1);
        thread::sleep(Duration::from_millis(40));
        assert_eq!(refresher.refresh_count(), count);
    }
}
