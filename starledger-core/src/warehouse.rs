//! The star schema as one unit: three dimensions plus the price fact table.
//!
//! Layout under `{state_dir}/warehouse/`:
//! - `dim_entity.json`, `dim_category.json`, `dim_calendar.json`
//! - `fact_prices.parquet` (one `ma_{window}` column per moving-average window)
//! - `meta.json` sidecar, written last
//!
//! Opening checks the tables against the sidecar. Tables that disagree with
//! it are what a save interrupted before its sidecar leaves behind; they are
//! still loaded, since the watermark was never advanced past them and the
//! next run rewrites the same rows.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::dimension::{CalendarDimension, CategoryDimension, EntityDimension};
use crate::domain::{
    CalendarDay, CalendarKey, Category, EntityVersion, FactKey, FactRecord, Measures, SurrogateKey,
};
use crate::fact::FactStore;
use crate::persist::{self, PersistError};

const ENTITY_FILE: &str = "dim_entity.json";
const CATEGORY_FILE: &str = "dim_category.json";
const CALENDAR_FILE: &str = "dim_calendar.json";
const FACT_FILE: &str = "fact_prices.parquet";
const META_FILE: &str = "meta.json";

const MA_PREFIX: &str = "ma_";

/// Sidecar describing the last save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseMeta {
    pub saved_at: NaiveDateTime,
    pub entity_versions: usize,
    pub categories: usize,
    pub calendar_days: usize,
    pub fact_rows: usize,
    pub fact_hash: String,
}

/// How the loaded tables relate to the sidecar on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveState {
    /// Nothing has been saved or loaded yet.
    Unsaved,
    /// Tables match the sidecar.
    Complete,
    /// Tables on disk were written without their sidecar.
    Interrupted,
}

/// Sidecar last read or written by this instance, and what it said about the
/// tables.
#[derive(Debug)]
struct Generation {
    meta: Option<WarehouseMeta>,
    state: SaveState,
}

#[derive(Debug)]
pub struct Warehouse {
    pub entities: EntityDimension,
    pub calendar: CalendarDimension,
    pub categories: CategoryDimension,
    pub facts: FactStore,
    generation: Mutex<Generation>,
}

impl Warehouse {
    /// Empty, in-memory warehouse.
    pub fn new(holidays: Vec<NaiveDate>) -> Self {
        Self {
            entities: EntityDimension::new(),
            calendar: CalendarDimension::new(holidays),
            categories: CategoryDimension::new(),
            facts: FactStore::new(),
            generation: Mutex::new(Generation {
                meta: None,
                state: SaveState::Unsaved,
            }),
        }
    }

    pub fn dir(state_dir: &Path) -> PathBuf {
        state_dir.join("warehouse")
    }

    /// Load from `{state_dir}/warehouse/`. Missing files load as empty tables.
    ///
    /// The fact table is checked against the sidecar's row count and hash. A
    /// mismatch is logged and reported through [`Warehouse::save_state`].
    pub fn open(state_dir: &Path, holidays: Vec<NaiveDate>) -> Result<Self, PersistError> {
        let dir = Self::dir(state_dir);

        let meta: Option<WarehouseMeta> = persist::read_json(&dir.join(META_FILE))?;
        let entity_rows: Vec<EntityVersion> =
            persist::read_json(&dir.join(ENTITY_FILE))?.unwrap_or_default();
        let category_rows: Vec<Category> =
            persist::read_json(&dir.join(CATEGORY_FILE))?.unwrap_or_default();
        let calendar_rows: Vec<CalendarDay> =
            persist::read_json(&dir.join(CALENDAR_FILE))?.unwrap_or_default();
        let facts = match persist::read_parquet(&dir.join(FACT_FILE))? {
            Some(df) => dataframe_to_facts(&df)?,
            None => Vec::new(),
        };

        let state = match &meta {
            None if entity_rows.is_empty() && facts.is_empty() => SaveState::Unsaved,
            None => {
                warn!(dir = %dir.display(), "tables present without sidecar (interrupted save)");
                SaveState::Interrupted
            }
            Some(m) => {
                let found = (entity_rows.len(), category_rows.len(), facts.len());
                let expected = (m.entity_versions, m.categories, m.fact_rows);
                let hash_matches = fact_hash(&facts) == m.fact_hash;
                if found != expected || !hash_matches {
                    warn!(
                        dir = %dir.display(),
                        saved_at = %m.saved_at,
                        expected_facts = m.fact_rows,
                        found_facts = facts.len(),
                        hash_matches,
                        "tables disagree with sidecar (interrupted save)"
                    );
                    SaveState::Interrupted
                } else {
                    SaveState::Complete
                }
            }
        };

        info!(
            dir = %dir.display(),
            entity_versions = entity_rows.len(),
            facts = facts.len(),
            state = ?state,
            "opened warehouse"
        );

        Ok(Self {
            entities: EntityDimension::from_rows(entity_rows)?,
            calendar: CalendarDimension::from_rows(calendar_rows, holidays),
            categories: CategoryDimension::from_rows(category_rows)?,
            facts: FactStore::from_records(facts),
            generation: Mutex::new(Generation { meta, state }),
        })
    }

    /// Whether the tables loaded last matched their sidecar.
    pub fn save_state(&self) -> SaveState {
        self.generation.lock().unwrap().state
    }

    /// Persist every table. Each file is replaced atomically; the sidecar goes
    /// last so its presence marks a complete save.
    pub fn save(&self, state_dir: &Path, now: NaiveDateTime) -> Result<WarehouseMeta, PersistError> {
        let mut generation = self.generation.lock().unwrap();
        let dir = Self::dir(state_dir);

        let entities = self.entities.rows();
        let categories = self.categories.rows();
        let calendar = self.calendar.rows();
        let facts = self.facts.snapshot();

        persist::write_json_atomic(&dir.join(ENTITY_FILE), &entities)?;
        persist::write_json_atomic(&dir.join(CATEGORY_FILE), &categories)?;
        persist::write_json_atomic(&dir.join(CALENDAR_FILE), &calendar)?;
        persist::write_parquet_atomic(&facts_to_dataframe(&facts)?, &dir.join(FACT_FILE))?;

        let meta = WarehouseMeta {
            saved_at: now,
            entity_versions: entities.len(),
            categories: categories.len(),
            calendar_days: calendar.len(),
            fact_rows: facts.len(),
            fact_hash: fact_hash(&facts),
        };
        persist::write_json_atomic(&dir.join(META_FILE), &meta)?;
        debug!(fact_rows = meta.fact_rows, "saved warehouse");
        *generation = Generation {
            meta: Some(meta.clone()),
            state: SaveState::Complete,
        };
        Ok(meta)
    }

    /// Reload every table from disk if the sidecar there differs from the one
    /// this instance last read or wrote, i.e. another process saved since.
    ///
    /// Returns whether anything was reloaded. Callers must hold the pipeline's
    /// run lock so no load is in flight.
    pub fn reload_if_changed(&self, state_dir: &Path) -> Result<bool, PersistError> {
        let mut generation = self.generation.lock().unwrap();
        let on_disk = Self::meta(state_dir)?;
        if on_disk == generation.meta {
            return Ok(false);
        }

        let fresh = Self::open(state_dir, self.calendar.holidays())?;
        self.categories.replace_with(fresh.categories);
        self.calendar.replace_with(fresh.calendar);
        self.entities.replace_with(fresh.entities);
        self.facts.replace_with(fresh.facts);
        *generation = fresh
            .generation
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        info!(
            dir = %Self::dir(state_dir).display(),
            saved_at = ?generation.meta.as_ref().map(|m| m.saved_at),
            "reloaded warehouse saved by another process"
        );
        Ok(true)
    }

    pub fn meta(state_dir: &Path) -> Result<Option<WarehouseMeta>, PersistError> {
        persist::read_json(&Self::dir(state_dir).join(META_FILE))
    }
}

/// Content hash of the fact table as it survives a Parquet roundtrip:
/// timestamps at microsecond precision, moving averages over the union of
/// windows with absent entries hashed as null.
fn fact_hash(facts: &[FactRecord]) -> String {
    let mut windows: Vec<u32> = facts
        .iter()
        .flat_map(|f| f.measures.moving_averages.keys().copied())
        .collect();
    windows.sort_unstable();
    windows.dedup();

    let opt = |v: Option<f64>| v.map_or(u64::MAX, f64::to_bits);
    let mut hasher = blake3::Hasher::new();
    for f in facts {
        let m = &f.measures;
        hasher.update(&f.key.entity_key.0.to_le_bytes());
        hasher.update(&f.key.calendar_key.0.to_le_bytes());
        hasher.update(&f.category_key.0.to_le_bytes());
        for price in [m.open, m.high, m.low, m.close] {
            hasher.update(&price.to_bits().to_le_bytes());
        }
        hasher.update(&m.volume.to_le_bytes());
        hasher.update(&opt(m.pct_change).to_le_bytes());
        for &w in &windows {
            hasher.update(&opt(m.moving_average(w)).to_le_bytes());
        }
        hasher.update(&[u8::from(f.deleted)]);
        hasher.update(&micros(f.created_at).to_le_bytes());
        hasher.update(&micros(f.updated_at).to_le_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

// ── Parquet conversion ──────────────────────────────────────────────

fn micros(t: NaiveDateTime) -> i64 {
    t.and_utc().timestamp_micros()
}

fn from_micros(v: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_micros(v).map(|d| d.naive_utc())
}

fn facts_to_dataframe(facts: &[FactRecord]) -> Result<DataFrame, PersistError> {
    let windows: Vec<u32> = {
        let mut w: Vec<u32> = facts
            .iter()
            .flat_map(|f| f.measures.moving_averages.keys().copied())
            .collect();
        w.sort_unstable();
        w.dedup();
        w
    };

    let mut columns = vec![
        Column::new(
            "entity_key".into(),
            facts.iter().map(|f| f.key.entity_key.0).collect::<Vec<u64>>(),
        ),
        Column::new(
            "calendar_key".into(),
            facts.iter().map(|f| f.key.calendar_key.0).collect::<Vec<i32>>(),
        ),
        Column::new(
            "category_key".into(),
            facts.iter().map(|f| f.category_key.0).collect::<Vec<u64>>(),
        ),
        Column::new("open".into(), facts.iter().map(|f| f.measures.open).collect::<Vec<f64>>()),
        Column::new("high".into(), facts.iter().map(|f| f.measures.high).collect::<Vec<f64>>()),
        Column::new("low".into(), facts.iter().map(|f| f.measures.low).collect::<Vec<f64>>()),
        Column::new("close".into(), facts.iter().map(|f| f.measures.close).collect::<Vec<f64>>()),
        Column::new(
            "volume".into(),
            facts.iter().map(|f| f.measures.volume).collect::<Vec<u64>>(),
        ),
        Column::new(
            "pct_change".into(),
            facts.iter().map(|f| f.measures.pct_change).collect::<Vec<Option<f64>>>(),
        ),
        Column::new("deleted".into(), facts.iter().map(|f| f.deleted).collect::<Vec<bool>>()),
        Column::new(
            "created_at".into(),
            facts.iter().map(|f| micros(f.created_at)).collect::<Vec<i64>>(),
        ),
        Column::new(
            "updated_at".into(),
            facts.iter().map(|f| micros(f.updated_at)).collect::<Vec<i64>>(),
        ),
    ];
    for w in windows {
        columns.push(Column::new(
            format!("{MA_PREFIX}{w}").into(),
            facts
                .iter()
                .map(|f| f.measures.moving_average(w))
                .collect::<Vec<Option<f64>>>(),
        ));
    }

    DataFrame::new(columns).map_err(|e| PersistError::Parquet(format!("dataframe creation: {e}")))
}

fn dataframe_to_facts(df: &DataFrame) -> Result<Vec<FactRecord>, PersistError> {
    let corrupt = |reason: String| PersistError::Corrupt {
        table: FACT_FILE.into(),
        reason,
    };
    let col = |name: &str| df.column(name).map_err(|e| corrupt(format!("{name}: {e}")));

    let entity = col("entity_key")?.u64().map_err(|e| corrupt(e.to_string()))?.clone();
    let calendar = col("calendar_key")?.i32().map_err(|e| corrupt(e.to_string()))?.clone();
    let category = col("category_key")?.u64().map_err(|e| corrupt(e.to_string()))?.clone();
    let open = col("open")?.f64().map_err(|e| corrupt(e.to_string()))?.clone();
    let high = col("high")?.f64().map_err(|e| corrupt(e.to_string()))?.clone();
    let low = col("low")?.f64().map_err(|e| corrupt(e.to_string()))?.clone();
    let close = col("close")?.f64().map_err(|e| corrupt(e.to_string()))?.clone();
    let volume = col("volume")?.u64().map_err(|e| corrupt(e.to_string()))?.clone();
    let pct = col("pct_change")?.f64().map_err(|e| corrupt(e.to_string()))?.clone();
    let deleted = col("deleted")?.bool().map_err(|e| corrupt(e.to_string()))?.clone();
    let created = col("created_at")?.i64().map_err(|e| corrupt(e.to_string()))?.clone();
    let updated = col("updated_at")?.i64().map_err(|e| corrupt(e.to_string()))?.clone();

    let mut ma_columns = Vec::new();
    for c in df.get_columns() {
        if let Some(w) = c.name().as_str().strip_prefix(MA_PREFIX) {
            let window: u32 = w
                .parse()
                .map_err(|_| corrupt(format!("bad moving-average column '{}'", c.name())))?;
            ma_columns.push((window, c.f64().map_err(|e| corrupt(e.to_string()))?.clone()));
        }
    }

    let mut facts = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let missing = |name: &str| corrupt(format!("null {name} at row {i}"));
        let ts = |ca: &Int64Chunked, name: &str| {
            ca.get(i)
                .and_then(from_micros)
                .ok_or_else(|| missing(name))
        };

        let moving_averages: BTreeMap<u32, Option<f64>> =
            ma_columns.iter().map(|(w, ca)| (*w, ca.get(i))).collect();

        facts.push(FactRecord {
            key: FactKey {
                entity_key: SurrogateKey(entity.get(i).ok_or_else(|| missing("entity_key"))?),
                calendar_key: CalendarKey(calendar.get(i).ok_or_else(|| missing("calendar_key"))?),
            },
            category_key: SurrogateKey(category.get(i).ok_or_else(|| missing("category_key"))?),
            measures: Measures {
                open: open.get(i).ok_or_else(|| missing("open"))?,
                high: high.get(i).ok_or_else(|| missing("high"))?,
                low: low.get(i).ok_or_else(|| missing("low"))?,
                close: close.get(i).ok_or_else(|| missing("close"))?,
                volume: volume.get(i).ok_or_else(|| missing("volume"))?,
                pct_change: pct.get(i),
                moving_averages,
            },
            deleted: deleted.get(i).unwrap_or(false),
            created_at: ts(&created, "created_at")?,
            updated_at: ts(&updated, "updated_at")?,
        });
    }
    Ok(facts)
}
