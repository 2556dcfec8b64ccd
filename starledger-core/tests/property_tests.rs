//! Property tests for dimensional-model invariants.
//!
//! Uses proptest to verify:
//! 1. SCD history: at most one current version, contiguous intervals, and
//!    every resolved key covers the observation that resolved to it
//! 2. Transformer determinism: splitting a series into committed history and
//!    new points does not change any measure
//! 3. Undefined-before-lookback: an N-point average exists iff N points do
//! 4. Loader idempotence: replaying a batch changes nothing

use chrono::{NaiveDate, NaiveDateTime};
use proptest::prelude::*;

use starledger_core::dimension::{
    CalendarDimension, CategoryDimension, DimensionResolver, EntityDimension,
};
use starledger_core::domain::{CalendarKey, EntityAttributes, FactKey, FactRow, SurrogateKey};
use starledger_core::fact::{FactLoader, FactStore};
use starledger_core::metrics::{MetricTransformer, PricePoint};

// ── Strategies (proptest) ────────────────────────────────────────────

const CATEGORIES: [&str; 3] = ["Tech", "Energy", "Retail"];

fn arb_observations() -> impl Strategy<Value = Vec<(u32, usize)>> {
    prop::collection::vec((1u32..=60, 0usize..CATEGORIES.len()), 1..40)
}

fn arb_closes() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec((10.0..500.0_f64).prop_map(|p| (p * 100.0).round() / 100.0), 1..80)
}

fn effective(day: u32) -> NaiveDateTime {
    let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(day as i64);
    DimensionResolver::effective_time(date)
}

fn points(closes: &[f64]) -> Vec<PricePoint> {
    let base = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| PricePoint {
            date: base + chrono::Duration::days(i as i64),
            open: c,
            high: c + 1.0,
            low: c - 1.0,
            close: c,
            volume: 1_000 + i as u64,
        })
        .collect()
}

// ── 1. SCD history ───────────────────────────────────────────────────

proptest! {
    #[test]
    fn scd_lineage_stays_contiguous(observations in arb_observations()) {
        let entities = EntityDimension::new();
        let calendar = CalendarDimension::new(vec![]);
        let categories = CategoryDimension::new();
        let resolver = DimensionResolver::new(&entities, &calendar, &categories);

        for (day, cat) in observations {
            let attrs = EntityAttributes {
                name: "E1 Corp".into(),
                category: CATEGORIES[cat].into(),
                exchange: None,
            };
            let at = effective(day);
            let resolved = resolver.resolve_entity("E1", &attrs, at).unwrap();

            let version = entities.get(resolved.key).unwrap();
            prop_assert!(version.valid_from <= at);
            prop_assert!(version.covers(at));
            prop_assert!(entities.check_lineage("E1").is_ok());
        }

        let current = entities.lineage("E1").iter().filter(|v| v.is_current).count();
        prop_assert_eq!(current, 1);
    }
}

// ── 2/3. Transformer ─────────────────────────────────────────────────

proptest! {
    #[test]
    fn split_history_matches_single_pass(closes in arb_closes(), split in 0usize..80) {
        let t = MetricTransformer::default();
        let pts = points(&closes);
        let k = split.min(pts.len());

        let whole = t.transform_series(&[], &pts).unwrap();
        let tail = t.transform_series(&pts[..k], &pts[k..]).unwrap();
        prop_assert_eq!(&whole[k..], &tail[..]);
    }

    #[test]
    fn moving_average_defined_iff_window_full(closes in arb_closes()) {
        let t = MetricTransformer::new(&[3, 7, 30]).unwrap();
        let series = t.transform_series(&[], &points(&closes)).unwrap();
        for (i, m) in series.iter().enumerate() {
            for &w in t.windows() {
                prop_assert_eq!(m.moving_average(w).is_some(), i + 1 >= w as usize);
            }
            prop_assert_eq!(m.pct_change.is_some(), i > 0);
        }
    }
}

// ── 4. Loader idempotence ────────────────────────────────────────────

proptest! {
    #[test]
    fn replayed_batch_changes_nothing(closes in arb_closes()) {
        let pts = points(&closes);
        let measures = MetricTransformer::default().transform_series(&[], &pts).unwrap();
        let rows: Vec<FactRow> = pts
            .iter()
            .zip(measures)
            .map(|(p, m)| FactRow {
                key: FactKey {
                    entity_key: SurrogateKey(1),
                    calendar_key: CalendarKey::from_date(p.date),
                },
                category_key: SurrogateKey(1),
                measures: m,
                deleted: false,
            })
            .collect();

        let store = FactStore::new();
        let loader = FactLoader::new(&store);
        let first = loader.load(&rows, effective(0)).unwrap();
        prop_assert_eq!(first.inserted, rows.len());

        let before = store.snapshot();
        let replay = loader.load(&rows, effective(1)).unwrap();
        prop_assert_eq!(replay.changed(), 0);
        prop_assert_eq!(replay.unchanged, rows.len());
        prop_assert_eq!(store.snapshot(), before);
    }
}
