//! Property tests for watermark safety.
//!
//! 1. `advance_watermark` never moves backwards and never reaches a failed
//!    change timestamp
//! 2. Across real runs with randomly malformed entities, the stored watermark
//!    stays below every failed entity's earliest change, and a retry after
//!    fixing the rows loads everything

use chrono::{Duration, NaiveDate, NaiveDateTime};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

use starledger_core::domain::SourceRecord;
use starledger_core::source::MemorySource;
use starledger_core::Warehouse;
use starledger_runner::{
    advance_watermark, EtlOrchestrator, MemoryWatermarkStore, RunOptions, RunState,
    WatermarkStore,
};

// ── Strategies ──────────────────────────────────────────────────────

fn base() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

fn arb_instant() -> impl Strategy<Value = NaiveDateTime> {
    (0i64..10_000).prop_map(|m| base() + Duration::minutes(m))
}

/// Per entity: day → hour of the change timestamp, and whether one row is bad.
fn arb_entities() -> impl Strategy<Value = Vec<(BTreeMap<u32, u32>, bool)>> {
    prop::collection::vec(
        (
            prop::collection::btree_map(1u32..=10, 0u32..24, 1..4),
            any::<bool>(),
        ),
        1..5,
    )
}

fn row(key: &str, day: u32, hour: u32, bad: bool) -> SourceRecord {
    let date = NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
    SourceRecord {
        natural_key: key.into(),
        date,
        open: 10.0,
        high: if bad { 0.5 } else { 11.0 },
        low: 9.0,
        close: 10.0,
        volume: 1,
        category: None,
        deleted: false,
        created_at: date.and_hms_opt(hour, 0, 0).unwrap(),
    }
}

// ── 1. Pure advance rule ────────────────────────────────────────────

proptest! {
    #[test]
    fn advance_never_regresses_or_passes_failure(
        previous in prop::option::of(arb_instant()),
        processed in prop::option::of(arb_instant()),
        failed in prop::option::of(arb_instant()),
    ) {
        let next = advance_watermark(previous, processed, failed);
        prop_assert!(next >= previous);
        if let (Some(next), Some(failed)) = (next, failed) {
            if Some(next) != previous {
                prop_assert!(next < failed);
            }
        }
        if let (Some(next), Some(processed)) = (next, processed) {
            if Some(next) != previous {
                prop_assert!(next <= processed);
            }
        }
    }
}

// ── 2. Runs with failing entities ───────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn watermark_stays_below_failed_entities(entities in arb_entities()) {
        let source = Arc::new(MemorySource::new());
        let orchestrator = EtlOrchestrator::new(
            "prices",
            Arc::new(Warehouse::new(vec![])),
            source.clone(),
        )
        .unwrap()
        .with_worker_threads(2)
        .unwrap();
        let watermarks = MemoryWatermarkStore::new();

        let mut expected_facts = 0;
        let mut failed_first_change = Vec::new();
        for (i, (days, bad)) in entities.iter().enumerate() {
            let key = format!("E{i}");
            let first_day = *days.keys().next().unwrap();
            expected_facts += days.len();
            source.push_records(
                days.iter()
                    .map(|(&d, &h)| row(&key, d, h, *bad && d == first_day)),
            );
            if *bad {
                let first_change = days
                    .iter()
                    .map(|(&d, &h)| row(&key, d, h, false).created_at)
                    .min()
                    .unwrap();
                failed_first_change.push(first_change);
            }
        }

        // first run: bad entities fail, watermark stays below them
        let first = orchestrator.run(&watermarks, RunOptions::default()).unwrap();
        let wm1 = watermarks.load("prices").unwrap().high_water;
        prop_assert_eq!(first.record.errors.len(), failed_first_change.len());
        if let Some(wm) = wm1 {
            for &change in &failed_first_change {
                prop_assert!(wm < change);
            }
        }

        // fix every bad row with a later correction and retry
        for (i, (days, bad)) in entities.iter().enumerate() {
            if *bad {
                let key = format!("E{i}");
                let first_day = *days.keys().next().unwrap();
                let mut fix = row(&key, first_day, 0, false);
                fix.created_at = base() + Duration::days(40) + Duration::minutes(i as i64);
                source.push_records([fix]);
            }
        }
        let retry = orchestrator.run(&watermarks, RunOptions::default()).unwrap();
        let wm2 = watermarks.load("prices").unwrap().high_water;

        prop_assert_eq!(retry.state(), RunState::Succeeded);
        prop_assert!(wm2 >= wm1);
        prop_assert_eq!(orchestrator.warehouse().facts.len(), expected_facts);
    }
}
