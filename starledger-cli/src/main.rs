//! StarLedger CLI: pipeline runs, status, view refresh and dataset seeding.
//!
//! Commands:
//! - `run`: run the ETL pipeline once and print the run record
//! - `status`: last run state, watermark and entity errors
//! - `refresh`: recompute the `category_daily` aggregate
//! - `aggregate`: read aggregate rows, optionally to CSV
//! - `recompute`: rebuild derived measures from stored prices
//! - `serve`: trigger runs on an interval with the refresh schedule active
//! - `unlock`: remove a lock file left by a crashed process
//! - `seed`: write a synthetic operational CSV dataset

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use starledger_core::domain::{AggregateRow, AggregateScope, EntityReference, SourceRecord};
use starledger_core::source::CsvSource;
use starledger_runner::{
    PipelineConfig, PipelineService, RefreshTrigger, RunLock, RunOptions, RunState, RunTrigger,
};

#[derive(Parser)]
#[command(
    name = "starledger",
    about = "StarLedger: incremental star-schema ETL for daily prices"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ETL pipeline once.
    Run {
        /// Pipeline TOML config.
        #[arg(long)]
        config: PathBuf,

        /// Ignore the watermark and replay the whole source.
        #[arg(long, default_value_t = false)]
        replay: bool,
    },
    /// Show the last run state and entity errors.
    Status {
        #[arg(long)]
        config: PathBuf,
    },
    /// Refresh the category_daily aggregate.
    Refresh {
        #[arg(long)]
        config: PathBuf,

        /// Limit to these categories (repeatable).
        #[arg(long = "category")]
        categories: Vec<String>,

        /// First date (YYYY-MM-DD), inclusive.
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Last date (YYYY-MM-DD), inclusive.
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Read aggregate rows.
    Aggregate {
        #[arg(long)]
        config: PathBuf,

        #[arg(long = "category")]
        categories: Vec<String>,

        #[arg(long)]
        from: Option<NaiveDate>,

        #[arg(long)]
        to: Option<NaiveDate>,

        /// Write rows to this CSV file instead of printing them.
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Rebuild derived measures from stored prices.
    Recompute {
        #[arg(long)]
        config: PathBuf,

        /// Only this natural key; all entities when omitted.
        #[arg(long)]
        entity: Option<String>,
    },
    /// Trigger a run every interval, with the configured refresh schedule.
    Serve {
        #[arg(long)]
        config: PathBuf,

        /// Seconds between run triggers.
        #[arg(long, default_value_t = 60)]
        run_every: u64,

        /// Stop after this many triggers; runs forever when omitted.
        #[arg(long)]
        cycles: Option<u64>,
    },
    /// Remove a stale run lock file.
    Unlock {
        #[arg(long)]
        config: PathBuf,
    },
    /// Write a synthetic operational dataset as CSV.
    Seed {
        /// Output directory (prices.csv, entities.csv).
        #[arg(long)]
        dir: PathBuf,

        #[arg(long, default_value_t = 10)]
        entities: usize,

        #[arg(long)]
        start: NaiveDate,

        #[arg(long)]
        end: NaiveDate,

        /// Seed string for the deterministic generator.
        #[arg(long, default_value = "starledger")]
        seed: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, replay } => run_pipeline(&config, replay),
        Commands::Status { config } => run_status(&config),
        Commands::Refresh {
            config,
            categories,
            from,
            to,
        } => run_refresh(&config, scope(categories, from, to)),
        Commands::Aggregate {
            config,
            categories,
            from,
            to,
            csv,
        } => run_aggregate(&config, &scope(categories, from, to), csv.as_deref()),
        Commands::Recompute { config, entity } => run_recompute(&config, entity.as_deref()),
        Commands::Serve {
            config,
            run_every,
            cycles,
        } => run_serve(&config, run_every, cycles),
        Commands::Unlock { config } => run_unlock(&config),
        Commands::Seed {
            dir,
            entities,
            start,
            end,
            seed,
        } => run_seed(&dir, entities, start, end, &seed),
    }
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    PipelineConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn open_service(path: &Path) -> Result<PipelineService> {
    let config = load_config(path)?;
    Ok(PipelineService::open(&config)?)
}

fn scope(categories: Vec<String>, from: Option<NaiveDate>, to: Option<NaiveDate>) -> AggregateScope {
    AggregateScope {
        categories: (!categories.is_empty()).then_some(categories),
        from,
        to,
    }
}

fn run_pipeline(config: &Path, replay: bool) -> Result<()> {
    let service = open_service(config)?;
    let report = service.run_blocking(RunOptions {
        replay,
        ..RunOptions::default()
    })?;
    println!("{}", serde_json::to_string_pretty(&report.record)?);

    match report.state() {
        RunState::Failed => std::process::exit(1),
        RunState::PartiallyFailed => std::process::exit(2),
        _ => Ok(()),
    }
}

fn run_status(config: &Path) -> Result<()> {
    let service = open_service(config)?;
    let status = service.run_status()?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn run_refresh(config: &Path, scope: AggregateScope) -> Result<()> {
    let service = open_service(config)?;
    let outcome = service.refresh(scope)?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn run_aggregate(config: &Path, scope: &AggregateScope, csv_path: Option<&Path>) -> Result<()> {
    let service = open_service(config)?;
    let read = service.read_aggregate(scope);

    if let Some(path) = csv_path {
        write_aggregate_csv(path, &read.rows)?;
        println!("{} rows written to {}", read.rows.len(), path.display());
        return Ok(());
    }

    match read.last_refreshed {
        Some(at) => println!("Last refreshed: {at}"),
        None => println!("Aggregate has never been refreshed"),
    }
    println!(
        "{:<12} {:<10} {:>6} {:>12} {:>12} {:>12} {:>14} {:>10}",
        "Category", "Date", "Facts", "Avg close", "Min close", "Max close", "Volume", "Avg pct"
    );
    println!("{}", "-".repeat(96));
    for row in &read.rows {
        let pct = row
            .avg_pct_change
            .map(|p| format!("{p:.2}%"))
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<12} {:<10} {:>6} {:>12.4} {:>12.4} {:>12.4} {:>14} {:>10}",
            row.category,
            row.date,
            row.fact_count,
            row.avg_close,
            row.min_close,
            row.max_close,
            row.total_volume,
            pct
        );
    }
    Ok(())
}

fn write_aggregate_csv(path: &Path, rows: &[AggregateRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn run_recompute(config: &Path, entity: Option<&str>) -> Result<()> {
    let service = open_service(config)?;
    let report = service.recompute(entity)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.errors.is_empty() {
        std::process::exit(2);
    }
    Ok(())
}

fn run_serve(config: &Path, run_every: u64, cycles: Option<u64>) -> Result<()> {
    if run_every == 0 {
        bail!("--run-every must be positive");
    }
    let service = open_service(config)?;
    let _schedule = service.start_refresh_schedule()?;

    let mut cycle = 0;
    loop {
        match service.trigger_run(RunOptions::default())? {
            RunTrigger::Started { run_id } => {
                tracing::info!(run_id = %run_id, "run triggered");
                service.wait_for_run();
            }
            RunTrigger::AlreadyRunning => tracing::info!("run already in progress, skipping"),
        }
        let status = service.run_status()?;
        println!("{}", serde_json::to_string(&status)?);

        if status.state == RunState::Succeeded || status.state == RunState::PartiallyFailed {
            if let RefreshTrigger::InProgress = service.trigger_refresh(AggregateScope::all())? {
                tracing::debug!("refresh already in progress");
            }
        }

        cycle += 1;
        if cycles.is_some_and(|n| cycle >= n) {
            service.refresher().wait_idle();
            return Ok(());
        }
        std::thread::sleep(std::time::Duration::from_secs(run_every));
    }
}

fn run_unlock(config: &Path) -> Result<()> {
    let config = load_config(config)?;
    let lock = RunLock::with_dir(config.layout().locks_dir());
    if lock.clear_stale(&config.pipeline)? {
        println!("Removed stale lock for '{}'", config.pipeline);
    } else {
        println!("No lock file for '{}'", config.pipeline);
    }
    Ok(())
}

const CATEGORIES: [&str; 5] = ["Tech", "Energy", "Retail", "Finance", "Health"];
const EXCHANGES: [&str; 2] = ["NYSE", "NASDAQ"];

fn run_seed(dir: &Path, entities: usize, start: NaiveDate, end: NaiveDate, seed: &str) -> Result<()> {
    if start > end {
        bail!("--start {start} is after --end {end}");
    }
    if entities == 0 {
        bail!("--entities must be at least 1");
    }

    let key = format!("{seed}|{entities}|{start}|{end}");
    let mut rng = StdRng::from_seed(*blake3::hash(key.as_bytes()).as_bytes());

    let (records, references) = synthesize(&mut rng, entities, start, end);
    CsvSource::write(dir, &records, &references)?;
    println!(
        "Wrote {} price rows for {} entities to {}",
        records.len(),
        references.len(),
        dir.display()
    );
    Ok(())
}

/// Random-walk daily prices on weekdays. Roughly one entity in five changes
/// category partway through the range.
fn synthesize(
    rng: &mut StdRng,
    entities: usize,
    start: NaiveDate,
    end: NaiveDate,
) -> (Vec<SourceRecord>, Vec<EntityReference>) {
    let days: Vec<NaiveDate> = start
        .iter_days()
        .take_while(|d| *d <= end)
        .filter(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
        .collect();

    let mut records = Vec::with_capacity(days.len() * entities);
    let mut references = Vec::with_capacity(entities);
    for i in 0..entities {
        let natural_key = format!("TKR{:03}", i + 1);
        let mut category = CATEGORIES[rng.gen_range(0..CATEGORIES.len())];
        let switch_at = (rng.gen_bool(0.2) && days.len() > 1).then(|| rng.gen_range(1..days.len()));

        let mut close: f64 = rng.gen_range(20.0..400.0);
        for (n, date) in days.iter().enumerate() {
            if switch_at == Some(n) {
                category = CATEGORIES[(CATEGORIES.iter().position(|c| *c == category).unwrap_or(0)
                    + 1)
                    % CATEGORIES.len()];
            }
            let open = close;
            close = (close * (1.0 + rng.gen_range(-0.03..0.03))).max(1.0);
            let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.01));
            let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.01));
            let created_at = date.and_hms_opt(18, 0, 0).unwrap_or_default()
                + Duration::minutes(rng.gen_range(0..240));
            records.push(SourceRecord {
                natural_key: natural_key.clone(),
                date: *date,
                open: round_cents(open),
                high: round_cents(high),
                low: round_cents(low),
                close: round_cents(close),
                volume: rng.gen_range(10_000..5_000_000),
                category: Some(category.to_string()),
                deleted: false,
                created_at,
            });
        }

        references.push(EntityReference {
            natural_key: natural_key.clone(),
            name: format!("{natural_key} Holdings"),
            category: category.to_string(),
            exchange: Some(EXCHANGES[i % EXCHANGES.len()].to_string()),
        });
    }
    (records, references)
}

fn round_cents(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
