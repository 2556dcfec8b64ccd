//! Pipeline configuration loaded from TOML.
//!
//! ```toml
//! pipeline = "prices"
//! state_dir = "state"
//! moving_average_windows = [7, 30]
//! worker_threads = 4
//!
//! [source]
//! kind = "csv"
//! dir = "operational"
//!
//! [calendar]
//! start = "2024-01-01"
//! end = "2024-12-31"
//! holidays = ["2024-07-04"]
//!
//! [categories]
//! Tech = "Technology companies"
//! ```
//!
//! Relative paths are resolved against the directory of the config file.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use starledger_core::dimension::DEFAULT_MAX_RETRIES;
use starledger_core::metrics::{MetricTransformer, DEFAULT_WINDOWS};
use starledger_core::source::{CsvSource, MemorySource, OperationalSource};
use starledger_core::Warehouse;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("parse config TOML: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Where operational rows come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// `prices.csv` and `entities.csv` in a directory.
    Csv { dir: PathBuf },
    /// Empty in-memory source, filled by the embedding program.
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalendarConfig {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name; keys the watermark, run history and run lock.
    pub pipeline: String,
    pub state_dir: PathBuf,
    pub source: SourceConfig,
    #[serde(default = "default_windows")]
    pub moving_average_windows: Vec<u32>,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub calendar: CalendarConfig,
    /// Category name → description.
    #[serde(default)]
    pub categories: BTreeMap<String, String>,
    /// Seconds between scheduled view refreshes; `None` disables the schedule.
    #[serde(default)]
    pub refresh_interval_secs: Option<u64>,
    /// Refresh triggers arriving within this many milliseconds of the last
    /// refresh start are coalesced into it.
    #[serde(default = "default_refresh_min_interval_ms")]
    pub refresh_min_interval_ms: u64,
}

fn default_windows() -> Vec<u32> {
    DEFAULT_WINDOWS.to_vec()
}

fn default_worker_threads() -> usize {
    4
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_refresh_min_interval_ms() -> u64 {
    1_000
}

impl PipelineConfig {
    /// Minimal config for embedding and tests: in-memory source, defaults
    /// everywhere else.
    pub fn new(pipeline: impl Into<String>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            pipeline: pipeline.into(),
            state_dir: state_dir.into(),
            source: SourceConfig::Memory,
            moving_average_windows: default_windows(),
            worker_threads: default_worker_threads(),
            max_retries: default_max_retries(),
            calendar: CalendarConfig::default(),
            categories: BTreeMap::new(),
            refresh_interval_secs: None,
            refresh_min_interval_ms: default_refresh_min_interval_ms(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut config = Self::from_toml(&content)?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        if self.state_dir.is_relative() {
            self.state_dir = base.join(&self.state_dir);
        }
        if let SourceConfig::Csv { dir } = &mut self.source {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_name = !self.pipeline.is_empty()
            && self
                .pipeline
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid_name {
            return Err(ConfigError::Invalid(format!(
                "pipeline name '{}' must be non-empty ASCII letters, digits, '-' or '_'",
                self.pipeline
            )));
        }
        if self.moving_average_windows.contains(&0) {
            return Err(ConfigError::Invalid(
                "moving-average windows must be at least 1".into(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be at least 1".into()));
        }
        if let (Some(start), Some(end)) = (self.calendar.start, self.calendar.end) {
            if start > end {
                return Err(ConfigError::Invalid(format!(
                    "calendar start {start} is after end {end}"
                )));
            }
        }
        if self.refresh_interval_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "refresh_interval_secs must be positive when set".into(),
            ));
        }
        Ok(())
    }

    pub fn transformer(&self) -> Result<MetricTransformer, ConfigError> {
        MetricTransformer::new(&self.moving_average_windows)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn layout(&self) -> StateLayout {
        StateLayout::new(&self.state_dir)
    }

    /// Build the configured operational source.
    pub fn open_source(&self) -> Arc<dyn OperationalSource> {
        match &self.source {
            SourceConfig::Csv { dir } => Arc::new(CsvSource::new(dir.clone())),
            SourceConfig::Memory => Arc::new(MemorySource::new()),
        }
    }

    /// Pre-populate the calendar range and apply category descriptions.
    pub fn seed_dimensions(&self, warehouse: &Warehouse) -> usize {
        let added = match (self.calendar.start, self.calendar.end) {
            (Some(start), Some(end)) => warehouse.calendar.populate(start, end),
            _ => 0,
        };
        for (name, description) in &self.categories {
            warehouse.categories.set_description(name, description);
        }
        added
    }
}

/// File layout under the state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn watermarks_dir(&self) -> PathBuf {
        self.root.join("watermarks")
    }

    pub fn runs_file(&self, pipeline: &str) -> PathBuf {
        self.root.join("runs").join(format!("{pipeline}.jsonl"))
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn aggregates_dir(&self) -> PathBuf {
        self.root.join("aggregates")
    }
}
