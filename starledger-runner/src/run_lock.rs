//! Mutual exclusion of runs of the same pipeline.
//!
//! Two layers: an in-process registry of held pipeline names, and (when a
//! lock directory is configured) a `{pipeline}.lock` file created with
//! `create_new` so a second process sees the pipeline as busy too. Different
//! pipelines never block each other. The guard releases both on drop.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("pipeline '{0}' is already running")]
    Held(String),

    #[error("lock file {path}: {reason}")]
    Io { path: String, reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct RunLock {
    held: Arc<Mutex<HashSet<String>>>,
    lock_dir: Option<PathBuf>,
}

impl RunLock {
    /// Registry without a lock file; exclusion within this process only.
    pub fn in_process() -> Self {
        Self::default()
    }

    /// Registry plus lock files under `lock_dir`.
    pub fn with_dir(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            held: Arc::default(),
            lock_dir: Some(lock_dir.into()),
        }
    }

    fn lock_file(&self, pipeline: &str) -> Option<PathBuf> {
        self.lock_dir
            .as_ref()
            .map(|dir| dir.join(format!("{pipeline}.lock")))
    }

    pub fn try_acquire(&self, pipeline: &str) -> Result<RunGuard, LockError> {
        let mut held = self.held.lock().unwrap();
        if held.contains(pipeline) {
            return Err(LockError::Held(pipeline.to_string()));
        }

        let file = match self.lock_file(pipeline) {
            Some(path) => {
                create_lock_file(&path).map_err(|e| match e.kind() {
                    io::ErrorKind::AlreadyExists => LockError::Held(pipeline.to_string()),
                    _ => LockError::Io {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    },
                })?;
                Some(path)
            }
            None => None,
        };

        held.insert(pipeline.to_string());
        tracing::debug!(pipeline, "run lock acquired");
        Ok(RunGuard {
            pipeline: pipeline.to_string(),
            held: Arc::clone(&self.held),
            file,
        })
    }

    pub fn is_held(&self, pipeline: &str) -> bool {
        self.held.lock().unwrap().contains(pipeline)
            || self.lock_file(pipeline).is_some_and(|p| p.exists())
    }

    /// Remove a lock file left behind by a process that died mid-run.
    /// Returns whether a file was removed. Does not touch in-process holds.
    pub fn clear_stale(&self, pipeline: &str) -> Result<bool, LockError> {
        if self.held.lock().unwrap().contains(pipeline) {
            return Err(LockError::Held(pipeline.to_string()));
        }
        let Some(path) = self.lock_file(pipeline) else {
            return Ok(false);
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(LockError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

fn create_lock_file(path: &std::path::Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    writeln!(
        file,
        "pid={} acquired={}",
        std::process::id(),
        chrono::Utc::now().to_rfc3339()
    )?;
    Ok(())
}

/// Held run lock; released on drop.
#[derive(Debug)]
pub struct RunGuard {
    pipeline: String,
    held: Arc<Mutex<HashSet<String>>>,
    file: Option<PathBuf>,
}

impl RunGuard {
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(path) = &self.file {
            let _ = fs::remove_file(path);
        }
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.pipeline);
        }
        tracing::debug!(pipeline = %self.pipeline, "run lock released");
    }
}
