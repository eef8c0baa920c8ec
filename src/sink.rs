//! Result sinks.
//!
//! The orchestrator hands every finished [`RunResult`] to a [`ResultSink`].
//! Recording is fire-and-forget from the run's point of view: a failing sink
//! is reported as a status line and the run carries on.

use crate::error::SinkError;
use crate::measurement::RunResult;
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Consumer of finished run records.
#[async_trait]
pub trait ResultSink: Send {
    /// Stores one result.
    async fn record(&mut self, result: &RunResult) -> Result<(), SinkError>;
}

/// Keeps results in memory. Clones share the same list.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    results: Arc<Mutex<Vec<RunResult>>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn results(&self) -> Vec<RunResult> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn record(&mut self, result: &RunResult) -> Result<(), SinkError> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result.clone());
        Ok(())
    }
}

/// Appends one JSON document per result to a daily log file.
///
/// Files are named `runs_YYYYMMDD.jsonl` after the local date of recording.
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    dir: PathBuf,
}

impl JsonLinesSink {
    /// Creates a sink writing into `dir` (created on first write).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        info!("Run log directory: '{}'", dir.display());
        Self { dir }
    }

    /// Log directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Log file for `date`.
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("runs_{}.jsonl", date.format("%Y%m%d")))
    }
}

#[async_trait]
impl ResultSink for JsonLinesSink {
    async fn record(&mut self, result: &RunResult) -> Result<(), SinkError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(Local::now().date_naive());

        let mut line = serde_json::to_string(result)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(path = %path.display(), run_id = %result.run_id, "run recorded");
        Ok(())
    }
}
