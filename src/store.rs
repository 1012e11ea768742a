//! Per-run task outcome log.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::{EtlError, Result, TaskOutcome, TaskState};

#[async_trait]
pub trait OutcomeStore: Send + Sync {
    /// Records the latest known outcome of one task. Later records for the
    /// same `(run_id, task_id)` supersede earlier ones.
    async fn record_task(
        &self,
        run_id: Uuid,
        logical_date: NaiveDate,
        outcome: &TaskOutcome,
    ) -> Result<()>;

    async fn task_outcome(&self, run_id: Uuid, task_id: &str) -> Result<Option<TaskOutcome>>;

    async fn run_outcomes(&self, run_id: Uuid) -> Result<Vec<TaskOutcome>>;

    async fn task_succeeded(&self, run_id: Uuid, task_id: &str) -> Result<bool> {
        Ok(self
            .task_outcome(run_id, task_id)
            .await?
            .is_some_and(|o| o.state == TaskState::Success))
    }
}

#[derive(Default)]
pub struct MemoryOutcomeStore {
    runs: RwLock<HashMap<Uuid, IndexMap<String, TaskOutcome>>>,
}

impl MemoryOutcomeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutcomeStore for MemoryOutcomeStore {
    async fn record_task(
        &self,
        run_id: Uuid,
        _logical_date: NaiveDate,
        outcome: &TaskOutcome,
    ) -> Result<()> {
        self.runs
            .write()
            .await
            .entry(run_id)
            .or_default()
            .insert(outcome.task_id.clone(), outcome.clone());
        Ok(())
    }

    async fn task_outcome(&self, run_id: Uuid, task_id: &str) -> Result<Option<TaskOutcome>> {
        Ok(self
            .runs
            .read()
            .await
            .get(&run_id)
            .and_then(|tasks| tasks.get(task_id))
            .cloned())
    }

    async fn run_outcomes(&self, run_id: Uuid) -> Result<Vec<TaskOutcome>> {
        Ok(self
            .runs
            .read()
            .await
            .get(&run_id)
            .map(|tasks| tasks.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LogLine {
    run_id: Uuid,
    logical_date: NaiveDate,
    outcome: TaskOutcome,
}

/// Append-only JSON-lines log, one line per task transition.
pub struct JsonlOutcomeStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlOutcomeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_run(&self, run_id: Uuid) -> Result<IndexMap<String, TaskOutcome>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(IndexMap::new()),
            Err(e) => return Err(store_error(&self.path, e)),
        };

        let mut outcomes = IndexMap::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: LogLine = serde_json::from_str(line).map_err(|e| {
                EtlError::Store(format!(
                    "{}:{}: malformed outcome line: {e}",
                    self.path.display(),
                    number + 1
                ))
            })?;
            if entry.run_id == run_id {
                outcomes.insert(entry.outcome.task_id.clone(), entry.outcome);
            }
        }
        Ok(outcomes)
    }
}

fn store_error(path: &Path, e: std::io::Error) -> EtlError {
    EtlError::Store(format!("{}: {e}", path.display()))
}

#[async_trait]
impl OutcomeStore for JsonlOutcomeStore {
    async fn record_task(
        &self,
        run_id: Uuid,
        logical_date: NaiveDate,
        outcome: &TaskOutcome,
    ) -> Result<()> {
        let mut line = serde_json::to_string(&LogLine {
            run_id,
            logical_date,
            outcome: outcome.clone(),
        })
        .map_err(|e| EtlError::Store(e.to_string()))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| store_error(parent, e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| store_error(&self.path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| store_error(&self.path, e))?;
        file.flush().await.map_err(|e| store_error(&self.path, e))
    }

    async fn task_outcome(&self, run_id: Uuid, task_id: &str) -> Result<Option<TaskOutcome>> {
        Ok(self.read_run(run_id).await?.shift_remove(task_id))
    }

    async fn run_outcomes(&self, run_id: Uuid) -> Result<Vec<TaskOutcome>> {
        Ok(self.read_run(run_id).await?.into_values().collect())
    }
}
