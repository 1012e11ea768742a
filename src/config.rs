//! Pipeline configuration.
//!
//! Loaded from YAML, every field defaulted to the production values, then
//! overridden from `FLIGHTS_ETL_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::logging::LoggingConfig;
use crate::schedule::{DEFAULT_SCHEDULE, parse_schedule};
use crate::tables::{TRANSFORM_STEPS, table};
use crate::{EdgePolicy, EtlError, Result, RetryPolicy};

pub const ENV_PREFIX: &str = "FLIGHTS_ETL_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub source_connection: String,
    pub warehouse_connection: String,
    pub bucket: String,
    pub staging_prefix: String,
    pub worker_pool_size: usize,
    pub extract_timeout_secs: u64,
    /// Per-table extract budgets, by table name.
    pub extract_timeout_overrides: IndexMap<String, u64>,
    pub retry: RetryPolicy,
    /// Per-task retry policies, by table or transform step name.
    pub retry_overrides: IndexMap<String, RetryPolicy>,
    pub load_ordering: EdgePolicy,
    /// Append-only JSON-lines outcome log. `None` keeps outcomes in memory.
    pub outcome_log: Option<PathBuf>,
    pub sql_dir: PathBuf,
    /// Cron expression for scheduled runs.
    pub schedule: String,
    pub logging: LoggingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_connection: "flight_src_db".to_string(),
            warehouse_connection: "flight_wrh_db".to_string(),
            bucket: crate::tables::STAGING_BUCKET.to_string(),
            staging_prefix: crate::tables::STAGING_PREFIX.to_string(),
            worker_pool_size: 8,
            extract_timeout_secs: 300,
            extract_timeout_overrides: IndexMap::from([("ticket_flights".to_string(), 600)]),
            retry: RetryPolicy::none(),
            retry_overrides: IndexMap::new(),
            load_ordering: EdgePolicy::Chained,
            outcome_log: None,
            sql_dir: PathBuf::from("sql"),
            schedule: DEFAULT_SCHEDULE.to_string(),
            logging: LoggingConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| EtlError::Config(format!("invalid yaml: {e}")))
    }

    /// Reads `path`, applies the process environment and validates.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| EtlError::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config = Self::from_yaml_str(&text)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Applies `FLIGHTS_ETL_*` overrides looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));

        if let Some(size) = var("WORKER_POOL_SIZE") {
            self.worker_pool_size = size
                .trim()
                .parse()
                .map_err(|e| EtlError::Config(format!("{ENV_PREFIX}WORKER_POOL_SIZE: {e}")))?;
        }
        if let Some(dir) = var("SQL_DIR") {
            self.sql_dir = PathBuf::from(dir);
        }
        if let Some(path) = var("OUTCOME_LOG") {
            self.outcome_log = (!path.is_empty()).then(|| PathBuf::from(path));
        }
        if let Some(schedule) = var("SCHEDULE") {
            self.schedule = schedule;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(ordering) = var("LOAD_ORDERING") {
            self.load_ordering = ordering
                .trim()
                .parse()
                .map_err(|e| EtlError::Config(format!("{ENV_PREFIX}LOAD_ORDERING: {e}")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            return Err(EtlError::Config("worker_pool_size must be at least 1".into()));
        }
        if self.extract_timeout_secs == 0 {
            return Err(EtlError::Config("extract_timeout_secs must be positive".into()));
        }
        for (name, secs) in &self.extract_timeout_overrides {
            if table(name).is_none() {
                return Err(EtlError::Config(format!("timeout override for unknown table {name}")));
            }
            if *secs == 0 {
                return Err(EtlError::Config(format!("extract timeout for {name} must be positive")));
            }
        }

        parse_schedule(&self.schedule)?;

        check_retry("retry", &self.retry)?;
        for (name, policy) in &self.retry_overrides {
            if table(name).is_none() && !TRANSFORM_STEPS.contains(&name.as_str()) {
                return Err(EtlError::Config(format!("retry override for unknown task {name}")));
            }
            check_retry(name, policy)?;
        }
        Ok(())
    }

    pub fn extract_timeout(&self, table: &str) -> Duration {
        let secs = self
            .extract_timeout_overrides
            .get(table)
            .copied()
            .unwrap_or(self.extract_timeout_secs);
        Duration::from_secs(secs)
    }

    pub fn retry_for(&self, task: &str) -> RetryPolicy {
        self.retry_overrides
            .get(task)
            .cloned()
            .unwrap_or_else(|| self.retry.clone())
    }
}

fn check_retry(name: &str, policy: &RetryPolicy) -> Result<()> {
    if policy.multiplier.is_nan() || policy.multiplier <= 0.0 {
        return Err(EtlError::Config(format!("{name}: retry multiplier must be positive")));
    }
    Ok(())
}
