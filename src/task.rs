use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{EtlError, RetryPolicy, TaskResult};

/// Per-attempt view of the run a task executes in.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub logical_date: NaiveDate,
    /// Qualified id, `group.task`.
    pub task_id: String,
    /// 1-based.
    pub attempt: u32,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    /// Execution budget per attempt. `None` runs unbounded.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    async fn pre_execution(&self, _ctx: &RunContext) -> Result<(), EtlError> {
        Ok(())
    }

    async fn execute(&self, ctx: &RunContext) -> Result<TaskResult, EtlError>;

    async fn post_execution(&self, _ctx: &RunContext, _output: &TaskResult) -> Result<(), EtlError> {
        Ok(())
    }
}
