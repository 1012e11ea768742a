use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{error, info, instrument};

use crate::client::{ClientError, RelationalExecutor};
use crate::pipeline::PipelineHandles;
use crate::sql::SqlCatalog;
use crate::tables::transform_query_name;
use crate::{EtlError, PipelineConfig, Result, RetryPolicy, RunContext, Task, TaskResult};

/// Runs one mart statement in its own transaction on `connection_id`.
#[instrument(skip(warehouse, sql), fields(connection = connection_id))]
pub async fn run_statement(
    step: &str,
    warehouse: &dyn RelationalExecutor,
    connection_id: &str,
    sql: &str,
) -> Result<u64> {
    let failed = |source: ClientError| EtlError::TransformStep {
        step: step.to_string(),
        source,
    };

    let mut tx = warehouse.begin(connection_id).await.map_err(failed)?;
    let affected = match tx.execute(sql, &[]).await {
        Ok(affected) => affected,
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                error!(step, error = %rollback_err, "rollback failed");
            }
            return Err(failed(e));
        }
    };
    tx.commit().await.map_err(failed)?;

    info!(affected, "transform step committed");
    Ok(affected)
}

pub struct TransformStep {
    step: &'static str,
    connection_id: String,
    retry: RetryPolicy,
    warehouse: Arc<dyn RelationalExecutor>,
    sql: Arc<SqlCatalog>,
}

impl TransformStep {
    pub fn new(step: &'static str, config: &PipelineConfig, handles: &PipelineHandles) -> Self {
        Self {
            step,
            connection_id: config.warehouse_connection.clone(),
            retry: config.retry_for(step),
            warehouse: handles.warehouse.clone(),
            sql: handles.sql.clone(),
        }
    }
}

#[async_trait]
impl Task for TransformStep {
    fn name(&self) -> &str {
        self.step
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(self.retry.clone())
    }

    async fn execute(&self, _ctx: &RunContext) -> Result<TaskResult> {
        let sql = self.sql.get(&transform_query_name(self.step))?;
        let affected = run_statement(self.step, self.warehouse.as_ref(), &self.connection_id, sql).await?;

        let mut output = TaskResult::new();
        output.insert("affected".into(), json!(affected));
        Ok(output)
    }
}
