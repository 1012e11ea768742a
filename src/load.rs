use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, instrument};

use crate::client::{BlobStore, RelationalExecutor};
use crate::codec;
use crate::normalize::apply_transforms;
use crate::pipeline::PipelineHandles;
use crate::tables::{TableSpec, staging_key};
use crate::upsert::upsert;
use crate::{EtlError, PipelineConfig, Result, RetryPolicy, RunContext, Task, TaskResult};

/// Reads the staged artifact for `table`, normalises its columns and upserts
/// it into the table's target. Returns the number of rows sent.
#[instrument(skip_all, fields(table = table.name, key = %key))]
pub async fn load_table(
    table: &TableSpec,
    blobs: &dyn BlobStore,
    bucket: &str,
    key: &str,
    warehouse: &dyn RelationalExecutor,
    connection_id: &str,
) -> Result<u64> {
    let bytes = blobs
        .get(bucket, key)
        .await
        .map_err(|source| EtlError::Extraction {
            table: table.name.to_string(),
            source,
        })?;

    let mut rows = codec::decode(table.name, &bytes)?;
    apply_transforms(table.name, &mut rows, table.transforms)?;

    let sent = upsert(warehouse, connection_id, &rows, &table.upsert_spec()).await?;
    info!(rows = sent, target = table.target, "table loaded");
    Ok(sent)
}

pub struct LoadTask {
    table: &'static TableSpec,
    connection_id: String,
    bucket: String,
    key: String,
    retry: RetryPolicy,
    blobs: Arc<dyn BlobStore>,
    warehouse: Arc<dyn RelationalExecutor>,
}

impl LoadTask {
    pub fn new(table: &'static TableSpec, config: &PipelineConfig, handles: &PipelineHandles) -> Self {
        Self {
            table,
            connection_id: config.warehouse_connection.clone(),
            bucket: config.bucket.clone(),
            key: staging_key(&config.staging_prefix, table.name),
            retry: config.retry_for(table.name),
            blobs: handles.blobs.clone(),
            warehouse: handles.warehouse.clone(),
        }
    }
}

#[async_trait]
impl Task for LoadTask {
    fn name(&self) -> &str {
        self.table.name
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(self.retry.clone())
    }

    async fn execute(&self, _ctx: &RunContext) -> Result<TaskResult> {
        let sent = load_table(
            self.table,
            self.blobs.as_ref(),
            &self.bucket,
            &self.key,
            self.warehouse.as_ref(),
            &self.connection_id,
        )
        .await?;

        let mut output = TaskResult::new();
        output.insert("rows".into(), json!(sent));
        output.insert("target".into(), json!(self.table.target));
        Ok(output)
    }
}
