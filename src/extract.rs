use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{error, info, instrument};

use crate::client::{BlobStore, ClientError, RelationalExecutor};
use crate::codec;
use crate::pipeline::PipelineHandles;
use crate::rowset::RowSet;
use crate::sql::SqlCatalog;
use crate::tables::{TableSpec, staging_key};
use crate::{EtlError, PipelineConfig, Result, RetryPolicy, RunContext, Task, TaskResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractSummary {
    pub rows: usize,
    pub bytes: usize,
}

/// Runs `query` on `connection_id`, encodes the full result and stores it at
/// `bucket/key`, replacing whatever the previous run left there. Nothing is
/// written unless the whole result was fetched and encoded.
#[instrument(skip(source, query, blobs), fields(connection = connection_id))]
pub async fn extract_table(
    table: &str,
    source: &dyn RelationalExecutor,
    connection_id: &str,
    query: &str,
    blobs: &dyn BlobStore,
    bucket: &str,
    key: &str,
) -> Result<ExtractSummary> {
    let failed = |source: ClientError| EtlError::Extraction {
        table: table.to_string(),
        source,
    };

    let rows = fetch(source, connection_id, query).await.map_err(failed)?;
    let bytes = codec::encode(&rows)?;
    let summary = ExtractSummary {
        rows: rows.len(),
        bytes: bytes.len(),
    };

    blobs
        .put(bucket, key, bytes, codec::CONTENT_TYPE)
        .await
        .map_err(failed)?;

    info!(rows = summary.rows, bytes = summary.bytes, key, "table extracted");
    Ok(summary)
}

async fn fetch(
    source: &dyn RelationalExecutor,
    connection_id: &str,
    query: &str,
) -> std::result::Result<RowSet, ClientError> {
    let mut tx = source.begin(connection_id).await?;
    match tx.query(query).await {
        Ok(rows) => {
            tx.commit().await?;
            Ok(rows)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                error!(error = %rollback_err, "rollback failed");
            }
            Err(e)
        }
    }
}

pub struct ExtractTask {
    table: &'static TableSpec,
    connection_id: String,
    bucket: String,
    key: String,
    timeout: Duration,
    retry: RetryPolicy,
    source: Arc<dyn RelationalExecutor>,
    blobs: Arc<dyn BlobStore>,
    sql: Arc<SqlCatalog>,
}

impl ExtractTask {
    pub fn new(table: &'static TableSpec, config: &PipelineConfig, handles: &PipelineHandles) -> Self {
        Self {
            table,
            connection_id: config.source_connection.clone(),
            bucket: config.bucket.clone(),
            key: staging_key(&config.staging_prefix, table.name),
            timeout: config.extract_timeout(table.name),
            retry: config.retry_for(table.name),
            source: handles.source.clone(),
            blobs: handles.blobs.clone(),
            sql: handles.sql.clone(),
        }
    }
}

#[async_trait]
impl Task for ExtractTask {
    fn name(&self) -> &str {
        self.table.name
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(self.retry.clone())
    }

    async fn execute(&self, _ctx: &RunContext) -> Result<TaskResult> {
        let query = self.sql.get(&self.table.query_name())?;
        let summary = extract_table(
            self.table.name,
            self.source.as_ref(),
            &self.connection_id,
            query,
            self.blobs.as_ref(),
            &self.bucket,
            &self.key,
        )
        .await?;

        let mut output = TaskResult::new();
        output.insert("rows".into(), json!(summary.rows));
        output.insert("bytes".into(), json!(summary.bytes));
        output.insert("key".into(), json!(format!("{}/{}", self.bucket, self.key)));
        Ok(output)
    }
}
