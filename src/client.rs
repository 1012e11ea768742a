//! Handles to the systems the pipeline reads from and writes to. Both are
//! injected into tasks; nothing here is process-global.

use async_trait::async_trait;
use thiserror::Error;

use crate::rowset::{RowSet, Value};

/// Opaque failure from a blob store or database.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ClientError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        Self::with_source(e.to_string(), e)
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ClientError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ClientError>;
}

/// Hands out one transaction per task. Connections are pooled by the
/// implementation; a transaction is never shared across tasks.
#[async_trait]
pub trait RelationalExecutor: Send + Sync {
    async fn begin(&self, connection_id: &str) -> Result<Box<dyn Transaction>, ClientError>;
}

#[async_trait]
pub trait Transaction: Send {
    async fn query(&mut self, sql: &str) -> Result<RowSet, ClientError>;

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, ClientError>;

    /// Replays one prepared statement for every parameter row.
    async fn execute_batch(&mut self, sql: &str, rows: &[Vec<Value>]) -> Result<u64, ClientError>;

    async fn commit(self: Box<Self>) -> Result<(), ClientError>;

    async fn rollback(self: Box<Self>) -> Result<(), ClientError>;
}
