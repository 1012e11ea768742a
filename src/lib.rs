pub mod task;
pub mod retry;
pub mod cycle_check;
pub mod state;
pub mod graph;
pub mod executor;
pub mod store;

pub mod rowset;
pub mod codec;
pub mod normalize;
pub mod upsert;

pub mod client;
pub mod memory;
pub mod fs_store;
#[cfg(feature = "postgres")]
pub mod pg;

pub mod tables;
pub mod sql;
pub mod extract;
pub mod load;
pub mod transform;
pub mod pipeline;
pub mod schedule;

pub mod config;
pub mod logging;

pub use task::{RunContext, Task};
pub use retry::{RetryExecutor, RetryPolicy};
pub use cycle_check::has_cycle;
pub use state::{RunRecord, RunReport, TaskOutcome, TaskState};
pub use graph::{EdgePolicy, PipelineGraph, TaskGroup};
pub use executor::Engine;
pub use store::{JsonlOutcomeStore, MemoryOutcomeStore, OutcomeStore};
pub use rowset::{RowSet, Value};
pub use client::{BlobStore, ClientError, RelationalExecutor, Transaction};
pub use pipeline::FlightsPipeline;
pub use config::PipelineConfig;
pub use schedule::ScheduleTrigger;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type TaskResult = serde_json::Map<String, serde_json::Value>;
pub type BoxTask = Arc<dyn Task>;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("extraction of {table} failed: {source}")]
    Extraction {
        table: String,
        #[source]
        source: ClientError,
    },
    #[error("staged artifact for {table} is malformed: {message}")]
    Deserialization { table: String, message: String },
    #[error("transform of {table}.{column} failed: {message}")]
    TransformField {
        table: String,
        column: String,
        message: String,
    },
    #[error("upsert into {target} failed: {message}")]
    Upsert { target: String, message: String },
    #[error("transform step {step} failed: {source}")]
    TransformStep {
        step: String,
        #[source]
        source: ClientError,
    },
    #[error("task {task} skipped, upstream task {upstream} did not succeed")]
    UpstreamFailure { task: String, upstream: String },
    #[error("task {task} panicked")]
    TaskPanicked { task: String },
    #[error("task {task} exceeded its execution budget of {budget:?}")]
    Timeout { task: String, budget: Duration },
    #[error("Circular dependency detected")]
    CircularDependency,
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),
    #[error("Context cancelled: {0}")]
    ContextCancelled(String),
    #[error("Retry failed: {0}")]
    RetryFailed(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Outcome store error: {0}")]
    Store(String),
}

impl EtlError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;
