//! The flights pipeline: `extract >> load >> transform`.

use std::sync::Arc;

use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::{BlobStore, RelationalExecutor};
use crate::extract::ExtractTask;
use crate::load::LoadTask;
use crate::schedule::ScheduleTrigger;
use crate::sql::SqlCatalog;
use crate::tables::{LOAD_ORDER, TABLES, TRANSFORM_STEPS, table};
use crate::transform::TransformStep;
use crate::{
    EdgePolicy, Engine, EtlError, JsonlOutcomeStore, MemoryOutcomeStore, OutcomeStore,
    PipelineConfig, PipelineGraph, Result, RunRecord, TaskGroup,
};

pub const EXTRACT_GROUP: &str = "extract";
pub const LOAD_GROUP: &str = "load";
pub const TRANSFORM_GROUP: &str = "transform";

/// Collaborators injected into every task.
#[derive(Clone)]
pub struct PipelineHandles {
    pub source: Arc<dyn RelationalExecutor>,
    pub warehouse: Arc<dyn RelationalExecutor>,
    pub blobs: Arc<dyn BlobStore>,
    pub sql: Arc<SqlCatalog>,
}

/// Builds the three-group graph. Extracts are independent, loads follow
/// `config.load_ordering`, transform steps are always chained.
pub fn build_graph(config: &PipelineConfig, handles: &PipelineHandles) -> Result<PipelineGraph> {
    let mut extract = TaskGroup::independent(EXTRACT_GROUP);
    for spec in &TABLES {
        extract.push(Arc::new(ExtractTask::new(spec, config, handles)));
    }

    let mut load = TaskGroup::new(LOAD_GROUP, config.load_ordering);
    for name in LOAD_ORDER {
        let spec = table(name)
            .ok_or_else(|| EtlError::InvalidGraph(format!("no descriptor for table {name}")))?;
        load.push(Arc::new(LoadTask::new(spec, config, handles)));
    }

    let mut transform = TaskGroup::new(TRANSFORM_GROUP, EdgePolicy::Chained);
    for step in TRANSFORM_STEPS {
        transform.push(Arc::new(TransformStep::new(step, config, handles)));
    }

    let mut graph = PipelineGraph::new();
    graph.add_group(extract)?;
    graph.add_group(load)?;
    graph.add_group(transform)?;
    graph.chain(&[EXTRACT_GROUP, LOAD_GROUP, TRANSFORM_GROUP])?;
    Ok(graph)
}

pub struct FlightsPipeline {
    config: PipelineConfig,
    graph: PipelineGraph,
    engine: Engine,
    store: Arc<dyn OutcomeStore>,
}

impl FlightsPipeline {
    /// Validates `config`, checks every SQL text is present and wires the
    /// graph. Outcomes go to `config.outcome_log` when set.
    pub fn new(config: PipelineConfig, handles: PipelineHandles) -> Result<Self> {
        config.validate()?;
        let missing = handles.sql.missing();
        if !missing.is_empty() {
            return Err(EtlError::Config(format!("missing sql: {}", missing.join(", "))));
        }

        let store: Arc<dyn OutcomeStore> = match &config.outcome_log {
            Some(path) => Arc::new(JsonlOutcomeStore::new(path)),
            None => Arc::new(MemoryOutcomeStore::new()),
        };

        let graph = build_graph(&config, &handles)?;
        let engine = Engine::new(&graph)?
            .with_worker_pool_size(config.worker_pool_size)
            .with_store(store.clone());

        Ok(Self {
            config,
            graph,
            engine,
            store,
        })
    }

    pub fn with_store(mut self, store: Arc<dyn OutcomeStore>) -> Self {
        self.engine = self.engine.with_store(store.clone());
        self.store = store;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn OutcomeStore> {
        &self.store
    }

    pub fn describe(&self) -> String {
        self.graph.describe()
    }

    /// Runs the pipeline for `logical_date`.
    pub async fn run(&self, logical_date: NaiveDate) -> Result<RunRecord> {
        self.run_with(logical_date, CancellationToken::new()).await
    }

    pub async fn run_with(&self, logical_date: NaiveDate, cancel: CancellationToken) -> Result<RunRecord> {
        info!(
            logical_date = %logical_date,
            load_ordering = %self.config.load_ordering,
            "running flights pipeline"
        );
        self.engine.run(logical_date, cancel).await
    }

    /// Runs the pipeline on every tick of the configured schedule until
    /// `cancel` fires. Cancelling also aborts a run in progress.
    pub async fn run_scheduled(&self, cancel: CancellationToken) -> Result<()> {
        let trigger = ScheduleTrigger::new(&self.config.schedule)?;
        self.run_on(&trigger, cancel).await
    }

    pub async fn run_on(&self, trigger: &ScheduleTrigger, cancel: CancellationToken) -> Result<()> {
        trigger
            .run(cancel.clone(), |date| self.run_with(date, cancel.child_token()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBlobStore, MemoryWarehouse};

    fn handles() -> PipelineHandles {
        let sql = SqlCatalog::required_names().fold(SqlCatalog::new(), |c, name| {
            let text = format!("SELECT '{name}'");
            c.with(name, text)
        });
        PipelineHandles {
            source: Arc::new(MemoryWarehouse::new()),
            warehouse: Arc::new(MemoryWarehouse::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
            sql: Arc::new(sql),
        }
    }

    #[test]
    fn describes_three_stages() {
        let pipeline = FlightsPipeline::new(PipelineConfig::default(), handles()).unwrap();
        let text = pipeline.describe();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("extract [independent]: tickets, aircrafts_data"));
        assert!(lines[1].starts_with("  └─> load [chained]: aircrafts_data >> airports_data >> bookings"));
        assert!(lines[2].ends_with("fct_flight_activity >> fct_seat_occupied_daily"));
    }

    #[test]
    fn load_ordering_is_configurable() {
        let config = PipelineConfig {
            load_ordering: EdgePolicy::Independent,
            ..Default::default()
        };
        let graph = build_graph(&config, &handles()).unwrap();
        let nodes = graph.expand();

        let seats = nodes.iter().find(|n| n.id == "load.seats").unwrap();
        assert_eq!(seats.dependencies.len(), 8);
        assert!(seats.dependencies.iter().all(|d| d.starts_with("extract.")));

        let dim_seat = nodes.iter().find(|n| n.id == "transform.dim_seat").unwrap();
        assert!(dim_seat.dependencies.contains(&"transform.dim_passenger".to_string()));
    }

    #[test]
    fn missing_sql_is_rejected() {
        let mut handles = handles();
        handles.sql = Arc::new(SqlCatalog::new());
        let err = FlightsPipeline::new(PipelineConfig::default(), handles).err().unwrap();
        assert!(matches!(err, EtlError::Config(ref m) if m.starts_with("missing sql: query/tickets")));
    }
}
