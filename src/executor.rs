use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use futures::FutureExt;
use futures::future::join_all;
use indexmap::IndexMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::graph::TaskNode;
use crate::{
    BoxTask, EtlError, OutcomeStore, PipelineGraph, Result, RetryExecutor, RunContext, RunRecord,
    TaskOutcome, TaskResult, TaskState, has_cycle,
};

const DEFAULT_WORKER_POOL_SIZE: usize = 8;

enum TaskEvent {
    Started {
        task_id: String,
        at: DateTime<Utc>,
    },
    Finished {
        task_id: String,
        state: TaskState,
        attempts: u32,
        error: Option<String>,
        output: TaskResult,
        at: DateTime<Utc>,
    },
}

/// Executes one run of a [`PipelineGraph`].
///
/// A task is dispatched once all of its dependencies reached `success`.
/// When a task ends `failed` or `timed_out`, every pending task reachable
/// from it is marked `upstream_failed` and never started. Dispatched tasks
/// share a worker pool bounded by `worker_pool_size`.
pub struct Engine {
    nodes: IndexMap<String, TaskNode>,
    in_degrees: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
    worker_pool_size: usize,
    store: Option<Arc<dyn OutcomeStore>>,
}

impl Engine {
    pub fn new(graph: &PipelineGraph) -> Result<Self> {
        let nodes: IndexMap<String, TaskNode> = graph
            .expand()
            .into_iter()
            .map(|node| (node.id.clone(), node))
            .collect();

        let mut in_degrees = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut dependencies = HashMap::new();

        for (id, node) in &nodes {
            in_degrees.insert(id.clone(), node.dependencies.len());
            dependencies.insert(id.clone(), node.dependencies.clone());

            for dep in &node.dependencies {
                if !nodes.contains_key(dep) {
                    return Err(EtlError::InvalidGraph(format!(
                        "task {id} depends on unknown task {dep}"
                    )));
                }
                dependents.entry(dep.clone()).or_default().push(id.clone());
            }
        }

        if has_cycle(&dependencies) {
            return Err(EtlError::CircularDependency);
        }

        Ok(Self {
            nodes,
            in_degrees,
            dependents,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            store: None,
        })
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size.max(1);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn OutcomeStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub async fn run(&self, logical_date: NaiveDate, ctx: CancellationToken) -> Result<RunRecord> {
        let mut record = RunRecord::new(logical_date);
        for node in self.nodes.values() {
            record.outcomes.insert(
                node.id.clone(),
                TaskOutcome::pending(node.id.clone(), node.group.clone()),
            );
        }

        info!(
            run_id = %record.run_id,
            logical_date = %logical_date,
            tasks = self.nodes.len(),
            workers = self.worker_pool_size,
            "starting run"
        );

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<TaskEvent>();
        let semaphore = Arc::new(Semaphore::new(self.worker_pool_size));
        let run_token = ctx.child_token();
        let mut in_degrees = self.in_degrees.clone();
        let mut remaining = self.nodes.len();
        let mut handles = Vec::new();

        for (id, degree) in self.nodes.keys().map(|id| (id, in_degrees[id])) {
            if degree == 0 {
                handles.push(self.spawn_task(
                    id,
                    &record,
                    run_token.clone(),
                    semaphore.clone(),
                    event_tx.clone(),
                ));
            }
        }

        while remaining > 0 {
            tokio::select! {
                Some(event) = event_rx.recv() => match event {
                    TaskEvent::Started { task_id, at } => {
                        if let Some(outcome) = record.outcomes.get_mut(&task_id) {
                            outcome.state = TaskState::Running;
                            outcome.started_at = Some(at);
                        }
                        record.execution_order.push(task_id.clone());
                        self.persist(&record, &task_id).await;
                    }
                    TaskEvent::Finished { task_id, state, attempts, error, output, at } => {
                        remaining -= 1;
                        if let Some(outcome) = record.outcomes.get_mut(&task_id) {
                            outcome.state = state;
                            outcome.attempts = attempts;
                            outcome.error = error;
                            outcome.output = output;
                            outcome.finished_at = Some(at);
                        }
                        self.persist(&record, &task_id).await;

                        if state == TaskState::Success {
                            for child in self.dependents.get(&task_id).into_iter().flatten() {
                                if record.state_of(child) != Some(TaskState::Pending) {
                                    continue;
                                }
                                let Some(degree) = in_degrees.get_mut(child) else {
                                    continue;
                                };
                                *degree -= 1;
                                if *degree == 0 {
                                    handles.push(self.spawn_task(
                                        child,
                                        &record,
                                        run_token.clone(),
                                        semaphore.clone(),
                                        event_tx.clone(),
                                    ));
                                }
                            }
                        } else {
                            let skipped = self.block_downstream(&task_id, &mut record);
                            remaining -= skipped.len();
                            for id in &skipped {
                                self.persist(&record, id).await;
                            }
                            if !skipped.is_empty() {
                                warn!(
                                    run_id = %record.run_id,
                                    task = %task_id,
                                    state = %state,
                                    skipped = skipped.len(),
                                    "downstream tasks marked upstream_failed"
                                );
                            }
                        }
                    }
                },

                _ = ctx.cancelled() => {
                    run_token.cancel();
                    for handle in &handles {
                        handle.abort();
                    }
                    record.finished_at = Some(Utc::now());
                    warn!(run_id = %record.run_id, remaining, "run cancelled");
                    return Err(EtlError::ContextCancelled(format!(
                        "run {} cancelled with {remaining} tasks unfinished",
                        record.run_id
                    )));
                }
            }
        }

        for joined in join_all(handles).await {
            if let Err(e) = joined {
                error!(run_id = %record.run_id, error = %e, "task handle failed to join");
            }
        }

        record.finished_at = Some(Utc::now());
        let report = record.report();
        if report.is_success() {
            info!(run_id = %record.run_id, tasks = report.succeeded.len(), "run succeeded");
        } else {
            error!(
                run_id = %record.run_id,
                failed = report.failures.len(),
                skipped = report.skipped.len(),
                "run failed"
            );
        }

        Ok(record)
    }

    /// Marks every pending task reachable from `root` as upstream-failed and
    /// returns their ids.
    fn block_downstream(&self, root: &str, record: &mut RunRecord) -> Vec<String> {
        let mut skipped = Vec::new();
        let mut queue: VecDeque<&str> = VecDeque::from([root]);
        let now = Utc::now();

        while let Some(current) = queue.pop_front() {
            for child in self.dependents.get(current).into_iter().flatten() {
                let Some(outcome) = record.outcomes.get_mut(child) else {
                    continue;
                };
                if !outcome.state.can_transition_to(TaskState::UpstreamFailed) {
                    continue;
                }
                outcome.state = TaskState::UpstreamFailed;
                outcome.finished_at = Some(now);
                outcome.error = Some(
                    EtlError::UpstreamFailure {
                        task: child.clone(),
                        upstream: root.to_string(),
                    }
                    .to_string(),
                );
                skipped.push(child.clone());
                queue.push_back(child);
            }
        }

        skipped
    }

    async fn persist(&self, record: &RunRecord, task_id: &str) {
        let (Some(store), Some(outcome)) = (&self.store, record.outcomes.get(task_id)) else {
            return;
        };
        if let Err(e) = store
            .record_task(record.run_id, record.logical_date, outcome)
            .await
        {
            error!(run_id = %record.run_id, task = task_id, error = %e, "failed to persist task outcome");
        }
    }

    fn spawn_task(
        &self,
        task_id: &str,
        record: &RunRecord,
        ctx: CancellationToken,
        semaphore: Arc<Semaphore>,
        event_tx: mpsc::UnboundedSender<TaskEvent>,
    ) -> JoinHandle<()> {
        let task_id = task_id.to_string();
        let task = self.nodes[task_id.as_str()].task.clone();
        let run_id = record.run_id;
        let logical_date = record.logical_date;

        tokio::spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    let _ = event_tx.send(TaskEvent::Finished {
                        task_id,
                        state: TaskState::Failed,
                        attempts: 0,
                        error: Some(format!("worker pool closed: {e}")),
                        output: TaskResult::new(),
                        at: Utc::now(),
                    });
                    return;
                }
            };

            let _ = event_tx.send(TaskEvent::Started {
                task_id: task_id.clone(),
                at: Utc::now(),
            });
            debug!(run_id = %run_id, task = %task_id, "task running");

            let event = Self::execute_task(ctx, run_id, logical_date, task_id, task, permit).await;
            let _ = event_tx.send(event);
        })
    }

    async fn execute_task(
        ctx: CancellationToken,
        run_id: Uuid,
        logical_date: NaiveDate,
        task_id: String,
        task: BoxTask,
        _permit: OwnedSemaphorePermit,
    ) -> TaskEvent {
        let retry_executor = RetryExecutor::new(task.retry_policy());

        let attempted = retry_executor
            .execute_with_retry(ctx.clone(), &task_id, |attempt| {
                let run_ctx = RunContext {
                    run_id,
                    logical_date,
                    task_id: task_id.clone(),
                    attempt,
                    cancel: ctx.clone(),
                };
                let task = task.clone();
                let id = task_id.clone();

                async move {
                    AssertUnwindSafe(Self::run_attempt(task, run_ctx))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| Err(EtlError::TaskPanicked { task: id }))
                }
            })
            .await;

        let (state, error, output) = match attempted.result {
            Ok(output) => (TaskState::Success, None, output),
            Err(e) if e.is_timeout() => (TaskState::TimedOut, Some(e.to_string()), TaskResult::new()),
            Err(e) => (TaskState::Failed, Some(e.to_string()), TaskResult::new()),
        };

        match &error {
            None => info!(run_id = %run_id, task = %task_id, attempts = attempted.attempts, "task succeeded"),
            Some(message) => error!(
                run_id = %run_id,
                task = %task_id,
                state = %state,
                attempts = attempted.attempts,
                error = %message,
                "task did not succeed"
            ),
        }

        TaskEvent::Finished {
            task_id,
            state,
            attempts: attempted.attempts,
            error,
            output,
            at: Utc::now(),
        }
    }

    async fn run_attempt(task: BoxTask, ctx: RunContext) -> Result<TaskResult> {
        let body = async {
            task.pre_execution(&ctx).await?;
            let output = task.execute(&ctx).await?;
            task.post_execution(&ctx, &output).await?;
            Ok::<TaskResult, EtlError>(output)
        };

        match task.timeout() {
            Some(budget) => tokio::time::timeout(budget, body)
                .await
                .unwrap_or_else(|_| {
                    Err(EtlError::Timeout {
                        task: ctx.task_id.clone(),
                        budget,
                    })
                }),
            None => body.await,
        }
    }
}
