//! Task and run state for one execution of a pipeline graph.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::TaskResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    TimedOut,
    /// Never ran because a direct or transitive dependency did not succeed.
    UpstreamFailed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::TimedOut | Self::UpstreamFailed
        )
    }

    /// Terminal states that block everything downstream.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut | Self::UpstreamFailed)
    }

    pub fn can_transition_to(&self, target: TaskState) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running | Self::UpstreamFailed),
            Self::Running => matches!(target, Self::Success | Self::Failed | Self::TimedOut),
            Self::Success | Self::Failed | Self::TimedOut | Self::UpstreamFailed => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::UpstreamFailed => write!(f, "upstream_failed"),
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "upstream_failed" => Ok(Self::UpstreamFailed),
            _ => Err(format!("Invalid task state: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub group: String,
    pub state: TaskState,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub output: TaskResult,
}

impl TaskOutcome {
    pub fn pending(task_id: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            group: group.into(),
            state: TaskState::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            error: None,
            output: TaskResult::new(),
        }
    }
}

/// The per-run task-state table. Owned and mutated by the engine only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub logical_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Keyed by qualified task id, in graph order.
    pub outcomes: IndexMap<String, TaskOutcome>,
    /// Task ids in the order they entered `running`.
    pub execution_order: Vec<String>,
}

impl RunRecord {
    pub fn new(logical_date: NaiveDate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            logical_date,
            started_at: Utc::now(),
            finished_at: None,
            outcomes: IndexMap::new(),
            execution_order: Vec::new(),
        }
    }

    pub fn state_of(&self, task_id: &str) -> Option<TaskState> {
        self.outcomes.get(task_id).map(|o| o.state)
    }

    pub fn outcome(&self, task_id: &str) -> Option<&TaskOutcome> {
        self.outcomes.get(task_id)
    }

    pub fn is_complete(&self) -> bool {
        self.outcomes.values().all(|o| o.state.is_terminal())
    }

    pub fn group_succeeded(&self, group: &str) -> bool {
        let mut members = self.outcomes.values().filter(|o| o.group == group).peekable();
        members.peek().is_some() && members.all(|o| o.state == TaskState::Success)
    }

    pub fn group_failed(&self, group: &str) -> bool {
        self.outcomes
            .values()
            .any(|o| o.group == group && o.state.is_failure())
    }

    pub fn report(&self) -> RunReport {
        let mut report = RunReport {
            run_id: self.run_id,
            logical_date: self.logical_date,
            succeeded: Vec::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
        };

        for outcome in self.outcomes.values() {
            match outcome.state {
                TaskState::Success => report.succeeded.push(outcome.task_id.clone()),
                TaskState::Failed | TaskState::TimedOut => report.failures.push(FailedTask {
                    task_id: outcome.task_id.clone(),
                    state: outcome.state,
                    error: outcome.error.clone().unwrap_or_default(),
                }),
                TaskState::UpstreamFailed => report.skipped.push(outcome.task_id.clone()),
                TaskState::Pending | TaskState::Running => {}
            }
        }

        report
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
    pub task_id: String,
    pub state: TaskState,
    pub error: String,
}

/// What a finished run tells its caller: the tasks that failed on their own
/// (the first failure on each branch, since everything below a failure is
/// skipped), and the tasks skipped as upstream-failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub logical_date: NaiveDate,
    pub succeeded: Vec<String>,
    pub failures: Vec<FailedTask>,
    pub skipped: Vec<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.skipped.is_empty()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            return write!(
                f,
                "run {} ({}) succeeded: {} tasks",
                self.run_id,
                self.logical_date,
                self.succeeded.len()
            );
        }

        writeln!(f, "run {} ({}) failed", self.run_id, self.logical_date)?;
        for failure in &self.failures {
            writeln!(f, "  {} [{}]: {}", failure.task_id, failure.state, failure.error)?;
        }
        if !self.skipped.is_empty() {
            write!(f, "  upstream_failed: {}", self.skipped.join(", "))?;
        }
        Ok(())
    }
}
