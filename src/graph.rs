//! Pipeline graph: task groups with an internal edge policy, joined by
//! group-level edges.
//!
//! A group edge `G -> H` means every task of `H` waits for every task of `G`
//! to succeed. Inside a group, [`EdgePolicy::Independent`] adds no edges and
//! [`EdgePolicy::Chained`] adds `t[i] -> t[i+1]` in declaration order.

use std::collections::{HashMap, HashSet};
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{BoxTask, EtlError, Result, has_cycle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EdgePolicy {
    #[default]
    Independent,
    Chained,
}

impl fmt::Display for EdgePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Independent => write!(f, "independent"),
            Self::Chained => write!(f, "chained"),
        }
    }
}

impl std::str::FromStr for EdgePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "independent" => Ok(Self::Independent),
            "chained" => Ok(Self::Chained),
            _ => Err(format!("Invalid edge policy: {s}")),
        }
    }
}

pub struct TaskGroup {
    name: String,
    policy: EdgePolicy,
    tasks: Vec<BoxTask>,
}

impl TaskGroup {
    pub fn new(name: impl Into<String>, policy: EdgePolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            tasks: Vec::new(),
        }
    }

    pub fn independent(name: impl Into<String>) -> Self {
        Self::new(name, EdgePolicy::Independent)
    }

    pub fn chained(name: impl Into<String>) -> Self {
        Self::new(name, EdgePolicy::Chained)
    }

    pub fn with_task(mut self, task: BoxTask) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn push(&mut self, task: BoxTask) {
        self.tasks.push(task);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> EdgePolicy {
        self.policy
    }

    pub fn tasks(&self) -> &[BoxTask] {
        &self.tasks
    }

    pub fn qualified_id(&self, task: &str) -> String {
        format!("{}.{}", self.name, task)
    }
}

/// One task after expansion, with its task-level dependencies.
#[derive(Clone)]
pub struct TaskNode {
    pub id: String,
    pub group: String,
    pub task: BoxTask,
    pub dependencies: Vec<String>,
}

#[derive(Default)]
pub struct PipelineGraph {
    groups: IndexMap<String, TaskGroup>,
    /// `(upstream, downstream)` group names.
    edges: Vec<(String, String)>,
}

impl PipelineGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&mut self, group: TaskGroup) -> Result<()> {
        if self.groups.contains_key(group.name()) {
            return Err(EtlError::InvalidGraph(format!(
                "duplicate group {}",
                group.name()
            )));
        }

        let mut seen = HashSet::new();
        for task in group.tasks() {
            if !seen.insert(task.name()) {
                return Err(EtlError::InvalidGraph(format!(
                    "duplicate task {} in group {}",
                    task.name(),
                    group.name()
                )));
            }
        }

        self.groups.insert(group.name().to_string(), group);
        Ok(())
    }

    pub fn add_edge(&mut self, upstream: &str, downstream: &str) -> Result<()> {
        for name in [upstream, downstream] {
            if !self.groups.contains_key(name) {
                return Err(EtlError::InvalidGraph(format!("unknown group {name}")));
            }
        }

        self.edges.push((upstream.to_string(), downstream.to_string()));
        if has_cycle(&self.group_dependencies()) {
            self.edges.pop();
            return Err(EtlError::CircularDependency);
        }
        Ok(())
    }

    /// Links the named groups into a linear chain of group edges.
    pub fn chain(&mut self, names: &[&str]) -> Result<()> {
        for pair in names.windows(2) {
            self.add_edge(pair[0], pair[1])?;
        }
        Ok(())
    }

    pub fn groups(&self) -> impl Iterator<Item = &TaskGroup> {
        self.groups.values()
    }

    pub fn group(&self, name: &str) -> Option<&TaskGroup> {
        self.groups.get(name)
    }

    pub fn task_count(&self) -> usize {
        self.groups.values().map(|g| g.tasks().len()).sum()
    }

    pub fn group_dependencies(&self) -> HashMap<String, Vec<String>> {
        let mut deps: HashMap<String, Vec<String>> = self
            .groups
            .keys()
            .map(|name| (name.clone(), Vec::new()))
            .collect();
        for (upstream, downstream) in &self.edges {
            deps.entry(downstream.clone())
                .or_default()
                .push(upstream.clone());
        }
        deps
    }

    /// Renders the group graph as a tree rooted at groups without upstreams.
    pub fn describe(&self) -> String {
        let deps = self.group_dependencies();
        let mut out = String::new();

        for group in self.groups.values() {
            if deps.get(group.name()).is_some_and(|d| !d.is_empty()) {
                continue;
            }
            self.describe_group(group, "", &mut out);
            self.describe_chain(group.name(), "  ", &mut out);
        }

        out
    }

    fn describe_group(&self, group: &TaskGroup, prefix: &str, out: &mut String) {
        let members: Vec<&str> = group.tasks().iter().map(|t| t.name()).collect();
        let sep = match group.policy() {
            EdgePolicy::Independent => ", ",
            EdgePolicy::Chained => " >> ",
        };
        out.push_str(&format!(
            "{prefix}{} [{}]: {}\n",
            group.name(),
            group.policy(),
            members.join(sep)
        ));
    }

    fn describe_chain(&self, name: &str, prefix: &str, out: &mut String) {
        for (upstream, downstream) in &self.edges {
            if upstream != name {
                continue;
            }
            if let Some(group) = self.groups.get(downstream) {
                self.describe_group(group, &format!("{prefix}└─> "), out);
                self.describe_chain(downstream, &format!("{prefix}    "), out);
            }
        }
    }

    /// Tasks a group waits on. An upstream group without tasks passes its
    /// own upstreams through.
    fn gate(&self, name: &str, group_deps: &HashMap<String, Vec<String>>) -> Vec<String> {
        let mut gate = Vec::new();
        let mut seen = HashSet::new();
        let mut pending: Vec<&str> = group_deps
            .get(name)
            .map(|d| d.iter().rev().map(String::as_str).collect())
            .unwrap_or_default();

        while let Some(upstream) = pending.pop() {
            if !seen.insert(upstream) {
                continue;
            }
            let Some(group) = self.groups.get(upstream) else {
                continue;
            };
            if group.tasks().is_empty() {
                if let Some(deps) = group_deps.get(upstream) {
                    pending.extend(deps.iter().rev().map(String::as_str));
                }
                continue;
            }
            gate.extend(group.tasks().iter().map(|t| group.qualified_id(t.name())));
        }

        gate
    }

    /// Flattens groups and group edges into task nodes, in group then
    /// declaration order.
    pub fn expand(&self) -> Vec<TaskNode> {
        let group_deps = self.group_dependencies();
        let mut nodes = Vec::with_capacity(self.task_count());

        for group in self.groups.values() {
            let gate = self.gate(group.name(), &group_deps);

            let mut previous: Option<String> = None;
            for task in group.tasks() {
                let id = group.qualified_id(task.name());
                let mut dependencies = gate.clone();
                if group.policy() == EdgePolicy::Chained {
                    if let Some(prev) = previous.take() {
                        dependencies.push(prev);
                    }
                    previous = Some(id.clone());
                }

                nodes.push(TaskNode {
                    id,
                    group: group.name().to_string(),
                    task: task.clone(),
                    dependencies,
                });
            }
        }

        nodes
    }
}
