use serde::Serialize;

use super::node::{NodeState, TaskNode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Not the last snapshot.
    Running,
    /// Every node reached success or fail.
    Complete,
    /// Handlers finished but some nodes never received their inputs.
    Incomplete { pending: Vec<String> },
    Cancelled,
    /// No handler produced anything within the idle timeout.
    TimedOut,
}

impl RunOutcome {
    pub fn is_final(&self) -> bool {
        !matches!(self, RunOutcome::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Running => "running",
            RunOutcome::Complete => "complete",
            RunOutcome::Incomplete { .. } => "incomplete",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::TimedOut => "timed_out",
        }
    }
}

/// State of every node at one point of a run.
#[derive(Debug, Clone, Serialize)]
pub struct GraphSnapshot {
    pub run_id: String,
    pub sequence: u64,
    pub outcome: RunOutcome,
    pub nodes: Vec<TaskNode>,
}

impl GraphSnapshot {
    pub fn is_final(&self) -> bool {
        self.outcome.is_final()
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.iter().filter(|n| n.state == state).count()
    }
}

/// Result of driving a run to its final snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub nodes: Vec<TaskNode>,
    /// Total execution duration in milliseconds
    pub duration_ms: u64,
    pub snapshots: u64,
}

impl ExecutionResult {
    pub fn is_complete(&self) -> bool {
        self.outcome == RunOutcome::Complete
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Nodes created from `origin`, the static node first.
    pub fn invocations<'a>(&'a self, origin: &'a str) -> impl Iterator<Item = &'a TaskNode> + 'a {
        self.nodes.iter().filter(move |n| n.origin_id() == origin)
    }

    pub fn succeeded(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.state == NodeState::Success)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.state == NodeState::Fail)
            .count()
    }
}
