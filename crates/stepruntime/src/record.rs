use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use stepcore::{ExecutionId, NodeId, NodeResult, Outputs, RunStatus, WorkflowId};

/// Why a node failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Module type not registered
    Registry,
    /// `validate_config` rejected the node's config
    Configuration,
    /// Missing required input, undeclared port or mistyped upstream value
    Input,
    /// The unit returned an unsuccessful result
    Execution,
    /// The unit returned an error or panicked
    Fault,
    Timeout,
}

/// Recorded outcome of one node in one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeOutcome {
    Succeeded {
        result: NodeResult,
        duration_ms: u64,
    },
    Failed {
        kind: FailureKind,
        reason: String,
        result: Option<NodeResult>,
        duration_ms: u64,
    },
    Skipped {
        reason: String,
    },
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, NodeOutcome::Succeeded { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, NodeOutcome::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, NodeOutcome::Skipped { .. })
    }

    pub fn result(&self) -> Option<&NodeResult> {
        match self {
            NodeOutcome::Succeeded { result, .. } => Some(result),
            NodeOutcome::Failed { result, .. } => result.as_ref(),
            NodeOutcome::Skipped { .. } => None,
        }
    }

    /// Failure or skip reason
    pub fn reason(&self) -> Option<&str> {
        match self {
            NodeOutcome::Succeeded { .. } => None,
            NodeOutcome::Failed { reason, .. } | NodeOutcome::Skipped { reason } => Some(reason),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeOutcome::Succeeded { .. } => "succeeded",
            NodeOutcome::Failed { .. } => "failed",
            NodeOutcome::Skipped { .. } => "skipped",
        }
    }
}

/// Per-run log of every node's outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: RunStatus,
    /// Topological order the run was scheduled from
    pub order: Vec<NodeId>,
    pub nodes: HashMap<NodeId, NodeOutcome>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ExecutionRecord {
    pub fn outcome(&self, node_id: &str) -> Option<&NodeOutcome> {
        self.nodes.get(node_id)
    }

    pub fn result(&self, node_id: &str) -> Option<&NodeResult> {
        self.outcome(node_id).and_then(NodeOutcome::result)
    }

    /// Outputs of a node that succeeded
    pub fn outputs(&self, node_id: &str) -> Option<&Outputs> {
        match self.outcome(node_id)? {
            NodeOutcome::Succeeded { result, .. } => Some(&result.outputs),
            _ => None,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.nodes.values().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.nodes.values().filter(|o| o.is_failed()).count()
    }

    pub fn skipped(&self) -> usize {
        self.nodes.values().filter(|o| o.is_skipped()).count()
    }

    /// Outcomes in scheduling order
    pub fn iter_ordered(&self) -> impl Iterator<Item = (&NodeId, &NodeOutcome)> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id).map(|outcome| (id, outcome)))
    }
}
