use crate::{NodeId, RunStatus, Value, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Events emitted during workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    RunStarted {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        total_nodes: usize,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        execution_id: ExecutionId,
        status: RunStatus,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        execution_id: ExecutionId,
        node_id: NodeId,
        module_type: String,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        execution_id: ExecutionId,
        node_id: NodeId,
        outputs: HashMap<String, Value>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        execution_id: ExecutionId,
        node_id: NodeId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    NodeSkipped {
        execution_id: ExecutionId,
        node_id: NodeId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    NodeEvent {
        execution_id: ExecutionId,
        node_id: NodeId,
        event: NodeEvent,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ExecutionEvent::RunStarted { execution_id, .. }
            | ExecutionEvent::RunCompleted { execution_id, .. }
            | ExecutionEvent::NodeStarted { execution_id, .. }
            | ExecutionEvent::NodeCompleted { execution_id, .. }
            | ExecutionEvent::NodeFailed { execution_id, .. }
            | ExecutionEvent::NodeSkipped { execution_id, .. }
            | ExecutionEvent::NodeEvent { execution_id, .. } => *execution_id,
        }
    }
}

/// Events specific to node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum NodeEvent {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
    Artifact { port: String, key: String },
}

/// Event emitter for units to send real-time updates
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: ExecutionId,
    node_id: NodeId,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(
        execution_id: ExecutionId,
        node_id: NodeId,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            execution_id,
            node_id,
            sender,
        }
    }

    /// Emitter whose events go nowhere, for driving units outside a run.
    pub fn detached(node_id: impl Into<NodeId>) -> Self {
        let (sender, _) = broadcast::channel(1);
        Self::new(Uuid::nil(), node_id.into(), sender)
    }

    /// Emit a node-specific event
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.sender.send(ExecutionEvent::NodeEvent {
            execution_id: self.execution_id,
            node_id: self.node_id.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    /// Emit info message
    pub fn info(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Info {
            message: message.into(),
        });
    }

    /// Emit warning message
    pub fn warn(&self, message: impl Into<String>) {
        self.emit(NodeEvent::Warning {
            message: message.into(),
        });
    }

    /// Emit progress update
    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(NodeEvent::Progress { percent, message });
    }

    /// Announce an artifact written for an output port
    pub fn artifact(&self, port: impl Into<String>, key: impl Into<String>) {
        self.emit(NodeEvent::Artifact {
            port: port.into(),
            key: key.into(),
        });
    }
}

/// Process-wide event bus
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("No event subscribers; event dropped");
        }
    }

    pub fn create_emitter(&self, execution_id: ExecutionId, node_id: NodeId) -> EventEmitter {
        EventEmitter::new(execution_id, node_id, self.sender.clone())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
