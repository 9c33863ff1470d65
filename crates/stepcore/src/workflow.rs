use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type WorkflowId = String;
pub type WorkspaceId = String;
pub type NodeId = String;
pub type ConnectionId = String;

/// Opaque per-node configuration map, as persisted.
pub type Config = serde_json::Map<String, serde_json::Value>;

/// Complete workflow definition: a node set plus a connection set that must
/// form a DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub id: WorkflowId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeRecord>,
    #[serde(default)]
    pub connections: Vec<ConnectionRecord>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl WorkflowGraph {
    pub fn new(workspace_id: impl Into<WorkspaceId>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            connections: Vec::new(),
            settings: WorkflowSettings::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<WorkflowId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn add_node(&mut self, node: NodeRecord) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    pub fn connect(
        &mut self,
        source_node_id: impl Into<NodeId>,
        source_port: impl Into<String>,
        target_node_id: impl Into<NodeId>,
        target_port: impl Into<String>,
    ) -> ConnectionId {
        let id = Uuid::new_v4().to_string();
        self.connections.push(ConnectionRecord {
            id: id.clone(),
            source_node_id: source_node_id.into(),
            target_node_id: target_node_id.into(),
            source_port: source_port.into(),
            target_port: target_port.into(),
        });
        id
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Node record in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    /// Selects the processing unit implementation.
    pub module_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Config,
    /// Runtime state persisted alongside the node; not read by the engine.
    #[serde(default)]
    pub state: Config,
    #[serde(default)]
    pub position: Option<Position>,
}

impl NodeRecord {
    pub fn new(id: impl Into<NodeId>, module_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            module_type: module_type.into(),
            name: None,
            config: Config::new(),
            state: Config::new(),
            position: None,
        }
    }

    pub fn with_config(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.position = Some(Position { x, y });
        self
    }
}

/// Connection between an output port and an input port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub source_port: String,
    pub target_port: String,
}

/// Node position in visual editor
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Per-workflow overrides of the runtime's scheduling defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    #[serde(default)]
    pub max_execution_time_ms: Option<u64>,
    #[serde(default)]
    pub max_parallel_nodes: Option<usize>,
    #[serde(default)]
    pub on_error: Option<FailurePolicy>,
}

/// What the coordinator does with the rest of the graph when a node fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip every node reachable from the failed one; independent branches
    /// keep running.
    #[default]
    SkipDownstream,
    /// Stop dispatching altogether; undispatched nodes are skipped.
    AbortRun,
}
