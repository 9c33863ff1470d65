use crate::events::{EventEmitter, ExecutionId};
use crate::schema::empty_schema;
use crate::store::{
    Artifact, ArtifactData, ArtifactKey, ArtifactKind, ArtifactMetadata, ArtifactRequest,
    ArtifactStore, StorageKey,
};
use crate::{Config, NodeId, NodeResult, Outputs, Port, UnitError, Value, WorkflowId, WorkspaceId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Core trait that every workflow step implements
///
/// Units hold no per-run state. Everything a run knows about a node arrives
/// through [`UnitContext`].
#[async_trait]
pub trait ProcessingUnit: Send + Sync {
    /// Unique type identifier (e.g., "data.load_csv", "stats.describe")
    fn module_type(&self) -> &str;

    /// Human readable name shown in module palettes
    fn display_name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn inputs(&self) -> Vec<Port> {
        Vec::new()
    }

    fn outputs(&self) -> Vec<Port> {
        Vec::new()
    }

    /// JSON-schema style description of accepted configuration
    fn config_schema(&self) -> serde_json::Value {
        empty_schema()
    }

    /// Pure check of a node's configuration, run before every execute
    fn validate_config(&self, _config: &Config) -> Result<(), UnitError> {
        Ok(())
    }

    /// Called once per predecessor with its recorded outputs before the
    /// config is validated. A unit may adapt the node's config here.
    fn on_upstream_changed(&self, _predecessor: &str, _outputs: &Outputs, _config: &mut Config) {}

    /// Execute the unit with given context.
    ///
    /// Expected failures (bad input, unusable config, storage errors) are
    /// returned as `Ok(NodeResult::failure(..))`. `Err` is for faults.
    async fn execute(&self, ctx: UnitContext) -> Result<NodeResult, UnitError>;
}

/// Identifies the run and node a unit is executing for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionScope {
    pub workspace_id: WorkspaceId,
    pub workflow_id: WorkflowId,
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
}

/// Recorded outputs of a node's predecessors, keyed by predecessor id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamContext {
    outputs: HashMap<NodeId, Outputs>,
}

impl UpstreamContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, predecessor: impl Into<NodeId>, outputs: Outputs) {
        self.outputs.insert(predecessor.into(), outputs);
    }

    pub fn get(&self, predecessor: &str) -> Option<&Outputs> {
        self.outputs.get(predecessor)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Outputs)> {
        self.outputs.iter()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// Execution context passed to each unit
#[derive(Clone)]
pub struct UnitContext {
    pub scope: ExecutionScope,

    /// Input values keyed by declared input port name
    pub inputs: HashMap<String, Value>,

    /// Node configuration, after upstream adaptation
    pub config: Config,

    pub upstream: UpstreamContext,

    pub store: Arc<dyn ArtifactStore>,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Cancellation token for graceful shutdown
    pub cancellation: CancellationToken,
}

impl UnitContext {
    pub fn new(scope: ExecutionScope, store: Arc<dyn ArtifactStore>) -> Self {
        let events = EventEmitter::detached(scope.node_id.clone());
        Self {
            scope,
            inputs: HashMap::new(),
            config: Config::new(),
            upstream: UpstreamContext::new(),
            store,
            events,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_input(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(port.into(), value.into());
        self
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn with_upstream(mut self, upstream: UpstreamContext) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, UnitError> {
        self.inputs
            .get(name)
            .filter(|v| !v.is_null())
            .ok_or_else(|| UnitError::MissingInput(name.to_string()))
    }

    /// Required input that must be a string, e.g. a storage key
    pub fn require_str(&self, name: &str) -> Result<&str, UnitError> {
        let value = self.require_input(name)?;
        value.as_str().ok_or_else(|| UnitError::InvalidInputType {
            field: name.to_string(),
            expected: "string".to_string(),
            actual: value.type_name().to_string(),
        })
    }

    pub fn config_str(&self, name: &str) -> Option<&str> {
        self.config.get(name).and_then(|v| v.as_str())
    }

    pub fn config_f64(&self, name: &str) -> Option<f64> {
        self.config.get(name).and_then(|v| v.as_f64())
    }

    pub fn config_bool(&self, name: &str) -> Option<bool> {
        self.config.get(name).and_then(|v| v.as_bool())
    }

    /// Deserialize the whole config into a unit's typed config struct
    pub fn typed_config<T>(&self) -> Result<T, UnitError>
    where
        T: schemars::JsonSchema + serde::de::DeserializeOwned,
    {
        crate::schema::parse_config(&self.config)
    }

    /// Save an artifact under this node's key space and return its key.
    pub async fn save_artifact(
        &self,
        filename: &str,
        kind: ArtifactKind,
        data: ArtifactData,
        metadata: ArtifactMetadata,
    ) -> Result<StorageKey, UnitError> {
        let key = ArtifactKey::new(
            self.scope.workspace_id.as_str(),
            self.scope.workflow_id.as_str(),
            self.scope.execution_id.to_string(),
            self.scope.node_id.as_str(),
            filename,
        )?;
        let mut request = ArtifactRequest::new(key, kind, data);
        request.metadata = metadata;
        Ok(self.store.save(request).await?)
    }

    pub async fn load_artifact(&self, key: &str) -> Result<Artifact, UnitError> {
        Ok(self.store.load(key).await?)
    }

    pub fn workspace_path(&self) -> Result<PathBuf, UnitError> {
        Ok(self.store.workspace_path(&self.scope.workspace_id)?)
    }
}

/// Externally visible description of a registered unit, enough to render a
/// module palette without executing anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub module_type: String,
    pub display_name: String,
    pub description: String,
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
    pub config_schema: serde_json::Value,
}

impl ModuleDescriptor {
    pub fn of(unit: &dyn ProcessingUnit) -> Self {
        Self {
            module_type: unit.module_type().to_string(),
            display_name: unit.display_name().to_string(),
            description: unit.description().to_string(),
            inputs: unit.inputs(),
            outputs: unit.outputs(),
            config_schema: unit.config_schema(),
        }
    }

    pub fn input(&self, name: &str) -> Option<&Port> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&Port> {
        self.outputs.iter().find(|p| p.name == name)
    }
}
