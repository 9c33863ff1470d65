use crate::executor::{RunConfig, RunCoordinator};
use crate::record::ExecutionRecord;
use crate::registry::UnitRegistry;
use crate::store::{LocalArtifactStore, MemoryArtifactStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use stepcore::{
    ArtifactStore, EventBus, ExecutionEvent, ExecutionId, FailurePolicy, FlowError,
    WorkflowGraph, WorkflowId,
};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Main runtime for executing workflows
pub struct StepRuntime {
    registry: Arc<UnitRegistry>,
    store: Arc<dyn ArtifactStore>,
    coordinator: Arc<RunCoordinator>,
    event_bus: Arc<EventBus>,
    workflows: Arc<RwLock<HashMap<WorkflowId, WorkflowGraph>>>,
}

impl StepRuntime {
    /// Create a runtime from configuration, picking a local store when an
    /// artifact root is configured.
    pub fn new(registry: Arc<UnitRegistry>, config: RuntimeConfig) -> Self {
        let store: Arc<dyn ArtifactStore> = match &config.artifact_root {
            Some(root) => Arc::new(LocalArtifactStore::new(root.clone())),
            None => Arc::new(MemoryArtifactStore::new()),
        };
        Self::with_store(registry, store, config)
    }

    /// Create a runtime around an existing artifact store
    pub fn with_store(
        registry: Arc<UnitRegistry>,
        store: Arc<dyn ArtifactStore>,
        config: RuntimeConfig,
    ) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let coordinator = Arc::new(RunCoordinator::new(
            registry.clone(),
            store.clone(),
            event_bus.clone(),
            config.run_config(),
        ));

        Self {
            registry,
            store,
            coordinator,
            event_bus,
            workflows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Arc<UnitRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Register a workflow, replacing any earlier one with the same id
    pub async fn register_workflow(&self, workflow: WorkflowGraph) {
        let mut workflows = self.workflows.write().await;
        tracing::debug!("Registering workflow {} ({})", workflow.id, workflow.name);
        workflows.insert(workflow.id.clone(), workflow);
    }

    pub async fn workflow(&self, workflow_id: &str) -> Option<WorkflowGraph> {
        self.workflows.read().await.get(workflow_id).cloned()
    }

    /// Execute a registered workflow by ID
    pub async fn execute_workflow(&self, workflow_id: &str) -> Result<ExecutionRecord, FlowError> {
        let workflow = self
            .workflow(workflow_id)
            .await
            .ok_or_else(|| FlowError::WorkflowNotFound(workflow_id.to_string()))?;
        self.coordinator.execute(&workflow).await
    }

    /// Execute a workflow directly (without registration)
    pub async fn execute(&self, workflow: &WorkflowGraph) -> Result<ExecutionRecord, FlowError> {
        self.coordinator.execute(workflow).await
    }

    /// Start a run in the background.
    ///
    /// The execution id is known up front so callers can filter events
    /// before the run finishes.
    pub fn spawn(&self, workflow: WorkflowGraph) -> RunHandle {
        let execution_id = ExecutionId::new_v4();
        let cancel = CancellationToken::new();
        let coordinator = self.coordinator.clone();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            coordinator
                .execute_with(&workflow, execution_id, token)
                .await
        });

        RunHandle {
            execution_id,
            cancel,
            task,
        }
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

/// A run executing in the background
pub struct RunHandle {
    pub execution_id: ExecutionId,
    cancel: CancellationToken,
    task: JoinHandle<Result<ExecutionRecord, FlowError>>,
}

impl RunHandle {
    /// Stop dispatching new nodes. Nodes already running finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run to finish
    pub async fn join(self) -> Result<ExecutionRecord, FlowError> {
        self.task
            .await
            .map_err(|e| FlowError::Execution(format!("run task failed: {}", e)))?
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_parallel_nodes: usize,
    pub event_buffer_size: usize,
    pub run_deadline_ms: Option<u64>,
    pub node_timeout_ms: Option<u64>,
    pub failure_policy: FailurePolicy,
    /// Directory for the local artifact store; in-memory when unset
    pub artifact_root: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            event_buffer_size: 1000,
            run_deadline_ms: None,
            node_timeout_ms: None,
            failure_policy: FailurePolicy::SkipDownstream,
            artifact_root: None,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FlowError> {
        if self.max_parallel_nodes == 0 {
            return Err(FlowError::Config(
                "max_parallel_nodes must be at least 1".to_string(),
            ));
        }
        if self.event_buffer_size == 0 {
            return Err(FlowError::Config(
                "event_buffer_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            max_parallel: self.max_parallel_nodes.max(1),
            run_deadline: self.run_deadline_ms.map(Duration::from_millis),
            node_timeout: self.node_timeout_ms.map(Duration::from_millis),
            failure_policy: self.failure_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn config_fields_default_when_absent() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"node_timeout_ms": 250, "failure_policy": "abort_run"}"#)
                .unwrap();
        assert_eq!(config.max_parallel_nodes, 10);
        assert_eq!(config.event_buffer_size, 1000);
        assert!(config.artifact_root.is_none());

        let run = config.run_config();
        assert_eq!(run.node_timeout, Some(Duration::from_millis(250)));
        assert_eq!(run.run_deadline, None);
        assert_eq!(run.failure_policy, FailurePolicy::AbortRun);
    }

    #[test]
    fn from_file_rejects_zero_parallelism() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("runtime.json");
        std::fs::write(&path, r#"{"max_parallel_nodes": 0}"#).unwrap();
        assert!(matches!(
            RuntimeConfig::from_file(&path),
            Err(FlowError::Config(_))
        ));

        std::fs::write(&path, r#"{"max_parallel_nodes": 2}"#).unwrap();
        assert_eq!(RuntimeConfig::from_file(&path).unwrap().max_parallel_nodes, 2);
    }

    #[tokio::test]
    async fn unknown_workflow_id_is_an_error() {
        let runtime = StepRuntime::new(Arc::new(UnitRegistry::empty()), RuntimeConfig::default());
        assert!(matches!(
            runtime.execute_workflow("nope").await,
            Err(FlowError::WorkflowNotFound(id)) if id == "nope"
        ));
    }

    #[tokio::test]
    async fn empty_workflow_succeeds() {
        let runtime = StepRuntime::new(Arc::new(UnitRegistry::empty()), RuntimeConfig::default());
        let workflow = WorkflowGraph::new("ws", "empty").with_id("wf-empty");
        runtime.register_workflow(workflow).await;

        let record = runtime.execute_workflow("wf-empty").await.unwrap();
        assert!(record.status.is_success());
        assert!(record.nodes.is_empty());
    }
}
