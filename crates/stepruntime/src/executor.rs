use crate::graph::GraphManager;
use crate::record::{ExecutionRecord, FailureKind, NodeOutcome};
use crate::registry::UnitRegistry;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use stepcore::{
    ArtifactStore, EventBus, ExecutionEvent, ExecutionId, ExecutionScope, FailurePolicy,
    FlowError, NodeId, NodeRecord, NodeResult, Outputs, ProcessingUnit, RunStatus, UnitContext,
    UnitError, UpstreamContext, Value, WorkflowGraph, WorkflowSettings,
};
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Scheduling knobs for a single run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Upper bound on nodes executing at once
    pub max_parallel: usize,
    /// Stop dispatching new nodes once this much time has passed
    pub run_deadline: Option<Duration>,
    /// Wraps each `execute` call
    pub node_timeout: Option<Duration>,
    pub failure_policy: FailurePolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_parallel: 10,
            run_deadline: None,
            node_timeout: None,
            failure_policy: FailurePolicy::SkipDownstream,
        }
    }
}

impl RunConfig {
    /// Applies a workflow's own settings on top of these defaults.
    pub fn for_workflow(&self, settings: &WorkflowSettings) -> Self {
        Self {
            max_parallel: settings
                .max_parallel_nodes
                .unwrap_or(self.max_parallel)
                .max(1),
            run_deadline: settings
                .max_execution_time_ms
                .map(Duration::from_millis)
                .or(self.run_deadline),
            node_timeout: self.node_timeout,
            failure_policy: settings.on_error.unwrap_or(self.failure_policy),
        }
    }
}

/// Runs one workflow graph at a time, node by node in dependency order
pub struct RunCoordinator {
    registry: Arc<UnitRegistry>,
    store: Arc<dyn ArtifactStore>,
    event_bus: Arc<EventBus>,
    config: RunConfig,
}

impl RunCoordinator {
    pub fn new(
        registry: Arc<UnitRegistry>,
        store: Arc<dyn ArtifactStore>,
        event_bus: Arc<EventBus>,
        config: RunConfig,
    ) -> Self {
        Self {
            registry,
            store,
            event_bus,
            config,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<UnitRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Execute a workflow under a fresh execution id
    pub async fn execute(&self, workflow: &WorkflowGraph) -> Result<ExecutionRecord, FlowError> {
        self.execute_with(workflow, ExecutionId::new_v4(), CancellationToken::new())
            .await
    }

    /// Execute a workflow.
    ///
    /// Fails only on a structural error, before any node runs. Every other
    /// problem is recorded against the node it happened to.
    #[instrument(skip_all, fields(workflow_id = %workflow.id, execution_id = %execution_id))]
    pub async fn execute_with(
        &self,
        workflow: &WorkflowGraph,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) -> Result<ExecutionRecord, FlowError> {
        let started_at = Utc::now();
        let start = Instant::now();

        let graph = GraphManager::from_workflow(workflow);
        let order = match graph.topological_order() {
            Ok(order) => order.to_vec(),
            Err(e) => {
                tracing::error!("Refusing to execute workflow {}: {}", workflow.id, e);
                return Err(e.into());
            }
        };

        tracing::info!(
            "Starting workflow execution: {} ({} nodes)",
            workflow.id,
            order.len()
        );
        self.event_bus.emit(ExecutionEvent::RunStarted {
            execution_id,
            workflow_id: workflow.id.clone(),
            total_nodes: order.len(),
            timestamp: Utc::now(),
        });

        let config = self.config.for_workflow(&workflow.settings);
        let mut run = Run::new(self, workflow, &graph, order, execution_id, config, cancel);
        run.drive().await;
        let (status, order, nodes) = run.finish();

        let duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            "Workflow {} finished with status {} in {}ms",
            workflow.id,
            status,
            duration_ms
        );
        self.event_bus.emit(ExecutionEvent::RunCompleted {
            execution_id,
            status,
            duration_ms,
            timestamp: Utc::now(),
        });

        Ok(ExecutionRecord {
            execution_id,
            workflow_id: workflow.id.clone(),
            status,
            order,
            nodes,
            started_at,
            duration_ms,
        })
    }
}

enum StopReason {
    Cancelled,
    DeadlinePassed,
    Aborted { node_id: NodeId },
}

impl StopReason {
    fn skip_reason(&self) -> String {
        match self {
            StopReason::Cancelled => "run cancelled".to_string(),
            StopReason::DeadlinePassed => "run deadline passed".to_string(),
            StopReason::Aborted { node_id } => format!("run aborted after node {} failed", node_id),
        }
    }
}

enum Dispatch {
    Run(NodeTask),
    Skip(String),
    Fail(FailureKind, String),
}

struct TaskOutput {
    node_id: NodeId,
    result: Result<Result<NodeResult, UnitError>, JoinError>,
    duration_ms: u64,
}

type NodeTask = BoxFuture<'static, TaskOutput>;

/// Mutable state of one execution
struct Run<'a> {
    coordinator: &'a RunCoordinator,
    workflow: &'a WorkflowGraph,
    graph: &'a GraphManager,
    records: HashMap<&'a str, &'a NodeRecord>,
    execution_id: ExecutionId,
    config: RunConfig,
    cancel: CancellationToken,
    order: Vec<NodeId>,
    positions: HashMap<NodeId, usize>,
    /// Predecessors each node is still waiting on
    waiting_on: HashMap<NodeId, usize>,
    /// Eligible nodes, by topological position
    ready: BTreeSet<usize>,
    outcomes: HashMap<NodeId, NodeOutcome>,
    outputs: HashMap<NodeId, Outputs>,
    stop: Option<StopReason>,
}

impl<'a> Run<'a> {
    fn new(
        coordinator: &'a RunCoordinator,
        workflow: &'a WorkflowGraph,
        graph: &'a GraphManager,
        order: Vec<NodeId>,
        execution_id: ExecutionId,
        config: RunConfig,
        cancel: CancellationToken,
    ) -> Self {
        let mut records = HashMap::new();
        for node in &workflow.nodes {
            records.entry(node.id.as_str()).or_insert(node);
        }

        let positions: HashMap<NodeId, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        let waiting_on: HashMap<NodeId, usize> = order
            .iter()
            .map(|id| (id.clone(), graph.predecessors(id).len()))
            .collect();
        let ready = order
            .iter()
            .enumerate()
            .filter(|(_, id)| graph.predecessors(id).is_empty())
            .map(|(i, _)| i)
            .collect();

        Self {
            coordinator,
            workflow,
            graph,
            records,
            execution_id,
            config,
            cancel,
            order,
            positions,
            waiting_on,
            ready,
            outcomes: HashMap::new(),
            outputs: HashMap::new(),
            stop: None,
        }
    }

    async fn drive(&mut self) {
        let deadline = self.config.run_deadline.map(|d| Instant::now() + d);
        let mut running: FuturesUnordered<NodeTask> = FuturesUnordered::new();

        loop {
            self.check_stop(deadline, running.len());
            self.dispatch_ready(&mut running);

            if running.is_empty() {
                break;
            }

            // In-flight nodes always run to completion; cancellation and the
            // deadline only wake the loop so it stops dispatching.
            let cancel = self.cancel.clone();
            let watching = self.stop.is_none() && self.has_undispatched(running.len());
            let deadline_reached = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                Some(output) = running.next() => self.complete(output),
                _ = cancel.cancelled(), if watching => {}
                _ = deadline_reached, if watching => {}
            }
        }
    }

    /// Whether some node has neither settled nor been started.
    fn has_undispatched(&self, in_flight: usize) -> bool {
        self.outcomes.len() + in_flight < self.order.len()
    }

    /// Stopping only matters while there is still something left to start.
    fn check_stop(&mut self, deadline: Option<Instant>, in_flight: usize) {
        if self.stop.is_some() || !self.has_undispatched(in_flight) {
            return;
        }
        if self.cancel.is_cancelled() {
            tracing::warn!("Execution {} cancelled; no further nodes will start", self.execution_id);
            self.stop = Some(StopReason::Cancelled);
        } else if deadline.is_some_and(|at| Instant::now() >= at) {
            tracing::warn!(
                "Execution {} passed its deadline; no further nodes will start",
                self.execution_id
            );
            self.stop = Some(StopReason::DeadlinePassed);
        }
    }

    fn dispatch_ready(&mut self, running: &mut FuturesUnordered<NodeTask>) {
        while self.stop.is_none() && running.len() < self.config.max_parallel {
            let Some(position) = self.ready.pop_first() else {
                break;
            };
            let node_id = self.order[position].clone();

            match self.prepare(&node_id) {
                Dispatch::Run(task) => running.push(task),
                Dispatch::Skip(reason) => self.settle(&node_id, NodeOutcome::Skipped { reason }),
                Dispatch::Fail(kind, reason) => self.settle(
                    &node_id,
                    NodeOutcome::Failed {
                        kind,
                        reason,
                        result: None,
                        duration_ms: 0,
                    },
                ),
            }
        }
    }

    /// Resolve, wire up and validate a node whose predecessors have all
    /// completed.
    fn prepare(&self, node_id: &str) -> Dispatch {
        let predecessors = self.graph.predecessors(node_id);

        let blocker = predecessors.iter().find(|p| {
            !self
                .outcomes
                .get(p.as_str())
                .is_some_and(NodeOutcome::is_success)
        });
        if let Some(blocker) = blocker {
            let state = self
                .outcomes
                .get(blocker)
                .map(NodeOutcome::label)
                .unwrap_or("unfinished");
            return Dispatch::Skip(format!("upstream node {} {}", blocker, state));
        }

        let Some(record) = self.records.get(node_id) else {
            return Dispatch::Fail(
                FailureKind::Input,
                format!("no record for node {}", node_id),
            );
        };

        let unit = match self.coordinator.registry.get(&record.module_type) {
            Ok(unit) => unit,
            Err(e) => return Dispatch::Fail(FailureKind::Registry, e.to_string()),
        };
        let declared = unit.inputs();

        let mut upstream = UpstreamContext::new();
        for pred in predecessors {
            if let Some(outputs) = self.outputs.get(pred) {
                upstream.insert(pred.clone(), outputs.clone());
            }
        }

        let mut inputs: HashMap<String, Value> = HashMap::new();
        for conn in self.graph.connections_to(node_id) {
            if !declared.iter().any(|p| p.name == conn.target_port) {
                return Dispatch::Fail(
                    FailureKind::Input,
                    format!(
                        "connection {} targets undeclared input port '{}'",
                        conn.id, conn.target_port
                    ),
                );
            }
            let source_declares = self
                .records
                .get(conn.source_node_id.as_str())
                .and_then(|source| self.coordinator.registry.descriptor(&source.module_type))
                .is_some_and(|descriptor| descriptor.output(&conn.source_port).is_some());
            if !source_declares {
                return Dispatch::Fail(
                    FailureKind::Input,
                    format!(
                        "connection {} reads undeclared output port '{}' of node {}",
                        conn.id, conn.source_port, conn.source_node_id
                    ),
                );
            }
            match upstream
                .get(&conn.source_node_id)
                .and_then(|outputs| outputs.get(&conn.source_port))
            {
                Some(value) => {
                    inputs.insert(conn.target_port.clone(), value.clone());
                }
                None => tracing::warn!(
                    "Node {} produced no '{}' output for connection {}",
                    conn.source_node_id,
                    conn.source_port,
                    conn.id
                ),
            }
        }
        for port in &declared {
            if let (false, Some(default)) = (inputs.contains_key(&port.name), &port.default) {
                inputs.insert(port.name.clone(), default.clone());
            }
        }

        let mut config = record.config.clone();
        for pred in predecessors {
            if let Some(outputs) = upstream.get(pred) {
                unit.on_upstream_changed(pred, outputs, &mut config);
            }
        }

        if let Err(e) = unit.validate_config(&config) {
            return Dispatch::Fail(FailureKind::Configuration, e.to_string());
        }

        for port in &declared {
            match inputs.get(&port.name) {
                None if port.required => {
                    return Dispatch::Fail(
                        FailureKind::Input,
                        UnitError::MissingInput(port.name.clone()).to_string(),
                    )
                }
                Some(value) if !port.port_type.accepts(value) => {
                    return Dispatch::Fail(
                        FailureKind::Input,
                        UnitError::InvalidInputType {
                            field: port.name.clone(),
                            expected: port.port_type.to_string(),
                            actual: value.type_name().to_string(),
                        }
                        .to_string(),
                    )
                }
                _ => {}
            }
        }

        let scope = ExecutionScope {
            workspace_id: self.workflow.workspace_id.clone(),
            workflow_id: self.workflow.id.clone(),
            execution_id: self.execution_id,
            node_id: node_id.to_string(),
        };
        let mut ctx = UnitContext::new(scope, self.coordinator.store.clone())
            .with_config(config)
            .with_upstream(upstream)
            .with_events(
                self.coordinator
                    .event_bus
                    .create_emitter(self.execution_id, node_id.to_string()),
            )
            .with_cancellation(self.cancel.child_token());
        ctx.inputs = inputs;

        tracing::debug!("Dispatching node {} ({})", node_id, record.module_type);
        self.coordinator.event_bus.emit(ExecutionEvent::NodeStarted {
            execution_id: self.execution_id,
            node_id: node_id.to_string(),
            module_type: record.module_type.clone(),
            timestamp: Utc::now(),
        });

        Dispatch::Run(spawn_unit(
            node_id.to_string(),
            unit,
            ctx,
            self.config.node_timeout,
        ))
    }

    fn complete(&mut self, output: TaskOutput) {
        let TaskOutput {
            node_id,
            result,
            duration_ms,
        } = output;

        let outcome = match result {
            Ok(Ok(mut result)) => {
                result
                    .metadata
                    .entry("execution_time_ms".to_string())
                    .or_insert(Value::Number(duration_ms as f64));
                if result.success {
                    NodeOutcome::Succeeded {
                        result,
                        duration_ms,
                    }
                } else {
                    NodeOutcome::Failed {
                        kind: FailureKind::Execution,
                        reason: result
                            .error
                            .clone()
                            .unwrap_or_else(|| "unit reported failure".to_string()),
                        result: Some(result),
                        duration_ms,
                    }
                }
            }
            Ok(Err(UnitError::Timeout { millis })) => NodeOutcome::Failed {
                kind: FailureKind::Timeout,
                reason: format!("node timed out after {}ms", millis),
                result: None,
                duration_ms,
            },
            Ok(Err(e)) => NodeOutcome::Failed {
                kind: FailureKind::Fault,
                reason: e.to_string(),
                result: None,
                duration_ms,
            },
            Err(e) => NodeOutcome::Failed {
                kind: FailureKind::Fault,
                reason: if e.is_panic() {
                    "unit panicked".to_string()
                } else {
                    format!("unit task aborted: {}", e)
                },
                result: None,
                duration_ms,
            },
        };

        self.settle(&node_id, outcome);
    }

    /// Record a node's final outcome and release its successors.
    fn settle(&mut self, node_id: &str, outcome: NodeOutcome) {
        let bus = &self.coordinator.event_bus;
        let execution_id = self.execution_id;

        match &outcome {
            NodeOutcome::Succeeded {
                result,
                duration_ms,
            } => {
                tracing::info!("Node {} completed in {}ms", node_id, duration_ms);
                bus.emit(ExecutionEvent::NodeCompleted {
                    execution_id,
                    node_id: node_id.to_string(),
                    outputs: result.outputs.clone(),
                    duration_ms: *duration_ms,
                    timestamp: Utc::now(),
                });
                self.outputs
                    .insert(node_id.to_string(), result.outputs.clone());
            }
            NodeOutcome::Failed { kind, reason, .. } => {
                tracing::error!("Node {} failed ({:?}): {}", node_id, kind, reason);
                bus.emit(ExecutionEvent::NodeFailed {
                    execution_id,
                    node_id: node_id.to_string(),
                    error: reason.clone(),
                    timestamp: Utc::now(),
                });
                if self.config.failure_policy == FailurePolicy::AbortRun && self.stop.is_none() {
                    self.stop = Some(StopReason::Aborted {
                        node_id: node_id.to_string(),
                    });
                }
            }
            NodeOutcome::Skipped { reason } => {
                tracing::warn!("Skipping node {}: {}", node_id, reason);
                bus.emit(ExecutionEvent::NodeSkipped {
                    execution_id,
                    node_id: node_id.to_string(),
                    reason: reason.clone(),
                    timestamp: Utc::now(),
                });
            }
        }
        self.outcomes.insert(node_id.to_string(), outcome);

        let graph = self.graph;
        for successor in graph.successors(node_id) {
            if let Some(waiting) = self.waiting_on.get_mut(successor) {
                *waiting = waiting.saturating_sub(1);
                if *waiting == 0 {
                    if let Some(&position) = self.positions.get(successor) {
                        self.ready.insert(position);
                    }
                }
            }
        }
    }

    /// Skip whatever never ran and derive the run status.
    fn finish(mut self) -> (RunStatus, Vec<NodeId>, HashMap<NodeId, NodeOutcome>) {
        let reason = self
            .stop
            .as_ref()
            .map(StopReason::skip_reason)
            .unwrap_or_else(|| "not scheduled".to_string());

        let pending: Vec<NodeId> = self
            .order
            .iter()
            .filter(|id| !self.outcomes.contains_key(*id))
            .cloned()
            .collect();
        for node_id in pending {
            self.settle(
                &node_id,
                NodeOutcome::Skipped {
                    reason: reason.clone(),
                },
            );
        }

        let any_failed = self.outcomes.values().any(NodeOutcome::is_failed);
        let status = match &self.stop {
            Some(StopReason::Cancelled) => RunStatus::Cancelled,
            Some(StopReason::DeadlinePassed) => RunStatus::TimedOut,
            Some(StopReason::Aborted { .. }) => RunStatus::Failed,
            None if any_failed => RunStatus::Failed,
            None => RunStatus::Succeeded,
        };

        (status, self.order, self.outcomes)
    }
}

fn spawn_unit(
    node_id: NodeId,
    unit: Box<dyn ProcessingUnit>,
    ctx: UnitContext,
    timeout: Option<Duration>,
) -> NodeTask {
    let start = Instant::now();
    let handle = tokio::spawn(async move {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, unit.execute(ctx))
                .await
                .unwrap_or(Err(UnitError::Timeout {
                    millis: limit.as_millis() as u64,
                })),
            None => unit.execute(ctx).await,
        }
    });

    async move {
        let result = handle.await;
        TaskOutput {
            node_id,
            result,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
    .boxed()
}
