use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stepcore::{
    Config, EventBus, ExecutionEvent, FailurePolicy, FlowError, GraphError, NodeRecord,
    NodeResult, Outputs, Port, PortType, ProcessingUnit, RunStatus, UnitContext, UnitError,
    Value, WorkflowGraph,
};
use stepruntime::{
    FailureKind, MemoryArtifactStore, NodeOutcome, RunConfig, RunCoordinator, RuntimeConfig,
    StepRuntime, UnitRegistry,
};

/// Emits config `value` (default 1) on `out`
struct Source;

#[async_trait]
impl ProcessingUnit for Source {
    fn module_type(&self) -> &str {
        "test.source"
    }

    fn display_name(&self) -> &str {
        "Source"
    }

    fn outputs(&self) -> Vec<Port> {
        vec![Port::output("out", PortType::Number)]
    }

    async fn execute(&self, ctx: UnitContext) -> Result<NodeResult, UnitError> {
        let value = ctx.config_f64("value").unwrap_or(1.0);
        Ok(NodeResult::success().with_output("out", value))
    }
}

/// `out = in + offset + config.add`; also reports how many upstream nodes it saw
struct Add;

#[async_trait]
impl ProcessingUnit for Add {
    fn module_type(&self) -> &str {
        "test.add"
    }

    fn display_name(&self) -> &str {
        "Add"
    }

    fn inputs(&self) -> Vec<Port> {
        vec![
            Port::input("in", PortType::Number),
            Port::input("offset", PortType::Number).with_default(0.0),
        ]
    }

    fn outputs(&self) -> Vec<Port> {
        vec![
            Port::output("out", PortType::Number),
            Port::output("upstream", PortType::Number),
        ]
    }

    async fn execute(&self, ctx: UnitContext) -> Result<NodeResult, UnitError> {
        let input = ctx.require_input("in")?.as_f64().unwrap_or_default();
        let offset = ctx.require_input("offset")?.as_f64().unwrap_or_default();
        let add = ctx.config_f64("add").unwrap_or_default();
        Ok(NodeResult::success()
            .with_output("out", input + offset + add)
            .with_output("upstream", ctx.upstream.len() as f64))
    }
}

/// Reports an expected failure
struct Fail;

#[async_trait]
impl ProcessingUnit for Fail {
    fn module_type(&self) -> &str {
        "test.fail"
    }

    fn display_name(&self) -> &str {
        "Fail"
    }

    fn inputs(&self) -> Vec<Port> {
        vec![Port::input("in", PortType::Data).optional()]
    }

    fn outputs(&self) -> Vec<Port> {
        vec![Port::output("out", PortType::Number)]
    }

    async fn execute(&self, _ctx: UnitContext) -> Result<NodeResult, UnitError> {
        Ok(NodeResult::failure("table could not be converted"))
    }
}

struct Fault;

#[async_trait]
impl ProcessingUnit for Fault {
    fn module_type(&self) -> &str {
        "test.fault"
    }

    fn display_name(&self) -> &str {
        "Fault"
    }

    async fn execute(&self, _ctx: UnitContext) -> Result<NodeResult, UnitError> {
        Err(UnitError::ExecutionFailed("broken invariant".into()))
    }
}

struct Panic;

#[async_trait]
impl ProcessingUnit for Panic {
    fn module_type(&self) -> &str {
        "test.panic"
    }

    fn display_name(&self) -> &str {
        "Panic"
    }

    async fn execute(&self, _ctx: UnitContext) -> Result<NodeResult, UnitError> {
        panic!("unit blew up");
    }
}

#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// Sleeps for config `ms` while tracking how many sleepers overlap
struct Sleep {
    gauge: Arc<Gauge>,
}

#[async_trait]
impl ProcessingUnit for Sleep {
    fn module_type(&self) -> &str {
        "test.sleep"
    }

    fn display_name(&self) -> &str {
        "Sleep"
    }

    fn inputs(&self) -> Vec<Port> {
        vec![Port::input("in", PortType::Data).optional()]
    }

    fn outputs(&self) -> Vec<Port> {
        vec![Port::output("out", PortType::Number)]
    }

    async fn execute(&self, ctx: UnitContext) -> Result<NodeResult, UnitError> {
        let ms = ctx.config_f64("ms").unwrap_or(10.0);
        let now = self.gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
        Ok(NodeResult::success().with_output("out", ms))
    }
}

/// Requires config `mode`, which an upstream `out` value supplies
struct Strict {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ProcessingUnit for Strict {
    fn module_type(&self) -> &str {
        "test.strict"
    }

    fn display_name(&self) -> &str {
        "Strict"
    }

    fn inputs(&self) -> Vec<Port> {
        vec![Port::input("in", PortType::Data).optional()]
    }

    fn validate_config(&self, config: &Config) -> Result<(), UnitError> {
        match config.get("mode").and_then(|v| v.as_str()) {
            Some(_) => Ok(()),
            None => Err(UnitError::Configuration("mode is required".into())),
        }
    }

    fn on_upstream_changed(&self, _predecessor: &str, outputs: &Outputs, config: &mut Config) {
        if outputs.contains_key("out") {
            config.insert("mode".into(), "auto".into());
        }
    }

    async fn execute(&self, ctx: UnitContext) -> Result<NodeResult, UnitError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mode = ctx.config_str("mode").unwrap_or_default().to_string();
        Ok(NodeResult::success().with_output("mode", mode))
    }
}

struct Typed;

#[async_trait]
impl ProcessingUnit for Typed {
    fn module_type(&self) -> &str {
        "test.typed"
    }

    fn display_name(&self) -> &str {
        "Typed"
    }

    fn inputs(&self) -> Vec<Port> {
        vec![Port::input("text", PortType::String)]
    }

    async fn execute(&self, _ctx: UnitContext) -> Result<NodeResult, UnitError> {
        Ok(NodeResult::success())
    }
}

struct Harness {
    registry: Arc<UnitRegistry>,
    gauge: Arc<Gauge>,
    strict_calls: Arc<AtomicUsize>,
}

fn harness() -> Harness {
    let gauge = Arc::new(Gauge::default());
    let strict_calls = Arc::new(AtomicUsize::new(0));

    let mut builder = UnitRegistry::builder();
    builder
        .register(|| Box::new(Source))
        .unwrap()
        .register(|| Box::new(Add))
        .unwrap()
        .register(|| Box::new(Fail))
        .unwrap()
        .register(|| Box::new(Fault))
        .unwrap()
        .register(|| Box::new(Panic))
        .unwrap()
        .register(|| Box::new(Typed))
        .unwrap();
    let sleep_gauge = gauge.clone();
    builder
        .register(move || {
            Box::new(Sleep {
                gauge: sleep_gauge.clone(),
            })
        })
        .unwrap();
    let calls = strict_calls.clone();
    builder
        .register(move || {
            Box::new(Strict {
                calls: calls.clone(),
            })
        })
        .unwrap();

    Harness {
        registry: Arc::new(builder.build()),
        gauge,
        strict_calls,
    }
}

impl Harness {
    fn coordinator(&self, config: RunConfig) -> RunCoordinator {
        RunCoordinator::new(
            self.registry.clone(),
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(EventBus::new(256)),
            config,
        )
    }

    fn runtime(&self) -> StepRuntime {
        StepRuntime::with_store(
            self.registry.clone(),
            Arc::new(MemoryArtifactStore::new()),
            RuntimeConfig::default(),
        )
    }
}

fn node(id: &str, module_type: &str) -> NodeRecord {
    NodeRecord::new(id, module_type)
}

fn failed_kind(outcome: Option<&NodeOutcome>) -> Option<FailureKind> {
    match outcome {
        Some(NodeOutcome::Failed { kind, .. }) => Some(*kind),
        _ => None,
    }
}

#[tokio::test]
async fn linear_pipeline_routes_outputs_through_ports() {
    let h = harness();
    let mut wf = WorkflowGraph::new("ws", "linear");
    wf.add_node(node("sum", "test.add").with_config("add", 3.0));
    wf.add_node(node("src", "test.source").with_config("value", 2.0));
    wf.add_node(node("mid", "test.add").with_config("add", 3.0));
    wf.connect("src", "out", "mid", "in");
    wf.connect("mid", "out", "sum", "in");

    let record = h.coordinator(RunConfig::default()).execute(&wf).await.unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.order, vec!["src", "mid", "sum"]);
    assert_eq!(record.outputs("mid").unwrap()["out"], Value::Number(5.0));
    assert_eq!(record.outputs("sum").unwrap()["out"], Value::Number(8.0));
    // Only the direct predecessor is visible upstream.
    assert_eq!(record.outputs("sum").unwrap()["upstream"], Value::Number(1.0));
    assert!(record
        .result("sum")
        .unwrap()
        .metadata
        .contains_key("execution_time_ms"));
}

#[tokio::test]
async fn failed_node_skips_downstream_and_keeps_independent_branch() {
    let h = harness();
    let mut wf = WorkflowGraph::new("ws", "load-convert-describe");
    wf.add_node(node("load", "test.source"));
    wf.add_node(node("convert", "test.fail"));
    wf.add_node(node("describe", "test.add"));
    wf.add_node(node("other", "test.source").with_config("value", 7.0));
    wf.add_node(node("other_sum", "test.add"));
    wf.connect("load", "out", "convert", "in");
    wf.connect("convert", "out", "describe", "in");
    wf.connect("other", "out", "other_sum", "in");

    let record = h.coordinator(RunConfig::default()).execute(&wf).await.unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    assert!(record.outcome("load").unwrap().is_success());
    assert_eq!(
        failed_kind(record.outcome("convert")),
        Some(FailureKind::Execution)
    );
    assert_eq!(
        record.outcome("convert").unwrap().reason(),
        Some("table could not be converted")
    );

    let describe = record.outcome("describe").unwrap();
    assert!(describe.is_skipped());
    assert!(describe.reason().unwrap().contains("convert"));

    assert_eq!(record.outputs("other_sum").unwrap()["out"], Value::Number(7.0));
    assert_eq!((record.succeeded(), record.failed(), record.skipped()), (3, 1, 1));
}

#[tokio::test]
async fn rejected_config_fails_without_executing() {
    let h = harness();
    let mut wf = WorkflowGraph::new("ws", "strict");
    wf.add_node(node("strict", "test.strict"));
    wf.add_node(node("after", "test.add"));
    wf.connect("strict", "mode", "after", "in");

    let record = h.coordinator(RunConfig::default()).execute(&wf).await.unwrap();

    assert_eq!(
        failed_kind(record.outcome("strict")),
        Some(FailureKind::Configuration)
    );
    assert!(record.outcome("after").unwrap().is_skipped());
    assert_eq!(h.strict_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn upstream_hook_can_complete_config() {
    let h = harness();
    let mut wf = WorkflowGraph::new("ws", "adapted");
    wf.add_node(node("src", "test.source"));
    wf.add_node(node("strict", "test.strict"));
    wf.connect("src", "out", "strict", "in");

    let record = h.coordinator(RunConfig::default()).execute(&wf).await.unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(
        record.outputs("strict").unwrap()["mode"],
        Value::String("auto".into())
    );
    assert_eq!(h.strict_calls.load(Ordering::SeqCst), 1);
    // The persisted record is untouched.
    assert!(wf.find_node("strict").unwrap().config.is_empty());
}

#[tokio::test]
async fn unknown_module_type_fails_the_node() {
    let h = harness();
    let mut wf = WorkflowGraph::new("ws", "unknown");
    wf.add_node(node("mystery", "test.nonexistent"));
    wf.add_node(node("after", "test.add"));
    wf.connect("mystery", "out", "after", "in");

    let record = h.coordinator(RunConfig::default()).execute(&wf).await.unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(
        failed_kind(record.outcome("mystery")),
        Some(FailureKind::Registry)
    );
    assert!(record.outcome("after").unwrap().is_skipped());
}

#[tokio::test]
async fn missing_or_mistyped_inputs_fail_before_execute() {
    let h = harness();
    let mut wf = WorkflowGraph::new("ws", "inputs");
    wf.add_node(node("lonely", "test.add"));
    wf.add_node(node("src", "test.source"));
    wf.add_node(node("typed", "test.typed"));
    wf.add_node(node("undeclared", "test.add"));
    wf.connect("src", "out", "typed", "text");
    wf.connect("src", "out", "undeclared", "in");
    wf.connect("src", "out", "undeclared", "bogus");

    let record = h.coordinator(RunConfig::default()).execute(&wf).await.unwrap();

    let lonely = record.outcome("lonely").unwrap();
    assert_eq!(failed_kind(Some(lonely)), Some(FailureKind::Input));
    assert!(lonely.reason().unwrap().contains("in"));

    let typed = record.outcome("typed").unwrap();
    assert_eq!(failed_kind(Some(typed)), Some(FailureKind::Input));
    assert!(typed.reason().unwrap().contains("expected string"));

    let undeclared = record.outcome("undeclared").unwrap();
    assert_eq!(failed_kind(Some(undeclared)), Some(FailureKind::Input));
    assert!(undeclared.reason().unwrap().contains("bogus"));
}

#[tokio::test]
async fn undeclared_source_port_fails_the_target() {
    let h = harness();
    let mut wf = WorkflowGraph::new("ws", "source-port");
    wf.add_node(node("src", "test.source"));
    wf.add_node(node("reader", "test.sleep"));
    wf.connect("src", "no_such_output", "reader", "in");

    let record = h.coordinator(RunConfig::default()).execute(&wf).await.unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    assert!(record.outcome("src").unwrap().is_success());
    let reader = record.outcome("reader").unwrap();
    assert_eq!(failed_kind(Some(reader)), Some(FailureKind::Input));
    assert!(reader.reason().unwrap().contains("no_such_output"));
    assert_eq!(h.gauge.peak.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn join_waits_for_every_predecessor() {
    let h = harness();
    let events = Arc::new(EventBus::new(64));
    let mut rx = events.subscribe();
    let coordinator = RunCoordinator::new(
        h.registry.clone(),
        Arc::new(MemoryArtifactStore::new()),
        events,
        RunConfig::default(),
    );

    let mut wf = WorkflowGraph::new("ws", "diamond");
    wf.add_node(node("a", "test.source"));
    wf.add_node(node("slow", "test.sleep").with_config("ms", 60.0));
    wf.add_node(node("quick", "test.sleep").with_config("ms", 5.0));
    wf.add_node(node("join", "test.add"));
    wf.connect("a", "out", "slow", "in");
    wf.connect("a", "out", "quick", "in");
    wf.connect("slow", "out", "join", "in");
    wf.connect("quick", "out", "join", "offset");

    let record = coordinator.execute(&wf).await.unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(record.order.last().map(String::as_str), Some("join"));
    let joined = record.outputs("join").unwrap();
    assert_eq!(joined["out"], Value::Number(65.0));
    assert_eq!(joined["upstream"], Value::Number(2.0));

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            ExecutionEvent::NodeStarted { node_id, .. } => seen.push(format!("start {}", node_id)),
            ExecutionEvent::NodeCompleted { node_id, .. } => seen.push(format!("done {}", node_id)),
            _ => {}
        }
    }
    let at = |entry: &str| seen.iter().position(|e| e == entry).unwrap();
    assert!(at("done slow") < at("start join"));
    assert!(at("done quick") < at("start join"));
    assert_eq!(seen.last().map(String::as_str), Some("done join"));
}

#[tokio::test]
async fn faults_and_panics_are_contained() {
    let h = harness();
    let mut wf = WorkflowGraph::new("ws", "faults");
    wf.add_node(node("fault", "test.fault"));
    wf.add_node(node("panic", "test.panic"));
    wf.add_node(node("fine", "test.source"));

    let record = h.coordinator(RunConfig::default()).execute(&wf).await.unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(failed_kind(record.outcome("fault")), Some(FailureKind::Fault));
    assert!(record
        .outcome("fault")
        .unwrap()
        .reason()
        .unwrap()
        .contains("broken invariant"));
    assert_eq!(failed_kind(record.outcome("panic")), Some(FailureKind::Fault));
    assert_eq!(
        record.outcome("panic").unwrap().reason(),
        Some("unit panicked")
    );
    assert!(record.outcome("fine").unwrap().is_success());
}

#[tokio::test]
async fn cycle_is_rejected_before_any_node_runs() {
    let h = harness();
    let events = Arc::new(EventBus::new(16));
    let mut rx = events.subscribe();
    let coordinator = RunCoordinator::new(
        h.registry.clone(),
        Arc::new(MemoryArtifactStore::new()),
        events,
        RunConfig::default(),
    );

    let mut wf = WorkflowGraph::new("ws", "cyclic");
    wf.add_node(node("a", "test.sleep"));
    wf.add_node(node("b", "test.sleep"));
    wf.connect("a", "out", "b", "in");
    wf.connect("b", "out", "a", "in");

    let err = coordinator.execute(&wf).await.unwrap_err();
    assert!(matches!(err, FlowError::Graph(GraphError::Cycle { .. })));
    assert_eq!(h.gauge.peak.load(Ordering::SeqCst), 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn parallelism_is_bounded() {
    let h = harness();
    let mut wf = WorkflowGraph::new("ws", "fan-out");
    for i in 0..6 {
        wf.add_node(node(&format!("s{}", i), "test.sleep").with_config("ms", 30.0));
    }

    let config = RunConfig {
        max_parallel: 2,
        ..RunConfig::default()
    };
    let record = h.coordinator(config).execute(&wf).await.unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert_eq!(h.gauge.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn workflow_settings_override_parallelism() {
    let h = harness();
    let mut wf = WorkflowGraph::new("ws", "serial");
    wf.settings.max_parallel_nodes = Some(1);
    for i in 0..3 {
        wf.add_node(node(&format!("s{}", i), "test.sleep").with_config("ms", 10.0));
    }

    h.coordinator(RunConfig::default()).execute(&wf).await.unwrap();
    assert_eq!(h.gauge.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancellation_lets_running_nodes_finish() {
    let h = harness();
    let runtime = h.runtime();

    let mut wf = WorkflowGraph::new("ws", "cancel");
    wf.add_node(node("first", "test.sleep").with_config("ms", 100.0));
    wf.add_node(node("second", "test.sleep"));
    wf.add_node(node("third", "test.sleep"));
    wf.connect("first", "out", "second", "in");
    wf.connect("second", "out", "third", "in");

    let handle = runtime.spawn(wf);
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.cancel();
    let record = handle.join().await.unwrap();

    assert_eq!(record.status, RunStatus::Cancelled);
    assert!(record.outcome("first").unwrap().is_success());
    for id in ["second", "third"] {
        assert_eq!(record.outcome(id).unwrap().reason(), Some("run cancelled"));
    }
}

#[tokio::test]
async fn cancelling_with_nothing_left_to_start_still_succeeds() {
    let h = harness();
    let runtime = h.runtime();

    let mut wf = WorkflowGraph::new("ws", "late-cancel");
    wf.add_node(node("only", "test.sleep").with_config("ms", 60.0));

    let handle = runtime.spawn(wf);
    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.cancel();
    let record = handle.join().await.unwrap();

    assert_eq!(record.status, RunStatus::Succeeded);
    assert!(record.outcome("only").unwrap().is_success());
    assert_eq!(record.skipped(), 0);
}

#[tokio::test]
async fn deadline_stops_dispatching() {
    let h = harness();
    let mut wf = WorkflowGraph::new("ws", "deadline");
    wf.settings.max_execution_time_ms = Some(30);
    wf.add_node(node("first", "test.sleep").with_config("ms", 80.0));
    wf.add_node(node("second", "test.sleep"));
    wf.connect("first", "out", "second", "in");

    let record = h.coordinator(RunConfig::default()).execute(&wf).await.unwrap();

    assert_eq!(record.status, RunStatus::TimedOut);
    assert!(record.outcome("first").unwrap().is_success());
    assert_eq!(
        record.outcome("second").unwrap().reason(),
        Some("run deadline passed")
    );
}

#[tokio::test]
async fn node_timeout_fails_slow_node() {
    let h = harness();
    let mut wf = WorkflowGraph::new("ws", "timeout");
    wf.add_node(node("slow", "test.sleep").with_config("ms", 500.0));

    let config = RunConfig {
        node_timeout: Some(Duration::from_millis(20)),
        ..RunConfig::default()
    };
    let record = h.coordinator(config).execute(&wf).await.unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(failed_kind(record.outcome("slow")), Some(FailureKind::Timeout));
}

#[tokio::test]
async fn abort_policy_stops_the_whole_run() {
    let h = harness();
    let mut wf = WorkflowGraph::new("ws", "abort");
    wf.settings.on_error = Some(FailurePolicy::AbortRun);
    wf.add_node(node("bad", "test.fail"));
    wf.add_node(node("slow", "test.sleep").with_config("ms", 50.0));
    wf.add_node(node("after_slow", "test.sleep"));
    wf.connect("slow", "out", "after_slow", "in");

    let record = h.coordinator(RunConfig::default()).execute(&wf).await.unwrap();

    assert_eq!(record.status, RunStatus::Failed);
    assert!(record.outcome("slow").unwrap().is_success());
    assert!(record
        .outcome("after_slow")
        .unwrap()
        .reason()
        .unwrap()
        .contains("aborted"));
}

#[tokio::test]
async fn events_bracket_the_run() {
    let h = harness();
    let runtime = h.runtime();
    let mut rx = runtime.subscribe_events();

    let mut wf = WorkflowGraph::new("ws", "events").with_id("wf-events");
    wf.add_node(node("src", "test.source"));
    wf.add_node(node("sum", "test.add"));
    wf.connect("src", "out", "sum", "in");
    runtime.register_workflow(wf).await;

    let record = runtime.execute_workflow("wf-events").await.unwrap();
    assert!(record.status.is_success());

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert!(matches!(
        events.first(),
        Some(ExecutionEvent::RunStarted { total_nodes: 2, .. })
    ));
    assert!(matches!(
        events.last(),
        Some(ExecutionEvent::RunCompleted {
            status: RunStatus::Succeeded,
            ..
        })
    ));
    let completed = events
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::NodeCompleted { .. }))
        .count();
    assert_eq!(completed, 2);
}
