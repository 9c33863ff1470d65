use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stepcore::{ExecutionEvent, NodeEvent, NodeRecord, WorkflowGraph};
use stepruntime::{validate_workflow, NodeOutcome, RuntimeConfig, Severity, StepRuntime};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "step")]
#[command(about = "Step workflow engine CLI", long_about = None)]
struct Cli {
    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Runtime configuration JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Store artifacts under this directory instead of in memory
        #[arg(short, long)]
        artifacts: Option<PathBuf>,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// Print the module catalog as JSON
    Modules,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            file,
            config,
            artifacts,
        } => run_workflow(&file, config.as_deref(), artifacts).await,
        Commands::Validate { file } => check_workflow(&file),
        Commands::Modules => list_modules(),
        Commands::Init { output } => create_example_workflow(&output),
    }
}

fn load_workflow(file: &Path) -> Result<WorkflowGraph> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    serde_json::from_str(&json).with_context(|| format!("{} is not a workflow", file.display()))
}

async fn run_workflow(
    file: &Path,
    config: Option<&Path>,
    artifacts: Option<PathBuf>,
) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());
    let workflow = load_workflow(file)?;

    println!("📋 Workflow: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());
    println!();

    let mut runtime_config = match config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    if artifacts.is_some() {
        runtime_config.artifact_root = artifacts;
    }

    let registry = Arc::new(stepunits::standard_registry()?);
    let runtime = StepRuntime::new(registry, runtime_config);

    // Subscribe before spawning so no event is missed
    let mut events = runtime.subscribe_events();
    let handle = runtime.spawn(workflow);
    let execution_id = handle.execution_id;

    let event_task = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Event printer fell behind; {} events dropped", missed);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if event.execution_id() != execution_id {
                continue;
            }
            if print_event(event) {
                break;
            }
        }
    });

    let record = handle.join().await?;
    let _ = event_task.await;

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", record.execution_id);
    println!("   Status: {}", record.status);
    println!(
        "   Succeeded: {}  Failed: {}  Skipped: {}",
        record.succeeded(),
        record.failed(),
        record.skipped()
    );

    for (node_id, outcome) in record.iter_ordered() {
        match outcome {
            NodeOutcome::Succeeded { result, .. } if !result.outputs.is_empty() => {
                println!("   Node {}:", node_id);
                for (port, value) in &result.outputs {
                    println!("     {}: {}", port, value.to_json());
                }
            }
            NodeOutcome::Failed { kind, reason, .. } => {
                println!("   Node {} failed ({:?}): {}", node_id, kind, reason);
            }
            NodeOutcome::Skipped { reason } => {
                println!("   Node {} skipped: {}", node_id, reason);
            }
            _ => {}
        }
    }

    if !record.status.is_success() {
        bail!("workflow run {}", record.status);
    }
    Ok(())
}

/// Print one event; returns true once the run has completed.
fn print_event(event: ExecutionEvent) -> bool {
    match event {
        ExecutionEvent::RunStarted { total_nodes, .. } => {
            println!("▶️  Workflow started ({} nodes)", total_nodes);
        }
        ExecutionEvent::NodeStarted {
            node_id,
            module_type,
            ..
        } => {
            println!("  ⚡ Starting node: {} ({})", node_id, module_type);
        }
        ExecutionEvent::NodeCompleted {
            node_id,
            duration_ms,
            ..
        } => {
            println!("  ✅ Node {} completed in {}ms", node_id, duration_ms);
        }
        ExecutionEvent::NodeFailed { node_id, error, .. } => {
            println!("  ❌ Node {} failed: {}", node_id, error);
        }
        ExecutionEvent::NodeSkipped {
            node_id, reason, ..
        } => {
            println!("  ⏭️  Node {} skipped: {}", node_id, reason);
        }
        ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
            NodeEvent::Info { message } => println!("     ℹ️  [{}] {}", node_id, message),
            NodeEvent::Warning { message } => println!("     ⚠️  [{}] {}", node_id, message),
            NodeEvent::Progress { percent, message } => match message {
                Some(msg) => println!("     📊 [{}] {}% - {}", node_id, percent, msg),
                None => println!("     📊 [{}] {}%", node_id, percent),
            },
            NodeEvent::Artifact { port, key } => {
                println!("     💾 [{}] {} -> {}", node_id, port, key)
            }
        },
        ExecutionEvent::RunCompleted {
            status,
            duration_ms,
            ..
        } => {
            if status.is_success() {
                println!("✨ Workflow completed successfully in {}ms", duration_ms);
            } else {
                println!("💥 Workflow {} after {}ms", status, duration_ms);
            }
            return true;
        }
    }
    false
}

fn check_workflow(file: &Path) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());
    let workflow = load_workflow(file)?;
    let registry = stepunits::standard_registry()?;
    let report = validate_workflow(&workflow, &registry);

    for issue in &report.issues {
        let marker = match issue.severity {
            Severity::Error => "❌",
            Severity::Warning => "⚠️ ",
        };
        match &issue.subject {
            Some(subject) => println!("   {} [{}] {}", marker, subject, issue.message),
            None => println!("   {} {}", marker, issue.message),
        }
    }

    if !report.is_valid() {
        bail!("{} has {} error(s)", file.display(), report.errors().count());
    }

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());
    Ok(())
}

fn list_modules() -> Result<()> {
    let registry = stepunits::standard_registry()?;
    println!("{}", serde_json::to_string_pretty(&registry.list_modules())?);
    Ok(())
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let mut workflow = WorkflowGraph::new("default", "Describe a CSV");
    workflow.description = Some("Loads inline CSV, types it and summarises numeric columns".into());

    let load = workflow.add_node(
        NodeRecord::new("load", "data.load_csv")
            .with_name("Load CSV")
            .with_config("content", "city,population,area\nOslo,709000,454\nBergen,291000,465\n")
            .with_position(100.0, 100.0),
    );
    let convert = workflow.add_node(
        NodeRecord::new("convert", "table.convert")
            .with_name("Convert to Table")
            .with_position(300.0, 100.0),
    );
    let describe = workflow.add_node(
        NodeRecord::new("describe", "stats.describe")
            .with_name("Describe")
            .with_position(500.0, 100.0),
    );
    let log = workflow.add_node(
        NodeRecord::new("log", "debug.log")
            .with_name("Log Summary")
            .with_position(700.0, 100.0),
    );

    workflow.connect(load, "data", convert.clone(), "data");
    workflow.connect(convert, "table_ref", describe.clone(), "table_ref");
    workflow.connect(describe, "stats", log, "message");

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  step run --file {}", output.display());
    Ok(())
}
