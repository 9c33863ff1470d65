//! Workflow execution runtime
//!
//! This crate provides the engine that runs workflows: graph analysis, the
//! unit registry, bounded-parallel DAG scheduling and artifact stores.

mod executor;
mod graph;
mod record;
mod registry;
mod runtime;
pub mod store;
mod validation;

pub use executor::{RunConfig, RunCoordinator};
pub use graph::{GraphManager, NodeContext, PortMapping};
pub use record::{ExecutionRecord, FailureKind, NodeOutcome};
pub use registry::{UnitConstructor, UnitRegistry, UnitRegistryBuilder};
pub use runtime::{RunHandle, RuntimeConfig, StepRuntime};
pub use store::{LocalArtifactStore, MemoryArtifactStore};
pub use validation::{validate_workflow, Severity, ValidationIssue, ValidationReport};
