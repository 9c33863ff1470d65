//! Core abstractions for the step engine
//!
//! This crate provides the fundamental types and traits that all other
//! components depend on: the workflow record model, port and value types,
//! the processing unit contract and the artifact store interface.

mod error;
pub mod events;
mod port;
mod result;
pub mod schema;
pub mod store;
mod unit;
mod value;
mod workflow;

pub use error::{FlowError, GraphError, RegistryError, StoreError, UnitError};
pub use events::*;
pub use port::{Port, PortType};
pub use result::{NodeResult, Outputs, RunStatus};
pub use store::{
    Artifact, ArtifactData, ArtifactKey, ArtifactKind, ArtifactMetadata, ArtifactRequest,
    ArtifactStore, StorageKey,
};
pub use unit::{ExecutionScope, ModuleDescriptor, ProcessingUnit, UnitContext, UpstreamContext};
pub use value::Value;
pub use workflow::{
    Config, ConnectionId, ConnectionRecord, FailurePolicy, NodeId, NodeRecord, Position,
    WorkflowGraph, WorkflowId, WorkflowSettings, WorkspaceId,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
