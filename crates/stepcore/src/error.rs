use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Structural problems with a workflow graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Kahn's algorithm could not order every node.
    #[error("Cyclic dependency detected; {} node(s) could not be ordered: {}", unresolved.len(), unresolved.join(", "))]
    Cycle { unresolved: Vec<String> },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Invalid connection {connection}: {reason}")]
    InvalidConnection { connection: String, reason: String },
}

/// Failures a processing unit reports while validating or executing.
#[derive(Error, Debug, Clone)]
pub enum UnitError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage failure: {0}")]
    Storage(#[from] StoreError),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Artifact already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid storage key component '{component}': {reason}")]
    InvalidKey { component: String, reason: String },

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Module type already registered: {0}")]
    DuplicateModuleType(String),

    #[error("Unknown module type: {0}")]
    UnknownModuleType(String),
}
