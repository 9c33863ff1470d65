use crate::{UnitError, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Output port name to value.
pub type Outputs = HashMap<String, Value>;

/// Outcome of running a unit once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub success: bool,
    #[serde(default)]
    pub outputs: Outputs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl NodeResult {
    pub fn success() -> Self {
        Self {
            success: true,
            outputs: HashMap::new(),
            error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            outputs: HashMap::new(),
            error: Some(error.into()),
            metadata: HashMap::new(),
        }
    }

    /// Folds an expected unit failure into an unsuccessful result.
    pub fn from_error(error: UnitError) -> Self {
        Self::failure(error.to_string())
    }

    pub fn with_output(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(port.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn output(&self, port: &str) -> Option<&Value> {
        self.outputs.get(port)
    }
}

impl Default for NodeResult {
    fn default() -> Self {
        Self::success()
    }
}

impl From<UnitError> for NodeResult {
    fn from(error: UnitError) -> Self {
        Self::from_error(error)
    }
}

/// Overall status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Succeeded)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::TimedOut => "timed out",
        };
        f.write_str(s)
    }
}
