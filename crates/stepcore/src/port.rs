use crate::Value;
use serde::{Deserialize, Serialize};

/// Semantic type of a unit port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortType {
    /// Tabular or otherwise opaque dataset, inline or by storage key.
    Data,
    /// Artifact storage key or raw file content.
    File,
    String,
    Number,
    Boolean,
    Structured,
}

impl PortType {
    /// Whether `value` is an acceptable payload for a port of this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            PortType::Data => !value.is_null(),
            PortType::File => matches!(value, Value::String(_) | Value::Bytes(_)),
            PortType::String => matches!(value, Value::String(_)),
            PortType::Number => matches!(value, Value::Number(_)),
            PortType::Boolean => matches!(value, Value::Bool(_)),
            PortType::Structured => {
                matches!(value, Value::Json(_) | Value::Array(_) | Value::Object(_))
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PortType::Data => "data",
            PortType::File => "file",
            PortType::String => "string",
            PortType::Number => "number",
            PortType::Boolean => "boolean",
            PortType::Structured => "structured",
        }
    }
}

impl std::fmt::Display for PortType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, typed input or output slot on a processing unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    #[serde(rename = "type")]
    pub port_type: PortType,
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl Port {
    /// A required input port. The label defaults to the port name.
    pub fn input(name: impl Into<String>, port_type: PortType) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            port_type,
            description: String::new(),
            required: true,
            default: None,
        }
    }

    pub fn output(name: impl Into<String>, port_type: PortType) -> Self {
        Self {
            required: false,
            ..Self::input(name, port_type)
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Sets a default value; a port with a default is never required.
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self.required = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_port_accepts_keys_and_bytes() {
        assert!(PortType::File.accepts(&Value::from("ws/wf/ex/node/out.json")));
        assert!(PortType::File.accepts(&Value::Bytes(vec![1, 2])));
        assert!(!PortType::File.accepts(&Value::Number(1.0)));
    }

    #[test]
    fn data_port_rejects_only_null() {
        assert!(PortType::Data.accepts(&Value::Array(vec![])));
        assert!(PortType::Data.accepts(&Value::from("key")));
        assert!(!PortType::Data.accepts(&Value::Null));
    }

    #[test]
    fn default_makes_port_optional() {
        let port = Port::input("delimiter", PortType::String).with_default(",");
        assert!(!port.required);
        assert_eq!(port.default, Some(Value::from(",")));
    }
}
