//! Static checks run before a workflow is executed or saved.

use crate::graph::GraphManager;
use crate::registry::UnitRegistry;
use serde::Serialize;
use std::collections::HashSet;
use stepcore::WorkflowGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// The run would fail or skip nodes because of this
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    /// Node or connection id the issue is about
    pub subject: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn error(subject: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            subject: subject.map(str::to_string),
            message: message.into(),
        }
    }

    fn warning(subject: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            subject: subject.map(str::to_string),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// True when no issue is an error
    pub fn is_valid(&self) -> bool {
        self.errors().next().is_none()
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }
}

/// Check a workflow's structure against the registered units.
pub fn validate_workflow(workflow: &WorkflowGraph, registry: &UnitRegistry) -> ValidationReport {
    let mut issues = Vec::new();
    let graph = GraphManager::from_workflow(workflow);

    let mut seen = HashSet::new();
    for node in &workflow.nodes {
        if !seen.insert(node.id.as_str()) {
            issues.push(ValidationIssue::warning(
                Some(node.id.as_str()),
                "duplicate node id; only the first record is used",
            ));
        }
    }

    if let Err(e) = graph.topological_order() {
        issues.push(ValidationIssue::error(None, e.to_string()));
    }

    for conn in graph.dropped_connections() {
        issues.push(ValidationIssue::warning(
            Some(conn.id.as_str()),
            format!(
                "connection {} -> {} references a missing node and is ignored",
                conn.source_node_id, conn.target_node_id
            ),
        ));
    }

    let mut checked = HashSet::new();
    for node in &workflow.nodes {
        if !checked.insert(node.id.as_str()) {
            continue;
        }
        let Some(descriptor) = registry.descriptor(&node.module_type) else {
            issues.push(ValidationIssue::error(
                Some(node.id.as_str()),
                format!("unknown module type '{}'", node.module_type),
            ));
            continue;
        };

        let inbound = graph.connections_to(&node.id);
        for conn in &inbound {
            if descriptor.input(&conn.target_port).is_none() {
                issues.push(ValidationIssue::error(
                    Some(conn.id.as_str()),
                    format!(
                        "'{}' has no input port '{}'",
                        node.module_type, conn.target_port
                    ),
                ));
            }
        }
        for port in &descriptor.inputs {
            let connected = inbound.iter().any(|c| c.target_port == port.name);
            if port.required && port.default.is_none() && !connected {
                issues.push(ValidationIssue::error(
                    Some(node.id.as_str()),
                    format!("required input '{}' is not connected", port.name),
                ));
            }
        }

        for conn in graph.connections_from(&node.id) {
            if descriptor.output(&conn.source_port).is_none() {
                issues.push(ValidationIssue::error(
                    Some(conn.id.as_str()),
                    format!(
                        "'{}' has no output port '{}'",
                        node.module_type, conn.source_port
                    ),
                ));
            }
        }
    }

    ValidationReport { issues }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use stepcore::{
        ConnectionRecord, NodeRecord, NodeResult, Port, PortType, ProcessingUnit, UnitContext,
        UnitError,
    };

    struct Pass;

    #[async_trait]
    impl ProcessingUnit for Pass {
        fn module_type(&self) -> &str {
            "test.pass"
        }

        fn display_name(&self) -> &str {
            "Pass"
        }

        fn inputs(&self) -> Vec<Port> {
            vec![Port::input("in", PortType::Data).optional()]
        }

        fn outputs(&self) -> Vec<Port> {
            vec![Port::output("out", PortType::Data)]
        }

        async fn execute(&self, _ctx: UnitContext) -> Result<NodeResult, UnitError> {
            Ok(NodeResult::success())
        }
    }

    fn registry() -> UnitRegistry {
        let mut builder = UnitRegistry::builder();
        builder.register(|| Box::new(Pass)).unwrap();
        builder.build()
    }

    fn workflow() -> WorkflowGraph {
        let mut wf = WorkflowGraph::new("ws", "checks");
        wf.add_node(NodeRecord::new("a", "test.pass"));
        wf.add_node(NodeRecord::new("b", "test.pass"));
        wf.connect("a", "out", "b", "in");
        wf
    }

    #[test]
    fn clean_workflow_has_no_issues() {
        let report = validate_workflow(&workflow(), &registry());
        assert!(report.is_valid());
        assert!(report.issues.is_empty());
    }

    #[test]
    fn reports_unknown_module_and_bad_ports() {
        let mut wf = workflow();
        wf.add_node(NodeRecord::new("c", "test.missing"));
        wf.connect("b", "nope", "a", "in");
        wf.connect("a", "out", "b", "bogus");

        let report = validate_workflow(&wf, &registry());
        assert!(!report.is_valid());
        let messages: Vec<&str> = report.errors().map(|i| i.message.as_str()).collect();
        assert!(messages.iter().any(|m| m.contains("unknown module type 'test.missing'")));
        assert!(messages.iter().any(|m| m.contains("no output port 'nope'")));
        assert!(messages.iter().any(|m| m.contains("no input port 'bogus'")));
        assert!(messages.iter().any(|m| m.contains("Cyclic dependency")));
    }

    #[test]
    fn dropped_connections_and_duplicates_are_warnings() {
        let mut wf = workflow();
        wf.connections.push(ConnectionRecord {
            id: "stale".into(),
            source_node_id: "gone".into(),
            target_node_id: "b".into(),
            source_port: "out".into(),
            target_port: "in".into(),
        });
        wf.nodes.push(NodeRecord::new("a", "test.pass"));

        let report = validate_workflow(&wf, &registry());
        assert!(report.is_valid());
        let subjects: Vec<_> = report
            .warnings()
            .filter_map(|i| i.subject.as_deref())
            .collect();
        assert_eq!(subjects, vec!["a", "stale"]);
    }
}
