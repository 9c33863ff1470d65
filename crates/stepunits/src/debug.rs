use async_trait::async_trait;
use stepcore::{NodeResult, Port, PortType, ProcessingUnit, UnitContext, UnitError, Value};

/// Simple debug unit that logs its inputs
pub struct DebugLogUnit;

#[async_trait]
impl ProcessingUnit for DebugLogUnit {
    fn module_type(&self) -> &str {
        "debug.log"
    }

    fn display_name(&self) -> &str {
        "Debug Log"
    }

    fn description(&self) -> &str {
        "Logs input values for debugging"
    }

    fn inputs(&self) -> Vec<Port> {
        vec![Port::input("message", PortType::Data).with_default("(no message)")]
    }

    fn outputs(&self) -> Vec<Port> {
        vec![Port::output("message", PortType::Data)]
    }

    async fn execute(&self, ctx: UnitContext) -> Result<NodeResult, UnitError> {
        let message = ctx
            .inputs
            .get("message")
            .cloned()
            .unwrap_or_else(|| Value::from("(no message)"));

        let rendered = match &message {
            Value::String(s) => s.clone(),
            other => other.to_json().to_string(),
        };
        tracing::info!(node_id = %ctx.scope.node_id, "DEBUG: {}", rendered);
        ctx.events.info(format!("DEBUG: {}", rendered));

        // Upstream outputs too, for visibility
        for (predecessor, outputs) in ctx.upstream.iter() {
            for (port, value) in outputs {
                ctx.events
                    .info(format!("  {}.{}: {}", predecessor, port, value.to_json()));
            }
        }

        Ok(NodeResult::success().with_output("message", message))
    }
}
