use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use stepcore::schema::{parse_config, schema_for};
use stepcore::{Config, NodeResult, Port, PortType, ProcessingUnit, UnitContext, UnitError};
use tokio::time::{sleep, Duration};

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(default)]
struct DelayConfig {
    /// Milliseconds to wait
    delay_ms: u64,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self { delay_ms: 1000 }
    }
}

/// Delay execution for a specified duration
pub struct DelayUnit;

impl DelayUnit {
    async fn delay(&self, ctx: &UnitContext) -> Result<NodeResult, UnitError> {
        let DelayConfig { delay_ms } = ctx.typed_config()?;

        ctx.events.info(format!("Delaying for {}ms", delay_ms));
        sleep(Duration::from_millis(delay_ms)).await;

        // Pass the input through unchanged
        let mut result = NodeResult::success().with_metadata("delay_ms", delay_ms as f64);
        if let Some(value) = ctx.inputs.get("value") {
            result = result.with_output("value", value.clone());
        }
        Ok(result)
    }
}

#[async_trait]
impl ProcessingUnit for DelayUnit {
    fn module_type(&self) -> &str {
        "time.delay"
    }

    fn display_name(&self) -> &str {
        "Delay"
    }

    fn description(&self) -> &str {
        "Delay execution for specified milliseconds"
    }

    fn inputs(&self) -> Vec<Port> {
        vec![Port::input("value", PortType::Data).optional()]
    }

    fn outputs(&self) -> Vec<Port> {
        vec![Port::output("value", PortType::Data)]
    }

    fn config_schema(&self) -> serde_json::Value {
        schema_for::<DelayConfig>()
    }

    fn validate_config(&self, config: &Config) -> Result<(), UnitError> {
        parse_config::<DelayConfig>(config).map(|_| ())
    }

    async fn execute(&self, ctx: UnitContext) -> Result<NodeResult, UnitError> {
        Ok(self
            .delay(&ctx)
            .await
            .unwrap_or_else(NodeResult::from_error))
    }
}
