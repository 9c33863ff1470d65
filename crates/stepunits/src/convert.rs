use crate::table::{RawTable, Table};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use stepcore::schema::{parse_config, schema_for};
use stepcore::store::validate_component;
use stepcore::{
    ArtifactData, ArtifactKind, ArtifactMetadata, Config, NodeResult, Port, PortType,
    ProcessingUnit, UnitContext, UnitError,
};

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(default)]
struct ConvertConfig {
    /// Artifact file name
    filename: String,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            filename: "table.json".to_string(),
        }
    }
}

/// Types raw rows and stores them as a table artifact
pub struct TableConvertUnit;

impl TableConvertUnit {
    async fn convert(&self, ctx: &UnitContext) -> Result<NodeResult, UnitError> {
        let config: ConvertConfig = ctx.typed_config()?;
        let raw = RawTable::from_value(ctx.require_input("data")?)?;
        let table = Table::from_raw(&raw);

        let json = serde_json::to_value(&table)
            .map_err(|e| UnitError::ExecutionFailed(format!("failed to encode table: {}", e)))?;

        let mut metadata = ArtifactMetadata::new();
        metadata.insert("rows".into(), table.rows.len().into());
        metadata.insert(
            "columns".into(),
            table
                .columns
                .iter()
                .map(|c| c.name.clone())
                .collect::<Vec<_>>()
                .into(),
        );

        let key = ctx
            .save_artifact(&config.filename, ArtifactKind::Table, ArtifactData::Structured(json), metadata)
            .await?;
        ctx.events.artifact("table_ref", key.clone());
        tracing::info!("Stored table artifact {} ({} rows)", key, table.rows.len());

        Ok(NodeResult::success()
            .with_output("table_ref", key)
            .with_output("row_count", table.rows.len() as f64))
    }
}

#[async_trait]
impl ProcessingUnit for TableConvertUnit {
    fn module_type(&self) -> &str {
        "table.convert"
    }

    fn display_name(&self) -> &str {
        "Convert to Table"
    }

    fn description(&self) -> &str {
        "Infer column types and save the rows as a table artifact"
    }

    fn inputs(&self) -> Vec<Port> {
        vec![Port::input("data", PortType::Data)]
    }

    fn outputs(&self) -> Vec<Port> {
        vec![
            Port::output("table_ref", PortType::File).with_description("Storage key of the table"),
            Port::output("row_count", PortType::Number),
        ]
    }

    fn config_schema(&self) -> serde_json::Value {
        schema_for::<ConvertConfig>()
    }

    fn validate_config(&self, config: &Config) -> Result<(), UnitError> {
        let config: ConvertConfig = parse_config(config)?;
        validate_component(&config.filename).map_err(|e| UnitError::Configuration(e.to_string()))
    }

    async fn execute(&self, ctx: UnitContext) -> Result<NodeResult, UnitError> {
        Ok(self
            .convert(&ctx)
            .await
            .unwrap_or_else(NodeResult::from_error))
    }
}
