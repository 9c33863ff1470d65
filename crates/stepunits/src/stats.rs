use crate::table::{ColumnType, Table};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use stepcore::schema::{parse_config, schema_for};
use stepcore::{
    ArtifactData, ArtifactKind, ArtifactMetadata, Config, NodeResult, Port, PortType,
    ProcessingUnit, UnitContext, UnitError, Value,
};

/// Summary of one numeric column. Aggregates are absent when the column has
/// no values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnStats {
    pub count: usize,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ColumnStats {
    pub fn from_values(values: impl Iterator<Item = f64>) -> Self {
        let mut count = 0;
        let mut sum = 0.0;
        let mut min: Option<f64> = None;
        let mut max: Option<f64> = None;
        for v in values {
            count += 1;
            sum += v;
            min = Some(min.map_or(v, |m| m.min(v)));
            max = Some(max.map_or(v, |m| m.max(v)));
        }
        Self {
            count,
            mean: (count > 0).then(|| sum / count as f64),
            min,
            max,
        }
    }
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(default)]
struct DescribeConfig {
    /// Numeric columns to describe; all numeric columns when unset
    columns: Option<Vec<String>>,
    /// Also store the summary as an artifact
    save: bool,
}

/// Describes the numeric columns of a stored table
pub struct StatsDescribeUnit;

impl StatsDescribeUnit {
    fn selected(table: &Table, config: &DescribeConfig) -> Result<Vec<usize>, UnitError> {
        let Some(names) = &config.columns else {
            return Ok(table
                .columns
                .iter()
                .enumerate()
                .filter(|(_, c)| c.column_type == ColumnType::Number)
                .map(|(i, _)| i)
                .collect());
        };

        names
            .iter()
            .map(|name| {
                let index = table.column_index(name).ok_or_else(|| {
                    UnitError::ExecutionFailed(format!("table has no column '{}'", name))
                })?;
                if table.columns[index].column_type != ColumnType::Number {
                    return Err(UnitError::ExecutionFailed(format!(
                        "column '{}' is not numeric",
                        name
                    )));
                }
                Ok(index)
            })
            .collect()
    }

    async fn describe(&self, ctx: &UnitContext) -> Result<NodeResult, UnitError> {
        let config: DescribeConfig = ctx.typed_config()?;
        let key = ctx.require_str("table_ref")?;
        let artifact = ctx.load_artifact(key).await?;
        let json = artifact.data.as_structured().ok_or_else(|| {
            UnitError::ExecutionFailed(format!("artifact {} is not structured", key))
        })?;
        let table = Table::from_json(json)?;

        let columns: BTreeMap<&str, ColumnStats> = Self::selected(&table, &config)?
            .into_iter()
            .map(|i| {
                (
                    table.columns[i].name.as_str(),
                    ColumnStats::from_values(table.numbers(i)),
                )
            })
            .collect();

        let summary = json!({
            "source": key,
            "row_count": table.rows.len(),
            "columns": columns,
        });
        ctx.events.info(format!(
            "Described {} numeric column(s) over {} rows",
            columns.len(),
            table.rows.len()
        ));

        let mut result = NodeResult::success().with_output("stats", Value::Json(summary.clone()));

        if config.save {
            let mut metadata = ArtifactMetadata::new();
            metadata.insert("source".into(), key.into());
            let stats_key = ctx
                .save_artifact(
                    "stats.json",
                    ArtifactKind::Statistics,
                    ArtifactData::Structured(summary),
                    metadata,
                )
                .await?;
            ctx.events.artifact("stats_ref", stats_key.clone());
            result = result.with_output("stats_ref", stats_key);
        }

        Ok(result)
    }
}

#[async_trait]
impl ProcessingUnit for StatsDescribeUnit {
    fn module_type(&self) -> &str {
        "stats.describe"
    }

    fn display_name(&self) -> &str {
        "Describe"
    }

    fn description(&self) -> &str {
        "Count, mean, min and max of numeric table columns"
    }

    fn inputs(&self) -> Vec<Port> {
        vec![Port::input("table_ref", PortType::File).with_label("Table")]
    }

    fn outputs(&self) -> Vec<Port> {
        vec![
            Port::output("stats", PortType::Structured),
            Port::output("stats_ref", PortType::File),
        ]
    }

    fn config_schema(&self) -> serde_json::Value {
        schema_for::<DescribeConfig>()
    }

    fn validate_config(&self, config: &Config) -> Result<(), UnitError> {
        parse_config::<DescribeConfig>(config).map(|_| ())
    }

    async fn execute(&self, ctx: UnitContext) -> Result<NodeResult, UnitError> {
        Ok(self
            .describe(&ctx)
            .await
            .unwrap_or_else(NodeResult::from_error))
    }
}
