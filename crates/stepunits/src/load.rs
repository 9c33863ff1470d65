use crate::table::RawTable;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use std::path::{Component, Path};
use stepcore::schema::{parse_config, schema_for};
use stepcore::{
    ArtifactData, Config, NodeResult, Port, PortType, ProcessingUnit, UnitContext, UnitError,
    Value,
};

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(default)]
struct LoadCsvConfig {
    /// Inline CSV text
    content: Option<String>,
    /// CSV file relative to the workspace directory
    path: Option<String>,
    /// Single-character field delimiter
    delimiter: String,
    /// First row holds column names
    has_headers: bool,
}

impl Default for LoadCsvConfig {
    fn default() -> Self {
        Self {
            content: None,
            path: None,
            delimiter: ",".to_string(),
            has_headers: true,
        }
    }
}

impl LoadCsvConfig {
    fn delimiter(&self) -> Result<u8, UnitError> {
        match self.delimiter.as_bytes() {
            [d] if d.is_ascii() => Ok(*d),
            _ => Err(UnitError::Configuration(format!(
                "delimiter must be a single ASCII character, got '{}'",
                self.delimiter
            ))),
        }
    }

    fn check_path(&self) -> Result<(), UnitError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let escapes = Path::new(path)
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || escapes {
            return Err(UnitError::Configuration(format!(
                "path must be relative to the workspace: '{}'",
                path
            )));
        }
        Ok(())
    }
}

/// Reads CSV into an untyped table.
///
/// The source is, in order of preference: the `file` input (an artifact key
/// or raw bytes), inline `content` config, or `path` relative to the
/// workspace directory.
pub struct LoadCsvUnit;

impl LoadCsvUnit {
    async fn read_source(ctx: &UnitContext, config: &LoadCsvConfig) -> Result<String, UnitError> {
        match ctx.inputs.get("file") {
            Some(Value::String(key)) => {
                let artifact = ctx.load_artifact(key).await?;
                return match artifact.data {
                    ArtifactData::Text(text) => Ok(text),
                    ArtifactData::Bytes(bytes) => utf8(bytes),
                    ArtifactData::Structured(_) => Err(UnitError::ExecutionFailed(format!(
                        "artifact {} holds structured data, not CSV",
                        key
                    ))),
                };
            }
            Some(Value::Bytes(bytes)) => return utf8(bytes.clone()),
            _ => {}
        }

        if let Some(content) = &config.content {
            return Ok(content.clone());
        }

        if let Some(path) = &config.path {
            let full = ctx.workspace_path()?.join(path);
            tracing::debug!("Reading CSV from {}", full.display());
            return tokio::fs::read_to_string(&full).await.map_err(|e| {
                UnitError::ExecutionFailed(format!("failed to read {}: {}", full.display(), e))
            });
        }

        Err(UnitError::MissingInput(
            "file (or 'content' / 'path' config)".to_string(),
        ))
    }

    async fn load(&self, ctx: &UnitContext) -> Result<NodeResult, UnitError> {
        let config: LoadCsvConfig = ctx.typed_config()?;
        let delimiter = config.delimiter()?;

        let text = Self::read_source(ctx, &config).await?;
        let table = parse_csv(&text, delimiter, config.has_headers)?;

        ctx.events.info(format!(
            "Loaded {} rows x {} columns",
            table.rows.len(),
            table.columns.len()
        ));

        Ok(NodeResult::success()
            .with_output("data", table.to_value())
            .with_metadata("rows", table.rows.len() as f64)
            .with_metadata("columns", table.columns.len() as f64))
    }
}

fn utf8(bytes: Vec<u8>) -> Result<String, UnitError> {
    String::from_utf8(bytes)
        .map_err(|e| UnitError::ExecutionFailed(format!("CSV is not valid UTF-8: {}", e)))
}

fn parse_csv(text: &str, delimiter: u8, has_headers: bool) -> Result<RawTable, UnitError> {
    let parse_error = |e: csv::Error| UnitError::ExecutionFailed(format!("CSV parse error: {}", e));

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(has_headers)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(parse_error)?;
        rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
    }

    let columns = if has_headers {
        reader
            .headers()
            .map_err(parse_error)?
            .iter()
            .map(str::to_string)
            .collect()
    } else {
        let width = rows.first().map(Vec::len).unwrap_or(0);
        (1..=width).map(|i| format!("column_{}", i)).collect()
    };

    Ok(RawTable { columns, rows })
}

#[async_trait]
impl ProcessingUnit for LoadCsvUnit {
    fn module_type(&self) -> &str {
        "data.load_csv"
    }

    fn display_name(&self) -> &str {
        "Load CSV"
    }

    fn description(&self) -> &str {
        "Parse CSV from an artifact, inline text or a workspace file"
    }

    fn inputs(&self) -> Vec<Port> {
        vec![Port::input("file", PortType::File)
            .optional()
            .with_description("Artifact key or raw CSV bytes")]
    }

    fn outputs(&self) -> Vec<Port> {
        vec![Port::output("data", PortType::Data).with_label("Rows")]
    }

    fn config_schema(&self) -> serde_json::Value {
        schema_for::<LoadCsvConfig>()
    }

    fn validate_config(&self, config: &Config) -> Result<(), UnitError> {
        let config: LoadCsvConfig = parse_config(config)?;
        config.delimiter()?;
        config.check_path()
    }

    async fn execute(&self, ctx: UnitContext) -> Result<NodeResult, UnitError> {
        Ok(self
            .load(&ctx)
            .await
            .unwrap_or_else(NodeResult::from_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_headers_and_rows() {
        let table = parse_csv("a, b\n1, x\n2, y\n", b',', true).unwrap();
        assert_eq!(table.columns, vec!["a", "b"]);
        assert_eq!(table.rows, vec![vec!["1", "x"], vec!["2", "y"]]);
    }

    #[test]
    fn headerless_columns_are_numbered() {
        let table = parse_csv("1;2;3\n", b';', false).unwrap();
        assert_eq!(table.columns, vec!["column_1", "column_2", "column_3"]);
        assert_eq!(table.rows.len(), 1);
    }

    #[test]
    fn ragged_rows_are_an_error() {
        assert!(parse_csv("a,b\n1\n", b',', true).is_err());
    }

    #[test]
    fn rejects_paths_outside_workspace() {
        let unit = LoadCsvUnit;
        let mut config = Config::new();
        config.insert("path".into(), "../secrets.csv".into());
        assert!(unit.validate_config(&config).is_err());

        config.insert("path".into(), "/etc/passwd".into());
        assert!(unit.validate_config(&config).is_err());

        config.insert("path".into(), "data/input.csv".into());
        assert!(unit.validate_config(&config).is_ok());

        config.insert("delimiter".into(), ";;".into());
        assert!(unit.validate_config(&config).is_err());
    }

    #[test]
    fn schema_rejects_mistyped_options() {
        let unit = LoadCsvUnit;
        let mut config = Config::new();
        config.insert("has_headers".into(), "yes".into());
        assert!(matches!(
            unit.validate_config(&config),
            Err(UnitError::Configuration(msg)) if msg.contains("boolean")
        ));

        let schema = unit.config_schema();
        assert_eq!(schema["properties"]["delimiter"]["default"], ",");
        assert_eq!(schema["properties"]["has_headers"]["type"], "boolean");
    }
}
