//! Typed unit configuration.
//!
//! A unit declares its configuration as a struct deriving `JsonSchema` and
//! `Deserialize`. The rendered draft-07 schema is what configuration UIs see
//! in the module catalog, and node configs are checked against that same
//! schema with `jsonschema` before being deserialized into the struct.

use crate::{Config, UnitError};
use schemars::generate::SchemaSettings;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{json, Value as Json};

/// Renders the schema of a config type.
pub fn schema_for<T: JsonSchema>() -> Json {
    let mut generator = SchemaSettings::draft07().into_generator();
    generator.root_schema_for::<T>().to_value()
}

/// Checks a config against a rendered schema, reporting every violation.
pub fn validate_against(schema: &Json, config: &Config) -> Result<(), UnitError> {
    let validator = jsonschema::Validator::new(schema)
        .map_err(|e| UnitError::Configuration(format!("invalid config schema: {}", e)))?;

    let instance = Json::Object(config.clone());
    let errors: Vec<String> = validator
        .iter_errors(&instance)
        .map(|e| e.to_string())
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(UnitError::Configuration(errors.join("; ")))
    }
}

/// Validates a config against `T`'s schema, then deserializes it.
pub fn parse_config<T: JsonSchema + DeserializeOwned>(config: &Config) -> Result<T, UnitError> {
    validate_against(&schema_for::<T>(), config)?;
    serde_json::from_value(Json::Object(config.clone()))
        .map_err(|e| UnitError::Configuration(e.to_string()))
}

/// Schema of a unit that takes no configuration.
pub fn empty_schema() -> Json {
    json!({
        "type": "object",
        "properties": {},
    })
}
