//! Table shapes passed between the data units.
//!
//! `data.load_csv` emits a [`RawTable`] of strings inline on its `data` port.
//! `table.convert` infers column types, producing a [`Table`] that it stores
//! as a structured artifact for `stats.describe` to read back.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use stepcore::{UnitError, Value};

/// Untyped rows, as parsed from CSV
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn to_value(&self) -> Value {
        Value::Json(json!({
            "columns": self.columns,
            "rows": self.rows,
        }))
    }

    pub fn from_value(value: &Value) -> Result<Self, UnitError> {
        match value {
            Value::Json(json) => serde_json::from_value(json.clone()).map_err(|e| {
                UnitError::ExecutionFailed(format!("input is not a table: {}", e))
            }),
            other => Err(UnitError::InvalidInputType {
                field: "data".to_string(),
                expected: "table".to_string(),
                actual: other.type_name().to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Number,
    Boolean,
    String,
}

impl ColumnType {
    /// Narrowest type that fits every non-empty cell
    fn infer<'a>(cells: impl Iterator<Item = &'a str>) -> Self {
        let mut number = true;
        let mut boolean = true;
        let mut seen = false;
        for cell in cells.filter(|c| !c.is_empty()) {
            seen = true;
            number &= cell.parse::<f64>().map(f64::is_finite).unwrap_or(false);
            boolean &= parse_bool(cell).is_some();
        }
        match (seen, number, boolean) {
            (false, _, _) => ColumnType::String,
            (true, true, _) => ColumnType::Number,
            (true, false, true) => ColumnType::Boolean,
            _ => ColumnType::String,
        }
    }

    fn convert(&self, cell: &str) -> Json {
        if cell.is_empty() {
            return Json::Null;
        }
        match self {
            ColumnType::Number => cell
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            ColumnType::Boolean => parse_bool(cell).map(Json::Bool).unwrap_or(Json::Null),
            ColumnType::String => Json::String(cell.to_string()),
        }
    }
}

fn parse_bool(cell: &str) -> Option<bool> {
    match cell.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

/// Column-typed table; empty cells are `null`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Json>>,
}

impl Table {
    pub fn from_raw(raw: &RawTable) -> Self {
        fn cell(row: &[String], i: usize) -> &str {
            row.get(i).map(String::as_str).unwrap_or("")
        }

        let columns: Vec<Column> = raw
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| Column {
                name: name.clone(),
                column_type: ColumnType::infer(raw.rows.iter().map(|row| cell(row, i))),
            })
            .collect();

        let rows = raw
            .rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .enumerate()
                    .map(|(i, column)| column.column_type.convert(cell(row, i)))
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }

    pub fn from_json(json: &Json) -> Result<Self, UnitError> {
        serde_json::from_value(json.clone())
            .map_err(|e| UnitError::ExecutionFailed(format!("artifact is not a typed table: {}", e)))
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Non-null numeric cells of one column
    pub fn numbers(&self, index: usize) -> impl Iterator<Item = f64> + '_ {
        self.rows
            .iter()
            .filter_map(move |row| row.get(index).and_then(Json::as_f64))
    }
}
