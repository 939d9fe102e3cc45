//! Core data model types shared by ingestion, storage and queries.
//!
//! Ingestion produces an in-memory [`Table`] whose [`Schema`] is inferred by the caster registry
//! (see [`crate::casters`]). Every column carries exactly one [`ColumnType`] for the life of the
//! dataset, and every cell is either [`Value::Null`] or a value of that type.

use std::cmp::Ordering;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Inferred type of a column.
///
/// Variants are listed from most specific to most general; [`ColumnType::PRECEDENCE`] is the order
/// in which the registry tries them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// `true`/`false` style values.
    Boolean,
    /// Checksum-validated French business identifier (SIREN or SIRET).
    Identifier,
    /// Integer or decimal number.
    Number,
    /// Hour and minute of the day (`H:MM` or `HH:MM`).
    Time,
    /// Elapsed time, stored as seconds.
    Duration,
    /// Calendar date.
    Date,
    /// Date and time of day.
    DateTime,
    /// Fallback: accepts anything.
    Text,
}

impl ColumnType {
    /// Registry precedence, most specific first.
    pub const PRECEDENCE: [ColumnType; 8] = [
        ColumnType::Boolean,
        ColumnType::Identifier,
        ColumnType::Number,
        ColumnType::Time,
        ColumnType::Duration,
        ColumnType::Date,
        ColumnType::DateTime,
        ColumnType::Text,
    ];

    /// Stable lowercase name, as persisted in dataset metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "boolean",
            ColumnType::Identifier => "identifier",
            ColumnType::Number => "number",
            ColumnType::Time => "time",
            ColumnType::Duration => "duration",
            ColumnType::Date => "date",
            ColumnType::DateTime => "date_time",
            ColumnType::Text => "text",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single named, typed column in a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Raw header text. Never used as a storage identifier.
    pub name: String,
    /// Inferred column type.
    pub column_type: ColumnType,
}

impl Field {
    /// Create a new field.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Ordered list of columns.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    /// Columns in source order.
    pub fields: Vec<Field>,
}

impl Schema {
    /// Create a new schema from fields.
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Iterate field names in order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Returns the index of the first field named `name`, if present.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if the schema has no columns.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A single typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Missing/empty value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Numbers and durations (in seconds).
    Number(f64),
    /// Text, identifiers and times of day.
    Text(String),
    /// Calendar date.
    Date(NaiveDate),
    /// Naive date-time (UTC when the source carried an offset).
    DateTime(NaiveDateTime),
}

/// Numbers with an absolute value below this are rendered without a fractional part when integral.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

impl Value {
    /// Returns `true` for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Human-readable text form; `None` for nulls.
    ///
    /// This is the form used by `contains` filters and CSV export.
    pub fn render(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(render_number(*n)),
            Value::Text(s) => Some(s.clone()),
            Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Value::DateTime(dt) => Some(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        }
    }

    /// JSON form used in query results.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < MAX_EXACT_INTEGER {
                    serde_json::Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                }
            }
            other => other
                .render()
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::Date(_) => 3,
            Value::DateTime(_) => 4,
            Value::Text(_) => 5,
        }
    }

    /// Total order used for sorting: nulls first, then by value within a variant.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

fn render_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < MAX_EXACT_INTEGER {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// In-memory typed table.
///
/// Rows are stored as `Vec<Vec<Value>>` in the same order as the [`Schema`] fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    /// Schema describing row shape.
    pub schema: Schema,
    /// Row-major value storage, in source order.
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    /// Create a table from schema and rows.
    pub fn new(schema: Schema, rows: Vec<Vec<Value>>) -> Self {
        Self { schema, rows }
    }

    /// Number of rows in the table.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Number of columns in the table.
    pub fn column_count(&self) -> usize {
        self.schema.len()
    }

    /// Iterate the values of one column.
    pub fn column(&self, idx: usize) -> impl Iterator<Item = &Value> {
        self.rows.iter().filter_map(move |row| row.get(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_numbers_render_without_fraction() {
        assert_eq!(Value::Number(3.0).render().as_deref(), Some("3"));
        assert_eq!(Value::Number(3.25).render().as_deref(), Some("3.25"));
        assert_eq!(Value::Number(3.0).to_json(), serde_json::json!(3));
        assert_eq!(Value::Number(0.5).to_json(), serde_json::json!(0.5));
    }

    #[test]
    fn nulls_sort_first() {
        let mut values = vec![
            Value::Number(2.0),
            Value::Null,
            Value::Number(-1.0),
        ];
        values.sort_by(|a, b| a.sort_cmp(b));
        assert_eq!(
            values,
            vec![Value::Null, Value::Number(-1.0), Value::Number(2.0)]
        );
    }

    #[test]
    fn datetime_renders_iso_without_zero_fraction() {
        let dt = NaiveDate::from_ymd_opt(2021, 3, 4)
            .unwrap()
            .and_hms_opt(5, 6, 7)
            .unwrap();
        assert_eq!(
            Value::DateTime(dt).render().as_deref(),
            Some("2021-03-04T05:06:07")
        );
    }

    #[test]
    fn schema_index_of_works() {
        let schema = Schema::new(vec![
            Field::new("id", ColumnType::Number),
            Field::new("name", ColumnType::Text),
        ]);
        assert_eq!(schema.index_of("name"), Some(1));
        assert_eq!(schema.index_of("missing"), None);
    }
}
