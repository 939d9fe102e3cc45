//! Profile summaries persisted next to a dataset.
//!
//! A [`Profiler`] produces a JSON report for a freshly stored table. The report is checked by
//! [`validate_report`] before anything is written, then flattened into [`ProfileTables`] and
//! saved as the dataset's `profile` side table. [`BasicProfiler`] computes the report in-process.
//!
//! Report layout:
//!
//! ```text
//! { "table":     { "n", "n_var", "n_cells_missing", "n_vars_with_missing", "n_vars_all_missing" },
//!   "variables": { "<column>": { "type", "n_distinct", "is_unique", "n_unique", "n_missing",
//!                                "count", "value_counts_without_nan",
//!                                "mean", "std", "min", "max", "histogram" } } }
//! ```
//!
//! The five numeric keys are required only for `"type": "Numeric"` variables.

use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::{TableMeta, TableStore};
use crate::types::{ColumnType, Schema, Table, Value};

/// Name of the side table holding [`ProfileTables`].
pub const PROFILE_SIDECAR: &str = "profile";
/// Categorical columns with fewer distinct values than this get a full breakdown.
pub const CATEGORICAL_THRESHOLD: usize = 10;
/// Most frequent values kept per column.
pub const TOP_VALUES: usize = 10;
/// Histogram bins computed by [`BasicProfiler`].
pub const HISTOGRAM_BINS: usize = 10;

const NUMERIC: &str = "Numeric";
const CATEGORICAL: &str = "Categorical";
const BOOLEAN: &str = "Boolean";
const DATE_TIME: &str = "DateTime";

/// Computes a profile report for a table.
pub trait Profiler: Send + Sync {
    fn profile(&self, table: &Table) -> Result<serde_json::Value>;
}

/// Table-wide counters of a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSummary {
    pub n: u64,
    pub n_var: u64,
    pub n_cells_missing: u64,
    pub n_vars_with_missing: u64,
    pub n_vars_all_missing: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub bin_edges: Vec<f64>,
    pub counts: Vec<u64>,
}

/// Per-column section of a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSummary {
    #[serde(rename = "type")]
    pub kind: String,
    pub n_distinct: u64,
    pub is_unique: bool,
    pub n_unique: u64,
    pub n_missing: u64,
    pub count: u64,
    /// Value to occurrence count, most frequent first.
    pub value_counts_without_nan: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub histogram: Option<Histogram>,
}

impl VariableSummary {
    fn is_numeric(&self) -> bool {
        self.kind == NUMERIC
    }

    fn value_counts(&self) -> impl Iterator<Item = (&str, u64)> {
        self.value_counts_without_nan
            .iter()
            .filter_map(|(k, v)| v.as_u64().map(|n| (k.as_str(), n)))
    }
}

#[derive(Debug, Deserialize)]
struct RawReport {
    table: TableSummary,
    variables: serde_json::Map<String, serde_json::Value>,
}

/// A report that passed [`validate_report`], variables in schema order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileReport {
    pub table: TableSummary,
    pub variables: Vec<(String, VariableSummary)>,
}

/// Check that `report` has every key the side tables need, for every column of `schema`.
pub fn validate_report(report: &serde_json::Value, schema: &Schema) -> Result<ProfileReport> {
    let raw: RawReport = serde_json::from_value(report.clone()).map_err(|e| invalid(e.to_string()))?;

    let mut variables = Vec::with_capacity(schema.len());
    for name in schema.field_names() {
        let section = raw
            .variables
            .get(name)
            .ok_or_else(|| invalid(format!("no variable section for column '{name}'")))?;
        let summary: VariableSummary = serde_json::from_value(section.clone())
            .map_err(|e| invalid(format!("column '{name}': {e}")))?;

        if summary.is_numeric() {
            let missing: Vec<&str> = [
                ("mean", summary.mean.is_none()),
                ("std", summary.std.is_none()),
                ("min", summary.min.is_none()),
                ("max", summary.max.is_none()),
                ("histogram", summary.histogram.is_none()),
            ]
            .into_iter()
            .filter_map(|(key, absent)| absent.then_some(key))
            .collect();
            if !missing.is_empty() {
                return Err(invalid(format!(
                    "numeric column '{name}' is missing {}",
                    missing.join(", ")
                )));
            }
        }
        if let Some((value, _)) = summary
            .value_counts_without_nan
            .iter()
            .find(|(_, v)| v.as_u64().is_none())
        {
            return Err(invalid(format!(
                "column '{name}': count of '{value}' is not a non-negative integer"
            )));
        }
        variables.push((name.to_string(), summary));
    }

    Ok(ProfileReport {
        table: raw.table,
        variables,
    })
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidProfile {
        message: message.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralInfos {
    pub encoding: Option<String>,
    pub separator: Option<char>,
    pub header_row_idx: u64,
    pub total_lines: u64,
    pub nb_columns: u64,
    pub nb_cells_missing: u64,
    pub nb_vars_with_missing: u64,
    pub nb_vars_all_missing: u64,
    pub date_last_check: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Inferred storage type.
    pub format: ColumnType,
    /// Profiler's own classification (`Numeric`, `Categorical`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    pub nb_distinct: u64,
    pub is_unique: bool,
    pub nb_unique: u64,
    pub nb_missing: u64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueCount {
    pub column: String,
    pub value: String,
    pub nb: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericInfo {
    pub column: String,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericPlotInfo {
    pub column: String,
    pub bin_edges: Vec<f64>,
    pub counts: Vec<u64>,
}

/// Flattened summaries stored alongside a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileTables {
    pub general: GeneralInfos,
    pub columns: Vec<ColumnInfo>,
    pub categorical: Vec<ValueCount>,
    pub top: Vec<ValueCount>,
    pub numeric: Vec<NumericInfo>,
    pub numeric_plot: Vec<NumericPlotInfo>,
}

impl ProfileTables {
    pub fn build(report: &ProfileReport, meta: &TableMeta, checked_on: NaiveDate) -> Self {
        let general = GeneralInfos {
            encoding: meta.encoding.clone(),
            separator: meta.delimiter,
            header_row_idx: 0,
            total_lines: report.table.n,
            nb_columns: report.table.n_var,
            nb_cells_missing: report.table.n_cells_missing,
            nb_vars_with_missing: report.table.n_vars_with_missing,
            nb_vars_all_missing: report.table.n_vars_all_missing,
            date_last_check: checked_on,
        };

        let mut tables = Self {
            general,
            columns: Vec::new(),
            categorical: Vec::new(),
            top: Vec::new(),
            numeric: Vec::new(),
            numeric_plot: Vec::new(),
        };

        for (name, var) in &report.variables {
            let format = meta
                .schema
                .index_of(name)
                .map_or(ColumnType::Text, |idx| meta.schema.fields[idx].column_type);
            tables.columns.push(ColumnInfo {
                name: name.clone(),
                format,
                kind: var.kind.clone(),
                nb_distinct: var.n_distinct,
                is_unique: var.is_unique,
                nb_unique: var.n_unique,
                nb_missing: var.n_missing,
                count: var.count,
            });

            let count_row = |(value, nb): (&str, u64)| ValueCount {
                column: name.clone(),
                value: value.to_string(),
                nb,
            };
            if var.kind == CATEGORICAL && var.value_counts_without_nan.len() < CATEGORICAL_THRESHOLD {
                tables.categorical.extend(var.value_counts().map(count_row));
            }
            tables
                .top
                .extend(var.value_counts().take(TOP_VALUES).map(count_row));

            if let (true, Some(mean), Some(std), Some(min), Some(max), Some(histogram)) = (
                var.is_numeric(),
                var.mean,
                var.std,
                var.min,
                var.max,
                var.histogram.as_ref(),
            ) {
                tables.numeric.push(NumericInfo {
                    column: name.clone(),
                    mean,
                    std,
                    min,
                    max,
                });
                tables.numeric_plot.push(NumericPlotInfo {
                    column: name.clone(),
                    bin_edges: histogram.bin_edges.clone(),
                    counts: histogram.counts.clone(),
                });
            }
        }
        tables
    }

    /// Save as the `profile` side table of `identity`, replacing any previous one.
    pub fn persist(&self, store: &TableStore, identity: &str) -> Result<()> {
        store.write_sidecar(identity, PROFILE_SIDECAR, self)?;
        tracing::debug!(target: "storage", %identity, columns = self.columns.len(), "profile persisted");
        Ok(())
    }

    /// `general_infos` object of a dataset description.
    pub fn general_infos_json(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(&self.general) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }

    /// `columns_infos` object of a dataset description: one entry per column, with its value
    /// counts and numeric summaries folded in.
    pub fn columns_infos_json(&self) -> serde_json::Map<String, serde_json::Value> {
        let counts = |rows: &[ValueCount], column: &str| -> serde_json::Value {
            rows.iter()
                .filter(|r| r.column == column)
                .map(|r| serde_json::json!({ "value": r.value, "count": r.nb }))
                .collect()
        };

        let mut out = serde_json::Map::new();
        for col in &self.columns {
            let numeric = self
                .numeric
                .iter()
                .find(|n| n.column == col.name)
                .map(|n| serde_json::json!({ "mean": n.mean, "std": n.std, "min": n.min, "max": n.max }))
                .unwrap_or_else(|| serde_json::json!({}));
            let plot = self
                .numeric_plot
                .iter()
                .find(|p| p.column == col.name)
                .map(|p| serde_json::json!({ "bin_edges": p.bin_edges, "counts": p.counts }))
                .unwrap_or_else(|| serde_json::json!({}));

            out.insert(
                col.name.clone(),
                serde_json::json!({
                    "format": col.format,
                    "type": col.kind,
                    "nb_distinct": col.nb_distinct,
                    "is_unique": col.is_unique,
                    "nb_unique": col.nb_unique,
                    "nb_missing": col.nb_missing,
                    "count": col.count,
                    "top_infos": counts(&self.top, &col.name),
                    "categorical_infos": counts(&self.categorical, &col.name),
                    "numeric_infos": numeric,
                    "numeric_plot_infos": plot,
                }),
            );
        }
        out
    }
}

/// Validate `report` against the stored table and persist its side tables.
pub fn store_profile(
    store: &TableStore,
    meta: &TableMeta,
    report: &serde_json::Value,
) -> Result<ProfileTables> {
    let validated = validate_report(report, &meta.schema)?;
    let tables = ProfileTables::build(&validated, meta, Utc::now().date_naive());
    tables.persist(store, &meta.identity)?;
    Ok(tables)
}

/// In-process profiler over the typed table.
///
/// Number and duration columns are `Numeric`, booleans `Boolean`, dates `DateTime`, everything
/// else `Categorical`. Standard deviation is the sample one.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicProfiler;

impl Profiler for BasicProfiler {
    fn profile(&self, table: &Table) -> Result<serde_json::Value> {
        let n = table.row_count() as u64;
        let mut variables = serde_json::Map::new();
        let mut n_cells_missing = 0u64;
        let mut n_vars_with_missing = 0u64;
        let mut n_vars_all_missing = 0u64;

        for (idx, field) in table.schema.fields.iter().enumerate() {
            let summary = summarize(table, idx, field.column_type);
            n_cells_missing += summary.n_missing;
            if summary.n_missing > 0 {
                n_vars_with_missing += 1;
            }
            if n > 0 && summary.n_missing == n {
                n_vars_all_missing += 1;
            }
            let section = serde_json::to_value(&summary).map_err(|e| Error::internal(e.to_string()))?;
            variables.insert(field.name.clone(), section);
        }

        let summary = TableSummary {
            n,
            n_var: table.column_count() as u64,
            n_cells_missing,
            n_vars_with_missing,
            n_vars_all_missing,
        };
        Ok(serde_json::json!({ "table": summary, "variables": variables }))
    }
}

fn summarize(table: &Table, idx: usize, column_type: ColumnType) -> VariableSummary {
    let mut n_missing = 0u64;
    let mut counts: HashMap<String, u64> = HashMap::new();
    let mut numbers = Vec::new();
    for value in table.column(idx) {
        match value.render() {
            None => n_missing += 1,
            Some(rendered) => {
                *counts.entry(rendered).or_default() += 1;
                if let Value::Number(x) = value {
                    numbers.push(*x);
                }
            }
        }
    }
    let count = table.row_count() as u64 - n_missing;

    let mut ordered: Vec<(String, u64)> = counts.into_iter().collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let n_distinct = ordered.len() as u64;
    let n_unique = ordered.iter().filter(|(_, c)| *c == 1).count() as u64;

    let numeric = matches!(column_type, ColumnType::Number | ColumnType::Duration) && !numbers.is_empty();
    let kind = if numeric {
        NUMERIC
    } else {
        match column_type {
            ColumnType::Boolean => BOOLEAN,
            ColumnType::Date | ColumnType::DateTime => DATE_TIME,
            _ => CATEGORICAL,
        }
    };

    let mut summary = VariableSummary {
        kind: kind.to_string(),
        n_distinct,
        is_unique: count > 0 && n_unique == count,
        n_unique,
        n_missing,
        count,
        value_counts_without_nan: ordered
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::from(v)))
            .collect(),
        mean: None,
        std: None,
        min: None,
        max: None,
        histogram: None,
    };

    if numeric {
        let len = numbers.len() as f64;
        let mean = numbers.iter().sum::<f64>() / len;
        let std = if numbers.len() > 1 {
            (numbers.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (len - 1.0)).sqrt()
        } else {
            0.0
        };
        let min = numbers.iter().copied().fold(f64::INFINITY, f64::min);
        let max = numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        summary.mean = Some(mean);
        summary.std = Some(std);
        summary.min = Some(min);
        summary.max = Some(max);
        summary.histogram = Some(histogram(&numbers, min, max));
    }
    summary
}

/// Equal-width bins over `[min, max]`; the last bin is closed. A constant column gets a unit
/// range centred on its value.
fn histogram(values: &[f64], min: f64, max: f64) -> Histogram {
    let (lo, hi) = if min == max { (min - 0.5, max + 0.5) } else { (min, max) };
    let width = (hi - lo) / HISTOGRAM_BINS as f64;
    let bin_edges = (0..=HISTOGRAM_BINS).map(|i| lo + width * i as f64).collect();
    let mut counts = vec![0u64; HISTOGRAM_BINS];
    for x in values {
        let bin = (((x - lo) / width).floor() as usize).min(HISTOGRAM_BINS - 1);
        counts[bin] += 1;
    }
    Histogram { bin_edges, counts }
}
