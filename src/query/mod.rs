//! Query engine: filter, sort, paginate and export stored tables.
//!
//! A [`Query`] is a plain value. [`QueryEngine::execute`] resolves it against a dataset's stored
//! schema, scans the table once under a cooperative [`Deadline`] and shapes the page it kept.
//!
//! ```
//! use rust_tabular_api::query::{Comparator, Filter, Limit, Query, Shape};
//!
//! let query = Query {
//!     filters: vec![Filter::new("ville", Comparator::Contains, "lyon")],
//!     limit: Some(Limit::Rows(20)),
//!     shape: Shape::Objects,
//!     ..Query::default()
//! };
//! assert!(query.include_rowid);
//! ```

mod deadline;
mod filter;
mod params;

use std::io::Write;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::profile::ProfileTables;
use crate::storage::{StoredRow, TableHandle, TableMeta, TableStore};
use crate::types::Value;

pub use deadline::Deadline;
pub use filter::{CompiledFilter, CompiledSort, Plan, ROWID};

/// Page size used when a query does not set one.
pub const DEFAULT_ROWS_LIMIT: usize = 100;
/// Largest page a query may ask for, short of [`Limit::All`].
pub const DEFAULT_MAX_PAGE_SIZE: usize = 10_000;
/// Default execution deadline.
pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_millis(1000);

/// Filter operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparator {
    /// Typed equality.
    Exact,
    /// Case-insensitive substring of the rendered value.
    Contains,
    /// Strictly greater, numerically.
    Greater,
    /// Strictly less, numerically.
    Less,
}

impl Comparator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Exact => "exact",
            Comparator::Contains => "contains",
            Comparator::Greater => "greater",
            Comparator::Less => "less",
        }
    }

    /// `None` for unknown operator names.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(Comparator::Exact),
            "contains" => Some(Comparator::Contains),
            "greater" => Some(Comparator::Greater),
            "less" => Some(Comparator::Less),
            _ => None,
        }
    }
}

/// `column <comparator> value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub comparator: Comparator,
    pub value: String,
}

impl Filter {
    pub fn new(column: impl Into<String>, comparator: Comparator, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            comparator,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub column: String,
    pub direction: SortDirection,
}

/// How many rows a page holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// At most `n` rows, capped by [`QueryOptions::max_page_size`].
    Rows(usize),
    /// Every matching row, regardless of the cap.
    All,
}

/// Row layout in results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shape {
    /// Each row is a list of values in column order.
    #[default]
    Lists,
    /// Each row maps column name to value, in column order.
    Objects,
}

impl FromStr for Shape {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lists" => Ok(Shape::Lists),
            "objects" => Ok(Shape::Objects),
            other => Err(Error::UnknownShape(other.to_string())),
        }
    }
}

/// A paginated query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// ANDed together.
    pub filters: Vec<Filter>,
    /// Defaults to `rowid` ascending.
    pub sort: Option<Sort>,
    pub offset: usize,
    /// `None` uses the engine's default page size.
    pub limit: Option<Limit>,
    pub shape: Shape,
    pub include_total: bool,
    /// Show `rowid` as the first column.
    pub include_rowid: bool,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            sort: None,
            offset: 0,
            limit: None,
            shape: Shape::Lists,
            include_total: true,
            include_rowid: true,
        }
    }
}

/// Export request: filters and sort only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportQuery {
    pub filters: Vec<Filter>,
    pub sort: Option<Sort>,
}

/// Result rows in the requested [`Shape`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Rows {
    Lists(Vec<Vec<serde_json::Value>>),
    Objects(Vec<serde_json::Map<String, serde_json::Value>>),
}

impl Rows {
    pub fn len(&self) -> usize {
        match self {
            Rows::Lists(rows) => rows.len(),
            Rows::Objects(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Rows,
    /// Number of matching rows, ignoring offset and limit; only when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    pub query_ms: f64,
}

/// Dataset metadata plus profile summaries, when a profile was persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Description {
    pub meta: TableMeta,
    pub general_infos: serde_json::Map<String, serde_json::Value>,
    pub columns_infos: serde_json::Map<String, serde_json::Value>,
}

/// Engine-wide limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    pub default_limit: usize,
    pub max_page_size: usize,
    pub time_limit: Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_ROWS_LIMIT,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            time_limit: DEFAULT_TIME_LIMIT,
        }
    }
}

/// Read-only query execution against a [`TableStore`].
#[derive(Debug, Clone)]
pub struct QueryEngine<'a> {
    store: &'a TableStore,
    options: QueryOptions,
}

impl<'a> QueryEngine<'a> {
    pub fn new(store: &'a TableStore, options: QueryOptions) -> Self {
        Self { store, options }
    }

    /// Run `query` against the current version of `identity`.
    pub fn execute(&self, identity: &str, query: &Query) -> Result<QueryResult> {
        // The clock starts before the table is opened.
        let mut deadline = Deadline::new(self.options.time_limit);
        let handle = self.store.read(identity)?;
        let result = self.execute_on(&handle, query, &mut deadline);
        match &result {
            Ok(r) => tracing::debug!(
                target: "query",
                %identity,
                rows = r.rows.len(),
                total = r.total,
                query_ms = r.query_ms,
                "query executed"
            ),
            Err(e) => tracing::info!(target: "query", %identity, error = %e, "query failed"),
        }
        result
    }

    fn execute_on(
        &self,
        handle: &TableHandle,
        query: &Query,
        deadline: &mut Deadline,
    ) -> Result<QueryResult> {
        let schema = handle.schema();
        let plan = Plan::compile(&query.filters, schema)?;
        let sort = query
            .sort
            .as_ref()
            .map(|s| CompiledSort::compile(s, schema))
            .transpose()?;
        let limit = match query.limit.unwrap_or(Limit::Rows(self.options.default_limit)) {
            Limit::Rows(n) => Some(n.min(self.options.max_page_size)),
            Limit::All => None,
        };
        let end = limit.map(|n| query.offset.saturating_add(n));

        let mut page: Vec<StoredRow> = Vec::new();
        let mut total = 0usize;

        if let Some(sort) = sort {
            let mut matched = Vec::new();
            for row in handle.scan()? {
                deadline.tick()?;
                let row = row?;
                if plan.matches(&row.values) {
                    matched.push(row);
                }
            }
            total = matched.len();
            sort.apply(&mut matched);
            page = matched
                .into_iter()
                .skip(query.offset)
                .take(limit.unwrap_or(usize::MAX))
                .collect();
        } else {
            for row in handle.scan()? {
                deadline.tick()?;
                let row = row?;
                if !plan.matches(&row.values) {
                    continue;
                }
                let position = total;
                total += 1;
                if position >= query.offset && end.is_none_or(|end| position < end) {
                    page.push(row);
                }
                if !query.include_total && end.is_some_and(|end| total >= end) {
                    break;
                }
            }
        }

        let mut columns: Vec<String> = Vec::with_capacity(schema.len() + 1);
        if query.include_rowid {
            columns.push(ROWID.to_string());
        }
        columns.extend(schema.field_names().map(str::to_string));

        let rows = shape_rows(page, &columns, query.shape, query.include_rowid);
        Ok(QueryResult {
            columns,
            rows,
            total: query.include_total.then_some(total),
            query_ms: deadline.elapsed().as_secs_f64() * 1000.0,
        })
    }

    /// Lazily iterate every row of `identity` matching `query`.
    ///
    /// Exports are not subject to the query deadline. Without a sort, rows stream straight from
    /// the file; a sort has to collect matching rows first.
    pub fn export(&self, identity: &str, query: &ExportQuery) -> Result<ExportRows> {
        let handle = self.store.read(identity)?;
        let schema = handle.schema();
        let plan = Plan::compile(&query.filters, schema)?;
        let sort = query
            .sort
            .as_ref()
            .map(|s| CompiledSort::compile(s, schema))
            .transpose()?;
        let columns: Vec<String> = schema.field_names().map(str::to_string).collect();
        tracing::debug!(target: "query", %identity, sorted = sort.is_some(), "export started");

        let scan = handle.scan()?;
        let rows: Box<dyn Iterator<Item = Result<Vec<Value>>>> = match sort {
            None => Box::new(scan.filter_map(move |row| match row {
                Ok(row) if plan.matches(&row.values) => Some(Ok(row.values)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })),
            Some(sort) => {
                let mut matched = Vec::new();
                for row in scan {
                    let row = row?;
                    if plan.matches(&row.values) {
                        matched.push(row);
                    }
                }
                sort.apply(&mut matched);
                Box::new(matched.into_iter().map(|r| Ok(r.values)))
            }
        };

        Ok(ExportRows { columns, rows })
    }

    /// Metadata and profile summaries of `identity`.
    pub fn describe(&self, identity: &str) -> Result<Description> {
        let handle = self.store.read(identity)?;
        let profile: Option<ProfileTables> = self.store.read_sidecar(identity, "profile")?;
        let (general_infos, columns_infos) = match profile {
            Some(p) => (p.general_infos_json(), p.columns_infos_json()),
            None => (serde_json::Map::new(), serde_json::Map::new()),
        };
        Ok(Description {
            meta: handle.meta().clone(),
            general_infos,
            columns_infos,
        })
    }
}

fn shape_rows(rows: Vec<StoredRow>, columns: &[String], shape: Shape, include_rowid: bool) -> Rows {
    let to_list = |row: StoredRow| -> Vec<serde_json::Value> {
        let mut out = Vec::with_capacity(columns.len());
        if include_rowid {
            out.push(serde_json::Value::from(row.rowid));
        }
        out.extend(row.values.iter().map(Value::to_json));
        out
    };
    match shape {
        Shape::Lists => Rows::Lists(rows.into_iter().map(to_list).collect()),
        Shape::Objects => Rows::Objects(
            rows.into_iter()
                .map(|row| columns.iter().cloned().zip(to_list(row)).collect())
                .collect(),
        ),
    }
}

/// Rows of an export, in order, without `rowid`.
pub struct ExportRows {
    columns: Vec<String>,
    rows: Box<dyn Iterator<Item = Result<Vec<Value>>>>,
}

impl std::fmt::Debug for ExportRows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportRows")
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

impl ExportRows {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Write a header line then one CSV record per row. Nulls become empty fields.
    ///
    /// Returns the number of data rows written.
    pub fn write_csv<W: Write>(self, writer: W) -> Result<usize> {
        let mut wtr = ::csv::Writer::from_writer(writer);
        wtr.write_record(&self.columns).map_err(csv_error)?;
        let mut written = 0;
        for row in self.rows {
            let row = row?;
            wtr.write_record(row.iter().map(|v| v.render().unwrap_or_default()))
                .map_err(csv_error)?;
            written += 1;
        }
        wtr.flush()?;
        Ok(written)
    }
}

impl Iterator for ExportRows {
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }
}

fn csv_error(e: ::csv::Error) -> Error {
    Error::from(std::io::Error::from(e))
}
