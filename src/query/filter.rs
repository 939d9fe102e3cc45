//! Filter and sort compilation.
//!
//! Column references are resolved against the stored schema once, before the scan. Operands are
//! converted with the column's own caster so `exact` compares typed values.

use std::cmp::Ordering;

use crate::casters::parse_number;
use crate::error::{Error, Result};
use crate::storage::StoredRow;
use crate::types::{Schema, Value};

use super::{Comparator, Filter, Sort, SortDirection};

/// Name accepted as a sort key for the implicit row identity.
pub const ROWID: &str = "rowid";

#[derive(Debug, Clone, PartialEq)]
enum Test {
    /// Typed equality against a cast operand.
    Equals(Value),
    /// Operand did not cast: compare rendered text.
    EqualsText(String),
    /// Lowercased needle.
    Contains(String),
    Greater(f64),
    Less(f64),
}

/// One filter with its column resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    idx: usize,
    test: Test,
}

impl CompiledFilter {
    pub fn compile(filter: &Filter, schema: &Schema) -> Result<Self> {
        let idx = schema
            .index_of(&filter.column)
            .ok_or_else(|| Error::UnknownColumn(filter.column.clone()))?;
        let column_type = schema.fields[idx].column_type;

        let test = match filter.comparator {
            Comparator::Exact => match column_type.cast(&filter.value) {
                Ok(v) if !v.is_null() => Test::Equals(v),
                _ => Test::EqualsText(filter.value.clone()),
            },
            Comparator::Contains => Test::Contains(filter.value.to_ascii_lowercase()),
            Comparator::Greater | Comparator::Less => {
                let n = parse_number(filter.value.trim()).ok_or_else(|| Error::InvalidFilterValue {
                    column: filter.column.clone(),
                    comparator: filter.comparator.as_str().to_string(),
                    value: filter.value.clone(),
                })?;
                if filter.comparator == Comparator::Greater {
                    Test::Greater(n)
                } else {
                    Test::Less(n)
                }
            }
        };
        Ok(Self { idx, test })
    }

    /// Nulls never match.
    pub fn matches(&self, row: &[Value]) -> bool {
        let cell = match row.get(self.idx) {
            Some(Value::Null) | None => return false,
            Some(v) => v,
        };
        match &self.test {
            Test::Equals(v) => cell == v,
            Test::EqualsText(s) => cell.render().is_some_and(|r| &r == s),
            Test::Contains(needle) => cell
                .render()
                .is_some_and(|r| r.to_ascii_lowercase().contains(needle.as_str())),
            Test::Greater(n) => numeric(cell).is_some_and(|x| x > *n),
            Test::Less(n) => numeric(cell).is_some_and(|x| x < *n),
        }
    }
}

fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => Some(*n),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Text(s) => parse_number(s.trim()),
        _ => None,
    }
}

/// All filters of a query, ANDed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    filters: Vec<CompiledFilter>,
}

impl Plan {
    pub fn compile(filters: &[Filter], schema: &Schema) -> Result<Self> {
        let filters = filters
            .iter()
            .map(|f| CompiledFilter::compile(f, schema))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { filters })
    }

    pub fn matches(&self, row: &[Value]) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortKey {
    Rowid,
    Column(usize),
}

/// A resolved sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompiledSort {
    key: SortKey,
    direction: SortDirection,
}

impl CompiledSort {
    /// A column literally named `rowid` takes precedence over the implicit row identity.
    pub fn compile(sort: &Sort, schema: &Schema) -> Result<Self> {
        let key = match schema.index_of(&sort.column) {
            Some(idx) => SortKey::Column(idx),
            None if sort.column == ROWID => SortKey::Rowid,
            None => return Err(Error::UnknownColumn(sort.column.clone())),
        };
        Ok(Self {
            key,
            direction: sort.direction,
        })
    }

    /// Stable sort, so equal keys keep `rowid` order in both directions.
    pub fn apply(&self, rows: &mut [StoredRow]) {
        rows.sort_by(|a, b| {
            let ord = self.compare(a, b);
            match self.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            }
        });
    }

    fn compare(&self, a: &StoredRow, b: &StoredRow) -> Ordering {
        match self.key {
            SortKey::Rowid => a.rowid.cmp(&b.rowid),
            SortKey::Column(idx) => {
                let null = Value::Null;
                let va = a.values.get(idx).unwrap_or(&null);
                let vb = b.values.get(idx).unwrap_or(&null);
                va.sort_cmp(vb)
            }
        }
    }
}
