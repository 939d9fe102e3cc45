//! Query-string adapter.
//!
//! Reserved keys start with `_`. Every other key of the form `<column>__<comparator>` is a
//! filter; the split happens on the last `__`, so column names may contain `__` themselves.

use std::str::FromStr;

use crate::error::{Error, Result};

use super::{Comparator, ExportQuery, Filter, Limit, Query, Shape, Sort, SortDirection};

const HIDE: &str = "hide";

impl Query {
    /// Build a query from decoded `(key, value)` pairs.
    ///
    /// `_size` (`-1` for all rows), `_offset`, `_sort`, `_sort_desc`, `_shape`, `_rowid=hide`
    /// and `_total=hide` are recognised. `_sort` wins over `_sort_desc`. Filters with an unknown
    /// comparator are dropped.
    pub fn from_params<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut query = Query::default();
        let mut sort = SortParams::default();

        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "_size" => query.limit = Some(parse_limit(value)?),
                "_offset" => query.offset = parse_usize(key, value)?,
                "_shape" => query.shape = Shape::from_str(value)?,
                "_rowid" => query.include_rowid = value != HIDE,
                "_total" => query.include_total = value != HIDE,
                "_sort" | "_sort_desc" => sort.set(key, value),
                _ => {
                    if let Some(filter) = parse_filter(key, value) {
                        query.filters.push(filter);
                    }
                }
            }
        }
        query.sort = sort.resolve();
        Ok(query)
    }
}

impl ExportQuery {
    /// Like [`Query::from_params`], keeping only filters and sort.
    pub fn from_params<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut query = ExportQuery::default();
        let mut sort = SortParams::default();
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "_sort" | "_sort_desc" => sort.set(key, value),
                _ => {
                    if let Some(filter) = parse_filter(key, value) {
                        query.filters.push(filter);
                    }
                }
            }
        }
        query.sort = sort.resolve();
        Ok(query)
    }
}

#[derive(Default)]
struct SortParams {
    asc: Option<String>,
    desc: Option<String>,
}

impl SortParams {
    fn set(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            return;
        }
        if key == "_sort" {
            self.asc = Some(value.to_string());
        } else {
            self.desc = Some(value.to_string());
        }
    }

    fn resolve(self) -> Option<Sort> {
        match (self.asc, self.desc) {
            (Some(column), _) => Some(Sort {
                column,
                direction: SortDirection::Asc,
            }),
            (None, Some(column)) => Some(Sort {
                column,
                direction: SortDirection::Desc,
            }),
            (None, None) => None,
        }
    }
}

fn parse_filter(key: &str, value: &str) -> Option<Filter> {
    if key.starts_with('_') {
        return None;
    }
    let (column, comparator) = key.rsplit_once("__")?;
    match Comparator::parse(comparator) {
        Some(comparator) => Some(Filter::new(column, comparator, value)),
        None => {
            tracing::warn!(target: "query", key, "dropped unknown comparator");
            None
        }
    }
}

fn parse_usize(name: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|_| Error::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn parse_limit(value: &str) -> Result<Limit> {
    if value.trim() == "-1" {
        return Ok(Limit::All);
    }
    parse_usize("_size", value).map(Limit::Rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_keys_and_filters() {
        let q = Query::from_params([
            ("_size", "20"),
            ("_offset", "40"),
            ("_shape", "objects"),
            ("_rowid", "hide"),
            ("ville__contains", "lyon"),
            ("code__postal__exact", "69001"),
        ])
        .unwrap();
        assert_eq!(q.limit, Some(Limit::Rows(20)));
        assert_eq!(q.offset, 40);
        assert_eq!(q.shape, Shape::Objects);
        assert!(!q.include_rowid);
        assert!(q.include_total);
        assert_eq!(
            q.filters,
            vec![
                Filter::new("ville", Comparator::Contains, "lyon"),
                Filter::new("code__postal", Comparator::Exact, "69001"),
            ]
        );
    }

    #[test]
    fn size_minus_one_means_all() {
        let q = Query::from_params([("_size", "-1")]).unwrap();
        assert_eq!(q.limit, Some(Limit::All));
    }

    #[test]
    fn bad_integers_are_rejected() {
        assert!(matches!(
            Query::from_params([("_size", "ten")]),
            Err(Error::InvalidParameter { name, .. }) if name == "_size"
        ));
        assert!(matches!(
            Query::from_params([("_offset", "-3")]),
            Err(Error::InvalidParameter { name, .. }) if name == "_offset"
        ));
        assert!(matches!(
            Query::from_params([("_shape", "toto")]),
            Err(Error::UnknownShape(s)) if s == "toto"
        ));
    }

    #[test]
    fn unknown_comparators_and_plain_keys_are_ignored() {
        let q = Query::from_params([("ville__startswith", "L"), ("ville", "Lyon")]).unwrap();
        assert!(q.filters.is_empty());
    }

    #[test]
    fn sort_wins_over_sort_desc() {
        let q = Query::from_params([("_sort_desc", "b"), ("_sort", "a")]).unwrap();
        assert_eq!(
            q.sort,
            Some(Sort {
                column: "a".into(),
                direction: SortDirection::Asc
            })
        );
        let q = Query::from_params([("_sort_desc", "b")]).unwrap();
        assert_eq!(q.sort.map(|s| s.direction), Some(SortDirection::Desc));
    }

    #[test]
    fn export_ignores_pagination() {
        let q = ExportQuery::from_params([("_size", "nope"), ("n__greater", "3"), ("_sort", "n")])
            .unwrap();
        assert_eq!(q.filters, vec![Filter::new("n", Comparator::Greater, "3")]);
        assert_eq!(q.sort.map(|s| s.column), Some("n".to_string()));
    }
}
