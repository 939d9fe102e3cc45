//! Type caster registry.
//!
//! Each [`ColumnType`] is a caster: it either accepts a raw string and turns it into a typed
//! [`Value`], or rejects it. A column gets the most specific type in
//! [`ColumnType::PRECEDENCE`] that accepts every one of its values; null tokens never take part
//! in that decision, and a column with nothing but nulls is [`ColumnType::Text`].
//!
//! ```rust
//! use rust_tabular_api::casters::infer_column_type;
//! use rust_tabular_api::types::ColumnType;
//!
//! assert_eq!(infer_column_type(["9:15", "09:45", ""]), ColumnType::Time);
//! assert_eq!(infer_column_type(["732829320", "542107651"]), ColumnType::Identifier);
//! assert_eq!(infer_column_type(["12", "oops"]), ColumnType::Text);
//! ```

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rayon::prelude::*;
use regex::Regex;
use thiserror::Error;

use crate::error::{Error, Result};
use crate::types::{ColumnType, Field, Schema, Table, Value};

/// A value rejected by a caster.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("can not parse value '{raw}' as {target}")]
pub struct CastError {
    pub raw: String,
    pub target: ColumnType,
}

const NULL_TOKENS: [&str; 5] = ["na", "n/a", "none", "null", "."];

const TRUE_TOKENS: [&str; 5] = ["true", "t", "yes", "y", "1"];
const FALSE_TOKENS: [&str; 5] = ["false", "f", "no", "n", "0"];

const DATE_FORMATS: [&str; 5] = ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y/%m/%d"];

const DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[01]\d|2[0-3]|\d):[0-5]\d$").expect("valid regex"));

static PLAIN_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\d+(?:\.\d*)?|\.\d+)(?:[eE][+-]?\d+)?$").expect("valid regex")
});
static COMMA_GROUPED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}(?:,\d{3})+(?:\.\d+)?$").expect("valid regex"));
static DOT_GROUPED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}(?:\.\d{3})+(?:,\d+)?$").expect("valid regex"));
static DECIMAL_COMMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d*,\d+$").expect("valid regex"));
static SPACE_GROUPED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{1,3}(?:[ \u{a0}\u{202f}]\d{3})+(?:[.,]\d+)?$").expect("valid regex")
});

static CLOCK_DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:(\d+):)?(\d+):)?(\d+):([0-5]\d)(?:\.(\d+))?$").expect("valid regex")
});
static UNIT_DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\d+(?:\.\d+)?)\s*(weeks?|wks?|w|days?|d|hours?|hrs?|h|minutes?|mins?|m|seconds?|secs?|s)\b",
    )
    .expect("valid regex")
});

/// Returns `true` for values every caster treats as missing.
pub fn is_null_token(raw: &str) -> bool {
    let t = raw.trim();
    t.is_empty() || NULL_TOKENS.iter().any(|n| t.eq_ignore_ascii_case(n))
}

impl ColumnType {
    /// Cast a raw string with this caster.
    ///
    /// Null tokens always cast to [`Value::Null`].
    pub fn cast(&self, raw: &str) -> std::result::Result<Value, CastError> {
        if is_null_token(raw) {
            return Ok(Value::Null);
        }
        let s = raw.trim();
        let cast = match self {
            ColumnType::Boolean => parse_bool(s).map(Value::Bool),
            ColumnType::Identifier => is_valid_siren_or_siret(s).then(|| Value::Text(s.to_string())),
            ColumnType::Number => parse_number(s).map(Value::Number),
            ColumnType::Time => TIME_RE.is_match(s).then(|| Value::Text(s.to_string())),
            ColumnType::Duration => parse_duration(s).map(Value::Number),
            ColumnType::Date => parse_date(s).map(Value::Date),
            ColumnType::DateTime => parse_datetime(s).map(Value::DateTime),
            ColumnType::Text => Some(Value::Text(raw.to_string())),
        };
        cast.ok_or_else(|| CastError {
            raw: raw.to_string(),
            target: *self,
        })
    }

    /// Returns `true` if this caster accepts `raw`.
    pub fn accepts(&self, raw: &str) -> bool {
        self.cast(raw).is_ok()
    }
}

/// Pick the most specific type accepting every non-null value.
pub fn infer_column_type<'a, I>(values: I) -> ColumnType
where
    I: IntoIterator<Item = &'a str>,
{
    let mut candidates: Vec<ColumnType> = ColumnType::PRECEDENCE
        .iter()
        .copied()
        .filter(|t| *t != ColumnType::Text)
        .collect();
    let mut saw_value = false;

    for raw in values {
        if is_null_token(raw) {
            continue;
        }
        saw_value = true;
        candidates.retain(|t| t.accepts(raw));
        if candidates.is_empty() {
            break;
        }
    }

    if !saw_value {
        return ColumnType::Text;
    }
    candidates.first().copied().unwrap_or(ColumnType::Text)
}

/// Untyped table as it comes out of a CSV reader or spreadsheet.
///
/// Every row has exactly `headers.len()` cells; missing cells are empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Turn a header row into unique column names.
///
/// Blank cells are named `column_<position>`. A repeated name gets the first free `_2`, `_3`...
/// suffix, so `a;a;b` yields `a`, `a_2`, `b`.
pub fn header_names<I>(cells: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let raw: Vec<String> = cells
        .into_iter()
        .enumerate()
        .map(|(i, cell)| {
            if cell.trim().is_empty() {
                format!("column_{}", i + 1)
            } else {
                cell
            }
        })
        .collect();

    let mut taken: HashSet<String> = HashSet::with_capacity(raw.len());
    let mut names = Vec::with_capacity(raw.len());
    for (i, name) in raw.iter().enumerate() {
        let repeated = raw[..i].contains(name);
        let unique = if !repeated && !taken.contains(name) {
            name.clone()
        } else {
            (2..)
                .map(|n| format!("{name}_{n}"))
                .find(|candidate| !taken.contains(candidate) && !raw.contains(candidate))
                .unwrap_or_else(|| name.clone())
        };
        taken.insert(unique.clone());
        names.push(unique);
    }
    names
}

/// Apply the registry to every column of `raw`, producing a typed [`Table`].
///
/// Columns are inferred in parallel.
pub fn apply_registry(raw: RawTable) -> Result<Table> {
    let RawTable { headers, rows } = raw;
    let width = headers.len();

    let typed_columns: Vec<(ColumnType, Vec<Value>)> = (0..width)
        .into_par_iter()
        .map(|idx| {
            let column_type =
                infer_column_type(rows.iter().map(|row| row.get(idx).map_or("", String::as_str)));
            let values = rows
                .iter()
                .map(|row| column_type.cast(row.get(idx).map_or("", String::as_str)))
                .collect::<std::result::Result<Vec<_>, _>>();
            values.map(|v| (column_type, v))
        })
        .collect::<std::result::Result<Vec<_>, CastError>>()
        .map_err(|e| Error::parse(e.to_string()))?;

    let fields = headers
        .into_iter()
        .zip(typed_columns.iter())
        .map(|(name, (column_type, _))| Field::new(name, *column_type))
        .collect();

    let mut columns: Vec<std::vec::IntoIter<Value>> = typed_columns
        .into_iter()
        .map(|(_, values)| values.into_iter())
        .collect();
    let mut out_rows = Vec::with_capacity(rows.len());
    for _ in 0..rows.len() {
        out_rows.push(
            columns
                .iter_mut()
                .map(|col| col.next().unwrap_or(Value::Null))
                .collect(),
        );
    }

    Ok(Table::new(Schema::new(fields), out_rows))
}

/// Parse a boolean token (`true/t/yes/y/1`, `false/f/no/n/0`, case-insensitive).
pub fn parse_bool(s: &str) -> Option<bool> {
    if TRUE_TOKENS.iter().any(|t| s.eq_ignore_ascii_case(t)) {
        Some(true)
    } else if FALSE_TOKENS.iter().any(|t| s.eq_ignore_ascii_case(t)) {
        Some(false)
    } else {
        None
    }
}

/// Parse a number, tolerating common grouping/decimal conventions and currency symbols.
///
/// `1,234.5`, `1.234,5`, `1 234,5` and `3,14` are all accepted. A lone comma followed by exactly
/// three digits (`1,234`) is read as a thousands separator.
pub fn parse_number(s: &str) -> Option<f64> {
    let s = s.trim_matches(|c| matches!(c, '$' | '€' | '£' | '¥')).trim();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let digits = digits.trim_start_matches(|c| matches!(c, '$' | '€' | '£' | '¥'));

    let normalized = if PLAIN_NUMBER_RE.is_match(digits) {
        digits.to_string()
    } else if COMMA_GROUPED_RE.is_match(digits) {
        digits.replace(',', "")
    } else if DOT_GROUPED_RE.is_match(digits) {
        digits.replace('.', "").replace(',', ".")
    } else if DECIMAL_COMMA_RE.is_match(digits) {
        digits.replace(',', ".")
    } else if SPACE_GROUPED_RE.is_match(digits) {
        digits
            .chars()
            .filter(|c| !matches!(c, ' ' | '\u{a0}' | '\u{202f}'))
            .map(|c| if c == ',' { '.' } else { c })
            .collect()
    } else {
        return None;
    };

    let n: f64 = normalized.parse().ok()?;
    if !n.is_finite() {
        return None;
    }
    Some(if negative { -n } else { n })
}

/// Parse a duration into seconds.
///
/// Accepts clock forms (`MM:SS`, `H:MM:SS`, `D:HH:MM:SS`, optional fraction) and unit forms such as
/// `1h 30m`, `3 days`, `2 hours, 5 minutes and 10 seconds`.
pub fn parse_duration(s: &str) -> Option<f64> {
    if let Some(caps) = CLOCK_DURATION_RE.captures(s) {
        let part = |i: usize| -> f64 {
            caps.get(i)
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .unwrap_or(0.0)
        };
        let fraction = caps
            .get(5)
            .and_then(|m| format!("0.{}", m.as_str()).parse::<f64>().ok())
            .unwrap_or(0.0);
        let (days, hours, minutes, seconds) = match (caps.get(1), caps.get(2)) {
            (Some(_), Some(_)) => (part(1), part(2), part(3), part(4)),
            (None, Some(_)) => (0.0, part(2), part(3), part(4)),
            _ => (0.0, 0.0, part(3), part(4)),
        };
        return Some(days * 86_400.0 + hours * 3_600.0 + minutes * 60.0 + seconds + fraction);
    }

    let mut total = 0.0;
    let mut cursor = 0usize;
    let mut matched = false;
    for caps in UNIT_DURATION_RE.captures_iter(s) {
        let whole = caps.get(0)?;
        if !is_duration_separator(&s[cursor..whole.start()]) {
            return None;
        }
        cursor = whole.end();
        let amount: f64 = caps.get(1)?.as_str().parse().ok()?;
        let unit = caps.get(2)?.as_str().to_ascii_lowercase();
        let factor = match unit.chars().next()? {
            'w' => 604_800.0,
            'd' => 86_400.0,
            'h' => 3_600.0,
            'm' => 60.0,
            _ => 1.0,
        };
        total += amount * factor;
        matched = true;
    }
    if !matched || !is_duration_separator(&s[cursor..]) {
        return None;
    }
    Some(total)
}

fn is_duration_separator(gap: &str) -> bool {
    gap.split(|c: char| c.is_whitespace() || c == ',')
        .all(|w| w.is_empty() || w.eq_ignore_ascii_case("and"))
}

/// Parse a calendar date in one of the supported day-first or ISO layouts.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

/// Parse a date-time. Plain dates are accepted as midnight; offsets are converted to UTC.
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.naive_utc())
        })
        .or_else(|| parse_date(s).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

/// Validate a SIREN (9 digits) or SIRET (14 digits). Spaces and dots are ignored.
pub fn is_valid_siren_or_siret(s: &str) -> bool {
    let compact: String = s.chars().filter(|c| !matches!(c, ' ' | '.')).collect();
    if compact.is_empty() || !compact.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    match compact.len() {
        9 => luhn_valid(compact.as_bytes()),
        14 => is_valid_siret(&compact),
        _ => false,
    }
}

fn is_valid_siret(digits: &str) -> bool {
    // La Poste establishments (apart from the head office) use a digit-sum rule instead of Luhn.
    if digits.starts_with("356000000") && digits != "35600000000048" {
        let sum: u32 = digits.bytes().map(|b| u32::from(b - b'0')).sum();
        return sum % 5 == 0;
    }
    luhn_valid(digits.as_bytes()) && luhn_valid(&digits.as_bytes()[..9])
}

fn luhn_valid(digits: &[u8]) -> bool {
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let v = u32::from(b - b'0');
            if i % 2 == 1 {
                let d = v * 2;
                if d > 9 { d - 9 } else { d }
            } else {
                v
            }
        })
        .sum();
    sum % 10 == 0
}
