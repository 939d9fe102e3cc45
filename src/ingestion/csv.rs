//! Delimited text parsing.
//!
//! Parsing is a small state machine over [`Stage`]s. Each stage is a complete re-parse of the
//! decoded text; the first one that yields a table wins:
//!
//! 1. [`Stage::SniffWindow`]: sniff the dialect on the first `sniff_limit` bytes
//! 2. [`Stage::SniffFull`]: sniff the whole text
//! 3. [`Stage::ForcedSemicolon`]: parse with `;` without sniffing
//!
//! Records go through [`crate::casters::apply_registry`] once a stage succeeds.

use encoding_rs::Encoding;

use crate::casters::{RawTable, apply_registry, header_names};
use crate::error::{Error, Result};

use super::dialect::{Dialect, sniff};
use super::{ParsedTable, SourceKind};

/// One parse attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    SniffWindow,
    SniffFull,
    ForcedSemicolon,
}

impl Stage {
    fn next(self) -> Option<Stage> {
        match self {
            Stage::SniffWindow => Some(Stage::SniffFull),
            Stage::SniffFull => Some(Stage::ForcedSemicolon),
            Stage::ForcedSemicolon => None,
        }
    }

    fn dialect(self, text: &str, sniff_limit: usize, hint: Option<u8>) -> std::result::Result<Dialect, String> {
        match self {
            Stage::SniffWindow => sniff(text, Some(sniff_limit), hint).map_err(|e| e.to_string()),
            Stage::SniffFull => sniff(text, None, hint).map_err(|e| e.to_string()),
            Stage::ForcedSemicolon => Ok(Dialect::with_delimiter(b';')),
        }
    }
}

/// Decode `bytes` with `encoding` and parse them into a typed table.
///
/// `hint` is the detector's delimiter guess; it only breaks sniffing ties.
pub fn parse_csv(
    bytes: &[u8],
    encoding: &'static Encoding,
    sniff_limit: usize,
    hint: Option<u8>,
) -> Result<ParsedTable> {
    let (text, used, had_errors) = encoding.decode(bytes);
    if had_errors {
        tracing::warn!(
            target: "ingest",
            encoding = used.name(),
            "undecodable bytes replaced while decoding"
        );
    }

    let non_empty = text.lines().filter(|l| !l.trim().is_empty()).take(2).count();
    if non_empty < 2 {
        return Err(Error::parse(format!(
            "need a header and at least one data line, found {non_empty} non-empty line(s)"
        )));
    }

    let mut stage = Stage::SniffWindow;
    loop {
        let attempt = stage
            .dialect(&text, sniff_limit, hint)
            .and_then(|dialect| read_records(&text, dialect).map(|raw| (dialect, raw)));

        match attempt {
            Ok((dialect, raw)) => {
                tracing::debug!(
                    target: "ingest",
                    ?stage,
                    delimiter = %char::from(dialect.delimiter).escape_default(),
                    columns = raw.headers.len(),
                    rows = raw.rows.len(),
                    "parsed delimited text"
                );
                let table = apply_registry(raw)?;
                return Ok(ParsedTable {
                    table,
                    source_kind: SourceKind::Csv,
                    encoding: Some(used.name().to_string()),
                    delimiter: Some(char::from(dialect.delimiter)),
                });
            }
            Err(reason) => {
                tracing::debug!(target: "ingest", ?stage, %reason, "parse stage failed");
                match stage.next() {
                    Some(next) => stage = next,
                    None => return Err(Error::parse(reason)),
                }
            }
        }
    }
}

/// Read all records with a fixed dialect.
///
/// Short rows are padded with empty cells, extra trailing fields are dropped.
fn read_records(text: &str, dialect: Dialect) -> std::result::Result<RawTable, String> {
    let mut rdr = ::csv::ReaderBuilder::new()
        .delimiter(dialect.delimiter)
        .quote(dialect.quote)
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut records = rdr
        .records()
        .filter(|r| r.as_ref().map_or(true, |rec| rec.iter().any(|f| !f.trim().is_empty())));

    let header = match records.next() {
        Some(rec) => rec.map_err(|e| e.to_string())?,
        None => return Err("no header row".to_string()),
    };
    let headers = header_names(header.iter().map(str::to_string));
    let width = headers.len();

    let mut rows = Vec::new();
    let mut truncated = 0usize;
    for rec in records {
        let rec = rec.map_err(|e| e.to_string())?;
        if rec.len() > width {
            truncated += 1;
        }
        let mut row: Vec<String> = rec.iter().take(width).map(str::to_string).collect();
        row.resize(width, String::new());
        rows.push(row);
    }
    if rows.is_empty() {
        return Err("no data rows".to_string());
    }
    if truncated > 0 {
        tracing::warn!(
            target: "ingest",
            rows = truncated,
            width,
            "dropped fields beyond the header width"
        );
    }

    Ok(RawTable { headers, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnType, Value};
    use encoding_rs::UTF_8;

    fn parse(text: &str) -> Result<ParsedTable> {
        parse_csv(text.as_bytes(), UTF_8, 4096, None)
    }

    #[test]
    fn parses_semicolon_file() {
        let parsed = parse("col a;col b;col c\ndata à1;data b1;z\ndata ª2;data b2;a\n").unwrap();
        assert_eq!(parsed.delimiter, Some(';'));
        assert_eq!(parsed.encoding.as_deref(), Some("UTF-8"));
        let names: Vec<&str> = parsed.table.schema.field_names().collect();
        assert_eq!(names, vec!["col a", "col b", "col c"]);
        assert_eq!(parsed.table.rows[0][0], Value::Text("data à1".to_string()));
    }

    #[test]
    fn single_line_is_a_parse_error() {
        assert!(matches!(parse("a,b,c\n"), Err(Error::Parse { .. })));
        assert!(matches!(parse(""), Err(Error::Parse { .. })));
    }

    #[test]
    fn ragged_rows_are_padded_and_truncated() {
        let parsed = parse("a,b,c\n1,2\n3,4,5,6\n7,8,9\n").unwrap();
        assert_eq!(parsed.table.rows.len(), 3);
        assert_eq!(parsed.table.rows[0][2], Value::Null);
        assert_eq!(parsed.table.rows[1].len(), 3);
        assert_eq!(parsed.table.rows[1][2], Value::Number(5.0));
    }

    #[test]
    fn blank_headers_are_named_by_position() {
        let parsed = parse("id,,name\n1,x,Ada\n2,y,Grace\n").unwrap();
        let names: Vec<&str> = parsed.table.schema.field_names().collect();
        assert_eq!(names, vec!["id", "column_2", "name"]);
    }

    #[test]
    fn repeated_headers_are_kept_apart() {
        let parsed = parse("a;a;b\n1;2;x\n3;4;y\n").unwrap();
        let names: Vec<&str> = parsed.table.schema.field_names().collect();
        assert_eq!(names, vec!["a", "a_2", "b"]);
        assert_eq!(parsed.table.rows[0][0], Value::Number(1.0));
        assert_eq!(parsed.table.rows[0][1], Value::Number(2.0));
    }

    #[test]
    fn long_quoted_first_field_falls_back_to_full_sniff() {
        let description = "Relevé annuel, station nord\n".repeat(200);
        let text = format!(
            "description;valeur\n\"{description}\";12,5\nCourt;3\n"
        );
        assert!(text.len() > 4096);
        assert!(sniff(&text, Some(4096), Some(b',')).is_err());

        let parsed = parse_csv(text.as_bytes(), UTF_8, 4096, Some(b',')).unwrap();
        assert_eq!(parsed.delimiter, Some(';'));
        assert_eq!(parsed.table.row_count(), 2);
        assert_eq!(parsed.table.rows[0][0], Value::Text(description));
        assert_eq!(parsed.table.rows[0][1], Value::Number(12.5));
    }

    #[test]
    fn long_first_line_falls_back_to_full_sniff() {
        let header = (0..600).map(|i| format!("c{i}")).collect::<Vec<_>>().join("\t");
        let row = (0..600).map(|i| i.to_string()).collect::<Vec<_>>().join("\t");
        let text = format!("{header}\n{row}\n{row}\n");
        let parsed = parse_csv(text.as_bytes(), UTF_8, 64, None).unwrap();
        assert_eq!(parsed.delimiter, Some('\t'));
        assert_eq!(parsed.table.column_count(), 600);
    }

    #[test]
    fn single_column_falls_back_to_semicolon() {
        let parsed = parse("name\nAda\nGrace\n").unwrap();
        assert_eq!(parsed.delimiter, Some(';'));
        assert_eq!(parsed.table.column_count(), 1);
        assert_eq!(parsed.table.schema.fields[0].column_type, ColumnType::Text);
    }

    #[test]
    fn quoted_fields_keep_delimiters() {
        let parsed = parse("name,comment\n\"Doe, Jane\",ok\n\"Roe, Rick\",\"a, b\"\n").unwrap();
        assert_eq!(parsed.table.rows[0][0], Value::Text("Doe, Jane".to_string()));
        assert_eq!(parsed.table.rows[1][1], Value::Text("a, b".to_string()));
    }
}
