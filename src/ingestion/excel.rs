#![cfg(feature = "excel")]

//! Spreadsheet decoding.
//!
//! Only the first sheet is read. Its first non-empty row is the header; cells are rendered to text
//! and typed by the same caster registry as delimited sources.

use std::io::{Cursor, Read, Seek};

use calamine::{Data, DataType, Range, Reader, Xls, Xlsx, open_workbook_from_rs};

use crate::casters::{RawTable, apply_registry, header_names};
use crate::error::{Error, Result};

use super::{ParsedTable, SourceKind};

/// Decode the first sheet of a workbook held in memory.
///
/// `kind` must be one of the spreadsheet kinds returned by [`super::detect`].
pub fn parse_spreadsheet(bytes: &[u8], kind: SourceKind) -> Result<ParsedTable> {
    let cursor = Cursor::new(bytes);
    let range = match kind {
        SourceKind::OoxmlSpreadsheet => {
            let mut workbook: Xlsx<_> = open_workbook_from_rs(cursor)
                .map_err(|e| Error::parse(format!("cannot open workbook: {e}")))?;
            first_sheet(&mut workbook)?
        }
        SourceKind::LegacySpreadsheet => {
            let mut workbook: Xls<_> = open_workbook_from_rs(cursor)
                .map_err(|e| Error::parse(format!("cannot open workbook: {e}")))?;
            first_sheet(&mut workbook)?
        }
        SourceKind::Csv => {
            return Err(Error::internal("delimited text passed to spreadsheet decoder"));
        }
    };

    let raw = range_to_raw(&range)?;
    tracing::debug!(
        target: "ingest",
        kind = kind.as_str(),
        columns = raw.headers.len(),
        rows = raw.rows.len(),
        "decoded first sheet"
    );
    Ok(ParsedTable {
        table: apply_registry(raw)?,
        source_kind: kind,
        encoding: None,
        delimiter: None,
    })
}

fn first_sheet<RS, R>(workbook: &mut R) -> Result<Range<Data>>
where
    RS: Read + Seek,
    R: Reader<RS>,
    R::Error: std::fmt::Display,
{
    match workbook.worksheet_range_at(0) {
        Some(Ok(range)) => Ok(range),
        Some(Err(e)) => Err(Error::parse(format!("cannot read first sheet: {e}"))),
        None => Err(Error::parse("workbook has no sheets")),
    }
}

fn range_to_raw(range: &Range<Data>) -> Result<RawTable> {
    let mut rows = range
        .rows()
        .filter(|row| row.iter().any(|c| !is_blank(c)));

    let header = rows
        .next()
        .ok_or_else(|| Error::parse("sheet has no non-empty rows"))?;
    let headers = header_names(header.iter().map(cell_to_string));
    let width = headers.len();

    let body: Vec<Vec<String>> = rows
        .map(|row| {
            let mut out: Vec<String> = row.iter().take(width).map(cell_to_string).collect();
            out.resize(width, String::new());
            out
        })
        .collect();
    if body.is_empty() {
        return Err(Error::parse("sheet has a header but no data rows"));
    }

    Ok(RawTable {
        headers,
        rows: body,
    })
}

fn is_blank(c: &Data) -> bool {
    match c {
        Data::Empty => true,
        Data::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn cell_to_string(c: &Data) -> String {
    match c {
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 1e15 {
                (*f as i64).to_string()
            } else {
                f.to_string()
            }
        }
        Data::Bool(b) => b.to_string(),
        Data::DateTime(_) => match c.as_datetime() {
            Some(dt) if dt.time() == chrono::NaiveTime::MIN => dt.format("%Y-%m-%d").to_string(),
            Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
            None => c.to_string(),
        },
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(_) | Data::Empty => String::new(),
    }
}
