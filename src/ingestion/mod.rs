//! Ingestion entrypoints and implementations.
//!
//! Most callers should use [`ingest_bytes`] (from [`unified`]) which:
//!
//! - classifies the bytes by content signature ([`detect`])
//! - parses text sources with the staged dialect strategy ([`csv`]) or decodes the first sheet of
//!   a workbook ([`excel`], feature-gated)
//! - runs the caster registry to produce a typed [`crate::types::Table`]
//! - optionally reports success/failure/alerts to an [`IngestionObserver`]
//!
//! Remote sources are fetched through [`download`], which enforces the byte budget.

use serde::{Deserialize, Serialize};

use crate::types::Table;

pub mod csv;
pub mod detect;
pub mod dialect;
pub mod download;
#[cfg(feature = "excel")]
pub mod excel;
pub mod observability;
pub mod unified;

pub use detect::{Detection, detect, detect_encoding};
pub use download::{HttpFetcher, SourceFetcher, read_capped, validate_url};
pub use observability::{
    CompositeObserver, FileObserver, IngestionContext, IngestionObserver, IngestionSeverity,
    IngestionSource, IngestionStats, TracingObserver,
};
pub use unified::{IngestionOptions, ingest_bytes};

/// What kind of file a dataset was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Delimited text.
    Csv,
    /// OLE compound document (`.xls`).
    LegacySpreadsheet,
    /// Office Open XML workbook (`.xlsx`).
    OoxmlSpreadsheet,
}

impl SourceKind {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Csv => "csv",
            SourceKind::LegacySpreadsheet => "legacy_spreadsheet",
            SourceKind::OoxmlSpreadsheet => "ooxml_spreadsheet",
        }
    }
}

/// A typed table plus how it was read.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTable {
    pub table: Table,
    pub source_kind: SourceKind,
    /// Encoding label for text sources (`"UTF-8"`, `"windows-1252"`, ...).
    pub encoding: Option<String>,
    /// Delimiter the parser settled on, for text sources.
    pub delimiter: Option<char>,
}
