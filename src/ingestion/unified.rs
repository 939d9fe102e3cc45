//! Unified ingestion entrypoint.
//!
//! Most callers should use [`ingest_bytes`], which turns the raw bytes of a source into a typed
//! [`super::ParsedTable`]:
//!
//! - The source kind is taken from the content ([`super::detect`]), never from a file name.
//! - Text goes through the staged CSV parser, workbooks through the spreadsheet decoder.
//! - If an [`IngestionObserver`] is provided, success/failure/alerts are reported to it.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

use super::observability::{IngestionContext, IngestionObserver, IngestionSeverity, IngestionStats};
use super::{ParsedTable, SourceKind, csv, detect};

/// Default number of bytes the first parse stage sniffs.
pub const DEFAULT_SNIFF_LIMIT: usize = 4096;
/// Default number of bytes fed to the encoding detector.
pub const DEFAULT_DETECT_SAMPLE_BYTES: usize = 64 * 1024;

/// Options controlling unified ingestion behavior.
///
/// Use [`Default`] for common cases.
#[derive(Clone)]
pub struct IngestionOptions {
    /// Bytes sniffed by the first parse stage.
    pub sniff_limit: usize,
    /// Bytes fed to the encoding detector.
    pub detect_sample_bytes: usize,
    /// Optional observer for logging/alerts.
    pub observer: Option<Arc<dyn IngestionObserver>>,
    /// Severity threshold at which `on_alert` is invoked.
    pub alert_at_or_above: IngestionSeverity,
}

impl fmt::Debug for IngestionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestionOptions")
            .field("sniff_limit", &self.sniff_limit)
            .field("detect_sample_bytes", &self.detect_sample_bytes)
            .field("observer_set", &self.observer.is_some())
            .field("alert_at_or_above", &self.alert_at_or_above)
            .finish()
    }
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            sniff_limit: DEFAULT_SNIFF_LIMIT,
            detect_sample_bytes: DEFAULT_DETECT_SAMPLE_BYTES,
            observer: None,
            alert_at_or_above: IngestionSeverity::Critical,
        }
    }
}

impl IngestionOptions {
    /// Report a successful ingestion to the observer, if any.
    pub fn report_success(&self, ctx: &IngestionContext, stats: IngestionStats) {
        if let Some(obs) = self.observer.as_ref() {
            obs.on_success(ctx, stats);
        }
    }

    /// Report a failed ingestion to the observer, alerting at or above the threshold.
    pub fn report_failure(&self, ctx: &IngestionContext, error: &Error) {
        if let Some(obs) = self.observer.as_ref() {
            let sev = IngestionSeverity::for_error(error);
            obs.on_failure(ctx, sev, error);
            if sev >= self.alert_at_or_above {
                obs.on_alert(ctx, sev, error);
            }
        }
    }
}

/// Detect, decode and type `bytes`.
///
/// Failures are reported to `options.observer`. Successes are not: whether a parsed table counts
/// as a successful ingestion is up to the caller (it may still fail to persist).
///
/// # Examples
///
/// ```
/// use rust_tabular_api::ingestion::{IngestionContext, IngestionOptions, IngestionSource, ingest_bytes};
/// use rust_tabular_api::types::ColumnType;
///
/// # fn main() -> Result<(), rust_tabular_api::Error> {
/// let bytes = b"siren;montant\n732829320;1 200,50\n552100554;80\n";
/// let ctx = IngestionContext::new(IngestionSource::Upload { bytes: bytes.len() });
/// let parsed = ingest_bytes(bytes, &ctx, &IngestionOptions::default())?;
///
/// assert_eq!(parsed.delimiter, Some(';'));
/// assert_eq!(parsed.table.schema.fields[0].column_type, ColumnType::Identifier);
/// assert_eq!(parsed.table.schema.fields[1].column_type, ColumnType::Number);
/// # Ok(())
/// # }
/// ```
pub fn ingest_bytes(
    bytes: &[u8],
    ctx: &IngestionContext,
    options: &IngestionOptions,
) -> Result<ParsedTable> {
    let mut ctx = ctx.clone();
    let result = detect::detect(bytes, options.detect_sample_bytes).and_then(|detection| {
        ctx.kind = Some(detection.kind);
        tracing::debug!(
            target: "ingest",
            kind = detection.kind.as_str(),
            encoding = detection.encoding.map(|e| e.name()),
            "detected source"
        );
        match (detection.kind, detection.encoding) {
            (SourceKind::Csv, Some(encoding)) => {
                csv::parse_csv(bytes, encoding, options.sniff_limit, detection.delimiter_hint)
            }
            (SourceKind::Csv, None) => Err(Error::internal("text source without an encoding")),
            (kind, _) => parse_spreadsheet_dispatch(bytes, kind),
        }
    });

    if let Err(e) = &result {
        options.report_failure(&ctx, e);
    }
    result
}

#[cfg_attr(not(feature = "excel"), allow(unused_variables))]
fn parse_spreadsheet_dispatch(bytes: &[u8], kind: SourceKind) -> Result<ParsedTable> {
    #[cfg(feature = "excel")]
    {
        super::excel::parse_spreadsheet(bytes, kind)
    }

    #[cfg(not(feature = "excel"))]
    {
        Err(Error::UnsupportedFileType {
            detail: format!("{} (spreadsheet support not enabled)", kind.as_str()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::IngestionSource;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        failures: Mutex<Vec<IngestionSeverity>>,
        alerts: Mutex<usize>,
    }

    impl IngestionObserver for Recorder {
        fn on_failure(&self, _ctx: &IngestionContext, severity: IngestionSeverity, _error: &Error) {
            self.failures.lock().unwrap().push(severity);
        }

        fn on_alert(&self, _ctx: &IngestionContext, _severity: IngestionSeverity, _error: &Error) {
            *self.alerts.lock().unwrap() += 1;
        }
    }

    fn ctx() -> IngestionContext {
        IngestionContext::new(IngestionSource::Upload { bytes: 0 })
    }

    #[test]
    fn failures_reach_the_observer() {
        let rec = Arc::new(Recorder::default());
        let opts = IngestionOptions {
            observer: Some(rec.clone()),
            alert_at_or_above: IngestionSeverity::Error,
            ..Default::default()
        };
        let err = ingest_bytes(b"only one line\n", &ctx(), &opts).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        assert_eq!(*rec.failures.lock().unwrap(), vec![IngestionSeverity::Error]);
        assert_eq!(*rec.alerts.lock().unwrap(), 1);
    }

    #[test]
    fn below_threshold_does_not_alert() {
        let rec = Arc::new(Recorder::default());
        let opts = IngestionOptions {
            observer: Some(rec.clone()),
            ..Default::default()
        };
        let _ = ingest_bytes(b"%PDF-1.4 whatever", &ctx(), &opts).unwrap_err();
        assert_eq!(rec.failures.lock().unwrap().len(), 1);
        assert_eq!(*rec.alerts.lock().unwrap(), 0);
    }

    #[cfg(feature = "excel")]
    #[test]
    fn spreadsheet_bytes_reach_the_decoder() {
        let err = parse_spreadsheet_dispatch(b"PK\x03\x04 truncated", SourceKind::OoxmlSpreadsheet)
            .unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[cfg(not(feature = "excel"))]
    #[test]
    fn spreadsheets_need_the_excel_feature() {
        let err = parse_spreadsheet_dispatch(b"", SourceKind::LegacySpreadsheet).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFileType { .. }));
    }
}
