use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Error, ErrorKind};

use super::SourceKind;

/// Severity classification used for observer callbacks and alerting thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IngestionSeverity {
    /// Informational event.
    Info,
    /// Warning-level event (non-fatal).
    Warning,
    /// Error-level event (operation failed).
    Error,
    /// Critical error (typically I/O or other infrastructure failures).
    Critical,
}

impl IngestionSeverity {
    /// Severity of a failed ingestion.
    ///
    /// Problems with the source itself are plain errors; failures of our own infrastructure
    /// (disk, parquet, bugs) are critical.
    pub fn for_error(error: &Error) -> Self {
        match error.kind() {
            ErrorKind::StorageError | ErrorKind::Internal | ErrorKind::ConfigError => {
                IngestionSeverity::Critical
            }
            ErrorKind::DownloadError => IngestionSeverity::Warning,
            _ => IngestionSeverity::Error,
        }
    }
}

/// Where the bytes of an ingestion came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionSource {
    /// Fetched from a URL.
    Url(String),
    /// Uploaded directly.
    Upload { bytes: usize },
}

impl fmt::Display for IngestionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestionSource::Url(url) => write!(f, "url={url}"),
            IngestionSource::Upload { bytes } => write!(f, "upload bytes={bytes}"),
        }
    }
}

/// Context about an ingestion attempt.
#[derive(Debug, Clone)]
pub struct IngestionContext {
    /// Content identity, once the bytes are known.
    pub identity: Option<String>,
    pub source: IngestionSource,
    /// Detected kind, once detection ran.
    pub kind: Option<SourceKind>,
}

impl IngestionContext {
    pub fn new(source: IngestionSource) -> Self {
        Self {
            identity: None,
            source,
            kind: None,
        }
    }

    fn identity_str(&self) -> &str {
        self.identity.as_deref().unwrap_or("-")
    }

    fn kind_str(&self) -> &'static str {
        self.kind.map_or("-", |k| k.as_str())
    }
}

/// Stats reported on successful ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestionStats {
    /// Number of data rows.
    pub rows: usize,
    /// Number of columns.
    pub columns: usize,
    /// `true` when the dataset was served from the cache and nothing was parsed.
    pub cached: bool,
}

/// Observer interface for ingestion outcomes.
///
/// Implementors can record metrics, logs, or trigger alerts.
pub trait IngestionObserver: Send + Sync {
    /// Called when ingestion succeeds.
    fn on_success(&self, _ctx: &IngestionContext, _stats: IngestionStats) {}

    /// Called when ingestion fails.
    fn on_failure(&self, _ctx: &IngestionContext, _severity: IngestionSeverity, _error: &Error) {}

    /// Called when an ingestion failure meets an alert threshold.
    ///
    /// Default behavior forwards to [`Self::on_failure`].
    fn on_alert(&self, ctx: &IngestionContext, severity: IngestionSeverity, error: &Error) {
        self.on_failure(ctx, severity, error)
    }
}

/// An observer that fans out callbacks to a list of observers.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn IngestionObserver>>,
}

impl CompositeObserver {
    /// Create a new composite observer from a list of observers.
    pub fn new(observers: Vec<Arc<dyn IngestionObserver>>) -> Self {
        Self { observers }
    }
}

impl fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("observers_len", &self.observers.len())
            .finish()
    }
}

impl IngestionObserver for CompositeObserver {
    fn on_success(&self, ctx: &IngestionContext, stats: IngestionStats) {
        for o in &self.observers {
            o.on_success(ctx, stats);
        }
    }

    fn on_failure(&self, ctx: &IngestionContext, severity: IngestionSeverity, error: &Error) {
        for o in &self.observers {
            o.on_failure(ctx, severity, error);
        }
    }

    fn on_alert(&self, ctx: &IngestionContext, severity: IngestionSeverity, error: &Error) {
        for o in &self.observers {
            o.on_alert(ctx, severity, error);
        }
    }
}

/// Emits ingestion events as `tracing` events under the `ingest` target.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl IngestionObserver for TracingObserver {
    fn on_success(&self, ctx: &IngestionContext, stats: IngestionStats) {
        tracing::info!(
            target: "ingest",
            identity = ctx.identity_str(),
            source = %ctx.source,
            kind = ctx.kind_str(),
            rows = stats.rows,
            columns = stats.columns,
            cached = stats.cached,
            "ingestion succeeded"
        );
    }

    fn on_failure(&self, ctx: &IngestionContext, severity: IngestionSeverity, error: &Error) {
        match severity {
            IngestionSeverity::Info | IngestionSeverity::Warning => tracing::warn!(
                target: "ingest",
                identity = ctx.identity_str(),
                source = %ctx.source,
                ?severity,
                %error,
                "ingestion failed"
            ),
            IngestionSeverity::Error | IngestionSeverity::Critical => tracing::error!(
                target: "ingest",
                identity = ctx.identity_str(),
                source = %ctx.source,
                ?severity,
                %error,
                "ingestion failed"
            ),
        }
    }

    fn on_alert(&self, ctx: &IngestionContext, severity: IngestionSeverity, error: &Error) {
        tracing::error!(
            target: "ingest",
            alert = true,
            identity = ctx.identity_str(),
            source = %ctx.source,
            ?severity,
            %error,
            "ingestion alert"
        );
    }
}

/// Appends ingestion events to a local log file.
#[derive(Debug)]
pub struct FileObserver {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileObserver {
    /// Create a file observer that appends events to `path`.
    ///
    /// Writes are best-effort; failures to open/write the log file are ignored.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn append_line(&self, line: &str) {
        let _guard = self.lock.lock().ok();
        if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(&self.path) {
            let _ = writeln!(f, "{line}");
        }
    }
}

impl IngestionObserver for FileObserver {
    fn on_success(&self, ctx: &IngestionContext, stats: IngestionStats) {
        self.append_line(&format!(
            "{} ok identity={} kind={} {} rows={} columns={} cached={}",
            timestamp(),
            ctx.identity_str(),
            ctx.kind_str(),
            ctx.source,
            stats.rows,
            stats.columns,
            stats.cached
        ));
    }

    fn on_failure(&self, ctx: &IngestionContext, severity: IngestionSeverity, error: &Error) {
        self.append_line(&format!(
            "{} fail severity={:?} identity={} kind={} {} err={}",
            timestamp(),
            severity,
            ctx.identity_str(),
            ctx.kind_str(),
            ctx.source,
            error
        ));
    }

    fn on_alert(&self, ctx: &IngestionContext, severity: IngestionSeverity, error: &Error) {
        self.append_line(&format!(
            "{} ALERT severity={:?} identity={} kind={} {} err={}",
            timestamp(),
            severity,
            ctx.identity_str(),
            ctx.kind_str(),
            ctx.source,
            error
        ));
    }
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
