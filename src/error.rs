use std::any::Any;
use std::panic::{self, UnwindSafe};

use serde::Serialize;
use thiserror::Error;

/// Convenience result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the persistence layer.
///
/// Kept separate from [`Error`] so parse failures and storage failures never get confused.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying I/O error (disk full, permission denied, ...).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Parquet encoding/decoding error.
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Embedded or sidecar metadata could not be (de)serialized.
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// The persisted file does not match the expected layout.
    #[error("corrupt dataset '{identity}': {message}")]
    Corrupt { identity: String, message: String },
}

/// Error type returned by ingestion, cache, storage and query operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The source is neither plain text nor a supported spreadsheet.
    #[error("unsupported file type: {detail}")]
    UnsupportedFileType { detail: String },

    /// Every parse stage failed, or the source has fewer than two lines.
    #[error("failed to parse table: {message}")]
    Parse { message: String },

    /// The download was aborted because it exceeded the byte budget.
    #[error("download exceeds the {limit} byte budget")]
    DownloadTooLarge { limit: u64 },

    /// The transport failed (connection, HTTP status, timeout).
    #[error("download failed: {message}")]
    Download { message: String },

    /// Persisting or reading a table failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Non-numeric operand for a numeric comparator.
    #[error("invalid value '{value}' for filter '{column}__{comparator}': expected a number")]
    InvalidFilterValue {
        column: String,
        comparator: String,
        value: String,
    },

    /// Unknown `_shape`.
    #[error("unknown _shape: {0}")]
    UnknownShape(String),

    /// A filter or sort referenced a column the dataset does not have.
    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    /// A request parameter could not be interpreted.
    #[error("invalid value '{value}' for parameter '{name}'")]
    InvalidParameter { name: String, value: String },

    /// A profiling report is missing required keys.
    #[error("invalid profile report: {message}")]
    InvalidProfile { message: String },

    /// Configuration could not be loaded.
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// No persisted table for this identity.
    #[error("dataset '{0}' not found")]
    NotFound(String),

    /// The query exceeded its execution deadline.
    #[error("query interrupted after {elapsed_ms} ms")]
    Interrupted { elapsed_ms: u64 },

    /// Anything unexpected. The message is logged, never returned to callers.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(StorageError::Io(err))
    }
}

impl From<parquet::errors::ParquetError> for Error {
    fn from(err: parquet::errors::ParquetError) -> Self {
        Error::Storage(StorageError::Parquet(err))
    }
}

/// Stable, coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnsupportedFileType,
    ParseError,
    DownloadTooLarge,
    DownloadError,
    StorageError,
    InvalidFilterValue,
    UnknownShape,
    UnknownColumn,
    InvalidParameter,
    InvalidProfile,
    ConfigError,
    NotFound,
    Interrupted,
    Internal,
}

impl ErrorKind {
    /// Stable identifier carried in error responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnsupportedFileType => "unsupported_file_type",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::DownloadTooLarge => "download_too_large",
            ErrorKind::DownloadError => "download_error",
            ErrorKind::StorageError => "storage_error",
            ErrorKind::InvalidFilterValue => "invalid_filter_value",
            ErrorKind::UnknownShape => "unknown_shape",
            ErrorKind::UnknownColumn => "unknown_column",
            ErrorKind::InvalidParameter => "invalid_parameter",
            ErrorKind::InvalidProfile => "invalid_profile",
            ErrorKind::ConfigError => "config_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Internal => "internal",
        }
    }

    /// HTTP status an adapter should answer with.
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::InvalidFilterValue
            | ErrorKind::UnknownShape
            | ErrorKind::UnknownColumn
            | ErrorKind::InvalidParameter
            | ErrorKind::Interrupted => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::DownloadTooLarge => 413,
            ErrorKind::UnsupportedFileType => 415,
            ErrorKind::ParseError | ErrorKind::InvalidProfile => 422,
            ErrorKind::DownloadError => 502,
            ErrorKind::StorageError | ErrorKind::ConfigError | ErrorKind::Internal => 500,
        }
    }

    /// Whether the failure belongs to the request rather than the service.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status())
    }
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnsupportedFileType { .. } => ErrorKind::UnsupportedFileType,
            Error::Parse { .. } => ErrorKind::ParseError,
            Error::DownloadTooLarge { .. } => ErrorKind::DownloadTooLarge,
            Error::Download { .. } => ErrorKind::DownloadError,
            Error::Storage(_) => ErrorKind::StorageError,
            Error::InvalidFilterValue { .. } => ErrorKind::InvalidFilterValue,
            Error::UnknownShape(_) => ErrorKind::UnknownShape,
            Error::UnknownColumn(_) => ErrorKind::UnknownColumn,
            Error::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            Error::InvalidProfile { .. } => ErrorKind::InvalidProfile,
            Error::Config { .. } => ErrorKind::ConfigError,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Interrupted { .. } => ErrorKind::Interrupted,
            Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub(crate) fn parse(message: impl Into<String>) -> Self {
        Error::Parse {
            message: message.into(),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }
}

/// Structured error body for the HTTP layer.
///
/// Storage and internal failures carry a generic message only; the detail is logged instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: String,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip)]
    pub status: u16,
}

impl ErrorResponse {
    /// Generic response for unclassified failures.
    pub fn internal() -> Self {
        Self::generic(ErrorKind::Internal, "Internal error")
    }

    fn generic(kind: ErrorKind, message: &str) -> Self {
        Self {
            ok: false,
            error: message.to_string(),
            kind: kind.as_str(),
            details: None,
            status: kind.status(),
        }
    }
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        let kind = err.kind();
        match kind {
            ErrorKind::Internal | ErrorKind::ConfigError => Self::internal(),
            ErrorKind::StorageError => Self::generic(kind, "Error reading or writing data"),
            ErrorKind::Interrupted => Self {
                ok: false,
                error: "Error selecting data".to_string(),
                kind: kind.as_str(),
                details: Some("interrupted".to_string()),
                status: kind.status(),
            },
            _ => Self {
                ok: false,
                error: err.to_string(),
                kind: kind.as_str(),
                details: None,
                status: kind.status(),
            },
        }
    }
}

/// Run `f` at the API boundary: classified errors become structured responses, panics become a
/// generic internal error. Both are logged.
pub fn guard<T, F>(f: F) -> std::result::Result<T, ErrorResponse>
where
    F: FnOnce() -> Result<T> + UnwindSafe,
{
    match panic::catch_unwind(f) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            if err.kind().is_client_error() {
                tracing::info!(target: "api", kind = err.kind().as_str(), error = %err, "request rejected");
            } else {
                tracing::error!(target: "api", kind = err.kind().as_str(), error = %err, "request failed");
            }
            Err(ErrorResponse::from(&err))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(target: "api", panic = %message, "unexpected failure");
            Err(ErrorResponse::internal())
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_error_classes() {
        assert_eq!(Error::UnknownShape("toto".into()).kind().status(), 400);
        assert_eq!(Error::NotFound("abc".into()).kind().status(), 404);
        assert_eq!(Error::DownloadTooLarge { limit: 1 }.kind().status(), 413);
        assert_eq!(
            Error::UnsupportedFileType {
                detail: "pdf".into()
            }
            .kind()
            .status(),
            415
        );
    }

    #[test]
    fn guard_hides_panic_details() {
        let resp = guard(|| -> Result<()> { panic!("secret path /var/lib/x") }).unwrap_err();
        assert_eq!(resp.status, 500);
        assert_eq!(resp.kind, "internal");
        assert!(!resp.error.contains("secret"));
    }

    #[test]
    fn guard_maps_client_errors() {
        let resp = guard(|| -> Result<()> { Err(Error::UnknownShape("toto".into())) }).unwrap_err();
        assert_eq!(resp.status, 400);
        assert!(!resp.ok);
        assert!(resp.error.contains("toto"));
    }

    #[test]
    fn storage_errors_do_not_leak_detail() {
        let err = Error::from(std::io::Error::other("/srv/dbs/abc.parquet: disk full"));
        let resp = ErrorResponse::from(&err);
        assert_eq!(resp.status, 500);
        assert!(!resp.error.contains("/srv"));
    }
}
