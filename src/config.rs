//! Service configuration.
//!
//! Every section has defaults, so an empty file (or none at all) is a valid configuration:
//!
//! ```toml
//! [storage]
//! db_root_dir = "./dbs"
//!
//! [cache]
//! enabled = true
//! # max_age_secs = 86400
//!
//! [ingestion]
//! sniff_limit = 4096
//! max_file_size = 104857600
//! allowed_hosts = ["data.gouv.fr"]
//! profile = true
//!
//! [query]
//! rows_limit = 100
//! time_limit_ms = 1000
//!
//! [workers]
//! max_workers = 3
//! # max_in_flight = 2
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheOptions;
use crate::error::{Error, Result};
use crate::execution::PoolOptions;
use crate::ingestion::unified::{DEFAULT_DETECT_SAMPLE_BYTES, DEFAULT_SNIFF_LIMIT};
use crate::query::{DEFAULT_MAX_PAGE_SIZE, DEFAULT_ROWS_LIMIT, QueryOptions};

/// Default download budget: 100 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub ingestion: IngestionConfig,
    pub query: QueryConfig,
    pub workers: WorkersConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the dataset files.
    pub db_root_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_root_dir: PathBuf::from("./dbs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Reuse datasets already ingested from the same bytes.
    pub enabled: bool,
    /// Treat datasets older than this as missing.
    pub max_age_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Bytes the first dialect sniff looks at.
    pub sniff_limit: usize,
    /// Bytes fed to the encoding detector.
    pub detect_sample_bytes: usize,
    /// Largest accepted source, in bytes.
    pub max_file_size: u64,
    pub download_timeout_secs: u64,
    /// Host suffixes sources may be fetched from; empty allows any host.
    pub allowed_hosts: Vec<String>,
    /// Compute and persist profile summaries after ingestion.
    pub profile: bool,
    /// Append ingestion events to this file.
    pub event_log: Option<PathBuf>,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            sniff_limit: DEFAULT_SNIFF_LIMIT,
            detect_sample_bytes: DEFAULT_DETECT_SAMPLE_BYTES,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            download_timeout_secs: 60,
            allowed_hosts: Vec::new(),
            profile: false,
            event_log: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Page size when a query does not set one.
    pub rows_limit: usize,
    pub max_page_size: usize,
    pub time_limit_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            rows_limit: DEFAULT_ROWS_LIMIT,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            time_limit_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub max_workers: usize,
    /// Cap on concurrently running jobs; `max_workers` when absent.
    pub max_in_flight: Option<usize>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_workers: crate::execution::DEFAULT_MAX_WORKERS,
            max_in_flight: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => Self::from_toml(&contents).map_err(|e| Error::Config {
                message: format!("{}: {e}", path.display()),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(target: "config", path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(Error::Config {
                message: format!("{}: {e}", path.display()),
            }),
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).map_err(|e| Error::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config {
            message: e.to_string(),
        })
    }

    fn validate(&self) -> Result<()> {
        let positive = [
            ("ingestion.sniff_limit", self.ingestion.sniff_limit as u64),
            ("ingestion.max_file_size", self.ingestion.max_file_size),
            ("ingestion.download_timeout_secs", self.ingestion.download_timeout_secs),
            ("query.rows_limit", self.query.rows_limit as u64),
            ("query.max_page_size", self.query.max_page_size as u64),
            ("workers.max_workers", self.workers.max_workers as u64),
            (
                "workers.max_in_flight",
                self.workers.max_in_flight.map_or(1, |n| n as u64),
            ),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Config {
                    message: format!("{name} must be greater than zero"),
                });
            }
        }
        Ok(())
    }

    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            enabled: self.cache.enabled,
            max_age: self.cache.max_age_secs.map(Duration::from_secs),
        }
    }

    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            default_limit: self.query.rows_limit,
            max_page_size: self.query.max_page_size,
            time_limit: Duration::from_millis(self.query.time_limit_ms),
        }
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_workers: self.workers.max_workers,
            max_in_flight: self.workers.max_in_flight,
        }
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.ingestion.download_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.storage.db_root_dir, PathBuf::from("./dbs"));
        assert!(c.cache.enabled);
        assert_eq!(c.ingestion.sniff_limit, 4096);
        assert_eq!(c.query.rows_limit, 100);
        assert_eq!(c.query.time_limit_ms, 1000);
        assert_eq!(c.workers.max_workers, 3);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let c = Config::from_toml(
            r#"
            [cache]
            enabled = false
            max_age_secs = 60

            [query]
            rows_limit = 20
            "#,
        )
        .unwrap();
        assert!(!c.cache.enabled);
        assert_eq!(c.cache_options().max_age, Some(Duration::from_secs(60)));
        assert_eq!(c.query_options().default_limit, 20);
        assert_eq!(c.query.time_limit_ms, 1000);
        assert_eq!(c.storage, StorageConfig::default());
    }

    #[test]
    fn round_trips_through_toml() {
        let c = Config::default();
        assert_eq!(Config::from_toml(&c.to_toml().unwrap()).unwrap(), c);
    }

    #[test]
    fn zero_limits_are_rejected() {
        assert!(matches!(
            Config::from_toml("[workers]\nmax_workers = 0\n"),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            Config::from_toml("[query]\nrows_limit = \"ten\"\n"),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn in_flight_bound_reaches_pool_options() {
        let c = Config::from_toml("[workers]\nmax_workers = 4\nmax_in_flight = 2\n").unwrap();
        assert_eq!(
            c.pool_options(),
            PoolOptions {
                max_workers: 4,
                max_in_flight: Some(2),
            }
        );
        assert_eq!(Config::default().pool_options().max_in_flight, None);
        assert!(matches!(
            Config::from_toml("[workers]\nmax_in_flight = 0\n"),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let c = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(c, Config::default());
    }
}
