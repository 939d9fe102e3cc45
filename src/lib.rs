//! `rust-tabular-api` turns CSV files and spreadsheets, fetched by URL or uploaded, into cached,
//! typed datasets that can be filtered, sorted, paginated and exported.
//!
//! The pipeline, leaves first:
//!
//! - [`casters`]: the type caster registry that decides each column's [`types::ColumnType`]
//! - [`ingestion`]: content-based file detection, encoding and dialect sniffing with staged
//!   fallbacks, spreadsheet decoding, byte-capped downloads, and ingestion observers
//! - [`storage`]: one Parquet file per dataset, replaced atomically, read through open handles
//! - [`cache`]: content-addressed identities, freshness, per-identity ingestion guard, URL aliases
//! - [`query`]: filters, sort, pagination, export, under a cooperative deadline
//! - [`profile`]: profile summaries persisted next to a dataset
//! - [`service`]: [`service::TabularService`], which wires all of the above onto a
//!   [`execution::WorkerPool`]
//!
//! Ambient pieces: [`config`] (TOML settings), [`logging`] (`tracing` subscriber setup) and
//! [`error`] (error kinds, HTTP status classes and structured responses).
//!
//! ## Quick example
//!
//! ```rust
//! use rust_tabular_api::query::{Query, Rows};
//! use rust_tabular_api::service::TabularService;
//!
//! # fn main() -> Result<(), rust_tabular_api::Error> {
//! let dir = tempfile::tempdir()?;
//! let service = TabularService::open(dir.path())?;
//!
//! let dataset = service.upload(b"ville;population\nLyon;522250\nNantes;320732\n".to_vec())?;
//! let query = Query::from_params([("population__greater", "400000"), ("_rowid", "hide")])?;
//! let page = service.query(&dataset.identity, &query)?;
//!
//! assert_eq!(page.columns, vec!["ville", "population"]);
//! assert_eq!(page.total, Some(1));
//! assert!(matches!(page.rows, Rows::Lists(ref rows) if rows[0][0] == "Lyon"));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod casters;
pub mod config;
pub mod error;
pub mod execution;
pub mod ingestion;
pub mod logging;
pub mod profile;
pub mod query;
pub mod service;
pub mod storage;
pub mod types;

pub use error::{Error, ErrorKind, ErrorResponse, Result};
