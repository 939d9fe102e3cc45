//! The service facade: ingestion under the cache, plus read access to stored datasets.
//!
//! [`TabularService`] owns every collaborator (store, worker pool, fetcher, observers, profiler)
//! and is meant to be built once and shared behind an `Arc`. Blocking work is throttled by its
//! [`WorkerPool`].
//!
//! ```no_run
//! use rust_tabular_api::config::Config;
//! use rust_tabular_api::query::Query;
//! use rust_tabular_api::service::TabularService;
//!
//! # fn main() -> Result<(), rust_tabular_api::Error> {
//! let service = TabularService::from_config(&Config::load("tabular.toml")?)?;
//! let dataset = service.apify("https://example.com/communes.csv")?;
//! let page = service.query(&dataset.identity, &Query::from_params([("_size", "10")])?)?;
//! println!("{} of {:?} rows", page.rows.len(), page.total);
//! # Ok(())
//! # }
//! ```

use std::io::Write;
use std::sync::Arc;

use crate::cache::{ContentStore, DatasetRef, content_identity};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::execution::{PoolOptions, TracingPoolObserver, WorkerPool};
use crate::ingestion::{
    CompositeObserver, FileObserver, HttpFetcher, IngestionContext, IngestionObserver,
    IngestionOptions, IngestionSource, IngestionStats, SourceFetcher, TracingObserver, ingest_bytes,
    validate_url,
};
use crate::profile::{BasicProfiler, Profiler, store_profile};
use crate::query::{Description, ExportQuery, ExportRows, Query, QueryEngine, QueryOptions, QueryResult};
use crate::storage::{TableMeta, TableStore};

/// Ingestion limits applied by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLimits {
    /// Largest accepted source, in bytes.
    pub max_file_size: u64,
    /// Host suffixes URLs may point to; empty allows any host.
    pub allowed_hosts: Vec<String>,
}

impl Default for SourceLimits {
    fn default() -> Self {
        Self {
            max_file_size: crate::config::DEFAULT_MAX_FILE_SIZE,
            allowed_hosts: Vec::new(),
        }
    }
}

/// Turns sources into cached datasets and answers queries on them.
pub struct TabularService {
    cache: ContentStore,
    pool: WorkerPool,
    fetcher: Arc<dyn SourceFetcher>,
    ingestion: IngestionOptions,
    limits: SourceLimits,
    query_options: QueryOptions,
    profiler: Option<Arc<dyn Profiler>>,
}

impl std::fmt::Debug for TabularService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabularService")
            .field("cache", &self.cache)
            .field("pool", &self.pool)
            .field("ingestion", &self.ingestion)
            .field("limits", &self.limits)
            .field("query_options", &self.query_options)
            .field("profiler_set", &self.profiler.is_some())
            .finish()
    }
}

impl TabularService {
    /// Assemble a service from explicit parts. Use the `with_*` methods to swap collaborators.
    pub fn new(cache: ContentStore, pool: WorkerPool, fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self {
            cache,
            pool,
            fetcher,
            ingestion: IngestionOptions::default(),
            limits: SourceLimits::default(),
            query_options: QueryOptions::default(),
            profiler: None,
        }
    }

    /// Build everything from configuration: HTTP fetcher, tracing (and optionally file)
    /// observers, and the in-process profiler when `ingestion.profile` is set.
    ///
    /// Also installs the `tracing` subscriber for `logging.filter`, unless one is already set.
    pub fn from_config(config: &Config) -> Result<Self> {
        if !crate::logging::init(&config.logging.filter) {
            tracing::debug!(target: "config", "subscriber already installed, keeping it");
        }
        let store = TableStore::open(&config.storage.db_root_dir)?;
        let cache = ContentStore::new(store, config.cache_options())?;
        let pool = WorkerPool::with_observer(config.pool_options(), Arc::new(TracingPoolObserver))?;
        let fetcher = Arc::new(HttpFetcher::new(config.download_timeout())?);

        let mut observers: Vec<Arc<dyn IngestionObserver>> = vec![Arc::new(TracingObserver)];
        if let Some(path) = &config.ingestion.event_log {
            observers.push(Arc::new(FileObserver::new(path)));
        }
        let ingestion = IngestionOptions {
            sniff_limit: config.ingestion.sniff_limit,
            detect_sample_bytes: config.ingestion.detect_sample_bytes,
            observer: Some(Arc::new(CompositeObserver::new(observers))),
            ..IngestionOptions::default()
        };
        let profiler: Option<Arc<dyn Profiler>> = if config.ingestion.profile {
            Some(Arc::new(BasicProfiler))
        } else {
            None
        };

        tracing::info!(
            target: "config",
            root = %config.storage.db_root_dir.display(),
            cache = config.cache.enabled,
            workers = config.workers.max_workers,
            in_flight = ?config.workers.max_in_flight,
            "service configured"
        );
        Ok(Self::new(cache, pool, fetcher)
            .with_ingestion_options(ingestion)
            .with_limits(SourceLimits {
                max_file_size: config.ingestion.max_file_size,
                allowed_hosts: config.ingestion.allowed_hosts.clone(),
            })
            .with_query_options(config.query_options())
            .with_profiler(profiler))
    }

    /// Service over `root` with default settings and a plain HTTP fetcher.
    pub fn open(root: impl AsRef<std::path::Path>) -> Result<Self> {
        let cache = ContentStore::new(TableStore::open(root)?, Default::default())?;
        let pool = WorkerPool::new(PoolOptions::default())?;
        let fetcher = Arc::new(HttpFetcher::new(Config::default().download_timeout())?);
        Ok(Self::new(cache, pool, fetcher))
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_ingestion_options(mut self, options: IngestionOptions) -> Self {
        self.ingestion = options;
        self
    }

    pub fn with_limits(mut self, limits: SourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_query_options(mut self, options: QueryOptions) -> Self {
        self.query_options = options;
        self
    }

    pub fn with_profiler(mut self, profiler: Option<Arc<dyn Profiler>>) -> Self {
        self.profiler = profiler;
        self
    }

    pub fn cache(&self) -> &ContentStore {
        &self.cache
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Fetch `url` and ingest it.
    ///
    /// A URL fetched before whose dataset is still fresh is answered from the alias index
    /// without downloading.
    pub fn apify(&self, url: &str) -> Result<DatasetRef> {
        let mut ctx = IngestionContext::new(IngestionSource::Url(url.to_string()));
        let url = match validate_url(url, &self.limits.allowed_hosts) {
            Ok(url) => url,
            Err(e) => {
                self.ingestion.report_failure(&ctx, &e);
                return Err(e);
            }
        };

        self.pool.run(|| {
            match self.cache.resolve_alias(url.as_str()) {
                Ok(Some(identity)) => {
                    ctx.identity = Some(identity.clone());
                    return self.serve_cached(&ctx, &identity);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(target: "cache", %url, error = %e, "unreadable alias"),
            }

            let bytes = match self.fetcher.fetch(&url, self.limits.max_file_size) {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.ingestion.report_failure(&ctx, &e);
                    return Err(e);
                }
            };
            let dataset = self.ingest(bytes, ctx)?;
            if let Err(e) = self.cache.record_alias(url.as_str(), &dataset.identity) {
                tracing::warn!(target: "cache", %url, error = %e, "cannot record alias");
            }
            Ok(dataset)
        })
    }

    /// Ingest uploaded bytes.
    pub fn upload(&self, bytes: Vec<u8>) -> Result<DatasetRef> {
        let ctx = IngestionContext::new(IngestionSource::Upload { bytes: bytes.len() });
        if bytes.len() as u64 > self.limits.max_file_size {
            let e = Error::DownloadTooLarge {
                limit: self.limits.max_file_size,
            };
            self.ingestion.report_failure(&ctx, &e);
            return Err(e);
        }
        self.pool.run(|| self.ingest(bytes, ctx))
    }

    fn serve_cached(&self, ctx: &IngestionContext, identity: &str) -> Result<DatasetRef> {
        let dataset = self.cache.get(identity)?;
        tracing::debug!(target: "cache", %identity, "cache hit, skipping parse");
        let mut ctx = ctx.clone();
        ctx.kind = Some(dataset.source_kind);
        self.ingestion.report_success(
            &ctx,
            IngestionStats {
                rows: dataset.row_count,
                columns: dataset.column_count,
                cached: true,
            },
        );
        Ok(dataset)
    }

    /// Hash, check the cache, then detect, parse and persist.
    fn ingest(&self, bytes: Vec<u8>, mut ctx: IngestionContext) -> Result<DatasetRef> {
        let identity = content_identity(&bytes);
        ctx.identity = Some(identity.clone());

        let _guard = self.cache.lock(&identity);
        if self.cache.exists(&identity) {
            return self.serve_cached(&ctx, &identity);
        }

        // Failures are reported below, once, with the full context.
        let parse_options = IngestionOptions {
            observer: None,
            ..self.ingestion.clone()
        };
        let stored = ingest_bytes(&bytes, &ctx, &parse_options).and_then(|parsed| {
            ctx.kind = Some(parsed.source_kind);
            let meta = TableMeta::for_parsed(&identity, &parsed);
            let dataset = self.cache.put(&parsed.table, &meta)?;
            self.profile(&parsed.table, &meta);
            Ok(dataset)
        });

        match stored {
            Ok(dataset) => {
                self.ingestion.report_success(
                    &ctx,
                    IngestionStats {
                        rows: dataset.row_count,
                        columns: dataset.column_count,
                        cached: false,
                    },
                );
                Ok(dataset)
            }
            Err(e) => {
                self.ingestion.report_failure(&ctx, &e);
                Err(e)
            }
        }
    }

    /// Profiling is best effort: the dataset is already queryable, so failures are only logged.
    fn profile(&self, table: &crate::types::Table, meta: &TableMeta) {
        let Some(profiler) = &self.profiler else {
            return;
        };
        let outcome = profiler
            .profile(table)
            .and_then(|report| store_profile(self.cache.store(), meta, &report));
        if let Err(e) = outcome {
            tracing::warn!(target: "ingest", identity = %meta.identity, error = %e, "profiling failed");
        }
    }

    fn engine(&self) -> QueryEngine<'_> {
        QueryEngine::new(self.cache.store(), self.query_options)
    }

    /// One page of `identity` matching `query`.
    pub fn query(&self, identity: &str, query: &Query) -> Result<QueryResult> {
        self.pool.run(|| self.engine().execute(identity, query))
    }

    /// Lazy export on the calling thread.
    pub fn export(&self, identity: &str, query: &ExportQuery) -> Result<ExportRows> {
        self.engine().export(identity, query)
    }

    /// Export as CSV into `writer` on the pool. Returns the number of data rows written.
    pub fn export_csv<W: Write + Send>(&self, identity: &str, query: &ExportQuery, writer: W) -> Result<usize> {
        self.pool
            .run(|| self.engine().export(identity, query)?.write_csv(writer))
    }

    pub fn describe(&self, identity: &str) -> Result<Description> {
        self.engine().describe(identity)
    }

    /// Identities of all stored datasets.
    pub fn list(&self) -> Result<Vec<String>> {
        self.cache.list()
    }

    /// Delete datasets older than the cache's max age.
    pub fn purge_expired(&self) -> Result<usize> {
        self.pool.run(|| self.cache.purge_expired())
    }
}
