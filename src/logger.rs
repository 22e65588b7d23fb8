//! The store logger facade
//!
//! [`StoreLogger`] owns every component for one store file and is what
//! producers talk to. Records go `add` → pipeline → cache → writer.

use crate::cache::BatchingCache;
use crate::clock::{Clock, SystemClock};
use crate::config::{validate_config, LoggerConfig};
use crate::error::{Error, Result};
use crate::housekeeping::Housekeeper;
use crate::pipeline::Pipeline;
use crate::record::{LogLevel, LogRecord};
use crate::store::{ensure_table, RecordReader, RecordWriter, Store, StoreOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct StoreLoggerBuilder {
    config: LoggerConfig,
    clock: Arc<dyn Clock>,
    pipeline: Pipeline,
}

impl StoreLoggerBuilder {
    fn new(config: LoggerConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            pipeline: Pipeline::default(),
        }
    }

    /// Clock used for retention cutoffs.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Open the store file and start the background tasks.
    pub async fn open(self) -> Result<StoreLogger> {
        validate_config(&self.config)?;

        let store = Arc::new(Store::open(StoreOptions::from_config(&self.config.storage)).await?);
        ensure_table(&store).await?;

        let writer = RecordWriter::new(Arc::clone(&store));
        let reader = RecordReader::new(Arc::clone(&store));
        let housekeeper =
            Housekeeper::new(Arc::clone(&store), self.clock, &self.config.housekeeping);
        let cache = BatchingCache::new(writer, &self.config.cache);

        tracing::info!(
            path = %store.path().display(),
            housekeeping = ?self.config.housekeeping.mode,
            minimum_level = %self.config.minimum_level,
            "Log store opened"
        );

        Ok(StoreLogger {
            store,
            reader,
            housekeeper,
            cache,
            pipeline: self.pipeline,
            minimum_level: self.config.minimum_level,
            dispose_timeout: self.config.cache.dispose_timeout(),
            disposed: AtomicBool::new(false),
        })
    }
}

/// Structured log sink backed by one SQLite file.
pub struct StoreLogger {
    store: Arc<Store>,
    reader: RecordReader,
    housekeeper: Arc<Housekeeper>,
    cache: BatchingCache,
    pipeline: Pipeline,
    minimum_level: LogLevel,
    dispose_timeout: Duration,
    disposed: AtomicBool,
}

impl std::fmt::Debug for StoreLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLogger")
            .field("path", &self.store.path())
            .field("minimum_level", &self.minimum_level)
            .field("cache", &self.cache)
            .finish()
    }
}

impl StoreLogger {
    pub fn builder(config: LoggerConfig) -> StoreLoggerBuilder {
        StoreLoggerBuilder::new(config)
    }

    /// Open with the system clock and no middleware.
    pub async fn open(config: LoggerConfig) -> Result<Self> {
        Self::builder(config).open().await
    }

    pub fn minimum_level(&self) -> LogLevel {
        self.minimum_level
    }

    /// Whether a record at `level` would be kept.
    pub fn is_enabled(&self, level: LogLevel) -> bool {
        self.minimum_level != LogLevel::None && level >= self.minimum_level
    }

    /// Queue a record. Returns immediately; the write happens in the
    /// background.
    ///
    /// Records below the minimum level, or dropped by a middleware stage,
    /// are ignored. Fails only once the logger has been disposed.
    pub fn add(&self, record: LogRecord) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed("log store"));
        }
        if !self.is_enabled(record.level) {
            return Ok(());
        }

        let mut outcome = Ok(());
        self.pipeline
            .execute(record, |record| outcome = self.cache.add(record));
        outcome
    }

    pub fn pending_count(&self) -> usize {
        self.cache.pending_count()
    }

    pub fn discarded_count(&self) -> u64 {
        self.cache.discarded_count()
    }

    pub fn reset_discarded_count(&self) -> u64 {
        self.cache.reset_discarded_count()
    }

    pub fn database_file_size(&self) -> Result<u64> {
        self.store.file_size()
    }

    /// Write everything queued so far.
    pub async fn flush(&self) -> Result<usize> {
        self.cache.flush().await
    }

    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        self.cache.wait_until_empty(timeout).await
    }

    /// Delete every stored record. Records still queued are written later.
    pub async fn delete_all(&self) -> Result<u64> {
        self.housekeeper.delete_all().await
    }

    pub fn reader(&self) -> &RecordReader {
        &self.reader
    }

    pub fn housekeeper(&self) -> &Arc<Housekeeper> {
        &self.housekeeper
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Drain and shut down. Safe to call more than once; never fails.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        if !self.cache.wait_until_empty(self.dispose_timeout).await {
            tracing::warn!(
                pending = self.cache.pending_count(),
                "Log cache did not drain before dispose"
            );
        }
        self.cache.dispose().await;
        self.housekeeper.dispose();
        self.store.close().await;

        tracing::info!(path = %self.store.path().display(), "Log store closed");
    }
}
