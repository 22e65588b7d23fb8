//! Embedded structured-log store on SQLite.
//!
//! Producers hand [`LogRecord`]s to a [`StoreLogger`], which batches them in
//! memory and writes them in the background. Stored records can be queried
//! with [`RecordReader`], pruned by the [`Housekeeper`] and copied to another
//! file with the [`Exporter`].

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod export;
pub mod housekeeping;
pub mod layer;
pub mod logger;
pub mod pipeline;
pub mod record;
pub mod store;

pub use cache::{BatchingCache, CacheState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, LoggerConfig};
pub use error::{Error, Result};
pub use export::{CancellationToken, ExportSummary, Exporter};
pub use housekeeping::Housekeeper;
pub use layer::StoreLayer;
pub use logger::{StoreLogger, StoreLoggerBuilder};
pub use pipeline::{
    middleware_fn, ContextEnricher, LogContext, Middleware, Next, Pipeline, PipelineBuilder,
};
pub use record::{ExceptionInfo, LogLevel, LogRecord, Properties, PropertyValue, ScopeChain};
pub use store::{RecordReader, RecordWriter, Store, StoreOptions};

use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize console tracing. `RUST_LOG` overrides the default `info` filter.
///
/// Panics if a global subscriber is already installed.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

/// Initialize console tracing and also persist events into `logger`.
///
/// Unlike [`init_tracing`], an existing global subscriber is reported on
/// stderr instead of panicking.
pub fn init_tracing_with_store(logger: Arc<StoreLogger>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(StoreLayer::new(logger));

    match tracing::subscriber::set_global_default(subscriber) {
        Ok(()) => {
            tracing::info!("Log store layer added to tracing subscriber");
        }
        Err(e) => {
            eprintln!("Warning: Failed to install log store layer: {}", e);
        }
    }
}
