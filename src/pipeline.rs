//! Record middleware
//!
//! A [`Pipeline`] runs each record through an ordered list of stages before
//! it reaches the cache. A stage receives the record and a [`Next`]
//! continuation. Calling `next.run(record)` hands the record on; returning
//! without calling it drops the record.

use crate::record::{LogRecord, PropertyValue};
use dashmap::DashMap;
use std::sync::Arc;

pub trait Middleware: Send + Sync {
    fn invoke(&self, record: LogRecord, next: Next<'_>);
}

/// The remainder of the pipeline, as seen from one stage.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    sink: &'a mut dyn FnMut(LogRecord),
}

impl<'a> Next<'a> {
    pub fn run(self, record: LogRecord) {
        match self.rest.split_first() {
            Some((stage, rest)) => stage.invoke(
                record,
                Next {
                    rest,
                    sink: self.sink,
                },
            ),
            None => (self.sink)(record),
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<[Arc<dyn Middleware>]>,
}

impl Default for Pipeline {
    fn default() -> Self {
        PipelineBuilder::new().build()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages.len())
            .finish()
    }
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run `record` through every stage; `sink` receives it if no stage
    /// short-circuits.
    pub fn execute(&self, record: LogRecord, mut sink: impl FnMut(LogRecord)) {
        Next {
            rest: &self.stages,
            sink: &mut sink,
        }
        .run(record);
    }
}

/// Immutable builder: [`with`](Self::with) returns a new builder and leaves
/// the original untouched.
#[derive(Clone, Default)]
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Middleware>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(&self, stage: impl Middleware + 'static) -> Self {
        self.with_shared(Arc::new(stage))
    }

    #[must_use]
    pub fn with_shared(&self, stage: Arc<dyn Middleware>) -> Self {
        let mut stages = self.stages.clone();
        stages.push(stage);
        Self { stages }
    }

    pub fn build(&self) -> Pipeline {
        Pipeline {
            stages: self.stages.clone().into(),
        }
    }
}

struct FnMiddleware<F>(F);

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(LogRecord, Next<'_>) + Send + Sync,
{
    fn invoke(&self, record: LogRecord, next: Next<'_>) {
        (self.0)(record, next)
    }
}

/// Build a stage from a closure.
pub fn middleware_fn<F>(f: F) -> impl Middleware
where
    F: Fn(LogRecord, Next<'_>) + Send + Sync + 'static,
{
    FnMiddleware(f)
}

/// Process-wide key/value context attached to records by [`ContextEnricher`].
///
/// Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct LogContext {
    values: Arc<DashMap<String, PropertyValue>>,
}

impl LogContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<PropertyValue> {
        self.values.remove(key).map(|(_, value)| value)
    }

    pub fn get(&self, key: &str) -> Option<PropertyValue> {
        self.values.get(key).map(|entry| entry.value().clone())
    }

    pub fn clear(&self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Copies the [`LogContext`] into each record's properties. Keys already on
/// the record win.
#[derive(Debug, Clone)]
pub struct ContextEnricher {
    context: LogContext,
}

impl ContextEnricher {
    pub fn new(context: LogContext) -> Self {
        Self { context }
    }
}

impl Middleware for ContextEnricher {
    fn invoke(&self, mut record: LogRecord, next: Next<'_>) {
        for entry in self.context.values.iter() {
            record
                .properties
                .entry(entry.key().clone())
                .or_insert_with(|| entry.value().clone());
        }
        next.run(record);
    }
}
