//! `tracing` integration
//!
//! [`StoreLayer`] turns `tracing` events into [`LogRecord`]s and feeds them to
//! a [`StoreLogger`]. Enclosing spans become the record's scope chain.

use crate::logger::StoreLogger;
use crate::record::{LogLevel, LogRecord, Properties, PropertyValue, ScopeChain};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

/// Targets never captured, so the store's own diagnostics cannot feed back
/// into it.
const IGNORED_TARGETS: [&str; 2] = [env!("CARGO_CRATE_NAME"), "sqlx"];

pub struct StoreLayer {
    logger: Arc<StoreLogger>,
}

impl StoreLayer {
    pub fn new(logger: Arc<StoreLogger>) -> Self {
        Self { logger }
    }
}

fn map_level(level: &Level) -> LogLevel {
    if *level == Level::ERROR {
        LogLevel::Error
    } else if *level == Level::WARN {
        LogLevel::Warning
    } else if *level == Level::INFO {
        LogLevel::Information
    } else if *level == Level::DEBUG {
        LogLevel::Debug
    } else {
        LogLevel::Trace
    }
}

fn is_ignored(target: &str) -> bool {
    IGNORED_TARGETS.iter().any(|prefix| {
        target == *prefix
            || target
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with("::"))
    })
}

/// Span fields rendered as `key=value` pairs, stored in span extensions.
struct SpanFields(String);

#[derive(Default)]
struct SpanFieldVisitor {
    rendered: String,
}

impl SpanFieldVisitor {
    fn push(&mut self, field: &Field, value: &dyn std::fmt::Display) {
        if !self.rendered.is_empty() {
            self.rendered.push_str(", ");
        }
        let _ = write!(self.rendered, "{}={}", field.name(), value);
    }
}

impl Visit for SpanFieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, &value);
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.push(field, &format_args!("{:?}", value));
    }
}

#[derive(Default)]
struct EventVisitor {
    message: Option<String>,
    event_id: Option<i32>,
    event_name: Option<String>,
    properties: Properties,
}

impl EventVisitor {
    fn insert(&mut self, field: &Field, value: PropertyValue) {
        self.properties.insert(field.name().to_string(), value);
    }
}

impl Visit for EventVisitor {
    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == "event_id" {
            if let Ok(id) = i32::try_from(value) {
                self.event_id = Some(id);
                return;
            }
        }
        self.insert(field, PropertyValue::Integer(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        match i64::try_from(value) {
            Ok(value) => self.record_i64(field, value),
            Err(_) => self.insert(field, PropertyValue::Float(value as f64)),
        }
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, PropertyValue::Float(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, PropertyValue::Bool(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "event_name" => self.event_name = Some(value.to_string()),
            _ => self.insert(field, PropertyValue::from(value)),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{:?}", value);
        match field.name() {
            "message" => self.message = Some(rendered),
            "event_name" => self.event_name = Some(rendered.trim_matches('"').to_string()),
            _ => self.insert(field, PropertyValue::String(rendered)),
        }
    }
}

impl<S> Layer<S> for StoreLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = SpanFieldVisitor::default();
        attrs.record(&mut visitor);
        span.extensions_mut().insert(SpanFields(visitor.rendered));
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        let mut visitor = SpanFieldVisitor {
            rendered: extensions
                .remove::<SpanFields>()
                .map(|fields| fields.0)
                .unwrap_or_default(),
        };
        values.record(&mut visitor);
        extensions.insert(SpanFields(visitor.rendered));
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = map_level(metadata.level());
        if is_ignored(metadata.target()) || !self.logger.is_enabled(level) {
            return;
        }

        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        let mut builder = LogRecord::builder(level, visitor.message.unwrap_or_default())
            .category(metadata.target())
            .event(visitor.event_id.unwrap_or_default(), visitor.event_name)
            .properties(visitor.properties);

        if let Some(scope) = ctx.event_scope(event) {
            let mut chain = ScopeChain::new();
            for span in scope.from_root() {
                let fields = span
                    .extensions()
                    .get::<SpanFields>()
                    .map(|fields| fields.0.clone())
                    .unwrap_or_default();
                chain.push(span.name(), fields);
            }
            if !chain.is_empty() {
                builder = builder.scopes(chain);
            }
        }

        // Nowhere to report a failure from inside the subscriber.
        let _ = self.logger.add(builder.build());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tracing_subscriber::prelude::*;

    #[test]
    fn test_ignored_targets() {
        assert!(is_ignored("sqlite_logstore"));
        assert!(is_ignored("sqlite_logstore::cache"));
        assert!(is_ignored("sqlx::query"));
        assert!(!is_ignored("sqlx_helper"));
        assert!(!is_ignored("my_app::orders"));
    }

    #[tokio::test]
    async fn test_events_are_captured_with_scopes() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::test_support::config_at(dir.path().join("layer.db"));
        let logger = Arc::new(StoreLogger::open(config).await.unwrap());

        let subscriber =
            tracing_subscriber::registry().with(StoreLayer::new(Arc::clone(&logger)));
        tracing::subscriber::with_default(subscriber, || {
            let request = tracing::info_span!(target: "my_app", "request", id = 7);
            let _request = request.enter();
            let handler = tracing::info_span!(target: "my_app", "handler");
            let _handler = handler.enter();

            tracing::warn!(
                target: "my_app::orders",
                event_id = 12,
                event_name = "OrderRejected",
                order = 42,
                reason = "stock",
                "order rejected"
            );
            tracing::info!(target: "sqlx::query", "ignored");
        });

        assert!(logger.wait_until_empty(Duration::from_secs(5)).await);
        let records = logger.reader().get_all().await.unwrap();
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.level, LogLevel::Warning);
        assert_eq!(record.category.as_deref(), Some("my_app::orders"));
        assert_eq!(record.message_template, "order rejected");
        assert_eq!(record.event_id, 12);
        assert_eq!(record.event_name.as_deref(), Some("OrderRejected"));
        assert_eq!(record.property("order"), Some(&PropertyValue::Integer(42)));
        assert_eq!(record.property("reason"), Some(&PropertyValue::from("stock")));

        let scopes = record.scopes.as_ref().unwrap();
        assert_eq!(scopes.len(), 2);
        assert_eq!(scopes.get("request"), Some("id=7"));
        assert_eq!(scopes.get("handler"), Some(""));

        logger.dispose().await;
    }
}
