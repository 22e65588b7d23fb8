//! Log record model
//!
//! A [`LogRecord`] is the unit of persistence: one row in the store file.
//! Records are built with [`LogRecordBuilder`], which renders the message
//! template exactly once; the rendered text is never recomputed afterwards,
//! even if middleware later changes the property bag.

use crate::error::{Error, Result};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

/// Structured property bag attached to a record.
pub type Properties = BTreeMap<String, PropertyValue>;

/// Severity of a record, ordered from least to most severe.
///
/// `None` is only meaningful as a filter threshold: a minimum level of
/// `None` suppresses everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogLevel {
    #[default]
    Trace = 0,
    Debug = 1,
    Information = 2,
    Warning = 3,
    Error = 4,
    Critical = 5,
    None = 6,
}

impl LogLevel {
    pub const ALL: [LogLevel; 7] = [
        Self::Trace,
        Self::Debug,
        Self::Information,
        Self::Warning,
        Self::Error,
        Self::Critical,
        Self::None,
    ];

    /// Integer ordinal as stored in the `level` column.
    pub fn ordinal(self) -> i64 {
        self as i64
    }

    pub fn from_ordinal(ordinal: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.ordinal() == ordinal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "Trace",
            Self::Debug => "Debug",
            Self::Information => "Information",
            Self::Warning => "Warning",
            Self::Error => "Error",
            Self::Critical => "Critical",
            Self::None => "None",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "information" | "info" => Ok(Self::Information),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" | "fatal" => Ok(Self::Critical),
            "none" => Ok(Self::None),
            other => Err(Error::invalid_argument(
                "level",
                format!("unknown log level '{}'", other),
            )),
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        level.as_str().to_string()
    }
}

/// Format an instant the way the store persists it: UTC, microsecond
/// precision, `Z` suffix. Fixed width, so lexical order is chronological.
pub fn format_instant(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a string only if it is exactly in the canonical instant format.
pub fn parse_canonical_instant(text: &str) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(text)
        .ok()?
        .with_timezone(&Utc);
    (format_instant(&parsed) == text).then_some(parsed)
}

/// Drop sub-microsecond precision so an instant survives a store round trip.
pub fn truncate_instant(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant.trunc_subsecs(6)
}

/// Value stored in a record's property bag.
///
/// Properties are stored as plain JSON so they stay queryable with
/// `json_extract`, which makes two conversions lossy:
///
/// - a `String` whose text is exactly a canonical instant
///   (`2024-03-01T12:00:00.000000Z`) reads back as `Timestamp`;
/// - a non-finite `Float` (NaN, ±infinity) is written as JSON `null` and reads
///   back as `Null`.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    /// Objects and arrays, kept as JSON.
    Structured(serde_json::Value),
}

impl PropertyValue {
    /// JSON form written to the `properties` column.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Integer(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Timestamp(t) => serde_json::Value::String(format_instant(t)),
            Self::Structured(v) => v.clone(),
        }
    }

    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => match parse_canonical_instant(&s) {
                Some(t) => Self::Timestamp(t),
                None => Self::String(s),
            },
            other => Self::Structured(other),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::String(s) => f.write_str(s),
            Self::Timestamp(t) => f.write_str(&format_instant(t)),
            Self::Structured(v) => write!(f, "{}", v),
        }
    }
}

impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PropertyValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Self::from_json)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(truncate_instant(value))
    }
}

impl From<serde_json::Value> for PropertyValue {
    fn from(value: serde_json::Value) -> Self {
        Self::from_json(value)
    }
}

impl<T: Into<PropertyValue>> From<Option<T>> for PropertyValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Flattened error chain attached to a record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub type_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub hresult: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_site: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<Box<ExceptionInfo>>,
}

impl ExceptionInfo {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_inner(mut self, inner: ExceptionInfo) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Flatten an error and its `source()` chain.
    ///
    /// Only the outermost type name is known statically; sources are
    /// recorded as `dyn std::error::Error`.
    pub fn from_error<E: std::error::Error + 'static>(error: &E) -> Self {
        let mut info = Self::new(std::any::type_name::<E>(), error.to_string());
        info.inner = error.source().map(|source| Box::new(Self::from_dyn(source)));
        info
    }

    fn from_dyn(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut info = Self::new("dyn std::error::Error", error.to_string());
        info.inner = error.source().map(|source| Box::new(Self::from_dyn(source)));
        info
    }

    /// This exception followed by every inner exception, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &ExceptionInfo> {
        std::iter::successors(Some(self), |info| info.inner.as_deref())
    }
}

/// Ordered scope key/value pairs, outermost scope first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeChain(Vec<(String, String)>);

impl ScopeChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    /// Push a scope that carries only a value; it is keyed `Scope{n}`.
    pub fn push_state(&mut self, value: impl Into<String>) {
        let key = format!("Scope{}", self.0.len());
        self.0.push((key, value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.0
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

static NEXT_THREAD_ID: AtomicI64 = AtomicI64::new(1);

thread_local! {
    static THREAD_ID: i64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Process-unique id of the calling OS thread, assigned on first use.
pub fn current_thread_id() -> i64 {
    THREAD_ID.with(|id| *id)
}

/// One persisted log event.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: Option<String>,
    pub event_id: i32,
    pub event_name: Option<String>,
    pub message_template: String,
    pub rendered_message: String,
    pub properties: Properties,
    pub exception: Option<ExceptionInfo>,
    pub scopes: Option<ScopeChain>,
    pub thread_id: i64,
}

impl LogRecord {
    pub fn builder(level: LogLevel, message_template: impl Into<String>) -> LogRecordBuilder {
        LogRecordBuilder::new(level, message_template)
    }

    /// Store-assigned id; `None` until the record has been read back from a store.
    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub(crate) fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    /// Blank record used as the decode target for stored rows.
    pub(crate) fn blank() -> Self {
        Self {
            id: None,
            timestamp: DateTime::<Utc>::default(),
            level: LogLevel::Trace,
            category: None,
            event_id: 0,
            event_name: None,
            message_template: String::new(),
            rendered_message: String::new(),
            properties: Properties::new(),
            exception: None,
            scopes: None,
            thread_id: 0,
        }
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }
}

/// Builder for [`LogRecord`]; rendering happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct LogRecordBuilder {
    level: LogLevel,
    message_template: String,
    timestamp: Option<DateTime<Utc>>,
    category: Option<String>,
    event_id: i32,
    event_name: Option<String>,
    properties: Properties,
    exception: Option<ExceptionInfo>,
    scopes: Option<ScopeChain>,
    thread_id: Option<i64>,
}

impl LogRecordBuilder {
    pub fn new(level: LogLevel, message_template: impl Into<String>) -> Self {
        Self {
            level,
            message_template: message_template.into(),
            timestamp: None,
            category: None,
            event_id: 0,
            event_name: None,
            properties: Properties::new(),
            exception: None,
            scopes: None,
            thread_id: None,
        }
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn event(mut self, event_id: i32, event_name: Option<String>) -> Self {
        self.event_id = event_id;
        self.event_name = event_name;
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn exception(mut self, exception: ExceptionInfo) -> Self {
        self.exception = Some(exception);
        self
    }

    pub fn scopes(mut self, scopes: ScopeChain) -> Self {
        self.scopes = Some(scopes);
        self
    }

    pub fn thread_id(mut self, thread_id: i64) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn build(self) -> LogRecord {
        let rendered_message = render_template(&self.message_template, &self.properties);
        LogRecord {
            id: None,
            timestamp: truncate_instant(self.timestamp.unwrap_or_else(Utc::now)),
            level: self.level,
            category: self.category,
            event_id: self.event_id,
            event_name: self.event_name,
            message_template: self.message_template,
            rendered_message,
            properties: self.properties,
            exception: self.exception,
            scopes: self.scopes,
            thread_id: self.thread_id.unwrap_or_else(current_thread_id),
        }
    }
}

/// Substitute `{Name}` placeholders from the property bag.
///
/// `{@Name}`, `{$Name}`, `{Name,alignment}` and `{Name:format}` resolve to
/// the same property. `{{` and `}}` are literal braces. Placeholders with no
/// matching property are left as written.
pub fn render_template(template: &str, properties: &Properties) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(|c: char| c == '{' || c == '}') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") {
            out.push('{');
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with("}}") {
            out.push('}');
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('{') {
            if let Some(end) = tail.find('}') {
                let token = &tail[1..end];
                match lookup_placeholder(token, properties) {
                    Some(value) => out.push_str(&value.to_string()),
                    None => out.push_str(&tail[..=end]),
                }
                rest = &tail[end + 1..];
                continue;
            }
        }

        // Unmatched brace
        out.push_str(&tail[..1]);
        rest = &tail[1..];
    }

    out.push_str(rest);
    out
}

fn lookup_placeholder<'a>(token: &str, properties: &'a Properties) -> Option<&'a PropertyValue> {
    let token = token.trim_start_matches(['@', '$']);
    let name = token.split([':', ',']).next()?.trim();
    if name.is_empty() {
        return None;
    }
    properties.get(name)
}
