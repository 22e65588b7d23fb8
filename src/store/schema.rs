//! Table layout and the column descriptor table
//!
//! Every insertable column is described once in [`COLUMNS`], with its storage
//! class and the functions that move a value between a [`LogRecord`] field and
//! its stored form. The DDL, the insert statement, row decoding and the
//! exporter's raw copy are all derived from this one list.

use super::connection::Store;
use crate::error::{Error, Result};
use crate::record::{format_instant, LogLevel, LogRecord};
use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnection, SqliteRow};
use sqlx::Row;

pub const TABLE_NAME: &str = "log_records";

/// A value as stored in (or bound to) a single column.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    fn from_optional_text(value: Option<&String>) -> Self {
        value.map(|s| Self::Text(s.clone())).unwrap_or(Self::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ColumnKind {
    Integer,
    Text,
    NullableText,
}

impl ColumnKind {
    fn declaration(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER NOT NULL",
            Self::Text => "TEXT NOT NULL",
            Self::NullableText => "TEXT NULL",
        }
    }
}

pub(crate) struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub encode: fn(&LogRecord) -> Result<SqlValue>,
    pub decode: fn(SqlValue, &mut LogRecord) -> Result<()>,
}

/// Insertable columns, in table order. `id` is not listed: the store assigns it.
pub(crate) static COLUMNS: [Column; 11] = [
    Column {
        name: "category",
        kind: ColumnKind::NullableText,
        encode: encode_category,
        decode: decode_category,
    },
    Column {
        name: "event_id",
        kind: ColumnKind::Integer,
        encode: encode_event_id,
        decode: decode_event_id,
    },
    Column {
        name: "event_name",
        kind: ColumnKind::NullableText,
        encode: encode_event_name,
        decode: decode_event_name,
    },
    Column {
        name: "timestamp",
        kind: ColumnKind::Text,
        encode: encode_timestamp,
        decode: decode_timestamp,
    },
    Column {
        name: "level",
        kind: ColumnKind::Integer,
        encode: encode_level,
        decode: decode_level,
    },
    Column {
        name: "thread_id",
        kind: ColumnKind::Integer,
        encode: encode_thread_id,
        decode: decode_thread_id,
    },
    Column {
        name: "message_template",
        kind: ColumnKind::Text,
        encode: encode_message_template,
        decode: decode_message_template,
    },
    Column {
        name: "properties",
        kind: ColumnKind::Text,
        encode: encode_properties,
        decode: decode_properties,
    },
    Column {
        name: "rendered_message",
        kind: ColumnKind::Text,
        encode: encode_rendered_message,
        decode: decode_rendered_message,
    },
    Column {
        name: "exception_json",
        kind: ColumnKind::Text,
        encode: encode_exception,
        decode: decode_exception,
    },
    Column {
        name: "scopes_json",
        kind: ColumnKind::NullableText,
        encode: encode_scopes,
        decode: decode_scopes,
    },
];

fn encode_category(record: &LogRecord) -> Result<SqlValue> {
    Ok(SqlValue::from_optional_text(record.category.as_ref()))
}

fn decode_category(value: SqlValue, record: &mut LogRecord) -> Result<()> {
    record.category = optional_text(value, "category")?;
    Ok(())
}

fn encode_event_id(record: &LogRecord) -> Result<SqlValue> {
    Ok(SqlValue::Integer(i64::from(record.event_id)))
}

fn decode_event_id(value: SqlValue, record: &mut LogRecord) -> Result<()> {
    let raw = integer(value, "event_id")?;
    record.event_id = i32::try_from(raw).map_err(|e| Error::decode("event_id", e))?;
    Ok(())
}

fn encode_event_name(record: &LogRecord) -> Result<SqlValue> {
    Ok(SqlValue::from_optional_text(record.event_name.as_ref()))
}

fn decode_event_name(value: SqlValue, record: &mut LogRecord) -> Result<()> {
    record.event_name = optional_text(value, "event_name")?;
    Ok(())
}

fn encode_timestamp(record: &LogRecord) -> Result<SqlValue> {
    Ok(SqlValue::Text(format_instant(&record.timestamp)))
}

fn decode_timestamp(value: SqlValue, record: &mut LogRecord) -> Result<()> {
    let text = text(value, "timestamp")?;
    record.timestamp = DateTime::parse_from_rfc3339(&text)
        .map_err(|e| Error::decode("timestamp", e))?
        .with_timezone(&Utc);
    Ok(())
}

fn encode_level(record: &LogRecord) -> Result<SqlValue> {
    Ok(SqlValue::Integer(record.level.ordinal()))
}

fn decode_level(value: SqlValue, record: &mut LogRecord) -> Result<()> {
    let ordinal = integer(value, "level")?;
    record.level = LogLevel::from_ordinal(ordinal)
        .ok_or_else(|| Error::decode("level", format!("unknown level ordinal {}", ordinal)))?;
    Ok(())
}

fn encode_thread_id(record: &LogRecord) -> Result<SqlValue> {
    Ok(SqlValue::Integer(record.thread_id))
}

fn decode_thread_id(value: SqlValue, record: &mut LogRecord) -> Result<()> {
    record.thread_id = integer(value, "thread_id")?;
    Ok(())
}

fn encode_message_template(record: &LogRecord) -> Result<SqlValue> {
    Ok(SqlValue::Text(record.message_template.clone()))
}

fn decode_message_template(value: SqlValue, record: &mut LogRecord) -> Result<()> {
    record.message_template = text(value, "message_template")?;
    Ok(())
}

fn encode_properties(record: &LogRecord) -> Result<SqlValue> {
    Ok(SqlValue::Text(serde_json::to_string(&record.properties)?))
}

fn decode_properties(value: SqlValue, record: &mut LogRecord) -> Result<()> {
    let text = text(value, "properties")?;
    if !text.is_empty() {
        record.properties = serde_json::from_str(&text)?;
    }
    Ok(())
}

fn encode_rendered_message(record: &LogRecord) -> Result<SqlValue> {
    Ok(SqlValue::Text(record.rendered_message.clone()))
}

fn decode_rendered_message(value: SqlValue, record: &mut LogRecord) -> Result<()> {
    record.rendered_message = text(value, "rendered_message")?;
    Ok(())
}

/// Absent exceptions are stored as an empty string, never NULL.
fn encode_exception(record: &LogRecord) -> Result<SqlValue> {
    let text = match &record.exception {
        Some(exception) => serde_json::to_string(exception)?,
        None => String::new(),
    };
    Ok(SqlValue::Text(text))
}

fn decode_exception(value: SqlValue, record: &mut LogRecord) -> Result<()> {
    let text = optional_text(value, "exception_json")?.unwrap_or_default();
    record.exception = if text.is_empty() {
        None
    } else {
        Some(serde_json::from_str(&text)?)
    };
    Ok(())
}

fn encode_scopes(record: &LogRecord) -> Result<SqlValue> {
    match &record.scopes {
        Some(scopes) => Ok(SqlValue::Text(serde_json::to_string(scopes)?)),
        None => Ok(SqlValue::Null),
    }
}

fn decode_scopes(value: SqlValue, record: &mut LogRecord) -> Result<()> {
    record.scopes = match optional_text(value, "scopes_json")? {
        Some(text) if !text.is_empty() => Some(serde_json::from_str(&text)?),
        _ => None,
    };
    Ok(())
}

fn integer(value: SqlValue, column: &'static str) -> Result<i64> {
    match value {
        SqlValue::Integer(i) => Ok(i),
        other => Err(Error::decode(column, format!("expected integer, found {:?}", other))),
    }
}

fn text(value: SqlValue, column: &'static str) -> Result<String> {
    match value {
        SqlValue::Text(s) => Ok(s),
        other => Err(Error::decode(column, format!("expected text, found {:?}", other))),
    }
}

fn optional_text(value: SqlValue, column: &'static str) -> Result<Option<String>> {
    match value {
        SqlValue::Null => Ok(None),
        other => text(other, column).map(Some),
    }
}

pub(crate) fn create_table_sql() -> String {
    let columns: Vec<String> = COLUMNS
        .iter()
        .map(|column| format!("{} {}", column.name, column.kind.declaration()))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY AUTOINCREMENT, {})",
        TABLE_NAME,
        columns.join(", ")
    )
}

fn create_index_sql() -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS idx_{0}_timestamp ON {0} (timestamp)",
        TABLE_NAME
    )
}

pub(crate) fn insert_sql() -> String {
    let names: Vec<&str> = COLUMNS.iter().map(|column| column.name).collect();
    let placeholders = vec!["?"; COLUMNS.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        TABLE_NAME,
        names.join(", "),
        placeholders
    )
}

/// `id` followed by every descriptor column, for SELECT lists.
pub(crate) fn select_list() -> String {
    let mut names = vec!["id"];
    names.extend(COLUMNS.iter().map(|column| column.name));
    names.join(", ")
}

/// `?, ?, …` with `count` placeholders.
pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

pub(crate) fn encode_record(record: &LogRecord) -> Result<Vec<SqlValue>> {
    COLUMNS.iter().map(|column| (column.encode)(record)).collect()
}

/// Raw stored values of the descriptor columns (no `id`).
pub(crate) fn read_values(row: &SqliteRow) -> Result<Vec<SqlValue>> {
    COLUMNS
        .iter()
        .map(|column| {
            let value = match column.kind {
                ColumnKind::Integer => SqlValue::Integer(row.try_get::<i64, _>(column.name)?),
                ColumnKind::Text => SqlValue::Text(row.try_get::<String, _>(column.name)?),
                ColumnKind::NullableText => row
                    .try_get::<Option<String>, _>(column.name)?
                    .map(SqlValue::Text)
                    .unwrap_or(SqlValue::Null),
            };
            Ok(value)
        })
        .collect()
}

pub(crate) fn decode_row(row: &SqliteRow) -> Result<LogRecord> {
    let id: i64 = row.try_get("id")?;
    let mut record = LogRecord::blank();
    for (column, value) in COLUMNS.iter().zip(read_values(row)?) {
        (column.decode)(value, &mut record)?;
    }
    Ok(record.with_id(id))
}

pub(crate) fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q SqlValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<&str>),
        SqlValue::Integer(i) => query.bind(*i),
        SqlValue::Real(f) => query.bind(*f),
        SqlValue::Text(s) => query.bind(s.as_str()),
    }
}

/// Insert one encoded row; returns the id the store assigned.
pub(crate) async fn insert_values(
    conn: &mut SqliteConnection,
    sql: &str,
    values: &[SqlValue],
) -> Result<i64> {
    let mut query = sqlx::query(sql);
    for value in values {
        query = bind_value(query, value);
    }
    let result = query.execute(&mut *conn).await?;
    Ok(result.last_insert_rowid())
}

/// Create the record table (and its timestamp index) if it does not exist.
///
/// Safe to call any number of times against the same file.
pub async fn ensure_table(store: &Store) -> Result<&'static str> {
    store.execute_non_query(&create_table_sql()).await?;
    store.execute_non_query(&create_index_sql()).await?;
    tracing::debug!(
        table = TABLE_NAME,
        path = %store.path().display(),
        "Ensured log table exists"
    );
    Ok(TABLE_NAME)
}
