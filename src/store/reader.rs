use super::connection::Store;
use super::schema::{bind_value, decode_row, select_list, SqlValue, TABLE_NAME};
use crate::error::{Error, Result};
use crate::record::{format_instant, LogLevel, LogRecord, PropertyValue};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Column as _, Row, TypeInfo, ValueRef};
use std::sync::Arc;

/// One row of an ad hoc query, as `(column name, value)` pairs in select order.
pub type RawRow = Vec<(String, Value)>;

/// Read access to the log table. Every query goes through the store's retry
/// policy.
#[derive(Debug, Clone)]
pub struct RecordReader {
    store: Arc<Store>,
}

impl RecordReader {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// All records in insertion order.
    pub async fn get_all(&self) -> Result<Vec<LogRecord>> {
        let sql = format!("SELECT {} FROM {} ORDER BY id ASC", select_list(), TABLE_NAME);
        self.fetch_records(sql, Vec::new()).await
    }

    /// The `count` newest records, newest first.
    pub async fn get_recent(&self, count: usize) -> Result<Vec<LogRecord>> {
        if count == 0 {
            return Err(Error::invalid_argument("count", "must be greater than zero"));
        }
        let limit = i64::try_from(count).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {} FROM {} ORDER BY timestamp DESC, id DESC LIMIT ?",
            select_list(),
            TABLE_NAME
        );
        self.fetch_records(sql, vec![SqlValue::Integer(limit)]).await
    }

    pub async fn get_count(&self) -> Result<u64> {
        let sql: Arc<str> = format!("SELECT COUNT(*) FROM {}", TABLE_NAME).into();
        let count = self
            .store
            .execute_with_retry(|conn| {
                let sql = Arc::clone(&sql);
                Box::pin(async move { count_rows(conn, &sql).await })
            })
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<LogRecord>> {
        let sql = format!("SELECT {} FROM {} WHERE id = ?", select_list(), TABLE_NAME);
        let mut records = self.fetch_records(sql, vec![SqlValue::Integer(id)]).await?;
        Ok(records.pop())
    }

    /// Records at or above `min_level`, in insertion order.
    pub async fn get_by_level(&self, min_level: LogLevel) -> Result<Vec<LogRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE level >= ? ORDER BY id ASC",
            select_list(),
            TABLE_NAME
        );
        self.fetch_records(sql, vec![SqlValue::Integer(min_level.ordinal())])
            .await
    }

    /// Records whose property `key` equals `value` exactly.
    ///
    /// `PropertyValue::Null` matches properties stored as JSON `null`, not
    /// records that lack the key.
    pub async fn get_by_property(
        &self,
        key: &str,
        value: &PropertyValue,
    ) -> Result<Vec<LogRecord>> {
        if key.is_empty() {
            return Err(Error::invalid_argument("key", "must not be empty"));
        }
        if key.contains('"') {
            return Err(Error::invalid_argument("key", "must not contain '\"'"));
        }

        let path = format!("$.\"{}\"", key);
        let (predicate, params) = match value {
            PropertyValue::Null => (
                "json_type(properties, ?) = 'null'",
                vec![SqlValue::Text(path)],
            ),
            PropertyValue::Bool(b) => (
                "json_extract(properties, ?) = ?",
                vec![SqlValue::Text(path), SqlValue::Integer(i64::from(*b))],
            ),
            PropertyValue::Integer(i) => (
                "json_extract(properties, ?) = ?",
                vec![SqlValue::Text(path), SqlValue::Integer(*i)],
            ),
            PropertyValue::Float(f) => (
                "json_extract(properties, ?) = ?",
                vec![SqlValue::Text(path), SqlValue::Real(*f)],
            ),
            PropertyValue::String(s) => (
                "json_extract(properties, ?) = ?",
                vec![SqlValue::Text(path), SqlValue::Text(s.clone())],
            ),
            PropertyValue::Timestamp(t) => (
                "json_extract(properties, ?) = ?",
                vec![SqlValue::Text(path), SqlValue::Text(format_instant(t))],
            ),
            PropertyValue::Structured(v) => (
                "json_extract(properties, ?) = json_extract(?, '$')",
                vec![SqlValue::Text(path), SqlValue::Text(v.to_string())],
            ),
        };

        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY id ASC",
            select_list(),
            TABLE_NAME,
            predicate
        );
        self.fetch_records(sql, params).await
    }

    /// Run arbitrary SQL and return every row as loosely typed values.
    ///
    /// The SQL is passed through unchanged; callers own its safety.
    pub async fn select_raw(&self, sql: &str) -> Result<Vec<RawRow>> {
        let sql: Arc<str> = sql.into();
        self.store
            .execute_with_retry(|conn| {
                let sql = Arc::clone(&sql);
                Box::pin(async move { fetch_raw(conn, &sql).await })
            })
            .await
    }

    async fn fetch_records(&self, sql: String, params: Vec<SqlValue>) -> Result<Vec<LogRecord>> {
        let sql: Arc<str> = sql.into();
        let params = Arc::new(params);
        self.store
            .execute_with_retry(|conn| {
                let sql = Arc::clone(&sql);
                let params = Arc::clone(&params);
                Box::pin(async move { load_records(conn, &sql, &params).await })
            })
            .await
    }
}

async fn load_records(
    conn: &mut SqliteConnection,
    sql: &str,
    params: &[SqlValue],
) -> Result<Vec<LogRecord>> {
    let mut query = sqlx::query(sql);
    for value in params {
        query = bind_value(query, value);
    }
    let rows = query.fetch_all(&mut *conn).await?;
    rows.iter().map(decode_row).collect()
}

async fn count_rows(conn: &mut SqliteConnection, sql: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(sql).fetch_one(&mut *conn).await?;
    Ok(count)
}

async fn fetch_raw(conn: &mut SqliteConnection, sql: &str) -> Result<Vec<RawRow>> {
    let rows = sqlx::query(sql).fetch_all(&mut *conn).await?;
    rows.iter().map(raw_row).collect()
}

fn raw_row(row: &SqliteRow) -> Result<RawRow> {
    let mut values = Vec::with_capacity(row.len());
    for column in row.columns() {
        let index = column.ordinal();
        let storage = {
            let raw = row.try_get_raw(index)?;
            if raw.is_null() {
                None
            } else {
                Some(raw.type_info().name().to_string())
            }
        };

        let value = match storage.as_deref() {
            None => Value::Null,
            Some("INTEGER") => Value::from(row.try_get::<i64, _>(index)?),
            Some("REAL") => Value::from(row.try_get::<f64, _>(index)?),
            Some("BLOB") => {
                let bytes: Vec<u8> = row.try_get(index)?;
                Value::from(bytes)
            }
            Some(_) => Value::from(row.try_get::<String, _>(index)?),
        };
        values.push((column.name().to_string(), value));
    }
    Ok(values)
}
