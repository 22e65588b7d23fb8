use super::connection::Store;
use super::schema::{encode_record, insert_sql, insert_values, SqlValue};
use crate::error::Result;
use crate::record::LogRecord;
use sqlx::sqlite::SqliteConnection;
use std::sync::Arc;
use std::time::Instant;

/// Inserts records into the log table.
///
/// Records are encoded up front, so a record that fails to serialize aborts
/// the call before any transaction is opened.
#[derive(Debug, Clone)]
pub struct RecordWriter {
    store: Arc<Store>,
    insert_sql: Arc<str>,
}

impl RecordWriter {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            insert_sql: insert_sql().into(),
        }
    }

    /// Insert one record and return its assigned id.
    pub async fn add(&self, record: &LogRecord) -> Result<i64> {
        let ids = self.add_batch(std::slice::from_ref(record)).await?;
        Ok(ids.first().copied().unwrap_or_default())
    }

    /// Insert every record in one transaction. Ids are returned in input order.
    pub async fn add_batch(&self, records: &[LogRecord]) -> Result<Vec<i64>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let rows = Arc::new(
            records
                .iter()
                .map(encode_record)
                .collect::<Result<Vec<_>>>()?,
        );
        let start = Instant::now();

        let ids = self
            .store
            .execute_in_transaction(|conn| {
                let rows = Arc::clone(&rows);
                let sql = Arc::clone(&self.insert_sql);
                Box::pin(async move { insert_rows(conn, &sql, &rows).await })
            })
            .await?;

        tracing::debug!(
            count = ids.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Wrote log records"
        );

        Ok(ids)
    }
}

async fn insert_rows(
    conn: &mut SqliteConnection,
    sql: &str,
    rows: &[Vec<SqlValue>],
) -> Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(rows.len());
    for values in rows {
        ids.push(insert_values(&mut *conn, sql, values).await?);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LogLevel, PropertyValue};
    use crate::store::{ensure_table, RecordReader, StoreOptions};

    async fn open_writer(dir: &tempfile::TempDir) -> (RecordWriter, RecordReader) {
        let store = Arc::new(
            Store::open(StoreOptions::new(dir.path().join("writer.db")))
                .await
                .unwrap(),
        );
        ensure_table(&store).await.unwrap();
        (RecordWriter::new(Arc::clone(&store)), RecordReader::new(store))
    }

    #[tokio::test]
    async fn test_add_returns_increasing_ids() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, reader) = open_writer(&dir).await;

        let first = writer
            .add(&LogRecord::builder(LogLevel::Information, "first").build())
            .await
            .unwrap();
        let second = writer
            .add(&LogRecord::builder(LogLevel::Information, "second").build())
            .await
            .unwrap();

        assert!(second > first);
        assert_eq!(reader.get_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_add_batch_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, reader) = open_writer(&dir).await;

        let records: Vec<LogRecord> = (0..10)
            .map(|i| {
                LogRecord::builder(LogLevel::Debug, "item {Index}")
                    .property("Index", i)
                    .build()
            })
            .collect();
        let ids = writer.add_batch(&records).await.unwrap();
        assert_eq!(ids.len(), 10);
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));

        let stored = reader.get_all().await.unwrap();
        let indexes: Vec<_> = stored
            .iter()
            .map(|record| record.property("Index").cloned())
            .collect();
        let expected: Vec<_> = (0..10).map(|i| Some(PropertyValue::Integer(i))).collect();
        assert_eq!(indexes, expected);
        assert_eq!(stored[3].id(), Some(ids[3]));
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, reader) = open_writer(&dir).await;

        assert!(writer.add_batch(&[]).await.unwrap().is_empty());
        assert_eq!(reader.get_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_table_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            Store::open(StoreOptions::new(dir.path().join("no-table.db")))
                .await
                .unwrap(),
        );
        let writer = RecordWriter::new(store);

        let records = vec![LogRecord::builder(LogLevel::Error, "lost").build()];
        assert!(writer.add_batch(&records).await.is_err());
    }
}
