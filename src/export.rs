//! Copy selected records from one store file into another
//!
//! The destination assigns fresh ids; source ids are not preserved. Work is
//! committed per chunk, so a cancelled export keeps every chunk that finished.

use crate::error::{Error, Result};
use crate::store::{
    ensure_table, insert_sql, insert_values, placeholders, read_values, select_list, JournalMode,
    SqlValue, Store, StoreOptions, TABLE_NAME,
};
use sqlx::sqlite::SqliteConnection;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Ids read and written per destination transaction.
pub const EXPORT_CHUNK_SIZE: usize = 500;

/// Cooperative cancellation flag shared between the caller and an export.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check(&self, phase: &'static str) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled { phase })
        } else {
            Ok(())
        }
    }
}

/// Outcome of a completed export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportSummary {
    /// Ids passed in, duplicates included.
    pub requested: usize,
    /// Rows written to the destination. Missing ids are skipped.
    pub exported: usize,
}

type ChunkCallback = Arc<dyn Fn(&ExportSummary) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Exporter {
    on_chunk: Option<ChunkCallback>,
}

impl std::fmt::Debug for Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter")
            .field("on_chunk", &self.on_chunk.is_some())
            .finish()
    }
}

impl Exporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with the running totals after each chunk commits.
    #[must_use]
    pub fn on_chunk_committed(
        mut self,
        callback: impl Fn(&ExportSummary) + Send + Sync + 'static,
    ) -> Self {
        self.on_chunk = Some(Arc::new(callback));
        self
    }

    /// Copy the records with the given ids from `source` to `dest`.
    ///
    /// The destination file and table are created when missing; the source
    /// must already exist. On cancellation the in-flight chunk is rolled
    /// back and [`Error::Cancelled`] is returned.
    pub async fn export(
        &self,
        source: impl AsRef<Path>,
        dest: impl AsRef<Path>,
        ids: &[i64],
        token: &CancellationToken,
    ) -> Result<ExportSummary> {
        let source = source.as_ref();
        let dest = dest.as_ref();
        require_path("source_path", source)?;
        require_path("dest_path", dest)?;
        if ids.is_empty() {
            return Err(Error::invalid_argument("ids", "must not be empty"));
        }

        let source_store = Store::open(
            StoreOptions::new(source)
                .create_if_missing(false)
                .journal_mode(JournalMode::Unchanged),
        )
        .await?;
        let dest_store = match Store::open(StoreOptions::new(dest)).await {
            Ok(store) => store,
            Err(e) => {
                source_store.close().await;
                return Err(e);
            }
        };

        let outcome = copy_records(
            &source_store,
            &dest_store,
            ids,
            token,
            self.on_chunk.as_deref(),
        )
        .await;

        source_store.close().await;
        dest_store.close().await;

        match &outcome {
            Ok(summary) => tracing::info!(
                source = %source.display(),
                dest = %dest.display(),
                requested = summary.requested,
                exported = summary.exported,
                "Log export completed"
            ),
            Err(e) if e.is_cancelled() => tracing::info!(
                source = %source.display(),
                dest = %dest.display(),
                "Log export cancelled"
            ),
            Err(e) => tracing::warn!(
                source = %source.display(),
                dest = %dest.display(),
                error = %e,
                "Log export failed"
            ),
        }

        outcome
    }
}

fn require_path(name: &'static str, path: &Path) -> Result<()> {
    if path.as_os_str().to_string_lossy().trim().is_empty() {
        return Err(Error::invalid_argument(name, "must not be empty or whitespace"));
    }
    Ok(())
}

async fn copy_records(
    source: &Store,
    dest: &Store,
    ids: &[i64],
    token: &CancellationToken,
    on_chunk: Option<&(dyn Fn(&ExportSummary) + Send + Sync)>,
) -> Result<ExportSummary> {
    ensure_table(dest).await?;
    let insert: Arc<str> = insert_sql().into();
    let mut summary = ExportSummary {
        requested: ids.len(),
        exported: 0,
    };

    for chunk in ids.chunks(EXPORT_CHUNK_SIZE) {
        token.check("export chunk")?;

        let select: Arc<str> = format!(
            "SELECT {} FROM {} WHERE id IN ({}) ORDER BY id",
            select_list(),
            TABLE_NAME,
            placeholders(chunk.len())
        )
        .into();
        let chunk: Arc<[i64]> = chunk.into();

        let rows = Arc::new(
            source
                .execute_with_retry(|conn| {
                    let select = Arc::clone(&select);
                    let chunk = Arc::clone(&chunk);
                    Box::pin(async move { fetch_chunk(conn, &select, &chunk).await })
                })
                .await?,
        );
        if rows.is_empty() {
            continue;
        }

        summary.exported += dest
            .execute_in_transaction(|conn| {
                let insert = Arc::clone(&insert);
                let rows = Arc::clone(&rows);
                let token = token.clone();
                Box::pin(async move { write_chunk(conn, &insert, &rows, &token).await })
            })
            .await?;

        if let Some(callback) = on_chunk {
            callback(&summary);
        }
    }

    Ok(summary)
}

async fn fetch_chunk(
    conn: &mut SqliteConnection,
    sql: &str,
    ids: &[i64],
) -> Result<Vec<Vec<SqlValue>>> {
    let mut query = sqlx::query(sql);
    for id in ids {
        query = query.bind(*id);
    }
    let rows = query.fetch_all(&mut *conn).await?;
    rows.iter().map(read_values).collect()
}

async fn write_chunk(
    conn: &mut SqliteConnection,
    sql: &str,
    rows: &[Vec<SqlValue>],
    token: &CancellationToken,
) -> Result<usize> {
    for values in rows {
        token.check("export row")?;
        insert_values(&mut *conn, sql, values).await?;
    }
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LogLevel, LogRecord};
    use crate::store::{RecordReader, RecordWriter};

    async fn seed(options: StoreOptions, count: usize) -> Vec<i64> {
        let store = Arc::new(Store::open(options).await.unwrap());
        ensure_table(&store).await.unwrap();
        let records: Vec<LogRecord> = (0..count)
            .map(|_| LogRecord::builder(LogLevel::Information, "row").build())
            .collect();
        let ids = RecordWriter::new(Arc::clone(&store))
            .add_batch(&records)
            .await
            .unwrap();
        store.close().await;
        ids
    }

    async fn journal_mode(store: &Store) -> String {
        store
            .execute_with_retry(|conn| {
                Box::pin(async move {
                    let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
                        .fetch_one(&mut *conn)
                        .await?;
                    Ok::<_, Error>(mode)
                })
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_cancelled_row_rolls_back_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("rows-source.db");
        let ids = seed(StoreOptions::new(&source_path), 3).await;

        let source = Store::open(StoreOptions::new(&source_path)).await.unwrap();
        let select: Arc<str> = format!(
            "SELECT {} FROM {} WHERE id IN ({}) ORDER BY id",
            select_list(),
            TABLE_NAME,
            placeholders(ids.len())
        )
        .into();
        let ids: Arc<[i64]> = ids.into();
        let rows = Arc::new(
            source
                .execute_with_retry(|conn| {
                    let select = Arc::clone(&select);
                    let ids = Arc::clone(&ids);
                    Box::pin(async move { fetch_chunk(conn, &select, &ids).await })
                })
                .await
                .unwrap(),
        );
        assert_eq!(rows.len(), 3);

        let dest = Arc::new(
            Store::open(StoreOptions::new(dir.path().join("rows-dest.db")))
                .await
                .unwrap(),
        );
        ensure_table(&dest).await.unwrap();
        let insert: Arc<str> = insert_sql().into();
        let token = CancellationToken::new();
        token.cancel();

        let error = dest
            .execute_in_transaction(|conn| {
                let insert = Arc::clone(&insert);
                let rows = Arc::clone(&rows);
                let token = token.clone();
                Box::pin(async move { write_chunk(conn, &insert, &rows, &token).await })
            })
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Cancelled { phase: "export row" }));
        assert_eq!(RecordReader::new(dest).get_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_export_keeps_source_journal_mode() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("delete-mode.db");
        let ids = seed(
            StoreOptions::new(&source).journal_mode(JournalMode::Delete),
            4,
        )
        .await;

        let summary = Exporter::new()
            .export(&source, dir.path().join("wal-dest.db"), &ids, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.exported, 4);

        let reopened = Store::open(
            StoreOptions::new(&source)
                .create_if_missing(false)
                .journal_mode(JournalMode::Unchanged),
        )
        .await
        .unwrap();
        assert_eq!(journal_mode(&reopened).await, "delete");
    }

    #[tokio::test]
    async fn test_rejects_blank_paths_and_empty_ids() {
        let exporter = Exporter::new();
        let token = CancellationToken::new();

        let error = exporter.export("  ", "dest.db", &[1], &token).await.unwrap_err();
        assert!(matches!(error, Error::InvalidArgument { name: "source_path", .. }));

        let error = exporter.export("source.db", "", &[1], &token).await.unwrap_err();
        assert!(matches!(error, Error::InvalidArgument { name: "dest_path", .. }));

        let error = exporter
            .export("source.db", "dest.db", &[], &token)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidArgument { name: "ids", .. }));
    }

    #[tokio::test]
    async fn test_missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("missing.db");
        let result = Exporter::new()
            .export(&source, dir.path().join("dest.db"), &[1], &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(Error::Database(_))));
        assert!(!source.exists());
    }

    #[test]
    fn test_token_is_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(clone.check("test").unwrap_err().is_cancelled());
    }
}
