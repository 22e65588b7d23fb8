//! Single-connection access to one store file
//!
//! A [`Store`] owns exactly one SQLite connection. The connection sits behind
//! an async mutex, which is also the single-writer gate: writes, housekeeping
//! and exports against the same file take turns. Busy/locked errors (raised by
//! other processes, or other handles on the same file) are retried with a
//! linear backoff; every other error propagates on the first attempt.

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;

const COMPONENT: &str = "log store connection";

/// How `BEGIN` acquires locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionBehavior {
    Deferred,
    #[default]
    Immediate,
    Exclusive,
}

impl TransactionBehavior {
    fn begin_sql(self) -> &'static str {
        match self {
            Self::Deferred => "BEGIN DEFERRED",
            Self::Immediate => "BEGIN IMMEDIATE",
            Self::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    #[default]
    Wal,
    Delete,
    /// Leave whatever mode the file already uses.
    Unchanged,
}

impl JournalMode {
    fn pragma(self) -> Option<SqliteJournalMode> {
        match self {
            Self::Wal => Some(SqliteJournalMode::Wal),
            Self::Delete => Some(SqliteJournalMode::Delete),
            Self::Unchanged => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub path: PathBuf,
    pub journal_mode: JournalMode,
    pub busy_timeout: Duration,
    pub transaction_behavior: TransactionBehavior,
    /// Total attempts for a busy/locked operation, including the first.
    pub max_attempts: u32,
    /// Backoff before retry `n` is `backoff_step * n`.
    pub backoff_step: Duration,
    pub create_if_missing: bool,
}

impl StoreOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            journal_mode: JournalMode::Wal,
            busy_timeout: Duration::from_secs(5),
            transaction_behavior: TransactionBehavior::Immediate,
            max_attempts: 3,
            backoff_step: Duration::from_millis(100),
            create_if_missing: true,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            path: config.database_path(),
            journal_mode: config.journal_mode,
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            transaction_behavior: config.transaction_behavior,
            max_attempts: config.max_retry_attempts.max(1),
            backoff_step: Duration::from_millis(config.retry_backoff_ms),
            create_if_missing: true,
        }
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn journal_mode(mut self, mode: JournalMode) -> Self {
        self.journal_mode = mode;
        self
    }
}

/// Connection manager for one store file.
pub struct Store {
    conn: Mutex<Option<SqliteConnection>>,
    options: StoreOptions,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.options.path)
            .field("journal_mode", &self.options.journal_mode)
            .field("transaction_behavior", &self.options.transaction_behavior)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open (and, unless disabled, create) the store file.
    ///
    /// The parent directory is created when missing.
    pub async fn open(options: StoreOptions) -> Result<Self> {
        if options.create_if_missing {
            if let Some(parent) = options.path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        let mut connect_options = SqliteConnectOptions::new()
            .filename(&options.path)
            .create_if_missing(options.create_if_missing)
            .busy_timeout(options.busy_timeout)
            .pragma("synchronous", "NORMAL")
            .pragma("temp_store", "memory");
        if let Some(mode) = options.journal_mode.pragma() {
            connect_options = connect_options.journal_mode(mode);
        }

        let conn = connect_options.connect().await?;

        tracing::debug!(
            path = %options.path.display(),
            journal_mode = ?options.journal_mode,
            "Opened log store connection"
        );

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            options,
        })
    }

    pub fn path(&self) -> &Path {
        &self.options.path
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Run one statement outside any explicit transaction, without retry.
    pub async fn execute_non_query(&self, sql: &str) -> Result<u64> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(Error::Disposed(COMPONENT))?;
        let result = sqlx::query(sql).execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }

    /// Run `action` inside `BEGIN … COMMIT`.
    ///
    /// On busy/locked the transaction is rolled back and the whole action is
    /// re-run after `backoff_step * attempt`, up to `max_attempts` in total.
    /// Any other error rolls back and is returned immediately.
    pub async fn execute_in_transaction<T, F>(&self, mut action: F) -> Result<T>
    where
        F: for<'c> FnMut(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send,
        T: Send,
    {
        let behavior = self.options.transaction_behavior;
        let mut attempt = 1;

        loop {
            let outcome = {
                let mut guard = self.conn.lock().await;
                let conn = guard.as_mut().ok_or(Error::Disposed(COMPONENT))?;
                run_transaction(conn, behavior, &mut action).await
            };

            match outcome {
                Err(e) if e.is_busy() && attempt < self.options.max_attempts => {
                    self.backoff(attempt, &e).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Same retry contract as [`execute_in_transaction`](Self::execute_in_transaction),
    /// without the transaction. Used by read paths.
    pub async fn execute_with_retry<T, F>(&self, mut action: F) -> Result<T>
    where
        F: for<'c> FnMut(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send,
        T: Send,
    {
        let mut attempt = 1;

        loop {
            let outcome = {
                let mut guard = self.conn.lock().await;
                let conn = guard.as_mut().ok_or(Error::Disposed(COMPONENT))?;
                action(conn).await
            };

            match outcome {
                Err(e) if e.is_busy() && attempt < self.options.max_attempts => {
                    self.backoff(attempt, &e).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn backoff(&self, attempt: u32, error: &Error) {
        let delay = self.options.backoff_step * attempt;
        tracing::warn!(
            path = %self.options.path.display(),
            attempt = attempt,
            max_attempts = self.options.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Log store busy, retrying"
        );
        tokio::time::sleep(delay).await;
    }

    /// Size of the main database file in bytes.
    pub fn file_size(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.options.path)?.len())
    }

    pub async fn is_closed(&self) -> bool {
        self.conn.lock().await.is_none()
    }

    /// Close the connection. Later operations fail with [`Error::Disposed`].
    pub async fn close(&self) {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            match conn.close().await {
                Ok(()) => tracing::debug!(
                    path = %self.options.path.display(),
                    "Closed log store connection"
                ),
                Err(e) => tracing::warn!(
                    path = %self.options.path.display(),
                    error = %e,
                    "Failed to close log store connection cleanly"
                ),
            }
        }
    }
}

async fn run_transaction<T, F>(
    conn: &mut SqliteConnection,
    behavior: TransactionBehavior,
    action: &mut F,
) -> Result<T>
where
    F: for<'c> FnMut(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>>,
{
    sqlx::query(behavior.begin_sql()).execute(&mut *conn).await?;

    match action(&mut *conn).await {
        Ok(value) => {
            if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
                rollback(conn).await;
                return Err(e.into());
            }
            Ok(value)
        }
        Err(e) => {
            rollback(conn).await;
            Err(e)
        }
    }
}

async fn rollback(conn: &mut SqliteConnection) {
    if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
        tracing::debug!(error = %e, "Rollback failed");
    }
}
