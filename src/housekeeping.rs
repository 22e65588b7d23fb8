//! Retention enforcement and bulk deletion
//!
//! In automatic mode a background timer removes records older than the
//! retention window. The timer holds only a weak reference, so dropping the
//! last [`Housekeeper`] handle stops it.

use crate::clock::Clock;
use crate::config::{HousekeepingConfig, HousekeepingMode};
use crate::error::{Error, Result};
use crate::record::format_instant;
use crate::store::{placeholders, Store, TABLE_NAME};
use parking_lot::{Mutex, RwLock};
use sqlx::sqlite::SqliteConnection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Largest id list bound into a single `IN (…)` clause.
pub const DELETE_CHUNK_SIZE: usize = 500;

pub struct Housekeeper {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    retention: RwLock<chrono::Duration>,
    mode: HousekeepingMode,
    running: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Housekeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Housekeeper")
            .field("mode", &self.mode)
            .field("retention", &*self.retention.read())
            .finish()
    }
}

impl Housekeeper {
    /// Create a housekeeper. Automatic mode starts the cleanup timer, which
    /// requires a tokio runtime.
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, config: &HousekeepingConfig) -> Arc<Self> {
        let housekeeper = Arc::new(Self {
            store,
            clock,
            retention: RwLock::new(config.retention()),
            mode: config.mode,
            running: AtomicBool::new(false),
            timer: Mutex::new(None),
        });

        if config.mode == HousekeepingMode::Automatic {
            let handle = spawn_cleanup_task(Arc::downgrade(&housekeeper), config.interval());
            *housekeeper.timer.lock() = Some(handle);
        }

        housekeeper
    }

    pub fn mode(&self) -> HousekeepingMode {
        self.mode
    }

    pub fn retention(&self) -> chrono::Duration {
        *self.retention.read()
    }

    /// Change the retention window. Takes effect on the next cleanup.
    pub fn set_retention(&self, retention: chrono::Duration) -> Result<()> {
        if retention <= chrono::Duration::zero() {
            return Err(Error::invalid_argument("retention", "must be positive"));
        }
        *self.retention.write() = retention;
        Ok(())
    }

    /// Run one retention pass now. Same as [`delete_old_entries`](Self::delete_old_entries).
    pub async fn execute_housekeeping(&self) -> Result<u64> {
        self.delete_old_entries().await
    }

    /// Delete records older than `now - retention`; compacts the file when
    /// anything was removed.
    pub async fn delete_old_entries(&self) -> Result<u64> {
        let retention = self.retention();
        let Some(cutoff) = self.clock.now().checked_sub_signed(retention) else {
            // The window reaches past the earliest representable instant.
            tracing::debug!(retention = ?retention, "Retention window unbounded, nothing to delete");
            return Ok(0);
        };
        let cutoff = format_instant(&cutoff);
        let sql: Arc<str> = format!("DELETE FROM {} WHERE timestamp < ?", TABLE_NAME).into();
        let cutoff: Arc<str> = cutoff.into();

        let deleted = self
            .store
            .execute_in_transaction(|conn| {
                let sql = Arc::clone(&sql);
                let cutoff = Arc::clone(&cutoff);
                Box::pin(async move { delete_before(conn, &sql, &cutoff).await })
            })
            .await?;

        if deleted > 0 {
            self.store.execute_non_query("VACUUM").await?;
        }

        tracing::info!(
            deleted = deleted,
            cutoff = %cutoff,
            "Log retention cleanup completed"
        );

        Ok(deleted)
    }

    /// Remove every record.
    pub async fn delete_all(&self) -> Result<u64> {
        let sql: Arc<str> = format!("DELETE FROM {}", TABLE_NAME).into();
        let deleted = self
            .store
            .execute_in_transaction(|conn| {
                let sql = Arc::clone(&sql);
                Box::pin(async move { execute(conn, &sql).await })
            })
            .await?;

        tracing::info!(deleted = deleted, "Deleted all log records");
        Ok(deleted)
    }

    /// Delete the given ids, one transaction per chunk of
    /// [`DELETE_CHUNK_SIZE`]. Unknown ids are ignored.
    pub async fn delete_by_ids(&self, ids: &[i64]) -> Result<u64> {
        let mut deleted = 0;

        for chunk in ids.chunks(DELETE_CHUNK_SIZE) {
            let sql: Arc<str> = format!(
                "DELETE FROM {} WHERE id IN ({})",
                TABLE_NAME,
                placeholders(chunk.len())
            )
            .into();
            let chunk: Arc<[i64]> = chunk.into();

            deleted += self
                .store
                .execute_in_transaction(|conn| {
                    let sql = Arc::clone(&sql);
                    let chunk = Arc::clone(&chunk);
                    Box::pin(async move { delete_ids(conn, &sql, &chunk).await })
                })
                .await?;
        }

        tracing::info!(
            requested = ids.len(),
            deleted = deleted,
            "Deleted log records by id"
        );
        Ok(deleted)
    }

    /// Stop the cleanup timer. Manual calls keep working.
    pub fn dispose(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
            tracing::debug!("Log housekeeping timer stopped");
        }
    }

    /// One timer tick. Skipped when the previous pass is still running.
    async fn run_scheduled(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Previous log cleanup still running, skipping tick");
            return;
        }
        let _running = RunningGuard(&self.running);

        if let Err(e) = self.delete_old_entries().await {
            tracing::error!(error = %e, "Scheduled log cleanup failed");
        }
    }
}

/// Clears the running flag when a scheduled pass ends, even by panic.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().take() {
            handle.abort();
        }
    }
}

fn spawn_cleanup_task(housekeeper: Weak<Housekeeper>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; cleanup starts one interval in.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(housekeeper) = housekeeper.upgrade() else {
                break;
            };
            // Detached so a slow pass does not delay the next tick; the
            // running flag turns overlapping ticks into no-ops.
            tokio::spawn(async move { housekeeper.run_scheduled().await });
        }
    })
}

async fn execute(conn: &mut SqliteConnection, sql: &str) -> Result<u64> {
    let result = sqlx::query(sql).execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

async fn delete_before(conn: &mut SqliteConnection, sql: &str, cutoff: &str) -> Result<u64> {
    let result = sqlx::query(sql).bind(cutoff).execute(&mut *conn).await?;
    Ok(result.rows_affected())
}

async fn delete_ids(conn: &mut SqliteConnection, sql: &str, ids: &[i64]) -> Result<u64> {
    let mut query = sqlx::query(sql);
    for id in ids {
        query = query.bind(*id);
    }
    let result = query.execute(&mut *conn).await?;
    Ok(result.rows_affected())
}
