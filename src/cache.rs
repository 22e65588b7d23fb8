//! Bounded in-memory batching in front of the record writer
//!
//! Producers hand records to [`BatchingCache::add`], which never awaits. A
//! single background task drains the queue in `batch_size` chunks:
//! - woken on every enqueue and on shutdown
//! - woken by a periodic tick, so records restored after a failed write are
//!   retried without waiting for new traffic
//! - failed batches go back to the head of the queue, keeping FIFO order

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::record::LogRecord;
use crate::store::RecordWriter;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const COMPONENT: &str = "batching cache";
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Lifecycle of a [`BatchingCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheState {
    Running = 0,
    /// Shutdown has started; new records are rejected.
    Draining = 1,
    Disposed = 2,
}

impl CacheState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Disposed,
        }
    }
}

struct CacheInner {
    writer: RecordWriter,
    queue: Mutex<VecDeque<LogRecord>>,
    /// Accepted and not yet durably written.
    pending: AtomicUsize,
    discarded: AtomicU64,
    state: AtomicU8,
    wake: Notify,
    /// Serializes drains between the background task and explicit flushes.
    flush_gate: tokio::sync::Mutex<()>,
    batch_size: usize,
    max_cache_size: usize,
    flush_interval: Duration,
    dispose_timeout: Duration,
}

impl CacheInner {
    fn state(&self) -> CacheState {
        CacheState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn take_batch(&self) -> Vec<LogRecord> {
        let mut queue = self.queue.lock();
        let count = queue.len().min(self.batch_size);
        queue.drain(..count).collect()
    }

    fn restore(&self, batch: Vec<LogRecord>) {
        let mut queue = self.queue.lock();
        for record in batch.into_iter().rev() {
            queue.push_front(record);
        }
    }

    /// Write queued records until the queue is empty. Returns the number
    /// written; on error the failed batch is back at the head of the queue.
    async fn drain(&self) -> Result<usize> {
        let _gate = self.flush_gate.lock().await;
        let start = Instant::now();
        let mut written = 0;

        loop {
            let batch = self.take_batch();
            if batch.is_empty() {
                break;
            }

            let count = batch.len();
            match self.writer.add_batch(&batch).await {
                Ok(_) => {
                    self.pending.fetch_sub(count, Ordering::AcqRel);
                    written += count;
                }
                Err(e) => {
                    self.restore(batch);
                    return Err(e);
                }
            }
        }

        if written > 0 {
            tracing::debug!(
                count = written,
                duration_ms = start.elapsed().as_millis() as u64,
                "Flushed cached log records"
            );
        }

        Ok(written)
    }
}

/// Bounded FIFO of records waiting to be written.
///
/// Must be created inside a tokio runtime: construction spawns the
/// background writer task.
pub struct BatchingCache {
    inner: Arc<CacheInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BatchingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchingCache")
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .field("discarded", &self.discarded_count())
            .finish()
    }
}

impl BatchingCache {
    pub fn new(writer: RecordWriter, config: &CacheConfig) -> Self {
        let inner = Arc::new(CacheInner {
            writer,
            queue: Mutex::new(VecDeque::new()),
            pending: AtomicUsize::new(0),
            discarded: AtomicU64::new(0),
            state: AtomicU8::new(CacheState::Running as u8),
            wake: Notify::new(),
            flush_gate: tokio::sync::Mutex::new(()),
            batch_size: config.batch_size.max(1),
            max_cache_size: config.max_cache_size,
            flush_interval: config.flush_interval().max(MIN_FLUSH_INTERVAL),
            dispose_timeout: config.dispose_timeout(),
        });

        let worker = tokio::spawn(writer_task(Arc::clone(&inner)));

        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue a record for writing. Never waits on I/O.
    ///
    /// When the cache is full the record is dropped and counted in
    /// [`discarded_count`](Self::discarded_count); that is not an error.
    pub fn add(&self, record: LogRecord) -> Result<()> {
        if self.inner.state() != CacheState::Running {
            return Err(Error::Disposed(COMPONENT));
        }

        let max = self.inner.max_cache_size;
        let accepted = self
            .inner
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                (pending < max).then_some(pending + 1)
            })
            .is_ok();

        if !accepted {
            let discarded = self.inner.discarded.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::trace!(discarded = discarded, "Log cache full, record discarded");
            return Ok(());
        }

        self.inner.queue.lock().push_back(record);
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Write everything queued right now and report how many records went out.
    pub async fn flush(&self) -> Result<usize> {
        if self.inner.state() == CacheState::Disposed {
            return Err(Error::Disposed(COMPONENT));
        }
        self.inner.drain().await
    }

    /// Wait until every accepted record is written, or `timeout` elapses.
    /// Returns whether the cache emptied in time.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pending_count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.inner.wake.notify_one();
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub fn discarded_count(&self) -> u64 {
        self.inner.discarded.load(Ordering::Relaxed)
    }

    /// Zero the discard counter, returning its previous value.
    pub fn reset_discarded_count(&self) -> u64 {
        self.inner.discarded.swap(0, Ordering::Relaxed)
    }

    pub fn state(&self) -> CacheState {
        self.inner.state()
    }

    /// Stop accepting records, drain what is queued and stop the task.
    ///
    /// Bounded by the configured dispose timeout. Records still queued
    /// afterwards are lost; this is logged, never returned.
    pub async fn dispose(&self) {
        let previous = self.inner.state.compare_exchange(
            CacheState::Running as u8,
            CacheState::Draining as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if let Err(state) = previous {
            if CacheState::from_u8(state) == CacheState::Disposed {
                return;
            }
        }

        self.inner.wake.notify_one();
        let start = Instant::now();
        let timeout = self.inner.dispose_timeout;

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            match tokio::time::timeout(timeout, worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Log cache writer task ended abnormally");
                }
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "Timed out waiting for log cache writer task"
                    );
                }
            }
        }

        if self.pending_count() > 0 {
            let remaining = timeout.saturating_sub(start.elapsed());
            match tokio::time::timeout(remaining, self.inner.drain()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Final log cache drain failed");
                }
                Err(_) => {
                    tracing::warn!("Final log cache drain timed out");
                }
            }
        }

        let remaining = self.pending_count();
        if remaining > 0 {
            tracing::warn!(
                remaining = remaining,
                "Log cache disposed with unwritten records"
            );
        }

        self.inner
            .state
            .store(CacheState::Disposed as u8, Ordering::Release);
    }
}

impl Drop for BatchingCache {
    fn drop(&mut self) {
        // The task holds its own reference; it drains and exits on its own.
        let _ = self.inner.state.compare_exchange(
            CacheState::Running as u8,
            CacheState::Draining as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.inner.wake.notify_one();
    }
}

async fn writer_task(inner: Arc<CacheInner>) {
    let mut ticker = tokio::time::interval(inner.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.wake.notified() => {}
            _ = ticker.tick() => {}
        }

        if let Err(e) = inner.drain().await {
            tracing::error!(
                error = %e,
                pending = inner.pending.load(Ordering::Acquire),
                "Failed to flush log cache"
            );
        }

        if inner.state() != CacheState::Running {
            break;
        }
    }

    tracing::debug!("Log cache writer task shutting down");
}
