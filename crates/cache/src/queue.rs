//! Asynchronous remote put pipeline
//!
//! A bounded channel of upload jobs drained by a fixed pool of worker
//! tasks, so foreground puts never wait on the remote tier. Closing the
//! queue drops the sender, lets the workers drain what is left, and
//! abandons whatever is still outstanding once the grace deadline passes.

use crate::metrics::Counters;
use crate::tier::RemoteCache;
use crate::{Error, Result};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One pending remote upload. The body stays on disk until a worker
/// picks the job up.
#[derive(Debug, Clone)]
pub struct PutJob {
    pub action_id: String,
    pub output_id: String,
    pub size: u64,
    pub body_path: PathBuf,
}

/// What to do when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnqueueMode {
    /// Block the caller until a worker frees a slot (default)
    #[default]
    Blocking,
    /// Drop the job and count it; only meaningful with a non-zero queue
    BestEffort,
}

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Channel depth; 0 runs every put synchronously on the caller
    pub queue_len: usize,
    /// Worker task count, minimum 1
    pub workers: usize,
    /// Full-queue behavior
    pub mode: EnqueueMode,
    /// How long `close` waits for in-flight uploads before abandoning them
    pub drain_grace: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            queue_len: 0,
            workers: 1,
            mode: EnqueueMode::Blocking,
            drain_grace: Duration::from_secs(30),
        }
    }
}

/// Bounded job queue plus worker pool for remote puts
pub struct PutQueue {
    remote: Arc<dyn RemoteCache>,
    stats: Arc<Counters>,
    mode: EnqueueMode,
    grace: Duration,
    /// `None` in synchronous mode and after close
    tx: Mutex<Option<mpsc::Sender<PutJob>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    outstanding: Arc<AtomicU64>,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl PutQueue {
    /// Spawn the worker pool. With `queue_len == 0` no workers are
    /// spawned and [`push`](Self::push) uploads inline.
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteCache>, stats: Arc<Counters>, opts: &QueueOptions) -> Self {
        let outstanding = Arc::new(AtomicU64::new(0));
        let (tx, handles) = if opts.queue_len == 0 {
            (None, Vec::new())
        } else {
            let (tx, rx) = mpsc::channel::<PutJob>(opts.queue_len);
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            let handles = (0..opts.workers.max(1))
                .map(|idx| {
                    tokio::spawn(worker_loop(
                        idx,
                        Arc::clone(&rx),
                        Arc::clone(&remote),
                        Arc::clone(&stats),
                        Arc::clone(&outstanding),
                    ))
                })
                .collect();
            (Some(tx), handles)
        };
        Self {
            remote,
            stats,
            mode: opts.mode,
            grace: opts.drain_grace,
            tx: Mutex::new(tx),
            handles: Mutex::new(handles),
            outstanding,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Hand a job to the pipeline.
    ///
    /// In synchronous mode the upload runs to completion here. Otherwise
    /// the call blocks while the queue is full (or drops, in best-effort
    /// mode). Upload failures are recorded in metrics, never returned;
    /// the only error is pushing after close.
    pub async fn push(&self, job: PutJob) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::configuration("put queue is closed"));
        }
        let tx = self.tx.lock().expect("queue sender mutex poisoned").clone();
        let Some(tx) = tx else {
            upload(&self.remote, &self.stats, job).await;
            return Ok(());
        };

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        match self.mode {
            EnqueueMode::Blocking => {
                if tx.send(job).await.is_err() {
                    self.outstanding.fetch_sub(1, Ordering::AcqRel);
                    return Err(Error::configuration("put queue is closed"));
                }
            }
            EnqueueMode::BestEffort => match tx.try_send(job) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(job)) => {
                    self.outstanding.fetch_sub(1, Ordering::AcqRel);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(action = %job.action_id, "put queue full, dropping remote upload");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.outstanding.fetch_sub(1, Ordering::AcqRel);
                    return Err(Error::configuration("put queue is closed"));
                }
            },
        }
        Ok(())
    }

    /// Jobs dropped by best-effort enqueue
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the channel and wait for the workers to drain.
    ///
    /// Uploads still running when the grace deadline expires are aborted
    /// and counted as put errors.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(self.tx.lock().expect("queue sender mutex poisoned").take());
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.handles.lock().expect("queue handles mutex poisoned"));
        if handles.is_empty() {
            return;
        }

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.grace, drain).await.is_err() {
            for abort in aborts {
                abort.abort();
            }
            let abandoned = self.outstanding.load(Ordering::Acquire);
            warn!(
                abandoned,
                grace_secs = self.grace.as_secs_f64(),
                "remote put drain deadline expired, abandoning uploads"
            );
            if abandoned > 0 {
                self.stats.record_abandoned_puts(abandoned);
            }
        }
        let dropped = self.dropped();
        if dropped > 0 {
            warn!(dropped, "best-effort puts dropped while the queue was full");
        }
    }
}

async fn worker_loop(
    idx: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PutJob>>>,
    remote: Arc<dyn RemoteCache>,
    stats: Arc<Counters>,
    outstanding: Arc<AtomicU64>,
) {
    loop {
        // Lock only to dequeue; uploads run with the receiver released so
        // the other workers keep draining.
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else { break };
        upload(&remote, &stats, job).await;
        outstanding.fetch_sub(1, Ordering::AcqRel);
    }
    debug!(worker = idx, "remote put worker exited");
}

/// Read the local body and upload it, recording tallies and an upload
/// speed sample. Failures are logged and counted; the corresponding
/// local put already succeeded, so nothing propagates.
async fn upload(remote: &Arc<dyn RemoteCache>, stats: &Counters, job: PutJob) {
    let body = match tokio::fs::read(&job.body_path).await {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            warn!(
                action = %job.action_id,
                path = %job.body_path.display(),
                error = %e,
                "failed to read local body for remote put"
            );
            stats.record_put_error();
            return;
        }
    };
    let start = Instant::now();
    match remote.put(&job.action_id, &job.output_id, job.size, body).await {
        Ok(()) => {
            stats.record_put(job.size);
            stats.record_upload(job.size, start.elapsed());
            debug!(action = %job.action_id, bytes = job.size, "remote put complete");
        }
        Err(e) => {
            warn!(action = %job.action_id, error = %e, "remote put failed");
            stats.record_put_error();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryRemote;
    use tempfile::TempDir;

    fn job(dir: &TempDir, tag: u8, body: &[u8]) -> PutJob {
        let path = dir.path().join(format!("body-{tag}"));
        std::fs::write(&path, body).unwrap();
        PutJob {
            action_id: hex::encode([tag; 32]),
            output_id: hex::encode([tag ^ 0xff; 32]),
            size: body.len() as u64,
            body_path: path,
        }
    }

    #[tokio::test]
    async fn synchronous_mode_uploads_inline() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let stats = Arc::new(Counters::new("s3"));
        let queue = PutQueue::new(remote.clone(), stats.clone(), &QueueOptions::default());

        let j = job(&dir, 1, b"hello");
        queue.push(j.clone()).await.unwrap();
        assert_eq!(remote.put_count(), 1);
        assert!(remote.contains(&j.action_id));
        assert_eq!(stats.snapshot().puts, 1);
        queue.close().await;
    }

    #[tokio::test]
    async fn workers_drain_everything_before_close_returns() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        remote.set_put_delay(Duration::from_millis(10));
        let stats = Arc::new(Counters::new("s3"));
        let opts = QueueOptions {
            queue_len: 8,
            workers: 2,
            ..QueueOptions::default()
        };
        let queue = PutQueue::new(remote.clone(), stats.clone(), &opts);

        for tag in 0..16u8 {
            queue.push(job(&dir, tag, b"payload")).await.unwrap();
        }
        queue.close().await;
        assert_eq!(remote.put_count(), 16);
        assert_eq!(stats.snapshot().puts, 16);
        assert_eq!(stats.snapshot().put_errors, 0);
    }

    #[tokio::test]
    async fn best_effort_mode_drops_when_full() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        remote.set_put_delay(Duration::from_millis(200));
        let stats = Arc::new(Counters::new("s3"));
        let opts = QueueOptions {
            queue_len: 1,
            workers: 1,
            mode: EnqueueMode::BestEffort,
            ..QueueOptions::default()
        };
        let queue = PutQueue::new(remote.clone(), stats, &opts);

        // First job is picked up, second fills the single slot, the rest
        // must be dropped without blocking.
        for tag in 0..6u8 {
            queue.push(job(&dir, tag, b"x")).await.unwrap();
        }
        assert!(queue.dropped() >= 4);
        queue.close().await;
    }

    #[tokio::test]
    async fn drain_deadline_abandons_slow_uploads() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        remote.set_put_delay(Duration::from_secs(60));
        let stats = Arc::new(Counters::new("s3"));
        let opts = QueueOptions {
            queue_len: 4,
            workers: 1,
            drain_grace: Duration::from_millis(50),
            ..QueueOptions::default()
        };
        let queue = PutQueue::new(remote.clone(), stats.clone(), &opts);

        queue.push(job(&dir, 9, b"slow")).await.unwrap();
        queue.close().await;
        assert_eq!(stats.snapshot().put_errors, 1);
    }

    #[tokio::test]
    async fn push_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let stats = Arc::new(Counters::new("s3"));
        let queue = PutQueue::new(remote, stats, &QueueOptions::default());
        queue.close().await;
        assert!(queue.push(job(&dir, 3, b"late")).await.is_err());
    }

    #[tokio::test]
    async fn upload_failure_is_counted_not_returned() {
        let dir = TempDir::new().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        remote.set_fail_puts(true);
        let stats = Arc::new(Counters::new("s3"));
        let queue = PutQueue::new(remote, stats.clone(), &QueueOptions::default());

        queue.push(job(&dir, 7, b"doomed")).await.unwrap();
        assert_eq!(stats.snapshot().put_errors, 1);
        queue.close().await;
    }
}
