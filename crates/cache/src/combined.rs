//! Read-through / write-through composition of the disk tier over a
//! remote tier
//!
//! The toolchain needs a local disk path for every hit, so the remote
//! tier's only job here is to populate the disk tier. Remote failures
//! never surface as errors: a failed remote get degrades to a miss, a
//! failed remote put leaves the already-successful local put standing.

use crate::disk::DiskCache;
use crate::metrics::Counters;
use crate::queue::{PutJob, PutQueue, QueueOptions};
use crate::tier::{Body, Cache, Hit, RemoteCache};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Two-level cache: disk in front, optional remote behind
pub struct CombinedCache {
    disk: DiskCache,
    remote: Option<Arc<dyn RemoteCache>>,
    remote_stats: Option<Arc<Counters>>,
    queue: Option<PutQueue>,
}

impl CombinedCache {
    /// Disk tier only; every remote concern is disabled.
    #[must_use]
    pub fn local_only(disk: DiskCache) -> Self {
        Self {
            disk,
            remote: None,
            remote_stats: None,
            queue: None,
        }
    }

    /// Disk tier backed by `remote`, with uploads flowing through the
    /// async put pipeline configured by `opts`.
    #[must_use]
    pub fn new(disk: DiskCache, remote: Arc<dyn RemoteCache>, opts: &QueueOptions) -> Self {
        let stats = Arc::new(Counters::new(remote.kind()));
        let queue = PutQueue::new(Arc::clone(&remote), Arc::clone(&stats), opts);
        info!(
            remote = remote.kind(),
            queue_len = opts.queue_len,
            workers = opts.workers,
            "combined cache configured"
        );
        Self {
            disk,
            remote: Some(remote),
            remote_stats: Some(stats),
            queue: Some(queue),
        }
    }

    /// Counters of the disk tier
    #[must_use]
    pub fn disk_counters(&self) -> Arc<Counters> {
        self.disk.counters()
    }

    /// Counters of the remote tier, if one is configured
    #[must_use]
    pub fn remote_counters(&self) -> Option<Arc<Counters>> {
        self.remote_stats.as_ref().map(Arc::clone)
    }

    /// Fetch from the remote tier and materialize the body locally.
    async fn fill_from_remote(
        &self,
        remote: &Arc<dyn RemoteCache>,
        stats: &Counters,
        action_id: &str,
    ) -> Result<Option<Hit>> {
        let remote_hit = match remote.get(action_id).await {
            Ok(Some(hit)) => hit,
            Ok(None) => {
                stats.record_get_miss();
                return Ok(None);
            }
            Err(e) => {
                warn!(action = action_id, remote = remote.kind(), error = %e, "remote get failed, degrading to miss");
                stats.record_get_error();
                return Ok(None);
            }
        };
        stats.record_get_hit(remote_hit.size);

        let start = Instant::now();
        let body = if remote_hit.size == 0 {
            Body::Empty
        } else {
            Body::Reader(remote_hit.body)
        };
        let disk_path = match self
            .disk
            .put(action_id, &remote_hit.output_id, remote_hit.size, body)
            .await
        {
            Ok(path) => path,
            // A remote body that does not match its declared size is a
            // corrupt entry, which reads as a miss. Real disk failures
            // still propagate.
            Err(Error::SizeMismatch { expected, actual }) => {
                warn!(
                    action = action_id,
                    expected, actual, "remote body length mismatch, degrading to miss"
                );
                stats.record_get_error();
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        stats.record_download(remote_hit.size, start.elapsed());

        let meta = tokio::fs::metadata(&disk_path)
            .await
            .map_err(|e| Error::io(e, &disk_path, "stat"))?;
        let modified = meta
            .modified()
            .map_err(|e| Error::io(e, &disk_path, "mtime"))?;
        Ok(Some(Hit {
            output_id: remote_hit.output_id,
            size: remote_hit.size,
            disk_path,
            modified,
        }))
    }
}

#[async_trait]
impl Cache for CombinedCache {
    fn kind(&self) -> &'static str {
        "combined"
    }

    async fn get(&self, action_id: &str) -> Result<Option<Hit>> {
        if let Some(hit) = self.disk.get(action_id).await? {
            return Ok(Some(hit));
        }
        match (&self.remote, &self.remote_stats) {
            (Some(remote), Some(stats)) => self.fill_from_remote(remote, stats, action_id).await,
            _ => Ok(None),
        }
    }

    async fn put(
        &self,
        action_id: &str,
        output_id: &str,
        size: u64,
        body: Body,
    ) -> Result<PathBuf> {
        // Local first: the parent needs the disk path, and a put that
        // lands on disk is a success regardless of the remote tier.
        let disk_path = self.disk.put(action_id, output_id, size, body).await?;

        if let Some(queue) = &self.queue {
            let job = PutJob {
                action_id: action_id.to_string(),
                output_id: output_id.to_string(),
                size,
                body_path: disk_path.clone(),
            };
            if let Err(e) = queue.push(job).await {
                warn!(action = action_id, error = %e, "failed to enqueue remote put");
                if let Some(stats) = &self.remote_stats {
                    stats.record_put_error();
                }
            }
        }
        Ok(disk_path)
    }

    async fn close(&self) -> Result<()> {
        if let Some(queue) = &self.queue {
            queue.close().await;
        }
        if let Some(remote) = &self.remote {
            remote.close().await?;
        }
        self.disk.close().await
    }
}
