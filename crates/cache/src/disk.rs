//! Content-addressed disk tier
//!
//! Stores action→output mappings and output bodies under a single root:
//!
//! ```text
//! <root>/
//!   a/<hh>/<ActionID>-a    action record (JSON: OutputID + Size)
//!   o/<hh>/<OutputID>-d    output body bytes
//! ```
//!
//! `<hh>` is the first two hex characters of the ID, which bounds any one
//! directory to 256 children. Bodies are keyed by OutputID, so identical
//! outputs are stored once. Writes go body first, then record, each via a
//! temp file plus atomic rename: a crash can leave an orphan body but
//! never a dangling record.

use crate::metrics::Counters;
use crate::tier::{Body, Cache, Hit};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// The indirection stored under an ActionID: which output, how large.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Content hash of the output body
    #[serde(rename = "OutputID")]
    pub output_id: String,
    /// Body length in bytes
    #[serde(rename = "Size")]
    pub size: u64,
}

/// Local disk cache tier
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
    stats: Arc<Counters>,
}

impl DiskCache {
    /// Create a disk cache rooted at `root`. Directories are created
    /// lazily on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stats: Arc::new(Counters::new("disk")),
        }
    }

    /// Root directory of this tier
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// This tier's operation counters
    #[must_use]
    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.stats)
    }

    fn action_path(&self, action_id: &str) -> PathBuf {
        self.root
            .join("a")
            .join(&action_id[..2])
            .join(format!("{action_id}-a"))
    }

    fn output_path(&self, output_id: &str) -> PathBuf {
        self.root
            .join("o")
            .join(&output_id[..2])
            .join(format!("{output_id}-d"))
    }

    async fn get_inner(&self, action_id: &str) -> Result<Option<Hit>> {
        check_id(action_id)?;
        let record_path = self.action_path(action_id);
        let raw = match tokio::fs::read(&record_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(e, &record_path, "read")),
        };
        // A record that does not parse is half-written or corrupt; both
        // count as not cached.
        let record: ActionRecord = match serde_json::from_slice(&raw) {
            Ok(record) => record,
            Err(e) => {
                debug!(action = action_id, error = %e, "unreadable action record, treating as miss");
                return Ok(None);
            }
        };
        // A record that parses but names a malformed output ID is just as
        // corrupt as one that does not parse.
        if check_id(&record.output_id).is_err() {
            debug!(
                action = action_id,
                "action record names an invalid output ID, treating as miss"
            );
            return Ok(None);
        }

        let body_path = self.output_path(&record.output_id);
        let meta = match tokio::fs::metadata(&body_path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(e, &body_path, "stat")),
        };
        if meta.len() != record.size {
            debug!(
                action = action_id,
                expected = record.size,
                actual = meta.len(),
                "body length does not match record, treating as miss"
            );
            return Ok(None);
        }

        let modified = meta
            .modified()
            .map_err(|e| Error::io(e, &body_path, "mtime"))?;
        Ok(Some(Hit {
            output_id: record.output_id,
            size: record.size,
            disk_path: body_path,
            modified,
        }))
    }

    async fn put_inner(
        &self,
        action_id: &str,
        output_id: &str,
        size: u64,
        body: Body,
    ) -> Result<PathBuf> {
        check_id(action_id)?;
        check_id(output_id)?;
        let body_path = self.output_path(output_id);
        self.write_atomic(&body_path, size, body).await?;

        let record = ActionRecord {
            output_id: output_id.to_string(),
            size,
        };
        let json = serde_json::to_vec(&record)
            .map_err(|e| Error::serialization(format!("encode action record: {e}")))?;
        let record_path = self.action_path(action_id);
        self.write_atomic(&record_path, json.len() as u64, Body::Bytes(json.into()))
            .await?;

        Ok(body_path)
    }

    /// Stream `body` into a temp file next to `dest`, validate the
    /// consumed length against `size`, fsync, then rename into place.
    async fn write_atomic(&self, dest: &Path, size: u64, body: Body) -> Result<()> {
        let dir = dest.parent().expect("cache paths always have a parent");
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::io(e, dir, "create_dir_all"))?;

        let tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io(e, dir, "create"))?;
        let (file, tmp_path) = tmp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let written = match body {
            // Zero-byte fast path: nothing to stream, the file must still
            // exist with length zero.
            Body::Empty => 0,
            other => {
                let mut reader = other.into_reader().await?;
                tokio::io::copy(&mut reader, &mut file)
                    .await
                    .map_err(|e| Error::io(e, dest, "write"))?
            }
        };
        if written != size {
            // Dropping tmp_path deletes the partial file; no record ever
            // points at it.
            return Err(Error::size_mismatch(size, written));
        }

        file.flush().await.map_err(|e| Error::io(e, dest, "flush"))?;
        file.sync_all()
            .await
            .map_err(|e| Error::io(e, dest, "sync"))?;
        drop(file);

        tmp_path
            .persist(dest)
            .map_err(|e| Error::io(e.error, dest, "rename"))?;
        Ok(())
    }
}

#[async_trait]
impl Cache for DiskCache {
    fn kind(&self) -> &'static str {
        "disk"
    }

    async fn get(&self, action_id: &str) -> Result<Option<Hit>> {
        match self.get_inner(action_id).await {
            Ok(Some(hit)) => {
                self.stats.record_get_hit(hit.size);
                Ok(Some(hit))
            }
            Ok(None) => {
                self.stats.record_get_miss();
                Ok(None)
            }
            Err(e) => {
                self.stats.record_get_error();
                Err(e)
            }
        }
    }

    async fn put(
        &self,
        action_id: &str,
        output_id: &str,
        size: u64,
        body: Body,
    ) -> Result<PathBuf> {
        match self.put_inner(action_id, output_id, size, body).await {
            Ok(path) => {
                self.stats.record_put(size);
                Ok(path)
            }
            Err(e) => {
                self.stats.record_put_error();
                Err(e)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn check_id(id: &str) -> Result<()> {
    if id.len() < 2 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::configuration(format!("invalid cache ID {id:?}")));
    }
    Ok(())
}
