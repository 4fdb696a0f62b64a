//! Cache tier capabilities and body streaming
//!
//! A tier is anything that can resolve an action to an output: the disk
//! cache, the combined disk+remote cache, or (behind [`RemoteCache`]) a
//! blob store. The toolchain protocol only ever talks to a [`Cache`]; the
//! remote side is a narrower contract because it never owns disk paths.

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::io::AsyncRead;

/// A resolved cache entry, always backed by a local file
#[derive(Debug)]
pub struct Hit {
    /// Content hash of the output, as supplied by the toolchain
    pub output_id: String,
    /// Body length in bytes
    pub size: u64,
    /// Absolute path the parent process may open directly
    pub disk_path: PathBuf,
    /// Modification time of the body file
    pub modified: SystemTime,
}

/// An output body on its way into a tier.
///
/// The disk tier consumes any variant by streaming; the empty variant is
/// the zero-byte fast path and never touches a reader.
pub enum Body {
    /// Zero-length body
    Empty,
    /// Fully materialized bytes (small inline protocol bodies)
    Bytes(Bytes),
    /// Body owned by a file on disk, opened lazily
    File(PathBuf),
    /// Streaming body, e.g. a remote download
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl Body {
    /// Open this body as an async reader.
    pub async fn into_reader(self) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        match self {
            Body::Empty => Ok(Box::new(tokio::io::empty())),
            Body::Bytes(bytes) => Ok(Box::new(std::io::Cursor::new(bytes))),
            Body::File(path) => {
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| Error::io(e, &path, "open"))?;
                Ok(Box::new(file))
            }
            Body::Reader(reader) => Ok(reader),
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Body::File(p) => write!(f, "Body::File({})", p.display()),
            Body::Reader(_) => f.write_str("Body::Reader"),
        }
    }
}

/// Capability set every local-facing cache tier implements
#[async_trait]
pub trait Cache: Send + Sync {
    /// Tier name, for logs and metrics
    fn kind(&self) -> &'static str;

    /// Resolve an action to a locally materialized output.
    ///
    /// `Ok(None)` is a miss; errors are local I/O failures only.
    async fn get(&self, action_id: &str) -> Result<Option<Hit>>;

    /// Store an output body under an action, returning the local path the
    /// body was materialized at.
    async fn put(&self, action_id: &str, output_id: &str, size: u64, body: Body)
        -> Result<PathBuf>;

    /// Flush and release tier resources. Must be called exactly once,
    /// after the last get/put.
    async fn close(&self) -> Result<()>;
}

/// A hit served by a remote tier; the body still has to be materialized
/// locally by the caller.
pub struct RemoteHit {
    /// Content hash of the output, from the object's metadata
    pub output_id: String,
    /// Body length in bytes
    pub size: u64,
    /// Streaming body
    pub body: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for RemoteHit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHit")
            .field("output_id", &self.output_id)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Contract over a remote blob store: get/put by action key.
///
/// Implementations must treat "not stored" as `Ok(None)`, never as an
/// error; errors from this trait mean the remote tier misbehaved and the
/// combined cache will degrade to local-only for that operation.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Store name, for logs and metrics
    fn kind(&self) -> &'static str;

    /// Fetch an entry by action. `Ok(None)` is a miss.
    async fn get(&self, action_id: &str) -> Result<Option<RemoteHit>>;

    /// Upload an output body under an action key.
    ///
    /// The body is fully materialized because blob-store SDKs sign the
    /// whole payload before sending.
    async fn put(&self, action_id: &str, output_id: &str, size: u64, body: Bytes) -> Result<()>;

    /// Release client resources.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
