//! The request/response loop
//!
//! Requests are read sequentially from the input stream and dispatched
//! each into its own task; all I/O happens there. Responses funnel
//! through one channel into a single writer task that owns the output
//! stream, so frames never interleave. `close` (or EOF) moves the loop
//! into draining: no new requests, outstanding tasks finish, the close
//! acknowledgement goes out last, the writer flushes, the loop exits.

use crate::error::{ProcError, Result};
use crate::wire::{Command, Request, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use gostash_cache::{Body, Cache};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Depth of the response funnel; request tasks park here when the parent
/// reads slowly.
const RESPONSE_CHANNEL_DEPTH: usize = 64;

/// The cache protocol engine
pub struct CacheProc<C> {
    cache: Arc<C>,
}

impl<C: Cache + 'static> CacheProc<C> {
    /// Build an engine serving `cache`
    #[must_use]
    pub fn new(cache: Arc<C>) -> Self {
        Self { cache }
    }

    /// Run the conversation until `close` or EOF.
    ///
    /// Per-request cache failures are reported to the parent as `Err`
    /// responses; the returned error is reserved for protocol violations
    /// and broken streams, both of which end the process.
    pub async fn run<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel::<Response>(RESPONSE_CHANNEL_DEPTH);
        let writer_task = tokio::spawn(write_loop(writer, rx));

        // Handshake: the parent learns what this process can do before
        // sending the first request.
        send(&tx, Response::hello()).await?;

        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut lines = reader.lines();
        let mut close_id: Option<i64> = None;

        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| ProcError::io(e, "read request"))?;
            let Some(line) = line else {
                debug!("request stream closed, draining");
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            let req: Request = serde_json::from_str(&line)
                .map_err(|e| ProcError::protocol(format!("malformed request: {e}")))?;
            req.validate()?;

            match req.command {
                Command::Close => {
                    debug!(id = req.id, "close requested, draining");
                    close_id = Some(req.id);
                    break;
                }
                Command::Get => {
                    let cache = Arc::clone(&self.cache);
                    let tx = tx.clone();
                    let id = req.id;
                    let action_id = req.action_id.expect("validated");
                    tasks.spawn(async move {
                        let resp = handle_get(cache.as_ref(), id, &action_id).await;
                        let _ = tx.send(resp).await;
                    });
                }
                Command::Put => {
                    // Decode the body source on the dispatch path so a
                    // malformed frame stays a fatal protocol error.
                    let body = request_body(&req)?;
                    let cache = Arc::clone(&self.cache);
                    let tx = tx.clone();
                    tasks.spawn(async move {
                        let resp = handle_put(cache.as_ref(), &req, body).await;
                        let _ = tx.send(resp).await;
                    });
                }
            }
        }

        // Draining: requests already dispatched run to completion and
        // their responses go out before the close acknowledgement.
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    return Err(ProcError::protocol(format!("request task panicked: {e}")));
                }
            }
        }
        if let Some(id) = close_id {
            send(&tx, Response::ack(id)).await?;
        }
        drop(tx);

        writer_task
            .await
            .map_err(|e| ProcError::protocol(format!("response writer failed: {e}")))??;
        info!("cache protocol loop stopped");
        Ok(())
    }
}

async fn send(tx: &mpsc::Sender<Response>, resp: Response) -> Result<()> {
    tx.send(resp)
        .await
        .map_err(|_| ProcError::protocol("response writer is gone"))
}

/// Single owner of the output stream: serializes frames and flushes
/// after each so the parent never waits on a buffered response.
async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<Response>,
) -> Result<()> {
    while let Some(resp) = rx.recv().await {
        let mut frame = serde_json::to_vec(&resp)
            .map_err(|e| ProcError::protocol(format!("encode response: {e}")))?;
        frame.push(b'\n');
        writer
            .write_all(&frame)
            .await
            .map_err(|e| ProcError::io(e, "write response"))?;
        writer
            .flush()
            .await
            .map_err(|e| ProcError::io(e, "flush response"))?;
    }
    Ok(())
}

async fn handle_get<C: Cache>(cache: &C, id: i64, action_id: &str) -> Response {
    match cache.get(action_id).await {
        Ok(Some(hit)) => {
            let time_nanos = hit
                .modified
                .duration_since(UNIX_EPOCH)
                .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
                .unwrap_or(0);
            Response::hit(
                id,
                hit.output_id,
                hit.size,
                time_nanos,
                hit.disk_path.to_string_lossy().into_owned(),
            )
        }
        Ok(None) => Response::miss(id),
        Err(e) => Response::error(id, e.to_string()),
    }
}

async fn handle_put<C: Cache>(cache: &C, req: &Request, body: Body) -> Response {
    let action_id = req.action_id.as_deref().expect("validated");
    let output_id = req.output_id.as_deref().expect("validated");
    match cache.put(action_id, output_id, req.body_size, body).await {
        Ok(path) => Response::stored(req.id, path.to_string_lossy().into_owned()),
        Err(e) => Response::error(req.id, e.to_string()),
    }
}

/// Pick the body source for a put: inline base64 wins, then the
/// out-of-band file, then the zero-byte fast path.
fn request_body(req: &Request) -> Result<Body> {
    if let Some(b64) = &req.body {
        let bytes = BASE64
            .decode(b64)
            .map_err(|e| ProcError::protocol(format!("request {}: bad inline body: {e}", req.id)))?;
        return Ok(Body::Bytes(bytes.into()));
    }
    if let Some(path) = &req.body_file {
        return Ok(Body::File(path.clone()));
    }
    Ok(Body::Empty)
}
