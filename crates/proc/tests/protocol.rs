//! End-to-end protocol conversations over in-memory pipes
//!
//! Each test plays the parent toolchain: it writes request lines into
//! the engine's input, reads response lines from its output, and checks
//! the observable cache state on disk and in the fake remote.

use bytes::Bytes;
use gostash_cache::test_utils::MemoryRemote;
use gostash_cache::{Cache, CombinedCache, DiskCache, EnqueueMode, QueueOptions};
use gostash_proc::CacheProc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

struct Parent {
    writer: WriteHalf<DuplexStream>,
    reader: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
    engine: JoinHandle<gostash_proc::Result<()>>,
}

impl Parent {
    /// Launch the engine over a duplex pipe and consume the handshake.
    async fn spawn(cache: Arc<CombinedCache>) -> Self {
        let (client, server) = tokio::io::duplex(1 << 20);
        let (server_r, server_w) = tokio::io::split(server);
        let engine = tokio::spawn(async move {
            CacheProc::new(cache)
                .run(BufReader::new(server_r), server_w)
                .await
        });
        let (client_r, client_w) = tokio::io::split(client);
        let mut parent = Self {
            writer: client_w,
            reader: BufReader::new(client_r).lines(),
            engine,
        };
        let hello = parent.recv().await;
        assert_eq!(hello["ID"], 0);
        assert_eq!(hello["KnownCommands"], json!(["get", "put", "close"]));
        parent
    }

    async fn send(&mut self, request: Value) {
        let mut line = request.to_string().into_bytes();
        line.push(b'\n');
        self.writer.write_all(&line).await.unwrap();
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = self
            .reader
            .next_line()
            .await
            .unwrap()
            .expect("engine closed the stream early");
        serde_json::from_str(&line).unwrap()
    }

    /// Close our end of the pipe and collect the engine's exit result.
    async fn shutdown(mut self) -> gostash_proc::Result<()> {
        self.writer.shutdown().await.ok();
        self.engine.await.unwrap()
    }
}

fn id64(c: char) -> String {
    std::iter::repeat(c).take(64).collect()
}

fn local_cache(tmp: &TempDir) -> Arc<CombinedCache> {
    Arc::new(CombinedCache::local_only(DiskCache::new(tmp.path())))
}

#[tokio::test]
async fn cold_miss_then_put_then_hit() {
    let tmp = TempDir::new().unwrap();
    let mut parent = Parent::spawn(local_cache(&tmp)).await;
    let action = id64('a');
    let output = id64('b');

    parent
        .send(json!({"ID": 1, "Command": "get", "ActionID": action}))
        .await;
    let resp = parent.recv().await;
    assert_eq!(resp["ID"], 1);
    assert_eq!(resp["Miss"], true);

    let body_file = tmp.path().join("parent-body");
    std::fs::write(&body_file, b"hello").unwrap();
    parent
        .send(json!({
            "ID": 2,
            "Command": "put",
            "ActionID": action,
            "OutputID": output,
            "BodySize": 5,
            "BodyFile": body_file,
        }))
        .await;
    let resp = parent.recv().await;
    assert_eq!(resp["ID"], 2);
    let disk_path = resp["DiskPath"].as_str().unwrap().to_string();
    assert_eq!(std::fs::read(&disk_path).unwrap(), b"hello");

    parent
        .send(json!({"ID": 3, "Command": "get", "ActionID": action}))
        .await;
    let resp = parent.recv().await;
    assert_eq!(resp["ID"], 3);
    assert_eq!(resp["OutputID"], output.as_str());
    assert_eq!(resp["Size"], 5);
    assert_eq!(resp["DiskPath"].as_str().unwrap(), disk_path);
    assert!(resp["TimeNanos"].as_i64().unwrap() > 0);

    parent.send(json!({"ID": 4, "Command": "close"})).await;
    assert_eq!(parent.recv().await, json!({"ID": 4}));
    parent.shutdown().await.unwrap();
}

#[tokio::test]
async fn remote_fallthrough_materializes_locally() {
    let tmp = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let action = id64('c');
    let output = id64('d');
    remote.insert(&action, &output, Bytes::from_static(b"world"));
    let cache = Arc::new(CombinedCache::new(
        DiskCache::new(tmp.path()),
        remote.clone(),
        &QueueOptions::default(),
    ));
    let mut parent = Parent::spawn(cache).await;

    parent
        .send(json!({"ID": 1, "Command": "get", "ActionID": action}))
        .await;
    let resp = parent.recv().await;
    assert_eq!(resp["ID"], 1);
    assert_eq!(resp["OutputID"], output.as_str());
    assert_eq!(resp["Size"], 5);
    let disk_path = resp["DiskPath"].as_str().unwrap().to_string();
    assert_eq!(std::fs::read(&disk_path).unwrap(), b"world");

    // Still-running process: the second lookup is served from disk.
    parent
        .send(json!({"ID": 2, "Command": "get", "ActionID": action}))
        .await;
    let resp = parent.recv().await;
    assert_eq!(resp["ID"], 2);
    assert_eq!(resp["DiskPath"].as_str().unwrap(), disk_path);
    assert_eq!(remote.get_count(), 1);

    parent.shutdown().await.unwrap();
}

#[tokio::test]
async fn remote_error_degrades_to_miss() {
    let tmp = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    remote.set_fail_gets(true);
    let cache = Arc::new(CombinedCache::new(
        DiskCache::new(tmp.path()),
        remote,
        &QueueOptions::default(),
    ));
    let mut parent = Parent::spawn(cache.clone()).await;

    parent
        .send(json!({"ID": 1, "Command": "get", "ActionID": id64('e')}))
        .await;
    let resp = parent.recv().await;
    assert_eq!(resp["ID"], 1);
    assert_eq!(resp["Miss"], true);
    assert_eq!(cache.remote_counters().unwrap().snapshot().errors, 1);

    parent.shutdown().await.unwrap();
}

#[tokio::test]
async fn empty_body_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let mut parent = Parent::spawn(local_cache(&tmp)).await;
    let action = id64('f');
    let output = id64('0');

    parent
        .send(json!({
            "ID": 1,
            "Command": "put",
            "ActionID": action,
            "OutputID": output,
            "BodySize": 0,
        }))
        .await;
    let resp = parent.recv().await;
    assert_eq!(resp["ID"], 1);
    let disk_path = resp["DiskPath"].as_str().unwrap().to_string();
    assert_eq!(std::fs::metadata(&disk_path).unwrap().len(), 0);

    parent
        .send(json!({"ID": 2, "Command": "get", "ActionID": action}))
        .await;
    let resp = parent.recv().await;
    assert_eq!(resp["ID"], 2);
    assert_eq!(resp["OutputID"], output.as_str());
    assert_eq!(resp["Size"], 0);

    parent.shutdown().await.unwrap();
}

#[tokio::test]
async fn queued_remote_puts_drain_before_exit() {
    let tmp = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    remote.set_put_delay(Duration::from_millis(5));
    let opts = QueueOptions {
        queue_len: 8,
        workers: 2,
        mode: EnqueueMode::Blocking,
        drain_grace: Duration::from_secs(10),
    };
    let cache = Arc::new(CombinedCache::new(
        DiskCache::new(tmp.path()),
        remote.clone(),
        &opts,
    ));
    let mut parent = Parent::spawn(cache.clone()).await;

    for i in 0..16u8 {
        let body_file = tmp.path().join(format!("body-{i}"));
        std::fs::write(&body_file, b"payload").unwrap();
        parent
            .send(json!({
                "ID": i64::from(i) + 1,
                "Command": "put",
                "ActionID": hex(i),
                "OutputID": hex(i ^ 0xff),
                "BodySize": 7,
                "BodyFile": body_file,
            }))
            .await;
    }
    let mut seen = std::collections::BTreeSet::new();
    for _ in 0..16 {
        let resp = parent.recv().await;
        assert!(resp["Err"].is_null(), "unexpected error: {resp}");
        seen.insert(resp["ID"].as_i64().unwrap());
    }
    assert_eq!(seen.len(), 16);

    parent.send(json!({"ID": 99, "Command": "close"})).await;
    assert_eq!(parent.recv().await, json!({"ID": 99}));
    parent.shutdown().await.unwrap();

    // Process exit path: closing the cache blocks until the pipeline has
    // drained every upload.
    cache.close().await.unwrap();
    assert_eq!(remote.put_count(), 16);
}

#[tokio::test]
async fn size_mismatch_is_an_error_response_and_stays_uncached() {
    let tmp = TempDir::new().unwrap();
    let mut parent = Parent::spawn(local_cache(&tmp)).await;
    let action = id64('9');

    let body_file = tmp.path().join("short-body");
    std::fs::write(&body_file, b"hello").unwrap();
    parent
        .send(json!({
            "ID": 1,
            "Command": "put",
            "ActionID": action,
            "OutputID": id64('8'),
            "BodySize": 10,
            "BodyFile": body_file,
        }))
        .await;
    let resp = parent.recv().await;
    assert_eq!(resp["ID"], 1);
    assert!(resp["Err"].as_str().unwrap().contains("size mismatch"));
    assert!(resp["DiskPath"].is_null());

    parent
        .send(json!({"ID": 2, "Command": "get", "ActionID": action}))
        .await;
    let resp = parent.recv().await;
    assert_eq!(resp["Miss"], true);

    parent.shutdown().await.unwrap();
}

#[tokio::test]
async fn inline_base64_body_is_accepted() {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    let tmp = TempDir::new().unwrap();
    let mut parent = Parent::spawn(local_cache(&tmp)).await;
    let action = id64('1');

    parent
        .send(json!({
            "ID": 1,
            "Command": "put",
            "ActionID": action,
            "OutputID": id64('2'),
            "BodySize": 9,
            "Body": STANDARD.encode(&b"small blob"[..9]),
        }))
        .await;
    let resp = parent.recv().await;
    assert_eq!(resp["ID"], 1);
    let disk_path = resp["DiskPath"].as_str().unwrap().to_string();
    assert_eq!(std::fs::read(&disk_path).unwrap(), b"small blo");

    parent.shutdown().await.unwrap();
}

#[tokio::test]
async fn responses_correlate_by_id_not_order() {
    let tmp = TempDir::new().unwrap();
    let mut parent = Parent::spawn(local_cache(&tmp)).await;

    parent
        .send(json!({"ID": 41, "Command": "get", "ActionID": id64('3')}))
        .await;
    parent
        .send(json!({"ID": 42, "Command": "get", "ActionID": id64('4')}))
        .await;

    let first = parent.recv().await;
    let second = parent.recv().await;
    let mut ids = [first["ID"].as_i64().unwrap(), second["ID"].as_i64().unwrap()];
    ids.sort_unstable();
    assert_eq!(ids, [41, 42]);
    assert_eq!(first["Miss"], true);
    assert_eq!(second["Miss"], true);

    parent.shutdown().await.unwrap();
}

#[tokio::test]
async fn malformed_json_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let mut parent = Parent::spawn(local_cache(&tmp)).await;
    parent.send_raw("{this is not json").await;
    let err = parent.shutdown().await.unwrap_err();
    assert!(matches!(err, gostash_proc::ProcError::Protocol { .. }));
}

#[tokio::test]
async fn unknown_command_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let mut parent = Parent::spawn(local_cache(&tmp)).await;
    parent
        .send(json!({"ID": 1, "Command": "evict", "ActionID": id64('5')}))
        .await;
    let err = parent.shutdown().await.unwrap_err();
    assert!(matches!(err, gostash_proc::ProcError::Protocol { .. }));
}

#[tokio::test]
async fn eof_without_close_drains_cleanly() {
    let tmp = TempDir::new().unwrap();
    let parent = Parent::spawn(local_cache(&tmp)).await;
    parent.shutdown().await.unwrap();
}

fn hex(tag: u8) -> String {
    format!("{:02x}", tag).repeat(32)
}
