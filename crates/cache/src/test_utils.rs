//! In-memory remote tier for tests
//!
//! Shared by the unit tests in this crate and the protocol end-to-end
//! tests: a hash-map blob store with injectable failures, an optional
//! upload delay, and an operation count the tests assert against.

use crate::tier::{RemoteCache, RemoteHit};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// A `RemoteCache` backed by a process-local map
#[derive(Debug, Default)]
pub struct MemoryRemote {
    objects: Mutex<HashMap<String, (String, Bytes)>>,
    gets: AtomicU64,
    puts: AtomicU64,
    fail_gets: AtomicBool,
    fail_puts: AtomicBool,
    put_delay: Mutex<Duration>,
}

impl MemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry, as if a previous process had uploaded it
    pub fn insert(&self, action_id: &str, output_id: &str, body: impl Into<Bytes>) {
        self.objects
            .lock()
            .unwrap()
            .insert(action_id.to_string(), (output_id.to_string(), body.into()));
    }

    pub fn contains(&self, action_id: &str) -> bool {
        self.objects.lock().unwrap().contains_key(action_id)
    }

    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Make every get fail, as a misbehaving store would
    pub fn set_fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::Relaxed);
    }

    /// Make every put fail
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::Relaxed);
    }

    /// Delay each put, to exercise queue backpressure and drain deadlines
    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl RemoteCache for MemoryRemote {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, action_id: &str) -> Result<Option<RemoteHit>> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if self.fail_gets.load(Ordering::Relaxed) {
            return Err(Error::remote("injected get failure"));
        }
        let entry = self.objects.lock().unwrap().get(action_id).cloned();
        Ok(entry.map(|(output_id, body)| RemoteHit {
            output_id,
            size: body.len() as u64,
            body: Box::new(std::io::Cursor::new(body)),
        }))
    }

    async fn put(&self, action_id: &str, output_id: &str, size: u64, body: Bytes) -> Result<()> {
        let delay = *self.put_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_puts.load(Ordering::Relaxed) {
            return Err(Error::remote("injected put failure"));
        }
        if body.len() as u64 != size {
            return Err(Error::size_mismatch(size, body.len() as u64));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(action_id.to_string(), (output_id.to_string(), body));
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
