//! Tiered build-output caching for the toolchain cache protocol
//!
//! This crate provides the storage side of the cache child process:
//! - A content-addressed disk tier with atomic-rename writes
//! - A read-through / write-through combination of the disk tier over a
//!   pluggable remote blob store
//! - A bounded async upload pipeline that keeps remote puts off the
//!   request path
//! - Per-tier counters and streaming transfer-speed averages
//!
//! The protocol engine only ever sees the [`Cache`] capability trait;
//! remote stores plug in behind [`RemoteCache`].

mod combined;
mod disk;
mod error;
pub mod metrics;
mod queue;
pub mod test_utils;
mod tier;

pub use combined::CombinedCache;
pub use disk::{ActionRecord, DiskCache};
pub use error::{Error, Result};
pub use metrics::Counters;
pub use queue::{EnqueueMode, PutJob, PutQueue, QueueOptions};
pub use tier::{Body, Cache, Hit, RemoteCache, RemoteHit};
