//! S3 remote tier for the gostash build cache
//!
//! Implements the [`gostash_cache::RemoteCache`] contract over an S3
//! bucket: one object per action, content in the body, the action→output
//! indirection in object metadata.

mod config;
mod s3;

pub use config::{detect_target, S3Config, DEFAULT_CACHE_KEY, DEFAULT_PREFIX};
pub use s3::S3Remote;
