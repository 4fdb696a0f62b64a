//! Command-line surface
//!
//! Every option can also come from the environment under the `GOCACHE_`
//! prefix, which is how the toolchain's `GOCACHEPROG` line usually
//! configures this process. Static AWS credentials are env-only on
//! purpose: secrets do not belong in argv.

use clap::Parser;
use gostash_remote::{DEFAULT_CACHE_KEY, DEFAULT_PREFIX};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "gostash")]
#[command(about = "Out-of-process Go build cache backed by local disk and S3")]
#[command(version)]
pub struct Cli {
    /// S3 bucket holding the remote cache
    #[arg(value_name = "BUCKET", env = "GOCACHE_S3_BUCKET")]
    pub bucket: String,

    /// Logging verbosity: 0=error, 1=warn, 2=info, 3=debug, 4=trace
    #[arg(short = 'v', long = "verbose", env = "GOCACHE_VERBOSE", default_value_t = 0)]
    pub verbose: u8,

    /// Root directory of the local disk tier
    #[arg(long = "local-cache-dir", env = "GOCACHE_DISK_DIR", value_name = "PATH")]
    pub local_cache_dir: Option<PathBuf>,

    /// Key prefix under the bucket
    #[arg(long = "s3-prefix", env = "GOCACHE_S3_PREFIX", default_value = DEFAULT_PREFIX)]
    pub s3_prefix: String,

    /// Cache generation key; bump to start from an empty remote cache
    #[arg(long = "cache-key", env = "GOCACHE_CACHE_KEY", default_value = DEFAULT_CACHE_KEY)]
    pub cache_key: String,

    /// Async remote put queue depth (0 = upload synchronously)
    #[arg(long = "queue-len", env = "GOCACHE_QUEUE_LEN", default_value_t = 0)]
    pub queue_len: usize,

    /// Async remote put worker count
    #[arg(long = "workers", env = "GOCACHE_WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Write per-tier metrics to this CSV file on exit
    #[arg(long = "metrics-csv", env = "GOCACHE_METRICS_CSV", value_name = "PATH")]
    pub metrics_csv: Option<PathBuf>,

    /// AWS region override
    #[arg(long = "aws-region", env = "GOCACHE_AWS_REGION")]
    pub aws_region: Option<String>,

    /// AWS shared-config profile to load credentials from
    #[arg(long = "aws-profile", env = "GOCACHE_AWS_CREDS_PROFILE")]
    pub aws_profile: Option<String>,
}

impl Cli {
    /// Where the disk tier lives: the flag, or the OS cache directory.
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.local_cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("gostash")
        })
    }
}
