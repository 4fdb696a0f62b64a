//! gostash: an out-of-process build cache for the Go toolchain
//!
//! cmd/go launches this binary via `GOCACHEPROG` and speaks JSON over
//! its stdin/stdout. Lookups are answered with local disk paths; misses
//! fall through to S3 and populate the disk tier; stores write through
//! locally and upload asynchronously.

mod cli;
mod logging;

use crate::cli::Cli;
use clap::Parser;
use gostash_cache::{metrics, Cache, CombinedCache, DiskCache, EnqueueMode, QueueOptions};
use gostash_proc::CacheProc;
use gostash_remote::{S3Config, S3Remote};
use miette::{IntoDiagnostic, Result, WrapErr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{error, info};

/// How long shutdown waits for queued remote uploads before abandoning
/// them
const DRAIN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(report) = logging::init(cli.verbose) {
        eprintln!("{report:?}");
        std::process::exit(1);
    }
    if let Err(report) = run(cli).await {
        error!("{report:?}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let cache_dir = cli.cache_dir();
    ensure_cache_dir(&cache_dir)?;
    info!(dir = %cache_dir.display(), "local cache tier ready");

    let disk = DiskCache::new(&cache_dir);
    let remote = build_remote(&cli).await?;
    let opts = QueueOptions {
        queue_len: cli.queue_len,
        workers: cli.workers.max(1),
        mode: EnqueueMode::Blocking,
        drain_grace: DRAIN_GRACE,
    };
    let cache = Arc::new(CombinedCache::new(disk, Arc::new(remote), &opts));

    let engine = CacheProc::new(Arc::clone(&cache));
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    engine.run(stdin, stdout).await?;

    // The protocol loop is done; draining the upload queue is the last
    // thing that may take real time.
    cache.close().await?;

    report_metrics(&cli, &cache)?;
    Ok(())
}

/// Create the disk tier root with mode 0755 if it does not exist yet.
fn ensure_cache_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to create cache directory {}", path.display()))?;
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to create cache directory {}", path.display()))?;
    }
    Ok(())
}

/// Load AWS configuration and wrap the bucket in the remote tier.
///
/// Credential selection, in order: static keys from `GOCACHE_AWS_*`
/// variables, then the named profile, then the SDK's default chain. SDK
/// retries are disabled; the put path must never resend a partially
/// consumed body.
async fn build_remote(cli: &Cli) -> Result<S3Remote> {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .retry_config(aws_config::retry::RetryConfig::disabled());

    if let Some(region) = &cli.aws_region {
        loader = loader.region(aws_config::Region::new(region.clone()));
    }
    let access_key = std::env::var("GOCACHE_AWS_ACCESS_KEY").unwrap_or_default();
    let secret_key = std::env::var("GOCACHE_AWS_SECRET_ACCESS_KEY").unwrap_or_default();
    if !access_key.is_empty() && !secret_key.is_empty() {
        let session_token = std::env::var("GOCACHE_AWS_SESSION_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());
        loader = loader.credentials_provider(aws_credential_types::Credentials::new(
            access_key,
            secret_key,
            session_token,
            None,
            "gostash-env",
        ));
    } else if let Some(profile) = &cli.aws_profile {
        loader = loader.profile_name(profile);
    }

    let sdk_config = loader.load().await;
    let client = aws_sdk_s3::Client::new(&sdk_config);

    let mut config = S3Config::new(cli.bucket.clone());
    config.prefix = cli.s3_prefix.clone();
    config.cache_key = cli.cache_key.clone();
    Ok(S3Remote::new(client, config))
}

/// Print per-tier summaries and write the CSV dump, if requested. Runs
/// after the upload queue has drained so the numbers are final.
fn report_metrics(cli: &Cli, cache: &CombinedCache) -> Result<()> {
    let disk = cache.disk_counters();
    let remote = cache.remote_counters();

    if cli.verbose >= 2 {
        eprintln!("{}", disk.summary());
        if let Some(remote) = &remote {
            eprintln!("{}", remote.summary());
        }
    }

    if let Some(path) = &cli.metrics_csv {
        let mut file = std::fs::File::create(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to create metrics file {}", path.display()))?;
        let mut tiers = vec![disk.as_ref()];
        if let Some(remote) = &remote {
            tiers.push(remote.as_ref());
        }
        metrics::write_csv(&mut file, &tiers)
            .into_diagnostic()
            .wrap_err("failed to write metrics CSV")?;
        info!(path = %path.display(), "metrics written");
    }
    Ok(())
}
