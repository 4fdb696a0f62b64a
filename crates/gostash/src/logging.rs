//! Tracing setup for the cache process
//!
//! Everything goes to stderr: stdout belongs to the cache protocol and a
//! single stray log line there would corrupt the framing.

use miette::{miette, Result};
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Map the `-v` count onto a tracing level
#[must_use]
pub fn verbosity_level(verbose: u8) -> Level {
    match verbose {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialize the global subscriber. `RUST_LOG` wins over `-v` when set.
pub fn init(verbose: u8) -> Result<()> {
    let level = verbosity_level(verbose);
    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(format!(
            "gostash={level},gostash_cache={level},gostash_remote={level},gostash_proc={level}"
        ))
    })
    .map_err(|e| miette!("failed to build log filter: {e}"))?;

    let layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|e| miette!("failed to initialize tracing: {e}"))?;
    Ok(())
}
