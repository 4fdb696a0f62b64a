//! Per-tier transfer counters and streaming speed averages
//!
//! Every cache tier owns one [`Counters`] instance. Counter updates are
//! atomic; the running speed means are guarded by a per-direction mutex so
//! mean and sample count always move together.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Running mean of transfer speed samples, in bytes per second.
///
/// Updated incrementally: `new_mean = (mean * n + sample) / (n + 1)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpeedStat {
    mean: f64,
    count: u64,
}

impl SpeedStat {
    fn record(&mut self, sample: f64) {
        self.mean = (self.mean * self.count as f64 + sample) / (self.count as f64 + 1.0);
        self.count += 1;
    }

    /// Mean speed in bytes per second, 0.0 before the first sample
    #[must_use]
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Number of samples recorded
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Compute a speed sample in bytes per second.
///
/// Returns `None` for zero-byte transfers or zero elapsed time; such
/// transfers carry no speed information and must not skew the mean.
#[must_use]
pub fn speed_sample(bytes: u64, elapsed: Duration) -> Option<f64> {
    if bytes == 0 {
        return None;
    }
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return None;
    }
    Some(bytes as f64 / secs)
}

/// Operation tallies and transfer statistics for a single cache tier
#[derive(Debug)]
pub struct Counters {
    label: &'static str,
    gets: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    puts: AtomicU64,
    put_errors: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    download: Mutex<SpeedStat>,
    upload: Mutex<SpeedStat>,
}

/// Point-in-time copy of a tier's counters, for reporting and tests
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub label: &'static str,
    pub gets: u64,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub puts: u64,
    pub put_errors: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub download: SpeedStat,
    pub upload: SpeedStat,
}

impl Counters {
    /// Create counters for the tier named `label` ("disk", "s3", ...)
    #[must_use]
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            gets: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            put_errors: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            download: Mutex::new(SpeedStat::default()),
            upload: Mutex::new(SpeedStat::default()),
        }
    }

    /// Tier name this instance counts for
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn record_get_hit(&self, bytes: u64) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_get_miss(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get_error(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put(&self, bytes: u64) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_put_error(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.put_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n` abandoned puts at once (shutdown deadline expired)
    pub fn record_abandoned_puts(&self, n: u64) {
        self.puts.fetch_add(n, Ordering::Relaxed);
        self.put_errors.fetch_add(n, Ordering::Relaxed);
    }

    /// Record a download speed sample, if the transfer produced one
    pub fn record_download(&self, bytes: u64, elapsed: Duration) {
        if let Some(sample) = speed_sample(bytes, elapsed) {
            self.download
                .lock()
                .expect("download stats mutex poisoned")
                .record(sample);
        }
    }

    /// Record an upload speed sample, if the transfer produced one
    pub fn record_upload(&self, bytes: u64, elapsed: Duration) {
        if let Some(sample) = speed_sample(bytes, elapsed) {
            self.upload
                .lock()
                .expect("upload stats mutex poisoned")
                .record(sample);
        }
    }

    /// Copy out all counters for reporting
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            label: self.label,
            gets: self.gets.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            put_errors: self.put_errors.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            download: *self.download.lock().expect("download stats mutex poisoned"),
            upload: *self.upload.lock().expect("upload stats mutex poisoned"),
        }
    }

    /// Render a human-readable multi-line summary block
    #[must_use]
    pub fn summary(&self) -> String {
        let s = self.snapshot();
        format!(
            "{} tier:\n  gets: {} (hits {}, misses {}, errors {})\n  puts: {} (errors {})\n  bytes: {} read, {} written\n  avg download: {:.1} KB/s ({} samples)\n  avg upload: {:.1} KB/s ({} samples)",
            s.label,
            s.gets,
            s.hits,
            s.misses,
            s.errors,
            s.puts,
            s.put_errors,
            s.bytes_read,
            s.bytes_written,
            s.download.mean() / 1024.0,
            s.download.count(),
            s.upload.mean() / 1024.0,
            s.upload.count(),
        )
    }
}

/// CSV column order used by [`write_csv`]
const CSV_HEADER: &str =
    "tier,gets,hits,misses,errors,puts,put_errors,bytes_read,bytes_written,avg_download_bps,avg_upload_bps";

/// Write a header row plus one row per tier to `w`.
pub fn write_csv<W: Write>(w: &mut W, tiers: &[&Counters]) -> std::io::Result<()> {
    writeln!(w, "{CSV_HEADER}")?;
    for tier in tiers {
        let s = tier.snapshot();
        writeln!(
            w,
            "{},{},{},{},{},{},{},{},{},{:.2},{:.2}",
            s.label,
            s.gets,
            s.hits,
            s.misses,
            s.errors,
            s.puts,
            s.put_errors,
            s.bytes_read,
            s.bytes_written,
            s.download.mean(),
            s.upload.mean(),
        )?;
    }
    Ok(())
}
