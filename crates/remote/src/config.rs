//! Remote key-space configuration
//!
//! Entries are scoped by toolchain target so cross-compiled builds never
//! collide: `<prefix>/<cacheKey>/<goarch>/<goos>/<ActionID>`.

/// Configuration for the S3 key space and upload policy
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Bucket holding the cache
    pub bucket: String,
    /// Key prefix under the bucket
    pub prefix: String,
    /// Cache generation key; bump it to start from a clean slate
    pub cache_key: String,
    /// Target architecture component of the key space (Go naming)
    pub goarch: String,
    /// Target OS component of the key space (Go naming)
    pub goos: String,
    /// Elide uploads of empty bodies; the next cold lookup recomputes
    /// them more cheaply than a round trip stores them
    pub skip_zero_byte_puts: bool,
}

pub const DEFAULT_PREFIX: &str = "cache";
pub const DEFAULT_CACHE_KEY: &str = "v1";

impl S3Config {
    /// Configuration for `bucket` with default prefix, cache key, and the
    /// running process's target.
    #[must_use]
    pub fn new(bucket: impl Into<String>) -> Self {
        let (goarch, goos) = detect_target();
        Self {
            bucket: bucket.into(),
            prefix: DEFAULT_PREFIX.to_string(),
            cache_key: DEFAULT_CACHE_KEY.to_string(),
            goarch,
            goos,
            skip_zero_byte_puts: true,
        }
    }

    /// Composed key prefix, without a trailing slash
    #[must_use]
    pub fn key_prefix(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.prefix, self.cache_key, self.goarch, self.goos
        )
    }

    /// Object key for an action
    #[must_use]
    pub fn object_key(&self, action_id: &str) -> String {
        format!("{}/{action_id}", self.key_prefix())
    }

    /// Whether the zero-byte policy elides a put of `size` bytes
    #[must_use]
    pub fn should_skip_put(&self, size: u64) -> bool {
        size == 0 && self.skip_zero_byte_puts
    }
}

/// Resolve the target triple components, preferring the toolchain's own
/// `GOARCH`/`GOOS` variables so cross-compile builds key correctly.
#[must_use]
pub fn detect_target() -> (String, String) {
    let arch = std::env::var("GOARCH")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| go_arch(std::env::consts::ARCH).to_string());
    let os = std::env::var("GOOS")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| go_os(std::env::consts::OS).to_string());
    (arch, os)
}

/// Map a Rust architecture name to Go's
fn go_arch(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64",
        "loongarch64" => "loong64",
        other => other,
    }
}

/// Map a Rust OS name to Go's
fn go_os(os: &str) -> &str {
    match os {
        "macos" => "darwin",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_composition() {
        let mut cfg = S3Config::new("bucket");
        cfg.goarch = "amd64".to_string();
        cfg.goos = "linux".to_string();
        let id = "c".repeat(64);
        assert_eq!(cfg.object_key(&id), format!("cache/v1/amd64/linux/{id}"));
    }

    #[test]
    fn custom_prefix_and_cache_key() {
        let mut cfg = S3Config::new("bucket");
        cfg.prefix = "team-cache".to_string();
        cfg.cache_key = "v2".to_string();
        cfg.goarch = "arm64".to_string();
        cfg.goos = "darwin".to_string();
        assert_eq!(cfg.key_prefix(), "team-cache/v2/arm64/darwin");
    }

    #[test]
    fn go_target_mapping() {
        assert_eq!(go_arch("x86_64"), "amd64");
        assert_eq!(go_arch("aarch64"), "arm64");
        assert_eq!(go_arch("riscv64"), "riscv64");
        assert_eq!(go_os("macos"), "darwin");
        assert_eq!(go_os("linux"), "linux");
    }

    #[test]
    fn zero_byte_put_policy() {
        let mut cfg = S3Config::new("bucket");
        assert!(cfg.should_skip_put(0));
        assert!(!cfg.should_skip_put(1));
        cfg.skip_zero_byte_puts = false;
        assert!(!cfg.should_skip_put(0));
    }
}
