//! Error types for cache operations

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(gostash::cache::io),
        help("Check file permissions and free space under the cache directory")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "rename")
        operation: String,
    },

    /// Declared body size does not match the bytes actually consumed
    #[error("body size mismatch: declared {expected} bytes, consumed {actual}")]
    #[diagnostic(code(gostash::cache::size_mismatch))]
    SizeMismatch {
        /// Size declared by the caller
        expected: u64,
        /// Bytes actually read from the body
        actual: u64,
    },

    /// Serialization error
    #[error("serialization error: {message}")]
    #[diagnostic(code(gostash::cache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// Configuration or validation error
    #[error("cache configuration error: {message}")]
    #[diagnostic(code(gostash::cache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Remote tier failure
    #[error("remote cache error: {message}")]
    #[diagnostic(code(gostash::cache::remote))]
    Remote {
        /// Error message from the remote tier
        message: String,
    },
}

impl Error {
    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create a size mismatch error
    #[must_use]
    pub fn size_mismatch(expected: u64, actual: u64) -> Self {
        Self::SizeMismatch { expected, actual }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a remote tier error
    #[must_use]
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote {
            message: msg.into(),
        }
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;
