//! Protocol engine errors

use miette::Diagnostic;
use thiserror::Error;

/// Fatal engine failures. Per-request cache failures never show up here;
/// they travel back to the parent inside `Err` responses.
#[derive(Error, Debug, Diagnostic)]
pub enum ProcError {
    /// The parent sent something the protocol does not allow
    #[error("protocol error: {message}")]
    #[diagnostic(
        code(gostash::proc::protocol),
        help("The parent toolchain and this cache program disagree on the wire protocol")
    )]
    Protocol {
        /// What was malformed or missing
        message: String,
    },

    /// The conversation streams themselves failed
    #[error("I/O {operation} failed")]
    #[diagnostic(code(gostash::proc::io))]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Operation that failed (e.g., "read request", "write response")
        operation: String,
    },
}

impl ProcError {
    /// Create a protocol error
    #[must_use]
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol {
            message: msg.into(),
        }
    }

    /// Create an I/O error
    #[must_use]
    pub fn io(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            operation: operation.into(),
        }
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, ProcError>;
