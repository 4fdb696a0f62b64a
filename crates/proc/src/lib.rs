//! Cache protocol engine for the toolchain's out-of-process build cache
//!
//! The parent launches this process and speaks newline-delimited JSON
//! over the child's stdin/stdout: `get` and `put` requests correlated by
//! integer ID, with put bodies delivered inline (base64) or through
//! temporary files, and hits answered with local disk paths. The engine
//! here is stream-generic so tests can drive it over in-memory pipes.

mod engine;
mod error;
mod wire;

pub use engine::CacheProc;
pub use error::{ProcError, Result};
pub use wire::{Command, Request, Response};
