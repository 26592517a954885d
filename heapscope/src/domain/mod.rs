//! Domain model for heapscope
//!
//! Structured error types shared across the analyzer. Replay itself never
//! fails hard - malformed input degrades to a partial result plus a warning -
//! so errors here all come from the I/O boundaries: loading traces, the
//! snapshot cache, and report writing.

pub mod errors;

pub use errors::{CacheError, ExportError, TraceError};
