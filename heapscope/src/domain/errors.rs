//! Structured error types for heapscope
//!
//! Using thiserror for automatic Display implementation and error chaining.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Trace profile not found: {}", .0.display())]
    ProfileNotFound(PathBuf),

    #[error("Failed to decompress trace {}: {error}", .path.display())]
    DecompressFailed { path: PathBuf, error: std::io::Error },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to encode snapshot cache: {0}")]
    Encode(#[source] bincode::Error),

    #[error("Failed to decode snapshot cache: {0}")]
    Decode(#[source] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to serialize report: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
