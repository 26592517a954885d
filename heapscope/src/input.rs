//! Trace input
//!
//! A run directory holds the zstd-compressed event stream (`memory.profile`)
//! and its metadata (`statinfo.txt`). The stream has no magic number or
//! length prefix; it is decompressed fully into memory and borrowed
//! read-only by the replay engine.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use log::info;

use crate::domain::TraceError;

/// Compressed trace stream file name inside a run directory.
pub const PROFILE_FILE: &str = "memory.profile";
/// Metadata file name inside a run directory.
pub const METADATA_FILE: &str = "statinfo.txt";

/// Load and decompress the trace from a run directory.
///
/// # Errors
/// Returns an error when `memory.profile` is missing or not valid zstd.
pub fn load_trace(input_dir: &Path) -> Result<Vec<u8>, TraceError> {
    let path = input_dir.join(PROFILE_FILE);
    if !path.exists() {
        return Err(TraceError::ProfileNotFound(path));
    }

    info!("Decompressing {}", path.display());
    let reader = BufReader::new(File::open(&path)?);
    let bytes = zstd::stream::decode_all(reader)
        .map_err(|error| TraceError::DecompressFailed { path, error })?;
    info!("Decompressed trace: {} bytes", bytes.len());
    Ok(bytes)
}
