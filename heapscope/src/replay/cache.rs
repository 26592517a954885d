//! Snapshot cache persistence
//!
//! Snapshots serialise to `cache_<timestamp>.bin` (or `cache_final.bin`) in
//! the output directory so later runs can resume instead of re-parsing from
//! byte zero. A cache file that is missing, corrupt or unreadable degrades
//! with a warning to "no cache": the caller falls back to an older cache or
//! a full replay. Writes go through a scoped handle that is flushed and
//! released before the call returns.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::domain::CacheError;
use crate::replay::snapshot::{Snapshot, SnapshotLabel};

const CACHE_PREFIX: &str = "cache_";
const CACHE_SUFFIX: &str = ".bin";

/// File name for a snapshot label: `cache_1500.bin`, `cache_final.bin`.
#[must_use]
pub fn file_name(label: SnapshotLabel) -> String {
    format!("{CACHE_PREFIX}{label}{CACHE_SUFFIX}")
}

/// Persist `snapshot` under `dir`, creating the directory if needed.
///
/// # Errors
/// Returns an error when the directory or file cannot be written, or the
/// snapshot fails to encode.
pub fn save(snapshot: &Snapshot, dir: &Path) -> Result<PathBuf, CacheError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(file_name(snapshot.label));
    let mut writer = BufWriter::new(File::create(&path)?);
    bincode::serialize_into(&mut writer, snapshot).map_err(CacheError::Encode)?;
    info!("Snapshot cached: {}", path.display());
    Ok(path)
}

/// Load one cache file.
///
/// # Errors
/// Returns an error when the file cannot be read or decoded.
pub fn load(path: &Path) -> Result<Snapshot, CacheError> {
    let reader = BufReader::new(File::open(path)?);
    bincode::deserialize_from(reader).map_err(CacheError::Decode)
}

/// Labels of every cache file in `dir`, unordered. Unparseable names are
/// skipped.
fn scan(dir: &Path) -> Vec<(SnapshotLabel, PathBuf)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            let stamp = name.strip_prefix(CACHE_PREFIX)?.strip_suffix(CACHE_SUFFIX)?;
            let label = if stamp == "final" {
                SnapshotLabel::Final
            } else {
                SnapshotLabel::At(stamp.parse().ok()?)
            };
            Some((label, entry.path()))
        })
        .collect()
}

/// Load the newest cache in `dir`; `final` outranks every timestamp.
///
/// Returns `None` when there is no cache or the newest one fails to load.
#[must_use]
pub fn load_latest(dir: &Path) -> Option<(Snapshot, SnapshotLabel)> {
    let newest = scan(dir)
        .into_iter()
        .max_by_key(|(label, _)| label.timestamp().map_or((1, 0), |ts| (0, ts)))?;
    load_checked(newest)
}

/// Load the newest cache strictly before `limit`, ignoring `final`.
#[must_use]
pub fn load_latest_before(dir: &Path, limit: i64) -> Option<(Snapshot, SnapshotLabel)> {
    let newest = scan(dir)
        .into_iter()
        .filter_map(|(label, path)| Some((label.timestamp()?, path)))
        .filter(|&(ts, _)| ts < limit)
        .max_by_key(|&(ts, _)| ts)
        .map(|(ts, path)| (SnapshotLabel::At(ts), path))?;
    load_checked(newest)
}

fn load_checked((label, path): (SnapshotLabel, PathBuf)) -> Option<(Snapshot, SnapshotLabel)> {
    info!("Loading cached snapshot: {} ({label})", path.display());
    match load(&path) {
        Ok(snapshot) => Some((snapshot, label)),
        Err(e) => {
            warn!("Failed to load cache {}: {e}; ignoring it", path.display());
            None
        }
    }
}

/// Delete every cache file in `dir`. Returns how many were removed.
pub fn clear(dir: &Path) -> usize {
    let mut removed = 0;
    for (_, path) in scan(dir) {
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Could not remove cache file {}: {e}", path.display()),
        }
    }
    removed
}
