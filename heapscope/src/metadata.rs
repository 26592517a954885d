//! Run metadata (`statinfo.txt`)
//!
//! The recorder drops a small `key: value` text file next to the trace.
//! Only three keys matter to the analyzer: `bench` (diagnostic label),
//! `total_traceinfo_count` (raw record total, progress display) and
//! `time_end` (run duration in nanoseconds, drives interval-based snapshot
//! targets). A missing or partial file is not an error.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct RunMetadata {
    entries: HashMap<String, String>,
}

impl RunMetadata {
    /// Parse `statinfo.txt`; a missing file yields empty metadata.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                warn!("Metadata file {} not readable: {e}", path.display());
                return Self::default();
            }
        };

        let entries = text
            .lines()
            .filter_map(|line| {
                let (key, value) = line.split_once(':')?;
                Some((key.trim().to_string(), value.trim().to_string()))
            })
            .collect();
        Self { entries }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn bench(&self) -> Option<&str> {
        self.get("bench")
    }

    /// Total raw records the recorder claims to have written.
    #[must_use]
    pub fn total_record_count(&self) -> Option<u64> {
        self.parsed("total_traceinfo_count")
    }

    /// Total run duration in nanoseconds.
    #[must_use]
    pub fn time_end(&self) -> Option<i64> {
        self.parsed("time_end")
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Metadata key '{key}' has a non-numeric value: '{raw}'");
                None
            }
        }
    }

    /// Log the recognised keys, the way runs announce themselves.
    pub fn announce(&self) {
        if self.entries.is_empty() {
            return;
        }
        info!("--- metadata from statinfo.txt ---");
        for key in ["bench", "total_traceinfo_count", "time_end"] {
            if let Some(value) = self.get(key) {
                info!("  {key}: {value}");
            }
        }
    }
}
