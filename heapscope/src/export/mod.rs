//! Report writers
//!
//! Serialises snapshots and analysis results into the JSON documents the
//! visualisers consume. Each writer opens its file, writes it fully and
//! releases the handle before returning. Output style (pretty vs compact) is
//! an explicit value, not process state.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::json;

use crate::analysis::{FlameNode, FocusSegment};
use crate::domain::ExportError;
use crate::fragments::LayoutSummary;
use crate::frames::FrameTable;
use crate::replay::SnapshotLabel;
use crate::trace_data::{Event, FragSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonStyle {
    Pretty,
    Compact,
}

/// Writes the JSON documents for one output directory.
pub struct ReportWriter {
    dir: PathBuf,
    style: JsonStyle,
}

impl ReportWriter {
    #[must_use]
    pub fn new(dir: &Path, style: JsonStyle) -> Self {
        Self { dir: dir.to_path_buf(), style }
    }

    fn write_doc<T: Serialize>(&self, file_name: &str, value: &T) -> Result<PathBuf, ExportError> {
        let path = self.dir.join(file_name);
        let mut writer = BufWriter::new(File::create(&path)?);
        match self.style {
            JsonStyle::Pretty => serde_json::to_writer_pretty(&mut writer, value)?,
            JsonStyle::Compact => serde_json::to_writer(&mut writer, value)?,
        }
        writer.flush()?;
        Ok(path)
    }

    /// Write an event array (`*_events.json`, `*_events_with_frag.json`).
    ///
    /// # Errors
    /// Returns an error when the file cannot be written or serialized.
    pub fn events(&self, file_name: &str, events: &[Event]) -> Result<PathBuf, ExportError> {
        self.write_doc(file_name, &events)
    }

    /// Write `fragmentation.json`, deduplicated by timestamp: the last
    /// sample for a timestamp wins, at its first position of occurrence.
    ///
    /// # Errors
    /// Returns an error when the file cannot be written or serialized.
    pub fn fragmentation(
        &self,
        file_name: &str,
        samples: &[FragSample],
    ) -> Result<PathBuf, ExportError> {
        let mut order: Vec<i64> = Vec::new();
        let mut latest: std::collections::HashMap<i64, FragSample> = std::collections::HashMap::new();
        for sample in samples {
            if latest.insert(sample.timestamp, *sample).is_none() {
                order.push(sample.timestamp);
            }
        }
        let unique: Vec<FragSample> = order.iter().map(|ts| latest[ts]).collect();
        self.write_doc(file_name, &unique)
    }

    /// Write `stack_frame_map.json`: frame ID -> `{file, func, line, col}`.
    ///
    /// # Errors
    /// Returns an error when the file cannot be written or serialized.
    pub fn frame_map(&self, file_name: &str, frames: &FrameTable) -> Result<PathBuf, ExportError> {
        let map: BTreeMap<u32, _> = frames.iter().collect();
        self.write_doc(file_name, &map)
    }

    /// Write `flame.json`.
    ///
    /// # Errors
    /// Returns an error when the file cannot be written or serialized.
    pub fn flame(&self, file_name: &str, graph: &FlameNode) -> Result<PathBuf, ExportError> {
        self.write_doc(file_name, graph)
    }

    /// Write a memory-fragment document:
    /// `{timestamp, summary, focus_regions, memory_segments}`.
    ///
    /// # Errors
    /// Returns an error when the file cannot be written or serialized.
    pub fn memory_fragments(
        &self,
        file_name: &str,
        timestamp: SnapshotLabel,
        summary: Option<LayoutSummary>,
        segments: &[FocusSegment],
        focus_regions: &[(u64, u64)],
    ) -> Result<PathBuf, ExportError> {
        let summary = match summary {
            Some(summary) => serde_json::to_value(summary)?,
            None => json!({}),
        };
        let doc = json!({
            "timestamp": timestamp.to_json(),
            "summary": summary,
            "focus_regions": focus_regions,
            "memory_segments": segments,
        });
        self.write_doc(file_name, &doc)
    }
}
