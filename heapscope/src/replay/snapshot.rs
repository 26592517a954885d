//! Immutable replay snapshots
//!
//! A [`Snapshot`] is a self-contained value: deep copies of the accumulated
//! event/sample lists, the compact heap layout, the full replay context and
//! the byte offset at which decoding resumes. Once yielded it never aliases
//! the live replay, and [`TraceReplay::resume`](super::TraceReplay::resume)
//! can rebuild an equivalent replay from it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::fragments::HeapLayout;
use crate::replay::context::ReplayContext;
use crate::trace_data::{Event, FragSample};

/// Logical position of a snapshot: a requested target timestamp, or the
/// end-of-trace sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotLabel {
    At(i64),
    Final,
}

impl SnapshotLabel {
    #[must_use]
    pub fn timestamp(self) -> Option<i64> {
        match self {
            Self::At(ts) => Some(ts),
            Self::Final => None,
        }
    }

    /// The form the JSON documents carry: the integer, or `"final"`.
    #[must_use]
    pub fn to_json(self) -> serde_json::Value {
        match self {
            Self::At(ts) => json!(ts),
            Self::Final => json!("final"),
        }
    }
}

impl fmt::Display for SnapshotLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::At(ts) => write!(f, "{ts}"),
            Self::Final => f.write_str("final"),
        }
    }
}

/// Replay state frozen at a snapshot point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub label: SnapshotLabel,

    /// Every event decoded so far, in emission order.
    pub events: Vec<Event>,
    /// One sample per heap-changing event.
    pub fragmentation: Vec<FragSample>,
    /// The brk subset of `events`.
    pub brk_events: Vec<Event>,

    /// Compact layout of the brk window at this point.
    pub layout: HeapLayout,

    /// Deep copy of the replay state; restoring it resumes the replay.
    pub context: ReplayContext,

    /// Byte offset of the next undecoded record.
    pub next_idx: usize,
}
