//! Mutable replay state
//!
//! [`ReplayContext`] owns everything the decoder mutates while walking the
//! trace. It is plain data: all mutation happens in the decoder, and the
//! whole struct serialises into snapshots so a replay can be resumed later.
//! Restoring a context restores frame IDs, heap intervals, aggregates and
//! pairing state exactly as they were.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::fragments::FragmentMap;
use crate::frames::FrameTable;

/// Call-side arguments parked until the matching return record arrives.
///
/// Keyed by `(tid, op_code)` in [`ReplayContext::pending_calls`]: a thread
/// has at most one outstanding call per operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCall {
    pub arg1: u64,
    pub arg2: u64,
    pub invoked_at: i64,
    pub callstack_path: Vec<u32>,
}

/// Where and when an address was allocated, for alloc/free back-links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocMeta {
    pub allocated_at: i64,
    /// Index of the alloc event in the accumulated event list, so the
    /// matching free can back-patch its `free_at`.
    pub event_idx: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayContext {
    /// Interned stack frames, stable across save/restore.
    pub frames: FrameTable,

    /// String tables accumulated from name records, indexed by appearance
    /// order in the stream.
    pub file_names: Vec<String>,
    pub func_names: Vec<String>,

    pub pending_calls: HashMap<(u32, u8), PendingCall>,

    /// Live allocations: address -> size.
    pub active_allocs: HashMap<u64, u64>,
    pub alloc_meta: HashMap<u64, AllocMeta>,

    /// First program break seen; offsets in range strings are relative to it.
    pub brk_base: Option<u64>,
    pub current_brk: Option<u64>,
    pub brk_event_count: u64,

    /// Raw records examined so far. Diagnostic only: a record re-examined
    /// after a snapshot rewind counts again.
    pub records_seen: u64,

    pub heap: FragmentMap,
}

impl ReplayContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `addr` falls inside the brk-managed heap right now.
    #[must_use]
    pub fn in_brk_heap(&self, addr: u64) -> bool {
        match (self.brk_base, self.current_brk) {
            (Some(base), Some(brk)) => addr >= base && addr < brk,
            _ => false,
        }
    }

    /// File name for a wire-format table index, with a placeholder for
    /// indexes the stream never defined.
    #[must_use]
    pub fn file_name(&self, idx: u32) -> String {
        self.file_names
            .get(idx as usize)
            .cloned()
            .unwrap_or_else(|| format!("<unknown_file_{idx}>"))
    }

    /// Function name for a wire-format table index, same fallback rule.
    #[must_use]
    pub fn func_name(&self, idx: u32) -> String {
        self.func_names
            .get(idx as usize)
            .cloned()
            .unwrap_or_else(|| format!("<unknown_func_{idx}>"))
    }
}
