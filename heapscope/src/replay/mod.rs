//! Trace replay engine
//!
//! Replays a recorded heap trace strictly forward, reconstructing the brk
//! heap as it evolves and pausing at requested logical timestamps:
//!
//! - [`context`] - the mutable replay state (frame table, fragment map,
//!   pending call/return pairs, live allocations, brk pointers)
//! - [`decoder`] - [`TraceReplay`], the pull-driven iterator that decodes
//!   records and yields [`Snapshot`]s
//! - [`snapshot`] - the immutable, restorable snapshot value
//! - [`cache`] - snapshot persistence for incremental re-runs

pub mod cache;
pub mod context;
pub mod decoder;
pub mod snapshot;

pub use context::ReplayContext;
pub use decoder::{ProgressTotals, TraceReplay};
pub use snapshot::{Snapshot, SnapshotLabel};

/// Options consumed by the replay engine itself.
///
/// Passed in explicitly at construction; the engine reads no global state.
#[derive(Debug, Clone, Copy)]
pub struct ReplayConfig {
    /// Truncate every call-stack path to this many frames when >= 0.
    pub callstack_depth: i32,
    /// Drop C++ operator new/delete events entirely.
    pub skip_cpp: bool,
    /// Emit a progress log line every this many raw records (0 disables).
    pub log_interval: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self { callstack_depth: -1, skip_cpp: false, log_interval: 2_000 }
    }
}
