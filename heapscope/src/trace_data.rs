//! Trace data model
//!
//! This module contains the record types the replay engine accumulates:
//!
//! - [`Event`] - One memory operation (alloc/free/brk) with its call stack
//! - [`FragSample`] - Fragmentation/free ratios sampled after a heap change
//!
//! # Range strings
//!
//! `Event::range` is `"start-end"`. Addresses at or above the brk base are
//! written as decimal offsets from it; everything else is absolute
//! hexadecimal (`0x…`). The analysis side parses both (see
//! [`crate::analysis::parse_range`]).

use serde::{Deserialize, Serialize};

/// The heap effect an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Alloc,
    Free,
    Brk,
}

/// A single memory operation reconstructed from the trace.
///
/// Optional fields stay out of the JSON output until they are known:
/// back-links are filled when an alloc/free pair is matched, the analysis
/// ratios when fragmentation samples are joined in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Nanosecond timestamp from the trace header.
    pub time: i64,

    pub operation: Operation,

    /// `"start-end"`, decimal brk offsets or absolute hex (see module docs).
    pub range: String,

    /// Byte count; negative only for brk shrink events.
    pub size: i64,

    /// Interned frame IDs, innermost first. May be empty or truncated.
    pub callstack_path: Vec<u32>,

    /// For a free event: timestamp of the allocation it releases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alloc_at: Option<i64>,

    /// For an alloc event: timestamp of the free that released it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragmentation_ratio: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_ratio: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact_score: Option<f64>,
}

impl Event {
    /// Build an alloc/free event for `[addr, addr+size)`.
    ///
    /// The range is written as decimal offsets when `brk_base` is known and
    /// the address is at or above it, absolute hex otherwise.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn at_address(
        operation: Operation,
        time: i64,
        addr: u64,
        size: u64,
        callstack_path: Vec<u32>,
        brk_base: Option<u64>,
    ) -> Self {
        let range = match brk_base {
            Some(base) if addr >= base => {
                let start = addr - base;
                format!("{}-{}", start, start + size)
            }
            _ => format!("{:#x}-{:#x}", addr, addr + size),
        };
        Self {
            time,
            operation,
            range,
            size: size as i64,
            callstack_path,
            alloc_at: None,
            free_at: None,
            fragmentation_ratio: None,
            free_ratio: None,
            impact_score: None,
        }
    }
}

/// Heap occupancy ratios captured right after a heap-changing event.
///
/// Both ratios are rounded to four decimals and lie in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FragSample {
    pub timestamp: i64,
    pub fragmentation_ratio: f64,
    pub free_ratio: f64,
}
