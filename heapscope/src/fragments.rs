//! brk-heap fragment map
//!
//! Models the contiguous heap `[brk_base, current_brk)` as a sorted list of
//! non-overlapping half-open intervals, each either used or free. Updates
//! locate the affected slice by binary search, rewrite it (splitting residual
//! pieces at the edges), coalesce adjacent *free* intervals, and splice the
//! result back - O(log N) location plus O(k) splice for k overlapped
//! intervals.
//!
//! Running aggregates (`total_used`, `total_free`, counts, `largest_free`)
//! are maintained incrementally: every interval leaving the list is
//! subtracted, every interval entering is added. `largest_free` is kept
//! opportunistically; a full rescan happens only when the interval that held
//! the cached maximum was overwritten and no new free interval re-established
//! it.
//!
//! Invariants after every update:
//! - intervals are sorted by start and pairwise disjoint, with no gap inside
//!   `[brk_base, current_brk)` once a brk has occurred;
//! - no two adjacent intervals are both free;
//! - adjacent used intervals may touch (distinct allocations stay distinct).

use serde::{Deserialize, Serialize};

use crate::trace_data::FragSample;

/// Occupancy of one interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    Free,
    Used,
}

impl BlockStatus {
    /// Numeric code used by the compact layout documents: `1` used, `0` free.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Used => 1,
        }
    }
}

/// What an update does to its address range.
///
/// `Remove` excises the range entirely; it is only issued for brk shrink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Patch {
    Used,
    Free,
    Remove,
}

impl Patch {
    fn status(self) -> Option<BlockStatus> {
        match self {
            Self::Used => Some(BlockStatus::Used),
            Self::Free => Some(BlockStatus::Free),
            Self::Remove => None,
        }
    }
}

/// Half-open interval `[start, end)` with a single status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub start: u64,
    pub end: u64,
    pub status: BlockStatus,
}

impl Fragment {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Aggregate numbers attached to a compact layout document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutSummary {
    pub total_memory: u64,
    pub free_memory: u64,
    pub used_memory: u64,
    pub largest_free_fragment_size: u64,
    pub free_fragments_count: usize,
    pub used_fragments_count: usize,
}

/// Compact projection of the heap for visualisers: for each interval inside
/// the brk window, its end offset from `brk_base` and a status code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeapLayout {
    pub memory_fragments: Vec<(u64, u8)>,
    pub summary: Option<LayoutSummary>,
}

/// The fragment list plus its running aggregates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FragmentMap {
    fragments: Vec<Fragment>,
    total_used: u64,
    total_free: u64,
    largest_free: u64,
    free_count: usize,
    used_count: usize,
}

impl FragmentMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    #[must_use]
    pub fn total_used(&self) -> u64 {
        self.total_used
    }

    #[must_use]
    pub fn total_free(&self) -> u64 {
        self.total_free
    }

    #[must_use]
    pub fn largest_free(&self) -> u64 {
        self.largest_free
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    #[must_use]
    pub fn used_count(&self) -> usize {
        self.used_count
    }

    fn retire(&mut self, len: u64, status: BlockStatus) {
        match status {
            BlockStatus::Free => {
                self.total_free -= len;
                self.free_count -= 1;
            }
            BlockStatus::Used => {
                self.total_used -= len;
                self.used_count -= 1;
            }
        }
    }

    fn admit(&mut self, len: u64, status: BlockStatus) {
        match status {
            BlockStatus::Free => {
                self.total_free += len;
                self.free_count += 1;
            }
            BlockStatus::Used => {
                self.total_used += len;
                self.used_count += 1;
            }
        }
    }

    fn rescan_largest_free(&mut self) {
        self.largest_free = self
            .fragments
            .iter()
            .filter(|f| f.status == BlockStatus::Free)
            .map(Fragment::len)
            .max()
            .unwrap_or(0);
    }

    /// Apply `patch` to `[addr, addr+size)`.
    ///
    /// Overlapped intervals are rewritten; residual pieces at either edge
    /// keep their original status; free intervals coalesce with free
    /// neighbours. `size == 0` is a no-op.
    pub fn update(&mut self, addr: u64, size: u64, patch: Patch) {
        if size == 0 {
            return;
        }
        let addr_start = addr;
        let addr_end = addr + size;

        // Assume the cached largest-free block survives until proven gone.
        let mut needs_rescan = false;

        // First interval whose start is >= addr_start, widened left when the
        // previous interval spills past addr_start.
        let mut start_idx = self.fragments.partition_point(|f| f.start < addr_start);
        if start_idx > 0 && self.fragments[start_idx - 1].end > addr_start {
            start_idx -= 1;
        }
        let mut end_idx = self.fragments.partition_point(|f| f.start < addr_end);

        // Everything in [start_idx, end_idx) is rewritten: take its
        // contribution out of the aggregates up front.
        for i in start_idx..end_idx {
            let old = self.fragments[i];
            self.retire(old.len(), old.status);
            if old.status == BlockStatus::Free && old.len() == self.largest_free {
                needs_rescan = true;
            }
        }

        let mut pieces: Vec<Fragment> = Vec::with_capacity(3);

        // Left residual of the first affected interval.
        if start_idx < self.fragments.len() {
            let first = self.fragments[start_idx];
            if first.start < addr_start {
                pieces.push(Fragment { start: first.start, end: addr_start, status: first.status });
            }
        }

        if let Some(status) = patch.status() {
            pieces.push(Fragment { start: addr_start, end: addr_end, status });
        }

        // Right residual of the last affected interval.
        if end_idx > 0 {
            let last = self.fragments[end_idx - 1];
            if last.end > addr_end {
                pieces.push(Fragment { start: addr_end, end: last.end, status: last.status });
            }
        }

        let mut merged: Vec<Fragment> = Vec::with_capacity(pieces.len());
        if !pieces.is_empty() {
            // Coalesce with the untouched neighbour on the left. Its stats
            // come out here so the admission pass below counts the merged
            // block exactly once.
            if start_idx > 0 {
                let left = self.fragments[start_idx - 1];
                if left.end == pieces[0].start
                    && left.status == pieces[0].status
                    && pieces[0].status == BlockStatus::Free
                {
                    self.retire(left.len(), left.status);
                    pieces[0].start = left.start;
                    start_idx -= 1;
                }
            }

            // Coalesce the emitted pieces pairwise.
            let mut current = pieces[0];
            for &next in &pieces[1..] {
                if next.start == current.end
                    && next.status == current.status
                    && current.status == BlockStatus::Free
                {
                    current.end = next.end;
                } else {
                    merged.push(current);
                    current = next;
                }
            }
            merged.push(current);

            // Coalesce with the untouched neighbour on the right.
            if end_idx < self.fragments.len() {
                let right = self.fragments[end_idx];
                if let Some(last) = merged.last_mut() {
                    if last.end == right.start
                        && last.status == right.status
                        && right.status == BlockStatus::Free
                    {
                        self.retire(right.len(), right.status);
                        last.end = right.end;
                        end_idx += 1;
                    }
                }
            }
        }

        self.fragments.splice(start_idx..end_idx, merged.iter().copied());

        for frag in &merged {
            self.admit(frag.len(), frag.status);
            if frag.status == BlockStatus::Free && frag.len() > self.largest_free {
                self.largest_free = frag.len();
                // A bigger free block showed up; the cached maximum is valid
                // again without a rescan.
                needs_rescan = false;
            }
        }

        if needs_rescan {
            self.rescan_largest_free();
        }
    }

    /// Fragmentation and free-space ratios for the brk-managed heap.
    ///
    /// Both are `0.0` before the first brk or while the heap is empty.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn ratios(&self, timestamp: i64, brk_base: Option<u64>) -> FragSample {
        let total = self.total_used + self.total_free;
        if brk_base.is_none() || total == 0 {
            return FragSample { timestamp, fragmentation_ratio: 0.0, free_ratio: 0.0 };
        }

        let free_ratio = round4(self.total_free as f64 / total as f64);
        let fragmentation_ratio = if self.total_free > 0 {
            round4(1.0 - self.largest_free as f64 / self.total_free as f64)
        } else {
            0.0
        };
        FragSample { timestamp, fragmentation_ratio, free_ratio }
    }

    /// Compact layout of the intervals whose start lies inside
    /// `[brk_base, current_brk)`, with end offsets relative to the base.
    ///
    /// Counts in the summary are restricted to that window; byte totals are
    /// the map-wide aggregates.
    #[must_use]
    pub fn layout(&self, brk_base: Option<u64>, current_brk: Option<u64>) -> HeapLayout {
        let (Some(base), Some(brk)) = (brk_base, current_brk) else {
            return HeapLayout::default();
        };

        let in_window =
            |f: &&Fragment| f.start >= base && f.start < brk;

        let mut free_fragments_count = 0;
        let mut used_fragments_count = 0;
        for frag in self.fragments.iter().filter(in_window) {
            match frag.status {
                BlockStatus::Free => free_fragments_count += 1,
                BlockStatus::Used => used_fragments_count += 1,
            }
        }

        let memory_fragments = self
            .fragments
            .iter()
            .filter(in_window)
            .map(|f| (f.end - base, f.status.code()))
            .collect();

        HeapLayout {
            memory_fragments,
            summary: Some(LayoutSummary {
                total_memory: self.total_used + self.total_free,
                free_memory: self.total_free,
                used_memory: self.total_used,
                largest_free_fragment_size: self.largest_free,
                free_fragments_count,
                used_fragments_count,
            }),
        }
    }
}

pub(crate) fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}
