//! Focus regions
//!
//! A peak report can zoom in on the memory the most recent events touched:
//! each event range is widened by a context margin, overlapping regions are
//! merged, and both the compact layout and the event window are filtered
//! down to what overlaps them. Fragments overlapping a region are retained
//! whole, never clipped.

use log::{info, warn};
use serde::Serialize;

use super::parse_range;
use crate::trace_data::Event;

/// A contiguous run of layout fragments that survived region filtering.
///
/// `fragments` keeps the compact `(end_offset, status_code)` form;
/// `start_addr` anchors the run since filtering breaks the implicit
/// starts-at-zero chain of the flat layout.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FocusSegment {
    pub start_addr: u64,
    pub fragments: Vec<(u64, u8)>,
}

impl FocusSegment {
    /// Wrap an unfiltered flat layout as one segment from offset zero.
    #[must_use]
    pub fn whole(fragments: &[(u64, u8)]) -> Self {
        Self { start_addr: 0, fragments: fragments.to_vec() }
    }
}

/// Merge the ranges of the last `num_events` events, widened by
/// `context_size` bytes on each side, into sorted disjoint regions.
#[must_use]
pub fn calculate_focus_regions(
    recent_events: &[Event],
    num_events: usize,
    context_size: u64,
) -> Vec<(u64, u64)> {
    if recent_events.is_empty() || num_events == 0 {
        return Vec::new();
    }

    let tail = &recent_events[recent_events.len().saturating_sub(num_events)..];
    let mut regions: Vec<(u64, u64)> = tail
        .iter()
        .filter_map(|event| parse_range(&event.range))
        .map(|(start, end)| (start.saturating_sub(context_size), end.saturating_add(context_size)))
        .collect();

    if regions.is_empty() {
        warn!("No parseable ranges in the recent events; no focus regions");
        return Vec::new();
    }

    regions.sort_unstable_by_key(|&(start, _)| start);
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(regions.len());
    for (start, end) in regions {
        match merged.last_mut() {
            Some(last) if start < last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }

    info!("Focus regions: {merged:?}");
    merged
}

/// Project a flat compact layout onto the focus regions.
///
/// Walks the layout reconstructing each fragment's start from the previous
/// end, keeps fragments overlapping any region, and groups consecutive
/// survivors into [`FocusSegment`]s.
#[must_use]
pub fn filter_layout_by_regions(
    fragments: &[(u64, u8)],
    regions: &[(u64, u64)],
) -> Vec<FocusSegment> {
    let mut segments: Vec<FocusSegment> = Vec::new();
    let mut prev_end = 0u64;
    let mut last_kept_end: Option<u64> = None;

    for &(frag_end, status) in fragments {
        let frag_start = prev_end;
        let overlaps = regions
            .iter()
            .any(|&(region_start, region_end)| frag_start.max(region_start) < frag_end.min(region_end));

        if overlaps {
            if segments.is_empty() || last_kept_end != Some(frag_start) {
                segments.push(FocusSegment { start_addr: frag_start, fragments: Vec::new() });
            }
            if let Some(segment) = segments.last_mut() {
                segment.fragments.push((frag_end, status));
            }
            last_kept_end = Some(frag_end);
        }
        prev_end = frag_end;
    }

    info!("Layout reduced from {} fragments to {} segments", fragments.len(), segments.len());
    segments
}

/// Keep the events whose range overlaps any focus region.
///
/// With no regions (or no events) everything passes through untouched.
#[must_use]
pub fn filter_events_by_regions(events: &[Event], regions: &[(u64, u64)]) -> Vec<Event> {
    if regions.is_empty() || events.is_empty() {
        return events.to_vec();
    }

    events
        .iter()
        .filter(|event| {
            parse_range(&event.range).is_some_and(|(start, end)| {
                regions
                    .iter()
                    .any(|&(region_start, region_end)| start.max(region_start) < end.min(region_end))
            })
        })
        .cloned()
        .collect()
}
