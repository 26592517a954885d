//! Analysis logic for replayed traces
//!
//! Pure functions over the accumulated events and fragmentation samples,
//! separated from replay and from report writing: timestamp joins, peak
//! detection, focus regions and flame graphs.

pub mod flame;
pub mod focus;
pub mod peaks;

pub use flame::{build_flame_graph, FlameNode};
pub use focus::{
    calculate_focus_regions, filter_events_by_regions, filter_layout_by_regions, FocusSegment,
};
pub use peaks::find_peaks;

use std::collections::HashMap;

use log::warn;

use crate::fragments::round4;
use crate::trace_data::{Event, FragSample};

/// How much a moment hurts: high fragmentation of a mostly-used heap.
#[must_use]
pub fn impact_score(fragmentation_ratio: f64, free_ratio: f64) -> f64 {
    fragmentation_ratio * (1.0 - free_ratio)
}

/// Join fragmentation samples onto events by timestamp.
///
/// Events whose timestamp has a sample get the two ratios plus a 4-decimal
/// impact score; the rest keep their fields absent. When several samples
/// share a timestamp the last one wins.
#[must_use]
pub fn merge_fragmentation_into_events(events: &[Event], samples: &[FragSample]) -> Vec<Event> {
    let mut by_time: HashMap<i64, FragSample> = HashMap::with_capacity(samples.len());
    for sample in samples {
        by_time.insert(sample.timestamp, *sample);
    }

    events
        .iter()
        .map(|event| {
            let mut event = event.clone();
            if let Some(sample) = by_time.get(&event.time) {
                event.fragmentation_ratio = Some(sample.fragmentation_ratio);
                event.free_ratio = Some(sample.free_ratio);
                event.impact_score =
                    Some(round4(impact_score(sample.fragmentation_ratio, sample.free_ratio)));
            }
            event
        })
        .collect()
}

/// Parse a `"start-end"` range string, decimal or `0x…` hex per side.
#[must_use]
pub fn parse_range(range: &str) -> Option<(u64, u64)> {
    let (start_str, end_str) = range.split_once('-')?;
    let parse = |s: &str| {
        s.strip_prefix("0x").map_or_else(|| s.parse().ok(), |hex| u64::from_str_radix(hex, 16).ok())
    };
    match (parse(start_str), parse(end_str)) {
        (Some(start), Some(end)) => Some((start, end)),
        _ => {
            warn!("Unparseable memory range: '{range}'");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace_data::Operation;

    fn event(time: i64, range: &str) -> Event {
        Event {
            time,
            operation: Operation::Alloc,
            range: range.into(),
            size: 8,
            callstack_path: vec![],
            alloc_at: None,
            free_at: None,
            fragmentation_ratio: None,
            free_ratio: None,
            impact_score: None,
        }
    }

    fn sample(timestamp: i64, frag: f64, free: f64) -> FragSample {
        FragSample { timestamp, fragmentation_ratio: frag, free_ratio: free }
    }

    #[test]
    fn merge_joins_by_timestamp() {
        let events = vec![event(10, "0-8"), event(20, "8-16")];
        let samples = vec![sample(10, 0.5, 0.25)];

        let merged = merge_fragmentation_into_events(&events, &samples);
        assert_eq!(merged[0].fragmentation_ratio, Some(0.5));
        assert_eq!(merged[0].free_ratio, Some(0.25));
        assert_eq!(merged[0].impact_score, Some(0.375));
        assert_eq!(merged[1].fragmentation_ratio, None);
        assert_eq!(merged[1].impact_score, None);
    }

    #[test]
    fn merge_lets_the_last_sample_per_timestamp_win() {
        let events = vec![event(10, "0-8")];
        let samples = vec![sample(10, 0.1, 0.9), sample(10, 0.6, 0.5)];

        let merged = merge_fragmentation_into_events(&events, &samples);
        assert_eq!(merged[0].fragmentation_ratio, Some(0.6));
        assert_eq!(merged[0].impact_score, Some(0.3));
    }

    #[test]
    fn parse_range_handles_both_bases() {
        assert_eq!(parse_range("100-250"), Some((100, 250)));
        assert_eq!(parse_range("0x10-0x2f"), Some((0x10, 0x2f)));
        assert_eq!(parse_range("0x10-32"), Some((16, 32)));
        assert_eq!(parse_range("garbage"), None);
        assert_eq!(parse_range("1-2-3"), None);
    }
}
