//! Fragmentation peak detection
//!
//! Scores every fragmentation sample with [`impact_score`] and finds local
//! maxima over a sliding window: a sample qualifies when nothing in the
//! `window` samples on either side beats it, and it is the first sample in
//! its left window to reach that score (so a plateau reports once, at its
//! left edge). Traces too short for the window, or with no local peak at
//! all, fall back to the single global maximum.

use log::{info, warn};

use super::impact_score;
use crate::trace_data::FragSample;

/// Timestamps of detected fragmentation peaks, in sample order.
#[must_use]
pub fn find_peaks(samples: &[FragSample], window: usize) -> Vec<i64> {
    if samples.is_empty() {
        warn!("No fragmentation samples; skipping peak detection");
        return Vec::new();
    }

    let scores: Vec<f64> = samples
        .iter()
        .map(|s| impact_score(s.fragmentation_ratio, s.free_ratio))
        .collect();
    let n = samples.len();
    info!("Peak detection over {n} samples, window {window}");

    if n < 2 * window + 1 {
        warn!("Too few samples ({n}) for window {window}; falling back to the global maximum");
        return global_max(samples, &scores);
    }

    let mut peaks = Vec::new();
    for i in 0..n {
        let left_start = i.saturating_sub(window);
        let right_end = (i + window + 1).min(n);
        let curr = scores[i];

        let left_max = scores[left_start..i].iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let right_max =
            scores[i + 1..right_end].iter().copied().fold(f64::NEG_INFINITY, f64::max);

        if curr >= left_max && curr >= right_max {
            let first_in_left = scores[left_start..i].iter().all(|&s| curr > s);
            if first_in_left || left_start == i {
                peaks.push(samples[i].timestamp);
            }
        }
    }

    if peaks.is_empty() {
        warn!("No local peaks in window {window}; falling back to the global maximum");
        return global_max(samples, &scores);
    }
    peaks
}

/// Timestamp of the first sample with the highest score.
fn global_max(samples: &[FragSample], scores: &[f64]) -> Vec<i64> {
    let mut best = 0;
    for (i, &score) in scores.iter().enumerate().skip(1) {
        if score > scores[best] {
            best = i;
        }
    }
    vec![samples[best].timestamp]
}
