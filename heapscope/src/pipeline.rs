//! Analysis pipeline
//!
//! Drives a full run: prepare the output directory, replay the trace (or
//! resume from the snapshot cache), detect fragmentation peaks, write the
//! per-peak reports, then the final aggregate reports. Every stage degrades
//! rather than aborts where the input allows it: missing caches fall back to
//! older caches or a full replay, and unreachable snapshot targets are
//! skipped with a warning.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use log::{info, warn};

use crate::analysis::{self, FocusSegment};
use crate::cli::Args;
use crate::export::{JsonStyle, ReportWriter};
use crate::input::{self, METADATA_FILE};
use crate::metadata::RunMetadata;
use crate::replay::{cache, ProgressTotals, Snapshot, SnapshotLabel, TraceReplay};
use crate::trace_data::Event;

pub struct AnalysisPipeline {
    args: Args,
    output_dir: PathBuf,
    writer: ReportWriter,
    metadata: RunMetadata,
    trace: Option<Vec<u8>>,
    final_snapshot: Option<Snapshot>,
    peaks: Vec<i64>,
}

impl AnalysisPipeline {
    #[must_use]
    pub fn new(args: Args) -> Self {
        let output_dir = args.input.join(&args.output_dir);
        let style = if args.compact_json { JsonStyle::Compact } else { JsonStyle::Pretty };
        Self {
            writer: ReportWriter::new(&output_dir, style),
            output_dir,
            metadata: RunMetadata::default(),
            trace: None,
            final_snapshot: None,
            peaks: Vec::new(),
            args,
        }
    }

    /// Run every stage.
    ///
    /// # Errors
    /// Returns an error when the trace cannot be loaded or a report cannot
    /// be written.
    pub fn run(mut self) -> Result<()> {
        self.prepare()?;
        self.parse_trace()?;
        self.find_peaks();
        self.report_peaks()?;
        self.final_reports()?;
        self.cleanup();
        info!("All processing done");
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        if self.args.clear_output_dir && self.output_dir.exists() {
            fs::remove_dir_all(&self.output_dir)
                .with_context(|| format!("clearing {}", self.output_dir.display()))?;
        }
        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("creating {}", self.output_dir.display()))?;

        self.metadata = RunMetadata::load(&self.args.input.join(METADATA_FILE));
        self.metadata.announce();

        if !self.args.input.join(input::PROFILE_FILE).exists() {
            warn!(
                "No '{}' in {}; only cached snapshots can be used",
                input::PROFILE_FILE,
                self.args.input.display()
            );
        }
        Ok(())
    }

    fn ensure_trace(&mut self) -> Result<()> {
        if self.trace.is_none() {
            self.trace = Some(input::load_trace(&self.args.input)?);
        }
        Ok(())
    }

    /// Replay the trace to its final snapshot, resuming from the newest
    /// usable cache and pausing at every requested target on the way.
    fn parse_trace(&mut self) -> Result<()> {
        info!("--- phase 1a: replaying the trace ---");

        let resume_from =
            if self.args.no_cache { None } else { cache::load_latest(&self.output_dir) };
        let resume_from = match resume_from {
            Some((snapshot, SnapshotLabel::Final)) => {
                info!("Final snapshot loaded from cache; skipping the replay");
                self.final_snapshot = Some(snapshot);
                return Ok(());
            }
            other => other,
        };

        self.ensure_trace()?;
        let targets = self.snapshot_targets();
        if !targets.is_empty() {
            info!("Snapshots will be taken at {} target timestamps", targets.len());
        }
        let totals = ProgressTotals {
            total_records: self.metadata.total_record_count().unwrap_or(0),
            total_duration: self.metadata.time_end().unwrap_or(0),
        };

        // The buffer moves out of self while the replay borrows it, so the
        // snapshot handler below is free to take &mut self.
        let trace = self.trace.take().unwrap_or_default();
        let cfg = self.args.replay_config();
        let mut replay = match resume_from {
            Some((snapshot, label)) => {
                info!("Resuming the replay from cached snapshot '{label}'");
                TraceReplay::resume(&trace, cfg, snapshot, &targets)
            }
            None => {
                info!("No usable cache; replaying from the start");
                TraceReplay::new(&trace, cfg, &targets)
            }
        }
        .with_progress_totals(totals);

        let mut outcome = Ok(());
        while let Some(snapshot) = replay.next_snapshot() {
            if let Err(e) = self.handle_snapshot(&snapshot) {
                outcome = Err(e);
                break;
            }
            if snapshot.label == SnapshotLabel::Final {
                self.final_snapshot = Some(snapshot);
                break;
            }
        }
        drop(replay);
        self.trace = Some(trace);
        outcome
    }

    /// Union of `--timestamps` and the `--snapshot-interval` grid, sorted.
    fn snapshot_targets(&self) -> Vec<i64> {
        let mut targets: BTreeSet<i64> = self.args.explicit_timestamps().into_iter().collect();

        if let Some(interval) = self.args.snapshot_interval {
            if interval > 0 {
                match self.metadata.time_end() {
                    Some(total) if total > 0 => {
                        let mut ts = interval;
                        while ts < total {
                            targets.insert(ts);
                            ts += interval;
                        }
                    }
                    _ => warn!(
                        "No usable 'time_end' in {METADATA_FILE}; ignoring --snapshot-interval"
                    ),
                }
            }
        }
        targets.into_iter().collect()
    }

    fn handle_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let label = snapshot.label;
        info!("--- snapshot captured: {label} ---");

        if !self.args.no_cache {
            cache::save(snapshot, &self.output_dir)?;
        }

        if label != SnapshotLabel::Final && !self.args.report_for_snapshots {
            return Ok(());
        }

        info!("Writing detailed JSON for snapshot '{label}'");
        if label == SnapshotLabel::Final {
            if self.args.final_events {
                let merged = analysis::merge_fragmentation_into_events(
                    &snapshot.events,
                    &snapshot.fragmentation,
                );
                self.writer.events("final_events_with_frag.json", &merged)?;
            }
        } else {
            self.writer.events(&format!("{label}_events.json"), &snapshot.events)?;
            let merged =
                analysis::merge_fragmentation_into_events(&snapshot.events, &snapshot.fragmentation);
            self.writer.events(&format!("{label}_events_with_frag.json"), &merged)?;
        }

        if self.args.memory_layout {
            self.writer.memory_fragments(
                &format!("{label}_memory_fragments.json"),
                label,
                snapshot.layout.summary,
                &[FocusSegment::whole(&snapshot.layout.memory_fragments)],
                &[],
            )?;
        }
        Ok(())
    }

    fn find_peaks(&mut self) {
        info!("--- phase 1b: detecting fragmentation peaks ---");
        let Some(final_snapshot) = &self.final_snapshot else {
            warn!("No final snapshot; cannot detect peaks");
            return;
        };
        self.peaks = analysis::find_peaks(
            &final_snapshot.fragmentation,
            self.args.peak_detection_window,
        );
        info!("Detected {} fragmentation peaks: {:?}", self.peaks.len(), self.peaks);
    }

    /// Obtain an exact snapshot at `target`: exact cache hit, else resume
    /// from the nearest earlier cache, else replay from scratch.
    fn snapshot_at(&self, trace: &[u8], target: i64) -> Option<Snapshot> {
        let exact = self.output_dir.join(cache::file_name(SnapshotLabel::At(target)));
        if !self.args.no_cache && exact.exists() {
            match cache::load(&exact) {
                Ok(snapshot) => {
                    info!("Exact cached snapshot found: {}", exact.display());
                    return Some(snapshot);
                }
                Err(e) => warn!("Failed to load cache {}: {e}; regenerating", exact.display()),
            }
        }

        let resume =
            if self.args.no_cache { None } else { cache::load_latest_before(&self.output_dir, target) };
        let cfg = self.args.replay_config();
        let mut replay = match resume {
            Some((snapshot, label)) => {
                info!("Resuming from cached snapshot '{label}' for target {target}");
                TraceReplay::resume(trace, cfg, snapshot, &[target])
            }
            None => {
                info!("No cache before {target}; replaying from the start");
                TraceReplay::new(trace, cfg, &[target])
            }
        };

        while let Some(snapshot) = replay.next_snapshot() {
            if snapshot.label == SnapshotLabel::At(target) {
                if !self.args.no_cache {
                    if let Err(e) = cache::save(&snapshot, &self.output_dir) {
                        warn!("Could not cache snapshot {target}: {e}");
                    }
                }
                return Some(snapshot);
            }
        }
        warn!("No snapshot generated for {target}; it may lie beyond the trace");
        None
    }

    fn report_peaks(&mut self) -> Result<()> {
        if self.peaks.is_empty() {
            return Ok(());
        }
        info!("--- phase 2: per-peak reports ---");
        if let Err(e) = self.ensure_trace() {
            warn!("Trace unavailable for peak replay ({e}); relying on exact caches only");
        }
        let trace = self.trace.take().unwrap_or_default();
        let outcome = self.report_peaks_over(&trace);
        self.trace = Some(trace);
        outcome
    }

    #[allow(clippy::too_many_lines)]
    fn report_peaks_over(&self, trace: &[u8]) -> Result<()> {
        let Some(final_snapshot) = &self.final_snapshot else {
            return Ok(());
        };
        let all_events = analysis::merge_fragmentation_into_events(
            &final_snapshot.events,
            &final_snapshot.fragmentation,
        );

        let mut peaks = self.peaks.clone();
        peaks.sort_unstable();
        peaks.dedup();

        // Ascending order lets later peaks reuse the caches written for
        // earlier ones.
        for (i, &peak) in peaks.iter().enumerate() {
            info!(">>> processing peak {peak} ({}/{})", i + 1, peaks.len());
            let Some(mut snapshot) = self.snapshot_at(trace, peak) else {
                warn!("Could not obtain a snapshot for peak {peak}; skipping");
                continue;
            };

            let window_start = peak - self.args.peak_window;
            let mut window: Vec<Event> = all_events
                .iter()
                .filter(|e| window_start <= e.time && e.time <= peak)
                .cloned()
                .collect();

            if self.args.events_after_peak > 0 {
                let mut after: Vec<Event> =
                    all_events.iter().filter(|e| e.time > peak).cloned().collect();
                after.sort_by_key(|e| e.time);
                after.truncate(self.args.events_after_peak);

                if let Some(last) = after.last() {
                    let last_time = last.time;
                    info!("Window extended past the peak until {last_time}");
                    // The layout must reflect the extended window too.
                    match self.snapshot_at(trace, last_time) {
                        Some(extended) => snapshot = extended,
                        None => {
                            warn!("No exact snapshot at {last_time}; keeping the peak snapshot");
                        }
                    }
                }
                window.extend(after);
            }

            let mut focus_regions: Vec<(u64, u64)> = Vec::new();
            let mut segments = vec![FocusSegment::whole(&snapshot.layout.memory_fragments)];
            if self.args.enable_peak_focus {
                info!(
                    "Focusing on the last {} events, {} bytes of context",
                    self.args.peak_focus_events, self.args.peak_focus_context
                );
                focus_regions = analysis::calculate_focus_regions(
                    &window,
                    self.args.peak_focus_events,
                    self.args.peak_focus_context,
                );
                if !focus_regions.is_empty() {
                    segments = analysis::filter_layout_by_regions(
                        &snapshot.layout.memory_fragments,
                        &focus_regions,
                    );

                    let mut filtered = analysis::filter_events_by_regions(&window, &focus_regions);
                    let keep = self.args.peak_focus_output_events;
                    if keep > 0 && filtered.len() > keep {
                        filtered.drain(..filtered.len() - keep);
                    }
                    info!("Focused event window holds {} events", filtered.len());
                    window = filtered;
                }
            }

            self.writer.memory_fragments(
                &format!("{peak}_memory_fragments_after.json"),
                SnapshotLabel::At(peak),
                snapshot.layout.summary,
                &segments,
                &focus_regions,
            )?;
            self.writer.events(&format!("{peak}_events_with_frag.json"), &window)?;

            if self.args.generate_peak_before_layout {
                if let Some(first) = window.first() {
                    self.write_pre_peak_layout(trace, peak, first.time - 1, &focus_regions)?;
                }
            }
        }

        info!("Processed {} peaks: {peaks:?}", peaks.len());
        Ok(())
    }

    /// Layout as it stood just before the first event of a peak window.
    fn write_pre_peak_layout(
        &self,
        trace: &[u8],
        peak: i64,
        before_ts: i64,
        focus_regions: &[(u64, u64)],
    ) -> Result<()> {
        let Some(before) = self.snapshot_at(trace, before_ts) else {
            warn!("Could not snapshot {before_ts} for the pre-peak layout of {peak}");
            return Ok(());
        };
        let segments = if focus_regions.is_empty() {
            vec![FocusSegment::whole(&before.layout.memory_fragments)]
        } else {
            analysis::filter_layout_by_regions(&before.layout.memory_fragments, focus_regions)
        };
        self.writer.memory_fragments(
            &format!("{peak}_memory_fragments_before.json"),
            SnapshotLabel::At(before_ts),
            before.layout.summary,
            &segments,
            focus_regions,
        )?;
        Ok(())
    }

    fn final_reports(&self) -> Result<()> {
        info!("--- final aggregate reports ---");
        let Some(final_snapshot) = &self.final_snapshot else {
            bail!("no final snapshot available for report generation");
        };

        self.writer
            .frame_map("stack_frame_map.json", &final_snapshot.context.frames)
            .context("writing stack_frame_map.json")?;
        info!("Frame map written: stack_frame_map.json");

        if self.args.flame {
            let graph = analysis::build_flame_graph(
                &final_snapshot.events,
                &final_snapshot.context.frames,
            );
            self.writer.flame("flame.json", &graph).context("writing flame.json")?;
            info!("Flame graph written: flame.json");
        }

        if self.args.fragmentation {
            self.writer
                .fragmentation("fragmentation.json", &final_snapshot.fragmentation)
                .context("writing fragmentation.json")?;
            info!("Fragmentation series written: fragmentation.json");
        }

        if self.args.brk_events {
            self.writer
                .events("brk_events.json", &final_snapshot.brk_events)
                .context("writing brk_events.json")?;
            info!("brk events written: brk_events.json");
        }
        Ok(())
    }

    fn cleanup(&self) {
        if self.args.clear_cache {
            let removed = cache::clear(&self.output_dir);
            info!("Removed {removed} cache files");
        }
    }
}
