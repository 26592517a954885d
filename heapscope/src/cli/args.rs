//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

use crate::replay::ReplayConfig;

#[derive(Parser, Debug)]
#[command(
    name = "heapscope",
    about = "Offline brk-heap fragmentation analyzer for recorded memory traces",
    after_help = "\
EXAMPLES:
    heapscope --input ./run1 --fragmentation --memory-layout
    heapscope --input ./run1 --snapshot-interval 1000000000 --report-for-snapshots
    heapscope --input ./run1 --timestamps 1500000000,2500000000 --flame"
)]
pub struct Args {
    /// Run directory containing memory.profile and statinfo.txt
    #[arg(short, long)]
    pub input: PathBuf,

    /// Report directory, created under the run directory
    #[arg(long, default_value = "output")]
    pub output_dir: PathBuf,

    /// Delete the report directory before writing
    #[arg(long)]
    pub clear_output_dir: bool,

    /// Emit compact JSON instead of pretty-printed
    #[arg(long)]
    pub compact_json: bool,

    /// Generate flame.json
    #[arg(long)]
    pub flame: bool,

    /// Generate fragmentation.json
    #[arg(long)]
    pub fragmentation: bool,

    /// Generate brk_events.json
    #[arg(long)]
    pub brk_events: bool,

    /// Generate memory-layout documents for snapshots
    #[arg(long)]
    pub memory_layout: bool,

    /// Generate final_events_with_frag.json for the final snapshot
    #[arg(long)]
    pub final_events: bool,

    /// Also write report files for intermediate snapshots
    #[arg(long)]
    pub report_for_snapshots: bool,

    /// Explicit snapshot targets, comma-separated nanosecond timestamps
    #[arg(long, value_name = "TS,TS,...")]
    pub timestamps: Option<String>,

    /// Auto-insert a snapshot target every N nanoseconds up to time_end
    #[arg(long, value_name = "NS")]
    pub snapshot_interval: Option<i64>,

    /// Event window before each peak, nanoseconds
    #[arg(long, default_value_t = 500_000_000)]
    pub peak_window: i64,

    /// Samples compared on each side during peak detection
    #[arg(long, default_value_t = 500)]
    pub peak_detection_window: usize,

    /// Truncate call stacks to this many frames (-1 keeps them whole)
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    pub callstack_depth: i32,

    /// Extend each peak window by this many events past the peak
    #[arg(long, default_value_t = 0)]
    pub events_after_peak: usize,

    /// Filter peak reports down to the memory the recent events touched
    #[arg(long)]
    pub enable_peak_focus: bool,

    /// Recent events considered when computing focus regions
    #[arg(long, default_value_t = 50)]
    pub peak_focus_events: usize,

    /// Context margin around each focused event range, bytes
    #[arg(long, default_value_t = 8_192)]
    pub peak_focus_context: u64,

    /// Keep at most this many events in a focused peak report
    #[arg(long, default_value_t = 500)]
    pub peak_focus_output_events: usize,

    /// Also write the memory layout just before each peak window
    #[arg(long)]
    pub generate_peak_before_layout: bool,

    /// Neither read nor write snapshot caches
    #[arg(long)]
    pub no_cache: bool,

    /// Delete all snapshot caches after the run
    #[arg(long)]
    pub clear_cache: bool,

    /// Progress log every N raw records
    #[arg(long, default_value_t = 2_000)]
    pub log_interval: u64,

    /// Drop C++ operator new/delete events entirely
    #[arg(long)]
    pub skip_cpp: bool,
}

impl Args {
    /// The subset the replay engine consumes.
    #[must_use]
    pub fn replay_config(&self) -> ReplayConfig {
        ReplayConfig {
            callstack_depth: self.callstack_depth,
            skip_cpp: self.skip_cpp,
            log_interval: self.log_interval,
        }
    }

    /// Explicit snapshot targets from `--timestamps`, unsorted, unvalidated
    /// entries skipped.
    #[must_use]
    pub fn explicit_timestamps(&self) -> Vec<i64> {
        self.timestamps
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .filter_map(|ts| ts.trim().parse().ok())
            .collect()
    }
}
