//! Full-pipeline tests: a real run directory with a zstd-compressed trace,
//! driven through the CLI argument surface.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use heapscope::cli::Args;
use heapscope::pipeline::AnalysisPipeline;
use heapscope_common::TraceWriter;

const BRK: u8 = 1;
const FREE: u8 = 10;
const MALLOC: u8 = 11;

const BASE: u64 = 0x0060_0000;
const TID: u32 = 1;

fn build_trace() -> Vec<u8> {
    let mut w = TraceWriter::new();
    // Establish the heap, grow it, fragment it a little.
    w.event(BRK, false, TID, 0, 0, 100, &[]);
    w.event(BRK, true, TID, BASE, 0, 100, &[]);
    w.event(BRK, false, TID, 0, 0, 200, &[]);
    w.event(BRK, true, TID, BASE + 1_000, 0, 200, &[]);
    for (i, ts) in (300..=500_i64).step_by(100).enumerate() {
        let addr = BASE + i as u64 * 300;
        w.event(MALLOC, false, TID, 200, 0, ts, &[]);
        w.event(MALLOC, true, TID, addr, 0, ts, &[]);
    }
    // Free the middle block: two used islands around a free gap.
    w.event(FREE, false, TID, BASE + 300, 0, 600, &[]);
    w.into_bytes()
}

fn write_run_dir(dir: &Path) {
    let compressed = zstd::stream::encode_all(&build_trace()[..], 0).unwrap();
    fs::write(dir.join("memory.profile"), compressed).unwrap();
    fs::write(
        dir.join("statinfo.txt"),
        "bench: synthetic\ntotal_traceinfo_count: 11\ntime_end: 700\n",
    )
    .unwrap();
}

fn run(dir: &Path, extra: &[&str]) {
    let mut argv: Vec<String> =
        vec!["heapscope".into(), "--input".into(), dir.display().to_string()];
    argv.extend(extra.iter().map(ToString::to_string));
    let args = Args::parse_from(argv);
    AnalysisPipeline::new(args).run().expect("pipeline run");
}

fn output(dir: &Path) -> PathBuf {
    dir.join("output")
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap_or_else(|_| {
        panic!("missing output file: {}", path.display());
    }))
    .unwrap()
}

#[test]
fn a_full_run_writes_the_aggregate_reports() {
    let dir = tempfile::tempdir().unwrap();
    write_run_dir(dir.path());
    run(dir.path(), &["--fragmentation", "--brk-events", "--flame", "--final-events"]);
    let out = output(dir.path());

    let frame_map = read_json(&out.join("stack_frame_map.json"));
    assert!(frame_map.is_object());

    let frag = read_json(&out.join("fragmentation.json"));
    assert!(!frag.as_array().unwrap().is_empty());

    let brks = read_json(&out.join("brk_events.json"));
    assert_eq!(brks.as_array().unwrap().len(), 2);
    assert_eq!(brks[0]["operation"], "brk");

    let flame = read_json(&out.join("flame.json"));
    assert_eq!(flame["name"], "root");

    let events = read_json(&out.join("final_events_with_frag.json"));
    let rows = events.as_array().unwrap();
    // 2 brk + 3 alloc + 1 free.
    assert_eq!(rows.len(), 6);
    assert!(rows.iter().all(|row| row.get("fragmentation_ratio").is_some()));

    // The final snapshot is cached for incremental re-runs.
    assert!(out.join("cache_final.bin").exists());
}

#[test]
fn peak_reports_are_written_for_detected_peaks() {
    let dir = tempfile::tempdir().unwrap();
    write_run_dir(dir.path());
    run(dir.path(), &[]);
    let out = output(dir.path());

    let after: Vec<PathBuf> = fs::read_dir(&out)
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with("_memory_fragments_after.json"))
        })
        .collect();
    assert_eq!(after.len(), 1, "expected exactly one peak report, got {after:?}");

    let doc = read_json(&after[0]);
    assert!(doc["timestamp"].is_i64());
    assert_eq!(doc["memory_segments"][0]["start_addr"], 0);
    assert!(doc["summary"]["total_memory"].is_u64());
}

#[test]
fn requested_snapshots_produce_reports_and_caches() {
    let dir = tempfile::tempdir().unwrap();
    write_run_dir(dir.path());
    run(
        dir.path(),
        &["--timestamps", "350", "--report-for-snapshots", "--memory-layout"],
    );
    let out = output(dir.path());

    assert!(out.join("cache_350.bin").exists());
    let events = read_json(&out.join("350_events.json"));
    // Events up to ts 350: two brk and one alloc.
    assert_eq!(events.as_array().unwrap().len(), 3);
    assert!(out.join("350_events_with_frag.json").exists());

    let layout = read_json(&out.join("350_memory_fragments.json"));
    assert_eq!(layout["timestamp"], 350);
    assert_eq!(layout["memory_segments"][0]["fragments"][0], serde_json::json!([200, 1]));

    let final_layout = read_json(&out.join("final_memory_fragments.json"));
    assert_eq!(final_layout["timestamp"], "final");
}

#[test]
fn a_cached_final_snapshot_survives_losing_the_trace() {
    let dir = tempfile::tempdir().unwrap();
    write_run_dir(dir.path());
    run(dir.path(), &[]);

    // The trace disappears; the cache alone must carry the next run.
    fs::remove_file(dir.path().join("memory.profile")).unwrap();
    run(dir.path(), &["--fragmentation"]);

    let frag = read_json(&output(dir.path()).join("fragmentation.json"));
    assert!(!frag.as_array().unwrap().is_empty());
}

#[test]
fn no_cache_leaves_no_cache_files_behind() {
    let dir = tempfile::tempdir().unwrap();
    write_run_dir(dir.path());
    run(dir.path(), &["--no-cache"]);
    let out = output(dir.path());

    let caches: Vec<_> = fs::read_dir(&out)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("cache_"))
        .collect();
    assert!(caches.is_empty());
}
