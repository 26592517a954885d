//! End-to-end replay tests over synthetic traces.
//!
//! Traces are built with the wire-format writer from `heapscope-common`,
//! then replayed through the real decoder. The heap base sits at a non-zero
//! address so the offset/absolute range split is exercised everywhere.

use heapscope::fragments::BlockStatus;
use heapscope::replay::{cache, ReplayConfig, Snapshot, SnapshotLabel, TraceReplay};
use heapscope::trace_data::Operation;
use heapscope_common::{FrameRecord, TraceWriter};

const BRK: u8 = 1;
const FREE: u8 = 10;
const MALLOC: u8 = 11;
const CALLOC: u8 = 12;
const REALLOC: u8 = 13;
const NEW: u8 = 17;

const BASE: u64 = 0x0060_0000;
const TID: u32 = 1;

fn brk(w: &mut TraceWriter, ts: i64, new_brk: u64) {
    w.event(BRK, false, TID, 0, 0, ts, &[]);
    w.event(BRK, true, TID, new_brk, 0, ts, &[]);
}

fn malloc(w: &mut TraceWriter, ts: i64, addr: u64, size: u64) {
    w.event(MALLOC, false, TID, size, 0, ts, &[]);
    w.event(MALLOC, true, TID, addr, 0, ts, &[]);
}

fn free(w: &mut TraceWriter, ts: i64, addr: u64) {
    w.event(FREE, false, TID, addr, 0, ts, &[]);
}

fn replay_to_final(trace: &[u8]) -> Snapshot {
    let mut replay = TraceReplay::new(trace, ReplayConfig::default(), &[]);
    let snapshot = replay.next_snapshot().expect("final snapshot");
    assert_eq!(snapshot.label, SnapshotLabel::Final);
    assert!(replay.next_snapshot().is_none());
    snapshot
}

fn fragment_spans(snapshot: &Snapshot) -> Vec<(u64, u64, BlockStatus)> {
    snapshot
        .context
        .heap
        .fragments()
        .iter()
        .map(|f| (f.start - BASE, f.end - BASE, f.status))
        .collect()
}

#[test]
fn a_grown_heap_starts_as_one_free_interval() {
    let mut w = TraceWriter::new();
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    let snapshot = replay_to_final(w.as_bytes());

    assert_eq!(fragment_spans(&snapshot), vec![(0, 1_000, BlockStatus::Free)]);
    assert_eq!(snapshot.layout.memory_fragments, vec![(1_000, 0)]);

    let last = snapshot.fragmentation.last().unwrap();
    assert_eq!(last.free_ratio, 1.0);
    assert_eq!(last.fragmentation_ratio, 0.0);
}

#[test]
fn allocations_and_a_free_leave_the_expected_intervals() {
    let mut w = TraceWriter::new();
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    malloc(&mut w, 300, BASE, 200);
    malloc(&mut w, 400, BASE + 200, 300);
    free(&mut w, 500, BASE);
    let snapshot = replay_to_final(w.as_bytes());

    assert_eq!(
        fragment_spans(&snapshot),
        vec![
            (0, 200, BlockStatus::Free),
            (200, 500, BlockStatus::Used),
            (500, 1_000, BlockStatus::Free),
        ]
    );
    assert_eq!(snapshot.context.heap.largest_free(), 500);
    assert_eq!(snapshot.layout.memory_fragments, vec![(200, 0), (500, 1), (1_000, 0)]);
}

#[test]
fn freeing_an_unknown_address_changes_nothing() {
    let mut w = TraceWriter::new();
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    malloc(&mut w, 300, BASE, 1_000);
    free(&mut w, 400, BASE + 500); // interior address, never its own block
    let snapshot = replay_to_final(w.as_bytes());

    assert_eq!(fragment_spans(&snapshot), vec![(0, 1_000, BlockStatus::Used)]);
    assert!(snapshot.events.iter().all(|e| e.operation != Operation::Free));
    assert_eq!(snapshot.context.active_allocs.get(&BASE), Some(&1_000));
}

#[test]
fn freed_neighbours_coalesce_into_one_interval() {
    let mut w = TraceWriter::new();
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    malloc(&mut w, 300, BASE, 400);
    malloc(&mut w, 400, BASE + 400, 400);
    free(&mut w, 500, BASE);
    free(&mut w, 600, BASE + 400);
    let snapshot = replay_to_final(w.as_bytes());

    assert_eq!(fragment_spans(&snapshot), vec![(0, 1_000, BlockStatus::Free)]);
    assert_eq!(snapshot.context.heap.largest_free(), 1_000);
    let last = snapshot.fragmentation.last().unwrap();
    assert_eq!(last.fragmentation_ratio, 0.0);
}

#[test]
fn brk_shrink_excises_the_tail() {
    let mut w = TraceWriter::new();
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    malloc(&mut w, 300, BASE, 400);
    brk(&mut w, 400, BASE + 800);
    let snapshot = replay_to_final(w.as_bytes());

    assert_eq!(
        fragment_spans(&snapshot),
        vec![(0, 400, BlockStatus::Used), (400, 800, BlockStatus::Free)]
    );
    let heap = &snapshot.context.heap;
    assert_eq!(heap.total_used() + heap.total_free(), 800);

    let shrink = snapshot.brk_events.last().unwrap();
    assert_eq!(shrink.size, -200);
    assert_eq!(shrink.range, "1000-800");
}

#[test]
fn realloc_emits_a_free_then_an_alloc_with_back_links() {
    let mut w = TraceWriter::new();
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    malloc(&mut w, 300, BASE + 100, 200);
    // realloc(old = BASE+100, new_size = 300) returning BASE+500.
    w.event(REALLOC, false, TID, BASE + 100, 300, 400, &[]);
    w.event(REALLOC, true, TID, BASE + 500, 0, 400, &[]);
    let snapshot = replay_to_final(w.as_bytes());

    let ops: Vec<Operation> = snapshot.events.iter().map(|e| e.operation).collect();
    assert_eq!(
        ops,
        vec![
            Operation::Brk,
            Operation::Brk,
            Operation::Alloc,
            Operation::Free,
            Operation::Alloc,
        ]
    );

    let first_alloc = &snapshot.events[2];
    let freed = &snapshot.events[3];
    let realloced = &snapshot.events[4];
    assert_eq!(first_alloc.free_at, Some(400));
    assert_eq!(freed.alloc_at, Some(300));
    assert_eq!(freed.time, 400);
    assert_eq!(freed.range, "100-300");
    assert_eq!(realloced.range, "500-800");
    assert_eq!(realloced.size, 300);

    assert_eq!(
        fragment_spans(&snapshot),
        vec![
            (0, 500, BlockStatus::Free),
            (500, 800, BlockStatus::Used),
            (800, 1_000, BlockStatus::Free),
        ]
    );
}

#[test]
fn calloc_multiplies_its_arguments() {
    let mut w = TraceWriter::new();
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    w.event(CALLOC, false, TID, 16, 8, 300, &[]);
    w.event(CALLOC, true, TID, BASE, 0, 300, &[]);
    let snapshot = replay_to_final(w.as_bytes());

    assert_eq!(snapshot.events[2].size, 128);
    assert_eq!(snapshot.events[2].range, "0-128");
}

#[test]
fn allocations_outside_the_brk_heap_use_hex_ranges_and_skip_sampling() {
    let mut w = TraceWriter::new();
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    let samples_after_brk = 2;
    malloc(&mut w, 300, 0x1000, 64); // far below the heap base
    let snapshot = replay_to_final(w.as_bytes());

    let alloc = snapshot.events.last().unwrap();
    assert_eq!(alloc.range, "0x1000-0x1040");
    assert_eq!(snapshot.fragmentation.len(), samples_after_brk);
    assert!(snapshot.context.heap.fragments().iter().all(|f| f.start >= BASE));
}

#[test]
fn unmatched_returns_are_dropped() {
    let mut w = TraceWriter::new();
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    w.event(MALLOC, true, TID, BASE, 0, 300, &[]); // return with no call
    let snapshot = replay_to_final(w.as_bytes());

    assert_eq!(snapshot.events.len(), 2);
    assert!(snapshot.context.active_allocs.is_empty());
}

#[test]
fn an_unreturned_call_is_discarded_silently() {
    let mut w = TraceWriter::new();
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    w.event(MALLOC, false, TID, 64, 0, 300, &[]); // call, never returns
    let snapshot = replay_to_final(w.as_bytes());

    assert_eq!(snapshot.events.len(), 2);
    assert_eq!(snapshot.context.pending_calls.len(), 1);
}

#[test]
fn string_tables_resolve_frames_and_missing_indexes_get_placeholders() {
    let mut w = TraceWriter::new();
    w.file_name("src/pool.c");
    w.func_name("pool_grow");
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    let frames = [
        FrameRecord { file_idx: 0, func_idx: 0, line: 42, col: 5 },
        FrameRecord { file_idx: 7, func_idx: 9, line: -1, col: -1 },
    ];
    w.event(MALLOC, false, TID, 64, 0, 300, &frames);
    w.event(MALLOC, true, TID, BASE, 0, 300, &[]);
    let snapshot = replay_to_final(w.as_bytes());

    let alloc = snapshot.events.last().unwrap();
    assert_eq!(alloc.callstack_path, vec![0, 1]);

    let table = &snapshot.context.frames;
    let known = table.lookup(0).unwrap();
    assert_eq!(known.file, "src/pool.c");
    assert_eq!(known.func, "pool_grow");
    assert_eq!(known.line, 42);

    let placeholder = table.lookup(1).unwrap();
    assert_eq!(placeholder.file, "<unknown_file_7>");
    assert_eq!(placeholder.func, "<unknown_func_9>");
}

#[test]
fn equal_frames_share_an_id_across_events() {
    let mut w = TraceWriter::new();
    w.file_name("src/pool.c");
    w.func_name("pool_grow");
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    let frame = [FrameRecord { file_idx: 0, func_idx: 0, line: 42, col: 5 }];
    w.event(MALLOC, false, TID, 64, 0, 300, &frame);
    w.event(MALLOC, true, TID, BASE, 0, 300, &[]);
    w.event(MALLOC, false, TID, 64, 0, 400, &frame);
    w.event(MALLOC, true, TID, BASE + 64, 0, 400, &[]);
    let snapshot = replay_to_final(w.as_bytes());

    assert_eq!(snapshot.context.frames.len(), 1);
    let allocs: Vec<_> = snapshot
        .events
        .iter()
        .filter(|e| e.operation == Operation::Alloc)
        .collect();
    assert_eq!(allocs[0].callstack_path, allocs[1].callstack_path);
}

#[test]
fn callstack_depth_truncates_paths() {
    let mut w = TraceWriter::new();
    w.file_name("src/pool.c");
    w.func_name("a");
    w.func_name("b");
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    let frames = [
        FrameRecord { file_idx: 0, func_idx: 0, line: 1, col: 0 },
        FrameRecord { file_idx: 0, func_idx: 1, line: 2, col: 0 },
    ];
    w.event(MALLOC, false, TID, 64, 0, 300, &frames);
    w.event(MALLOC, true, TID, BASE, 0, 300, &[]);

    let cfg = ReplayConfig { callstack_depth: 1, ..ReplayConfig::default() };
    let snapshot = TraceReplay::new(w.as_bytes(), cfg, &[]).next_snapshot().unwrap();

    let alloc = snapshot.events.last().unwrap();
    assert_eq!(alloc.callstack_path.len(), 1);
    // Truncation happens after interning, so both frames are in the table.
    assert_eq!(snapshot.context.frames.len(), 2);
}

#[test]
fn skip_cpp_drops_operator_new_entirely() {
    let mut w = TraceWriter::new();
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    w.event(NEW, false, TID, 128, 0, 300, &[]);
    w.event(NEW, true, TID, BASE, 0, 300, &[]);

    let cfg = ReplayConfig { skip_cpp: true, ..ReplayConfig::default() };
    let skipped = TraceReplay::new(w.as_bytes(), cfg, &[]).next_snapshot().unwrap();
    assert_eq!(skipped.events.len(), 2);
    assert!(skipped.context.active_allocs.is_empty());

    let kept = replay_to_final(w.as_bytes());
    assert_eq!(kept.events.len(), 3);
    assert_eq!(kept.events[2].operation, Operation::Alloc);
}

#[test]
fn snapshots_cut_exactly_at_their_target() {
    let mut w = TraceWriter::new();
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    malloc(&mut w, 300, BASE, 200);
    malloc(&mut w, 400, BASE + 200, 100);
    free(&mut w, 500, BASE);

    let snapshots: Vec<Snapshot> =
        TraceReplay::new(w.as_bytes(), ReplayConfig::default(), &[350]).collect();
    assert_eq!(snapshots.len(), 2);

    let at = &snapshots[0];
    assert_eq!(at.label, SnapshotLabel::At(350));
    assert!(at.events.iter().all(|e| e.time <= 350));
    assert_eq!(at.events.len(), 3);
    // Layout reflects exactly the events up to the target.
    assert_eq!(at.layout.memory_fragments, vec![(200, 1), (1_000, 0)]);

    let fin = &snapshots[1];
    assert_eq!(fin.label, SnapshotLabel::Final);
    assert_eq!(fin.events.len(), 5);
    assert_eq!(fin.layout.memory_fragments, vec![(200, 0), (300, 1), (1_000, 0)]);
}

#[test]
fn targets_before_the_first_event_yield_empty_snapshots() {
    let mut w = TraceWriter::new();
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);

    let snapshots: Vec<Snapshot> =
        TraceReplay::new(w.as_bytes(), ReplayConfig::default(), &[10, 20]).collect();
    assert_eq!(snapshots.len(), 3);
    assert!(snapshots[0].events.is_empty());
    assert!(snapshots[1].events.is_empty());
    assert_eq!(snapshots[2].events.len(), 2);
}

#[test]
fn replaying_twice_is_deterministic() {
    let mut w = TraceWriter::new();
    w.file_name("src/pool.c");
    w.func_name("pool_grow");
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    let frame = [FrameRecord { file_idx: 0, func_idx: 0, line: 42, col: 5 }];
    w.event(MALLOC, false, TID, 64, 0, 300, &frame);
    w.event(MALLOC, true, TID, BASE, 0, 300, &[]);
    free(&mut w, 400, BASE);

    let targets = [250, 350];
    let first: Vec<Snapshot> =
        TraceReplay::new(w.as_bytes(), ReplayConfig::default(), &targets).collect();
    let second: Vec<Snapshot> =
        TraceReplay::new(w.as_bytes(), ReplayConfig::default(), &targets).collect();
    assert_eq!(first, second);
}

#[test]
fn resuming_from_a_snapshot_matches_an_uninterrupted_run() {
    let mut w = TraceWriter::new();
    w.file_name("src/pool.c");
    w.func_name("pool_grow");
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    let frame = [FrameRecord { file_idx: 0, func_idx: 0, line: 42, col: 5 }];
    w.event(MALLOC, false, TID, 200, 0, 300, &frame);
    w.event(MALLOC, true, TID, BASE, 0, 300, &[]);
    malloc(&mut w, 400, BASE + 200, 300);
    free(&mut w, 500, BASE);
    brk(&mut w, 600, BASE + 800);
    let trace = w.as_bytes();

    let uninterrupted = replay_to_final(trace);

    let mut paused = TraceReplay::new(trace, ReplayConfig::default(), &[450]);
    let midpoint = paused.next_snapshot().unwrap();
    assert_eq!(midpoint.label, SnapshotLabel::At(450));
    drop(paused);

    // Through the persistent cache, as a real resumed run would go.
    let dir = tempfile::tempdir().unwrap();
    cache::save(&midpoint, dir.path()).unwrap();
    let (restored, label) = cache::load_latest(dir.path()).unwrap();
    assert_eq!(label, SnapshotLabel::At(450));
    drop(midpoint);

    let resumed_final = TraceReplay::resume(trace, ReplayConfig::default(), restored, &[])
        .next_snapshot()
        .unwrap();
    assert_eq!(resumed_final, uninterrupted);
}

#[test]
fn alloc_free_back_links_pair_up() {
    let mut w = TraceWriter::new();
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    malloc(&mut w, 300, BASE, 100);
    free(&mut w, 700, BASE);
    let snapshot = replay_to_final(w.as_bytes());

    let alloc = snapshot.events.iter().find(|e| e.operation == Operation::Alloc).unwrap();
    let freed = snapshot.events.iter().find(|e| e.operation == Operation::Free).unwrap();
    assert_eq!(alloc.free_at, Some(freed.time));
    assert_eq!(freed.alloc_at, Some(alloc.time));
}

#[test]
fn ratio_samples_stay_within_bounds() {
    let mut w = TraceWriter::new();
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    for i in 0..8u64 {
        malloc(&mut w, 300 + i as i64 * 10, BASE + i * 100, 50);
    }
    free(&mut w, 400, BASE + 200);
    free(&mut w, 410, BASE + 600);
    let snapshot = replay_to_final(w.as_bytes());

    assert!(!snapshot.fragmentation.is_empty());
    for sample in &snapshot.fragmentation {
        assert!((0.0..=1.0).contains(&sample.free_ratio), "{sample:?}");
        assert!((0.0..=1.0).contains(&sample.fragmentation_ratio), "{sample:?}");
    }
}

#[test]
fn coverage_holds_after_every_kind_of_update() {
    let mut w = TraceWriter::new();
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    malloc(&mut w, 300, BASE, 250);
    malloc(&mut w, 310, BASE + 250, 250);
    free(&mut w, 320, BASE);
    brk(&mut w, 330, BASE + 1_500);
    brk(&mut w, 340, BASE + 600);
    let snapshot = replay_to_final(w.as_bytes());

    let heap = &snapshot.context.heap;
    let covered: u64 = heap.fragments().iter().map(|f| f.end - f.start).sum();
    assert_eq!(covered, 600);
    assert_eq!(heap.total_used() + heap.total_free(), 600);
}

#[test]
fn a_truncated_header_stops_cleanly_at_the_last_boundary() {
    let mut w = TraceWriter::new();
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    let clean_len = w.as_bytes().len();
    w.raw(&[0x16, 0xAA, 0xBB]); // the first bytes of a header that never finishes

    let snapshot = replay_to_final(w.as_bytes());
    assert_eq!(snapshot.events.len(), 2);
    assert_eq!(snapshot.next_idx, clean_len);
}

#[test]
fn a_truncated_name_record_stops_cleanly() {
    let mut w = TraceWriter::new();
    brk(&mut w, 100, BASE);
    let clean_len = w.as_bytes().len();
    w.raw(&[0x00, 0xFF, 0xFF, b'x']); // claims 65535 bytes, provides one

    let snapshot = replay_to_final(w.as_bytes());
    assert_eq!(snapshot.next_idx, clean_len);
    assert!(snapshot.context.file_names.is_empty());
}

#[test]
fn brk_events_list_is_the_brk_subset_of_events() {
    let mut w = TraceWriter::new();
    brk(&mut w, 100, BASE);
    brk(&mut w, 200, BASE + 1_000);
    malloc(&mut w, 300, BASE, 100);
    brk(&mut w, 400, BASE + 2_000);
    let snapshot = replay_to_final(w.as_bytes());

    let brk_subset: Vec<_> =
        snapshot.events.iter().filter(|e| e.operation == Operation::Brk).cloned().collect();
    assert_eq!(snapshot.brk_events, brk_subset);
    assert_eq!(snapshot.brk_events.len(), 3);
    assert_eq!(snapshot.context.brk_event_count, 3);
}
