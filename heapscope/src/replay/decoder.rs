//! Trace decoder and snapshot controller
//!
//! [`TraceReplay`] walks the decompressed trace buffer strictly forward,
//! decoding string-table records and event records, pairing call/return
//! operations per thread, and applying alloc/free/brk effects to the
//! fragment map. It is a pull-driven iterator over [`Snapshot`]s: whenever
//! the next event's timestamp would pass the next requested target, the
//! replay rewinds to the start of that event, yields a snapshot, and resumes
//! from the exact same record on the next call. The last snapshot is always
//! the `final` one, positioned at the last cleanly decoded boundary.
//!
//! Malformed input never aborts: truncated records stop decoding with a
//! warning, unmatched returns are dropped, frees of unknown addresses are
//! ignored (recording routinely starts mid-run).

// Offsets mix u64 addresses and i64 brk deltas; conversions are deliberate.
#![allow(clippy::cast_possible_wrap, clippy::cast_precision_loss)]

use std::collections::VecDeque;
use std::io;

use byteorder::{LittleEndian, ReadBytesExt};
use heapscope_common::{
    split_tag, Category, OpCode, EVENT_HEADER_SIZE, FILE_NAME_RECORD, FUNC_NAME_RECORD,
    STACK_FRAME_SIZE,
};
use log::{info, warn};

use crate::fragments::Patch;
use crate::frames::StackFrame;
use crate::replay::context::{AllocMeta, PendingCall, ReplayContext};
use crate::replay::snapshot::{Snapshot, SnapshotLabel};
use crate::replay::ReplayConfig;
use crate::trace_data::{Event, FragSample, Operation};

/// Run-wide totals from the trace metadata, used only for progress logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressTotals {
    pub total_records: u64,
    pub total_duration: i64,
}

#[derive(Debug, Clone, Copy)]
struct EventHeader {
    tag: u8,
    tid: u32,
    arg1: u64,
    arg2: u64,
    timestamp: i64,
    depth: u16,
}

impl EventHeader {
    fn decode(mut r: &[u8]) -> io::Result<Self> {
        Ok(Self {
            tag: r.read_u8()?,
            tid: r.read_u32::<LittleEndian>()?,
            arg1: r.read_u64::<LittleEndian>()?,
            arg2: r.read_u64::<LittleEndian>()?,
            timestamp: r.read_i64::<LittleEndian>()?,
            depth: r.read_u16::<LittleEndian>()?,
        })
    }
}

/// The replay engine: single-threaded, cooperative, strictly forward.
pub struct TraceReplay<'a> {
    buf: &'a [u8],
    cfg: ReplayConfig,
    totals: ProgressTotals,

    ctx: ReplayContext,
    events: Vec<Event>,
    fragmentation: Vec<FragSample>,
    brk_events: Vec<Event>,

    /// Remaining snapshot targets, ascending. The implicit `final` target
    /// is always appended by the engine itself.
    targets: VecDeque<i64>,
    next_idx: usize,
    done: bool,
}

impl<'a> TraceReplay<'a> {
    /// Start a replay from the beginning of `buf`.
    #[must_use]
    pub fn new(buf: &'a [u8], cfg: ReplayConfig, targets: &[i64]) -> Self {
        let mut sorted = targets.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        Self {
            buf,
            cfg,
            totals: ProgressTotals::default(),
            ctx: ReplayContext::new(),
            events: Vec::new(),
            fragmentation: Vec::new(),
            brk_events: Vec::new(),
            targets: sorted.into(),
            next_idx: 0,
            done: false,
        }
    }

    /// Continue a replay from a previously taken snapshot of the same trace.
    ///
    /// Targets at or before the snapshot's own timestamp are discarded; the
    /// replay picks up at the snapshot's resume offset with its accumulated
    /// state.
    #[must_use]
    pub fn resume(buf: &'a [u8], cfg: ReplayConfig, snapshot: Snapshot, targets: &[i64]) -> Self {
        let mut replay = Self::new(buf, cfg, targets);
        if let SnapshotLabel::At(ts) = snapshot.label {
            replay.targets.retain(|&t| t > ts);
        }
        replay.ctx = snapshot.context;
        replay.events = snapshot.events;
        replay.fragmentation = snapshot.fragmentation;
        replay.brk_events = snapshot.brk_events;
        replay.next_idx = snapshot.next_idx;
        replay
    }

    #[must_use]
    pub fn with_progress_totals(mut self, totals: ProgressTotals) -> Self {
        self.totals = totals;
        self
    }

    /// Decode until the next snapshot target is crossed or the buffer ends.
    ///
    /// Returns `None` once the `final` snapshot has been yielded.
    pub fn next_snapshot(&mut self) -> Option<Snapshot> {
        if self.done {
            return None;
        }

        while self.next_idx < self.buf.len() {
            let record_start = self.next_idx;
            let tag = self.buf[record_start];

            if tag == FILE_NAME_RECORD || tag == FUNC_NAME_RECORD {
                if !self.decode_name_record(tag) {
                    break;
                }
                continue;
            }

            let Ok(header) = EventHeader::decode(&self.buf[record_start..]) else {
                warn!("Trace ends mid event header at byte {record_start}; stopping");
                break;
            };

            if let Some(&target) = self.targets.front() {
                if header.timestamp > target {
                    self.targets.pop_front();
                    // next_idx still points at this record, so decoding
                    // resumes here after the caller is done with the
                    // snapshot.
                    return Some(self.snapshot(SnapshotLabel::At(target)));
                }
            }

            self.ctx.records_seen += 1;
            self.log_progress(header.timestamp);
            self.next_idx = record_start + EVENT_HEADER_SIZE;
            let stack = self.decode_stack(header.depth);
            self.handle_record(&header, stack);
        }

        self.done = true;
        Some(self.snapshot(SnapshotLabel::Final))
    }

    fn snapshot(&self, label: SnapshotLabel) -> Snapshot {
        Snapshot {
            label,
            events: self.events.clone(),
            fragmentation: self.fragmentation.clone(),
            brk_events: self.brk_events.clone(),
            layout: self.ctx.heap.layout(self.ctx.brk_base, self.ctx.current_brk),
            context: self.ctx.clone(),
            next_idx: self.next_idx,
        }
    }

    /// Decode a string-table record. Returns false when the buffer ends
    /// inside it, leaving `next_idx` at the record start.
    fn decode_name_record(&mut self, tag: u8) -> bool {
        let start = self.next_idx;
        let Ok(len) = (&self.buf[start + 1..]).read_u16::<LittleEndian>() else {
            warn!("Trace ends mid name-record length at byte {start}; stopping");
            return false;
        };
        let end = start + 3 + len as usize;
        let Some(bytes) = self.buf.get(start + 3..end) else {
            warn!("Trace ends mid name-record at byte {start}; stopping");
            return false;
        };
        let name = String::from_utf8_lossy(bytes).into_owned();
        if tag == FILE_NAME_RECORD {
            self.ctx.file_names.push(name);
        } else {
            self.ctx.func_names.push(name);
        }
        self.next_idx = end;
        true
    }

    /// Decode, resolve and intern `depth` frames. A frame cut off by the end
    /// of the buffer drops the whole partial stack, matching the recorder's
    /// all-or-nothing capture.
    fn decode_stack(&mut self, depth: u16) -> Vec<u32> {
        let mut path = Vec::with_capacity(depth as usize);
        for _ in 0..depth {
            let mut r = &self.buf[self.next_idx..];
            let frame = (|| -> io::Result<StackFrame> {
                let file_idx = r.read_u32::<LittleEndian>()?;
                let func_idx = r.read_u32::<LittleEndian>()?;
                let line = r.read_i32::<LittleEndian>()?;
                let col = r.read_i32::<LittleEndian>()?;
                Ok(StackFrame {
                    file: self.ctx.file_name(file_idx),
                    func: self.ctx.func_name(func_idx),
                    line,
                    col,
                })
            })();
            let Ok(frame) = frame else {
                warn!(
                    "Trace ends mid stack frame at byte {} (record {}); dropping partial stack",
                    self.next_idx, self.ctx.records_seen
                );
                path.clear();
                break;
            };
            path.push(self.ctx.frames.intern(frame));
            self.next_idx += STACK_FRAME_SIZE;
        }

        if self.cfg.callstack_depth >= 0 {
            path.truncate(self.cfg.callstack_depth.unsigned_abs() as usize);
        }
        path
    }

    fn handle_record(&mut self, header: &EventHeader, stack: Vec<u32>) {
        let (code, is_return) = split_tag(header.tag);
        let op = OpCode::from_code(code);

        if self.cfg.skip_cpp && op.is_some_and(OpCode::is_cpp_operator) {
            return;
        }

        let ts = header.timestamp;
        let needs_return = op.is_some_and(OpCode::needs_return);

        // Single-record operations complete immediately.
        if !is_return && !needs_return {
            match op.and_then(OpCode::category) {
                Some(Category::Alloc) => self.handle_alloc(ts, header.arg2, header.arg1, stack),
                Some(Category::Free) => self.handle_free(ts, header.arg1, stack),
                _ => {}
            }
            return;
        }

        let key = (header.tid, code);
        if !is_return {
            self.ctx.pending_calls.insert(
                key,
                PendingCall {
                    arg1: header.arg1,
                    arg2: header.arg2,
                    invoked_at: ts,
                    callstack_path: stack,
                },
            );
            return;
        }

        let Some(call) = self.ctx.pending_calls.remove(&key) else {
            warn!(
                "Unmatched return record (tag {}, tid {}, op {}); dropping",
                header.tag,
                header.tid,
                op.map_or("out-of-table", OpCode::name)
            );
            return;
        };

        // Paired operations carry the call-time stack; combine arguments per
        // operation semantics.
        match op {
            Some(OpCode::Realloc) => {
                self.handle_free(ts, call.arg1, call.callstack_path.clone());
                self.handle_alloc(ts, header.arg1, call.arg2, call.callstack_path);
            }
            Some(OpCode::Calloc) => {
                self.handle_alloc(
                    ts,
                    header.arg1,
                    call.arg1.saturating_mul(call.arg2),
                    call.callstack_path,
                );
            }
            Some(OpCode::Brk) => {
                self.handle_brk(ts, header.arg1, call.callstack_path);
            }
            Some(other) => match other.category() {
                Some(Category::Alloc) => {
                    self.handle_alloc(ts, header.arg1, call.arg1, call.callstack_path);
                }
                Some(Category::Free) => {
                    self.handle_free(ts, call.arg1, call.callstack_path);
                }
                _ => {}
            },
            None => {}
        }
    }

    fn handle_alloc(&mut self, ts: i64, addr: u64, size: u64, stack: Vec<u32>) {
        if size == 0 {
            return;
        }
        let event = Event::at_address(Operation::Alloc, ts, addr, size, stack, self.ctx.brk_base);
        self.events.push(event);
        self.ctx
            .alloc_meta
            .insert(addr, AllocMeta { allocated_at: ts, event_idx: self.events.len() - 1 });
        self.ctx.active_allocs.insert(addr, size);

        if self.ctx.in_brk_heap(addr) {
            self.ctx.heap.update(addr, size, Patch::Used);
            self.fragmentation.push(self.ctx.heap.ratios(ts, self.ctx.brk_base));
        }
    }

    fn handle_free(&mut self, ts: i64, addr: u64, stack: Vec<u32>) {
        let size = self.ctx.active_allocs.get(&addr).copied().unwrap_or(0);
        if size == 0 {
            // No matching allocation on record; recording may have started
            // after it happened.
            return;
        }

        let meta = self.ctx.alloc_meta.remove(&addr);
        let mut event = Event::at_address(Operation::Free, ts, addr, size, stack, self.ctx.brk_base);
        event.alloc_at = meta.map(|m| m.allocated_at);
        self.events.push(event);

        if let Some(meta) = meta {
            if let Some(alloc_event) = self.events.get_mut(meta.event_idx) {
                alloc_event.free_at = Some(ts);
            }
        }

        if self.ctx.in_brk_heap(addr) {
            self.ctx.heap.update(addr, size, Patch::Free);
            self.fragmentation.push(self.ctx.heap.ratios(ts, self.ctx.brk_base));
        }
        self.ctx.active_allocs.remove(&addr);
    }

    fn handle_brk(&mut self, ts: i64, new_brk: u64, stack: Vec<u32>) {
        let base = *self.ctx.brk_base.get_or_insert(new_brk);
        let previous = self.ctx.current_brk.unwrap_or(new_brk);
        self.ctx.current_brk = Some(new_brk);

        if new_brk > previous {
            // Fresh break memory enters the map as free.
            self.ctx.heap.update(previous, new_brk - previous, Patch::Free);
        } else if new_brk < previous {
            self.ctx.heap.update(new_brk, previous - new_brk, Patch::Remove);
        }

        let event = Event {
            time: ts,
            operation: Operation::Brk,
            range: format!("{}-{}", previous as i64 - base as i64, new_brk as i64 - base as i64),
            size: new_brk as i64 - previous as i64,
            callstack_path: stack,
            alloc_at: None,
            free_at: None,
            fragmentation_ratio: None,
            free_ratio: None,
            impact_score: None,
        };
        self.events.push(event.clone());
        self.brk_events.push(event);
        self.ctx.brk_event_count += 1;
        self.fragmentation.push(self.ctx.heap.ratios(ts, self.ctx.brk_base));
    }

    fn log_progress(&self, ts: i64) {
        if self.cfg.log_interval == 0 || self.ctx.records_seen % self.cfg.log_interval != 0 {
            return;
        }

        let records = if self.totals.total_records > 0 {
            let pct = self.ctx.records_seen as f64 / self.totals.total_records as f64 * 100.0;
            format!("trace: {}/{} ({pct:.1}%)", self.ctx.records_seen, self.totals.total_records)
        } else {
            format!("trace: {}", self.ctx.records_seen)
        };
        let time = if self.totals.total_duration > 0 {
            let pct = ts as f64 / self.totals.total_duration as f64 * 100.0;
            format!("time: {}/{} ({pct:.1}%)", ts / 1_000_000, self.totals.total_duration / 1_000_000)
        } else {
            format!("time: {ts}")
        };
        info!("{records} | {time}");
    }
}

impl Iterator for TraceReplay<'_> {
    type Item = Snapshot;

    fn next(&mut self) -> Option<Snapshot> {
        self.next_snapshot()
    }
}
