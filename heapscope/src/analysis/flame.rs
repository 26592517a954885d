//! Flame graph construction
//!
//! Aggregates event call-stack paths into a tree rooted at "root". Each
//! frame ID resolves to a `func (file:line)` label; paths are walked
//! outermost-first so the root holds the outermost callers. Node values
//! distribute the root's fixed total proportionally to visit counts.

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;

use crate::frames::FrameTable;
use crate::trace_data::Event;

/// Value assigned to the root node; children split it by visit share.
pub const ROOT_VALUE: f64 = 1_000.0;

/// One node of the serialised flame graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlameNode {
    pub name: String,
    pub id: u32,
    pub value: f64,
    pub children: Vec<FlameNode>,
}

#[derive(Default)]
struct Builder {
    name: String,
    id: u32,
    count: u64,
    children: Vec<Builder>,
    by_name: HashMap<String, usize>,
}

/// Build the flame graph for `events`, resolving frame IDs through `frames`.
#[must_use]
pub fn build_flame_graph(events: &[Event], frames: &FrameTable) -> FlameNode {
    let mut root = Builder { name: "root".into(), ..Builder::default() };
    let mut next_id = 1u32;

    for event in events {
        if event.callstack_path.is_empty() {
            continue;
        }
        root.count += 1;

        let mut node = &mut root;
        // Paths are innermost-first; the graph grows from the outermost
        // caller down.
        for &frame_id in event.callstack_path.iter().rev() {
            let label = frame_label(frames, frame_id);
            let idx = if let Some(&idx) = node.by_name.get(&label) {
                idx
            } else {
                let idx = node.children.len();
                node.children.push(Builder { name: label.clone(), id: next_id, ..Builder::default() });
                next_id += 1;
                node.by_name.insert(label, idx);
                idx
            };
            node = &mut node.children[idx];
            node.count += 1;
        }
    }

    assign_values(root, ROOT_VALUE)
}

fn frame_label(frames: &FrameTable, frame_id: u32) -> String {
    frames.lookup(frame_id).map_or_else(
        || format!("<unknown_frame_{frame_id}>"),
        |frame| {
            let file = Path::new(&frame.file)
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or(frame.file.as_str());
            format!("{} ({}:{})", frame.func, file, frame.line)
        },
    )
}

#[allow(clippy::cast_precision_loss)]
fn assign_values(node: Builder, value: f64) -> FlameNode {
    let total: u64 = node.children.iter().map(|c| c.count).sum();
    let children = node
        .children
        .into_iter()
        .map(|child| {
            let share = if total > 0 {
                round2(value * (child.count as f64 / total as f64))
            } else {
                0.0
            };
            assign_values(child, share)
        })
        .collect();
    FlameNode { name: node.name, id: node.id, value, children }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
