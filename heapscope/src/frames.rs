//! Stack-frame interning
//!
//! Stack frames repeat heavily across a trace. Interning each distinct
//! `(file, func, line, col)` tuple to a dense integer ID keeps events small
//! and makes flame-graph aggregation O(1) per node.
//!
//! IDs are allocated from 0 in insertion order and never reused, so the
//! forward side of the table is a plain `Vec`. The reverse index exists only
//! to answer "seen before?" during decoding; it is not persisted and is
//! rebuilt from the forward list when a table is restored from a snapshot.

use std::collections::HashMap;
use std::fmt;

use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One source location in a captured call stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackFrame {
    pub file: String,
    pub func: String,
    pub line: i32,
    pub col: i32,
}

/// Bidirectional frame ↔ dense-ID table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameTable {
    frames: Vec<StackFrame>,
    index: HashMap<StackFrame, u32>,
}

impl FrameTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the ID for `frame`, allocating the next unused ID on first
    /// sight. Equal frames always map to the same ID.
    ///
    /// # Panics
    /// Panics if more than `u32::MAX` distinct frames are interned.
    pub fn intern(&mut self, frame: StackFrame) -> u32 {
        if let Some(&id) = self.index.get(&frame) {
            return id;
        }
        let id = u32::try_from(self.frames.len()).expect("frame table overflow");
        self.index.insert(frame.clone(), id);
        self.frames.push(frame);
        id
    }

    #[must_use]
    pub fn lookup(&self, id: u32) -> Option<&StackFrame> {
        self.frames.get(id as usize)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Iterate `(id, frame)` pairs in ID order.
    #[allow(clippy::cast_possible_truncation)]
    pub fn iter(&self) -> impl Iterator<Item = (u32, &StackFrame)> {
        self.frames.iter().enumerate().map(|(id, frame)| (id as u32, frame))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn from_frames(frames: Vec<StackFrame>) -> Self {
        let index = frames
            .iter()
            .enumerate()
            .map(|(id, frame)| (frame.clone(), id as u32))
            .collect();
        Self { frames, index }
    }
}

// Only the forward list is persisted; the reverse index is derived state and
// must come back identical for IDs to stay stable across save/restore.
impl Serialize for FrameTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.frames.len()))?;
        for frame in &self.frames {
            seq.serialize_element(frame)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for FrameTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FrameSeq;

        impl<'de> Visitor<'de> for FrameSeq {
            type Value = FrameTable;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a sequence of stack frames")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut frames = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(frame) = seq.next_element()? {
                    frames.push(frame);
                }
                Ok(FrameTable::from_frames(frames))
            }
        }

        deserializer.deserialize_seq(FrameSeq)
    }
}
