//! Wire format shared by the heap-trace recorder and the offline analyzer.
//!
//! A trace is a flat stream of self-delimited records. The first byte of each
//! record selects its kind:
//!
//! - [`FILE_NAME_RECORD`] / [`FUNC_NAME_RECORD`]: a string-table entry, a
//!   `u16` little-endian length followed by that many UTF-8 bytes. Entries
//!   are appended to the file-name or function-name table in order; frame
//!   records refer to them by index.
//! - anything else: an event header ([`EVENT_HEADER_SIZE`] bytes) followed by
//!   `depth` stack frames ([`STACK_FRAME_SIZE`] bytes each).
//!
//! The event tag byte packs the operation code and the call/return direction:
//! `op_code = tag >> 1`, `is_return = tag & 1` (see [`split_tag`]).

use byteorder::{LittleEndian, WriteBytesExt};

/// Record tag for a file-name string-table entry.
pub const FILE_NAME_RECORD: u8 = 0x00;
/// Record tag for a function-name string-table entry.
pub const FUNC_NAME_RECORD: u8 = 0x01;

/// Size of an event header: `u8 tag | u32 tid | u64 arg1 | u64 arg2 |
/// i64 timestamp | u16 depth`, little-endian, unpadded.
pub const EVENT_HEADER_SIZE: usize = 31;

/// Size of one stack frame: `u32 file_idx | u32 func_idx | i32 line |
/// i32 col`, little-endian.
pub const STACK_FRAME_SIZE: usize = 16;

/// Operations the recorder instruments.
///
/// The discriminant is the on-wire operation code. Codes outside this table
/// decode to `None` and are treated by consumers as unknown single-record
/// operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Unknown = 0,
    Brk = 1,
    Sbrk = 2,
    Mmap = 3,
    Munmap = 4,
    Clone = 5,
    Clone3 = 6,
    Fork = 7,
    Vfork = 8,
    Execve = 9,
    Free = 10,
    Malloc = 11,
    Calloc = 12,
    Realloc = 13,
    Valloc = 14,
    PosixMemalign = 15,
    AlignedAlloc = 16,
    New = 17,
    NewArray = 18,
    DeleteLegacy = 19,
    Delete = 20,
    DeleteArray = 21,
}

/// What an operation does to the heap, for operations the analyzer models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Alloc,
    Free,
    Brk,
}

impl OpCode {
    /// Decode an on-wire operation code. Out-of-table codes yield `None`.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Unknown,
            1 => Self::Brk,
            2 => Self::Sbrk,
            3 => Self::Mmap,
            4 => Self::Munmap,
            5 => Self::Clone,
            6 => Self::Clone3,
            7 => Self::Fork,
            8 => Self::Vfork,
            9 => Self::Execve,
            10 => Self::Free,
            11 => Self::Malloc,
            12 => Self::Calloc,
            13 => Self::Realloc,
            14 => Self::Valloc,
            15 => Self::PosixMemalign,
            16 => Self::AlignedAlloc,
            17 => Self::New,
            18 => Self::NewArray,
            19 => Self::DeleteLegacy,
            20 => Self::Delete,
            21 => Self::DeleteArray,
            _ => return None,
        })
    }

    /// Whether the operation is recorded as a call/return pair. The event is
    /// only complete once the return record arrives.
    #[must_use]
    pub fn needs_return(self) -> bool {
        !matches!(self, Self::Free | Self::DeleteLegacy | Self::Delete | Self::DeleteArray)
    }

    /// The heap effect of this operation, if the analyzer models one.
    #[must_use]
    pub fn category(self) -> Option<Category> {
        match self {
            Self::Malloc | Self::Calloc | Self::Valloc | Self::Realloc | Self::New
            | Self::NewArray => Some(Category::Alloc),
            Self::Free | Self::DeleteLegacy | Self::Delete | Self::DeleteArray => {
                Some(Category::Free)
            }
            Self::Brk => Some(Category::Brk),
            _ => None,
        }
    }

    /// True for the C++ operator new/delete family (`--skip-cpp` filtering).
    #[must_use]
    pub fn is_cpp_operator(self) -> bool {
        matches!(
            self,
            Self::New | Self::NewArray | Self::DeleteLegacy | Self::Delete | Self::DeleteArray
        )
    }

    /// Human-readable operation name for diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Brk => "BRK",
            Self::Sbrk => "SBRK",
            Self::Mmap => "MMAP",
            Self::Munmap => "MUNMAP",
            Self::Clone => "CLONE",
            Self::Clone3 => "CLONE3",
            Self::Fork => "FORK",
            Self::Vfork => "VFORK",
            Self::Execve => "EXECVE",
            Self::Free => "FREE",
            Self::Malloc => "MALLOC",
            Self::Calloc => "CALLOC",
            Self::Realloc => "REALLOC",
            Self::Valloc => "VALLOC",
            Self::PosixMemalign => "POSIX_MEMALIGN",
            Self::AlignedAlloc => "ALIGNED_ALLOC",
            Self::New => "NEW",
            Self::NewArray => "NEW[]",
            Self::DeleteLegacy => "DELETE_LEGACY",
            Self::Delete => "DELETE",
            Self::DeleteArray => "DELETE[]",
        }
    }
}

/// Split an event tag byte into `(op_code, is_return)`.
#[must_use]
pub fn split_tag(tag: u8) -> (u8, bool) {
    (tag >> 1, tag & 1 == 1)
}

/// Pack an operation code and direction into a tag byte.
#[must_use]
pub fn make_tag(code: u8, is_return: bool) -> u8 {
    (code << 1) | u8::from(is_return)
}

/// One stack frame as it appears on the wire. Indexes refer to the
/// string tables accumulated from name records earlier in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRecord {
    pub file_idx: u32,
    pub func_idx: u32,
    pub line: i32,
    pub col: i32,
}

/// Appends well-formed records to an in-memory trace buffer.
///
/// The recorder uses this to emit the stream; the analyzer's tests use it to
/// build synthetic traces.
#[derive(Debug, Default)]
pub struct TraceWriter {
    buf: Vec<u8>,
}

impl TraceWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a file-name string-table entry.
    ///
    /// # Panics
    /// Panics if the name is longer than `u16::MAX` bytes.
    pub fn file_name(&mut self, name: &str) -> &mut Self {
        self.name_record(FILE_NAME_RECORD, name);
        self
    }

    /// Append a function-name string-table entry.
    ///
    /// # Panics
    /// Panics if the name is longer than `u16::MAX` bytes.
    pub fn func_name(&mut self, name: &str) -> &mut Self {
        self.name_record(FUNC_NAME_RECORD, name);
        self
    }

    fn name_record(&mut self, tag: u8, name: &str) {
        let bytes = name.as_bytes();
        let len = u16::try_from(bytes.len()).expect("name longer than u16::MAX bytes");
        self.buf.push(tag);
        self.buf.write_u16::<LittleEndian>(len).expect("vec write");
        self.buf.extend_from_slice(bytes);
    }

    /// Append an event header plus its stack frames.
    ///
    /// # Panics
    /// Panics if more than `u16::MAX` frames are supplied.
    pub fn event(
        &mut self,
        op: u8,
        is_return: bool,
        tid: u32,
        arg1: u64,
        arg2: u64,
        timestamp: i64,
        frames: &[FrameRecord],
    ) -> &mut Self {
        self.buf.push(make_tag(op, is_return));
        self.buf.write_u32::<LittleEndian>(tid).expect("vec write");
        self.buf.write_u64::<LittleEndian>(arg1).expect("vec write");
        self.buf.write_u64::<LittleEndian>(arg2).expect("vec write");
        self.buf.write_i64::<LittleEndian>(timestamp).expect("vec write");
        let depth = u16::try_from(frames.len()).expect("more than u16::MAX frames");
        self.buf.write_u16::<LittleEndian>(depth).expect("vec write");
        for frame in frames {
            self.buf.write_u32::<LittleEndian>(frame.file_idx).expect("vec write");
            self.buf.write_u32::<LittleEndian>(frame.func_idx).expect("vec write");
            self.buf.write_i32::<LittleEndian>(frame.line).expect("vec write");
            self.buf.write_i32::<LittleEndian>(frame.col).expect("vec write");
        }
        self
    }

    /// Append raw bytes verbatim. Used by tests to craft malformed streams.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trip() {
        for code in 0..=21u8 {
            for is_return in [false, true] {
                let tag = make_tag(code, is_return);
                assert_eq!(split_tag(tag), (code, is_return));
            }
        }
    }

    #[test]
    fn out_of_table_codes_decode_to_none() {
        assert!(OpCode::from_code(22).is_none());
        assert!(OpCode::from_code(127).is_none());
        assert_eq!(OpCode::from_code(21), Some(OpCode::DeleteArray));
    }

    #[test]
    fn only_single_record_ops_skip_the_return() {
        let single: Vec<OpCode> = (0..=21)
            .filter_map(OpCode::from_code)
            .filter(|op| !op.needs_return())
            .collect();
        assert_eq!(
            single,
            vec![OpCode::Free, OpCode::DeleteLegacy, OpCode::Delete, OpCode::DeleteArray]
        );
    }

    #[test]
    fn categories_match_operation_families() {
        assert_eq!(OpCode::Malloc.category(), Some(Category::Alloc));
        assert_eq!(OpCode::Calloc.category(), Some(Category::Alloc));
        assert_eq!(OpCode::NewArray.category(), Some(Category::Alloc));
        assert_eq!(OpCode::Free.category(), Some(Category::Free));
        assert_eq!(OpCode::DeleteArray.category(), Some(Category::Free));
        assert_eq!(OpCode::Brk.category(), Some(Category::Brk));
        assert_eq!(OpCode::Sbrk.category(), None);
        assert_eq!(OpCode::Mmap.category(), None);
        assert_eq!(OpCode::Unknown.category(), None);
    }

    #[test]
    fn writer_produces_fixed_size_headers() {
        let mut writer = TraceWriter::new();
        writer.event(11, false, 7, 64, 0, 1_000, &[]);
        assert_eq!(writer.as_bytes().len(), EVENT_HEADER_SIZE);

        let frame = FrameRecord { file_idx: 0, func_idx: 0, line: 12, col: 4 };
        writer.event(11, true, 7, 0x5000, 0, 1_010, &[frame]);
        assert_eq!(writer.as_bytes().len(), EVENT_HEADER_SIZE * 2 + STACK_FRAME_SIZE);
    }

    #[test]
    fn writer_encodes_name_records() {
        let bytes = {
            let mut writer = TraceWriter::new();
            writer.file_name("a.c");
            writer.into_bytes()
        };
        assert_eq!(bytes, vec![FILE_NAME_RECORD, 3, 0, b'a', b'.', b'c']);
    }
}
