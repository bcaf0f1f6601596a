use crate::encoder::StreamEncoder;
use crate::types::{StoreId, StreamId};

/// Entry size values with this bit set describe variable-sized streams;
/// the remaining bits carry the block size hint.
pub const VARIABLE_ENTRY_SIZE_FLAG: u32 = 0x8000_0000;

/// Encodes the entry size for a variable-sized stream from its block
/// size hint.
pub const fn make_variable_entry_size(size_hint: u32) -> u32 {
    size_hint | VARIABLE_ENTRY_SIZE_FLAG
}

/// Describes the type of entries in a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTypeDescriptor {
    /// Entry size in bytes, or an encoded size hint for variable-sized
    /// streams (see [`make_variable_entry_size`]).
    pub entry_size: u32,

    /// Entries are temporally ordered: each entry starts with a 48-bit
    /// monotonically increasing cycle counter. Requires a fixed entry
    /// size of at least 8 bytes.
    pub temporal_order: bool,
}

impl StreamTypeDescriptor {
    pub const fn fixed(entry_size: u32) -> Self {
        Self {
            entry_size,
            temporal_order: false,
        }
    }

    pub const fn temporal(entry_size: u32) -> Self {
        Self {
            entry_size,
            temporal_order: true,
        }
    }

    pub const fn variable(size_hint: u32) -> Self {
        Self {
            entry_size: make_variable_entry_size(size_hint),
            temporal_order: false,
        }
    }

    pub const fn is_variable(&self) -> bool {
        (self.entry_size & VARIABLE_ENTRY_SIZE_FLAG) != 0
    }

    /// Entry size used for buffer length computations: the real size for
    /// fixed-size streams, the block size hint for variable ones.
    pub const fn effective_entry_size(&self) -> usize {
        (self.entry_size & !VARIABLE_ENTRY_SIZE_FLAG) as usize
    }
}

/// Stream-layer capability the buffer engine depends on.
///
/// The engine never owns streams; it holds references to resolve the
/// owner identity of a segment and to reach the stream's encoder.
pub trait TraceStream: Send + Sync {
    fn id(&self) -> StreamId;

    /// The store this stream lives in; part of the standby cache key.
    fn store(&self) -> StoreId;

    fn stream_type(&self) -> StreamTypeDescriptor;

    fn encoder(&self) -> &dyn StreamEncoder;
}
