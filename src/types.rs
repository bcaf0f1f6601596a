use clocksource::precise::UnixInstant;

/// Identifies a stream buffer within the server process.
pub type BufferId = u32;
/// Identifies a store served by this process.
pub type StoreId = u32;
/// Identifies a stream within its store.
pub type StreamId = u32;
/// Dense index of a segment slot in a buffer's pool.
pub type SegmentId = u32;
/// Ordinal of a segment within its stream.
pub type SequenceNumber = u32;
/// Simulation time, 48 bits of which are significant.
pub type CycleCount = u64;
/// Server wall-clock time in nanoseconds since the Unix epoch.
pub type Timestamp = u64;

pub const INVALID_BUFFER_ID: BufferId = u32::MAX;
pub const INVALID_STORE_ID: StoreId = u32::MAX;
pub const INVALID_STREAM_ID: StreamId = u32::MAX;
pub const INVALID_SEGMENT_ID: SegmentId = u32::MAX;
pub const INVALID_SEQUENCE_NUMBER: SequenceNumber = u32::MAX;
pub const INVALID_CYCLE_COUNT: CycleCount = u64::MAX;
pub const INVALID_TIMESTAMP: Timestamp = u64::MAX;
pub const INVALID_ENTRY_INDEX: u64 = u64::MAX;

/// Entries of temporally ordered streams start with a cycle counter of
/// this width; the remaining bits of the leading word belong to the entry.
pub const CYCLE_COUNT_BITS: u32 = 48;
pub const CYCLE_COUNT_MASK: CycleCount = (1 << CYCLE_COUNT_BITS) - 1;

/// Upper bound on the number of segments a single buffer may hold.
pub const MAX_SEGMENTS_PER_BUFFER: u32 = 4096;

/// Identifies a segment within its stream.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamSegmentLink {
    pub stream: StreamId,
    pub sequence_number: SequenceNumber,
}

impl StreamSegmentLink {
    pub const fn new(stream: StreamId, sequence_number: SequenceNumber) -> Self {
        Self {
            stream,
            sequence_number,
        }
    }

    pub const fn invalid() -> Self {
        Self {
            stream: INVALID_STREAM_ID,
            sequence_number: INVALID_SEQUENCE_NUMBER,
        }
    }
}

impl Default for StreamSegmentLink {
    fn default() -> Self {
        Self {
            stream: 0,
            sequence_number: 0,
        }
    }
}

/// Identifies a persisted segment across all stores served by this process.
/// Key of the standby cache index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreStreamSegmentLink {
    pub store: StoreId,
    pub link: StreamSegmentLink,
}

impl StoreStreamSegmentLink {
    pub const fn new(store: StoreId, stream: StreamId, sequence_number: SequenceNumber) -> Self {
        Self {
            store,
            link: StreamSegmentLink::new(stream, sequence_number),
        }
    }
}

/// Access hints supplied by readers when opening a segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamAccessFlags(u32);

impl StreamAccessFlags {
    pub const NONE: Self = Self(0);
    /// The caller reads the stream front to back and will not revisit
    /// closed segments.
    pub const SEQUENTIAL_SCAN: Self = Self(0x01);
    /// Data is accessed in random order; closed segments should not
    /// pollute the cache.
    pub const RANDOM_ACCESS: Self = Self(0x02);
    /// The read must complete before the open returns.
    pub const SYNCHRONOUS: Self = Self(0x04);

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for StreamAccessFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Current server time as recorded in control elements.
pub fn timestamp_now() -> Timestamp {
    UnixInstant::now()
        .duration_since(UnixInstant::EPOCH)
        .as_nanos()
}
