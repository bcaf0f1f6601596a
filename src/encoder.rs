use crate::buffer::StreamBuffer;
use crate::control::SegmentControlElement;
use crate::error::EncoderError;
use crate::types::{
    CycleCount, SegmentId, SequenceNumber, StreamAccessFlags, StreamSegmentLink, Timestamp,
    INVALID_CYCLE_COUNT, INVALID_ENTRY_INDEX, INVALID_TIMESTAMP,
};

/// Ranges covered by the entries of a persisted segment. The stream layer
/// builds its lookup indices from these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRangeInfo {
    pub start_index: u64,
    pub end_index: u64,

    pub start_cycle: CycleCount,
    pub end_cycle: CycleCount,

    pub start_time: Timestamp,
    pub end_time: Timestamp,
}

impl Default for StreamRangeInfo {
    fn default() -> Self {
        Self {
            start_index: INVALID_ENTRY_INDEX,
            end_index: INVALID_ENTRY_INDEX,
            start_cycle: INVALID_CYCLE_COUNT,
            end_cycle: INVALID_CYCLE_COUNT,
            start_time: INVALID_TIMESTAMP,
            end_time: INVALID_TIMESTAMP,
        }
    }
}

/// Summary of a persisted segment, returned by the encoder on write and
/// consumed by the engine to rehydrate a segment on read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocation {
    pub link: StreamSegmentLink,
    pub ranges: StreamRangeInfo,

    pub compressed_size: u64,
    pub raw_entry_count: u32,
}

impl StorageLocation {
    pub fn new(link: StreamSegmentLink) -> Self {
        Self {
            link,
            ranges: StreamRangeInfo::default(),
            compressed_size: 0,
            raw_entry_count: 0,
        }
    }

    /// Builds the location summarizing a submitted control element.
    pub fn from_control(control: &SegmentControlElement) -> Self {
        debug_assert!(control.raw_entry_count > 0);

        let mut ranges = StreamRangeInfo::default();
        if control.start_index != INVALID_ENTRY_INDEX {
            ranges.start_index = control.start_index;
            ranges.end_index = control.start_index + control.raw_entry_count as u64 - 1;
        }
        ranges.start_cycle = control.start_cycle;
        ranges.end_cycle = control.end_cycle;
        ranges.start_time = control.start_time;
        ranges.end_time = control.end_time;

        Self {
            link: control.link,
            ranges,
            compressed_size: 0,
            raw_entry_count: control.raw_entry_count,
        }
    }

    /// Number of entries covered by the index range; 0 when the segment
    /// is not index-addressed.
    pub fn entry_count(&self) -> u32 {
        if self.ranges.start_index == INVALID_ENTRY_INDEX {
            debug_assert!(self.ranges.end_index == INVALID_ENTRY_INDEX);
            return 0;
        }

        debug_assert!(self.ranges.start_index <= self.ranges.end_index);

        (self.ranges.end_index - self.ranges.start_index) as u32 + 1
    }
}

/// Per-stream-type capability that compresses segments to and
/// decompresses segments from durable storage.
///
/// Encoders may work asynchronously: `write` and `read` may return
/// `completed = false` and finalize out-of-band at the stream layer. The
/// engine guarantees that the segment id stays valid and stable from the
/// moment the call begins until the encoder finalizes.
///
/// Callbacks run while the engine holds internal locks; implementations
/// must not call back into the buffer's lifecycle operations from
/// `notify_segment_cache_closed`.
pub trait StreamEncoder: Send + Sync {
    /// Persists a submitted segment. Returns whether the operation
    /// completed synchronously and, if so, where the data went. A
    /// completed write without a location means the encoder discarded
    /// the data.
    fn write(
        &self,
        buffer: &StreamBuffer,
        segment: SegmentId,
    ) -> Result<(bool, Option<StorageLocation>), EncoderError>;

    /// Fills a segment with the data described by `location`. Returns
    /// whether the read completed synchronously; must complete when
    /// `flags` contains [`StreamAccessFlags::SYNCHRONOUS`].
    fn read(
        &self,
        buffer: &StreamBuffer,
        segment: SegmentId,
        flags: StreamAccessFlags,
        location: &StorageLocation,
        prefetch: bool,
    ) -> Result<bool, EncoderError>;

    /// Called when a submitted segment holds no entries; the stream will
    /// have a hole for this sequence number.
    fn drop_segment(&self, buffer: &StreamBuffer, segment: SegmentId);

    /// Called whenever a standby-cached segment of this stream is
    /// evicted, flushed or purged, so the encoder can release indices of
    /// its own.
    fn notify_segment_cache_closed(&self, sequence_number: SequenceNumber);
}
