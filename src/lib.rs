//! Server-side stream buffer and segment lifecycle engine for recording
//! and replaying very large execution traces.
//!
//! Trace data moves in large fixed-size segments backed by one contiguous
//! memory region per buffer, optionally a file-backed mapping shared with
//! the client process. The engine owns the segment pool, hands segments
//! to writers and readers under concurrency, keeps recently closed
//! read-only segments in a standby LRU for fast re-opens, and calls out
//! to per-stream [`StreamEncoder`]s to persist and rehydrate segment
//! contents. Control metadata shared with the client is protected by a
//! keyed integrity cookie.
//!
//! ```no_run
//! use tracebuf::StreamBufferBuilder;
//!
//! let buffer = StreamBufferBuilder::new(0)
//!     .segment_size(1024 * 1024)
//!     .num_segments(16)
//!     .build()
//!     .unwrap();
//! # let _ = buffer;
//! ```

mod buffer;
mod control;
mod encoder;
mod error;
mod metrics;
mod pool;
mod segment;
mod standby;
mod stream;
pub(crate) mod sync;
mod types;


pub use buffer::StreamBuffer;
pub use control::{SegmentControlElement, CONTROL_ELEMENT_SIZE};
pub use encoder::{StorageLocation, StreamEncoder, StreamRangeInfo};
pub use error::{BufferError, EncoderError};
pub use metrics::{BufferMetrics, Counter, Gauge};
pub use stream::{
    make_variable_entry_size, StreamTypeDescriptor, TraceStream, VARIABLE_ENTRY_SIZE_FLAG,
};
pub use types::{
    timestamp_now, BufferId, CycleCount, SegmentId, SequenceNumber, StoreId, StreamAccessFlags,
    StreamId, StreamSegmentLink, StoreStreamSegmentLink, Timestamp, CYCLE_COUNT_BITS,
    CYCLE_COUNT_MASK, INVALID_BUFFER_ID, INVALID_CYCLE_COUNT, INVALID_ENTRY_INDEX,
    INVALID_SEGMENT_ID, INVALID_SEQUENCE_NUMBER, INVALID_STORE_ID, INVALID_STREAM_ID,
    INVALID_TIMESTAMP, MAX_SEGMENTS_PER_BUFFER,
};

use std::path::PathBuf;
use std::time::Duration;

const MIB: usize = 1024 * 1024;

/// Builder for constructing a [`StreamBuffer`] with custom configuration
pub struct StreamBufferBuilder {
    pub(crate) id: BufferId,
    pub(crate) segment_size: usize,
    pub(crate) num_segments: u32,
    pub(crate) shared: bool,
    pub(crate) shared_path: Option<PathBuf>,
    pub(crate) disable_cache: bool,
    pub(crate) retry_count: u32,
    pub(crate) retry_sleep: Duration,
}

impl StreamBufferBuilder {
    /// Create a new builder with default settings
    pub fn new(id: BufferId) -> Self {
        Self {
            id,
            segment_size: 64 * MIB,
            num_segments: 64,
            shared: false,
            shared_path: None,
            disable_cache: false,
            retry_count: 100,
            retry_sleep: Duration::from_millis(5000),
        }
    }

    /// Set the size of each segment payload in bytes
    ///
    /// Default is 64 MiB. Must be a nonzero multiple of 8.
    pub fn segment_size(mut self, size: usize) -> Self {
        self.segment_size = size;
        self
    }

    /// Set the number of segments in the pool
    ///
    /// Default is 64. This bounds the amount of trace data that can be
    /// live at the same time; exhaustion stalls writers until segments
    /// are released or evicted.
    pub fn num_segments(mut self, count: u32) -> Self {
        self.num_segments = count;
        self
    }

    /// Back the buffer with a created file mapped read-write, so the
    /// region can be attached by a client process. The file is placed
    /// under the system temp directory unless a path is supplied with
    /// [`shared_path`](Self::shared_path).
    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    /// Back the buffer with a file at the given path (implies shared).
    pub fn shared_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.shared = true;
        self.shared_path = Some(path.into());
        self
    }

    /// Skip standby caching entirely
    ///
    /// Freed segments return straight to the free list and every open
    /// goes to the encoder.
    pub fn disable_cache(mut self, disable: bool) -> Self {
        self.disable_cache = disable;
        self
    }

    /// Set the number of allocation retries on pool exhaustion
    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    /// Set the sleep between allocation retries on pool exhaustion
    pub fn retry_sleep(mut self, sleep: Duration) -> Self {
        self.retry_sleep = sleep;
        self
    }

    /// Build the stream buffer with the configured settings
    pub fn build(self) -> Result<StreamBuffer, BufferError> {
        StreamBuffer::from_builder(&self)
    }
}
