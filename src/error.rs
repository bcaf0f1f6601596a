use thiserror::Error;

use crate::types::{BufferId, SegmentId};

/// Error type returned by a stream encoder implementation.
pub type EncoderError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type for stream buffer operations
#[derive(Debug, Error)]
pub enum BufferError {
    /// An argument failed validation at the call boundary; the engine
    /// state is unchanged.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A segment id outside the buffer's pool was supplied.
    #[error("segment {segment} out of bounds for buffer {buffer} ({count} segments)")]
    OutOfBounds {
        buffer: BufferId,
        segment: SegmentId,
        count: u32,
    },

    /// The operation is not permitted in the segment's current state;
    /// the engine state is unchanged.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// The shared control element failed validation. The segment has been
    /// purged and its data discarded; the buffer remains usable.
    #[error("control element corrupted: {0}")]
    Corruption(String),

    /// The pool is exhausted and the retry budget is spent. The condition
    /// is retryable once other callers release segments.
    #[error("stream buffer exhausted, operation in progress")]
    OperationInProgress,

    /// The backing memory region could not be created or committed.
    #[error("{message}")]
    Platform {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A stream encoder failed while materializing or rehydrating a
    /// segment.
    #[error("encoder failed: {0}")]
    Encoder(#[source] EncoderError),
}
