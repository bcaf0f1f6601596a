use std::sync::Arc;

use crate::control::SegmentControlElement;
use crate::stream::TraceStream;
use crate::sync::{AtomicBool, AtomicU32, AtomicU8, Mutex, Ordering};
use crate::types::{SegmentId, SequenceNumber, INVALID_SEGMENT_ID, INVALID_SEQUENCE_NUMBER};

/// Segment state bits. A free segment carries the empty bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentFlags(u8);

impl SegmentFlags {
    /// Segment is not in use and holds no data
    pub const FREE: Self = Self(0);

    /// Segment is in use or in the cache
    pub const IN_USE: Self = Self(1 << 0);
    /// Segment should not be written to
    pub const READ_ONLY: Self = Self(1 << 1);
    /// Segment is not associated with a stream. Caching disallowed.
    pub const SCRATCH: Self = Self(1 << 2);

    /// Segment is eligible for caching when freed
    pub const CACHEABLE: Self = Self(1 << 3);
    /// Segment may be reused early. For prefetched or random-access data
    pub const LOW_PRIORITY: Self = Self(1 << 4);

    /// Segment will be placed at the head of the standby list at first free
    pub const PREFETCH: Self = Self(1 << 5);

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }
}

impl std::ops::BitOr for SegmentFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Identity of the stream occupying a segment. The engine records it at
/// allocation and trusts it over whatever the client writes into the
/// shared control element.
struct SegmentOwner {
    stream: Option<Arc<dyn TraceStream>>,
    sequence_number: SequenceNumber,
}

/// Descriptor of one segment slot in the pool.
///
/// The intrusive `next`/`prev` links are indices into the pool's
/// descriptor slice: `next` threads both the free list and the standby
/// list, `prev` only the standby list. Links and flags are atomics so the
/// lock-free free list can manipulate them; standby link updates happen
/// under the standby mutex. The owner and the private control copy sit
/// behind leaf mutexes that are never held while acquiring another lock.
pub(crate) struct Segment {
    pub id: SegmentId,

    pub next: AtomicU32,
    pub prev: AtomicU32,

    flags: AtomicU8,
    submitted: AtomicBool,

    /// Serializes operations that cross the client/server trust boundary
    /// (submit, read-in, free, purge).
    pub op_lock: Mutex<()>,

    owner: Mutex<SegmentOwner>,

    /// Private copy of the segment's control element, authoritative once
    /// the segment is submitted or read-only.
    control: Mutex<SegmentControlElement>,
}

impl Segment {
    pub fn new(id: SegmentId) -> Self {
        Self {
            id,
            next: AtomicU32::new(INVALID_SEGMENT_ID),
            prev: AtomicU32::new(INVALID_SEGMENT_ID),
            flags: AtomicU8::new(SegmentFlags::FREE.bits()),
            submitted: AtomicBool::new(false),
            op_lock: Mutex::new(()),
            owner: Mutex::new(SegmentOwner {
                stream: None,
                sequence_number: INVALID_SEQUENCE_NUMBER,
            }),
            control: Mutex::new(SegmentControlElement::default()),
        }
    }

    pub fn flags(&self) -> SegmentFlags {
        SegmentFlags::from_bits(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: SegmentFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub fn add_flags(&self, flags: SegmentFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn remove_flags(&self, flags: SegmentFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }

    pub fn set_submitted(&self, submitted: bool) {
        self.submitted.store(submitted, Ordering::Release);
    }

    /// Snapshot of the recorded owner. The stream handle is cloned out so
    /// no lock is held while the caller talks to the stream or encoder.
    pub fn owner(&self) -> (Option<Arc<dyn TraceStream>>, SequenceNumber) {
        let owner = self.owner.lock().unwrap();
        (owner.stream.clone(), owner.sequence_number)
    }

    pub fn set_owner(&self, stream: Option<Arc<dyn TraceStream>>, sequence_number: SequenceNumber) {
        let mut owner = self.owner.lock().unwrap();
        owner.stream = stream;
        owner.sequence_number = sequence_number;
    }

    pub fn control(&self) -> SegmentControlElement {
        *self.control.lock().unwrap()
    }

    pub fn set_control(&self, control: SegmentControlElement) {
        *self.control.lock().unwrap() = control;
    }
}
