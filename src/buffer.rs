use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, trace, warn};
use rand::Rng;

use crate::control::{
    compute_control_cookie, test_control_cookie, SegmentControlElement,
};
use crate::encoder::StorageLocation;
use crate::error::BufferError;
use crate::metrics::BufferMetrics;
use crate::pool::SegmentPool;
use crate::segment::{Segment, SegmentFlags};
use crate::standby::StandbyList;
use crate::stream::TraceStream;
use crate::sync::{fence, AtomicU32, Mutex, Ordering};
use crate::types::{
    timestamp_now, BufferId, CycleCount, SegmentId, SequenceNumber, StoreId, StoreStreamSegmentLink,
    StreamAccessFlags, CYCLE_COUNT_MASK, INVALID_CYCLE_COUNT, INVALID_ENTRY_INDEX,
    INVALID_SEGMENT_ID, INVALID_SEQUENCE_NUMBER, INVALID_STORE_ID, INVALID_STREAM_ID,
    INVALID_TIMESTAMP,
};
use crate::StreamBufferBuilder;

/// Server-side stream buffer: a fixed pool of large segments backing all
/// live trace data, handed out to writers and readers and recycled
/// through a standby cache of recently closed read-only segments.
///
/// Writers obtain a fresh segment with [`request_segment`], fill its
/// payload through the shared mapping and close it with
/// [`submit_segment`], which validates the shared control element and
/// hands the data to the stream's encoder. Readers obtain populated
/// segments with [`open_segment`], served from the standby cache when the
/// same `(store, stream, sequence number)` was closed recently.
///
/// [`request_segment`]: StreamBuffer::request_segment
/// [`submit_segment`]: StreamBuffer::submit_segment
/// [`open_segment`]: StreamBuffer::open_segment
pub struct StreamBuffer {
    id: BufferId,

    /// Secret mixed into every control element cookie. Never written to
    /// shared memory.
    cookie: u64,

    cache_enabled: bool,
    retry_count: u32,
    retry_sleep: Duration,

    pool: SegmentPool,
    segments: Box<[Segment]>,

    free_head: AtomicU32,
    standby: Mutex<StandbyList>,

    metrics: BufferMetrics,
}

impl StreamBuffer {
    pub(crate) fn from_builder(builder: &StreamBufferBuilder) -> Result<Self, BufferError> {
        if builder.id == crate::types::INVALID_BUFFER_ID {
            return Err(BufferError::InvalidArgument("id"));
        }
        if builder.num_segments == 0 || builder.num_segments > crate::types::MAX_SEGMENTS_PER_BUFFER
        {
            return Err(BufferError::InvalidArgument("num_segments"));
        }
        if builder.segment_size < 8 || builder.segment_size % 8 != 0 {
            return Err(BufferError::InvalidArgument("segment_size"));
        }

        let mut rng = rand::thread_rng();

        let backing_path = match (&builder.shared_path, builder.shared) {
            (Some(path), _) => Some(path.clone()),
            (None, true) => Some(std::env::temp_dir().join(format!(
                "tracebuf-{:08x}-{:016x}",
                builder.id,
                rng.gen::<u64>()
            ))),
            (None, false) => None,
        };

        let pool = SegmentPool::new(
            builder.id,
            builder.segment_size,
            builder.num_segments,
            backing_path,
        )?;

        let count = builder.num_segments;
        let mut segments = Vec::with_capacity(count as usize);
        for id in 0..count {
            let seg = Segment::new(id);

            // Pre-thread the free list in index order.
            let next = if id == count - 1 {
                INVALID_SEGMENT_ID
            } else {
                id + 1
            };
            seg.next.store(next, Ordering::Relaxed);

            segments.push(seg);
        }

        let buffer = Self {
            id: builder.id,
            cookie: rng.gen::<u64>(),
            cache_enabled: !builder.disable_cache,
            retry_count: builder.retry_count,
            retry_sleep: builder.retry_sleep,
            pool,
            segments: segments.into_boxed_slice(),
            free_head: AtomicU32::new(0),
            standby: Mutex::new(StandbyList::new()),
            metrics: BufferMetrics::new(),
        };

        // Commit the whole region now so later access cannot fault
        // mid-operation. In debug builds the sanity fill doubles as the
        // touch and must not be overwritten.
        #[cfg(debug_assertions)]
        for seg in buffer.segments.iter() {
            buffer.pool.dbg_sanity_fill(seg.id, true);
        }
        #[cfg(not(debug_assertions))]
        buffer.pool.touch();

        buffer.metrics.segments_free.set(count as i64);

        Ok(buffer)
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn segment_size(&self) -> usize {
        self.pool.segment_size()
    }

    pub fn num_segments(&self) -> u32 {
        self.segments.len() as u32
    }

    pub fn buffer_size(&self) -> usize {
        self.pool.buffer_size()
    }

    pub fn metrics(&self) -> &BufferMetrics {
        &self.metrics
    }

    fn seg(&self, segment: SegmentId) -> Result<&Segment, BufferError> {
        self.segments
            .get(segment as usize)
            .ok_or(BufferError::OutOfBounds {
                buffer: self.id,
                segment,
                count: self.segments.len() as u32,
            })
    }

    // ------------------------------------------------------------------
    // Free list
    // ------------------------------------------------------------------

    fn dequeue_from_free_list(&self) -> Option<&Segment> {
        // Pop the head with a CAS loop. A popped segment only returns to
        // the list after a full request/release cycle, which is what
        // rules out an ABA swap of the head; a tagged head is required
        // before that invariant may be weakened.
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            if head == INVALID_SEGMENT_ID {
                return None;
            }

            let next = self.segments[head as usize].next.load(Ordering::Acquire);
            match self.free_head.compare_exchange_weak(
                head,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        let seg = &self.segments[head as usize];
        debug_assert_eq!(seg.flags(), SegmentFlags::FREE);
        debug_assert_eq!(seg.prev.load(Ordering::Acquire), INVALID_SEGMENT_ID);

        seg.set_submitted(false);
        seg.set_flags(SegmentFlags::IN_USE);
        seg.next.store(INVALID_SEGMENT_ID, Ordering::Release);

        #[cfg(debug_assertions)]
        debug_assert_eq!(self.pool.dbg_sanity_check(seg.id, 0), 0);

        self.metrics.segments_free.decrement();

        Some(seg)
    }

    fn enqueue_to_free_list(&self, seg: &Segment) {
        debug_assert!(seg.flags().contains(SegmentFlags::IN_USE));
        debug_assert_eq!(seg.next.load(Ordering::Acquire), INVALID_SEGMENT_ID);
        debug_assert_eq!(seg.prev.load(Ordering::Acquire), INVALID_SEGMENT_ID);

        #[cfg(debug_assertions)]
        self.pool.dbg_sanity_fill(seg.id, true);

        seg.set_owner(None, INVALID_SEQUENCE_NUMBER);
        seg.set_flags(SegmentFlags::FREE);

        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            seg.next.store(head, Ordering::Release);
            match self.free_head.compare_exchange_weak(
                head,
                seg.id,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => head = observed,
            }
        }

        self.metrics.segments_free.increment();
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    fn prepare_segment(
        &self,
        seg: &Segment,
        stream: Option<&Arc<dyn TraceStream>>,
        sequence_number: SequenceNumber,
    ) {
        debug_assert!(!seg.flags().contains(SegmentFlags::READ_ONLY));
        debug_assert!(!seg.is_submitted());
        debug_assert!(stream.is_none() || sequence_number != INVALID_SEQUENCE_NUMBER);

        let mut control = SegmentControlElement::default();
        control.link.stream = stream.map_or(INVALID_STREAM_ID, |s| s.id());
        control.link.sequence_number = sequence_number;

        control.start_cycle = INVALID_CYCLE_COUNT;
        control.end_cycle = INVALID_CYCLE_COUNT;

        control.start_time = timestamp_now();
        control.end_time = INVALID_TIMESTAMP;

        control.cookie = compute_control_cookie(self.cookie, &control, seg.id, false);

        *self.pool.shared_control_mut(seg.id) = control;
        seg.set_control(control);
        seg.set_owner(stream.cloned(), sequence_number);

        #[cfg(debug_assertions)]
        self.pool.dbg_sanity_fill(seg.id, false);
    }

    fn handle_contention(&self, try_count: u32, scratch: bool) -> bool {
        warn!(
            "Delaying segment request. Stream buffer {} exhausted <try: {}{}>.",
            self.id,
            try_count,
            if scratch { ", scratch" } else { "" }
        );

        self.metrics.segment_request_retry.increment();

        if try_count >= self.retry_count {
            return false;
        }

        std::thread::sleep(self.retry_sleep);
        true
    }

    fn try_allocate_free_segment(
        &self,
        stream: Option<&Arc<dyn TraceStream>>,
        sequence_number: SequenceNumber,
        prefetch: bool,
    ) -> Option<&Segment> {
        let mut try_count = 1;

        loop {
            trace!(
                "Requesting segment from buffer {} <try: {}>.",
                self.id,
                try_count
            );

            // The free list is the primary source; fall back to evicting
            // the least recently used standby segment.
            let seg = self
                .dequeue_from_free_list()
                .or_else(|| self.evict_from_standby_list());

            if let Some(seg) = seg {
                self.prepare_segment(seg, stream, sequence_number);

                trace!(
                    "Allocated segment {} from buffer {} <try: {}>.",
                    seg.id,
                    self.id,
                    try_count
                );

                self.metrics.segment_request.increment();
                return Some(seg);
            }

            // Prefetchers return as fast as possible instead of sleeping.
            if prefetch || !self.handle_contention(try_count, stream.is_none()) {
                return None;
            }

            try_count += 1;
        }
    }

    // ------------------------------------------------------------------
    // Standby cache orchestration
    // ------------------------------------------------------------------

    fn standby_key(&self, seg: &Segment) -> StoreStreamSegmentLink {
        let (stream, _) = seg.owner();
        let store = stream.as_ref().map_or(INVALID_STORE_ID, |s| s.store());
        debug_assert_ne!(store, INVALID_STORE_ID);

        StoreStreamSegmentLink {
            store,
            link: seg.control().link,
        }
    }

    fn take_standby_segment(
        &self,
        stream: &Arc<dyn TraceStream>,
        sequence_number: SequenceNumber,
    ) -> Option<SegmentId> {
        let key = StoreStreamSegmentLink::new(stream.store(), stream.id(), sequence_number);

        let mut standby = self.standby.lock().unwrap();
        let id = standby.remove(&self.segments, &key)?;
        drop(standby);

        debug_assert!(test_control_cookie(
            self.cookie,
            &self.segments[id as usize].control(),
            id,
            true
        ));

        self.metrics.standby_hit.increment();
        self.metrics.segments_standby.decrement();

        Some(id)
    }

    fn evict_from_standby_list(&self) -> Option<&Segment> {
        let mut standby = self.standby.lock().unwrap();

        let victim = standby.victim(&self.segments)?;
        let seg = &self.segments[victim as usize];

        debug_assert!(test_control_cookie(self.cookie, &seg.control(), victim, true));

        self.notify_encoder_cache_closed(seg);

        let key = self.standby_key(seg);
        let removed = standby.remove(&self.segments, &key);
        debug_assert_eq!(removed, Some(victim));
        drop(standby);

        seg.set_flags(SegmentFlags::IN_USE);

        self.metrics.standby_evict.increment();
        self.metrics.segments_standby.decrement();

        Some(seg)
    }

    fn add_standby_segment(&self, seg: &Segment) {
        let key = self.standby_key(seg);
        debug_assert_ne!(key.store, INVALID_STORE_ID);
        debug_assert_ne!(key.link.stream, INVALID_STREAM_ID);
        debug_assert_ne!(key.link.sequence_number, INVALID_SEQUENCE_NUMBER);
        debug_assert!(test_control_cookie(self.cookie, &seg.control(), seg.id, true));

        let mut standby = self.standby.lock().unwrap();

        if standby.contains(&key) {
            drop(standby);

            // The cache holds at most one copy per key; the newcomer is
            // returned to the pool and the incumbent keeps its position.
            self.metrics.standby_duplicate.increment();
            self.purge_segment_inner(seg);
        } else {
            standby.insert(&self.segments, key, seg);

            self.metrics.standby_insert.increment();
            self.metrics.segments_standby.increment();
        }
    }

    /// Removes every standby segment whose owning stream lives in
    /// `store`, or all standby segments when no store is given, and
    /// returns them to the free list.
    pub fn flush_standby_list(&self, store: Option<StoreId>) {
        let mut standby = self.standby.lock().unwrap();
        if standby.is_empty() {
            return;
        }

        for id in standby.snapshot(&self.segments) {
            let seg = &self.segments[id as usize];
            let key = self.standby_key(seg);

            if store.map_or(true, |s| s == key.store) {
                trace!(
                    "Flushing cached segment {} in buffer {} <store: {}, stream: {}, sqn: {}>.",
                    id,
                    self.id,
                    key.store,
                    key.link.stream,
                    key.link.sequence_number
                );

                let removed = standby.remove(&self.segments, &key);
                debug_assert_eq!(removed, Some(id));

                self.metrics.standby_flush.increment();
                self.metrics.segments_standby.decrement();

                self.purge_segment_inner(seg);
            }
        }

        debug_assert!(store.is_some() || standby.is_empty());
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Obtains a fresh, mutable segment bound to `(stream, sqn)` for the
    /// writer path. Blocks with bounded retries when the pool is
    /// exhausted and fails with [`BufferError::OperationInProgress`] once
    /// the retry budget is spent.
    pub fn request_segment(
        &self,
        stream: &Arc<dyn TraceStream>,
        sequence_number: SequenceNumber,
    ) -> Result<SegmentId, BufferError> {
        if sequence_number == INVALID_SEQUENCE_NUMBER {
            return Err(BufferError::InvalidArgument("sequence_number"));
        }

        let seg = self
            .try_allocate_free_segment(Some(stream), sequence_number, false)
            .ok_or(BufferError::OperationInProgress)?;

        // Writes are assumed sequential; the segment is cacheable but
        // may be reused early.
        if self.cache_enabled {
            seg.add_flags(SegmentFlags::CACHEABLE | SegmentFlags::LOW_PRIORITY);
        }

        Ok(seg.id)
    }

    /// Obtains an anonymous segment not associated with any stream.
    /// Scratch segments cannot be submitted or cached; release them with
    /// [`purge_segment`](StreamBuffer::purge_segment).
    pub fn request_scratch_segment(&self) -> Result<SegmentId, BufferError> {
        let seg = self
            .try_allocate_free_segment(None, INVALID_SEQUENCE_NUMBER, false)
            .ok_or(BufferError::OperationInProgress)?;

        seg.add_flags(SegmentFlags::SCRATCH);

        Ok(seg.id)
    }

    /// Returns a read-only segment populated with the data described by
    /// `location`. A standby hit returns immediately with
    /// `completed = true`; otherwise the stream's encoder fills a fresh
    /// segment and may complete asynchronously. Prefetchers fail fast on
    /// an exhausted pool instead of sleeping.
    pub fn open_segment(
        &self,
        stream: &Arc<dyn TraceStream>,
        flags: StreamAccessFlags,
        location: &StorageLocation,
        prefetch: bool,
    ) -> Result<(SegmentId, bool), BufferError> {
        if location.link.stream != stream.id() {
            return Err(BufferError::InvalidArgument("location"));
        }

        let sequence_number = location.link.sequence_number;
        if sequence_number == INVALID_SEQUENCE_NUMBER {
            return Err(BufferError::InvalidArgument("location"));
        }

        trace!(
            "{} segment into buffer {} <stream: {}, sqn: {}>.",
            if prefetch { "Prefetching" } else { "Loading" },
            self.id,
            location.link.stream,
            sequence_number
        );

        if let Some(id) = self.take_standby_segment(stream, sequence_number) {
            return Ok((id, true));
        }

        let seg = self
            .try_allocate_free_segment(Some(stream), sequence_number, prefetch)
            .ok_or(BufferError::OperationInProgress)?;

        // Block concurrent operations by the encoder or other callers
        // while the segment is populated.
        let _guard = seg.op_lock.lock().unwrap();

        seg.add_flags(SegmentFlags::READ_ONLY);

        if self.cache_enabled {
            seg.add_flags(SegmentFlags::CACHEABLE);

            // One-touch caching: random access must not pollute the
            // cache head, and a sequential scan never revisits a closed
            // segment, so both park at the eviction end.
            if flags.contains(StreamAccessFlags::RANDOM_ACCESS)
                || flags.contains(StreamAccessFlags::SEQUENTIAL_SCAN)
            {
                seg.add_flags(SegmentFlags::LOW_PRIORITY);
            }
        }

        let control = self.pool.shared_control_mut(seg.id);
        control.start_cycle = location.ranges.start_cycle;
        control.end_cycle = location.ranges.end_cycle;

        control.start_time = location.ranges.start_time;
        control.end_time = location.ranges.end_time;

        control.start_index = location.ranges.start_index;
        if location.ranges.start_index != INVALID_ENTRY_INDEX {
            debug_assert!(location.ranges.end_index >= location.ranges.start_index);
            control.entry_count = location.entry_count();
        }

        control.raw_entry_count = location.raw_entry_count;

        control.cookie = compute_control_cookie(self.cookie, control, seg.id, true);
        seg.set_control(*control);

        debug!(
            "Decoding segment {} in buffer {} <stream: {}, sqn: {}>.",
            seg.id,
            self.id,
            stream.id(),
            sequence_number
        );

        // The segment id and the control contents must be visible to the
        // encoder before the read begins; async encoders reference the id
        // from their own threads.
        let segment = seg.id;
        fence(Ordering::Release);

        match stream.encoder().read(self, segment, flags, location, prefetch) {
            Ok(completed) => {
                debug_assert!(completed || !flags.contains(StreamAccessFlags::SYNCHRONOUS));
                Ok((segment, completed))
            }
            Err(e) => {
                self.metrics.decode_failure.increment();
                error!(
                    "Failed to decode segment {} in buffer {} <stream: {}, sqn: {}>: {}.",
                    segment,
                    self.id,
                    stream.id(),
                    sequence_number,
                    e
                );

                self.purge_segment_inner(seg);
                Err(BufferError::Encoder(e))
            }
        }
    }

    /// Closes a written segment: validates the shared control element,
    /// fixes up timing and cycle ranges, and hands the data to the
    /// stream's encoder. Returns whether the encoder completed
    /// synchronously, and the storage location if one was produced.
    pub fn submit_segment(
        &self,
        segment: SegmentId,
    ) -> Result<(bool, Option<StorageLocation>), BufferError> {
        let seg = self.seg(segment)?;

        let (stream, sequence_number) = seg.owner();
        let stream =
            stream.ok_or(BufferError::InvalidOperation("segment is not bound to a stream"))?;
        debug_assert_ne!(sequence_number, INVALID_SEQUENCE_NUMBER);

        let (completed, location, cache) = {
            let _guard = seg.op_lock.lock().unwrap();

            // Submitting free and standby segments is forbidden, as is
            // submitting the same segment twice.
            if !seg.flags().contains(SegmentFlags::IN_USE)
                || seg.next.load(Ordering::Acquire) != INVALID_SEGMENT_ID
                || seg.is_submitted()
            {
                return Err(BufferError::InvalidOperation(
                    "segment is free, cached, or already submitted",
                ));
            }

            self.submit_segment_inner(seg, &stream, sequence_number)?
        };

        // The standby insertion takes the standby lock; the segment lock
        // must be released first.
        if cache {
            self.add_standby_segment(seg);
        }

        Ok((completed, location))
    }

    fn submit_segment_inner(
        &self,
        seg: &Segment,
        stream: &Arc<dyn TraceStream>,
        sequence_number: SequenceNumber,
    ) -> Result<(bool, Option<StorageLocation>, bool), BufferError> {
        let flags = seg.flags();
        debug_assert!(!flags.contains(SegmentFlags::SCRATCH));

        let read_only = flags.contains(SegmentFlags::READ_ONLY);

        // Copy the shared control element so the client cannot change
        // any control information while the data is processed.
        let mut control = *self.pool.shared_control(seg.id);

        if !read_only {
            // The recorded owner wins over whatever the client wrote;
            // forged values only invalidate the cookie.
            control.link.stream = stream.id();
            control.link.sequence_number = sequence_number;

            seg.set_control(control);
        }

        if !test_control_cookie(self.cookie, &control, seg.id, read_only) {
            self.metrics.cookie_failure.increment();
            error!(
                "Failed submitting segment {} to buffer {}. The control cookie is invalid.",
                seg.id, self.id
            );

            self.purge_segment_inner(seg);
            return Err(BufferError::Corruption(format!(
                "segment {} control cookie mismatch",
                seg.id
            )));
        }

        trace!(
            "Submitting segment {} to buffer {} <stream: {}, sqn: {}, rec: {}, ec: {}>.",
            seg.id,
            self.id,
            control.link.stream,
            control.link.sequence_number,
            control.raw_entry_count,
            control.entry_count
        );

        // The caller cannot resubmit from here on, and control_element()
        // serves the private copy.
        seg.set_submitted(true);
        self.metrics.segment_submit.increment();

        // A read-only segment carries no new data; free it, potentially
        // back into the standby cache.
        if read_only {
            let cache = self.free_segment_inner(seg, false);
            return Ok((true, None, cache));
        }

        if control.raw_entry_count == 0 {
            debug_assert_eq!(control.entry_count, 0);
            warn!(
                "Dropping empty segment {} in buffer {}. Did you forget to submit \
                 the entries <stream: {}, sqn: {}>?",
                seg.id, self.id, control.link.stream, control.link.sequence_number
            );

            // The stream keeps a hole for this sequence number.
            stream.encoder().drop_segment(self, seg.id);

            #[cfg(debug_assertions)]
            debug_assert!(self.pool.dbg_sanity_check(seg.id, 1) < 2);

            self.metrics.segment_submit_empty.increment();
            self.purge_segment_inner(seg);
            return Ok((true, None, false));
        }

        // This is a newly written segment.
        let desc = stream.stream_type();
        debug_assert!(
            !desc.temporal_order
                || (!desc.is_variable() && desc.entry_size as usize >= core::mem::size_of::<u64>())
        );

        if !desc.is_variable() {
            debug_assert_eq!(control.entry_count, 0);
            control.entry_count = control.raw_entry_count;
        }

        let valid_len = desc.effective_entry_size() as u64 * control.raw_entry_count as u64;

        if valid_len > self.pool.segment_size() as u64
            || (!desc.is_variable() && control.entry_count != control.raw_entry_count)
            || control.entry_count > control.raw_entry_count
        {
            error!(
                "Invalid number of entries in control element for stream {} \
                 <sqn: {}, segment: {}>.",
                control.link.stream, control.link.sequence_number, seg.id
            );

            self.purge_segment_inner(seg);
            return Err(BufferError::Corruption(format!(
                "invalid number of entries in control element for stream {} <sqn: {}, segment: {}>",
                control.link.stream, control.link.sequence_number, seg.id
            )));
        }

        debug_assert!(control.entry_count > 0);
        debug_assert!(control.raw_entry_count > 0);

        debug_assert_eq!(control.end_time, INVALID_TIMESTAMP);
        control.end_time = timestamp_now();

        if desc.temporal_order {
            debug_assert!(control.start_index != INVALID_ENTRY_INDEX);

            // Entries of temporally ordered streams start with a 48-bit
            // cycle counter; read it from the first and last valid entry.
            let payload = self.pool.payload(seg.id);
            let entry_size = desc.entry_size as usize;

            let start_cycle = read_cycle(payload, 0);
            let end_cycle = read_cycle(payload, valid_len as usize - entry_size);

            if start_cycle == CYCLE_COUNT_MASK
                || end_cycle == CYCLE_COUNT_MASK
                || start_cycle > end_cycle
            {
                error!(
                    "Invalid cycle information in temporally ordered stream {} for \
                     segment {} <sqn: {}>.",
                    control.link.stream, seg.id, control.link.sequence_number
                );

                self.purge_segment_inner(seg);
                return Err(BufferError::Corruption(format!(
                    "invalid cycle information in temporally ordered stream {} \
                     <sqn: {}, segment: {}>",
                    control.link.stream, control.link.sequence_number, seg.id
                )));
            }

            control.start_cycle = start_cycle;
            control.end_cycle = end_cycle;
        } else {
            control.start_cycle = INVALID_CYCLE_COUNT;
            control.end_cycle = INVALID_CYCLE_COUNT;
        }

        control.cookie = compute_control_cookie(self.cookie, &control, seg.id, false);
        seg.set_control(control);

        #[cfg(debug_assertions)]
        debug_assert!(self.pool.dbg_sanity_check(seg.id, desc.effective_entry_size()) < 2);

        debug!(
            "Encoding segment {} in buffer {} <stream: {}, sqn: {}, size: {} bytes>.",
            seg.id, self.id, control.link.stream, control.link.sequence_number, valid_len
        );

        // Encode the segment's data with the encoder of the stream type.
        // The encoder may work asynchronously; in that case the segment
        // is not finished here and the encoder completes it at the
        // stream.
        match stream.encoder().write(self, seg.id) {
            Ok((true, Some(location))) => {
                debug_assert_eq!(location.link, control.link);
                debug_assert_eq!(location.ranges.start_index, control.start_index);
                debug_assert!(
                    location.ranges.start_index == INVALID_ENTRY_INDEX
                        || location.entry_count() == control.entry_count
                );
                debug_assert_eq!(location.raw_entry_count, control.raw_entry_count);
                debug_assert_eq!(location.ranges.start_cycle, control.start_cycle);
                debug_assert_eq!(location.ranges.end_cycle, control.end_cycle);
                debug_assert_eq!(location.ranges.start_time, control.start_time);
                debug_assert_eq!(location.ranges.end_time, control.end_time);

                let cache = self.free_segment_inner(seg, false);
                Ok((true, Some(location), cache))
            }
            Ok((true, None)) => {
                // The encoder discarded the data; the segment no longer
                // holds anything worth keeping.
                self.purge_segment_inner(seg);
                Ok((true, None, false))
            }
            Ok((false, _)) => Ok((false, None, false)),
            Err(e) => {
                // Hand the error upward without losing data; the caller
                // may retry the submit.
                seg.set_submitted(false);
                self.metrics.encode_failure.increment();
                error!(
                    "Failed to encode segment {} in buffer {} <stream: {}, sqn: {}>: {}.",
                    seg.id, self.id, control.link.stream, control.link.sequence_number, e
                );

                Err(BufferError::Encoder(e))
            }
        }
    }

    /// Releases a segment after use. Cacheable read-only segments with
    /// entries move to the standby cache; everything else returns to the
    /// free list. `prefetch` keeps a low-priority segment alive until
    /// its first use.
    pub fn free_segment(&self, segment: SegmentId, prefetch: bool) -> Result<(), BufferError> {
        let seg = self.seg(segment)?;

        let cache = {
            let _guard = seg.op_lock.lock().unwrap();

            // Freeing free and standby segments is forbidden, as is
            // freeing an unsubmitted writable segment whose control
            // element is not final yet.
            let flags = seg.flags();
            if !flags.contains(SegmentFlags::IN_USE)
                || seg.next.load(Ordering::Acquire) != INVALID_SEGMENT_ID
                || (!flags.contains(SegmentFlags::READ_ONLY) && !seg.is_submitted())
            {
                return Err(BufferError::InvalidOperation(
                    "segment is free, cached, or not yet submitted",
                ));
            }

            trace!("Releasing segment {} to buffer {}.", segment, self.id);

            self.metrics.segment_free.increment();
            self.free_segment_inner(seg, prefetch)
        };

        // The standby insertion takes the standby lock; the segment lock
        // must be released first.
        if cache {
            self.add_standby_segment(seg);
        }

        Ok(())
    }

    /// Finalizes a segment for release under the caller's segment lock.
    /// Cacheable read-only segments with entries are prepared for the
    /// standby cache and `true` is returned; the caller inserts them
    /// after releasing the segment lock, since the insertion takes the
    /// standby lock. Everything else goes back to the free list here.
    fn free_segment_inner(&self, seg: &Segment, prefetch: bool) -> bool {
        // The control element is final for this occupancy; the caller
        // cannot resubmit and control_element() serves the private copy.
        // For writable segments this is already the case.
        seg.set_submitted(true);

        let control = seg.control();

        if seg.flags().contains(SegmentFlags::CACHEABLE)
            && self.cache_enabled
            && control.raw_entry_count > 0
        {
            if prefetch {
                // Keeps the segment from landing at the tail of the
                // standby list even when low priority, so a prefetched
                // segment survives until its first use. The flag is
                // removed on insertion.
                seg.add_flags(SegmentFlags::PREFETCH);
            }

            if !seg.flags().contains(SegmentFlags::READ_ONLY) {
                // Only read-only segments live in the cache. Read-only
                // cookies use the keyed hash, and the client must see
                // the final figures, so recompute and publish the whole
                // element.
                seg.add_flags(SegmentFlags::READ_ONLY);

                let mut control = control;
                control.cookie = compute_control_cookie(self.cookie, &control, seg.id, true);

                seg.set_control(control);
                *self.pool.shared_control_mut(seg.id) = control;
            }

            true
        } else {
            self.purge_segment_inner(seg);
            false
        }
    }

    /// Returns a segment to the free list unconditionally, bypassing the
    /// standby cache.
    pub fn purge_segment(&self, segment: SegmentId) -> Result<(), BufferError> {
        let seg = self.seg(segment)?;

        let _guard = seg.op_lock.lock().unwrap();

        // Purging free and standby segments is forbidden.
        if !seg.flags().contains(SegmentFlags::IN_USE)
            || seg.next.load(Ordering::Acquire) != INVALID_SEGMENT_ID
        {
            return Err(BufferError::InvalidOperation("segment is free or cached"));
        }

        trace!("Purging segment {} of buffer {}.", segment, self.id);

        self.purge_segment_inner(seg);

        Ok(())
    }

    fn purge_segment_inner(&self, seg: &Segment) {
        self.notify_encoder_cache_closed(seg);

        self.metrics.segment_purge.increment();
        self.enqueue_to_free_list(seg);
    }

    fn notify_encoder_cache_closed(&self, seg: &Segment) {
        let (stream, sequence_number) = seg.owner();
        if let Some(stream) = stream {
            debug_assert_ne!(sequence_number, INVALID_SEQUENCE_NUMBER);
            stream.encoder().notify_segment_cache_closed(sequence_number);
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// The control element describing a segment: the engine's private
    /// copy once the segment is submitted or read-only, the shared
    /// (client-writable) element otherwise.
    pub fn control_element(
        &self,
        segment: SegmentId,
    ) -> Result<SegmentControlElement, BufferError> {
        let seg = self.seg(segment)?;

        if seg.is_submitted() || seg.flags().contains(SegmentFlags::READ_ONLY) {
            Ok(seg.control())
        } else {
            Ok(*self.pool.shared_control(segment))
        }
    }

    /// Payload bytes of a segment.
    pub fn payload(&self, segment: SegmentId) -> Result<&[u8], BufferError> {
        self.seg(segment)?;
        Ok(self.pool.payload(segment))
    }

    /// Mutable payload bytes of a segment. The caller must hold the
    /// segment; the region is shared with the client process.
    pub fn payload_mut(&self, segment: SegmentId) -> Result<&mut [u8], BufferError> {
        self.seg(segment)?;
        Ok(self.pool.payload_mut(segment))
    }

    /// The client-side view of a segment's control element. Contents are
    /// untrusted; the engine validates them on submit.
    pub fn shared_control_mut(
        &self,
        segment: SegmentId,
    ) -> Result<&mut SegmentControlElement, BufferError> {
        self.seg(segment)?;
        Ok(self.pool.shared_control_mut(segment))
    }
}

fn read_cycle(payload: &[u8], offset: usize) -> CycleCount {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&payload[offset..offset + 8]);

    u64::from_le_bytes(bytes) & CYCLE_COUNT_MASK
}

impl Drop for StreamBuffer {
    fn drop(&mut self) {
        self.flush_standby_list(None);

        #[cfg(debug_assertions)]
        for seg in self.segments.iter() {
            debug_assert_eq!(seg.flags(), SegmentFlags::FREE);
            debug_assert_eq!(seg.prev.load(Ordering::Acquire), INVALID_SEGMENT_ID);
            debug_assert_eq!(self.pool.dbg_sanity_check(seg.id, 0), 0);
        }
    }
}
