//! Shared test fixtures: an in-memory encoder that records calls and
//! serves written bytes back on read, plus a minimal stream
//! implementation.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracebuf::{
    EncoderError, SegmentId, SequenceNumber, StorageLocation, StoreId, StreamAccessFlags,
    StreamBuffer, StreamBufferBuilder, StreamEncoder, StreamId, StreamTypeDescriptor, TraceStream,
    VARIABLE_ENTRY_SIZE_FLAG,
};

pub struct MemStoreEncoder {
    entry_size: u32,
    store: Mutex<HashMap<SequenceNumber, (StorageLocation, Vec<u8>)>>,
    writes: AtomicUsize,
    reads: AtomicUsize,
    drops: Mutex<Vec<SequenceNumber>>,
    closed: Mutex<Vec<SequenceNumber>>,
}

impl MemStoreEncoder {
    pub fn new(entry_size: u32) -> Self {
        Self {
            entry_size,
            store: Mutex::new(HashMap::new()),
            writes: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            drops: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn drops(&self) -> Vec<SequenceNumber> {
        self.drops.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<SequenceNumber> {
        self.closed.lock().unwrap().clone()
    }

    pub fn location(&self, sequence_number: SequenceNumber) -> Option<StorageLocation> {
        self.store
            .lock()
            .unwrap()
            .get(&sequence_number)
            .map(|(location, _)| location.clone())
    }

    pub fn bytes(&self, sequence_number: SequenceNumber) -> Option<Vec<u8>> {
        self.store
            .lock()
            .unwrap()
            .get(&sequence_number)
            .map(|(_, bytes)| bytes.clone())
    }
}

impl StreamEncoder for MemStoreEncoder {
    fn write(
        &self,
        buffer: &StreamBuffer,
        segment: SegmentId,
    ) -> Result<(bool, Option<StorageLocation>), EncoderError> {
        let control = buffer.control_element(segment)?;
        let valid_len = self.entry_size as usize * control.raw_entry_count as usize;
        let bytes = buffer.payload(segment)?[..valid_len].to_vec();

        let mut location = StorageLocation::from_control(&control);
        location.compressed_size = bytes.len() as u64;

        self.store
            .lock()
            .unwrap()
            .insert(control.link.sequence_number, (location.clone(), bytes));
        self.writes.fetch_add(1, Ordering::Relaxed);

        Ok((true, Some(location)))
    }

    fn read(
        &self,
        buffer: &StreamBuffer,
        segment: SegmentId,
        _flags: StreamAccessFlags,
        location: &StorageLocation,
        _prefetch: bool,
    ) -> Result<bool, EncoderError> {
        let store = self.store.lock().unwrap();
        let (_, bytes) = store
            .get(&location.link.sequence_number)
            .ok_or("unknown storage location")?;

        buffer.payload_mut(segment)?[..bytes.len()].copy_from_slice(bytes);
        self.reads.fetch_add(1, Ordering::Relaxed);

        Ok(true)
    }

    fn drop_segment(&self, buffer: &StreamBuffer, segment: SegmentId) {
        if let Ok(control) = buffer.control_element(segment) {
            self.drops.lock().unwrap().push(control.link.sequence_number);
        }
    }

    fn notify_segment_cache_closed(&self, sequence_number: SequenceNumber) {
        self.closed.lock().unwrap().push(sequence_number);
    }
}

pub struct TestStream {
    id: StreamId,
    store: StoreId,
    desc: StreamTypeDescriptor,
    pub encoder: MemStoreEncoder,
}

impl TestStream {
    pub fn new(id: StreamId, store: StoreId, desc: StreamTypeDescriptor) -> Arc<Self> {
        Arc::new(Self {
            id,
            store,
            desc,
            encoder: MemStoreEncoder::new(desc.entry_size & !VARIABLE_ENTRY_SIZE_FLAG),
        })
    }

    pub fn as_dyn(self: &Arc<Self>) -> Arc<dyn TraceStream> {
        self.clone()
    }
}

impl TraceStream for TestStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn store(&self) -> StoreId {
        self.store
    }

    fn stream_type(&self) -> StreamTypeDescriptor {
        self.desc
    }

    fn encoder(&self) -> &dyn StreamEncoder {
        &self.encoder
    }
}

pub const ENTRY_SIZE: u32 = 16;

/// 100 fixed-size entries per segment.
pub fn small_buffer(num_segments: u32) -> StreamBuffer {
    StreamBufferBuilder::new(0)
        .segment_size(ENTRY_SIZE as usize * 100)
        .num_segments(num_segments)
        .retry_count(2)
        .retry_sleep(Duration::from_millis(1))
        .build()
        .unwrap()
}

pub fn fixed_stream(id: StreamId, store: StoreId) -> Arc<TestStream> {
    TestStream::new(id, store, StreamTypeDescriptor::fixed(ENTRY_SIZE))
}

/// Emulates the client side of the writer path: fills `count` entries
/// with a recognizable pattern and publishes the raw entry count through
/// the shared control element.
pub fn write_entries(buffer: &StreamBuffer, segment: SegmentId, count: u32, seed: u8) {
    let len = ENTRY_SIZE as usize * count as usize;
    let payload = &mut buffer.payload_mut(segment).unwrap()[..len];
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte = seed.wrapping_add(i as u8);
    }

    buffer.shared_control_mut(segment).unwrap().raw_entry_count = count;
}

/// Empties the free list by taking scratch segments, without disturbing
/// the standby cache. Purge the returned segments to refill the pool.
pub fn drain_free(buffer: &StreamBuffer) -> Vec<SegmentId> {
    (0..buffer.metrics().segments_free.value())
        .map(|_| buffer.request_scratch_segment().unwrap())
        .collect()
}

/// The pattern `write_entries` produced, for read-back comparison.
pub fn entry_pattern(count: u32, seed: u8) -> Vec<u8> {
    (0..ENTRY_SIZE as usize * count as usize)
        .map(|i| seed.wrapping_add(i as u8))
        .collect()
}
