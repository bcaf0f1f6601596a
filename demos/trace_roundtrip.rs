//! Round-trip demo: a writer records three segments of fixed-size trace
//! entries, then a reader re-opens them. The last segment written is
//! still in the standby cache and comes back without touching storage.
//!
//! Run with: cargo run --example trace_roundtrip

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracebuf::{
    EncoderError, SegmentId, SequenceNumber, StorageLocation, StoreId, StreamAccessFlags,
    StreamBuffer, StreamBufferBuilder, StreamEncoder, StreamId, StreamTypeDescriptor, TraceStream,
};

const ENTRY_SIZE: u32 = 16;
const ENTRIES_PER_SEGMENT: u32 = 100;

/// Keeps "persisted" segments in a hash map instead of a store file.
struct MemoryEncoder {
    store: Mutex<HashMap<SequenceNumber, (StorageLocation, Vec<u8>)>>,
    reads: AtomicUsize,
}

impl MemoryEncoder {
    fn new() -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
            reads: AtomicUsize::new(0),
        }
    }
}

impl StreamEncoder for MemoryEncoder {
    fn write(
        &self,
        buffer: &StreamBuffer,
        segment: SegmentId,
    ) -> Result<(bool, Option<StorageLocation>), EncoderError> {
        let control = buffer.control_element(segment)?;
        let valid_len = ENTRY_SIZE as usize * control.raw_entry_count as usize;
        let bytes = buffer.payload(segment)?[..valid_len].to_vec();

        let mut location = StorageLocation::from_control(&control);
        location.compressed_size = bytes.len() as u64;

        self.store
            .lock()
            .unwrap()
            .insert(control.link.sequence_number, (location.clone(), bytes));

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

    fn drop_segment(&self, _buffer: &StreamBuffer, _segment: SegmentId) {}

    fn notify_segment_cache_closed(&self, _sequence_number: SequenceNumber) {}
}

struct DemoStream {
    id: StreamId,
    store: StoreId,
    encoder: MemoryEncoder,
}

impl TraceStream for DemoStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn store(&self) -> StoreId {
        self.store
    }

    fn stream_type(&self) -> StreamTypeDescriptor {
        StreamTypeDescriptor::fixed(ENTRY_SIZE)
    }

    fn encoder(&self) -> &dyn StreamEncoder {
        &self.encoder
    }
}

fn main() {
    let buffer = StreamBufferBuilder::new(0)
        .segment_size(ENTRY_SIZE as usize * ENTRIES_PER_SEGMENT as usize)
        .num_segments(2)
        .build()
        .expect("failed to create stream buffer");

    let demo = Arc::new(DemoStream {
        id: 1,
        store: 1,
        encoder: MemoryEncoder::new(),
    });
    let stream: Arc<dyn TraceStream> = demo.clone();

    println!(
        "buffer: {} segments x {} bytes",
        buffer.num_segments(),
        buffer.segment_size()
    );

    // Writer: three segments of 100 entries each.
    for sqn in 0..3 {
        let id = buffer
            .request_segment(&stream, sqn)
            .expect("request failed");

        let payload = buffer.payload_mut(id).expect("payload");
        for (i, byte) in payload[..ENTRY_SIZE as usize * ENTRIES_PER_SEGMENT as usize]
            .iter_mut()
            .enumerate()
        {
            *byte = (sqn as u8).wrapping_add(i as u8);
        }
        buffer
            .shared_control_mut(id)
            .expect("control")
            .raw_entry_count = ENTRIES_PER_SEGMENT;

        let (_, location) = buffer.submit_segment(id).expect("submit failed");
        let location = location.expect("encoder returned no location");

        println!(
            "wrote sqn {} -> entries {}..={}",
            sqn, location.ranges.start_index, location.ranges.end_index
        );
    }

    // Reader: sqn 2 is still standby-cached, while sqn 1 was evicted to
    // make room for it and needs a storage read.
    for sqn in [2, 1] {
        let location = demo
            .encoder
            .store
            .lock()
            .unwrap()
            .get(&sqn)
            .map(|(location, _)| location.clone())
            .expect("location");

        let reads_before = demo.encoder.reads.load(Ordering::Relaxed);
        let (id, completed) = buffer
            .open_segment(&stream, StreamAccessFlags::NONE, &location, false)
            .expect("open failed");
        assert!(completed);

        let hit = demo.encoder.reads.load(Ordering::Relaxed) == reads_before;
        println!(
            "opened sqn {} as segment {} ({})",
            sqn,
            id,
            if hit { "standby hit" } else { "storage read" }
        );

        buffer.free_segment(id, false).expect("free failed");
    }

    buffer.flush_standby_list(None);
    println!(
        "done: {} standby hits, {} evictions",
        buffer.metrics().standby_hit.value(),
        buffer.metrics().standby_evict.value()
    );
}
