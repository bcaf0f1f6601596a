//! End-to-end writer and reader lifecycle: request, submit, re-open,
//! round-trip.

mod common;

use common::*;
use tracebuf::{StreamAccessFlags, StreamBufferBuilder, StreamTypeDescriptor};

/// Pool of 2 segments, one stream, three segments of 100 entries each.
/// Every submit succeeds, the encoder sees three writes with full entry
/// counts, and the standby cache never exceeds the pool.
#[test]
fn single_writer_fills_pool() {
    let buffer = small_buffer(2);
    let stream = fixed_stream(5, 1);

    for sqn in 0..3 {
        let id = buffer.request_segment(&stream.as_dyn(), sqn).unwrap();
        write_entries(&buffer, id, 100, sqn as u8);

        let (completed, location) = buffer.submit_segment(id).unwrap();
        assert!(completed);

        let location = location.unwrap();
        assert_eq!(location.raw_entry_count, 100);
        assert_eq!(
            location.ranges.end_index - location.ranges.start_index + 1,
            100
        );

        assert!(buffer.metrics().segments_standby.value() <= 2);
    }

    assert_eq!(stream.encoder.writes(), 3);

    let control = stream.encoder.location(2).unwrap();
    assert_eq!(control.raw_entry_count, 100);
}

/// A segment closed and re-opened for the same sequence number is served
/// from the standby cache without touching the encoder, with identical
/// bytes.
#[test]
fn reopen_hits_standby_cache() {
    let buffer = small_buffer(2);
    let stream = fixed_stream(5, 1);

    for sqn in 0..3 {
        let id = buffer.request_segment(&stream.as_dyn(), sqn).unwrap();
        write_entries(&buffer, id, 100, sqn as u8);
        buffer.submit_segment(id).unwrap();
    }

    let location = stream.encoder.location(1).unwrap();

    // First open misses (the sqn=1 copy was evicted while writing sqn=2)
    // and reads from the encoder.
    let (id, completed) = buffer
        .open_segment(&stream.as_dyn(), StreamAccessFlags::NONE, &location, false)
        .unwrap();
    assert!(completed);
    assert_eq!(stream.encoder.reads(), 1);

    let first_bytes = buffer.payload(id).unwrap()[..entry_pattern(100, 1).len()].to_vec();
    assert_eq!(first_bytes, entry_pattern(100, 1));

    buffer.free_segment(id, false).unwrap();

    // Second open hits the cache: same bytes, no further encoder read.
    let hits_before = buffer.metrics().standby_hit.value();
    let (id, completed) = buffer
        .open_segment(&stream.as_dyn(), StreamAccessFlags::NONE, &location, false)
        .unwrap();
    assert!(completed);
    assert_eq!(stream.encoder.reads(), 1);
    assert_eq!(buffer.metrics().standby_hit.value(), hits_before + 1);

    let second_bytes = buffer.payload(id).unwrap()[..first_bytes.len()].to_vec();
    assert_eq!(second_bytes, first_bytes);

    buffer.free_segment(id, false).unwrap();
}

/// Writing K entries, submitting, and re-opening the resulting location
/// yields identical payload bytes.
#[test]
fn submit_reopen_roundtrip() {
    let buffer = small_buffer(4);
    let stream = fixed_stream(9, 1);

    let id = buffer.request_segment(&stream.as_dyn(), 0).unwrap();
    write_entries(&buffer, id, 42, 0x7F);
    buffer.submit_segment(id).unwrap();

    buffer.flush_standby_list(None);

    let location = stream.encoder.location(0).unwrap();
    let (id, completed) = buffer
        .open_segment(&stream.as_dyn(), StreamAccessFlags::NONE, &location, false)
        .unwrap();
    assert!(completed);

    let expected = entry_pattern(42, 0x7F);
    assert_eq!(&buffer.payload(id).unwrap()[..expected.len()], &expected[..]);

    let control = buffer.control_element(id).unwrap();
    assert_eq!(control.raw_entry_count, 42);
    assert_eq!(control.entry_count, 42);

    buffer.free_segment(id, false).unwrap();
}

/// Submitting a segment with no entries records a hole at the encoder
/// and returns the segment to the pool without a location.
#[test]
fn empty_submit_records_hole() {
    let buffer = small_buffer(2);
    let stream = fixed_stream(5, 1);

    let id = buffer.request_segment(&stream.as_dyn(), 4).unwrap();
    let (completed, location) = buffer.submit_segment(id).unwrap();

    assert!(completed);
    assert!(location.is_none());
    assert_eq!(stream.encoder.drops(), vec![4]);
    assert_eq!(stream.encoder.writes(), 0);
    assert_eq!(buffer.metrics().segments_free.value(), 2);
}

/// Variable-sized streams keep the client's entry count and validate it
/// against the raw block count.
#[test]
fn variable_entry_size_submit() {
    let buffer = StreamBufferBuilder::new(0)
        .segment_size(1024)
        .num_segments(2)
        .build()
        .unwrap();

    let stream = common::TestStream::new(3, 1, StreamTypeDescriptor::variable(32));

    let id = buffer.request_segment(&stream.as_dyn(), 0).unwrap();

    // Client view: 8 raw blocks holding 5 logical entries. Variable
    // streams are not index-addressed.
    buffer.payload_mut(id).unwrap()[..32 * 8].fill(0x66);
    {
        let control = buffer.shared_control_mut(id).unwrap();
        control.raw_entry_count = 8;
        control.entry_count = 5;
        control.start_index = tracebuf::INVALID_ENTRY_INDEX;
    }

    let (completed, location) = buffer.submit_segment(id).unwrap();
    assert!(completed);

    let control = buffer.control_element(id).unwrap();
    assert_eq!(control.entry_count, 5);
    assert_eq!(control.raw_entry_count, 8);
    assert_eq!(location.unwrap().raw_entry_count, 8);
}

/// Temporally ordered streams get their cycle range extracted from the
/// first and last entry on submit.
#[test]
fn temporal_stream_extracts_cycle_range() {
    let buffer = StreamBufferBuilder::new(0)
        .segment_size(1024)
        .num_segments(2)
        .build()
        .unwrap();

    let stream = common::TestStream::new(7, 1, StreamTypeDescriptor::temporal(16));

    let id = buffer.request_segment(&stream.as_dyn(), 0).unwrap();

    {
        let payload = buffer.payload_mut(id).unwrap();
        for entry in 0..10u64 {
            let offset = entry as usize * 16;
            let cycle = 1000 + entry * 10;
            payload[offset..offset + 8].copy_from_slice(&cycle.to_le_bytes());
            payload[offset + 8..offset + 16].fill(0x01);
        }
        buffer.shared_control_mut(id).unwrap().raw_entry_count = 10;
    }

    let (completed, location) = buffer.submit_segment(id).unwrap();
    assert!(completed);

    let location = location.unwrap();
    assert_eq!(location.ranges.start_cycle, 1000);
    assert_eq!(location.ranges.end_cycle, 1090);
}
