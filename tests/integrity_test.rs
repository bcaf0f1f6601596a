//! Control element integrity: cookie validation on submit, entry count
//! validation, and cycle ordering for temporally ordered streams.

mod common;

use common::*;
use tracebuf::{BufferError, StreamBufferBuilder, StreamTypeDescriptor};

/// A client that corrupts the owner identity in the shared control
/// element gets a corruption error; the segment is purged and the buffer
/// keeps serving other segments.
#[test]
fn forged_sequence_number_fails_cookie_check() {
    let buffer = small_buffer(2);
    let stream = fixed_stream(5, 1);

    let id = buffer.request_segment(&stream.as_dyn(), 0).unwrap();
    write_entries(&buffer, id, 10, 0x44);

    buffer.shared_control_mut(id).unwrap().link.sequence_number = 1;

    assert!(matches!(
        buffer.submit_segment(id),
        Err(BufferError::Corruption(_))
    ));

    assert_eq!(buffer.metrics().cookie_failure.value(), 1);
    assert_eq!(stream.encoder.writes(), 0);

    // The segment went back to the pool and the buffer stays usable.
    assert_eq!(buffer.metrics().segments_free.value(), 2);

    let id = buffer.request_segment(&stream.as_dyn(), 1).unwrap();
    write_entries(&buffer, id, 10, 0x45);
    let (completed, location) = buffer.submit_segment(id).unwrap();
    assert!(completed);
    assert!(location.is_some());
}

/// The creation timestamp is sealed by the cookie as well.
#[test]
fn forged_start_time_fails_cookie_check() {
    let buffer = small_buffer(2);
    let stream = fixed_stream(5, 1);

    let id = buffer.request_segment(&stream.as_dyn(), 0).unwrap();
    write_entries(&buffer, id, 10, 0x44);

    buffer.shared_control_mut(id).unwrap().start_time ^= 1;

    assert!(matches!(
        buffer.submit_segment(id),
        Err(BufferError::Corruption(_))
    ));
    assert_eq!(buffer.metrics().cookie_failure.value(), 1);
}

/// Entry counts are client territory and pass the cookie, but a count
/// that exceeds the segment capacity is rejected as corruption.
#[test]
fn oversized_entry_count_is_rejected() {
    let buffer = small_buffer(2);
    let stream = fixed_stream(5, 1);

    let id = buffer.request_segment(&stream.as_dyn(), 0).unwrap();
    write_entries(&buffer, id, 10, 0x10);

    buffer.shared_control_mut(id).unwrap().raw_entry_count = 10_000;

    assert!(matches!(
        buffer.submit_segment(id),
        Err(BufferError::Corruption(_))
    ));

    // The cookie itself was fine; the count validation caught it.
    assert_eq!(buffer.metrics().cookie_failure.value(), 0);
    assert_eq!(buffer.metrics().segments_free.value(), 2);
}

/// Temporally ordered streams reject segments whose first entry is
/// younger than the last.
#[test]
fn unordered_cycles_are_rejected() {
    let buffer = StreamBufferBuilder::new(0)
        .segment_size(1024)
        .num_segments(2)
        .build()
        .unwrap();

    let stream = common::TestStream::new(7, 1, StreamTypeDescriptor::temporal(16));

    let id = buffer.request_segment(&stream.as_dyn(), 0).unwrap();

    {
        let payload = buffer.payload_mut(id).unwrap();
        for entry in 0..4u64 {
            let offset = entry as usize * 16;
            let cycle = 1000 - entry * 10;
            payload[offset..offset + 8].copy_from_slice(&cycle.to_le_bytes());
            payload[offset + 8..offset + 16].fill(0x01);
        }
        buffer.shared_control_mut(id).unwrap().raw_entry_count = 4;
    }

    assert!(matches!(
        buffer.submit_segment(id),
        Err(BufferError::Corruption(_))
    ));
    assert_eq!(stream.encoder.writes(), 0);
    assert_eq!(buffer.metrics().segments_free.value(), 2);
}

/// A shared buffer is backed by a file sized up front; the engine works
/// identically on top of it.
#[test]
fn shared_backing_roundtrip() {
    let dir = tempfile::tempdir().unwrap();

    let buffer = StreamBufferBuilder::new(3)
        .segment_size(ENTRY_SIZE as usize * 100)
        .num_segments(2)
        .shared_path(dir.path().join("buffer.bin"))
        .build()
        .unwrap();

    assert!(dir.path().join("buffer.bin").exists());

    let stream = fixed_stream(5, 1);
    let id = buffer.request_segment(&stream.as_dyn(), 0).unwrap();
    write_entries(&buffer, id, 25, 0x5A);
    buffer.submit_segment(id).unwrap();

    assert_eq!(stream.encoder.bytes(0).unwrap(), entry_pattern(25, 0x5A));

    // The backing file is removed with the buffer.
    drop(buffer);
    assert!(!dir.path().join("buffer.bin").exists());
}
