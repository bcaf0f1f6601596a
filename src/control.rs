use crate::types::{CycleCount, SegmentId, StreamSegmentLink, Timestamp};

/// Fixed-size header describing a segment, shared with the client.
///
/// One control element lives in the buffer's backing memory per segment
/// slot, directly observable and writable by the client process. The
/// server keeps a private copy per descriptor and treats the shared one
/// as untrusted; the trailing cookie ties the element to the owning pool,
/// slot and stream (see [`compute_control_cookie`]).
///
/// Layout is `#[repr(C)]`, little-endian, 64 bytes, cookie last.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentControlElement {
    pub link: StreamSegmentLink,

    // Written by the client while the segment is writable.
    pub entry_count: u32,
    pub raw_entry_count: u32,

    // The stream layer may set start_index to INVALID_ENTRY_INDEX to
    // indicate that no index-based addressing applies.
    pub start_index: u64,

    pub start_cycle: CycleCount,
    pub end_cycle: CycleCount,

    pub start_time: Timestamp,
    pub end_time: Timestamp,

    pub cookie: u64,
}

pub const CONTROL_ELEMENT_SIZE: usize = core::mem::size_of::<SegmentControlElement>();

const _: () = assert!(CONTROL_ELEMENT_SIZE == 64);
const _: () = assert!(core::mem::align_of::<SegmentControlElement>() == 8);

fn control_bytes(control: &SegmentControlElement) -> &[u8] {
    // SAFETY: repr(C) with naturally aligned integer fields and no padding;
    // every byte is initialized.
    unsafe {
        core::slice::from_raw_parts(
            control as *const SegmentControlElement as *const u8,
            CONTROL_ELEMENT_SIZE,
        )
    }
}

/// Computes the integrity tag for a control element.
///
/// The base value mixes the pool's secret cookie with the slot id, the
/// owner identity and the creation timestamp, so a writable segment's tag
/// validates exactly the fields the client must not change. Read-only
/// control elements must not be modified at all; for those the low 32 bits
/// are replaced by a keyed hash over the entire element (excluding the
/// cookie itself), seeded from the base.
pub(crate) fn compute_control_cookie(
    pool_cookie: u64,
    control: &SegmentControlElement,
    segment: SegmentId,
    read_only: bool,
) -> u64 {
    let mut cookie = pool_cookie;
    cookie ^= ((segment as u64) << 32) | segment as u64;
    cookie ^= (control.link.stream as u64) << 32;
    cookie ^= control.link.sequence_number as u64;
    cookie ^= control.start_time;

    if read_only {
        let seed = cookie as u32;
        let bytes = control_bytes(control);
        let hash = murmur3_32(&bytes[..CONTROL_ELEMENT_SIZE - core::mem::size_of::<u64>()], seed);

        cookie = (cookie & 0xFFFF_FFFF_0000_0000) | hash as u64;
    }

    cookie
}

pub(crate) fn test_control_cookie(
    pool_cookie: u64,
    control: &SegmentControlElement,
    segment: SegmentId,
    read_only: bool,
) -> bool {
    control.cookie == compute_control_cookie(pool_cookie, control, segment, read_only)
}

/// MurmurHash3 x86 32-bit.
pub(crate) fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);

        h ^= k;
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &byte) in tail.iter().enumerate() {
            k |= (byte as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;

    h
}
