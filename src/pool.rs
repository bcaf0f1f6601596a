use std::fs::OpenOptions;
use std::path::PathBuf;

#[cfg(debug_assertions)]
use log::{error, warn};
use memmap2::MmapMut;

use crate::control::{SegmentControlElement, CONTROL_ELEMENT_SIZE};
use crate::error::BufferError;
use crate::types::{BufferId, SegmentId};
#[cfg(debug_assertions)]
use crate::types::INVALID_ENTRY_INDEX;

/// Fill byte stamped over free segment payloads in debug builds.
#[cfg(debug_assertions)]
pub(crate) const DEAD_MEMORY_FILL: u8 = 0xDE;
/// Fill byte stamped over freshly issued segment payloads in debug builds.
#[cfg(debug_assertions)]
pub(crate) const CLEAR_MEMORY_FILL: u8 = 0xCD;

const PAGE_SIZE: usize = 4096;

/// Backing memory of a stream buffer.
///
/// The region holds `num_segments` payloads of `segment_size` bytes,
/// followed by `num_segments` control elements. Shared buffers map a
/// created file so the region can be attached by a client process;
/// private buffers use an anonymous mapping. The file is sized up front,
/// so a mapping that constructs successfully is committed and later
/// touches cannot fault on allocation.
pub(crate) struct SegmentPool {
    buffer: BufferId,
    ptr: *mut u8,
    len: usize,
    segment_size: usize,
    num_segments: u32,
    _map: MmapMut,
    path: Option<PathBuf>,
}

// SAFETY: the mapping lives as long as the pool and all mutation of its
// contents goes through raw pointers handed out below; coordination of
// those accesses is the engine's job, not the pool's.
unsafe impl Send for SegmentPool {}
unsafe impl Sync for SegmentPool {}

impl SegmentPool {
    pub fn new(
        buffer: BufferId,
        segment_size: usize,
        num_segments: u32,
        backing_path: Option<PathBuf>,
    ) -> Result<Self, BufferError> {
        let payload_len = segment_size * num_segments as usize;
        let len = payload_len + num_segments as usize * CONTROL_ELEMENT_SIZE;

        let (mut map, path) = match backing_path {
            Some(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)
                    .map_err(|e| Self::platform_error(buffer, len, e))?;

                file.set_len(len as u64)
                    .map_err(|e| Self::platform_error(buffer, len, e))?;

                // SAFETY: the file was just created and sized; the pool
                // keeps it mapped for its entire lifetime.
                let map = unsafe { MmapMut::map_mut(&file) }
                    .map_err(|e| Self::platform_error(buffer, len, e))?;

                (map, Some(path))
            }
            None => {
                let map =
                    MmapMut::map_anon(len).map_err(|e| Self::platform_error(buffer, len, e))?;

                (map, None)
            }
        };

        let ptr = map.as_mut_ptr();

        Ok(Self {
            buffer,
            ptr,
            len,
            segment_size,
            num_segments,
            _map: map,
            path,
        })
    }

    fn platform_error(buffer: BufferId, len: usize, source: std::io::Error) -> BufferError {
        BufferError::Platform {
            message: format!(
                "failed to allocate {} MiB of backing memory for stream buffer <id: {}>. \
                 Increase the system's memory limits or reduce the stream buffer size \
                 (see server.memmgmt.poolSize and client.memmgmt.poolSize)",
                len / (1024 * 1024),
                buffer
            ),
            source,
        }
    }

    /// Faults in every page of the region so that access after
    /// construction cannot hit an allocation failure mid-operation.
    pub fn touch(&self) {
        for offset in (0..self.len).step_by(PAGE_SIZE) {
            // SAFETY: offset < len; one volatile write faults the page.
            unsafe { std::ptr::write_volatile(self.ptr.add(offset), 0) };
        }
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn buffer_size(&self) -> usize {
        self.len
    }

    fn payload_offset(&self, segment: SegmentId) -> usize {
        debug_assert!(segment < self.num_segments);
        segment as usize * self.segment_size
    }

    fn control_offset(&self, segment: SegmentId) -> usize {
        debug_assert!(segment < self.num_segments);
        self.segment_size * self.num_segments as usize + segment as usize * CONTROL_ELEMENT_SIZE
    }

    /// Payload bytes of a segment. The region is shared with the client
    /// process and may change underneath the reference; the engine only
    /// interprets it after taking its private control snapshot.
    pub fn payload(&self, segment: SegmentId) -> &[u8] {
        // SAFETY: offset math stays inside the mapping.
        unsafe {
            std::slice::from_raw_parts(self.ptr.add(self.payload_offset(segment)), self.segment_size)
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn payload_mut(&self, segment: SegmentId) -> &mut [u8] {
        // SAFETY: as above; exclusive use of a held segment's payload is
        // the caller's contract.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.ptr.add(self.payload_offset(segment)),
                self.segment_size,
            )
        }
    }

    /// The client-visible control element of a segment. Untrusted.
    pub fn shared_control(&self, segment: SegmentId) -> &SegmentControlElement {
        // SAFETY: the control region is part of the mapping and the
        // element is naturally aligned at its slot.
        unsafe {
            &*(self.ptr.add(self.control_offset(segment)) as *const SegmentControlElement)
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn shared_control_mut(&self, segment: SegmentId) -> &mut SegmentControlElement {
        // SAFETY: as above.
        unsafe {
            &mut *(self.ptr.add(self.control_offset(segment)) as *mut SegmentControlElement)
        }
    }

    /// Stamps the payload with the debug fill pattern: DEAD for freed
    /// segments, CLEAR for segments about to be issued.
    #[cfg(debug_assertions)]
    pub fn dbg_sanity_fill(&self, segment: SegmentId, dead: bool) {
        let fill = if dead {
            DEAD_MEMORY_FILL
        } else {
            CLEAR_MEMORY_FILL
        };
        self.payload_mut(segment).fill(fill);
    }

    /// Checks the debug fill pattern of a segment payload.
    ///
    /// With `entry_size == 0` the segment must be dead (freed and
    /// untouched since). Otherwise the area covered by the control
    /// element's raw entry count must have been written and the area
    /// beyond it must still carry the clear pattern. Returns 0 when the
    /// payload is consistent, 1 on suspicious content, 2 on corruption.
    #[cfg(debug_assertions)]
    pub fn dbg_sanity_check(&self, segment: SegmentId, entry_size: usize) -> u32 {
        let control = *self.shared_control(segment);
        let payload = self.payload(segment);

        if entry_size == 0 {
            if test_memory(payload) != DEAD_MEMORY_FILL {
                error!(
                    "Segment sanity check failed. Segment {} of buffer {} has been \
                     modified while being marked as free.",
                    segment, self.buffer
                );
                return 2;
            }
            return 0;
        }

        let valid_len = entry_size * control.raw_entry_count as usize;
        if valid_len > payload.len() {
            warn!(
                "Segment sanity check failed. Segment {} of buffer {} claims more \
                 entries than fit the payload <stream: {}, sqn: {}, rec: {}, ec: {}>.",
                segment,
                self.buffer,
                control.link.stream,
                control.link.sequence_number,
                control.raw_entry_count,
                control.entry_count
            );
            return 1;
        }

        let mut error_level = 0;

        // The last written entry should carry at least one byte that is
        // not the clear pattern; an untouched tail up to the claimed
        // entry count means the client forgot to write its entries.
        if valid_len > 0 && control.start_index != INVALID_ENTRY_INDEX {
            if test_memory(&payload[valid_len - entry_size..valid_len]) == CLEAR_MEMORY_FILL {
                warn!(
                    "Segment sanity check failed. Segment {} of buffer {} seems to \
                     contain less entries than specified in the control element \
                     <stream: {}, sqn: {}, rec: {}, ec: {}>.",
                    segment,
                    self.buffer,
                    control.link.stream,
                    control.link.sequence_number,
                    control.raw_entry_count,
                    control.entry_count
                );
                error_level = 1;
            }
        }

        if valid_len < payload.len() && test_memory(&payload[valid_len..]) != CLEAR_MEMORY_FILL {
            warn!(
                "Segment sanity check failed. Segment {} of buffer {} has been \
                 modified beyond the last submitted entry \
                 <stream: {}, sqn: {}, rec: {}, ec: {}>.",
                segment,
                self.buffer,
                control.link.stream,
                control.link.sequence_number,
                control.raw_entry_count,
                control.entry_count
            );
            error_level = 1;
        }

        error_level
    }
}

/// Returns the fill byte when the region is uniformly filled with one of
/// the debug patterns, 0 otherwise.
#[cfg(debug_assertions)]
fn test_memory(region: &[u8]) -> u8 {
    let Some(&first) = region.first() else {
        return 0;
    };

    if region.iter().any(|&byte| byte != first) {
        return 0;
    }

    if first != DEAD_MEMORY_FILL && first != CLEAR_MEMORY_FILL {
        return 0;
    }

    first
}

impl Drop for SegmentPool {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}
