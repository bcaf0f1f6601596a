use std::collections::HashMap;

use crate::segment::{Segment, SegmentFlags};
use crate::sync::Ordering;
use crate::types::{SegmentId, StoreStreamSegmentLink, INVALID_SEGMENT_ID};

/// LRU of read-only segments awaiting reuse, keyed by
/// `(store, stream, sequence number)`.
///
/// The list is circular and doubly linked through the descriptors'
/// `next`/`prev` index links; `head` is the most recently inserted
/// element and `head.prev` the eviction victim. The index maps cache
/// keys to list members. All mutation happens under the buffer's
/// standby mutex, which wraps this whole structure.
pub(crate) struct StandbyList {
    head: SegmentId,
    index: HashMap<StoreStreamSegmentLink, SegmentId, ahash::RandomState>,
}

impl StandbyList {
    pub fn new() -> Self {
        Self {
            head: INVALID_SEGMENT_ID,
            index: HashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == INVALID_SEGMENT_ID
    }

    pub fn contains(&self, key: &StoreStreamSegmentLink) -> bool {
        self.index.contains_key(key)
    }

    /// The least recently used element, next in line for eviction.
    pub fn victim(&self, segments: &[Segment]) -> Option<SegmentId> {
        if self.head == INVALID_SEGMENT_ID {
            return None;
        }

        Some(segments[self.head as usize].prev.load(Ordering::Acquire))
    }

    /// Links a segment into the list and the index. The caller has
    /// already ruled out a duplicate key.
    pub fn insert(&mut self, segments: &[Segment], key: StoreStreamSegmentLink, seg: &Segment) {
        debug_assert!(!self.index.contains_key(&key));

        self.index.insert(key, seg.id);
        self.enqueue(segments, seg);
    }

    /// Removes the segment stored under `key` from both structures.
    pub fn remove(
        &mut self,
        segments: &[Segment],
        key: &StoreStreamSegmentLink,
    ) -> Option<SegmentId> {
        let id = self.index.remove(key)?;
        self.dequeue(segments, &segments[id as usize]);

        Some(id)
    }

    /// Membership in head-to-tail order, snapshotted for walks that
    /// remove elements along the way.
    pub fn snapshot(&self, segments: &[Segment]) -> Vec<SegmentId> {
        let mut ids = Vec::with_capacity(self.index.len());

        if self.head == INVALID_SEGMENT_ID {
            return ids;
        }

        let mut current = self.head;
        loop {
            ids.push(current);

            current = segments[current as usize].next.load(Ordering::Acquire);
            if current == self.head {
                break;
            }
        }

        ids
    }

    fn enqueue(&mut self, segments: &[Segment], seg: &Segment) {
        debug_assert!(seg.flags().contains(SegmentFlags::IN_USE));
        debug_assert!(seg.flags().contains(SegmentFlags::READ_ONLY));
        debug_assert!(seg.flags().contains(SegmentFlags::CACHEABLE));
        debug_assert_eq!(seg.next.load(Ordering::Acquire), INVALID_SEGMENT_ID);
        debug_assert_eq!(seg.prev.load(Ordering::Acquire), INVALID_SEGMENT_ID);

        if self.head == INVALID_SEGMENT_ID {
            seg.next.store(seg.id, Ordering::Release);
            seg.prev.store(seg.id, Ordering::Release);

            self.head = seg.id;
        } else {
            let head = &segments[self.head as usize];
            let tail_id = head.prev.load(Ordering::Acquire);

            seg.next.store(head.id, Ordering::Release);
            seg.prev.store(tail_id, Ordering::Release);

            segments[tail_id as usize].next.store(seg.id, Ordering::Release);
            head.prev.store(seg.id, Ordering::Release);

            let flags = seg.flags();
            if !flags.contains(SegmentFlags::LOW_PRIORITY) || flags.contains(SegmentFlags::PREFETCH)
            {
                // Make the segment the head of the list so it is not
                // chosen as victim next time. Low-priority segments stay
                // at the tail unless a pending prefetch needs one chance
                // to be used.
                self.head = seg.id;

                seg.remove_flags(SegmentFlags::PREFETCH);
            }
        }
    }

    fn dequeue(&mut self, segments: &[Segment], seg: &Segment) {
        debug_assert!(seg.flags().contains(SegmentFlags::IN_USE));
        debug_assert!(seg.flags().contains(SegmentFlags::READ_ONLY));
        debug_assert!(seg.flags().contains(SegmentFlags::CACHEABLE));
        debug_assert_ne!(self.head, INVALID_SEGMENT_ID);

        let next = seg.next.load(Ordering::Acquire);
        let prev = seg.prev.load(Ordering::Acquire);
        debug_assert_ne!(next, INVALID_SEGMENT_ID);
        debug_assert_ne!(prev, INVALID_SEGMENT_ID);

        if next == seg.id {
            debug_assert_eq!(self.head, seg.id);
            self.head = INVALID_SEGMENT_ID;
        } else {
            segments[prev as usize].next.store(next, Ordering::Release);
            segments[next as usize].prev.store(prev, Ordering::Release);

            if self.head == seg.id {
                self.head = next;
            }
        }

        seg.set_submitted(false);
        seg.next.store(INVALID_SEGMENT_ID, Ordering::Release);
        seg.prev.store(INVALID_SEGMENT_ID, Ordering::Release);
    }
}
