//! Circular byte-range allocators.
//!
//! [`Ring`] hands out contiguous ranges from a fixed capacity and frees them in
//! allocation order. [`FrameRing`] layers per frame slot bookkeeping on top: every
//! byte allocated while a slot is current is recorded, and that volume is returned
//! to the ring when the slot comes around again, once its fence proved the GPU is done
//! reading it.

use crate::sync::FrameCounter;

/// Rounds `value` up to the next multiple of `alignment`. Zero alignment is a no-op.
///
/// Returns `None` when the rounded value does not fit in a `u64`.
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 {
        return Some(value);
    }
    value.checked_next_multiple_of(alignment)
}

/// A circular allocator over `[0, capacity)`.
///
/// Allocations are appended at the tail and freed from the head.
#[derive(Debug, Clone)]
pub struct Ring {
    head: u64,
    allocated: u64,
    capacity: u64,
}

impl Ring {
    pub fn new(capacity: u64) -> Self {
        Self {
            head: 0,
            allocated: 0,
            capacity,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes currently allocated.
    pub fn size(&self) -> u64 {
        self.allocated
    }

    /// Bytes that can still be allocated, padding included.
    pub fn available(&self) -> u64 {
        self.capacity - self.allocated
    }

    /// Offset of the oldest live allocation.
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Offset the next allocation would start at.
    pub fn tail(&self) -> u64 {
        if self.capacity == 0 {
            return 0;
        }
        (self.head + self.allocated) % self.capacity
    }

    /// Filler bytes needed so that an allocation of `size` does not straddle the
    /// physical end of the ring.
    pub fn padding_to_avoid_cross_over(&self, size: u64) -> u64 {
        let tail = self.tail();
        if tail + size > self.capacity {
            self.capacity - tail
        } else {
            0
        }
    }

    /// Reserves `size` bytes at the tail.
    ///
    /// Returns `None` when the ring does not have enough free bytes. The caller is
    /// responsible for inserting padding first, this method does not check for
    /// cross over.
    pub fn alloc(&mut self, size: u64) -> Option<u64> {
        if self.allocated + size <= self.capacity {
            let offset = self.tail();
            self.allocated += size;
            Some(offset)
        } else {
            None
        }
    }

    /// Releases the `size` oldest bytes.
    pub fn free(&mut self, size: u64) -> bool {
        if self.allocated >= size {
            if self.capacity > 0 {
                self.head = (self.head + size) % self.capacity;
            }
            self.allocated -= size;
            true
        } else {
            false
        }
    }
}

/// A [`Ring`] with one allocation tab per frame slot.
#[derive(Debug, Clone)]
pub struct FrameRing {
    ring: Ring,
    frame: FrameCounter,
    allocated_in_frame: u64,
    allocated_per_frame: Vec<u64>,
}

impl FrameRing {
    pub fn new(frame_count: usize, capacity: u64) -> Self {
        Self {
            ring: Ring::new(capacity),
            frame: FrameCounter::new(frame_count),
            allocated_in_frame: 0,
            allocated_per_frame: vec![0; frame_count],
        }
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn frame_index(&self) -> usize {
        self.frame.index()
    }

    /// Bytes allocated in the current slot so far, padding included.
    pub fn allocated_in_frame(&self) -> u64 {
        self.allocated_in_frame
    }

    /// Reserves `size` contiguous bytes, inserting padding when the range would
    /// cross the end of the ring.
    ///
    /// Padding counts against the current slot and is released with it.
    pub fn alloc(&mut self, size: u64) -> Option<u64> {
        if size > self.ring.capacity() {
            return None;
        }

        let padding = self.ring.padding_to_avoid_cross_over(size);
        if padding > 0 {
            self.ring.alloc(padding)?;
            self.allocated_in_frame += padding;
        }

        let offset = self.ring.alloc(size)?;
        self.allocated_in_frame += size;
        Some(offset)
    }

    /// Closes the tab of the current slot, moves to the next one and frees the
    /// volume that slot allocated during its previous use.
    ///
    /// Must only be called once the fence of the slot being entered has signaled.
    pub fn begin_frame(&mut self) {
        let current = self.frame.index();
        self.allocated_per_frame[current] = self.allocated_in_frame;
        self.allocated_in_frame = 0;

        let next = self.frame.advance();
        let to_free = std::mem::take(&mut self.allocated_per_frame[next]);
        let freed = self.ring.free(to_free);
        debug_assert!(freed, "frame ring tabs out of sync with the ring");
        log::trace!("Frame ring entered slot {next}, released {to_free} bytes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlaps(a: (u64, u64), b: (u64, u64)) -> bool {
        a.0 < b.0 + b.1 && b.0 < a.0 + a.1
    }

    #[test]
    fn align_up_rounds_to_multiples() {
        assert_eq!(align_up(0, 256), Some(0));
        assert_eq!(align_up(1, 256), Some(256));
        assert_eq!(align_up(256, 256), Some(256));
        assert_eq!(align_up(300, 256), Some(512));
        assert_eq!(align_up(10, 3), Some(12));
        assert_eq!(align_up(7, 0), Some(7));
    }

    #[test]
    fn align_up_refuses_values_past_u64_max() {
        assert_eq!(align_up(u64::MAX - 4, 16), None);
        assert_eq!(align_up(u64::MAX - 10, 256), None);
        assert_eq!(align_up(u64::MAX, 1), Some(u64::MAX));
        assert_eq!(align_up(u64::MAX - 255, 256), Some(u64::MAX - 255));
    }

    #[test]
    fn ring_allocates_sequentially() {
        let mut ring = Ring::new(1024);
        assert_eq!(ring.alloc(100), Some(0));
        assert_eq!(ring.alloc(200), Some(100));
        assert_eq!(ring.size(), 300);
        assert_eq!(ring.tail(), 300);
    }

    #[test]
    fn ring_fails_past_capacity() {
        let mut ring = Ring::new(256);
        assert_eq!(ring.alloc(256), Some(0));
        assert_eq!(ring.alloc(1), None);
        assert_eq!(ring.size(), 256);
    }

    #[test]
    fn ring_free_moves_head_and_wraps() {
        let mut ring = Ring::new(100);
        ring.alloc(60).unwrap();
        assert!(ring.free(60));
        assert_eq!(ring.head(), 60);
        assert_eq!(ring.alloc(40), Some(60));
        assert_eq!(ring.tail(), 0);
        assert!(!ring.free(41));
    }

    #[test]
    fn padding_only_when_crossing_the_end() {
        let mut ring = Ring::new(1000);
        ring.alloc(900).unwrap();
        assert_eq!(ring.padding_to_avoid_cross_over(100), 0);
        assert_eq!(ring.padding_to_avoid_cross_over(101), 100);
    }

    #[test]
    fn frame_ring_never_returns_a_range_straddling_the_end() {
        let capacity = 1000;
        let mut ring = FrameRing::new(3, capacity);
        let sizes = [96u64, 300, 17, 512, 256, 128, 7, 333, 640, 64, 200];
        for (i, size) in sizes.iter().cycle().take(200).enumerate() {
            if let Some(offset) = ring.alloc(*size) {
                assert!(offset + size <= capacity, "range {offset}+{size} crosses end");
            }
            if i % 3 == 2 {
                ring.begin_frame();
            }
        }
    }

    #[test]
    fn slots_do_not_overlap_until_retired() {
        let frames = 2;
        let mut ring = FrameRing::new(frames, 8192);
        let mut history: Vec<Vec<(u64, u64)>> = Vec::new();

        for frame in 0..32 {
            let mut live = Vec::new();
            for size in [256u64, 512, 768] {
                let offset = ring.alloc(size).expect("ring sized for two frames");
                live.push((offset, size));
            }
            // Ranges of the previous frames_in_flight - 1 frames are still owned by the GPU.
            for previous in history.iter().rev().take(frames - 1) {
                for a in &live {
                    for b in previous {
                        assert!(!overlaps(*a, *b), "frame {frame} reused {b:?}");
                    }
                }
            }
            history.push(live);
            ring.begin_frame();
        }
    }

    #[test]
    fn exhaustion_within_one_slot_is_deterministic() {
        let mut ring = FrameRing::new(2, 1024);
        assert!(ring.alloc(512).is_some());
        assert!(ring.alloc(512).is_some());
        for _ in 0..4 {
            assert_eq!(ring.alloc(256), None);
        }
    }

    #[test]
    fn oversized_requests_do_not_consume_padding() {
        let mut ring = FrameRing::new(2, 1024);
        assert_eq!(ring.alloc(2048), None);
        assert_eq!(ring.allocated_in_frame(), 0);
        assert_eq!(ring.alloc(1024), Some(0));
    }

    #[test]
    fn documented_wraparound_scenario() {
        // 300 byte requests aligned up to 256 become 512 bytes each.
        let mut ring = FrameRing::new(2, 1024);
        assert_eq!(ring.alloc(512), Some(0));
        assert_eq!(ring.alloc(512), Some(512));
        // Nothing has been retired yet.
        assert_eq!(ring.alloc(512), None);

        // Slot 1 has nothing to release.
        ring.begin_frame();
        assert_eq!(ring.alloc(512), None);

        // Back on slot 0, its 1024 bytes are released.
        ring.begin_frame();
        assert_eq!(ring.alloc(512), Some(0));
    }

    #[test]
    fn padding_is_released_with_its_slot() {
        let mut ring = FrameRing::new(2, 1000);
        assert_eq!(ring.alloc(600), Some(0));
        ring.begin_frame();
        // 400 bytes remain before the end: 500 needs padding, which fails for lack of space.
        assert_eq!(ring.alloc(500), None);
        assert_eq!(ring.allocated_in_frame(), 400);
        ring.begin_frame();
        // Slot 0 released 600 bytes; the padding of slot 1 is still in flight.
        assert_eq!(ring.ring().size(), 400);
        assert_eq!(ring.alloc(500), Some(0));
        ring.begin_frame();
        assert_eq!(ring.ring().size(), 500);
    }
}
