//! Per frame slot synchronization objects.

use crate::RendererResult;
use ash::{vk, Device};

/// Round-robin index over `[0, count)` frame slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCounter {
    index: usize,
    count: usize,
}

impl FrameCounter {
    pub fn new(count: usize) -> Self {
        assert!(count > 0, "at least one frame slot is required");
        Self { index: 0, count }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Moves to the next slot and returns it.
    pub fn advance(&mut self) -> usize {
        self.index = (self.index + 1) % self.count;
        self.index
    }
}

/// Semaphores and fence guarding one frame slot.
///
/// * `image_available` is signaled by image acquisition and waited on by the submission
///   rendering into that image.
/// * `render_finished` is signaled by that submission and waited on by presentation.
/// * `in_flight` is signaled when the submission completes. It is created signaled so
///   that the first wait on a fresh slot returns immediately.
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &Device) -> RendererResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            Ok(Self {
                image_available: device.create_semaphore(&semaphore_info, None)?,
                render_finished: device.create_semaphore(&semaphore_info, None)?,
                in_flight: device.create_fence(&fence_info, None)?,
            })
        }
    }

    /// Blocks until the last submission of this slot completed. No timeout.
    pub fn wait(&self, device: &Device) -> RendererResult<()> {
        unsafe { device.wait_for_fences(&[self.in_flight], true, u64::MAX)? };
        Ok(())
    }

    pub fn reset(&self, device: &Device) -> RendererResult<()> {
        unsafe { device.reset_fences(&[self.in_flight])? };
        Ok(())
    }

    pub fn destroy(&self, device: &Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_wraps_round_robin() {
        let mut counter = FrameCounter::new(3);
        let visited: Vec<_> = (0..7).map(|_| counter.advance()).collect();
        assert_eq!(visited, vec![1, 2, 0, 1, 2, 0, 1]);
    }

    #[test]
    fn single_slot_counter_stays_on_zero() {
        let mut counter = FrameCounter::new(1);
        assert_eq!(counter.advance(), 0);
        assert_eq!(counter.index(), 0);
    }

    #[test]
    #[should_panic]
    fn zero_slots_is_refused() {
        FrameCounter::new(0);
    }
}
