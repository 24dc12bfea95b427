//! Round-robin per-frame command pools.

use crate::{sync::FrameCounter, DeviceContext, RendererError, RendererResult};
use ash::{vk, Device};

/// Command buffers pre-allocated for one frame slot and how many were handed out.
#[derive(Debug, Clone)]
pub struct CommandBufferSet {
    buffers: Vec<vk::CommandBuffer>,
    used: usize,
}

impl CommandBufferSet {
    pub fn new(buffers: Vec<vk::CommandBuffer>) -> Self {
        Self { buffers, used: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn buffers(&self) -> &[vk::CommandBuffer] {
        &self.buffers
    }

    /// Hand out the next unused buffer, `None` once all of them are in use.
    pub fn next(&mut self) -> Option<vk::CommandBuffer> {
        let buffer = *self.buffers.get(self.used)?;
        self.used += 1;
        Some(buffer)
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }
}

struct FramePool {
    pool: vk::CommandPool,
    buffers: CommandBufferSet,
}

/// One command pool per frame slot, each with a fixed number of primary command
/// buffers.
///
/// Separate pools guarantee that recording into the current slot never touches a
/// buffer of a slot the GPU may still be executing. Buffers are recorded with
/// `ONE_TIME_SUBMIT` and implicitly reset by `vkBeginCommandBuffer`, the pools
/// themselves are never reset.
pub struct FrameCommandPool {
    device: Device,
    frames: Vec<FramePool>,
    frame: FrameCounter,
    buffers_per_frame: usize,
}

impl FrameCommandPool {
    /// Create the pools.
    ///
    /// # Arguments
    ///
    /// * `context` - The device context.
    /// * `frame_count` - Number of frame slots in flight.
    /// * `buffers_per_frame` - Command buffers available to each frame.
    /// * `compute` - Allocate from the compute queue family instead of the graphics one.
    pub fn new(
        context: &DeviceContext,
        frame_count: usize,
        buffers_per_frame: usize,
        compute: bool,
    ) -> RendererResult<Self> {
        if frame_count == 0 || buffers_per_frame == 0 {
            return Err(RendererError::Init(
                "frame and command buffer counts should be at least one".into(),
            ));
        }

        let device = context.device().clone();
        let queue_family_index = if compute {
            context.compute_queue().family_index
        } else {
            context.graphics_queue().family_index
        };

        log::debug!(
            "Creating {frame_count} frame command pools of {buffers_per_frame} buffers on family {queue_family_index}"
        );

        let mut command_pool = Self {
            device,
            frames: Vec::with_capacity(frame_count),
            frame: FrameCounter::new(frame_count),
            buffers_per_frame,
        };

        for _ in 0..frame_count {
            let frame = command_pool.create_frame_pool(queue_family_index)?;
            command_pool.frames.push(frame);
        }

        Ok(command_pool)
    }

    fn create_frame_pool(&self, queue_family_index: u32) -> RendererResult<FramePool> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .flags(
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                    | vk::CommandPoolCreateFlags::TRANSIENT,
            );
        let pool = unsafe { self.device.create_command_pool(&pool_info, None)? };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(self.buffers_per_frame as u32);
        let buffers = match unsafe { self.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers,
            Err(err) => {
                unsafe { self.device.destroy_command_pool(pool, None) };
                return Err(err.into());
            }
        };

        Ok(FramePool {
            pool,
            buffers: CommandBufferSet::new(buffers),
        })
    }

    pub fn frame_index(&self) -> usize {
        self.frame.index()
    }

    pub fn buffers_per_frame(&self) -> usize {
        self.buffers_per_frame
    }

    /// Command buffers handed out in the current frame.
    pub fn used(&self) -> usize {
        self.frames[self.frame.index()].buffers.used()
    }

    /// The pool of the current frame slot.
    pub fn current_pool(&self) -> vk::CommandPool {
        self.frames[self.frame.index()].pool
    }

    /// Move to the next frame slot and make all of its buffers available again.
    ///
    /// Must only be called once the fence of the slot being entered has signaled.
    pub fn begin_frame(&mut self) {
        let index = self.frame.advance();
        self.frames[index].buffers.reset();
        log::trace!("Frame command pool entered slot {index}");
    }

    /// Return the next unused command buffer of the current frame.
    ///
    /// # Errors
    ///
    /// * [`RendererError::CommandBufferBudget`] - More buffers were requested this frame
    ///   than `buffers_per_frame`. This is a sizing bug in the caller.
    pub fn get_new_command_buffer(&mut self) -> RendererResult<vk::CommandBuffer> {
        let index = self.frame.index();
        match self.frames[index].buffers.next() {
            Some(buffer) => Ok(buffer),
            None => {
                log::error!(
                    "Frame {index} requested more than {} command buffers",
                    self.buffers_per_frame
                );
                debug_assert!(false, "command buffer budget exceeded");
                Err(RendererError::CommandBufferBudget {
                    per_frame: self.buffers_per_frame,
                })
            }
        }
    }

    /// Same as [`FrameCommandPool::get_new_command_buffer`] but also begins recording.
    pub fn begin_new_command_buffer(&mut self) -> RendererResult<vk::CommandBuffer> {
        let command_buffer = self.get_new_command_buffer()?;
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(command_buffer, &begin_info)?
        };
        Ok(command_buffer)
    }
}

impl Drop for FrameCommandPool {
    fn drop(&mut self) {
        log::debug!("Destroying frame command pools");
        unsafe {
            for frame in self.frames.drain(..) {
                self.device
                    .free_command_buffers(frame.pool, frame.buffers.buffers());
                self.device.destroy_command_pool(frame.pool, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn buffers(count: u64) -> Vec<vk::CommandBuffer> {
        (1..=count).map(vk::CommandBuffer::from_raw).collect()
    }

    #[test]
    fn hands_out_every_buffer_once_in_order() {
        let mut set = CommandBufferSet::new(buffers(3));
        let handed: Vec<_> = (0..3).map(|_| set.next().unwrap().as_raw()).collect();
        assert_eq!(handed, vec![1, 2, 3]);
        assert_eq!(set.used(), 3);
    }

    #[test]
    fn budget_plus_one_is_refused() {
        let mut set = CommandBufferSet::new(buffers(2));
        assert!(set.next().is_some());
        assert!(set.next().is_some());
        assert!(set.next().is_none());
        assert_eq!(set.used(), 2);
    }

    #[test]
    fn reset_makes_buffers_available_again() {
        let mut set = CommandBufferSet::new(buffers(2));
        set.next();
        set.next();
        set.reset();
        assert_eq!(set.next().map(|b| b.as_raw()), Some(1));
    }
}
