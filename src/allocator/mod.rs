#[cfg(not(any(feature = "gpu-allocator", feature = "vk-mem")))]
mod default;
#[cfg(feature = "gpu-allocator")]
mod gpu;
#[cfg(feature = "vk-mem")]
mod vkmem;

#[cfg(not(any(feature = "gpu-allocator", feature = "vk-mem")))]
pub use self::default::{Allocator, Memory};
#[cfg(feature = "gpu-allocator")]
pub use self::gpu::{Allocator, Memory};
#[cfg(all(feature = "vk-mem", not(feature = "gpu-allocator")))]
pub use self::vkmem::{Allocator, Memory};

use crate::RendererResult;
use ash::{vk, Device};
use std::ptr::NonNull;

/// Where a resource lives and who accesses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Device local memory, only the GPU reads and writes it.
    GpuOnly,
    /// Host visible memory written by the CPU and read by the GPU.
    CpuToGpu,
}

/// Base allocator trait for all implementations.
pub trait Allocate {
    type Memory;

    /// Create a Vulkan buffer.
    ///
    /// # Arguments
    ///
    /// * `device` - The Vulkan device.
    /// * `size` - The size in bytes of the buffer.
    /// * `usage` - The buffer usage flags.
    /// * `location` - Where the backing memory should live.
    fn create_buffer(
        &mut self,
        device: &Device,
        size: usize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> RendererResult<(vk::Buffer, Self::Memory)>;

    /// Create a device local Vulkan image.
    ///
    /// # Arguments
    ///
    /// * `device` - The Vulkan device.
    /// * `image_info` - The complete image description.
    fn create_image(
        &mut self,
        device: &Device,
        image_info: &vk::ImageCreateInfo,
    ) -> RendererResult<(vk::Image, Self::Memory)>;

    /// Destroys a buffer.
    ///
    /// # Arguments
    ///
    /// * `device` - The Vulkan device.
    /// * `buffer` - The buffer to destroy.
    /// * `memory` - The buffer memory to destroy.
    fn destroy_buffer(
        &mut self,
        device: &Device,
        buffer: vk::Buffer,
        memory: Self::Memory,
    ) -> RendererResult<()>;

    /// Destroys an image.
    ///
    /// # Arguments
    ///
    /// * `device` - The Vulkan device.
    /// * `image` - The image to destroy.
    /// * `memory` - The image memory to destroy.
    fn destroy_image(
        &mut self,
        device: &Device,
        image: vk::Image,
        memory: Self::Memory,
    ) -> RendererResult<()>;

    /// Map host visible memory for the lifetime of the resource.
    ///
    /// The returned pointer stays valid until [`Allocate::unmap_memory`] is called.
    fn map_memory(
        &mut self,
        device: &Device,
        memory: &mut Self::Memory,
    ) -> RendererResult<NonNull<u8>>;

    fn unmap_memory(&mut self, device: &Device, memory: &mut Self::Memory) -> RendererResult<()>;

    /// Make host writes visible to the device.
    ///
    /// Does nothing for host coherent memory.
    fn flush_memory(&mut self, device: &Device, memory: &Self::Memory) -> RendererResult<()>;
}
