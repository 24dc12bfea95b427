use super::{Allocate, MemoryLocation};
use crate::{RendererError, RendererResult};
use ash::{vk, Device};
use std::{
    ptr::NonNull,
    sync::{Arc, Mutex, MutexGuard},
};
use vk_mem::{
    Alloc, Allocation, AllocationCreateFlags, AllocationCreateInfo, Allocator as GpuAllocator,
    MemoryUsage,
};

/// Abstraction over memory used by Vulkan resources.
pub type Memory = Allocation;

#[derive(Clone)]
pub struct Allocator {
    pub allocator: Arc<Mutex<GpuAllocator>>,
}

impl Allocator {
    pub fn new(allocator: Arc<Mutex<vk_mem::Allocator>>) -> Self {
        Self { allocator }
    }

    fn get_allocator(&self) -> RendererResult<MutexGuard<GpuAllocator>> {
        self.allocator.lock().map_err(|e| {
            RendererError::Allocator(format!("Failed to acquire lock on allocator: {e}"))
        })
    }
}

impl Allocate for Allocator {
    type Memory = Memory;

    fn create_buffer(
        &mut self,
        _device: &Device,
        size: usize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> RendererResult<(vk::Buffer, Self::Memory)> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size as _)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();

        let buffer_alloc_info = match location {
            MemoryLocation::CpuToGpu => AllocationCreateInfo {
                usage: MemoryUsage::AutoPreferHost,
                flags: AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                ..Default::default()
            },
            MemoryLocation::GpuOnly => AllocationCreateInfo {
                usage: MemoryUsage::AutoPreferDevice,
                ..Default::default()
            },
        };

        let allocator = self.get_allocator()?;

        let (buffer, allocation) =
            unsafe { allocator.create_buffer(&buffer_info, &buffer_alloc_info)? };

        Ok((buffer, allocation))
    }

    fn create_image(
        &mut self,
        _device: &Device,
        image_info: &vk::ImageCreateInfo,
    ) -> RendererResult<(vk::Image, Self::Memory)> {
        let image_alloc_info = AllocationCreateInfo {
            usage: MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };

        let allocator = self.get_allocator()?;

        let (image, allocation) =
            unsafe { allocator.create_image(image_info, &image_alloc_info)? };

        Ok((image, allocation))
    }

    fn destroy_buffer(
        &mut self,
        _device: &Device,
        buffer: vk::Buffer,
        mut memory: Self::Memory,
    ) -> RendererResult<()> {
        let allocator = self.get_allocator()?;

        unsafe { allocator.destroy_buffer(buffer, &mut memory) };

        Ok(())
    }

    fn destroy_image(
        &mut self,
        _device: &Device,
        image: vk::Image,
        mut memory: Self::Memory,
    ) -> RendererResult<()> {
        let allocator = self.get_allocator()?;

        unsafe { allocator.destroy_image(image, &mut memory) };

        Ok(())
    }

    fn map_memory(
        &mut self,
        _device: &Device,
        memory: &mut Self::Memory,
    ) -> RendererResult<NonNull<u8>> {
        let allocator = self.get_allocator()?;
        let data_ptr = unsafe { allocator.map_memory(memory)? };
        NonNull::new(data_ptr)
            .ok_or_else(|| RendererError::Allocator("Failed to map memory".into()))
    }

    fn unmap_memory(&mut self, _device: &Device, memory: &mut Self::Memory) -> RendererResult<()> {
        let allocator = self.get_allocator()?;
        unsafe { allocator.unmap_memory(memory) };
        Ok(())
    }

    fn flush_memory(&mut self, _device: &Device, memory: &Self::Memory) -> RendererResult<()> {
        // VMA skips the flush on host coherent memory types.
        let allocator = self.get_allocator()?;
        allocator.flush_allocation(memory, 0, vk::WHOLE_SIZE as _)?;
        Ok(())
    }
}
