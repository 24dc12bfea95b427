use crate::{RendererError, RendererResult};
use ash::{vk, Device};
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator as GpuAllocator},
    MemoryLocation as GpuMemoryLocation,
};
use std::{
    ptr::NonNull,
    sync::{Arc, Mutex, MutexGuard},
};

use super::{Allocate, MemoryLocation};

/// Abstraction over memory used by Vulkan resources.
pub type Memory = Allocation;

#[derive(Clone)]
pub struct Allocator {
    pub allocator: Arc<Mutex<GpuAllocator>>,
}

impl Allocator {
    pub fn new(allocator: Arc<Mutex<gpu_allocator::vulkan::Allocator>>) -> Self {
        Self { allocator }
    }

    fn get_allocator(&self) -> RendererResult<MutexGuard<GpuAllocator>> {
        self.allocator.lock().map_err(|e| {
            RendererError::Allocator(format!("Failed to acquire lock on allocator: {e}"))
        })
    }
}

impl From<MemoryLocation> for GpuMemoryLocation {
    fn from(location: MemoryLocation) -> Self {
        match location {
            MemoryLocation::GpuOnly => GpuMemoryLocation::GpuOnly,
            MemoryLocation::CpuToGpu => GpuMemoryLocation::CpuToGpu,
        }
    }
}

impl Allocate for Allocator {
    type Memory = Memory;

    fn create_buffer(
        &mut self,
        device: &Device,
        size: usize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> RendererResult<(vk::Buffer, Self::Memory)> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size as _)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();

        let buffer = unsafe { device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let mut allocator = self.get_allocator()?;

        let allocation = allocator.allocate(&AllocationCreateDesc {
            name: "",
            requirements,
            location: location.into(),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())? };

        Ok((buffer, allocation))
    }

    fn create_image(
        &mut self,
        device: &Device,
        image_info: &vk::ImageCreateInfo,
    ) -> RendererResult<(vk::Image, Self::Memory)> {
        let image = unsafe { device.create_image(image_info, None)? };
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let mut allocator = self.get_allocator()?;

        let allocation = allocator.allocate(&AllocationCreateDesc {
            name: "",
            requirements,
            location: GpuMemoryLocation::GpuOnly,
            linear: image_info.tiling == vk::ImageTiling::LINEAR,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset())? };

        Ok((image, allocation))
    }

    fn destroy_buffer(
        &mut self,
        device: &Device,
        buffer: vk::Buffer,
        memory: Self::Memory,
    ) -> RendererResult<()> {
        let mut allocator = self.get_allocator()?;

        allocator.free(memory)?;
        unsafe { device.destroy_buffer(buffer, None) };

        Ok(())
    }

    fn destroy_image(
        &mut self,
        device: &Device,
        image: vk::Image,
        memory: Self::Memory,
    ) -> RendererResult<()> {
        let mut allocator = self.get_allocator()?;

        allocator.free(memory)?;
        unsafe { device.destroy_image(image, None) };

        Ok(())
    }

    fn map_memory(
        &mut self,
        _device: &Device,
        memory: &mut Self::Memory,
    ) -> RendererResult<NonNull<u8>> {
        // CpuToGpu allocations are persistently mapped by gpu-allocator.
        memory
            .mapped_ptr()
            .map(|ptr| ptr.cast::<u8>())
            .ok_or_else(|| RendererError::Allocator("Failed to get mapped memory pointer".into()))
    }

    fn unmap_memory(&mut self, _device: &Device, _memory: &mut Self::Memory) -> RendererResult<()> {
        Ok(())
    }

    fn flush_memory(&mut self, _device: &Device, _memory: &Self::Memory) -> RendererResult<()> {
        // gpu-allocator only hands out host coherent memory for CpuToGpu.
        Ok(())
    }
}
