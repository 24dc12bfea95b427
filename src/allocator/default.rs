use crate::{RendererError, RendererResult};
use ash::{vk, Device};
use std::ptr::NonNull;

use super::{Allocate, MemoryLocation};

/// Abstraction over memory used by Vulkan resources.
#[derive(Debug)]
pub struct Memory {
    memory: vk::DeviceMemory,
    coherent: bool,
}

#[derive(Clone)]
pub struct Allocator {
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl Allocator {
    pub fn new(memory_properties: vk::PhysicalDeviceMemoryProperties) -> Self {
        Self { memory_properties }
    }

    fn find_memory_type(
        &self,
        requirements: vk::MemoryRequirements,
        required_properties: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        (0..self.memory_properties.memory_type_count).find(|i| {
            requirements.memory_type_bits & (1 << i) != 0
                && self.memory_properties.memory_types[*i as usize]
                    .property_flags
                    .contains(required_properties)
        })
    }

    fn select_memory_type(
        &self,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
    ) -> RendererResult<(u32, bool)> {
        let found = match location {
            MemoryLocation::GpuOnly => self
                .find_memory_type(requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL)
                .map(|index| (index, false)),
            MemoryLocation::CpuToGpu => self
                .find_memory_type(
                    requirements,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )
                .map(|index| (index, true))
                .or_else(|| {
                    log::warn!("No host coherent memory type, falling back to explicit flushes");
                    self.find_memory_type(requirements, vk::MemoryPropertyFlags::HOST_VISIBLE)
                        .map(|index| (index, false))
                }),
        };

        found.ok_or_else(|| RendererError::Allocator("Failed to find suitable memory type.".into()))
    }

    fn allocate(
        &self,
        device: &Device,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
    ) -> RendererResult<Memory> {
        let (mem_type, coherent) = self.select_memory_type(requirements, location)?;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(mem_type);
        let memory = unsafe { device.allocate_memory(&alloc_info, None)? };

        Ok(Memory { memory, coherent })
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

        let mem_requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let memory = self.allocate(device, mem_requirements, location)?;
        unsafe { device.bind_buffer_memory(buffer, memory.memory, 0)? };

        Ok((buffer, memory))
    }

    fn create_image(
        &mut self,
        device: &Device,
        image_info: &vk::ImageCreateInfo,
    ) -> RendererResult<(vk::Image, Self::Memory)> {
        let image = unsafe { device.create_image(image_info, None)? };
        let mem_requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory = self.allocate(device, mem_requirements, MemoryLocation::GpuOnly)?;
        unsafe { device.bind_image_memory(image, memory.memory, 0)? };

        Ok((image, memory))
    }

    fn destroy_buffer(
        &mut self,
        device: &Device,
        buffer: vk::Buffer,
        memory: Self::Memory,
    ) -> RendererResult<()> {
        unsafe {
            device.destroy_buffer(buffer, None);
            device.free_memory(memory.memory, None);
        }

        Ok(())
    }

    fn destroy_image(
        &mut self,
        device: &Device,
        image: vk::Image,
        memory: Self::Memory,
    ) -> RendererResult<()> {
        unsafe {
            device.destroy_image(image, None);
            device.free_memory(memory.memory, None);
        }

        Ok(())
    }

    fn map_memory(
        &mut self,
        device: &Device,
        memory: &mut Self::Memory,
    ) -> RendererResult<NonNull<u8>> {
        let data_ptr = unsafe {
            device.map_memory(memory.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
        };
        NonNull::new(data_ptr as *mut u8)
            .ok_or_else(|| RendererError::Allocator("Failed to map memory".into()))
    }

    fn unmap_memory(&mut self, device: &Device, memory: &mut Self::Memory) -> RendererResult<()> {
        unsafe { device.unmap_memory(memory.memory) };
        Ok(())
    }

    fn flush_memory(&mut self, device: &Device, memory: &Self::Memory) -> RendererResult<()> {
        if memory.coherent {
            return Ok(());
        }

        let range = vk::MappedMemoryRange::builder()
            .memory(memory.memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe { device.flush_mapped_memory_ranges(&[range])? };
        Ok(())
    }
}
