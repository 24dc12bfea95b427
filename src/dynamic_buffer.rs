//! Per-frame transient uniform, vertex and index data.

use crate::{
    allocator::{Allocate, Allocator, Memory, MemoryLocation},
    ring::{align_up, FrameRing},
    DeviceContext, RendererError, RendererResult,
};
use ash::{vk, Device};
use std::{mem, ptr::NonNull};

/// Minimum alignment of every dynamic allocation.
pub const DYNAMIC_BUFFER_ALIGNMENT: u64 = 256;

/// A persistently mapped buffer handing out ranges that live for one frame slot.
///
/// Allocations made while slot `k` is current are released when slot `k` is entered
/// again, [`DynamicBuffer::begin_frame`] must therefore only be called once that slot's
/// fence has signaled. The memory is expected to be host coherent, writes through the
/// returned pointers are not flushed.
pub struct DynamicBuffer {
    device: Device,
    allocator: Allocator,
    name: String,
    buffer: vk::Buffer,
    memory: Option<Memory>,
    mapped: NonNull<u8>,
    ring: FrameRing,
    alignment: u64,
    total_size: u64,
}

impl DynamicBuffer {
    /// Create the buffer.
    ///
    /// # Arguments
    ///
    /// * `context` - The device context.
    /// * `frame_count` - Number of frame slots in flight.
    /// * `total_size` - Requested size in bytes. It is rounded up so that every slot gets
    ///   a whole number of aligned chunks.
    /// * `name` - Debug name of the buffer.
    pub fn new(
        context: &DeviceContext,
        frame_count: usize,
        total_size: u64,
        name: &str,
    ) -> RendererResult<Self> {
        if frame_count == 0 {
            return Err(RendererError::Init(
                "'frame_count' parameter should be at least one".into(),
            ));
        }

        let device = context.device().clone();
        let mut allocator = context.allocator();

        let min_alignment = context
            .properties()
            .limits
            .min_uniform_buffer_offset_alignment;
        let alignment = DYNAMIC_BUFFER_ALIGNMENT.max(min_alignment);
        let total_size = alignment
            .checked_mul(frame_count as u64)
            .and_then(|chunk| align_up(total_size, chunk))
            .ok_or_else(|| {
                RendererError::Init(format!("dynamic buffer size {total_size} is too large"))
            })?;

        log::debug!("Creating dynamic buffer '{name}' of {total_size} bytes");
        let (buffer, mut memory) = allocator.create_buffer(
            &device,
            total_size as usize,
            vk::BufferUsageFlags::UNIFORM_BUFFER
                | vk::BufferUsageFlags::VERTEX_BUFFER
                | vk::BufferUsageFlags::INDEX_BUFFER,
            MemoryLocation::CpuToGpu,
        )?;

        let mapped = match allocator.map_memory(&device, &mut memory) {
            Ok(mapped) => mapped,
            Err(err) => {
                allocator.destroy_buffer(&device, buffer, memory)?;
                return Err(err);
            }
        };
        context.set_object_name(buffer, name);

        Ok(Self {
            device,
            allocator,
            name: name.to_owned(),
            buffer,
            memory: Some(memory),
            mapped,
            ring: FrameRing::new(frame_count, total_size),
            alignment,
            total_size,
        })
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Bytes allocated in the current frame slot, padding included.
    pub fn allocated_in_frame(&self) -> u64 {
        self.ring.allocated_in_frame()
    }

    /// Reserve `size` bytes for this frame.
    ///
    /// Returns a CPU pointer into the mapped buffer and the descriptor of the range.
    /// The range is `size` aligned up to [`DynamicBuffer::alignment`], empty requests
    /// get one aligned chunk.
    ///
    /// # Errors
    ///
    /// * [`RendererError::OutOfMemory`] - The buffer cannot hold one frame worth of data.
    ///   This is a configuration error, the same workload will fail every frame.
    pub fn alloc_constant_buffer(
        &mut self,
        size: u64,
    ) -> RendererResult<(NonNull<u8>, vk::DescriptorBufferInfo)> {
        let Some(size) = aligned_range(size, self.alignment) else {
            return Err(self.out_of_memory(size));
        };
        let Some(offset) = self.ring.alloc(size) else {
            return Err(self.out_of_memory(size));
        };

        // The ring never returns a range past the end of the mapping.
        let ptr = unsafe { NonNull::new_unchecked(self.mapped.as_ptr().add(offset as usize)) };
        let descriptor = vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset,
            range: size,
        };
        Ok((ptr, descriptor))
    }

    fn out_of_memory(&self, requested: u64) -> RendererError {
        log::error!(
            "Ran out of memory for dynamic buffer '{}', please increase its size",
            self.name
        );
        RendererError::OutOfMemory {
            heap: self.name.clone(),
            requested,
            capacity: self.total_size,
        }
    }

    /// Copy `data` into a fresh allocation and return its descriptor.
    pub fn write_slice<T: Copy>(
        &mut self,
        data: &[T],
    ) -> RendererResult<vk::DescriptorBufferInfo> {
        let size = mem::size_of_val(data) as u64;
        let (ptr, descriptor) = self.alloc_constant_buffer(size)?;
        unsafe {
            let mut align = ash::util::Align::new(
                ptr.as_ptr().cast(),
                mem::align_of::<T>() as _,
                size,
            );
            align.copy_from_slice(data);
        }
        Ok(descriptor)
    }

    /// Copy a single value, typically a uniform block, into a fresh allocation.
    pub fn write_constant_buffer<T: Copy>(
        &mut self,
        data: &T,
    ) -> RendererResult<vk::DescriptorBufferInfo> {
        self.write_slice(std::slice::from_ref(data))
    }

    pub fn alloc_vertex_buffer(
        &mut self,
        vertex_count: u64,
        stride: u64,
    ) -> RendererResult<(NonNull<u8>, vk::DescriptorBufferInfo)> {
        let size = vertex_count
            .checked_mul(stride)
            .ok_or_else(|| self.out_of_memory(u64::MAX))?;
        self.alloc_constant_buffer(size)
    }

    pub fn alloc_index_buffer(
        &mut self,
        index_count: u64,
        stride: u64,
    ) -> RendererResult<(NonNull<u8>, vk::DescriptorBufferInfo)> {
        let size = index_count
            .checked_mul(stride)
            .ok_or_else(|| self.out_of_memory(u64::MAX))?;
        self.alloc_constant_buffer(size)
    }

    /// Point a `UNIFORM_BUFFER_DYNAMIC` binding of `descriptor_set` at this buffer.
    ///
    /// The per draw offset is then given as the dynamic offset of
    /// `vkCmdBindDescriptorSets`, using the `offset` of the allocation descriptor.
    pub fn write_dynamic_descriptor(
        &self,
        descriptor_set: vk::DescriptorSet,
        binding: u32,
        range: u64,
    ) {
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset: 0,
            range,
        }];
        let writes = [vk::WriteDescriptorSet::builder()
            .dst_set(descriptor_set)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
            .buffer_info(&buffer_info)
            .build()];
        unsafe { self.device.update_descriptor_sets(&writes, &[]) }
    }

    /// Retire the allocations of the slot being entered.
    pub fn begin_frame(&mut self) {
        self.ring.begin_frame();
    }
}

/// Size of the range handed out for a `size` bytes request. Empty requests still get
/// one aligned chunk, a descriptor range can not be zero.
fn aligned_range(size: u64, alignment: u64) -> Option<u64> {
    align_up(size.max(1), alignment)
}

impl Drop for DynamicBuffer {
    fn drop(&mut self) {
        log::debug!("Destroying dynamic buffer '{}'", self.name);
        if let Some(mut memory) = self.memory.take() {
            let unmapped = self.allocator.unmap_memory(&self.device, &mut memory);
            let destroyed = self
                .allocator
                .destroy_buffer(&self.device, self.buffer, memory);
            if let Err(err) = unmapped.and(destroyed) {
                log::error!("Failed to destroy dynamic buffer '{}': {err}", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_are_rounded_to_the_alignment() {
        assert_eq!(aligned_range(1, 256), Some(256));
        assert_eq!(aligned_range(300, 256), Some(512));
        assert_eq!(aligned_range(512, 256), Some(512));
        assert_eq!(aligned_range(64, 1024), Some(1024));
    }

    #[test]
    fn empty_requests_get_one_chunk() {
        assert_eq!(aligned_range(0, 256), Some(256));
    }

    #[test]
    fn huge_requests_are_refused_instead_of_wrapping() {
        assert_eq!(aligned_range(u64::MAX - 10, 256), None);
        assert_eq!(aligned_range(u64::MAX - 4, 16), None);

        let mut ring = FrameRing::new(2, 1024);
        assert_eq!(aligned_range(u64::MAX - 10, 256).and_then(|size| ring.alloc(size)), None);
        assert_eq!(aligned_range(2048, 256).and_then(|size| ring.alloc(size)), None);
        assert_eq!(ring.allocated_in_frame(), 0);
        assert_eq!(aligned_range(0, 256).and_then(|size| ring.alloc(size)), Some(0));
    }
}
