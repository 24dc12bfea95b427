//! Staging memory for texture and mesh uploads.
//!
//! Producers carve ranges out of one host visible buffer with a bump allocator and
//! queue the copies that read them. [`UploadHeap::flush_and_finish`] records every
//! queued barrier and copy, submits them and blocks until the GPU is done, after which
//! the whole staging buffer is reused from offset zero.

use crate::{
    allocator::{Allocate, Allocator, Memory, MemoryLocation},
    flush_gate::FlushGate,
    ring::align_up,
    DeviceContext, Queue, RendererError, RendererResult,
};
use ash::{vk, Device};
use std::{
    ptr::NonNull,
    sync::{Mutex, MutexGuard},
};

/// An image layout transition queued for the next flush.
#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access_mask: vk::AccessFlags,
    pub dst_access_mask: vk::AccessFlags,
    pub subresource_range: vk::ImageSubresourceRange,
}

impl ImageBarrier {
    /// Transition from an undefined layout to a copy destination.
    pub fn to_transfer_dst(image: vk::Image, subresource_range: vk::ImageSubresourceRange) -> Self {
        Self {
            image,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            src_access_mask: vk::AccessFlags::empty(),
            dst_access_mask: vk::AccessFlags::TRANSFER_WRITE,
            subresource_range,
        }
    }

    /// Transition a copied image to be sampled from fragment shaders.
    pub fn to_shader_read(image: vk::Image, subresource_range: vk::ImageSubresourceRange) -> Self {
        Self {
            image,
            old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
            dst_access_mask: vk::AccessFlags::SHADER_READ,
            subresource_range,
        }
    }

    fn to_vk(self) -> vk::ImageMemoryBarrier {
        vk::ImageMemoryBarrier::builder()
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(self.subresource_range)
            .src_access_mask(self.src_access_mask)
            .dst_access_mask(self.dst_access_mask)
            .build()
    }
}

/// Work queued for the next flush.
#[derive(Debug, Default)]
pub struct PendingUploads {
    pub pre_barriers: Vec<ImageBarrier>,
    pub image_copies: Vec<(vk::Image, vk::BufferImageCopy)>,
    pub buffer_copies: Vec<(vk::Buffer, vk::BufferCopy)>,
    pub post_barriers: Vec<ImageBarrier>,
}

impl PendingUploads {
    pub fn is_empty(&self) -> bool {
        self.pre_barriers.is_empty()
            && self.image_copies.is_empty()
            && self.buffer_copies.is_empty()
            && self.post_barriers.is_empty()
    }
}

/// Bump allocator bookkeeping of the staging buffer.
///
/// Unlike the frame ring this never wraps: it is drained to zero by every flush.
#[derive(Debug)]
pub struct StagingArena {
    capacity: u64,
    cursor: u64,
    pending: PendingUploads,
}

impl StagingArena {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            cursor: 0,
            pending: PendingUploads::default(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes used since the last flush.
    pub fn used(&self) -> u64 {
        self.cursor
    }

    pub fn remaining(&self) -> u64 {
        self.capacity - self.cursor
    }

    pub fn pending(&self) -> &PendingUploads {
        &self.pending
    }

    /// Reserve `size` bytes aligned to `align`, both the start and the size are aligned.
    ///
    /// Returns `None` when the space left before the end is too small.
    pub fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        let align = align.max(1);
        let offset = align_up(self.cursor, align)?;
        let end = offset.checked_add(align_up(size, align)?)?;
        if end > self.capacity {
            return None;
        }
        self.cursor = end;
        Some(offset)
    }

    pub fn add_image_copy(&mut self, image: vk::Image, region: vk::BufferImageCopy) {
        self.pending.image_copies.push((image, region));
    }

    pub fn add_buffer_copy(&mut self, buffer: vk::Buffer, region: vk::BufferCopy) {
        self.pending.buffer_copies.push((buffer, region));
    }

    pub fn add_pre_barrier(&mut self, barrier: ImageBarrier) {
        self.pending.pre_barriers.push(barrier);
    }

    pub fn add_post_barrier(&mut self, barrier: ImageBarrier) {
        self.pending.post_barriers.push(barrier);
    }

    /// Take the queued work and rewind the cursor to the start of the buffer.
    ///
    /// When `take_barriers` is false the queued barriers are dropped: the caller records
    /// the layout transitions of the copies itself.
    pub fn take(&mut self, take_barriers: bool) -> PendingUploads {
        self.cursor = 0;
        let mut batch = std::mem::take(&mut self.pending);
        if !take_barriers {
            batch.pre_barriers.clear();
            batch.post_barriers.clear();
        }
        batch
    }
}

/// Allocation, batching and flush exclusion of an upload heap, without the GPU side.
///
/// Writers bracket their staging writes with [`UploadQueue::begin_alloc`] and
/// [`UploadQueue::end_alloc`]. A flush takes the queued work only once every open
/// bracket closed, and hands it to a submit callback while allocations are blocked.
#[derive(Debug)]
pub struct UploadQueue {
    gate: FlushGate,
    arena: Mutex<StagingArena>,
    capacity: u64,
}

impl UploadQueue {
    pub fn new(capacity: u64) -> Self {
        Self {
            gate: FlushGate::new(),
            arena: Mutex::new(StagingArena::new(capacity)),
            capacity,
        }
    }

    fn lock(&self) -> RendererResult<MutexGuard<'_, StagingArena>> {
        self.arena
            .lock()
            .map_err(|e| RendererError::Allocator(format!("Upload heap lock poisoned: {e}")))
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes used since the last flush.
    pub fn used(&self) -> RendererResult<u64> {
        Ok(self.lock()?.used())
    }

    /// Number of flushes completed so far.
    pub fn flush_count(&self) -> RendererResult<u64> {
        self.gate.epoch()
    }

    /// Bump allocate without registering as a writer. Waits for a running flush.
    pub fn try_alloc(&self, size: u64, align: u64) -> RendererResult<Option<u64>> {
        self.gate.wait_for_flush()?;
        Ok(self.lock()?.alloc(size, align))
    }

    /// Allocate, calling [`UploadQueue::flush`] with `submit` while the heap is full.
    ///
    /// On success the caller is registered as a writer until
    /// [`UploadQueue::end_alloc`]. When several writers find the heap full at once only
    /// the first one flushes, the others retry in the emptied heap.
    ///
    /// # Errors
    ///
    /// * [`RendererError::OutOfMemory`] - `size` can never fit in the heap.
    pub fn begin_alloc<F>(&self, size: u64, align: u64, mut submit: F) -> RendererResult<u64>
    where
        F: FnMut(PendingUploads) -> RendererResult<()>,
    {
        let capacity = self.capacity;
        match align_up(size, align.max(1)) {
            Some(aligned) if aligned <= capacity => {}
            _ => {
                log::error!("Upload of {size} bytes can never fit in the {capacity} bytes heap");
                return Err(RendererError::OutOfMemory {
                    heap: "upload heap".into(),
                    requested: size,
                    capacity,
                });
            }
        }

        loop {
            let epoch = self.gate.enter()?;
            let offset = match self.lock() {
                Ok(mut arena) => arena.alloc(size, align),
                Err(err) => {
                    self.gate.leave()?;
                    return Err(err);
                }
            };
            if let Some(offset) = offset {
                return Ok(offset);
            }

            self.gate.leave()?;
            if self.gate.epoch()? == epoch {
                log::trace!("Upload heap full, flushing before allocating {size} bytes");
                self.flush(true, &mut submit)?;
            }
        }
    }

    /// Close an allocation opened with [`UploadQueue::begin_alloc`].
    pub fn end_alloc(&self) -> RendererResult<()> {
        self.gate.leave()
    }

    pub fn add_image_copy(
        &self,
        image: vk::Image,
        region: vk::BufferImageCopy,
    ) -> RendererResult<()> {
        self.lock()?.add_image_copy(image, region);
        Ok(())
    }

    pub fn add_buffer_copy(
        &self,
        buffer: vk::Buffer,
        region: vk::BufferCopy,
    ) -> RendererResult<()> {
        self.lock()?.add_buffer_copy(buffer, region);
        Ok(())
    }

    pub fn add_pre_barrier(&self, barrier: ImageBarrier) -> RendererResult<()> {
        self.lock()?.add_pre_barrier(barrier);
        Ok(())
    }

    pub fn add_post_barrier(&self, barrier: ImageBarrier) -> RendererResult<()> {
        self.lock()?.add_post_barrier(barrier);
        Ok(())
    }

    /// Wait for a concurrent flush, close the gate, wait for open writers and pass the
    /// queued work to `submit`.
    ///
    /// The arena stays locked until `submit` returns, nothing can allocate in the
    /// staging memory the batch still reads.
    pub fn flush<F>(&self, do_barriers: bool, submit: F) -> RendererResult<()>
    where
        F: FnOnce(PendingUploads) -> RendererResult<()>,
    {
        self.gate.begin_flush()?;
        let result = self.flush_closed(do_barriers, submit);
        self.gate.end_flush()?;
        result
    }

    fn flush_closed<F>(&self, do_barriers: bool, submit: F) -> RendererResult<()>
    where
        F: FnOnce(PendingUploads) -> RendererResult<()>,
    {
        let mut arena = self.lock()?;
        let used = arena.used();
        let batch = arena.take(do_barriers);
        log::trace!(
            "Flushing upload heap: {used} bytes, {} image copies, {} buffer copies, {} barriers",
            batch.image_copies.len(),
            batch.buffer_copies.len(),
            batch.pre_barriers.len() + batch.post_barriers.len()
        );
        submit(batch)
    }
}

/// A range of the staging buffer.
#[derive(Debug, Clone, Copy)]
pub struct UploadAlloc {
    ptr: NonNull<u8>,
    offset: u64,
    size: u64,
}

impl UploadAlloc {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Offset in the staging buffer, to be used as `buffer_offset` / `src_offset` of
    /// the queued copy.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Requested size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Open staging allocation. The heap cannot flush while a guard is alive.
pub struct UploadGuard<'a> {
    heap: &'a UploadHeap,
    alloc: UploadAlloc,
}

impl UploadGuard<'_> {
    pub fn alloc(&self) -> UploadAlloc {
        self.alloc
    }

    pub fn offset(&self) -> u64 {
        self.alloc.offset
    }

    /// The staging bytes reserved by this guard.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // The range is exclusively ours until the guard drops, flushes wait for it.
        unsafe { std::slice::from_raw_parts_mut(self.alloc.as_ptr(), self.alloc.size as usize) }
    }

    pub fn heap(&self) -> &UploadHeap {
        self.heap
    }
}

impl Drop for UploadGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.heap.end_alloc() {
            log::error!("Failed to close upload allocation: {err}");
        }
    }
}

struct HeapMemory {
    allocator: Allocator,
    memory: Option<Memory>,
}

/// A host visible staging buffer with deferred copy and barrier batching.
///
/// Safe to share between producer threads. Producers bracket their writes with
/// [`UploadHeap::begin_alloc`] / [`UploadHeap::end_alloc`] (or hold an [`UploadGuard`])
/// and queue the copies reading those bytes before closing the bracket. A thread must
/// not flush while holding an open allocation, the flush would wait for itself.
pub struct UploadHeap {
    device: Device,
    queue: Queue,
    uploads: UploadQueue,
    memory: Mutex<HeapMemory>,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    buffer: vk::Buffer,
    mapped: NonNull<u8>,
    capacity: u64,
}

// The mapped pointer is only dereferenced inside ranges handed out by the arena, which
// the upload queue keeps disjoint.
unsafe impl Send for UploadHeap {}
unsafe impl Sync for UploadHeap {}

impl UploadHeap {
    /// Create the heap and start recording its command buffer.
    ///
    /// # Arguments
    ///
    /// * `context` - The device context. Uploads are submitted on its graphics queue.
    /// * `size` - Size in bytes of the staging buffer.
    pub fn new(context: &DeviceContext, size: u64) -> RendererResult<Self> {
        if size == 0 {
            return Err(RendererError::Init("upload heap size must not be zero".into()));
        }

        log::debug!("Creating upload heap of {size} bytes");
        let device = context.device().clone();
        let queue = context.graphics_queue().clone();
        let mut allocator = context.allocator();

        let command_pool = {
            let pool_info = vk::CommandPoolCreateInfo::builder()
                .queue_family_index(queue.family_index)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            unsafe { device.create_command_pool(&pool_info, None)? }
        };

        let command_buffer = {
            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            unsafe { device.allocate_command_buffers(&alloc_info)?[0] }
        };

        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::builder(), None)? };

        let (buffer, mut memory) = allocator.create_buffer(
            &device,
            size as usize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        let mapped = allocator.map_memory(&device, &mut memory)?;
        context.set_object_name(buffer, "upload heap");

        let heap = Self {
            device,
            queue,
            uploads: UploadQueue::new(size),
            memory: Mutex::new(HeapMemory {
                allocator,
                memory: Some(memory),
            }),
            command_pool,
            command_buffer,
            fence,
            buffer,
            mapped,
            capacity: size,
        };
        heap.begin_recording()?;

        Ok(heap)
    }

    fn begin_recording(&self) -> RendererResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(self.command_buffer, &begin_info)?
        };
        Ok(())
    }

    fn to_alloc(&self, offset: u64, size: u64) -> UploadAlloc {
        // The arena only returns offsets inside the mapping.
        let ptr = unsafe { NonNull::new_unchecked(self.mapped.as_ptr().add(offset as usize)) };
        UploadAlloc { ptr, offset, size }
    }

    /// The staging buffer, source of every queued copy.
    pub fn staging_buffer(&self) -> vk::Buffer {
        self.buffer
    }

    /// Offset in the staging buffer of a pointer into the mapping, `None` when `ptr` is
    /// outside of it.
    pub fn offset_of(&self, ptr: *const u8) -> Option<u64> {
        let start = self.mapped.as_ptr() as usize;
        let offset = (ptr as usize).checked_sub(start)? as u64;
        (offset < self.capacity).then_some(offset)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes used since the last flush.
    pub fn used(&self) -> RendererResult<u64> {
        self.uploads.used()
    }

    /// Bump allocate without registering as a writer.
    ///
    /// Waits for a running flush but never flushes. Returns `None` when the heap is full.
    /// Nothing prevents another thread from flushing before the returned range is
    /// written; concurrent producers must use [`UploadHeap::begin_alloc`].
    pub fn alloc(&self, size: u64, align: u64) -> RendererResult<Option<UploadAlloc>> {
        let offset = self.uploads.try_alloc(size, align)?;
        Ok(offset.map(|offset| self.to_alloc(offset, size)))
    }

    /// Allocate staging memory, flushing the heap as many times as needed.
    ///
    /// The heap will not flush until the matching [`UploadHeap::end_alloc`].
    ///
    /// # Errors
    ///
    /// * [`RendererError::OutOfMemory`] - `size` can never fit in the heap.
    pub fn begin_alloc(&self, size: u64, align: u64) -> RendererResult<UploadAlloc> {
        let offset = self.uploads.begin_alloc(size, align, |batch| self.submit(&batch))?;
        Ok(self.to_alloc(offset, size))
    }

    /// Close an allocation opened with [`UploadHeap::begin_alloc`].
    pub fn end_alloc(&self) -> RendererResult<()> {
        self.uploads.end_alloc()
    }

    /// [`UploadHeap::begin_alloc`] returning a guard that closes the allocation on drop.
    pub fn begin_upload(&self, size: u64, align: u64) -> RendererResult<UploadGuard<'_>> {
        let alloc = self.begin_alloc(size, align)?;
        Ok(UploadGuard { heap: self, alloc })
    }

    /// Queue a copy from the staging buffer into `image`, which must be in
    /// `TRANSFER_DST_OPTIMAL` layout when the copy executes.
    pub fn add_image_copy(
        &self,
        image: vk::Image,
        region: vk::BufferImageCopy,
    ) -> RendererResult<()> {
        self.uploads.add_image_copy(image, region)
    }

    /// Queue a copy from the staging buffer into `buffer`.
    pub fn add_buffer_copy(
        &self,
        buffer: vk::Buffer,
        region: vk::BufferCopy,
    ) -> RendererResult<()> {
        self.uploads.add_buffer_copy(buffer, region)
    }

    /// Queue a barrier executed before the copies of the next flush.
    pub fn add_image_pre_barrier(&self, barrier: ImageBarrier) -> RendererResult<()> {
        self.uploads.add_pre_barrier(barrier)
    }

    /// Queue a barrier executed after the copies of the next flush.
    pub fn add_image_post_barrier(&self, barrier: ImageBarrier) -> RendererResult<()> {
        self.uploads.add_post_barrier(barrier)
    }

    /// Execute every queued operation and wait for the GPU to finish them.
    ///
    /// Waits for a concurrent flush, blocks new allocations and waits for the open ones
    /// to close before recording. On return the staging buffer is empty. With
    /// `do_barriers` false the queued barriers are discarded and the caller is
    /// responsible for the image layouts.
    pub fn flush_and_finish(&self, do_barriers: bool) -> RendererResult<()> {
        self.uploads.flush(do_barriers, |batch| self.submit(&batch))
    }

    fn lock_memory(&self) -> RendererResult<MutexGuard<'_, HeapMemory>> {
        self.memory
            .lock()
            .map_err(|e| RendererError::Allocator(format!("Upload heap lock poisoned: {e}")))
    }

    fn submit(&self, batch: &PendingUploads) -> RendererResult<()> {
        {
            let mut guard = self.lock_memory()?;
            let HeapMemory { allocator, memory } = &mut *guard;
            if let Some(memory) = memory.as_ref() {
                allocator.flush_memory(&self.device, memory)?;
            }
        }

        self.record(batch);

        unsafe { self.device.end_command_buffer(self.command_buffer)? };
        let command_buffers = [self.command_buffer];
        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .build();
        self.queue.submit(&self.device, &[submit_info], self.fence)?;

        unsafe {
            self.device.wait_for_fences(&[self.fence], true, u64::MAX)?;
            self.device.reset_fences(&[self.fence])?;
        }

        self.begin_recording()
    }

    fn record(&self, batch: &PendingUploads) {
        let device = &self.device;
        let command_buffer = self.command_buffer;

        if !batch.pre_barriers.is_empty() {
            let barriers: Vec<_> = batch.pre_barriers.iter().map(|b| b.to_vk()).collect();
            unsafe {
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &barriers,
                )
            };
        }

        for (image, region) in &batch.image_copies {
            unsafe {
                device.cmd_copy_buffer_to_image(
                    command_buffer,
                    self.buffer,
                    *image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    std::slice::from_ref(region),
                )
            };
        }

        for (buffer, region) in &batch.buffer_copies {
            unsafe {
                device.cmd_copy_buffer(
                    command_buffer,
                    self.buffer,
                    *buffer,
                    std::slice::from_ref(region),
                )
            };
        }

        if !batch.buffer_copies.is_empty() {
            let memory_barrier = vk::MemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(
                    vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                        | vk::AccessFlags::INDEX_READ
                        | vk::AccessFlags::UNIFORM_READ,
                )
                .build();
            unsafe {
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::VERTEX_INPUT
                        | vk::PipelineStageFlags::VERTEX_SHADER
                        | vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::empty(),
                    &[memory_barrier],
                    &[],
                    &[],
                )
            };
        }

        if !batch.post_barriers.is_empty() {
            let barriers: Vec<_> = batch.post_barriers.iter().map(|b| b.to_vk()).collect();
            unsafe {
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &barriers,
                )
            };
        }
    }
}

impl Drop for UploadHeap {
    fn drop(&mut self) {
        log::debug!("Destroying upload heap");
        unsafe {
            self.device.destroy_fence(self.fence, None);
            self.device
                .free_command_buffers(self.command_pool, &[self.command_buffer]);
            self.device.destroy_command_pool(self.command_pool, None);
        }

        let heap_memory = match self.memory.get_mut() {
            Ok(heap_memory) => heap_memory,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(mut memory) = heap_memory.memory.take() {
            let unmapped = heap_memory.allocator.unmap_memory(&self.device, &mut memory);
            let destroyed = heap_memory
                .allocator
                .destroy_buffer(&self.device, self.buffer, memory);
            if let Err(err) = unmapped.and(destroyed) {
                log::error!("Failed to destroy upload heap buffer: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    fn color_range() -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    #[test]
    fn alloc_aligns_start_and_size() {
        let mut arena = StagingArena::new(1024);
        assert_eq!(arena.alloc(10, 1), Some(0));
        assert_eq!(arena.alloc(10, 16), Some(16));
        assert_eq!(arena.used(), 32);
        assert_eq!(arena.alloc(1, 0), Some(32));
    }

    #[test]
    fn alloc_fails_without_wrapping() {
        let mut arena = StagingArena::new(256);
        assert_eq!(arena.alloc(200, 4), Some(0));
        assert_eq!(arena.alloc(100, 4), None);
        // A failed allocation leaves the cursor untouched.
        assert_eq!(arena.used(), 200);
        assert_eq!(arena.alloc(56, 4), Some(200));
        assert_eq!(arena.remaining(), 0);
    }

    #[test]
    fn huge_requests_do_not_overflow() {
        let mut arena = StagingArena::new(256);
        arena.alloc(8, 1);
        assert_eq!(arena.alloc(u64::MAX - 4, 1), None);
        assert_eq!(arena.alloc(u64::MAX - 4, 16), None);
        assert_eq!(arena.alloc(u64::MAX - 10, 256), None);
        assert_eq!(arena.used(), 8);
        assert_eq!(arena.alloc(248, 1), Some(8));
    }

    #[test]
    fn take_rewinds_and_empties_the_queues() {
        let image = vk::Image::from_raw(7);
        let mut arena = StagingArena::new(512);
        arena.alloc(300, 4).unwrap();
        arena.add_pre_barrier(ImageBarrier::to_transfer_dst(image, color_range()));
        arena.add_image_copy(image, vk::BufferImageCopy::default());
        arena.add_buffer_copy(vk::Buffer::from_raw(9), vk::BufferCopy::default());
        arena.add_post_barrier(ImageBarrier::to_shader_read(image, color_range()));

        let batch = arena.take(true);
        assert_eq!(batch.pre_barriers.len(), 1);
        assert_eq!(batch.image_copies.len(), 1);
        assert_eq!(batch.buffer_copies.len(), 1);
        assert_eq!(batch.post_barriers.len(), 1);

        assert_eq!(arena.used(), 0);
        assert!(arena.pending().is_empty());
        // The full capacity is available again.
        assert_eq!(arena.alloc(512, 4), Some(0));
    }

    #[test]
    fn flush_without_barriers_drops_them_with_their_copies() {
        let image = vk::Image::from_raw(3);
        let mut arena = StagingArena::new(64);
        arena.add_pre_barrier(ImageBarrier::to_transfer_dst(image, color_range()));
        arena.add_image_copy(image, vk::BufferImageCopy::default());
        arena.add_post_barrier(ImageBarrier::to_shader_read(image, color_range()));

        let batch = arena.take(false);
        assert!(batch.pre_barriers.is_empty());
        assert!(batch.post_barriers.is_empty());
        assert_eq!(batch.image_copies.len(), 1);
        // Nothing is replayed by the next flush.
        assert!(arena.pending().is_empty());
        assert!(arena.take(true).is_empty());
    }

    #[test]
    fn barrier_helpers_chain_layouts() {
        let image = vk::Image::from_raw(1);
        let pre = ImageBarrier::to_transfer_dst(image, color_range());
        let post = ImageBarrier::to_shader_read(image, color_range());
        assert_eq!(pre.new_layout, post.old_layout);
        assert_eq!(pre.dst_access_mask, post.src_access_mask);

        let raw = post.to_vk();
        assert_eq!(raw.image, image);
        assert_eq!(raw.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(raw.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
    }

    fn buffer_copy(token: u64, src_offset: u64) -> vk::BufferCopy {
        vk::BufferCopy {
            src_offset,
            dst_offset: token,
            size: 64,
        }
    }

    fn no_flush(_: PendingUploads) -> RendererResult<()> {
        panic!("the heap should not need a flush");
    }

    #[test]
    fn full_queue_flushes_once_then_allocates_from_the_start() {
        let queue = UploadQueue::new(256);
        assert_eq!(queue.begin_alloc(200, 4, no_flush).unwrap(), 0);
        queue
            .add_buffer_copy(vk::Buffer::from_raw(1), buffer_copy(0, 0))
            .unwrap();
        queue.end_alloc().unwrap();

        let mut batches = Vec::new();
        let offset = queue
            .begin_alloc(100, 4, |batch| {
                batches.push(batch);
                Ok(())
            })
            .unwrap();
        queue.end_alloc().unwrap();

        assert_eq!(offset, 0);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].buffer_copies.len(), 1);
        assert_eq!(queue.flush_count().unwrap(), 1);
        assert_eq!(queue.used().unwrap(), 100);
    }

    #[test]
    fn impossible_sizes_are_refused_without_flushing() {
        let queue = UploadQueue::new(256);
        for (size, align) in [(257, 1), (200, 512), (u64::MAX - 4, 16), (u64::MAX, 1)] {
            assert!(matches!(
                queue.begin_alloc(size, align, no_flush),
                Err(RendererError::OutOfMemory { .. })
            ));
        }
        assert_eq!(queue.flush_count().unwrap(), 0);
        // No writer was left registered.
        queue
            .flush(true, |batch| {
                assert!(batch.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn failed_submit_still_reopens_the_queue() {
        let queue = UploadQueue::new(64);
        let failed = queue.flush(true, |_| Err(RendererError::Init("lost".into())));
        assert!(failed.is_err());
        assert_eq!(queue.begin_alloc(64, 1, no_flush).unwrap(), 0);
        queue.end_alloc().unwrap();
    }

    #[test]
    fn retry_waits_for_the_open_writer() {
        let queue = Arc::new(UploadQueue::new(256));
        assert_eq!(queue.begin_alloc(200, 4, no_flush).unwrap(), 0);

        let done = Arc::new(AtomicBool::new(false));
        let retrying = {
            let queue = queue.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut copies = 0;
                let offset = queue
                    .begin_alloc(100, 4, |batch| {
                        copies += batch.buffer_copies.len();
                        Ok(())
                    })
                    .unwrap();
                queue.end_alloc().unwrap();
                done.store(true, Ordering::SeqCst);
                (offset, copies)
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst), "flushed over an open allocation");

        // Registered before closing, so the flush must pick it up.
        queue
            .add_buffer_copy(vk::Buffer::from_raw(1), buffer_copy(0, 0))
            .unwrap();
        queue.end_alloc().unwrap();

        assert_eq!(retrying.join().unwrap(), (0, 1));
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn flushed_batches_only_hold_closed_writes() {
        const PRODUCERS: u64 = 4;
        const UPLOADS: u64 = 50;

        let queue = Arc::new(UploadQueue::new(256));
        let closed = Arc::new(Mutex::new(HashSet::new()));
        let flushed = Arc::new(AtomicU64::new(0));

        let check = {
            let closed = closed.clone();
            let flushed = flushed.clone();
            move |batch: PendingUploads| -> RendererResult<()> {
                let closed = closed.lock().unwrap();
                for (_, region) in &batch.buffer_copies {
                    assert!(
                        closed.contains(&region.dst_offset),
                        "upload {} flushed before its allocation closed",
                        region.dst_offset
                    );
                }
                flushed.fetch_add(batch.buffer_copies.len() as u64, Ordering::SeqCst);
                Ok(())
            }
        };

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let queue = queue.clone();
                let closed = closed.clone();
                let check = check.clone();
                thread::spawn(move || {
                    for upload in 0..UPLOADS {
                        let token = producer * UPLOADS + upload;
                        let offset = queue.begin_alloc(64, 16, check.clone()).unwrap();
                        queue
                            .add_buffer_copy(vk::Buffer::from_raw(1), buffer_copy(token, offset))
                            .unwrap();
                        thread::yield_now();
                        closed.lock().unwrap().insert(token);
                        queue.end_alloc().unwrap();
                    }
                })
            })
            .collect();

        let flusher = {
            let queue = queue.clone();
            let check = check.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    queue.flush(true, check.clone()).unwrap();
                    thread::yield_now();
                }
            })
        };

        for producer in producers {
            producer.join().unwrap();
        }
        flusher.join().unwrap();
        queue.flush(true, check).unwrap();

        assert_eq!(flushed.load(Ordering::SeqCst), PRODUCERS * UPLOADS);
        assert_eq!(closed.lock().unwrap().len() as u64, PRODUCERS * UPLOADS);
    }
}
