//! # vkframe
//!
//! Frame lifecycle and GPU resource synchronization for Vulkan renderers using [Ash][ash].
//!
//! ## Compatibility
//!
//! | crate | ash  | gpu-allocator (feature) | vk-mem (feature) |
//! |-------|------|-------------------------|------------------|
//! | 0.1.0 | 0.37 | 0.25                    | 0.3.0            |
//!
//! ## How it works
//!
//! The crate does not draw anything. It owns the objects a renderer needs from one frame
//! to the next and orders the CPU and the GPU around them.
//!
//! - Frames in flight
//!
//! Every per-frame resource is split in `N` slots. The swapchain waits on the fence of
//! its current slot before acquiring an image, so the CPU never gets more than `N`
//! frames ahead of the GPU. The command pool and the dynamic buffer advance their own
//! slot right after that wait and reuse the memory and command buffers of the frame the
//! fence just retired.
//!
//! - Dynamic buffer
//!
//! A persistently mapped ring buffer for uniform, vertex and index data written every
//! frame. Allocations are aligned to 256 bytes (or more if the device requires it) and
//! released when their slot comes back. Running out of space in a frame is a sizing
//! error reported as [`RendererError::OutOfMemory`].
//!
//! - Frame command pool
//!
//! One command pool per slot with a fixed number of primary command buffers. Asking for
//! more buffers than that in one frame is a contract violation.
//!
//! - Upload heap
//!
//! A staging buffer for textures and meshes shared between loader threads. Producers
//! allocate with `begin_alloc` / `end_alloc` and queue copies and layout transitions.
//! `flush_and_finish` waits for the open allocations, records everything, submits and
//! blocks until the GPU is done, then reuses the buffer from the start. When the heap is
//! full `begin_alloc` flushes on its own.
//!
//! - Swapchain
//!
//! A small state machine around acquire / submit / present. Out of date and suboptimal
//! swapchains are reported to the caller who decides when to recreate the window size
//! dependent resources.
//!
//! ## Features
//!
//! ### gpu-allocator
//!
//! This feature adds support for [gpu-allocator][gpu-allocator]. `DeviceContext::new`
//! then takes an `Arc<Mutex<gpu_allocator::vulkan::Allocator>>` wrapped in an
//! [`Allocator`] and every frame resource allocates through it.
//!
//! ### vk-mem
//!
//! This feature adds support for [vk-mem-rs][vk-mem-rs], the same way.
//!
//! Without any of these features memory is allocated directly with `vkAllocateMemory`.
//!
//! ## Integration
//!
//! You can find a complete application in the [clear_color demo][demo].
//!
//! ```ignore
//! let (physical_device, device, queues) =
//!     create_logical_device(&instance, &surface, surface_khr)?;
//! let context =
//!     DeviceContext::with_default_allocator(&instance, physical_device, device, queues)?;
//!
//! let mut frame_loop = FrameLoop::new(
//!     &context,
//!     &FrameOptions::default(),
//!     SwapchainOptions::default(),
//!     &surface,
//!     surface_khr,
//!     vk::Extent2D { width: 1024, height: 768 },
//! )?;
//!
//! // Every frame
//! if frame_loop.draw_frame(&mut my_renderer)?.needs_recreation() {
//!     frame_loop.resize(&mut my_renderer, &surface, surface_khr, window_extent)?;
//! }
//! ```
//!
//! ## Examples
//!
//! ```sh
//! ## If you want to enable validation layers
//! export VK_LAYER_PATH=$VULKAN_SDK/Bin
//! export VK_INSTANCE_LAYERS=VK_LAYER_KHRONOS_validation
//!
//! cargo run --example clear_color
//! ```
//!
//! [ash]: https://github.com/MaikKlein/ash
//! [gpu-allocator]: https://github.com/Traverse-Research/gpu-allocator
//! [vk-mem-rs]: https://github.com/gwihlidal/vk-mem-rs
//! [demo]: demos/clear_color.rs

mod allocator;
mod command_pool;
mod device;
mod dynamic_buffer;
mod error;
mod flush_gate;
mod options;
mod renderer;
mod ring;
mod swapchain;
mod sync;
mod upload_heap;

pub use allocator::{Allocate, Allocator, Memory, MemoryLocation};
pub use command_pool::{CommandBufferSet, FrameCommandPool};
pub use device::{create_logical_device, DeviceContext, DeviceQueues, Queue, QueueFamilies};
pub use dynamic_buffer::{DynamicBuffer, DYNAMIC_BUFFER_ALIGNMENT};
pub use error::*;
pub use flush_gate::FlushGate;
pub use options::{FrameOptions, SwapchainOptions, DEFAULT_FRAMES_IN_FLIGHT};
pub use renderer::{FrameContext, FrameLoop, FrameRenderer};
pub use ring::{align_up, FrameRing, Ring};
pub use swapchain::{
    choose_extent, choose_image_count, choose_present_mode, choose_surface_format,
    PresentStatus, Swapchain, SwapchainState,
};
pub use sync::{FrameCounter, FrameSync};
pub use upload_heap::{
    ImageBarrier, PendingUploads, StagingArena, UploadAlloc, UploadGuard, UploadHeap, UploadQueue,
};

/// Result of the fallible operations of the crate.
pub type RendererResult<T> = Result<T, RendererError>;
