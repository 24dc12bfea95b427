use ash::vk;
use thiserror::Error;

/// Crates error type.
#[derive(Debug, Error)]
pub enum RendererError {
    /// Errors coming from calls to Vulkan functions.
    #[error("A Vulkan error occured: {0}")]
    Vulkan(#[from] vk::Result),

    #[cfg(feature = "gpu-allocator")]
    #[error("A gpu allocator error occured: {0}")]
    GpuAllocator(#[from] gpu_allocator::AllocationError),

    /// Initialization errors.
    #[error("An error occured when initializing a frame resource: {0}")]
    Init(String),

    /// Allocator error
    #[error("A error occured when using the allocator: {0}")]
    Allocator(String),

    /// A statically sized per-frame heap cannot hold one frame worth of allocations.
    #[error("Ran out of memory in '{heap}': requested {requested} bytes out of {capacity}, increase its size")]
    OutOfMemory {
        heap: String,
        requested: u64,
        capacity: u64,
    },

    /// More command buffers were requested in a frame than were allocated up front.
    #[error("Command buffer budget of {per_frame} per frame exceeded")]
    CommandBufferBudget { per_frame: usize },

    /// A swapchain method was called out of protocol order.
    #[error("Invalid swapchain state: expected {expected}, found {found:?}")]
    InvalidState {
        expected: &'static str,
        found: crate::SwapchainState,
    },

    /// The surface changed and the window size dependent resources must be recreated.
    #[error("The swapchain is out of date")]
    SwapchainOutOfDate,
}
