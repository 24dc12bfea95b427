use crate::{RendererError, RendererResult};
use ash::vk;

/// Number of frame slots used when none is specified.
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;

/// Sizing of the per-frame resources.
///
/// Every value here is a static budget. Exceeding the dynamic buffer or the command
/// buffer budget during a frame is a configuration error, not a transient condition.
#[derive(Debug, Clone, Copy)]
pub struct FrameOptions {
    /// Number of frames the CPU may record ahead of the GPU.
    pub frames_in_flight: usize,
    /// Primary command buffers pre-allocated for each frame slot.
    pub command_buffers_per_frame: usize,
    /// Total size in bytes of the dynamic (per-frame uniform/vertex) buffer.
    pub dynamic_buffer_size: u64,
    /// Total size in bytes of the staging buffer of the upload heap.
    pub upload_heap_size: u64,
    /// Allocate the frame command pools on the compute queue family.
    pub compute_pool: bool,
}

impl Default for FrameOptions {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            command_buffers_per_frame: 8,
            dynamic_buffer_size: 4 * 1024 * 1024,
            upload_heap_size: 32 * 1024 * 1024,
            compute_pool: false,
        }
    }
}

impl FrameOptions {
    pub fn validate(&self) -> RendererResult<()> {
        if self.frames_in_flight == 0 {
            return Err(RendererError::Init(
                "'frames_in_flight' should be at least one".into(),
            ));
        }
        if self.command_buffers_per_frame == 0 {
            return Err(RendererError::Init(
                "'command_buffers_per_frame' should be at least one".into(),
            ));
        }
        if self.dynamic_buffer_size == 0 || self.upload_heap_size == 0 {
            return Err(RendererError::Init(
                "dynamic buffer and upload heap sizes must not be zero".into(),
            ));
        }
        Ok(())
    }
}

/// Options of the window size dependent swapchain resources.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainOptions {
    /// Use FIFO presentation. When disabled MAILBOX is preferred, then IMMEDIATE.
    pub vsync: bool,
    /// Format of the shared depth attachment. `None` creates color only framebuffers.
    pub depth_format: Option<vk::Format>,
    /// Surface format used when the surface supports it.
    pub preferred_format: vk::SurfaceFormatKHR,
    /// Clear value of the color attachment.
    pub clear_color: [f32; 4],
}

impl Default for SwapchainOptions {
    fn default() -> Self {
        Self {
            vsync: true,
            depth_format: Some(vk::Format::D32_SFLOAT),
            preferred_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        assert!(FrameOptions::default().validate().is_ok());
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        let options = FrameOptions {
            frames_in_flight: 0,
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(RendererError::Init(_))));
    }

    #[test]
    fn zero_sized_heaps_are_rejected() {
        let options = FrameOptions {
            upload_heap_size: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
