//! Renderer trait and the per-frame driver.

use crate::{
    DeviceContext, DynamicBuffer, FrameCommandPool, FrameOptions, PresentStatus, RendererError,
    RendererResult, Swapchain, SwapchainOptions, UploadHeap,
};
use ash::{extensions::khr::Surface, vk, Device};

/// Something that records the commands of a frame.
///
/// Renderers are built by their own constructors from the [`DeviceContext`] and the
/// [`Swapchain`] and release their Vulkan objects in `Drop`.
pub trait FrameRenderer {
    /// Record this frame's commands and hand them to `frame` with
    /// [`FrameContext::submit`].
    fn render(&mut self, frame: &mut FrameContext) -> RendererResult<()>;

    /// Called after the window size dependent resources were recreated. The render pass
    /// may have changed.
    fn on_resize(&mut self, _swapchain: &Swapchain) -> RendererResult<()> {
        Ok(())
    }
}

/// What a renderer gets to record one frame.
pub struct FrameContext<'a> {
    pub device: &'a Device,
    pub command_pool: &'a mut FrameCommandPool,
    pub dynamic_buffer: &'a mut DynamicBuffer,
    pub upload_heap: &'a UploadHeap,
    pub swapchain: &'a Swapchain,
    /// The acquired swapchain image.
    pub image_index: u32,
    /// Number of frames drawn before this one.
    pub frame_number: u64,
    command_buffers: Vec<vk::CommandBuffer>,
}

impl FrameContext<'_> {
    /// Queue an ended command buffer. Buffers are submitted in queue order.
    pub fn submit(&mut self, command_buffer: vk::CommandBuffer) {
        self.command_buffers.push(command_buffer);
    }

    /// Begin a command buffer from the current frame pool.
    pub fn begin_command_buffer(&mut self) -> RendererResult<vk::CommandBuffer> {
        self.command_pool.begin_new_command_buffer()
    }

    pub fn framebuffer(&self) -> vk::Framebuffer {
        self.swapchain.framebuffer(self.image_index)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    pub fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer) -> RendererResult<()> {
        self.swapchain.cmd_begin_render_pass(command_buffer)
    }

    pub fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        self.swapchain.cmd_end_render_pass(command_buffer)
    }
}

/// Owns the per-frame resources and drives the frame protocol.
///
/// Frame `f` uses swapchain slot `f % N` and command pool / dynamic buffer slot
/// `(f + 1) % N`: the pools advance right after the swapchain slot fence was waited on,
/// which is the fence of the last submission that used the slot they enter.
pub struct FrameLoop {
    // Dropped first, waits for the device to be idle.
    swapchain: Swapchain,
    command_pool: FrameCommandPool,
    dynamic_buffer: DynamicBuffer,
    upload_heap: UploadHeap,
    device: Device,
    frame_number: u64,
    needs_recreation: bool,
}

impl FrameLoop {
    /// Create every frame resource and the swapchain for the current window size.
    ///
    /// # Arguments
    ///
    /// * `context` - The device context. Must outlive the frame loop.
    /// * `options` - Sizes of the frame resources.
    /// * `swapchain_options` - Presentation options.
    /// * `surface` - The surface extension loader.
    /// * `surface_khr` - The surface to present to.
    /// * `window_extent` - Window size in pixels.
    pub fn new(
        context: &DeviceContext,
        options: &FrameOptions,
        swapchain_options: SwapchainOptions,
        surface: &Surface,
        surface_khr: vk::SurfaceKHR,
        window_extent: vk::Extent2D,
    ) -> RendererResult<Self> {
        options.validate()?;
        log::debug!("Creating frame loop with {options:?}");

        let mut swapchain = Swapchain::new(context, options.frames_in_flight, swapchain_options)?;
        swapchain.create_window_size_dependency(surface, surface_khr, window_extent)?;

        let command_pool = FrameCommandPool::new(
            context,
            options.frames_in_flight,
            options.command_buffers_per_frame,
            options.compute_pool,
        )?;
        let dynamic_buffer = DynamicBuffer::new(
            context,
            options.frames_in_flight,
            options.dynamic_buffer_size,
            "dynamic buffer",
        )?;
        let upload_heap = UploadHeap::new(context, options.upload_heap_size)?;

        Ok(Self {
            swapchain,
            command_pool,
            dynamic_buffer,
            upload_heap,
            device: context.device().clone(),
            frame_number: 0,
            needs_recreation: false,
        })
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub fn swapchain_mut(&mut self) -> &mut Swapchain {
        &mut self.swapchain
    }

    pub fn upload_heap(&self) -> &UploadHeap {
        &self.upload_heap
    }

    pub fn dynamic_buffer(&self) -> &DynamicBuffer {
        &self.dynamic_buffer
    }

    pub fn command_pool(&self) -> &FrameCommandPool {
        &self.command_pool
    }

    /// Number of frames drawn so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Whether the last frame reported the swapchain as out of date or suboptimal.
    pub fn needs_recreation(&self) -> bool {
        self.needs_recreation
    }

    /// Recreate the window size dependent resources and notify `renderer`.
    pub fn resize<R: FrameRenderer>(
        &mut self,
        renderer: &mut R,
        surface: &Surface,
        surface_khr: vk::SurfaceKHR,
        window_extent: vk::Extent2D,
    ) -> RendererResult<()> {
        self.swapchain
            .recreate(surface, surface_khr, window_extent)?;
        self.needs_recreation = false;
        renderer.on_resize(&self.swapchain)
    }

    /// Draw one frame: wait for the slot and acquire an image, advance the frame pools,
    /// let `renderer` record, then submit and present.
    ///
    /// Returns [`PresentStatus::OutOfDate`] without drawing when the swapchain must be
    /// recreated first, see [`FrameLoop::resize`]. When `renderer` fails the frame is
    /// abandoned and the swapchain flagged for recreation before the error is returned.
    pub fn draw_frame<R: FrameRenderer>(
        &mut self,
        renderer: &mut R,
    ) -> RendererResult<PresentStatus> {
        if self.needs_recreation {
            return Ok(PresentStatus::OutOfDate);
        }

        let image_index = match self.swapchain.wait_for_swapchain() {
            Ok(image_index) => image_index,
            Err(RendererError::SwapchainOutOfDate) => {
                self.needs_recreation = true;
                return Ok(PresentStatus::OutOfDate);
            }
            Err(err) => return Err(err),
        };

        self.command_pool.begin_frame();
        self.dynamic_buffer.begin_frame();

        let mut frame = FrameContext {
            device: &self.device,
            command_pool: &mut self.command_pool,
            dynamic_buffer: &mut self.dynamic_buffer,
            upload_heap: &self.upload_heap,
            swapchain: &self.swapchain,
            image_index,
            frame_number: self.frame_number,
            command_buffers: Vec::with_capacity(1),
        };
        let rendered = renderer.render(&mut frame);
        let command_buffers = frame.command_buffers;

        if let Err(err) = rendered {
            log::error!("Failed to render frame {}: {err}", self.frame_number);
            if let Err(abandon_err) = self.swapchain.abandon_frame() {
                log::error!("Failed to abandon frame {}: {abandon_err}", self.frame_number);
            }
            self.needs_recreation = true;
            return Err(err);
        }

        self.swapchain.submit(&command_buffers)?;
        let status = self.swapchain.present()?;
        self.needs_recreation = status.needs_recreation();
        self.frame_number += 1;

        Ok(status)
    }

    /// Block until every submitted frame completed.
    pub fn wait_idle(&self) -> RendererResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}
