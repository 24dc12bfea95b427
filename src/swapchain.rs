//! Swapchain, window size dependent resources and the acquire / submit / present protocol.

use crate::{
    allocator::{Allocate, Allocator, Memory},
    sync::{FrameCounter, FrameSync},
    DeviceContext, Queue, RendererError, RendererResult, SwapchainOptions,
};
use ash::{
    extensions::khr::{Surface, Swapchain as SwapchainLoader},
    vk, Device,
};

/// Where the swapchain is in its per-frame protocol.
///
/// ```text
/// Uninitialized -> WindowSizeDependencyCreated -> Rendering -> Presenting -+
///                        ^          |                                       |
///                        |          +---------------------------------------+
///                        +--- WindowSizeDependencyDestroyed <- (resize)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    Uninitialized,
    /// Window size dependent resources exist and no image is acquired.
    WindowSizeDependencyCreated,
    /// An image was acquired and is being recorded into.
    Rendering { image_index: u32 },
    /// The frame was submitted and waits for presentation.
    Presenting { image_index: u32 },
    WindowSizeDependencyDestroyed,
}

impl SwapchainState {
    fn invalid(self, expected: &'static str) -> RendererError {
        log::error!("Swapchain protocol violation: expected {expected}, found {self:?}");
        RendererError::InvalidState {
            expected,
            found: self,
        }
    }

    /// The image acquired for the current frame, if any.
    pub fn image_index(self) -> Option<u32> {
        match self {
            Self::Rendering { image_index } | Self::Presenting { image_index } => Some(image_index),
            _ => None,
        }
    }

    pub fn created(self) -> RendererResult<Self> {
        match self {
            Self::Uninitialized | Self::WindowSizeDependencyDestroyed => {
                Ok(Self::WindowSizeDependencyCreated)
            }
            _ => Err(self.invalid("no window size dependent resources")),
        }
    }

    pub fn acquired(self, image_index: u32) -> RendererResult<Self> {
        match self {
            Self::WindowSizeDependencyCreated => Ok(Self::Rendering { image_index }),
            _ => Err(self.invalid("WindowSizeDependencyCreated")),
        }
    }

    pub fn submitted(self) -> RendererResult<Self> {
        match self {
            Self::Rendering { image_index } => Ok(Self::Presenting { image_index }),
            _ => Err(self.invalid("Rendering")),
        }
    }

    /// Presenting straight from `Rendering` is allowed for callers submitting on their own.
    pub fn presented(self) -> RendererResult<Self> {
        match self {
            Self::Rendering { .. } | Self::Presenting { .. } => {
                Ok(Self::WindowSizeDependencyCreated)
            }
            _ => Err(self.invalid("Rendering or Presenting")),
        }
    }

    /// The acquired image will not be rendered nor presented.
    pub fn abandoned(self) -> RendererResult<Self> {
        match self {
            Self::Rendering { .. } => Ok(Self::WindowSizeDependencyCreated),
            _ => Err(self.invalid("Rendering")),
        }
    }

    pub fn destroyed(self) -> Self {
        match self {
            Self::Uninitialized => Self::Uninitialized,
            _ => Self::WindowSizeDependencyDestroyed,
        }
    }
}

/// Outcome of a presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    /// Presented, but the window size dependent resources should be recreated.
    Suboptimal,
    /// Not presented, the window size dependent resources must be recreated.
    OutOfDate,
}

impl PresentStatus {
    pub fn needs_recreation(self) -> bool {
        self != Self::Optimal
    }
}

/// FIFO when `vsync` is set. Otherwise mailbox, then immediate, then FIFO which is
/// always supported.
pub fn choose_present_mode(vsync: bool, modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }

    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| modes.contains(mode))
        .unwrap_or_else(|| {
            log::warn!("Neither mailbox nor immediate present modes are supported, using FIFO");
            vk::PresentModeKHR::FIFO
        })
}

/// `preferred` when the surface supports it or has no preference, the first supported
/// format otherwise.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> Option<vk::SurfaceFormatKHR> {
    if formats.len() == 1 && formats[0].format == vk::Format::UNDEFINED {
        return Some(preferred);
    }

    formats
        .iter()
        .find(|format| {
            format.format == preferred.format && format.color_space == preferred.color_space
        })
        .or_else(|| formats.first())
        .copied()
}

/// The surface extent, or the window extent clamped to the surface limits when the
/// surface lets the swapchain decide.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window_extent: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    let min = capabilities.min_image_extent;
    let max = capabilities.max_image_extent;
    vk::Extent2D {
        width: window_extent.width.clamp(min.width, max.width),
        height: window_extent.height.clamp(min.height, max.height),
    }
}

/// At least one image per frame in flight, within the surface limits.
/// A `max_image_count` of zero means unbounded.
pub fn choose_image_count(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    frames_in_flight: usize,
) -> u32 {
    let count = capabilities.min_image_count.max(frames_in_flight as u32);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

struct DepthAttachment {
    format: vk::Format,
    image: vk::Image,
    memory: Option<Memory>,
    view: vk::ImageView,
}

/// The swapchain and its per frame slot synchronization objects.
///
/// One [`FrameSync`] exists per frame in flight, the slot advances on every
/// [`Swapchain::present`]. Images are acquired independently of the slot.
pub struct Swapchain {
    device: Device,
    physical_device: vk::PhysicalDevice,
    allocator: Allocator,
    loader: SwapchainLoader,
    graphics_queue: Queue,
    present_queue: Queue,
    options: SwapchainOptions,
    khr: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    depth: Option<DepthAttachment>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    frames: Vec<FrameSync>,
    frame: FrameCounter,
    state: SwapchainState,
}

impl Swapchain {
    /// Create the synchronization objects. The swapchain itself is created by
    /// [`Swapchain::create_window_size_dependency`].
    ///
    /// # Arguments
    ///
    /// * `context` - The device context.
    /// * `frames_in_flight` - Number of frame slots.
    /// * `options` - Presentation options.
    pub fn new(
        context: &DeviceContext,
        frames_in_flight: usize,
        options: SwapchainOptions,
    ) -> RendererResult<Self> {
        if frames_in_flight == 0 {
            return Err(RendererError::Init(
                "'frames_in_flight' parameter should be at least one".into(),
            ));
        }

        log::debug!("Creating swapchain with {frames_in_flight} frames in flight");
        let device = context.device().clone();
        let frames = (0..frames_in_flight)
            .map(|_| FrameSync::new(&device))
            .collect::<RendererResult<Vec<_>>>()?;

        Ok(Self {
            loader: SwapchainLoader::new(context.instance(), &device),
            physical_device: context.physical_device(),
            allocator: context.allocator(),
            graphics_queue: context.graphics_queue().clone(),
            present_queue: context.present_queue().clone(),
            device,
            options,
            khr: vk::SwapchainKHR::null(),
            format: options.preferred_format,
            extent: vk::Extent2D::default(),
            images: Vec::new(),
            image_views: Vec::new(),
            depth: None,
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            frames,
            frame: FrameCounter::new(frames_in_flight),
            state: SwapchainState::Uninitialized,
        })
    }

    /// Create the swapchain, its image views, the optional depth buffer, the render pass
    /// and the framebuffers for the current surface size.
    ///
    /// The previous swapchain, if any, is handed to the driver for reuse then destroyed.
    ///
    /// # Arguments
    ///
    /// * `surface` - The surface extension loader.
    /// * `surface_khr` - The surface to present to.
    /// * `window_extent` - Window size in pixels, used when the surface does not impose one.
    pub fn create_window_size_dependency(
        &mut self,
        surface: &Surface,
        surface_khr: vk::SurfaceKHR,
        window_extent: vk::Extent2D,
    ) -> RendererResult<()> {
        let next_state = self.state.created()?;
        log::debug!("Creating window size dependent resources");

        let (capabilities, formats, present_modes) = unsafe {
            (
                surface
                    .get_physical_device_surface_capabilities(self.physical_device, surface_khr)?,
                surface.get_physical_device_surface_formats(self.physical_device, surface_khr)?,
                surface
                    .get_physical_device_surface_present_modes(self.physical_device, surface_khr)?,
            )
        };

        let format = choose_surface_format(&formats, self.options.preferred_format)
            .ok_or_else(|| RendererError::Init("Surface exposes no format".into()))?;
        let present_mode = choose_present_mode(self.options.vsync, &present_modes);
        let extent = choose_extent(&capabilities, window_extent);
        let image_count = choose_image_count(&capabilities, self.frame.count());
        log::debug!(
            "Swapchain format: {format:?}, present mode: {present_mode:?}, extent: {extent:?}, images: {image_count}"
        );

        let families_indices = [
            self.graphics_queue.family_index,
            self.present_queue.family_index,
        ];
        let old_swapchain = self.khr;
        let create_info = {
            let mut builder = vk::SwapchainCreateInfoKHR::builder()
                .surface(surface_khr)
                .min_image_count(image_count)
                .image_format(format.format)
                .image_color_space(format.color_space)
                .image_extent(extent)
                .image_array_layers(1)
                .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT);

            builder = if families_indices[0] != families_indices[1] {
                builder
                    .image_sharing_mode(vk::SharingMode::CONCURRENT)
                    .queue_family_indices(&families_indices)
            } else {
                builder.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            };

            builder
                .pre_transform(capabilities.current_transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(present_mode)
                .clipped(true)
                .old_swapchain(old_swapchain)
        };

        self.khr = unsafe { self.loader.create_swapchain(&create_info, None)? };
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(old_swapchain, None) };
        }
        self.format = format;
        self.extent = extent;
        // From here on a failure leaves resources that destroy_window_size_dependency cleans up.
        self.state = next_state;

        self.images = unsafe { self.loader.get_swapchain_images(self.khr)? };
        for image in self.images.clone() {
            let view = self.create_view(image, format.format, vk::ImageAspectFlags::COLOR)?;
            self.image_views.push(view);
        }

        if let Some(depth_format) = self.options.depth_format {
            self.depth = Some(self.create_depth_attachment(depth_format)?);
        }

        self.render_pass = self.create_render_pass()?;
        self.create_framebuffers()?;

        Ok(())
    }

    fn create_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect_mask: vk::ImageAspectFlags,
    ) -> RendererResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        Ok(unsafe { self.device.create_image_view(&create_info, None)? })
    }

    fn create_depth_attachment(&mut self, format: vk::Format) -> RendererResult<DepthAttachment> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);

        let (image, memory) = self.allocator.create_image(&self.device, &image_info)?;
        let view = match self.create_view(image, format, depth_aspect(format)) {
            Ok(view) => view,
            Err(err) => {
                self.allocator.destroy_image(&self.device, image, memory)?;
                return Err(err);
            }
        };

        Ok(DepthAttachment {
            format,
            image,
            memory: Some(memory),
            view,
        })
    }

    fn create_render_pass(&self) -> RendererResult<vk::RenderPass> {
        let mut attachment_descs = vec![vk::AttachmentDescription::builder()
            .format(self.format.format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build()];
        if let Some(depth) = &self.depth {
            attachment_descs.push(
                vk::AttachmentDescription::builder()
                    .format(depth.format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .build(),
            );
        }

        let color_attachment_refs = [vk::AttachmentReference::builder()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build()];
        let depth_attachment_ref = vk::AttachmentReference::builder()
            .attachment(1)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build();

        let mut subpass_desc = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_attachment_refs);
        if self.depth.is_some() {
            subpass_desc = subpass_desc.depth_stencil_attachment(&depth_attachment_ref);
        }
        let subpass_descs = [subpass_desc.build()];

        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let subpass_deps = [vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(stages)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .build()];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachment_descs)
            .subpasses(&subpass_descs)
            .dependencies(&subpass_deps);

        Ok(unsafe { self.device.create_render_pass(&render_pass_info, None)? })
    }

    fn create_framebuffers(&mut self) -> RendererResult<()> {
        for view in self.image_views.clone() {
            let mut attachments = vec![view];
            if let Some(depth) = &self.depth {
                attachments.push(depth.view);
            }

            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);
            let framebuffer = unsafe { self.device.create_framebuffer(&framebuffer_info, None)? };
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    /// Destroy the framebuffers, render pass, depth buffer and image views.
    ///
    /// Waits for the device to be idle first. The swapchain handle is kept to be
    /// recycled by the next [`Swapchain::create_window_size_dependency`].
    pub fn destroy_window_size_dependency(&mut self) -> RendererResult<()> {
        if matches!(
            self.state,
            SwapchainState::Uninitialized | SwapchainState::WindowSizeDependencyDestroyed
        ) {
            return Ok(());
        }

        log::debug!("Destroying window size dependent resources");
        unsafe { self.device.device_wait_idle()? };

        unsafe {
            self.framebuffers
                .drain(..)
                .for_each(|fb| self.device.destroy_framebuffer(fb, None));
            self.device.destroy_render_pass(self.render_pass, None);
        }
        self.render_pass = vk::RenderPass::null();

        if let Some(mut depth) = self.depth.take() {
            unsafe { self.device.destroy_image_view(depth.view, None) };
            if let Some(memory) = depth.memory.take() {
                self.allocator
                    .destroy_image(&self.device, depth.image, memory)?;
            }
        }

        unsafe {
            self.image_views
                .drain(..)
                .for_each(|view| self.device.destroy_image_view(view, None));
        }
        self.images.clear();

        self.state = self.state.destroyed();
        Ok(())
    }

    /// Rebuild the window size dependent resources, typically after a resize or an
    /// out of date / suboptimal presentation.
    pub fn recreate(
        &mut self,
        surface: &Surface,
        surface_khr: vk::SurfaceKHR,
        window_extent: vk::Extent2D,
    ) -> RendererResult<()> {
        log::debug!("Recreating the swapchain");
        self.destroy_window_size_dependency()?;
        self.create_window_size_dependency(surface, surface_khr, window_extent)
    }

    /// Wait for the current slot to be free and acquire the next image.
    ///
    /// Blocks on the slot fence then on acquisition, without timeout. The fence is only
    /// reset once an image was acquired.
    ///
    /// # Errors
    ///
    /// * [`RendererError::SwapchainOutOfDate`] - The window size dependent resources
    ///   must be recreated before rendering again.
    pub fn wait_for_swapchain(&mut self) -> RendererResult<u32> {
        if self.state != SwapchainState::WindowSizeDependencyCreated {
            return Err(self.state.invalid("WindowSizeDependencyCreated"));
        }

        let sync = self.frames[self.frame.index()];
        sync.wait(&self.device)?;

        let acquired = unsafe {
            self.loader.acquire_next_image(
                self.khr,
                u64::MAX,
                sync.image_available,
                vk::Fence::null(),
            )
        };
        let image_index = match acquired {
            Ok((image_index, suboptimal)) => {
                if suboptimal {
                    log::trace!("Acquired image {image_index} of a suboptimal swapchain");
                }
                image_index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain out of date while acquiring");
                return Err(RendererError::SwapchainOutOfDate);
            }
            Err(err) => {
                log::error!("Failed to acquire swapchain image: {err}");
                return Err(err.into());
            }
        };

        sync.reset(&self.device)?;
        self.state = self.state.acquired(image_index)?;
        Ok(image_index)
    }

    /// Synchronization objects of the current slot, for callers submitting themselves.
    ///
    /// Such a submission must wait on `image_available`, signal `render_finished` and
    /// `in_flight`.
    pub fn semaphores(&self) -> FrameSync {
        self.frames[self.frame.index()]
    }

    /// Submit the frame on the graphics queue.
    pub fn submit(&mut self, command_buffers: &[vk::CommandBuffer]) -> RendererResult<()> {
        let next_state = self.state.submitted()?;
        let sync = self.frames[self.frame.index()];

        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let wait_semaphores = [sync.image_available];
        let signal_semaphores = [sync.render_finished];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        self.graphics_queue
            .submit(&self.device, &[submit_info], sync.in_flight)
            .map_err(|err| {
                log::error!("Failed to submit frame: {err}");
                err
            })?;

        self.state = next_state;
        Ok(())
    }

    /// Give up on the acquired image after a failed recording.
    ///
    /// Submits an empty batch waiting on the slot `image_available` semaphore and
    /// signaling its fence, so the slot can be waited on again. The image itself stays
    /// acquired until the swapchain is recreated.
    pub fn abandon_frame(&mut self) -> RendererResult<()> {
        let next_state = self.state.abandoned()?;
        let sync = self.frames[self.frame.index()];

        let wait_stages = [vk::PipelineStageFlags::TOP_OF_PIPE];
        let wait_semaphores = [sync.image_available];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .build();
        self.graphics_queue
            .submit(&self.device, &[submit_info], sync.in_flight)?;

        log::warn!("Abandoned the frame of swapchain slot {}", self.frame.index());
        self.state = next_state;
        Ok(())
    }

    /// Present the acquired image once rendering finished and move to the next slot.
    ///
    /// A suboptimal or out of date status is returned, not handled: the caller decides
    /// when to [`Swapchain::recreate`].
    pub fn present(&mut self) -> RendererResult<PresentStatus> {
        let image_index = self
            .state
            .image_index()
            .ok_or_else(|| self.state.invalid("Rendering or Presenting"))?;
        let next_state = self.state.presented()?;
        let sync = self.frames[self.frame.index()];

        let wait_semaphores = [sync.render_finished];
        let swapchains = [self.khr];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let presented = self.present_queue.present(&self.loader, &present_info)?;
        self.state = next_state;
        let slot = self.frame.advance();
        log::trace!("Presented image {image_index}, swapchain entered slot {slot}");

        match presented {
            Ok(false) => Ok(PresentStatus::Optimal),
            Ok(true) => {
                log::warn!("Swapchain is suboptimal");
                Ok(PresentStatus::Suboptimal)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain out of date while presenting");
                Ok(PresentStatus::OutOfDate)
            }
            Err(err) => {
                log::error!("Failed to present: {err}");
                Err(err.into())
            }
        }
    }

    /// Begin the render pass on the framebuffer of the acquired image, clearing color
    /// with the configured clear color and depth to 1.0.
    pub fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer) -> RendererResult<()> {
        let image_index = self
            .state
            .image_index()
            .ok_or_else(|| self.state.invalid("Rendering"))?;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.options.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let clear_count = if self.depth.is_some() { 2 } else { 1 };

        let render_pass_begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(self.framebuffers[image_index as usize])
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.extent,
            })
            .clear_values(&clear_values[..clear_count]);

        unsafe {
            self.device.cmd_begin_render_pass(
                command_buffer,
                &render_pass_begin_info,
                vk::SubpassContents::INLINE,
            )
        };
        Ok(())
    }

    pub fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(command_buffer) };
    }

    /// Set the clear color used by the next render passes.
    pub fn set_clear_color(&mut self, clear_color: [f32; 4]) {
        self.options.clear_color = clear_color;
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.framebuffers[image_index as usize]
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn depth_format(&self) -> Option<vk::Format> {
        self.depth.as_ref().map(|depth| depth.format)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image_index(&self) -> Option<u32> {
        self.state.image_index()
    }

    /// Index of the current frame slot.
    pub fn frame_slot(&self) -> usize {
        self.frame.index()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frame.count()
    }

    pub fn state(&self) -> SwapchainState {
        self.state
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        log::debug!("Destroying swapchain");
        if let Err(err) = self.destroy_window_size_dependency() {
            log::error!("Failed to destroy window size dependent resources: {err}");
        }
        unsafe {
            if self.khr != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(self.khr, None);
            }
            self.frames
                .iter()
                .for_each(|frame| frame.destroy(&self.device));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(
        current: (u32, u32),
        min_images: u32,
        max_images: u32,
    ) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2048,
            },
            min_image_count: min_images,
            max_image_count: max_images,
            ..Default::default()
        }
    }

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn frame_protocol_cycles() {
        let state = SwapchainState::Uninitialized.created().unwrap();
        let state = state.acquired(2).unwrap();
        assert_eq!(state.image_index(), Some(2));
        let state = state.submitted().unwrap();
        assert_eq!(state, SwapchainState::Presenting { image_index: 2 });
        let state = state.presented().unwrap();
        assert_eq!(state, SwapchainState::WindowSizeDependencyCreated);
        assert_eq!(state.image_index(), None);
    }

    #[test]
    fn manual_submission_presents_from_rendering() {
        let state = SwapchainState::WindowSizeDependencyCreated.acquired(0).unwrap();
        assert_eq!(
            state.presented().unwrap(),
            SwapchainState::WindowSizeDependencyCreated
        );
    }

    #[test]
    fn out_of_order_calls_are_rejected() {
        assert!(SwapchainState::Uninitialized.acquired(0).is_err());
        assert!(SwapchainState::WindowSizeDependencyCreated.submitted().is_err());
        assert!(SwapchainState::WindowSizeDependencyCreated.presented().is_err());
        assert!(SwapchainState::Presenting { image_index: 0 }.acquired(1).is_err());
        assert!(SwapchainState::WindowSizeDependencyCreated.created().is_err());

        match SwapchainState::WindowSizeDependencyDestroyed.acquired(0) {
            Err(RendererError::InvalidState { found, .. }) => {
                assert_eq!(found, SwapchainState::WindowSizeDependencyDestroyed)
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn failed_recording_returns_to_acquirable() {
        let state = SwapchainState::WindowSizeDependencyCreated.acquired(1).unwrap();
        let state = state.abandoned().unwrap();
        assert_eq!(state, SwapchainState::WindowSizeDependencyCreated);
        // The next frame can acquire again.
        assert_eq!(state.acquired(2).unwrap().image_index(), Some(2));

        assert!(SwapchainState::WindowSizeDependencyCreated.abandoned().is_err());
        assert!(SwapchainState::Presenting { image_index: 0 }.abandoned().is_err());
    }

    #[test]
    fn resize_goes_through_destroyed() {
        let state = SwapchainState::Rendering { image_index: 1 }.destroyed();
        assert_eq!(state, SwapchainState::WindowSizeDependencyDestroyed);
        assert_eq!(
            state.created().unwrap(),
            SwapchainState::WindowSizeDependencyCreated
        );
        assert_eq!(
            SwapchainState::Uninitialized.destroyed(),
            SwapchainState::Uninitialized
        );
    }

    #[test]
    fn vsync_always_uses_fifo() {
        let modes = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(true, &modes), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn no_vsync_prefers_mailbox_then_immediate_then_fifo() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(choose_present_mode(false, &all), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            choose_present_mode(false, &all[..2]),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(choose_present_mode(false, &all[..1]), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn surface_format_selection() {
        let preferred = surface_format(vk::Format::B8G8R8A8_UNORM);
        let chosen = |formats: &[vk::SurfaceFormatKHR]| {
            choose_surface_format(formats, preferred).map(|format| format.format)
        };

        assert_eq!(
            chosen(&[surface_format(vk::Format::UNDEFINED)]),
            Some(vk::Format::B8G8R8A8_UNORM)
        );

        let formats = [
            surface_format(vk::Format::R8G8B8A8_SRGB),
            surface_format(vk::Format::B8G8R8A8_UNORM),
        ];
        assert_eq!(chosen(&formats), Some(vk::Format::B8G8R8A8_UNORM));
        assert_eq!(chosen(&formats[..1]), Some(vk::Format::R8G8B8A8_SRGB));
        assert_eq!(chosen(&[]), None);
    }

    #[test]
    fn extent_follows_the_surface_when_imposed() {
        let caps = capabilities((800, 600), 2, 3);
        let window = vk::Extent2D {
            width: 1024,
            height: 768,
        };
        let extent = choose_extent(&caps, window);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn extent_is_clamped_when_free() {
        let caps = capabilities((u32::MAX, u32::MAX), 2, 3);
        let extent = choose_extent(
            &caps,
            vk::Extent2D {
                width: 8192,
                height: 10,
            },
        );
        assert_eq!((extent.width, extent.height), (4096, 64));
    }

    #[test]
    fn image_count_respects_surface_limits() {
        assert_eq!(choose_image_count(&capabilities((1, 1), 2, 0), 3), 3);
        assert_eq!(choose_image_count(&capabilities((1, 1), 2, 2), 3), 2);
        assert_eq!(choose_image_count(&capabilities((1, 1), 3, 8), 2), 3);
    }

    #[test]
    fn combined_depth_formats_include_stencil() {
        assert_eq!(
            depth_aspect(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert!(
            depth_aspect(vk::Format::D24_UNORM_S8_UINT).contains(vk::ImageAspectFlags::STENCIL)
        );
    }
}
