use ash::{
    extensions::{ext::DebugUtils, khr::Surface},
    vk, Entry, Instance,
};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use simple_logger::SimpleLogger;
use std::{
    error::Error,
    ffi::{CStr, CString},
    os::raw::c_void,
    time::Instant,
};
use vkframe::*;
use winit::{
    dpi::PhysicalSize,
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop},
    window::{Window, WindowBuilder},
};

const WIDTH: u32 = 1024;
const HEIGHT: u32 = 768;
const TEXTURE_SIZE: u32 = 64;
const APP_NAME: &str = "clear color";

fn main() -> Result<(), Box<dyn Error>> {
    SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .with_module_level("vkframe", log::LevelFilter::Debug)
        .init()?;

    log::info!("Create application");
    let event_loop = EventLoop::new()?;
    let window = WindowBuilder::new()
        .with_title(APP_NAME)
        .with_inner_size(PhysicalSize::new(WIDTH, HEIGHT))
        .with_resizable(true)
        .build(&event_loop)?;

    let mut app = VulkanApp::new(window)?;
    let mut dirty_swapchain = false;
    let start = Instant::now();

    log::info!("Starting application");
    event_loop.run(move |event, elwt| {
        elwt.set_control_flow(ControlFlow::Poll);

        match event {
            Event::AboutToWait => {
                if let Err(err) = app.frame(&mut dirty_swapchain, start) {
                    log::error!("Failed to draw frame: {err}");
                    elwt.exit();
                }
            }
            Event::WindowEvent {
                event: WindowEvent::Resized(new_size),
                ..
            } => {
                log::debug!("Window was resized. New size is {:?}", new_size);
                dirty_swapchain = true;
            }
            Event::WindowEvent {
                event: WindowEvent::CloseRequested,
                ..
            } => elwt.exit(),
            Event::LoopExiting => {
                log::info!("Stopping application");
                app.destroy();
            }
            _ => (),
        }
    })?;

    Ok(())
}

/// Everything the demo owns. Teardown order is explicit in [`VulkanApp::destroy`].
struct VulkanApp {
    renderer: Option<ClearColor>,
    frame_loop: Option<FrameLoop>,
    context: Option<DeviceContext>,
    surface: Surface,
    surface_khr: vk::SurfaceKHR,
    debug_utils: DebugUtils,
    debug_utils_messenger: vk::DebugUtilsMessengerEXT,
    instance: Instance,
    _entry: Entry,
    window: Window,
}

impl VulkanApp {
    fn new(window: Window) -> Result<Self, Box<dyn Error>> {
        let entry = unsafe { Entry::load()? };
        let (instance, debug_utils, debug_utils_messenger) =
            create_vulkan_instance(&entry, &window)?;

        let surface = Surface::new(&entry, &instance);
        let surface_khr = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )?
        };

        let (physical_device, device, queues) =
            create_logical_device(&instance, &surface, surface_khr)?;
        let mut context =
            DeviceContext::with_default_allocator(&instance, physical_device, device, queues)?;
        context.set_debug_utils(debug_utils.clone());

        let frame_loop = FrameLoop::new(
            &context,
            &FrameOptions::default(),
            SwapchainOptions {
                vsync: true,
                ..Default::default()
            },
            &surface,
            surface_khr,
            window_extent(&window),
        )?;

        let renderer = ClearColor::new(&context, &frame_loop)?;

        Ok(Self {
            renderer: Some(renderer),
            frame_loop: Some(frame_loop),
            context: Some(context),
            surface,
            surface_khr,
            debug_utils,
            debug_utils_messenger,
            instance,
            _entry: entry,
            window,
        })
    }

    fn frame(&mut self, dirty_swapchain: &mut bool, start: Instant) -> RendererResult<()> {
        let (Some(frame_loop), Some(renderer)) = (self.frame_loop.as_mut(), self.renderer.as_mut())
        else {
            return Ok(());
        };

        if *dirty_swapchain || frame_loop.needs_recreation() {
            let extent = window_extent(&self.window);
            // Minimized, wait for the window to come back.
            if extent.width == 0 || extent.height == 0 {
                return Ok(());
            }
            frame_loop.resize(renderer, &self.surface, self.surface_khr, extent)?;
            *dirty_swapchain = false;
        }

        let t = start.elapsed().as_secs_f32();
        let color = [
            0.5 + 0.5 * t.sin(),
            0.5 + 0.5 * (t + 2.0).sin(),
            0.5 + 0.5 * (t + 4.0).sin(),
            1.0,
        ];
        renderer.color = color;
        frame_loop.swapchain_mut().set_clear_color(color);

        if frame_loop.draw_frame(renderer)?.needs_recreation() {
            log::debug!("Swapchain needs to be recreated");
        }

        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(frame_loop) = &self.frame_loop {
            if let Err(err) = frame_loop.wait_idle() {
                log::error!("Failed to wait for the device: {err}");
            }
        }

        self.renderer.take();
        self.frame_loop.take();
        if self.context.take().is_none() {
            return;
        }

        unsafe {
            self.surface.destroy_surface(self.surface_khr, None);
            self.debug_utils
                .destroy_debug_utils_messenger(self.debug_utils_messenger, None);
            self.instance.destroy_instance(None);
        }
    }
}

impl Drop for VulkanApp {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct FrameUniforms {
    color: [f32; 4],
    frame: u32,
    _padding: [u32; 3],
}

struct Texture {
    image: vk::Image,
    memory: Option<Memory>,
}

/// Clears the screen and pushes per-frame uniforms through the dynamic buffer.
struct ClearColor {
    device: ash::Device,
    allocator: Allocator,
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    textures: Vec<Texture>,
    color: [f32; 4],
}

impl ClearColor {
    fn new(context: &DeviceContext, frame_loop: &FrameLoop) -> RendererResult<Self> {
        let device = context.device().clone();

        let descriptor_set_layout = {
            let bindings = [vk::DescriptorSetLayoutBinding::builder()
                .binding(0)
                .descriptor_count(1)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .build()];
            let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
            unsafe { device.create_descriptor_set_layout(&layout_info, None)? }
        };

        let pipeline_layout = {
            let layouts = [descriptor_set_layout];
            let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&layouts);
            unsafe { device.create_pipeline_layout(&layout_info, None)? }
        };

        let descriptor_pool = {
            let sizes = [vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                descriptor_count: 1,
            }];
            let create_info = vk::DescriptorPoolCreateInfo::builder()
                .pool_sizes(&sizes)
                .max_sets(1);
            unsafe { device.create_descriptor_pool(&create_info, None)? }
        };

        let descriptor_set = {
            let set_layouts = [descriptor_set_layout];
            let allocate_info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(descriptor_pool)
                .set_layouts(&set_layouts);
            unsafe { device.allocate_descriptor_sets(&allocate_info)?[0] }
        };
        frame_loop.dynamic_buffer().write_dynamic_descriptor(
            descriptor_set,
            0,
            std::mem::size_of::<FrameUniforms>() as u64,
        );

        let mut renderer = Self {
            device,
            allocator: context.allocator(),
            descriptor_set_layout,
            pipeline_layout,
            descriptor_pool,
            descriptor_set,
            textures: Vec::new(),
            color: [0.0, 0.0, 0.0, 1.0],
        };
        renderer.upload_textures(context, frame_loop.upload_heap())?;

        Ok(renderer)
    }

    /// Two loader threads fill a checkerboard texture each through the upload heap.
    fn upload_textures(
        &mut self,
        context: &DeviceContext,
        upload_heap: &UploadHeap,
    ) -> RendererResult<()> {
        let images = (0..2)
            .map(|index| {
                let image = self.create_texture_image()?;
                context.set_object_name(image.image, &format!("checkerboard {index}"));
                let handle = image.image;
                self.textures.push(image);
                Ok(handle)
            })
            .collect::<RendererResult<Vec<_>>>()?;

        std::thread::scope(|scope| {
            let loaders: Vec<_> = images
                .iter()
                .enumerate()
                .map(|(index, image)| {
                    let image = *image;
                    scope.spawn(move || stage_checkerboard(upload_heap, image, index as u8))
                })
                .collect();

            loaders
                .into_iter()
                .map(|loader| {
                    loader.join().unwrap_or_else(|_| {
                        Err(RendererError::Init("Texture loader thread panicked".into()))
                    })
                })
                .collect::<RendererResult<Vec<_>>>()
        })?;

        upload_heap.flush_and_finish(true)?;
        log::info!("Uploaded {} textures", self.textures.len());
        Ok(())
    }

    fn create_texture_image(&mut self) -> RendererResult<Texture> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: TEXTURE_SIZE,
                height: TEXTURE_SIZE,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(vk::Format::R8G8B8A8_UNORM)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);

        let (image, memory) = self.allocator.create_image(&self.device, &image_info)?;
        Ok(Texture {
            image,
            memory: Some(memory),
        })
    }
}

fn stage_checkerboard(upload_heap: &UploadHeap, image: vk::Image, seed: u8) -> RendererResult<()> {
    let size = (TEXTURE_SIZE * TEXTURE_SIZE * 4) as u64;
    let range = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };

    let mut upload = upload_heap.begin_upload(size, 4)?;
    for (index, pixel) in upload.as_mut_slice().chunks_exact_mut(4).enumerate() {
        let x = index as u32 % TEXTURE_SIZE;
        let y = index as u32 / TEXTURE_SIZE;
        let value = if (x / 8 + y / 8) % 2 == 0 { 255 } else { 32 };
        pixel.copy_from_slice(&[value, value.wrapping_add(seed * 64), value, 255]);
    }

    debug_assert_eq!(
        upload_heap.offset_of(upload.alloc().as_ptr()),
        Some(upload.offset())
    );

    let region = vk::BufferImageCopy::builder()
        .buffer_offset(upload.offset())
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        })
        .image_extent(vk::Extent3D {
            width: TEXTURE_SIZE,
            height: TEXTURE_SIZE,
            depth: 1,
        })
        .build();

    upload_heap.add_image_pre_barrier(ImageBarrier::to_transfer_dst(image, range))?;
    upload_heap.add_image_copy(image, region)?;
    upload_heap.add_image_post_barrier(ImageBarrier::to_shader_read(image, range))?;
    // Dropping the guard lets the next flush record the copy.
    drop(upload);
    Ok(())
}

impl FrameRenderer for ClearColor {
    fn render(&mut self, frame: &mut FrameContext) -> RendererResult<()> {
        let uniforms = FrameUniforms {
            color: self.color,
            frame: frame.frame_number as u32,
            _padding: [0; 3],
        };
        let descriptor = frame.dynamic_buffer.write_constant_buffer(&uniforms)?;

        let command_buffer = frame.begin_command_buffer()?;
        unsafe {
            frame.device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline_layout,
                0,
                &[self.descriptor_set],
                &[descriptor.offset as u32],
            )
        };
        frame.cmd_begin_render_pass(command_buffer)?;
        frame.cmd_end_render_pass(command_buffer);
        unsafe { frame.device.end_command_buffer(command_buffer)? };

        frame.submit(command_buffer);
        Ok(())
    }

    fn on_resize(&mut self, swapchain: &Swapchain) -> RendererResult<()> {
        log::info!(
            "Swapchain recreated: {:?} {:?}",
            swapchain.extent(),
            swapchain.format()
        );
        Ok(())
    }
}

impl Drop for ClearColor {
    fn drop(&mut self) {
        log::debug!("Destroying clear color renderer");
        for mut texture in self.textures.drain(..) {
            if let Some(memory) = texture.memory.take() {
                if let Err(err) = self
                    .allocator
                    .destroy_image(&self.device, texture.image, memory)
                {
                    log::error!("Failed to destroy texture: {err}");
                }
            }
        }
        unsafe {
            self.device
                .destroy_descriptor_pool(self.descriptor_pool, None);
            self.device
                .destroy_pipeline_layout(self.pipeline_layout, None);
            self.device
                .destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}

fn window_extent(window: &Window) -> vk::Extent2D {
    let PhysicalSize { width, height } = window.inner_size();
    vk::Extent2D { width, height }
}

fn create_vulkan_instance(
    entry: &Entry,
    window: &Window,
) -> Result<(Instance, DebugUtils, vk::DebugUtilsMessengerEXT), Box<dyn Error>> {
    log::debug!("Creating vulkan instance");
    let app_name = CString::new(APP_NAME)?;
    let engine_name = CString::new("vkframe")?;
    let app_info = vk::ApplicationInfo::builder()
        .application_name(app_name.as_c_str())
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(engine_name.as_c_str())
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::make_api_version(0, 1, 0, 0));

    let mut extension_names =
        ash_window::enumerate_required_extensions(window.raw_display_handle())?.to_vec();
    extension_names.push(DebugUtils::name().as_ptr());

    let instance_create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names);

    let instance = unsafe { entry.create_instance(&instance_create_info, None)? };

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .flags(vk::DebugUtilsMessengerCreateFlagsEXT::empty())
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
        )
        .pfn_user_callback(Some(vulkan_debug_callback));
    let debug_utils = DebugUtils::new(entry, &instance);
    let debug_utils_messenger =
        unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? };

    Ok((instance, debug_utils, debug_utils_messenger))
}

unsafe extern "system" fn vulkan_debug_callback(
    flag: vk::DebugUtilsMessageSeverityFlagsEXT,
    typ: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut c_void,
) -> vk::Bool32 {
    use vk::DebugUtilsMessageSeverityFlagsEXT as Flag;

    let message = CStr::from_ptr((*p_callback_data).p_message);
    match flag {
        Flag::VERBOSE => log::debug!("{:?} - {:?}", typ, message),
        Flag::INFO => log::info!("{:?} - {:?}", typ, message),
        Flag::WARNING => log::warn!("{:?} - {:?}", typ, message),
        _ => log::error!("{:?} - {:?}", typ, message),
    }
    vk::FALSE
}
