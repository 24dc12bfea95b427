//! Logical device, queues and the setup command pool.

use crate::{allocator::Allocator, RendererError, RendererResult};
use ash::{
    extensions::{
        ext::DebugUtils,
        khr::{Surface, Swapchain as SwapchainLoader},
    },
    vk::{self, Handle},
    Device, Instance,
};
use std::{
    ffi::{CStr, CString},
    mem::ManuallyDrop,
    sync::{Arc, Mutex, MutexGuard},
};

/// A device queue and the family it belongs to.
///
/// Clones share the same lock: Vulkan requires submissions to a queue to be
/// externally synchronized and the upload heap may submit from another thread.
#[derive(Debug, Clone)]
pub struct Queue {
    pub handle: vk::Queue,
    pub family_index: u32,
    lock: Arc<Mutex<()>>,
}

impl Queue {
    pub fn new(handle: vk::Queue, family_index: u32) -> Self {
        Self {
            handle,
            family_index,
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn guard(&self) -> RendererResult<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|e| RendererError::Init(format!("Queue lock poisoned: {e}")))
    }

    /// Submit work, holding the queue lock for the duration of the call.
    pub fn submit(
        &self,
        device: &Device,
        submits: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> RendererResult<()> {
        let _guard = self.guard()?;
        unsafe { device.queue_submit(self.handle, submits, fence)? };
        Ok(())
    }

    /// Present, holding the queue lock. Returns `true` when the swapchain is suboptimal.
    pub fn present(
        &self,
        loader: &SwapchainLoader,
        present_info: &vk::PresentInfoKHR,
    ) -> RendererResult<ash::prelude::VkResult<bool>> {
        let _guard = self.guard()?;
        Ok(unsafe { loader.queue_present(self.handle, present_info) })
    }

    pub fn wait_idle(&self, device: &Device) -> RendererResult<()> {
        let _guard = self.guard()?;
        unsafe { device.queue_wait_idle(self.handle)? };
        Ok(())
    }
}

/// The queues used by the frame resources.
///
/// Entries may alias the same queue when a single family supports several roles.
#[derive(Debug, Clone)]
pub struct DeviceQueues {
    pub graphics: Queue,
    pub present: Queue,
    pub compute: Queue,
}

/// Queue family indices selected for a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
    pub compute: u32,
}

impl QueueFamilies {
    /// Picks the families out of `families`.
    ///
    /// The graphics family must also support compute. A dedicated compute family is
    /// preferred when one exists. `supports_present` reports surface support of a family.
    pub fn select<F>(
        families: &[vk::QueueFamilyProperties],
        mut supports_present: F,
    ) -> Option<Self>
    where
        F: FnMut(u32) -> bool,
    {
        let usable = || {
            families
                .iter()
                .enumerate()
                .filter(|(_, family)| family.queue_count > 0)
                .map(|(index, family)| (index as u32, family.queue_flags))
        };

        let graphics = usable()
            .find(|(_, flags)| flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE))
            .map(|(index, _)| index)?;

        let present = if supports_present(graphics) {
            graphics
        } else {
            usable()
                .map(|(index, _)| index)
                .find(|index| supports_present(*index))?
        };

        let compute = usable()
            .find(|(_, flags)| {
                flags.contains(vk::QueueFlags::COMPUTE) && !flags.contains(vk::QueueFlags::GRAPHICS)
            })
            .map(|(index, _)| index)
            .unwrap_or(graphics);

        Some(Self {
            graphics,
            present,
            compute,
        })
    }
}

/// Selects a physical device able to render and present to `surface_khr` and creates
/// the logical device with one queue per unique family.
pub fn create_logical_device(
    instance: &Instance,
    surface: &Surface,
    surface_khr: vk::SurfaceKHR,
) -> RendererResult<(vk::PhysicalDevice, Device, DeviceQueues)> {
    log::debug!("Creating vulkan physical device");
    let devices = unsafe { instance.enumerate_physical_devices()? };

    let mut selected = None;
    for physical_device in devices {
        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let Some(indices) = QueueFamilies::select(&families, |index| unsafe {
            surface
                .get_physical_device_surface_support(physical_device, index, surface_khr)
                .unwrap_or(false)
        }) else {
            continue;
        };

        let extension_props =
            unsafe { instance.enumerate_device_extension_properties(physical_device)? };
        let swapchain_support = extension_props.iter().any(|ext| {
            let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
            SwapchainLoader::name() == name
        });

        let formats = unsafe {
            surface.get_physical_device_surface_formats(physical_device, surface_khr)?
        };
        let present_modes = unsafe {
            surface.get_physical_device_surface_present_modes(physical_device, surface_khr)?
        };

        if swapchain_support && !formats.is_empty() && !present_modes.is_empty() {
            selected = Some((physical_device, indices));
            break;
        }
    }

    let (physical_device, indices) = selected
        .ok_or_else(|| RendererError::Init("Could not find a suitable device".into()))?;

    unsafe {
        let props = instance.get_physical_device_properties(physical_device);
        let device_name = CStr::from_ptr(props.device_name.as_ptr());
        log::debug!("Selected physical device: {:?}", device_name);
    }

    log::debug!("Creating vulkan device with queue families {:?}", indices);
    let queue_priorities = [1.0f32];
    let mut unique_families = vec![indices.graphics, indices.present, indices.compute];
    unique_families.sort_unstable();
    unique_families.dedup();

    let queue_create_infos = unique_families
        .iter()
        .map(|index| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(*index)
                .queue_priorities(&queue_priorities)
                .build()
        })
        .collect::<Vec<_>>();

    let device_extensions_ptrs = [SwapchainLoader::name().as_ptr()];

    let device_create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&device_extensions_ptrs);

    let device = unsafe { instance.create_device(physical_device, &device_create_info, None)? };

    // Queues retrieved from the same family are the same handle and must share a lock.
    let queues: Vec<Queue> = unique_families
        .iter()
        .map(|index| Queue::new(unsafe { device.get_device_queue(*index, 0) }, *index))
        .collect();
    let queue_of = |family: u32| {
        queues
            .iter()
            .find(|queue| queue.family_index == family)
            .cloned()
            .ok_or_else(|| RendererError::Init(format!("No queue created for family {family}")))
    };

    let queues = DeviceQueues {
        graphics: queue_of(indices.graphics)?,
        present: queue_of(indices.present)?,
        compute: queue_of(indices.compute)?,
    };

    Ok((physical_device, device, queues))
}

/// Owns the logical device, its queues and a command pool for one-shot setup work.
///
/// Every frame resource keeps a clone of the `ash::Device` and of the allocator and must
/// be dropped before the context. The context releases its allocator handle, then
/// destroys the device.
pub struct DeviceContext {
    instance: Instance,
    physical_device: vk::PhysicalDevice,
    device: Device,
    queues: DeviceQueues,
    command_pool: vk::CommandPool,
    command_pool_lock: Mutex<()>,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    allocator: ManuallyDrop<Allocator>,
    debug_utils: Option<DebugUtils>,
}

impl DeviceContext {
    /// Wrap an already created logical device.
    ///
    /// # Arguments
    ///
    /// * `instance` - The Vulkan instance the device was created from.
    /// * `physical_device` - The physical device backing `device`.
    /// * `device` - The logical device. Ownership is transfered to the context.
    /// * `queues` - Queues retrieved from `device`.
    /// * `allocator` - Allocator used by every frame resource.
    pub fn new(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        device: Device,
        queues: DeviceQueues,
        allocator: Allocator,
    ) -> RendererResult<Self> {
        let (properties, memory_properties) = unsafe {
            (
                instance.get_physical_device_properties(physical_device),
                instance.get_physical_device_memory_properties(physical_device),
            )
        };

        let command_pool = {
            let command_pool_info = vk::CommandPoolCreateInfo::builder()
                .queue_family_index(queues.graphics.family_index)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            unsafe { device.create_command_pool(&command_pool_info, None)? }
        };

        Ok(Self {
            instance: instance.clone(),
            physical_device,
            device,
            queues,
            command_pool,
            command_pool_lock: Mutex::new(()),
            properties,
            memory_properties,
            allocator: ManuallyDrop::new(allocator),
            debug_utils: None,
        })
    }

    /// Wrap an already created logical device using the default allocator.
    #[cfg(not(any(feature = "gpu-allocator", feature = "vk-mem")))]
    pub fn with_default_allocator(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        device: Device,
        queues: DeviceQueues,
    ) -> RendererResult<Self> {
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        Self::new(
            instance,
            physical_device,
            device,
            queues,
            Allocator::new(memory_properties),
        )
    }

    /// Enable object naming through `VK_EXT_debug_utils`.
    pub fn set_debug_utils(&mut self, debug_utils: DebugUtils) {
        self.debug_utils = Some(debug_utils);
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queues(&self) -> &DeviceQueues {
        &self.queues
    }

    pub fn graphics_queue(&self) -> &Queue {
        &self.queues.graphics
    }

    pub fn present_queue(&self) -> &Queue {
        &self.queues.present
    }

    pub fn compute_queue(&self) -> &Queue {
        &self.queues.compute
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// A handle to the allocator shared by the frame resources.
    pub fn allocator(&self) -> Allocator {
        Allocator::clone(&self.allocator)
    }

    /// Attach a debug name to a Vulkan object. Does nothing without debug utils.
    pub fn set_object_name<H: Handle>(&self, handle: H, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            log::warn!("Debug name {name:?} contains a nul byte");
            return;
        };

        let name_info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(H::TYPE)
            .object_handle(handle.as_raw())
            .object_name(&name);
        if let Err(err) =
            unsafe { debug_utils.set_debug_utils_object_name(self.device.handle(), &name_info) }
        {
            log::warn!("Failed to name object {:?}: {err}", name);
        }
    }

    fn pool_guard(&self) -> RendererResult<MutexGuard<'_, ()>> {
        self.command_pool_lock
            .lock()
            .map_err(|e| RendererError::Init(format!("Command pool lock poisoned: {e}")))
    }

    /// Allocate a primary command buffer from the setup pool and begin recording it.
    pub fn create_command_buffer(&self) -> RendererResult<vk::CommandBuffer> {
        let command_buffer = {
            let _guard = self.pool_guard()?;
            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_pool(self.command_pool)
                .command_buffer_count(1);

            unsafe { self.device.allocate_command_buffers(&alloc_info)?[0] }
        };

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info)? };

        Ok(command_buffer)
    }

    /// End `command_buffer`, submit it on the graphics queue and block until the GPU
    /// has executed it. The buffer is freed afterwards.
    pub fn flush_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RendererResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer)? };

        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::builder(), None)?
        };

        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .build();
        let result = self
            .queues
            .graphics
            .submit(&self.device, &[submit_info], fence)
            .and_then(|_| {
                unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX)? };
                Ok(())
            });

        unsafe { self.device.destroy_fence(fence, None) };
        {
            let _guard = self.pool_guard()?;
            unsafe {
                self.device
                    .free_command_buffers(self.command_pool, &command_buffers)
            };
        }

        result
    }

    /// Record commands with `executor` and execute them synchronously.
    pub fn execute_one_time_commands<R, F: FnOnce(vk::CommandBuffer) -> R>(
        &self,
        executor: F,
    ) -> RendererResult<R> {
        let command_buffer = self.create_command_buffer()?;
        let executor_result = executor(command_buffer);
        self.flush_command_buffer(command_buffer)?;
        Ok(executor_result)
    }

    pub fn wait_idle(&self) -> RendererResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::debug!("Destroying device context");
        unsafe {
            if let Err(err) = self.device.device_wait_idle() {
                log::error!("Failed to wait for device idle: {err}");
            }
            self.device.destroy_command_pool(self.command_pool, None);

            // The allocator frees its memory blocks against the device when dropped.
            let device = &self.device;
            release_then(&mut self.allocator, || device.destroy_device(None));
        }
    }
}

/// Drop `resource`, then run `destroy`.
///
/// # Safety
///
/// `resource` must not be used afterwards.
unsafe fn release_then<T, F: FnOnce()>(resource: &mut ManuallyDrop<T>, destroy: F) {
    ManuallyDrop::drop(resource);
    destroy();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn single_universal_family_serves_every_role() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        )];
        let selected = QueueFamilies::select(&families, |_| true).unwrap();
        assert_eq!(
            selected,
            QueueFamilies {
                graphics: 0,
                present: 0,
                compute: 0
            }
        );
    }

    #[test]
    fn dedicated_compute_and_present_families_are_preferred() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::COMPUTE),
        ];
        let selected = QueueFamilies::select(&families, |index| index == 0).unwrap();
        assert_eq!(selected.graphics, 1);
        assert_eq!(selected.present, 0);
        assert_eq!(selected.compute, 2);
    }

    #[test]
    fn graphics_without_compute_is_not_enough() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        assert!(QueueFamilies::select(&families, |_| true).is_none());
    }

    #[test]
    fn no_present_support_rejects_the_device() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)];
        assert!(QueueFamilies::select(&families, |_| false).is_none());
    }

    #[test]
    fn resources_are_released_before_the_device() {
        struct Tracked(Arc<Mutex<Vec<&'static str>>>);

        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.lock().unwrap().push("allocator");
            }
        }

        let events = Arc::new(Mutex::new(Vec::new()));
        let mut allocator = ManuallyDrop::new(Tracked(events.clone()));
        unsafe {
            release_then(&mut allocator, || events.lock().unwrap().push("device"));
        }
        assert_eq!(*events.lock().unwrap(), ["allocator", "device"]);
    }

    #[test]
    fn empty_families_are_skipped() {
        let mut empty = family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
        empty.queue_count = 0;
        let families = [empty, family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)];
        assert_eq!(QueueFamilies::select(&families, |_| true).unwrap().graphics, 1);
    }
}
