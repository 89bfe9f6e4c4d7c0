// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers (Adapter, once per process)
// - Physical device and queue family selection
// - Logical device, queues, command pools and memory allocator (DeviceContext)
// - One-shot command submission used by uploads and readback

use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use crate::config::DeviceConfig;
use crate::error::{RenderError, VkResultExt};

/// Required Vulkan device features for our renderer
const REQUIRED_DEVICE_FEATURES: vk::PhysicalDeviceFeatures = vk::PhysicalDeviceFeatures {
    sampler_anisotropy: vk::TRUE,
    ..unsafe { std::mem::zeroed() }
};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Queue family indices chosen for a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    /// Distinct family used for transfers, if the device exposes one.
    pub transfer: Option<u32>,
}

/// Pick the graphics family and, if present, a different family able to
/// run transfer commands. Dedicated (non-graphics) families win.
pub fn select_queue_families(families: &[vk::QueueFamilyProperties]) -> Option<QueueFamilies> {
    let graphics = families
        .iter()
        .position(|f| f.queue_count > 0 && f.queue_flags.contains(vk::QueueFlags::GRAPHICS))?
        as u32;

    // Graphics and compute families implicitly support transfer operations
    let can_transfer = |f: &vk::QueueFamilyProperties| {
        f.queue_count > 0
            && f.queue_flags.intersects(
                vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            )
    };

    let candidates: Vec<(u32, &vk::QueueFamilyProperties)> = families
        .iter()
        .enumerate()
        .map(|(i, f)| (i as u32, f))
        .filter(|(i, f)| *i != graphics && can_transfer(f))
        .collect();

    let transfer = candidates
        .iter()
        .find(|(_, f)| !f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .or_else(|| candidates.first())
        .map(|(i, _)| *i);

    Some(QueueFamilies { graphics, transfer })
}

// =============================================================================
// ADAPTER
// =============================================================================

/// Vulkan instance plus the selected physical device.
///
/// Built once (at process start) and shared by every `DeviceContext`.
pub struct Adapter {
    pub instance: ash::Instance,
    _entry: Entry,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    pub physical_device: vk::PhysicalDevice,
    pub queue_families: QueueFamilies,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
}

impl Adapter {
    /// Load Vulkan, create the instance and pick a GPU.
    pub fn new(config: &DeviceConfig) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan instance: {}", config.app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .map_err(|e| RenderError::CapabilityMissing(format!("Vulkan loader: {}", e)))?;

        // Step 2: Create instance (validation only in debug builds)
        let enable_validation = cfg!(debug_assertions)
            && config.validation_layers
            && Self::validation_available(&entry);
        let instance = Self::create_instance(&entry, &config.app_name, enable_validation)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(utils) => Some(utils),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        let mut adapter = Self {
            instance,
            _entry: entry,
            debug_utils,
            physical_device: vk::PhysicalDevice::null(),
            queue_families: QueueFamilies { graphics: 0, transfer: None },
            properties: vk::PhysicalDeviceProperties::default(),
        };

        // Step 4: Pick physical device (GPU). On failure `adapter` drops and
        // tears the instance down.
        let (physical_device, queue_families) = Self::pick_physical_device(&adapter.instance)?;
        adapter.physical_device = physical_device;
        adapter.queue_families = queue_families;
        adapter.properties = unsafe {
            adapter.instance.get_physical_device_properties(physical_device)
        };

        log::info!("Selected GPU: {}", adapter.device_name());
        let api_version = adapter.properties.api_version;
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(api_version),
            vk::api_version_minor(api_version),
            vk::api_version_patch(api_version)
        );
        log::info!("Queue families: {:?}", queue_families);

        Ok(Arc::new(adapter))
    }

    pub fn device_name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    /// Format properties for `format` on the selected GPU.
    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    fn validation_available(entry: &Entry) -> bool {
        let layers = match entry.enumerate_instance_layer_properties() {
            Ok(layers) => layers,
            Err(_) => return false,
        };
        let found = layers.iter().any(|layer| layer_name(layer) == VALIDATION_LAYER);
        if !found {
            log::warn!("Validation layers requested, but not available");
        }
        found
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("offscreen-stream")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        // No surface extensions: rendering never reaches a window
        let mut extensions = vec![];
        let mut layer_names = vec![];
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
            layer_names.push(VALIDATION_LAYER.as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .creating("Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe {
            debug_utils.create_debug_utils_messenger(&create_info, None)
        }
        .creating("debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
    ) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .creating("physical device list")?;

        if devices.is_empty() {
            return Err(RenderError::CapabilityMissing("no Vulkan-capable GPU found".into()).into());
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let features = unsafe { instance.get_physical_device_features(device) };

            if !Self::check_device_features(&features) {
                continue;
            }

            let queue_families = unsafe {
                instance.get_physical_device_queue_family_properties(device)
            };

            if let Some(families) = select_queue_families(&queue_families) {
                // Prefer discrete GPU
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    _ => 1,
                };

                if score > best_score {
                    best_score = score;
                    best_device = Some((device, families));
                }
            }
        }

        best_device.ok_or_else(|| {
            RenderError::CapabilityMissing(
                "no GPU with sampler anisotropy and a graphics queue".into(),
            )
            .into()
        })
    }

    fn check_device_features(features: &vk::PhysicalDeviceFeatures) -> bool {
        features.sampler_anisotropy == vk::TRUE
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

// =============================================================================
// DEVICE CONTEXT
// =============================================================================

struct QueueState {
    queue: vk::Queue,
    pool: vk::CommandPool,
}

/// A device queue and the command pool for its family.
///
/// Both are externally synchronized objects in Vulkan, so they sit behind
/// one lock; this is what lets several engines share a context.
pub struct CommandQueue {
    pub family: u32,
    state: Mutex<QueueState>,
}

impl CommandQueue {
    fn new(device: &ash::Device, family: u32) -> Result<Self> {
        let queue = unsafe { device.get_device_queue(family, 0) };

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            // RESET: Allow individual buffer reset
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .creating("command pool")?;

        Ok(Self {
            family,
            state: Mutex::new(QueueState { queue, pool }),
        })
    }

    /// Allocate a primary command buffer and record into it while holding
    /// the pool lock.
    pub fn allocate_and_record<F>(
        &self,
        device: &ash::Device,
        record: F,
    ) -> Result<vk::CommandBuffer>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let state = self.state.lock();
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(state.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { device.allocate_command_buffers(&alloc_info) }
            .creating("command buffer")?[0];

        let recorded = (|| -> Result<()> {
            let begin_info = vk::CommandBufferBeginInfo::builder();
            unsafe { device.begin_command_buffer(cmd, &begin_info) }
                .creating("command buffer recording")?;
            record(device, cmd)?;
            unsafe { device.end_command_buffer(cmd) }.creating("command buffer recording")?;
            Ok(())
        })();

        if let Err(e) = recorded {
            unsafe { device.free_command_buffers(state.pool, &[cmd]) };
            return Err(e);
        }
        Ok(cmd)
    }

    /// Return a command buffer to the pool. It must not be pending.
    pub fn free(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        let state = self.state.lock();
        unsafe { device.free_command_buffers(state.pool, &[cmd]) };
    }

    /// Submit pre-recorded command buffers; `fence` is signaled on completion.
    pub fn submit(
        &self,
        device: &ash::Device,
        command_buffers: &[vk::CommandBuffer],
        fence: vk::Fence,
    ) -> Result<()> {
        let submit_info = vk::SubmitInfo::builder().command_buffers(command_buffers);
        let state = self.state.lock();
        unsafe { device.queue_submit(state.queue, &[submit_info.build()], fence) }
            .transferring("submitting to queue")?;
        Ok(())
    }

    fn destroy(&self, device: &ash::Device) {
        let state = self.state.lock();
        unsafe { device.destroy_command_pool(state.pool, None) };
    }
}

/// Logical device with its queues, pools and memory allocator.
pub struct DeviceContext {
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    graphics: CommandQueue,
    transfer: Option<CommandQueue>,
    adapter: Arc<Adapter>,
}

impl DeviceContext {
    /// Create the logical device on the adapter's GPU.
    pub fn new(adapter: Arc<Adapter>, use_transfer_queue: bool) -> Result<Arc<Self>> {
        let families = adapter.queue_families;
        let transfer_family = if use_transfer_queue { families.transfer } else { None };
        if transfer_family.is_none() {
            log::info!("No dedicated transfer queue, transfers run on the graphics queue");
        }

        let queue_priorities = [1.0];
        let mut queue_create_infos = vec![vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(families.graphics)
            .queue_priorities(&queue_priorities)
            .build()];
        if let Some(family) = transfer_family {
            queue_create_infos.push(
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build(),
            );
        }

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_features(&REQUIRED_DEVICE_FEATURES);

        let device = unsafe {
            adapter.instance.create_device(adapter.physical_device, &create_info, None)
        }
        .creating("logical device")?;

        // Everything after this point must release the device on failure
        let built = (|| -> Result<(CommandQueue, Option<CommandQueue>, Allocator)> {
            let graphics = CommandQueue::new(&device, families.graphics)?;
            let transfer = match transfer_family {
                Some(family) => match CommandQueue::new(&device, family) {
                    Ok(queue) => Some(queue),
                    Err(e) => {
                        graphics.destroy(&device);
                        return Err(e);
                    }
                },
                None => None,
            };
            let allocator = match Self::create_allocator(&adapter, &device) {
                Ok(allocator) => allocator,
                Err(e) => {
                    if let Some(transfer) = &transfer {
                        transfer.destroy(&device);
                    }
                    graphics.destroy(&device);
                    return Err(e);
                }
            };
            Ok((graphics, transfer, allocator))
        })();

        let (graphics, transfer, allocator) = match built {
            Ok(parts) => parts,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        log::info!("Created logical device on {}", adapter.device_name());

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            graphics,
            transfer,
            adapter,
        }))
    }

    fn create_allocator(adapter: &Adapter, device: &ash::Device) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: adapter.instance.clone(),
            device: device.clone(),
            physical_device: adapter.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| RenderError::creation("memory allocator", e))?;

        Ok(allocator)
    }

    pub fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }

    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    pub fn graphics_queue(&self) -> &CommandQueue {
        &self.graphics
    }

    /// Queue used for staging copies; the graphics queue when the device has
    /// no separate transfer family.
    pub fn transfer_queue(&self) -> &CommandQueue {
        self.transfer.as_ref().unwrap_or(&self.graphics)
    }

    /// Queue families that touch shared buffers. Two entries means buffers
    /// written on the transfer queue need concurrent sharing.
    pub fn buffer_families(&self) -> Vec<u32> {
        match &self.transfer {
            Some(transfer) => vec![self.graphics.family, transfer.family],
            None => vec![self.graphics.family],
        }
    }

    /// Record a one-shot command buffer, submit it and block until the GPU
    /// has executed it.
    pub fn submit_once<F>(
        &self,
        queue: &CommandQueue,
        stage: &'static str,
        record: F,
    ) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::builder(), None) }
            .creating("one-shot fence")?;
        let mut one_shot = OneShot {
            ctx: self,
            queue,
            cmd: None,
            fence,
            pending: false,
        };

        let cmd = queue.allocate_and_record(&self.device, record)?;
        one_shot.cmd = Some(cmd);

        queue.submit(&self.device, &[cmd], fence)
            .with_context(|| format!("one-shot submission for {}", stage))?;
        one_shot.pending = true;

        unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }
            .transferring(stage)?;
        one_shot.pending = false;

        Ok(())
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.transferring("waiting for device idle")?;
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying logical device...");

        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            if let Some(transfer) = &self.transfer {
                transfer.destroy(&self.device);
            }
            self.graphics.destroy(&self.device);

            // The allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);
        }
    }
}

/// Releases a one-shot command buffer and its fence on every exit path.
struct OneShot<'a> {
    ctx: &'a DeviceContext,
    queue: &'a CommandQueue,
    cmd: Option<vk::CommandBuffer>,
    fence: vk::Fence,
    pending: bool,
}

impl Drop for OneShot<'_> {
    fn drop(&mut self) {
        if self.pending {
            // The wait failed; the buffer may still be executing
            let _ = self.ctx.wait_idle();
        }
        if let Some(cmd) = self.cmd.take() {
            self.queue.free(&self.ctx.device, cmd);
        }
        unsafe { self.ctx.device.destroy_fence(self.fence, None) };
    }
}

/// Name of an instance layer as reported by the loader
fn layer_name(layer: &vk::LayerProperties) -> &CStr {
    // The loader always NUL-terminates within the fixed-size array
    unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
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

    fn layer(name: &CStr) -> vk::LayerProperties {
        let mut props = vk::LayerProperties::default();
        for (dst, &src) in props.layer_name.iter_mut().zip(name.to_bytes()) {
            *dst = src as std::ffi::c_char;
        }
        props
    }

    #[test]
    fn validation_layer_is_recognized_by_name() {
        assert!(layer_name(&layer(VALIDATION_LAYER)) == VALIDATION_LAYER);
        assert!(layer_name(&layer(c"VK_LAYER_MESA_overlay")) != VALIDATION_LAYER);
    }

    #[test]
    fn prefers_dedicated_transfer_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let selected = select_queue_families(&families).unwrap();
        assert_eq!(selected, QueueFamilies { graphics: 0, transfer: Some(2) });
    }

    #[test]
    fn falls_back_to_graphics_only_device() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER)];
        let selected = select_queue_families(&families).unwrap();
        assert_eq!(selected.transfer, None);
    }

    #[test]
    fn compute_family_counts_as_transfer_capable() {
        let families = [
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS),
        ];
        let selected = select_queue_families(&families).unwrap();
        assert_eq!(selected, QueueFamilies { graphics: 1, transfer: Some(0) });
    }

    #[test]
    fn no_graphics_family_is_rejected() {
        let families = [family(vk::QueueFlags::TRANSFER), family(vk::QueueFlags::COMPUTE)];
        assert!(select_queue_families(&families).is_none());
    }

    #[test]
    fn empty_families_are_skipped() {
        let mut empty = family(vk::QueueFlags::GRAPHICS);
        empty.queue_count = 0;
        let families = [empty, family(vk::QueueFlags::GRAPHICS)];
        assert_eq!(select_queue_families(&families).unwrap().graphics, 1);
    }
}
