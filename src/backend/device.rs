// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Window surface creation
// - Physical device selection (prefer discrete GPU)
// - Logical device + queue creation
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr::Surface};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Device extensions every candidate GPU must expose
fn required_device_extensions() -> [&'static CStr; 1] {
    [ash::extensions::khr::Swapchain::name()]
}

/// Sample counts from highest to lowest
const SAMPLE_COUNTS: [(vk::SampleCountFlags, u32); 6] = [
    (vk::SampleCountFlags::TYPE_64, 64),
    (vk::SampleCountFlags::TYPE_32, 32),
    (vk::SampleCountFlags::TYPE_16, 16),
    (vk::SampleCountFlags::TYPE_8, 8),
    (vk::SampleCountFlags::TYPE_4, 4),
    (vk::SampleCountFlags::TYPE_2, 2),
];

/// Queue families used for rendering and presentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Distinct family indices, one queue is created per entry
    pub fn unique(&self) -> Vec<u32> {
        if self.graphics == self.present {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Instance and debug messenger, destroyed after everything created from them
struct InstanceHandles {
    instance: ash::Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    // Keeps the Vulkan library loaded until the instance is gone
    entry: Entry,
}

impl Drop for InstanceHandles {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

struct WindowSurface {
    loader: Surface,
    surface: vk::SurfaceKHR,
}

impl Drop for WindowSurface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.surface, None) };
    }
}

struct LogicalDevice {
    device: ash::Device,
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe { self.device.destroy_device(None) };
    }
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Freed explicitly in Drop, before the device it allocates from
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub surface: vk::SurfaceKHR,
    pub surface_loader: Surface,
    pub instance: ash::Instance,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub present_queue: vk::Queue,
    pub present_queue_family: u32,

    // Device properties (cached for performance)
    pub properties: vk::PhysicalDeviceProperties,
    pub msaa_samples: vk::SampleCountFlags,

    // Owners of the handles above, dropped in this order
    _logical_device: LogicalDevice,
    _window_surface: WindowSurface,
    _instance_handles: InstanceHandles,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    /// * `display_handle`, `window_handle` - Window to create the surface for
    /// * `max_msaa_samples` - Upper bound for the multisample count
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        max_msaa_samples: u32,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        // Each owner destroys its handles if a later step fails
        let instance = Self::create_instance(&entry, app_name, enable_validation, display_handle)?;
        let mut instance_handles = InstanceHandles {
            instance: instance.clone(),
            debug_utils: None,
            entry,
        };

        // Step 3: Setup debug messenger if validation enabled
        if enable_validation {
            instance_handles.debug_utils =
                Some(Self::setup_debug_messenger(&instance_handles.entry, &instance)?);
        }

        // Step 4: Create the window surface
        let entry = &instance_handles.entry;
        let surface_loader = Surface::new(entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(entry, &instance, display_handle, window_handle, None)
        }
        .context("Failed to create window surface")?;
        let window_surface = WindowSurface {
            loader: surface_loader.clone(),
            surface,
        };

        // Step 5: Pick physical device (GPU)
        let (physical_device, queue_families) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        // Step 6: Create logical device
        let (device, graphics_queue, present_queue) =
            Self::create_logical_device(&instance, physical_device, queue_families)?;
        let logical_device = LogicalDevice {
            device: device.clone(),
        };

        // Step 7: Cache device properties
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let msaa_samples = max_usable_sample_count(
            properties.limits.framebuffer_color_sample_counts
                & properties.limits.framebuffer_depth_sample_counts,
            max_msaa_samples,
        );

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!("MSAA samples: {:?}", msaa_samples);

        // Step 8: Create memory allocator
        let allocator = Self::create_allocator(&instance, physical_device, &device)?;

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            surface,
            surface_loader,
            instance,
            graphics_queue,
            graphics_queue_family: queue_families.graphics,
            present_queue,
            present_queue_family: queue_families.present,
            properties,
            msaa_samples,
            _logical_device: logical_device,
            _window_surface: window_surface,
            _instance_handles: instance_handles,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("No Engine")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        // Platform surface extensions, as reported for this display
        let surface_extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("Failed to query surface extensions for this display")?;
        let mut extensions: Vec<&CStr> = surface_extensions
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) })
            .collect();

        let mut layers: Vec<&CStr> = Vec::new();
        if enable_validation {
            extensions.push(DebugUtils::name());
            layers.push(VALIDATION_LAYER);
        }

        // Everything we ask for must be known to the loader
        let available_layers = entry.enumerate_instance_layer_properties()?;
        let available_layer_names: Vec<&CStr> = available_layers
            .iter()
            .map(|props| unsafe { CStr::from_ptr(props.layer_name.as_ptr()) })
            .collect();
        if let Some(missing) = find_missing(&layers, &available_layer_names) {
            anyhow::bail!("Required Vulkan layer not available: {}", missing.to_string_lossy());
        }

        let available_extensions = entry.enumerate_instance_extension_properties(None)?;
        let available_extension_names: Vec<&CStr> = available_extensions
            .iter()
            .map(|props| unsafe { CStr::from_ptr(props.extension_name.as_ptr()) })
            .collect();
        if let Some(missing) = find_missing(&extensions, &available_extension_names) {
            anyhow::bail!(
                "Required Vulkan extension not available: {}",
                missing.to_string_lossy()
            );
        }

        let extension_ptrs: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();
        let layer_ptrs: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;
        let mut missing_queues = false;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();

            if props.api_version < vk::API_VERSION_1_3 {
                log::debug!("Skipping {}: Vulkan 1.3 not supported", name);
                continue;
            }

            // Check required features and extensions
            if !Self::check_device_features(instance, device) {
                log::debug!("Skipping {}: missing required features", name);
                continue;
            }
            if !Self::check_device_extensions(instance, device)? {
                log::debug!("Skipping {}: missing required extensions", name);
                continue;
            }

            // Swapchain must have something to offer for this surface
            let formats = unsafe {
                surface_loader.get_physical_device_surface_formats(device, surface)
            }?;
            let present_modes = unsafe {
                surface_loader.get_physical_device_surface_present_modes(device, surface)
            }?;
            if formats.is_empty() || present_modes.is_empty() {
                log::debug!("Skipping {}: surface has no formats or present modes", name);
                continue;
            }

            // Find graphics + present queue families
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };
            let mut families = Vec::with_capacity(queue_families.len());
            for (index, family) in queue_families.iter().enumerate() {
                let present = unsafe {
                    surface_loader.get_physical_device_surface_support(
                        device,
                        index as u32,
                        surface,
                    )
                }?;
                families.push((family.queue_flags, present));
            }

            let Some(queue_families) = select_queue_families(&families) else {
                log::debug!("Skipping {}: missing queue families", name);
                missing_queues = true;
                continue;
            };

            // Score device (prefer discrete GPU)
            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if score > best_score {
                best_score = score;
                best_device = Some((device, queue_families));
            }
        }

        match best_device {
            Some(found) => Ok(found),
            None if missing_queues => anyhow::bail!("Required queue families not available"),
            None => anyhow::bail!("No suitable GPU found"),
        }
    }

    fn check_device_features(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
        let mut features_13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features = vk::PhysicalDeviceFeatures2::builder().push_next(&mut features_13);
        unsafe { instance.get_physical_device_features2(device, &mut features) };

        let anisotropy = features.features.sampler_anisotropy == vk::TRUE;
        anisotropy
            && features_13.synchronization2 == vk::TRUE
            && features_13.dynamic_rendering == vk::TRUE
    }

    fn check_device_extensions(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
    ) -> Result<bool> {
        let available = unsafe { instance.enumerate_device_extension_properties(device) }?;
        let available_names: Vec<&CStr> = available
            .iter()
            .map(|props| unsafe { CStr::from_ptr(props.extension_name.as_ptr()) })
            .collect();

        Ok(find_missing(&required_device_extensions(), &available_names).is_none())
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: QueueFamilies,
    ) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
        let queue_priorities = [0.5];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        // Required device extensions
        let extensions: Vec<*const c_char> = required_device_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        let features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(true)
            .build();
        // Vulkan 1.3 core: barriers via synchronization2, no render pass objects
        let mut features_13 = vk::PhysicalDeviceVulkan13Features::builder()
            .synchronization2(true)
            .dynamic_rendering(true)
            .build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features)
            .push_next(&mut features_13);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };

        Ok((device, graphics_queue, present_queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        Ok(allocator)
    }

    /// Allocate memory for a buffer or image
    pub fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        self.allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for {}", name))
    }

    /// Return memory to the allocator
    pub fn free(&self, allocation: Allocation) {
        if let Err(e) = self.allocator.lock().free(allocation) {
            log::warn!("Failed to free allocation: {}", e);
        }
    }

    /// First candidate whose tiling features include `features`
    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> Result<vk::Format> {
        candidates
            .iter()
            .copied()
            .find(|&format| {
                let props = self.format_properties(format);
                match tiling {
                    vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
                    vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
                    _ => false,
                }
            })
            .context("No supported format among candidates")
    }

    pub fn find_depth_format(&self) -> Result<vk::Format> {
        self.find_supported_format(
            &[
                vk::Format::D32_SFLOAT,
                vk::Format::D32_SFLOAT_S8_UINT,
                vk::Format::D24_UNORM_S8_UINT,
            ],
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )
        .context("No supported depth format")
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        // Allocator frees its memory blocks through the device; the device,
        // surface and instance owners follow as fields
        unsafe { ManuallyDrop::drop(&mut self.allocator) };
    }
}

/// Pick graphics and present families.
///
/// A family that can do both wins outright; otherwise the first family of
/// each kind is used.
pub fn select_queue_families(families: &[(vk::QueueFlags, bool)]) -> Option<QueueFamilies> {
    let mut graphics = None;
    let mut present = None;

    for (index, &(flags, present_support)) in families.iter().enumerate() {
        let index = index as u32;
        let supports_graphics = flags.contains(vk::QueueFlags::GRAPHICS);

        if supports_graphics && present_support {
            return Some(QueueFamilies {
                graphics: index,
                present: index,
            });
        }
        if supports_graphics && graphics.is_none() {
            graphics = Some(index);
        }
        if present_support && present.is_none() {
            present = Some(index);
        }
    }

    Some(QueueFamilies {
        graphics: graphics?,
        present: present?,
    })
}

/// Highest sample count in `supported` that does not exceed `cap`
pub fn max_usable_sample_count(supported: vk::SampleCountFlags, cap: u32) -> vk::SampleCountFlags {
    SAMPLE_COUNTS
        .iter()
        .find(|&&(flag, count)| count <= cap && supported.contains(flag))
        .map(|&(flag, _)| flag)
        .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

/// First required name absent from `available`
pub fn find_missing<'a>(required: &[&'a CStr], available: &[&CStr]) -> Option<&'a CStr> {
    required
        .iter()
        .copied()
        .find(|name| !available.contains(name))
}

pub fn has_stencil_component(format: vk::Format) -> bool {
    format == vk::Format::D32_SFLOAT_S8_UINT || format == vk::Format::D24_UNORM_S8_UINT
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    log::log!(
        message_log_level(message_severity),
        "[Vulkan] {:?} {}",
        message_type,
        message.to_string_lossy()
    );

    vk::FALSE
}

/// Errors and warnings keep their level, verbose output goes to debug
fn message_log_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> log::Level {
    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::Level::Error,
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::Level::Warn,
        _ => log::Level::Debug,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAPHICS: vk::QueueFlags = vk::QueueFlags::GRAPHICS;
    const TRANSFER: vk::QueueFlags = vk::QueueFlags::TRANSFER;

    #[test]
    fn shared_family_wins() {
        let families = [(GRAPHICS, false), (TRANSFER, true), (GRAPHICS, true)];
        assert_eq!(
            select_queue_families(&families),
            Some(QueueFamilies {
                graphics: 2,
                present: 2
            })
        );
    }

    #[test]
    fn split_families_use_first_of_each() {
        let families = [(TRANSFER, false), (GRAPHICS, false), (TRANSFER, true), (GRAPHICS, false)];
        let selected = select_queue_families(&families).unwrap();
        assert_eq!(selected.graphics, 1);
        assert_eq!(selected.present, 2);
        assert_eq!(selected.unique(), vec![1, 2]);
    }

    #[test]
    fn missing_family_is_none() {
        assert_eq!(select_queue_families(&[(GRAPHICS, false)]), None);
        assert_eq!(select_queue_families(&[(TRANSFER, true)]), None);
        assert_eq!(select_queue_families(&[]), None);
    }

    #[test]
    fn sample_count_picks_highest_supported() {
        let supported = vk::SampleCountFlags::TYPE_1
            | vk::SampleCountFlags::TYPE_2
            | vk::SampleCountFlags::TYPE_4
            | vk::SampleCountFlags::TYPE_8;
        assert_eq!(max_usable_sample_count(supported, 64), vk::SampleCountFlags::TYPE_8);
        assert_eq!(max_usable_sample_count(supported, 4), vk::SampleCountFlags::TYPE_4);
        assert_eq!(max_usable_sample_count(supported, 1), vk::SampleCountFlags::TYPE_1);
        assert_eq!(
            max_usable_sample_count(vk::SampleCountFlags::TYPE_1, 64),
            vk::SampleCountFlags::TYPE_1
        );
    }

    #[test]
    fn missing_names_are_reported() {
        let available = [c"VK_KHR_surface", c"VK_KHR_xcb_surface"];
        assert_eq!(find_missing(&[c"VK_KHR_surface"], &available), None);
        assert_eq!(
            find_missing(&[c"VK_KHR_surface", c"VK_EXT_debug_utils"], &available),
            Some(c"VK_EXT_debug_utils")
        );
        assert_eq!(find_missing(&[], &available), None);
    }

    #[test]
    fn stencil_formats() {
        assert!(has_stencil_component(vk::Format::D24_UNORM_S8_UINT));
        assert!(has_stencil_component(vk::Format::D32_SFLOAT_S8_UINT));
        assert!(!has_stencil_component(vk::Format::D32_SFLOAT));
    }

    #[test]
    fn validation_messages_map_to_log_levels() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as Severity;
        assert_eq!(message_log_level(Severity::ERROR), log::Level::Error);
        assert_eq!(message_log_level(Severity::WARNING), log::Level::Warn);
        assert_eq!(message_log_level(Severity::VERBOSE), log::Level::Debug);
    }
}
