// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Window surface creation
// - Physical device selection (last suitable device wins)
// - Logical device + graphics/present queue creation

use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use super::debug::{messenger_create_info, DebugMessenger, LogValidationHandler, ValidationHandler};
use super::error::{BackendError, BackendResult, VkResultExt};
use super::selection::{
    find_queue_families, missing_extensions, required_device_extensions, select_device,
    DeviceCandidate, QueueFamilySelection,
};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Surface properties queried for one physical device
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn query(
        loader: &ash::extensions::khr::Surface,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> BackendResult<Self> {
        unsafe {
            Ok(Self {
                capabilities: loader
                    .get_physical_device_surface_capabilities(physical_device, surface)
                    .or_fail("surface capabilities")?,
                formats: loader
                    .get_physical_device_surface_formats(physical_device, surface)
                    .or_fail("surface formats")?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(physical_device, surface)
                    .or_fail("surface present modes")?,
            })
        }
    }
}

/// Owns the instance, surface and logical device.
///
/// Everything else holds an `Arc<DeviceContext>`, so the device is only
/// destroyed after the last dependent has released its resources.
pub struct DeviceContext {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    pub surface_loader: ash::extensions::khr::Surface,
    pub surface: vk::SurfaceKHR,

    // Queue handles
    pub queue_families: QueueFamilySelection,
    pub graphics_queue_family: u32,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,

    debug_messenger: Option<DebugMessenger>,
}

impl DeviceContext {
    /// Create the full device context for a window.
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `enable_validation` - Enable Vulkan validation layers
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> BackendResult<Arc<Self>> {
        Self::with_validation_handler(
            app_name,
            enable_validation.then(|| Box::new(LogValidationHandler) as Box<dyn ValidationHandler>),
            display_handle,
            window_handle,
        )
    }

    /// Like [`DeviceContext::new`], with a caller-supplied validation handler.
    /// Validation is enabled iff a handler is given.
    pub fn with_validation_handler(
        app_name: &str,
        validation_handler: Option<Box<dyn ValidationHandler>>,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> BackendResult<Arc<Self>> {
        log::info!("Creating Vulkan device context: {}", app_name);

        let entry = unsafe { Entry::load() }?;
        let handler = validation_handler.map(Box::new);

        let instance = Self::create_instance(&entry, app_name, display_handle, handler.as_deref())?;

        let debug_messenger = match handler {
            Some(handler) => Some(DebugMessenger::new(&entry, &instance, handler)?),
            None => None,
        };

        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        }
        .or_init_fail("window surface")?;
        let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);

        let (physical_device, queue_families) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        let (graphics_queue_family, present_queue_family) =
            match (queue_families.graphics, queue_families.present) {
                (Some(graphics), Some(present)) => (graphics, present),
                _ => return Err(BackendError::NoSuitableDevice),
            };

        let device = Self::create_logical_device(&instance, physical_device, &queue_families)?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_queue_family, 0) };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

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
        log::info!(
            "Queue families: graphics={} present={}",
            graphics_queue_family,
            present_queue_family
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            _entry: entry,
            surface_loader,
            surface,
            queue_families,
            graphics_queue_family,
            graphics_queue,
            present_queue,
            debug_messenger,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        display_handle: RawDisplayHandle,
        validation_handler: Option<&Box<dyn ValidationHandler>>,
    ) -> BackendResult<ash::Instance> {
        let app_name_cstr = CString::new(app_name).unwrap_or_else(|_| c"frame-engine".to_owned());
        let engine_name = c"frame-engine";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        // Surface extensions for whatever platform the window lives on
        let mut extensions: Vec<*const c_char> =
            ash_window::enumerate_required_extensions(display_handle)
                .or_init_fail("surface extensions")?
                .to_vec();

        let mut layer_names = Vec::new();
        if validation_handler.is_some() {
            log::info!("Validation layers enabled. Checking layer support...");
            if !Self::validation_layer_available(entry)? {
                log::error!("{:?} is not installed", VALIDATION_LAYER);
                return Err(BackendError::Initialization {
                    what: "validation layer not available",
                    code: vk::Result::ERROR_LAYER_NOT_PRESENT,
                });
            }
            layer_names.push(VALIDATION_LAYER.as_ptr());
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        } else {
            log::info!("Validation layers disabled");
        }

        for &ext in &extensions {
            log::debug!("Enabling instance extension {:?}", unsafe { CStr::from_ptr(ext) });
        }

        let mut create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        // Also validate instance creation and destruction
        let mut instance_debug_info = validation_handler.map(messenger_create_info);
        if let Some(info) = instance_debug_info.as_mut() {
            create_info = create_info.push_next(info);
        }

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .or_init_fail("Vulkan instance")?;

        log::info!("Vulkan instance created");
        Ok(instance)
    }

    fn validation_layer_available(entry: &Entry) -> BackendResult<bool> {
        let layers = unsafe { entry.enumerate_instance_layer_properties() }
            .or_init_fail("instance layer enumeration")?;

        Ok(layers.iter().any(|layer| {
            let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
            name == VALIDATION_LAYER
        }))
    }

    /// Gather everything device selection needs from one physical device
    fn probe_device(
        instance: &ash::Instance,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
        physical_device: vk::PhysicalDevice,
    ) -> BackendResult<DeviceCandidate> {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let queue_families = find_queue_families(&families, |index| unsafe {
            surface_loader
                .get_physical_device_surface_support(physical_device, index, surface)
                .unwrap_or(false)
        });

        let available = unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .or_init_fail("device extension enumeration")?;
        let missing = missing_extensions(&required_device_extensions(), &available);
        if !missing.is_empty() {
            log::debug!("{} lacks extensions {:?}", name, missing);
        }

        // Only ask about the surface once the swapchain extension is known to exist
        let (surface_format_count, present_mode_count) = if missing.is_empty() {
            let support = SurfaceSupport::query(surface_loader, physical_device, surface)?;
            (support.formats.len(), support.present_modes.len())
        } else {
            (0, 0)
        };

        Ok(DeviceCandidate {
            handle: physical_device,
            name,
            queue_families,
            extensions_supported: missing.is_empty(),
            surface_format_count,
            present_mode_count,
        })
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> BackendResult<(vk::PhysicalDevice, QueueFamilySelection)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .or_init_fail("physical device enumeration")?;

        let candidates = devices
            .into_iter()
            .map(|device| Self::probe_device(instance, surface_loader, surface, device))
            .collect::<BackendResult<Vec<_>>>()?;

        let chosen = select_device(&candidates)?;
        Ok((chosen.handle, chosen.queue_families))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: &QueueFamilySelection,
    ) -> BackendResult<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = queue_families
            .unique_indices()
            .into_iter()
            .map(|index| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(index)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions: Vec<*const c_char> = required_device_extensions()
            .iter()
            .map(|ext| ext.as_ptr())
            .collect();

        let features = vk::PhysicalDeviceFeatures::default();
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        unsafe { instance.create_device(physical_device, &create_info, None) }
            .map_err(BackendError::DeviceCreation)
    }

    /// Current surface properties for the selected device
    pub fn surface_support(&self) -> BackendResult<SurfaceSupport> {
        SurfaceSupport::query(&self.surface_loader, self.physical_device, self.surface)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> BackendResult<()> {
        unsafe { self.device.device_wait_idle() }.or_fail("device wait idle")
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(err) = self.wait_idle() {
            log::error!("Device did not go idle before destruction: {}", err);
        }

        // Cleanup in reverse order
        unsafe {
            self.device.destroy_device(None);

            if let Some(messenger) = self.debug_messenger.as_mut() {
                messenger.destroy();
            }

            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}
