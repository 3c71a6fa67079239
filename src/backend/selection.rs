// Physical device selection
//
// Pure decision logic, separated from the Vulkan queries that feed it so the
// selection policy can be exercised without a driver.

use ash::vk;
use std::collections::BTreeSet;
use std::ffi::CStr;

use super::error::{BackendError, BackendResult};

/// Device extensions every candidate must expose
pub fn required_device_extensions() -> [&'static CStr; 1] {
    [ash::extensions::khr::Swapchain::name()]
}

/// Queue families resolved for a device. Both must be set before the device
/// is usable; they may point at the same family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilySelection {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilySelection {
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Distinct family indices, one queue request each
    pub fn unique_indices(&self) -> Vec<u32> {
        self.graphics
            .into_iter()
            .chain(self.present)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }
}

/// Walk queue families in order. Later graphics/present families overwrite
/// earlier ones until both have been seen.
pub fn find_queue_families(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: impl FnMut(u32) -> bool,
) -> QueueFamilySelection {
    let mut selection = QueueFamilySelection::default();

    for (index, family) in families.iter().enumerate() {
        let index = index as u32;

        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            selection.graphics = Some(index);
        }
        if supports_present(index) {
            selection.present = Some(index);
        }

        if selection.is_complete() {
            break;
        }
    }

    selection
}

/// Extensions from `required` that `available` does not list
pub fn missing_extensions<'a>(
    required: &[&'a CStr],
    available: &[vk::ExtensionProperties],
) -> Vec<&'a CStr> {
    required
        .iter()
        .copied()
        .filter(|wanted| {
            !available.iter().any(|ext| {
                let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
                name == *wanted
            })
        })
        .collect()
}

/// Everything selection needs to know about one physical device
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub queue_families: QueueFamilySelection,
    pub extensions_supported: bool,
    pub surface_format_count: usize,
    pub present_mode_count: usize,
}

impl DeviceCandidate {
    pub fn is_suitable(&self) -> bool {
        self.queue_families.is_complete()
            && self.extensions_supported
            && self.surface_format_count > 0
            && self.present_mode_count > 0
    }
}

/// Pick the last suitable device in enumeration order.
pub fn select_device(candidates: &[DeviceCandidate]) -> BackendResult<&DeviceCandidate> {
    if candidates.is_empty() {
        return Err(BackendError::NoDevicesFound);
    }

    let mut chosen = None;
    for candidate in candidates {
        log::info!(
            "GPU {:?}: {} ({})",
            candidate.handle,
            candidate.name,
            if candidate.is_suitable() { "suitable" } else { "unsuitable" }
        );
        if candidate.is_suitable() {
            chosen = Some(candidate);
        }
    }

    chosen.ok_or(BackendError::NoSuitableDevice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn candidate(raw: u64, suitable: bool) -> DeviceCandidate {
        DeviceCandidate {
            handle: vk::PhysicalDevice::from_raw(raw),
            name: format!("gpu-{raw}"),
            queue_families: QueueFamilySelection {
                graphics: Some(0),
                present: Some(0),
            },
            extensions_supported: suitable,
            surface_format_count: 1,
            present_mode_count: 1,
        }
    }

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn extension(name: &CStr) -> vk::ExtensionProperties {
        let mut ext = vk::ExtensionProperties::default();
        for (dst, src) in ext.extension_name.iter_mut().zip(name.to_bytes()) {
            *dst = *src as std::ffi::c_char;
        }
        ext
    }

    #[test]
    fn empty_enumeration_is_no_devices_found() {
        assert!(matches!(select_device(&[]), Err(BackendError::NoDevicesFound)));
    }

    #[test]
    fn no_suitable_device_is_reported() {
        let devices = [candidate(1, false), candidate(2, false)];
        assert!(matches!(
            select_device(&devices),
            Err(BackendError::NoSuitableDevice)
        ));
    }

    #[test]
    fn single_suitable_device_is_selected() {
        let devices = [candidate(1, false), candidate(2, true), candidate(3, false)];
        let chosen = select_device(&devices).unwrap();
        assert_eq!(chosen.handle.as_raw(), 2);
    }

    #[test]
    fn last_suitable_device_wins() {
        let devices = [
            candidate(1, true),
            candidate(2, true),
            candidate(3, false),
            candidate(4, true),
            candidate(5, false),
        ];
        let chosen = select_device(&devices).unwrap();
        assert_eq!(chosen.handle.as_raw(), 4);
    }

    #[test]
    fn suitability_requires_formats_and_present_modes() {
        let mut device = candidate(1, true);
        assert!(device.is_suitable());

        device.surface_format_count = 0;
        assert!(!device.is_suitable());

        device.surface_format_count = 2;
        device.present_mode_count = 0;
        assert!(!device.is_suitable());

        device.present_mode_count = 1;
        device.queue_families.present = None;
        assert!(!device.is_suitable());
    }

    #[test]
    fn queue_search_stops_once_complete() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS),
        ];
        let selection = find_queue_families(&families, |index| index >= 1);

        assert_eq!(selection.graphics, Some(1));
        assert_eq!(selection.present, Some(1));
        assert!(selection.is_shared());
    }

    #[test]
    fn split_graphics_and_present_families() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
        ];
        let selection = find_queue_families(&families, |index| index == 1);

        assert_eq!(selection.graphics, Some(0));
        assert_eq!(selection.present, Some(1));
        assert_eq!(selection.unique_indices(), vec![0, 1]);
    }

    #[test]
    fn shared_family_is_requested_once() {
        let selection = QueueFamilySelection {
            graphics: Some(2),
            present: Some(2),
        };
        assert_eq!(selection.unique_indices(), vec![2]);
    }

    #[test]
    fn missing_swapchain_extension_is_detected() {
        let required = required_device_extensions();
        let other = CStr::from_bytes_with_nul(b"VK_KHR_maintenance1\0").unwrap();

        assert_eq!(missing_extensions(&required, &[extension(other)]), required.to_vec());
        assert!(missing_extensions(&required, &[extension(other), extension(required[0])]).is_empty());
    }
}
