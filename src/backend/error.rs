// Backend error taxonomy
//
// Every native call is checked right after it returns; failures become one of
// these variants carrying the raw VkResult for diagnostics. Only a stale
// swapchain is recoverable in place, everything else ends the application.

use ash::vk;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    /// Instance, surface or other startup object could not be created
    #[error("initialization failed: {what} ({code:?})")]
    Initialization { what: &'static str, code: vk::Result },

    /// The Vulkan loader itself could not be found
    #[error("failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("no Vulkan-capable GPU found")]
    NoDevicesFound,

    #[error("GPUs were found, but no device is suitable")]
    NoSuitableDevice,

    #[error("logical device creation failed ({0:?})")]
    DeviceCreation(vk::Result),

    #[error("surface reports no formats")]
    NoSurfaceFormats,

    /// GPU memory or transfer failure. Never retried.
    #[error("GPU allocation failed: {what} ({code:?})")]
    Allocation { what: &'static str, code: vk::Result },

    #[error("GPU allocator error: {0}")]
    Allocator(#[from] gpu_allocator::AllocationError),

    /// Swapchain no longer matches the surface and must be rebuilt
    #[error("swapchain is out of date")]
    SwapchainStale,

    #[error("Vulkan call failed: {what} ({code:?})")]
    Vulkan { what: &'static str, code: vk::Result },

    #[error("shader error: {0}")]
    Shader(String),
}

impl BackendError {
    /// Stale swapchains trigger recreation; nothing else can be handled in place.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SwapchainStale)
    }

    /// Raw native result code, when the failure came from a Vulkan call
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Initialization { code, .. }
            | Self::Allocation { code, .. }
            | Self::Vulkan { code, .. }
            | Self::DeviceCreation(code) => Some(code.as_raw()),
            Self::SwapchainStale => Some(vk::Result::ERROR_OUT_OF_DATE_KHR.as_raw()),
            _ => None,
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Converts raw `VkResult` failures into the matching taxonomy entry
pub trait VkResultExt<T> {
    fn or_init_fail(self, what: &'static str) -> BackendResult<T>;
    fn or_alloc_fail(self, what: &'static str) -> BackendResult<T>;
    fn or_fail(self, what: &'static str) -> BackendResult<T>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn or_init_fail(self, what: &'static str) -> BackendResult<T> {
        self.map_err(|code| BackendError::Initialization { what, code })
    }

    fn or_alloc_fail(self, what: &'static str) -> BackendResult<T> {
        self.map_err(|code| BackendError::Allocation { what, code })
    }

    fn or_fail(self, what: &'static str) -> BackendResult<T> {
        self.map_err(|code| match code {
            vk::Result::ERROR_OUT_OF_DATE_KHR => BackendError::SwapchainStale,
            code => BackendError::Vulkan { what, code },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_stale_swapchain_is_recoverable() {
        assert!(BackendError::SwapchainStale.is_recoverable());
        assert!(!BackendError::NoSuitableDevice.is_recoverable());
        assert!(!BackendError::Allocation {
            what: "buffer",
            code: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        }
        .is_recoverable());
    }

    #[test]
    fn allocation_failure_carries_native_code() {
        let result: Result<(), vk::Result> = Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let err = result.or_alloc_fail("staging buffer").unwrap_err();

        assert!(matches!(err, BackendError::Allocation { what: "staging buffer", .. }));
        assert_eq!(err.code(), Some(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.as_raw()));
    }

    #[test]
    fn out_of_date_maps_to_stale_swapchain() {
        let result: Result<(), vk::Result> = Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        let err = result.or_fail("acquire").unwrap_err();

        assert!(matches!(err, BackendError::SwapchainStale));
    }

    #[test]
    fn device_creation_reports_code_in_message() {
        let err = BackendError::DeviceCreation(vk::Result::ERROR_INITIALIZATION_FAILED);

        assert!(err.to_string().contains("ERROR_INITIALIZATION_FAILED"));
        assert_eq!(err.code(), Some(vk::Result::ERROR_INITIALIZATION_FAILED.as_raw()));
    }
}
