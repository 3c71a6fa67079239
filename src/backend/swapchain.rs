// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Lifecycle: Uninitialized -> Active -> RecreationPending -> Active.
// The old chain is torn down completely before a new one is built.

use ash::vk;
use std::sync::Arc;

use super::error::{BackendError, BackendResult, VkResultExt};
use super::selection::QueueFamilySelection;
use super::DeviceContext;

/// Where the swapchain is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainStatus {
    Uninitialized,
    Active,
    RecreationPending,
}

/// Prefer 8-bit BGRA sRGB, otherwise take whatever the surface lists first
pub fn choose_surface_format(
    candidates: &[vk::SurfaceFormatKHR],
) -> BackendResult<vk::SurfaceFormatKHR> {
    candidates
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| candidates.first())
        .copied()
        .ok_or(BackendError::NoSurfaceFormats)
}

/// Configured mode if offered, then MAILBOX, then FIFO.
/// MAILBOX: no vsync, no tearing, triple buffered
/// FIFO: vsync, always supported
pub fn choose_present_mode(
    candidates: &[vk::PresentModeKHR],
    preferred: Option<vk::PresentModeKHR>,
) -> vk::PresentModeKHR {
    preferred
        .filter(|mode| candidates.contains(mode))
        .or_else(|| {
            candidates
                .iter()
                .copied()
                .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
        })
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// A fixed current extent is used as is; `u32::MAX` means the window decides
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    framebuffer_width: u32,
    framebuffer_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: framebuffer_width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: framebuffer_height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum; `max_image_count == 0` means no upper bound
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Images are shared between queues only when graphics and present differ
pub fn sharing_mode(families: &QueueFamilySelection) -> (vk::SharingMode, Vec<u32>) {
    if families.is_shared() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (vk::SharingMode::CONCURRENT, families.unique_indices())
    }
}

/// Format, extent and images of one live swapchain
pub struct SwapchainState {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
}

pub struct SwapchainManager {
    loader: ash::extensions::khr::Swapchain,
    state: Option<SwapchainState>,
    status: SwapchainStatus,
    preferred_present_mode: Option<vk::PresentModeKHR>,
    context: Arc<DeviceContext>,
}

impl SwapchainManager {
    pub fn new(
        context: Arc<DeviceContext>,
        preferred_present_mode: Option<vk::PresentModeKHR>,
    ) -> Self {
        let loader = ash::extensions::khr::Swapchain::new(&context.instance, &context.device);
        Self {
            loader,
            state: None,
            status: SwapchainStatus::Uninitialized,
            preferred_present_mode,
            context,
        }
    }

    pub fn status(&self) -> SwapchainStatus {
        self.status
    }

    /// Live swapchain, absent while uninitialized or deferred
    pub fn state(&self) -> Option<&SwapchainState> {
        self.state.as_ref()
    }

    pub fn needs_recreation(&self) -> bool {
        self.status != SwapchainStatus::Active
    }

    /// Flag the chain as stale; the next `recreate` rebuilds it
    pub fn mark_stale(&mut self) {
        if self.status == SwapchainStatus::Active {
            log::debug!("Swapchain marked for recreation");
            self.status = SwapchainStatus::RecreationPending;
        }
    }

    /// Rebuild the chain for the given framebuffer size.
    ///
    /// The caller must have waited for the device to go idle and released
    /// everything built on the old image views. Returns `false` when the
    /// framebuffer is zero-sized (minimized) and creation was deferred.
    pub fn recreate(&mut self, width: u32, height: u32) -> BackendResult<bool> {
        self.destroy_state();

        if width == 0 || height == 0 {
            log::debug!("Framebuffer is {}x{}, deferring swapchain creation", width, height);
            self.status = SwapchainStatus::RecreationPending;
            return Ok(false);
        }

        let state = self.create_state(width, height)?;
        log::info!(
            "Swapchain ready: {}x{}, {} images, {:?}, {:?}",
            state.extent.width,
            state.extent.height,
            state.images.len(),
            state.format,
            state.present_mode
        );

        self.state = Some(state);
        self.status = SwapchainStatus::Active;
        Ok(true)
    }

    fn create_state(&self, width: u32, height: u32) -> BackendResult<SwapchainState> {
        let support = self.context.surface_support()?;

        let surface_format = choose_surface_format(&support.formats)?;
        let present_mode =
            choose_present_mode(&support.present_modes, self.preferred_present_mode);
        let extent = choose_extent(&support.capabilities, width, height);
        let image_count = choose_image_count(&support.capabilities);
        let (sharing, family_indices) = sharing_mode(&self.context.queue_families);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.context.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing)
            .queue_family_indices(&family_indices)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }
            .or_init_fail("swapchain")?;

        let images = match unsafe { self.loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(code) => {
                unsafe { self.loader.destroy_swapchain(swapchain, None) };
                return Err(BackendError::Initialization {
                    what: "swapchain images",
                    code,
                });
            }
        };

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            match self.create_image_view(image, surface_format.format) {
                Ok(view) => image_views.push(view),
                Err(err) => {
                    unsafe {
                        for &view in &image_views {
                            self.context.device.destroy_image_view(view, None);
                        }
                        self.loader.destroy_swapchain(swapchain, None);
                    }
                    return Err(err);
                }
            }
        }

        Ok(SwapchainState {
            swapchain,
            images,
            image_views,
            format: surface_format.format,
            extent,
            present_mode,
        })
    }

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> BackendResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe { self.context.device.create_image_view(&create_info, None) }
            .or_init_fail("swapchain image view")
    }

    fn destroy_state(&mut self) {
        if let Some(state) = self.state.take() {
            unsafe {
                for &view in &state.image_views {
                    self.context.device.destroy_image_view(view, None);
                }
                self.loader.destroy_swapchain(state.swapchain, None);
            }
        }
    }

    /// Acquire the next image. Out-of-date surfaces as `SwapchainStale`;
    /// a suboptimal image is returned and the chain is marked for recreation.
    pub fn acquire_next_image(&mut self, semaphore: vk::Semaphore) -> BackendResult<u32> {
        let swapchain = self
            .state
            .as_ref()
            .map(|state| state.swapchain)
            .ok_or(BackendError::SwapchainStale)?;

        let (index, suboptimal) = unsafe {
            self.loader
                .acquire_next_image(swapchain, u64::MAX, semaphore, vk::Fence::null())
        }
        .or_fail("acquire next image")?;

        if suboptimal {
            self.mark_stale();
        }
        Ok(index)
    }

    /// Present an image. Out-of-date or suboptimal marks the chain for
    /// recreation at the start of the next iteration instead of failing.
    pub fn present(
        &mut self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> BackendResult<()> {
        let swapchain = self
            .state
            .as_ref()
            .map(|state| state.swapchain)
            .ok_or(BackendError::SwapchainStale)?;

        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(()),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.mark_stale();
                Ok(())
            }
            Err(code) => Err(BackendError::Vulkan {
                what: "queue present",
                code,
            }),
        }
    }
}

impl Drop for SwapchainManager {
    fn drop(&mut self) {
        self.destroy_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    fn capabilities(
        current: (u32, u32),
        min: (u32, u32),
        max: (u32, u32),
    ) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        }
    }

    #[test]
    fn srgb_bgra_is_preferred() {
        let candidates = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&candidates).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn first_format_is_the_fallback() {
        let candidates = [
            format(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&candidates).unwrap();
        assert_eq!(chosen, candidates[0]);
    }

    #[test]
    fn empty_format_list_is_an_error() {
        assert!(matches!(
            choose_surface_format(&[]),
            Err(BackendError::NoSurfaceFormats)
        ));
    }

    #[test]
    fn mailbox_is_preferred_over_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&modes, None), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn fifo_when_mailbox_is_absent() {
        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&modes, None), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&[], None), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn configured_mode_wins_only_when_offered() {
        let modes = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(
            choose_present_mode(&modes, Some(vk::PresentModeKHR::IMMEDIATE)),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(&modes[..2], Some(vk::PresentModeKHR::IMMEDIATE)),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn fixed_current_extent_is_used_verbatim() {
        let caps = capabilities((800, 600), (1, 1), (4096, 4096));
        assert_eq!(
            choose_extent(&caps, 1920, 1080),
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );
    }

    #[test]
    fn window_defined_extent_is_clamped() {
        let caps = capabilities((u32::MAX, u32::MAX), (64, 64), (2048, 1024));

        let extent = choose_extent(&caps, 4000, 10);
        assert_eq!(extent.width, 2048);
        assert_eq!(extent.height, 64);

        let extent = choose_extent(&caps, 1280, 720);
        assert_eq!((extent.width, extent.height), (1280, 720));
    }

    #[test]
    fn image_count_is_min_plus_one_within_bounds() {
        let mut caps = capabilities((800, 600), (1, 1), (800, 600));
        assert_eq!(choose_image_count(&caps), 3);

        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);

        caps.max_image_count = 8;
        assert_eq!(choose_image_count(&caps), 3);
    }

    #[test]
    fn distinct_families_share_images_concurrently() {
        let split = QueueFamilySelection {
            graphics: Some(0),
            present: Some(2),
        };
        assert_eq!(sharing_mode(&split), (vk::SharingMode::CONCURRENT, vec![0, 2]));

        let shared = QueueFamilySelection {
            graphics: Some(1),
            present: Some(1),
        };
        assert_eq!(sharing_mode(&shared), (vk::SharingMode::EXCLUSIVE, vec![]));
    }
}
