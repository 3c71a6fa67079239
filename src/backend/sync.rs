// Synchronization primitives
//
// One set per in-flight frame: the fence gates CPU reuse of the slot, the
// semaphores order acquire -> render -> present on the GPU.

use ash::vk;

use super::error::{BackendResult, VkResultExt};

/// Reset a slot's fence, then run a submit that signals it.
///
/// A failed submit leaves nothing queued that would signal the fence, so
/// `signal` is run to signal it some other way. Later waits on the slot,
/// including the one at teardown, still return.
pub fn fenced_submit(
    reset: impl FnOnce() -> Result<(), vk::Result>,
    submit: impl FnOnce() -> Result<(), vk::Result>,
    signal: impl FnOnce() -> Result<(), vk::Result>,
) -> BackendResult<()> {
    reset().or_fail("reset in-flight fence")?;

    let Err(code) = submit() else {
        return Ok(());
    };
    if let Err(signal_code) = signal() {
        log::error!("In-flight fence left unsignaled after failed submit: {:?}", signal_code);
    }
    Err(code).or_fail("queue submit")
}

/// Flags for a freshly created in-flight fence. Signaled, so the very first
/// wait on a slot returns immediately.
pub fn in_flight_fence_flags() -> vk::FenceCreateFlags {
    vk::FenceCreateFlags::SIGNALED
}

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> BackendResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(in_flight_fence_flags());

        unsafe {
            let image_available = device
                .create_semaphore(&semaphore_info, None)
                .or_init_fail("image-available semaphore")?;

            let render_finished = match device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(code) => {
                    device.destroy_semaphore(image_available, None);
                    return Err(code).or_init_fail("render-finished semaphore");
                }
            };

            let in_flight_fence = match device.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(code) => {
                    device.destroy_semaphore(render_finished, None);
                    device.destroy_semaphore(image_available, None);
                    return Err(code).or_init_fail("in-flight fence");
                }
            };

            Ok(Self {
                image_available,
                render_finished,
                in_flight_fence,
            })
        }
    }

    /// Block until the GPU has finished the last submission on this slot,
    /// or until `timeout_ns` runs out
    pub fn wait(&self, device: &ash::Device, timeout_ns: u64) -> BackendResult<()> {
        unsafe { device.wait_for_fences(&[self.in_flight_fence], true, timeout_ns) }
            .or_fail("wait for in-flight fence")
    }

    /// Fence first, then both semaphores
    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_fence(self.in_flight_fence, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_semaphore(self.image_available, None);
        }
    }
}
