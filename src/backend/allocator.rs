// Device allocator - GPU memory for buffers and images
//
// Wraps gpu-allocator. Every allocation is returned to the caller as an owned
// value and must be handed back to `free`; there is no reference counting.
// Host-to-device uploads go through a staging buffer and a one-shot copy that
// blocks until the queue drains, so they belong at load time only.

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation as GpuAllocation, AllocationCreateDesc, AllocationScheme, Allocator,
    AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

use super::error::{BackendError, BackendResult, VkResultExt};
use super::DeviceContext;

/// How the backing memory block is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationStrategy {
    /// Sub-allocated from a shared memory block
    #[default]
    Shared,
    /// Owns a dedicated memory block
    Dedicated,
}

/// Buffers at least this large get their own memory block instead of
/// claiming a big share of a shared one
pub const DEDICATED_THRESHOLD: vk::DeviceSize = 64 * 1024 * 1024;

impl AllocationStrategy {
    pub fn for_size(size: vk::DeviceSize) -> Self {
        if size >= DEDICATED_THRESHOLD {
            Self::Dedicated
        } else {
            Self::Shared
        }
    }
}

/// A buffer paired with its memory
#[must_use = "buffer allocations must be released with DeviceAllocator::free"]
pub struct BufferAllocation {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: GpuAllocation,
}

/// An image paired with its memory
#[must_use = "image allocations must be released with DeviceAllocator::free"]
pub struct ImageAllocation {
    pub image: vk::Image,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    allocation: GpuAllocation,
}

/// Either kind of allocation, for `DeviceAllocator::free`
pub enum Allocation {
    Buffer(BufferAllocation),
    Image(ImageAllocation),
}

impl From<BufferAllocation> for Allocation {
    fn from(buffer: BufferAllocation) -> Self {
        Self::Buffer(buffer)
    }
}

impl From<ImageAllocation> for Allocation {
    fn from(image: ImageAllocation) -> Self {
        Self::Image(image)
    }
}

/// Pick the allocator memory location that satisfies `properties`
pub fn memory_location(properties: vk::MemoryPropertyFlags) -> MemoryLocation {
    let host_visible = properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);

    if host_visible && properties.contains(vk::MemoryPropertyFlags::HOST_CACHED) {
        MemoryLocation::GpuToCpu
    } else if host_visible {
        MemoryLocation::CpuToGpu
    } else if properties.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) {
        MemoryLocation::GpuOnly
    } else {
        MemoryLocation::Unknown
    }
}

/// Vulkan forbids zero-sized buffers
fn check_buffer_size(size: vk::DeviceSize) -> BackendResult<()> {
    if size == 0 {
        return Err(BackendError::Allocation {
            what: "zero-sized buffer",
            code: vk::Result::ERROR_INITIALIZATION_FAILED,
        });
    }
    Ok(())
}

/// Usage flags actually requested for a buffer; every buffer can be a copy target
pub fn buffer_usage(usage: vk::BufferUsageFlags) -> vk::BufferUsageFlags {
    usage | vk::BufferUsageFlags::TRANSFER_DST
}

pub struct DeviceAllocator {
    allocator: Mutex<Option<Allocator>>,
    transfer_pool: vk::CommandPool,
    transfer_queue: vk::Queue,
    context: Arc<DeviceContext>,
}

impl DeviceAllocator {
    pub fn new(context: Arc<DeviceContext>) -> BackendResult<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: context.instance.clone(),
            device: context.device.clone(),
            physical_device: context.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        // TRANSIENT: one-shot copy buffers only
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(context.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let transfer_pool = unsafe { context.device.create_command_pool(&pool_info, None) }
            .or_init_fail("transfer command pool")?;

        log::info!("Device allocator ready");

        Ok(Self {
            allocator: Mutex::new(Some(allocator)),
            transfer_pool,
            transfer_queue: context.graphics_queue,
            context,
        })
    }

    fn device(&self) -> &ash::Device {
        &self.context.device
    }

    fn allocate_memory(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
        allocation_scheme: AllocationScheme,
    ) -> BackendResult<GpuAllocation> {
        let mut guard = self.allocator.lock();
        let allocator = guard.as_mut().ok_or(BackendError::Allocation {
            what: "allocator already shut down",
            code: vk::Result::ERROR_INITIALIZATION_FAILED,
        })?;

        Ok(allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme,
        })?)
    }

    fn release_memory(&self, allocation: GpuAllocation) -> BackendResult<()> {
        if let Some(allocator) = self.allocator.lock().as_mut() {
            allocator.free(allocation)?;
        }
        Ok(())
    }

    /// Allocate a buffer. `TRANSFER_DST` is always added to `usage`.
    pub fn allocate_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
        strategy: AllocationStrategy,
    ) -> BackendResult<BufferAllocation> {
        check_buffer_size(size)?;

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(buffer_usage(usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device().create_buffer(&buffer_info, None) }
            .or_alloc_fail("create buffer")?;
        let requirements = unsafe { self.device().get_buffer_memory_requirements(buffer) };

        let scheme = match strategy {
            AllocationStrategy::Shared => AllocationScheme::GpuAllocatorManaged,
            AllocationStrategy::Dedicated => AllocationScheme::DedicatedBuffer(buffer),
        };

        let allocation = match self.allocate_memory(
            "buffer",
            requirements,
            memory_location(memory_properties),
            true,
            scheme,
        ) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device().destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        let bound = unsafe {
            self.device()
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(code) = bound {
            unsafe { self.device().destroy_buffer(buffer, None) };
            self.release_memory(allocation)?;
            return Err(BackendError::Allocation {
                what: "bind buffer memory",
                code,
            });
        }

        Ok(BufferAllocation {
            buffer,
            size,
            allocation,
        })
    }

    /// Create a device-local buffer filled with `data`.
    ///
    /// Load-time bulk transfer: blocks the calling thread until the transfer
    /// queue is idle. Never call this on the per-frame path.
    pub fn allocate_device_local_buffer_and_transfer(
        &self,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> BackendResult<BufferAllocation> {
        let size = data.len() as vk::DeviceSize;
        check_buffer_size(size)?;

        let destination = self.allocate_buffer(
            size,
            usage,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            AllocationStrategy::for_size(size),
        )?;

        let staging = match self.allocate_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            AllocationStrategy::Shared,
        ) {
            Ok(staging) => staging,
            Err(err) => {
                self.free(destination)?;
                return Err(err);
            }
        };

        let copied = self
            .write_staging(&staging, data)
            .and_then(|()| self.copy_buffer(staging.buffer, destination.buffer, size));

        self.free(staging)?;

        match copied {
            Ok(()) => Ok(destination),
            Err(err) => {
                self.free(destination)?;
                Err(err)
            }
        }
    }

    fn write_staging(&self, staging: &BufferAllocation, data: &[u8]) -> BackendResult<()> {
        let mapped = staging
            .allocation
            .mapped_ptr()
            .ok_or(BackendError::Allocation {
                what: "staging buffer is not host mapped",
                code: vk::Result::ERROR_MEMORY_MAP_FAILED,
            })?;

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.as_ptr().cast::<u8>(), data.len());
        }
        Ok(())
    }

    /// Record, submit and wait for a one-shot buffer copy
    fn copy_buffer(
        &self,
        source: vk::Buffer,
        destination: vk::Buffer,
        size: vk::DeviceSize,
    ) -> BackendResult<()> {
        let device = self.device();

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.transfer_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
            .or_alloc_fail("transfer command buffer")?[0];

        let result = (|| unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(command_buffer, &begin_info)
                .or_alloc_fail("begin transfer")?;

            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            };
            device.cmd_copy_buffer(command_buffer, source, destination, &[region]);

            device
                .end_command_buffer(command_buffer)
                .or_alloc_fail("end transfer")?;

            let command_buffers = [command_buffer];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            device
                .queue_submit(self.transfer_queue, &[submit_info.build()], vk::Fence::null())
                .or_alloc_fail("submit transfer")?;

            device
                .queue_wait_idle(self.transfer_queue)
                .or_alloc_fail("wait for transfer")
        })();

        unsafe { device.free_command_buffers(self.transfer_pool, &[command_buffer]) };
        result
    }

    /// Device-local image with dedicated memory, for color/depth attachments
    pub fn allocate_image_attachment(
        &self,
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> BackendResult<ImageAllocation> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { self.device().create_image(&image_info, None) }
            .or_alloc_fail("create image")?;
        let requirements = unsafe { self.device().get_image_memory_requirements(image) };

        let allocation = match self.allocate_memory(
            "image attachment",
            requirements,
            MemoryLocation::GpuOnly,
            false,
            AllocationScheme::DedicatedImage(image),
        ) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device().destroy_image(image, None) };
                return Err(err);
            }
        };

        let bound = unsafe {
            self.device()
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(code) = bound {
            unsafe { self.device().destroy_image(image, None) };
            self.release_memory(allocation)?;
            return Err(BackendError::Allocation {
                what: "bind image memory",
                code,
            });
        }

        Ok(ImageAllocation {
            image,
            format,
            extent: vk::Extent2D { width, height },
            allocation,
        })
    }

    /// Release a buffer or image. The handle must not be in use by the GPU.
    pub fn free(&self, allocation: impl Into<Allocation>) -> BackendResult<()> {
        match allocation.into() {
            Allocation::Buffer(buffer) => {
                unsafe { self.device().destroy_buffer(buffer.buffer, None) };
                self.release_memory(buffer.allocation)
            }
            Allocation::Image(image) => {
                unsafe { self.device().destroy_image(image.image, None) };
                self.release_memory(image.allocation)
            }
        }
    }
}

impl Drop for DeviceAllocator {
    fn drop(&mut self) {
        unsafe {
            self.context
                .device
                .destroy_command_pool(self.transfer_pool, None);
        }
        // Reports leaked allocations when dropped
        self.allocator.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_local_maps_to_gpu_only() {
        assert_eq!(
            memory_location(vk::MemoryPropertyFlags::DEVICE_LOCAL),
            MemoryLocation::GpuOnly
        );
    }

    #[test]
    fn host_visible_maps_to_upload_memory() {
        assert_eq!(
            memory_location(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            ),
            MemoryLocation::CpuToGpu
        );
        assert_eq!(
            memory_location(
                vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE
            ),
            MemoryLocation::CpuToGpu
        );
    }

    #[test]
    fn cached_host_memory_maps_to_readback() {
        assert_eq!(
            memory_location(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED
            ),
            MemoryLocation::GpuToCpu
        );
    }

    #[test]
    fn every_buffer_is_a_copy_target() {
        let usage = buffer_usage(vk::BufferUsageFlags::VERTEX_BUFFER);
        assert!(usage.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER));

        assert_eq!(
            buffer_usage(vk::BufferUsageFlags::empty()),
            vk::BufferUsageFlags::TRANSFER_DST
        );
    }

    #[test]
    fn default_strategy_is_shared() {
        assert_eq!(AllocationStrategy::default(), AllocationStrategy::Shared);
    }

    #[test]
    fn large_buffers_get_dedicated_memory() {
        assert_eq!(AllocationStrategy::for_size(4096), AllocationStrategy::Shared);
        assert_eq!(
            AllocationStrategy::for_size(DEDICATED_THRESHOLD - 1),
            AllocationStrategy::Shared
        );
        assert_eq!(
            AllocationStrategy::for_size(DEDICATED_THRESHOLD),
            AllocationStrategy::Dedicated
        );
    }

    #[test]
    fn empty_buffers_are_refused() {
        assert!(matches!(
            check_buffer_size(0),
            Err(BackendError::Allocation {
                what: "zero-sized buffer",
                ..
            })
        ));
        assert!(check_buffer_size(1).is_ok());
    }
}
