// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with RAII ownership
// Leaves first: device -> allocator/swapchain -> descriptors -> frames

pub mod allocator;
pub mod debug;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod selection;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use allocator::{BufferAllocation, DeviceAllocator, ImageAllocation};
pub use descriptor::{DescriptorSetLayout, DescriptorSetLayoutDesc, LayoutBinding};
pub use device::DeviceContext;
pub use error::{BackendError, BackendResult};
pub use frame::Frame;
pub use swapchain::SwapchainManager;
