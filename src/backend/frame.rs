// Frame - one in-flight slot
//
// Each slot owns its command buffer, its sync objects and a descriptor cache.
// Slots are created once at startup and reused every N frames; the fence at
// the start of each use is the only thing stopping the CPU from running ahead.

use ash::vk;
use std::sync::Arc;

use super::descriptor::{
    BufferBinding, DescriptorCache, DescriptorPool, DescriptorSet, DescriptorSetKey,
    DescriptorSetLayout, ImageBinding,
};
use super::error::{BackendResult, VkResultExt};
use super::sync::{fenced_submit, FrameSync};
use super::DeviceContext;

/// Upper bound on the fence wait while a frame is torn down
const TEARDOWN_TIMEOUT_NS: u64 = 1_000_000_000;

pub struct Frame {
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    sync: FrameSync,
    descriptors: DescriptorCache<DescriptorPool, DescriptorSet>,
    context: Arc<DeviceContext>,
}

impl Frame {
    pub fn new(context: Arc<DeviceContext>) -> BackendResult<Self> {
        let device = &context.device;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(context.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .or_init_fail("frame command pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let created = unsafe { device.allocate_command_buffers(&alloc_info) }
            .or_init_fail("frame command buffer")
            .and_then(|buffers| Ok((buffers[0], FrameSync::new(device)?)));

        let (command_buffer, sync) = match created {
            Ok(created) => created,
            Err(err) => {
                unsafe { device.destroy_command_pool(command_pool, None) };
                return Err(err);
            }
        };

        Ok(Self {
            command_pool,
            command_buffer,
            sync,
            descriptors: DescriptorCache::new(),
            context,
        })
    }

    pub fn image_available(&self) -> vk::Semaphore {
        self.sync.image_available
    }

    pub fn render_finished(&self) -> vk::Semaphore {
        self.sync.render_finished
    }

    /// Block until the previous submission from this slot has retired
    pub fn wait(&self) -> BackendResult<()> {
        self.sync.wait(&self.context.device, u64::MAX)
    }

    /// Submit the recorded command buffer, waiting on image acquisition and
    /// signaling render completion and the slot's fence
    pub fn submit(&self, queue: vk::Queue, wait_stages: &[vk::PipelineStageFlags]) -> BackendResult<()> {
        let device = &self.context.device;
        let fence = self.sync.in_flight_fence;

        let wait_semaphores = [self.sync.image_available];
        let signal_semaphores = [self.sync.render_finished];
        let command_buffers = [self.command_buffer];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        fenced_submit(
            || unsafe { device.reset_fences(&[fence]) },
            || unsafe { device.queue_submit(queue, &[submit_info], fence) },
            // An empty batch still signals the fence once the queue drains
            || unsafe { device.queue_submit(queue, &[], fence) },
        )
    }

    /// Reset the command buffer and start recording from scratch
    pub fn begin_commands(&self) -> BackendResult<vk::CommandBuffer> {
        let device = &self.context.device;
        unsafe {
            device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
                .or_fail("reset command buffer")?;

            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(self.command_buffer, &begin_info)
                .or_fail("begin command buffer")?;
        }
        Ok(self.command_buffer)
    }

    pub fn end_commands(&self) -> BackendResult<()> {
        unsafe { self.context.device.end_command_buffer(self.command_buffer) }
            .or_fail("end command buffer")
    }

    /// Pool for `layout` under `concurrency_index`, created on first use
    pub fn get_descriptor_pool(
        &mut self,
        concurrency_index: u32,
        layout: &DescriptorSetLayout,
    ) -> BackendResult<&mut DescriptorPool> {
        let device = &self.context.device;
        self.descriptors
            .pool_or_insert_with(concurrency_index, layout.desc(), || {
                DescriptorPool::new(device, layout.desc())
            })
    }

    /// Set for `layout` with exactly these bindings, allocated on first use.
    /// Its writes are applied by the next `update_descriptor_sets`.
    pub fn get_descriptor_set(
        &mut self,
        concurrency_index: u32,
        layout: &DescriptorSetLayout,
        buffer_bindings: &[BufferBinding],
        image_bindings: &[ImageBinding],
    ) -> BackendResult<vk::DescriptorSet> {
        let device = &self.context.device;
        let key = DescriptorSetKey {
            layout: layout.desc().clone(),
            buffers: buffer_bindings.to_vec(),
            images: image_bindings.to_vec(),
        };

        let set = self.descriptors.set_or_insert_with(
            concurrency_index,
            key.clone(),
            || DescriptorPool::new(device, layout.desc()),
            |pool| {
                let handle = pool.allocate(device, layout.handle)?;
                log::debug!("Allocated descriptor set {:?}", handle);
                Ok(DescriptorSet::new(handle, &key))
            },
        )?;

        Ok(set.handle)
    }

    /// Flush pending writes for every set under `concurrency_index`.
    /// Returns how many sets were written.
    pub fn update_descriptor_sets(&mut self, concurrency_index: u32) -> usize {
        let pending = self.descriptors.take_pending_writes(concurrency_index);
        for writes in &pending {
            log::debug!("Writing {} bindings to {:?}", writes.write_count(), writes.set);
            writes.apply(&self.context.device);
        }
        pending.len()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        // Nothing below may be released while the GPU still uses it
        let device = &self.context.device;
        if let Err(err) = self.sync.wait(device, TEARDOWN_TIMEOUT_NS) {
            log::error!("Frame fence wait failed during teardown: {}", err);
        }

        let (set_count, layout_pools) = (self.descriptors.set_count(), self.descriptors.pool_count());
        let (sets, mut pools) = self.descriptors.drain();
        log::debug!(
            "Releasing {} descriptor sets from {} layout pools ({} native)",
            set_count,
            layout_pools,
            pools.iter().map(DescriptorPool::pool_count).sum::<usize>()
        );
        drop(sets);
        for pool in &mut pools {
            pool.destroy(device);
        }

        self.sync.destroy(device);

        unsafe {
            device.destroy_command_pool(self.command_pool, None);
        }
    }
}
