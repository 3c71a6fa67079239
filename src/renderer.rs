// =============================================================================
// VULKAN RENDERER - GPU side of the frame loop
// =============================================================================
//
// Owns every GPU object the demo scene needs and implements `FrameLoop` so
// the scheduler can drive it.
//
// SIZE-DEPENDENT RESOURCES:
// Framebuffers and the depth attachment follow the swapchain extent. On
// recreation they are destroyed first, then the swapchain is rebuilt, then
// they are built again. Everything else lives for the whole run.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;
use winit::window::Window;

use crate::backend::descriptor::BufferBinding;
use crate::backend::error::VkResultExt;
use crate::backend::pipeline::{self, DEPTH_FORMAT};
use crate::backend::swapchain::choose_surface_format;
use crate::backend::{
    shader, BackendError, BackendResult, BufferAllocation, DescriptorSetLayout, DescriptorSetLayoutDesc,
    DeviceAllocator, DeviceContext, Frame, ImageAllocation, LayoutBinding, SwapchainManager,
};
use crate::config::Config;
use crate::scene::{self, MaterialParameters, PushConstants, Vertex};
use crate::scheduler::{AcquiredImage, FrameLoop};

const VERTEX_SHADER: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/mesh.vert.spv");
const FRAGMENT_SHADER: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/mesh.frag.spv");

/// Descriptor sets are looked up under this concurrency index
const MAIN_PASS: u32 = 0;

struct DepthAttachment {
    image: ImageAllocation,
    view: vk::ImageView,
}

struct Mesh {
    vertices: BufferAllocation,
    indices: BufferAllocation,
    index_count: u32,
}

/// IMPORTANT: Field order matters for Drop! Fields declared later are
/// dropped later, and `context` must go last.
pub struct VulkanRenderer {
    frames: Vec<Frame>,
    material_layout: DescriptorSetLayout,
    swapchain: SwapchainManager,
    allocator: DeviceAllocator,
    context: Arc<DeviceContext>,

    window: Arc<Window>,
    clear_color: [f32; 4],

    render_pass: vk::RenderPass,
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    framebuffers: Vec<vk::Framebuffer>,
    depth: Option<DepthAttachment>,

    mesh: Option<Mesh>,
    material: Option<BufferAllocation>,

    // Pre-allocated to avoid per-frame heap allocations
    wait_stages: [vk::PipelineStageFlags; 1],
}

impl VulkanRenderer {
    pub fn new(window: Arc<Window>, config: &Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        // ─────────────────────────────────────────────────────────────────────
        // Device, allocator, swapchain
        // ─────────────────────────────────────────────────────────────────────
        let context = DeviceContext::new(
            &config.window.title,
            config.debug.validation_layers,
            window.raw_display_handle(),
            window.raw_window_handle(),
        )
        .context("Failed to create Vulkan device")?;

        let allocator =
            DeviceAllocator::new(context.clone()).context("Failed to create GPU allocator")?;
        let swapchain = SwapchainManager::new(context.clone(), config.present_mode());

        let material_layout = DescriptorSetLayout::new(
            context.clone(),
            DescriptorSetLayoutDesc::new([LayoutBinding::new(
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::FRAGMENT,
            )]),
        )?;

        // From here on a failed step still runs Drop, which releases
        // whatever has been created so far
        let mut renderer = Self {
            frames: Vec::new(),
            material_layout,
            swapchain,
            allocator,
            context,
            window,
            clear_color: config.graphics.clear_color,
            render_pass: vk::RenderPass::null(),
            pipeline: vk::Pipeline::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            framebuffers: Vec::new(),
            depth: None,
            mesh: None,
            material: None,
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
        };

        // ─────────────────────────────────────────────────────────────────────
        // Pipeline (independent of swapchain size)
        // ─────────────────────────────────────────────────────────────────────
        let device = &renderer.context.device;
        let color_format = choose_surface_format(&renderer.context.surface_support()?.formats)?.format;
        renderer.render_pass = pipeline::create_render_pass(device, color_format)?;

        let (pipeline, pipeline_layout) =
            Self::create_pipeline(device, renderer.render_pass, renderer.material_layout.handle)
                .context("Failed to create graphics pipeline")?;
        renderer.pipeline = pipeline;
        renderer.pipeline_layout = pipeline_layout;

        // ─────────────────────────────────────────────────────────────────────
        // Scene content (blocking uploads, load time only)
        // ─────────────────────────────────────────────────────────────────────
        renderer.upload_scene().context("Failed to upload scene")?;

        // ─────────────────────────────────────────────────────────────────────
        // Frames in flight
        // ─────────────────────────────────────────────────────────────────────
        renderer.frames = (0..config.graphics.concurrent_frames)
            .map(|_| Frame::new(renderer.context.clone()))
            .collect::<BackendResult<Vec<_>>>()
            .context("Failed to create frames")?;

        // Create descriptor pools up front instead of on the first frame
        for frame in &mut renderer.frames {
            frame.get_descriptor_pool(MAIN_PASS, &renderer.material_layout)?;
        }
        log::info!("Created {} frames in flight", renderer.frames.len());

        // A minimized window leaves the swapchain pending until it has area
        renderer.rebuild_swapchain()?;

        log::info!("Vulkan initialized successfully!");
        Ok(renderer)
    }

    fn upload_scene(&mut self) -> BackendResult<()> {
        self.material = Some(self.allocator.allocate_device_local_buffer_and_transfer(
            bytemuck::bytes_of(&MaterialParameters::default()),
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )?);

        let (vertices, indices) = scene::cube();
        let vertex_buffer = self.allocator.allocate_device_local_buffer_and_transfer(
            bytemuck::cast_slice(&vertices),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let index_buffer = match self.allocator.allocate_device_local_buffer_and_transfer(
            bytemuck::cast_slice(&indices),
            vk::BufferUsageFlags::INDEX_BUFFER,
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                self.allocator.free(vertex_buffer)?;
                return Err(err);
            }
        };

        self.mesh = Some(Mesh {
            vertices: vertex_buffer,
            indices: index_buffer,
            index_count: indices.len() as u32,
        });
        log::info!("Uploaded cube: {} vertices, {} indices", vertices.len(), indices.len());
        Ok(())
    }

    fn create_pipeline(
        device: &ash::Device,
        render_pass: vk::RenderPass,
        material_layout: vk::DescriptorSetLayout,
    ) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
        let vert_code = shader::load_spirv(VERTEX_SHADER)?;
        let frag_code = shader::load_spirv(FRAGMENT_SHADER)?;

        let vert_module = shader::create_shader_module(device, &vert_code)?;
        let frag_module = match shader::create_shader_module(device, &frag_code) {
            Ok(module) => module,
            Err(err) => {
                unsafe { device.destroy_shader_module(vert_module, None) };
                return Err(err.into());
            }
        };

        let result = pipeline::create_graphics_pipeline(
            device,
            render_pass,
            vert_module,
            frag_module,
            &Vertex::input(),
            &[material_layout],
            std::mem::size_of::<PushConstants>() as u32,
        );

        // Modules are only needed while the pipeline is compiled
        unsafe {
            device.destroy_shader_module(vert_module, None);
            device.destroy_shader_module(frag_module, None);
        }

        Ok(result?)
    }

    fn destroy_size_dependents(&mut self) -> BackendResult<()> {
        pipeline::destroy_framebuffers(&self.context.device, &mut self.framebuffers);

        if let Some(depth) = self.depth.take() {
            unsafe { self.context.device.destroy_image_view(depth.view, None) };
            self.allocator.free(depth.image)?;
        }
        Ok(())
    }

    fn create_depth_attachment(&self, extent: vk::Extent2D) -> BackendResult<DepthAttachment> {
        let image = self.allocator.allocate_image_attachment(
            extent.width,
            extent.height,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;

        log::debug!(
            "Depth attachment {:?} at {}x{}",
            image.format,
            image.extent.width,
            image.extent.height
        );

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(image.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::DEPTH,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        match unsafe { self.context.device.create_image_view(&view_info, None) } {
            Ok(view) => Ok(DepthAttachment { image, view }),
            Err(code) => {
                self.allocator.free(image)?;
                Err(code).or_init_fail("depth image view")
            }
        }
    }

    /// Dependents out, swapchain rebuilt, dependents back in.
    /// Returns `false` while the window has no area.
    fn rebuild_swapchain(&mut self) -> BackendResult<bool> {
        self.context.wait_idle()?;
        self.destroy_size_dependents()?;

        let size = self.window.inner_size();
        if !self.swapchain.recreate(size.width, size.height)? {
            log::debug!("Swapchain {:?} until the window has area", self.swapchain.status());
            return Ok(false);
        }

        let (image_views, extent) = match self.swapchain.state() {
            Some(state) => (state.image_views.clone(), state.extent),
            None => return Ok(false),
        };

        let depth = self.create_depth_attachment(extent)?;
        let depth_view = depth.view;
        self.depth = Some(depth);

        self.framebuffers = pipeline::create_framebuffers(
            &self.context.device,
            &image_views,
            depth_view,
            self.render_pass,
            extent,
        )?;

        log::debug!("Rebuilt {} framebuffers at {}x{}", self.framebuffers.len(), extent.width, extent.height);
        Ok(true)
    }
}

impl FrameLoop for VulkanRenderer {
    fn wait_for_frame(&mut self, slot: usize) -> BackendResult<()> {
        self.frames[slot].wait()
    }

    fn acquire_image(&mut self, slot: usize) -> BackendResult<AcquiredImage> {
        let semaphore = self.frames[slot].image_available();
        let image_index = self.swapchain.acquire_next_image(semaphore)?;

        Ok(AcquiredImage {
            image_index,
            suboptimal: self.swapchain.needs_recreation(),
        })
    }

    fn recreate_swapchain(&mut self) -> BackendResult<bool> {
        self.rebuild_swapchain()
    }

    fn record_commands(&mut self, slot: usize, image_index: u32, frame_counter: u64) -> BackendResult<()> {
        let extent = match self.swapchain.state() {
            Some(state) => state.extent,
            None => return Err(BackendError::SwapchainStale),
        };
        let (Some(mesh), Some(material)) = (self.mesh.as_ref(), self.material.as_ref()) else {
            return Ok(());
        };
        let framebuffer = self.framebuffers[image_index as usize];

        let frame = &mut self.frames[slot];
        let material_set = frame.get_descriptor_set(
            MAIN_PASS,
            &self.material_layout,
            &[BufferBinding::uniform(0, material.buffer, material.size)],
            &[],
        )?;
        frame.update_descriptor_sets(MAIN_PASS);

        let device = &self.context.device;
        let cmd = frame.begin_commands()?;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);

        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let push_constants = PushConstants::for_frame(frame_counter, aspect);

        unsafe {
            device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);

            device.cmd_set_viewport(
                cmd,
                0,
                &[vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: extent.width as f32,
                    height: extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
            device.cmd_set_scissor(cmd, 0, &[render_area]);

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline_layout,
                0,
                &[material_set],
                &[],
            );
            device.cmd_push_constants(
                cmd,
                self.pipeline_layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(&push_constants),
            );

            device.cmd_bind_vertex_buffers(cmd, 0, &[mesh.vertices.buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, mesh.indices.buffer, 0, vk::IndexType::UINT16);
            device.cmd_draw_indexed(cmd, mesh.index_count, 1, 0, 0, 0);

            device.cmd_end_render_pass(cmd);
        }

        frame.end_commands()
    }

    fn submit(&mut self, slot: usize) -> BackendResult<()> {
        // The fence is reset in here, only once the acquire has succeeded
        self.frames[slot].submit(self.context.graphics_queue, &self.wait_stages)
    }

    fn present(&mut self, slot: usize, image_index: u32) -> BackendResult<bool> {
        let render_finished = self.frames[slot].render_finished();
        self.swapchain
            .present(self.context.present_queue, image_index, &[render_finished])?;
        Ok(self.swapchain.needs_recreation())
    }
}

impl Drop for VulkanRenderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // Wait for GPU to finish before destroying anything
        if let Err(err) = self.context.wait_idle() {
            log::error!("Device did not go idle: {}", err);
        }

        // Frames wait on their own fences before releasing anything
        self.frames.clear();

        if let Err(err) = self.destroy_size_dependents() {
            log::error!("Failed to release depth attachment: {}", err);
        }

        let mut buffers: Vec<BufferAllocation> = Vec::new();
        if let Some(mesh) = self.mesh.take() {
            buffers.push(mesh.indices);
            buffers.push(mesh.vertices);
        }
        buffers.extend(self.material.take());
        for buffer in buffers {
            if let Err(err) = self.allocator.free(buffer) {
                log::error!("Failed to free buffer: {}", err);
            }
        }

        unsafe {
            let device = &self.context.device;
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_render_pass(self.render_pass, None);
        }

        // Remaining fields drop in declaration order: material layout,
        // swapchain, allocator, then the device context
        log::info!("Cleanup complete");
    }
}
