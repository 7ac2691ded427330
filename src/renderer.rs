// =============================================================================
// RENDERER - Every GPU resource and the per-frame loop
// =============================================================================
//
// INITIALIZATION ORDER (each step depends on the ones before it):
//  1. Device: instance, debug messenger, surface, GPU, logical device
//  2. Swapchain + image views
//  3. Descriptor set layout
//  4. Command pool
//  5. Color (MSAA) and depth targets
//  6. Graphics pipeline
//  7. Texture + sampler
//  8. Model -> vertex and index buffers
//  9. Uniform buffers, descriptor pool and sets
// 10. Command buffers and sync objects
//
// FRAME FLOW:
// wait fence -> acquire -> update uniforms -> reset -> record -> submit
// -> present -> advance frame
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use winit::window::Window;

use crate::backend::buffer::{self, Buffer};
use crate::backend::commands::{self, subresource_range};
use crate::backend::image::{self, GpuImage};
use crate::backend::pipeline::{self, RenderTargets};
use crate::backend::swapchain::AcquireResult;
use crate::backend::sync::{self, FrameSync};
use crate::backend::{descriptors, Owned, Swapchain, VulkanDevice};
use crate::camera::UniformBufferObject;
use crate::config::{CameraConfig, Config};
use crate::mesh::Mesh;

/// All Vulkan state for drawing the model.
///
/// Every resource frees itself as a field once `Drop` has waited for the
/// GPU. Fields drop top to bottom, roughly reverse creation order, and the
/// device goes last.
pub struct Renderer {
    // ─────────────────────────────────────────────────────────────────────────
    // FRAME STATE
    // ─────────────────────────────────────────────────────────────────────────
    frame_index: usize,
    /// Set on window resize, forces a recreate after the next present
    framebuffer_resized: bool,
    window_extent: vk::Extent2D,
    start: Instant,
    index_count: u32,

    // ─────────────────────────────────────────────────────────────────────────
    // SETTINGS
    // ─────────────────────────────────────────────────────────────────────────
    clear_color: [f32; 4],
    camera: CameraConfig,
    present_mode: vk::PresentModeKHR,
    vertex_shader: PathBuf,
    fragment_shader: PathBuf,

    // ─────────────────────────────────────────────────────────────────────────
    // SYNCHRONIZATION & COMMANDS
    // ─────────────────────────────────────────────────────────────────────────
    frame_sync: Vec<FrameSync>,
    /// One per swapchain image
    render_finished: Vec<Owned<vk::Semaphore>>,
    command_buffers: Vec<vk::CommandBuffer>,

    // ─────────────────────────────────────────────────────────────────────────
    // RESOURCES
    // ─────────────────────────────────────────────────────────────────────────
    descriptor_pool: Owned<vk::DescriptorPool>,
    descriptor_sets: Vec<vk::DescriptorSet>,
    uniform_buffers: Vec<Buffer>,
    index_buffer: Buffer,
    vertex_buffer: Buffer,
    texture_sampler: Owned<vk::Sampler>,
    /// Only referenced through the descriptor sets
    _texture: GpuImage,

    // ─────────────────────────────────────────────────────────────────────────
    // PIPELINE & TARGETS
    // ─────────────────────────────────────────────────────────────────────────
    pipeline: Owned<vk::Pipeline>,
    pipeline_layout: Owned<vk::PipelineLayout>,
    depth_format: vk::Format,
    depth_target: GpuImage,
    /// Absent without multisampling, then the swapchain image is drawn directly
    color_target: Option<GpuImage>,
    command_pool: Owned<vk::CommandPool>,
    descriptor_set_layout: Owned<vk::DescriptorSetLayout>,

    // ─────────────────────────────────────────────────────────────────────────
    // VULKAN CORE
    // ─────────────────────────────────────────────────────────────────────────
    swapchain: Swapchain,
    device: Arc<VulkanDevice>,
}

impl Renderer {
    /// Build every resource for `window`, which must have a drawable area.
    ///
    /// On failure everything created so far is released as it goes out of
    /// scope.
    pub fn new(window: &Window, config: &Config) -> Result<Self> {
        let size = window.inner_size();
        if !is_drawable(size.width, size.height) {
            anyhow::bail!("Window has no drawable area ({}x{})", size.width, size.height);
        }

        log::info!("Initializing Vulkan...");

        let window_extent = vk::Extent2D {
            width: size.width,
            height: size.height,
        };

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Device (instance, debug messenger, surface, GPU, queues)
        // ─────────────────────────────────────────────────────────────────────
        let device = VulkanDevice::new(
            &config.window.title,
            config.validation_enabled(),
            window.raw_display_handle(),
            window.raw_window_handle(),
            config.graphics.max_msaa_samples,
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Swapchain
        // ─────────────────────────────────────────────────────────────────────
        let present_mode = config.get_present_mode();
        let swapchain = Swapchain::new(
            device.clone(),
            size.width,
            size.height,
            present_mode,
            None,
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Descriptor set layout + command pool
        // ─────────────────────────────────────────────────────────────────────
        let descriptor_set_layout = descriptors::create_descriptor_set_layout(&device)?;
        let command_pool = commands::create_command_pool(&device)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Render targets
        // ─────────────────────────────────────────────────────────────────────
        let samples = device.msaa_samples;
        let color_target = create_color_target(&device, &swapchain, samples)?;
        let depth_format = device.find_depth_format()?;
        let depth_target =
            GpuImage::depth_target(&device, depth_format, swapchain.extent, samples)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 5: Graphics pipeline
        // ─────────────────────────────────────────────────────────────────────
        let pipeline_layout = pipeline::create_pipeline_layout(&device, *descriptor_set_layout)?;
        let targets = RenderTargets {
            color_format: swapchain.format,
            depth_format,
            samples,
        };
        let pipeline = pipeline::create_graphics_pipeline(
            &device,
            *pipeline_layout,
            &config.assets.vertex_shader,
            &config.assets.fragment_shader,
            &targets,
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 6: Texture
        // ─────────────────────────────────────────────────────────────────────
        let texture = GpuImage::texture_from_file(&device, *command_pool, &config.assets.texture)?;
        let texture_sampler = image::create_texture_sampler(&device)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 7: Model geometry
        // ─────────────────────────────────────────────────────────────────────
        let mesh = Mesh::load_obj(&config.assets.model)?;
        let vertex_buffer = Buffer::device_local_with_data(
            &device,
            *command_pool,
            "vertex buffer",
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &mesh.vertices,
        )?;
        let index_buffer = Buffer::device_local_with_data(
            &device,
            *command_pool,
            "index buffer",
            vk::BufferUsageFlags::INDEX_BUFFER,
            &mesh.indices,
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 8: Uniforms + descriptors (one per frame in flight)
        // ─────────────────────────────────────────────────────────────────────
        let frames_in_flight = config.graphics.max_frames_in_flight;
        let uniform_buffers = buffer::create_uniform_buffers(
            &device,
            frames_in_flight,
            std::mem::size_of::<UniformBufferObject>() as vk::DeviceSize,
        )?;
        let descriptor_pool = descriptors::create_descriptor_pool(&device, frames_in_flight)?;
        let descriptor_sets = descriptors::create_descriptor_sets(
            &device,
            *descriptor_pool,
            *descriptor_set_layout,
            &uniform_buffers,
            texture.view,
            *texture_sampler,
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 9: Command buffers + synchronization
        // ─────────────────────────────────────────────────────────────────────
        let command_buffers =
            commands::allocate_command_buffers(&device, *command_pool, frames_in_flight)?;
        let frame_sync = (0..frames_in_flight)
            .map(|_| FrameSync::new(&device))
            .collect::<Result<Vec<_>>>()?;
        let render_finished = sync::create_render_finished(&device, swapchain.images.len())?;

        log::info!("Vulkan initialized successfully!");

        Ok(Self {
            frame_index: 0,
            framebuffer_resized: false,
            window_extent,
            start: Instant::now(),
            index_count: mesh.indices.len() as u32,
            clear_color: config.graphics.clear_color,
            camera: config.camera.clone(),
            present_mode,
            vertex_shader: config.assets.vertex_shader.clone(),
            fragment_shader: config.assets.fragment_shader.clone(),
            frame_sync,
            render_finished,
            command_buffers,
            descriptor_pool,
            descriptor_sets,
            uniform_buffers,
            index_buffer,
            vertex_buffer,
            texture_sampler,
            _texture: texture,
            pipeline,
            pipeline_layout,
            depth_format,
            depth_target,
            color_target,
            command_pool,
            descriptor_set_layout,
            swapchain,
            device,
        })
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Render a single frame.
    ///
    /// Returns false when nothing was presented (minimized or swapchain
    /// recreated instead).
    pub fn draw_frame(&mut self) -> Result<bool> {
        // Skip rendering if minimized
        if self.is_minimized() {
            return Ok(false);
        }

        let frame = self.frame_index;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Wait until the GPU is done with this frame's resources
        // ─────────────────────────────────────────────────────────────────────
        self.frame_sync[frame].wait(&self.device.device)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Acquire next swapchain image
        // ─────────────────────────────────────────────────────────────────────
        let image_available = *self.frame_sync[frame].image_available;
        let image_index = match self.swapchain.acquire_next_image(image_available)? {
            // Suboptimal still presents; present reports it again
            AcquireResult::Acquired { image_index, .. } => image_index,
            AcquireResult::OutOfDate => {
                // Fence is still signaled, so the next wait returns at once
                self.recreate_swapchain()?;
                return Ok(false);
            }
        };

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Update uniforms and record
        // ─────────────────────────────────────────────────────────────────────
        self.update_uniform_buffer(frame)?;

        // Only reset once work is certain to be submitted
        self.frame_sync[frame].reset(&self.device.device)?;

        let cmd = self.command_buffers[frame];
        self.record_command_buffer(cmd, image_index as usize)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Submit
        // ─────────────────────────────────────────────────────────────────────
        let render_finished = *self.render_finished[image_index as usize];
        let wait_semaphores = [image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [cmd];
        let signal_semaphores = [render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores) // Wait for image to be available
            .wait_dst_stage_mask(&wait_stages) // Which stage waits
            .command_buffers(&command_buffers) // Commands to execute
            .signal_semaphores(&signal_semaphores); // Signal when done

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                *self.frame_sync[frame].in_flight_fence, // Signal this fence when GPU is done
            )
        }
        .context("Failed to submit draw command buffer")?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 5: Present
        // ─────────────────────────────────────────────────────────────────────
        let out_of_date =
            self.swapchain
                .present(self.device.present_queue, image_index, &signal_semaphores)?;

        if out_of_date || self.framebuffer_resized {
            self.framebuffer_resized = false;
            self.recreate_swapchain()?;
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 6: Advance to next frame
        // ─────────────────────────────────────────────────────────────────────
        self.frame_index = (frame + 1) % self.frame_sync.len();

        Ok(true)
    }

    fn update_uniform_buffer(&mut self, frame: usize) -> Result<()> {
        let elapsed = self.start.elapsed().as_secs_f32();
        let ubo = UniformBufferObject::new(elapsed, self.swapchain.aspect_ratio(), &self.camera);
        self.uniform_buffers[frame].write(&[ubo])
    }

    // =========================================================================
    // COMMAND RECORDING
    // =========================================================================

    fn record_command_buffer(&self, cmd: vk::CommandBuffer, image_index: usize) -> Result<()> {
        let device = &self.device.device;
        let extent = self.swapchain.extent;
        let swapchain_image = self.swapchain.images[image_index];
        let swapchain_view = *self.swapchain.image_views[image_index];
        let color_range = subresource_range(vk::ImageAspectFlags::COLOR, 0, 1);

        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;
            let begin_info = vk::CommandBufferBeginInfo::builder();
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin command buffer")?;
        }

        // ─────────────────────────────────────────────────────────────────────
        // Attachments into rendering layouts (old contents discarded)
        // ─────────────────────────────────────────────────────────────────────
        commands::transition_image(
            device,
            cmd,
            swapchain_image,
            color_range,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )?;
        if let Some(target) = &self.color_target {
            commands::transition_image(
                device,
                cmd,
                target.image,
                color_range,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            )?;
        }
        commands::transition_image(
            device,
            cmd,
            self.depth_target.image,
            subresource_range(image::depth_barrier_aspect(self.depth_target.format), 0, 1),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // Begin rendering: clear, then resolve MSAA into the swapchain image
        // ─────────────────────────────────────────────────────────────────────
        let clear_color = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        };
        let color_attachment = match &self.color_target {
            Some(target) => vk::RenderingAttachmentInfo::builder()
                .image_view(target.view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .resolve_mode(vk::ResolveModeFlags::AVERAGE)
                .resolve_image_view(swapchain_view)
                .resolve_image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .clear_value(clear_color)
                .build(),
            None => vk::RenderingAttachmentInfo::builder()
                .image_view(swapchain_view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(clear_color)
                .build(),
        };

        let depth_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(self.depth_target.view)
            .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE) // Don't need to store depth
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            })
            .build();

        let color_attachments = [color_attachment];
        let rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments)
            .depth_attachment(&depth_attachment);

        unsafe {
            device.cmd_begin_rendering(cmd, &rendering_info);

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, *self.pipeline);
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, self.index_buffer.buffer, 0, vk::IndexType::UINT32);

            // Viewport and scissor cover the whole swapchain image
            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);

            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            };
            device.cmd_set_scissor(cmd, 0, &[scissor]);

            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                *self.pipeline_layout,
                0,
                &[self.descriptor_sets[self.frame_index]],
                &[],
            );

            device.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);

            device.cmd_end_rendering(cmd);
        }

        // ─────────────────────────────────────────────────────────────────────
        // Swapchain image ready for presentation
        // ─────────────────────────────────────────────────────────────────────
        commands::transition_image(
            device,
            cmd,
            swapchain_image,
            color_range,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )?;

        unsafe { device.end_command_buffer(cmd) }.context("Failed to end command buffer")?;

        Ok(())
    }

    // =========================================================================
    // SWAPCHAIN RECREATION
    // =========================================================================

    /// Record the new window size; the swapchain follows on the next frame
    pub fn resize(&mut self, width: u32, height: u32) {
        self.window_extent = vk::Extent2D { width, height };
        self.framebuffer_resized = true;
    }

    pub fn is_minimized(&self) -> bool {
        !is_drawable(self.window_extent.width, self.window_extent.height)
    }

    /// Rebuild everything that depends on the swapchain images.
    fn recreate_swapchain(&mut self) -> Result<()> {
        if self.is_minimized() {
            return Ok(());
        }

        // Wait for GPU to finish all work before destroying resources
        self.device.wait_idle()?;

        let swapchain = Swapchain::new(
            self.device.clone(),
            self.window_extent.width,
            self.window_extent.height,
            self.present_mode,
            Some(&self.swapchain),
        )?;
        let format_changed = swapchain.format != self.swapchain.format;
        // Old swapchain is retired now that the new one exists
        self.swapchain = swapchain;

        // Image count may have changed
        self.render_finished.clear();
        self.render_finished =
            sync::create_render_finished(&self.device, self.swapchain.images.len())?;

        // Release the old targets before allocating new ones
        self.color_target = None;
        self.color_target =
            create_color_target(&self.device, &self.swapchain, self.device.msaa_samples)?;
        self.depth_target = GpuImage::depth_target(
            &self.device,
            self.depth_format,
            self.swapchain.extent,
            self.device.msaa_samples,
        )?;

        if format_changed {
            log::info!("Swapchain format changed, rebuilding pipeline");
            self.pipeline = self.create_pipeline()?;
        }

        Ok(())
    }

    // =========================================================================
    // SHADER HOT RELOAD
    // =========================================================================

    /// Rebuild the pipeline from the shader files, keeping the old one on failure
    pub fn reload_shaders(&mut self) {
        log::info!("Reloading shaders...");

        if let Err(e) = self.device.wait_idle() {
            log::error!("Shader reload skipped: {:#}", e);
            return;
        }

        match self.create_pipeline() {
            Ok(pipeline) => {
                // The device is idle, so the old pipeline can go
                self.pipeline = pipeline;
                log::info!("Shaders reloaded");
            }
            Err(e) => log::error!("Shader reload failed, keeping previous pipeline: {:#}", e),
        }
    }

    fn create_pipeline(&self) -> Result<Owned<vk::Pipeline>> {
        let targets = RenderTargets {
            color_format: self.swapchain.format,
            depth_format: self.depth_format,
            samples: self.device.msaa_samples,
        };
        pipeline::create_graphics_pipeline(
            &self.device,
            *self.pipeline_layout,
            &self.vertex_shader,
            &self.fragment_shader,
            &targets,
        )
    }

    /// Wait for device to be idle (e.g., before teardown)
    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

/// A zero-sized window (minimized) has nothing to present to
pub fn is_drawable(width: u32, height: u32) -> bool {
    width > 0 && height > 0
}

/// Multisampled color target, or none when rendering single-sampled
fn create_color_target(
    device: &Arc<VulkanDevice>,
    swapchain: &Swapchain,
    samples: vk::SampleCountFlags,
) -> Result<Option<GpuImage>> {
    if samples == vk::SampleCountFlags::TYPE_1 {
        return Ok(None);
    }
    GpuImage::color_target(device, swapchain.format, swapchain.extent, samples).map(Some)
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // Nothing may be destroyed while the GPU still uses it
        if let Err(e) = self.device.wait_idle() {
            log::warn!("{:#}", e);
        }

        // Fields drop next, the device last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_window_is_not_drawable() {
        assert!(is_drawable(800, 600));
        assert!(is_drawable(1, 1));
        assert!(!is_drawable(0, 600));
        assert!(!is_drawable(800, 0));
        assert!(!is_drawable(0, 0));
    }
}
