// Command pool, command buffers, and image barriers
//
// Per-frame command buffers are re-recorded every frame. Uploads go through
// one-shot buffers that are submitted and waited on immediately.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use super::{Owned, VulkanDevice};

/// Create the pool every command buffer is allocated from
pub fn create_command_pool(device: &Arc<VulkanDevice>) -> Result<Owned<vk::CommandPool>> {
    let pool_info = vk::CommandPoolCreateInfo::builder()
        .queue_family_index(device.graphics_queue_family)
        // RESET: Each frame resets its own buffer before recording
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

    let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
        .context("Failed to create command pool")?;
    Ok(Owned::new(device, pool))
}

/// Allocate primary command buffers, one per frame in flight
pub fn allocate_command_buffers(
    device: &VulkanDevice,
    pool: vk::CommandPool,
    count: usize,
) -> Result<Vec<vk::CommandBuffer>> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(count as u32);

    unsafe { device.device.allocate_command_buffers(&alloc_info) }
        .context("Failed to allocate command buffers")
}

/// Record with `record`, submit to the graphics queue and wait for completion
pub fn one_time_submit<F>(device: &VulkanDevice, pool: vk::CommandPool, record: F) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer) -> Result<()>,
{
    let cmd = allocate_command_buffers(device, pool, 1)?[0];

    let result = submit_and_wait(device, cmd, record);

    // Freed on every path, including a failed recording
    unsafe { device.device.free_command_buffers(pool, &[cmd]) };

    result
}

fn submit_and_wait<F>(device: &VulkanDevice, cmd: vk::CommandBuffer, record: F) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer) -> Result<()>,
{
    let begin_info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    unsafe { device.device.begin_command_buffer(cmd, &begin_info) }
        .context("Failed to begin one-time command buffer")?;

    record(cmd)?;

    unsafe { device.device.end_command_buffer(cmd) }
        .context("Failed to end one-time command buffer")?;

    let command_buffers = [cmd];
    let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

    unsafe {
        device
            .device
            .queue_submit(device.graphics_queue, &[submit_info.build()], vk::Fence::null())
            .context("Failed to submit one-time command buffer")?;
        device
            .device
            .queue_wait_idle(device.graphics_queue)
            .context("Failed to wait for one-time command buffer")?;
    }

    Ok(())
}

// =============================================================================
// LAYOUT TRANSITIONS
// =============================================================================

/// Stages and accesses on both sides of a layout change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

/// Barrier scopes for every layout change the renderer performs
pub fn transition(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<Transition> {
    use vk::AccessFlags2 as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags2 as S;

    let fragment_tests = S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS;

    let (src_stage, src_access, dst_stage, dst_access) = match (old, new) {
        // Texture upload
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => {
            (S::NONE, A::NONE, S::TRANSFER, A::TRANSFER_WRITE)
        }
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            (S::TRANSFER, A::TRANSFER_WRITE, S::FRAGMENT_SHADER, A::SHADER_READ)
        }
        // Mip chain generation
        (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => {
            (S::TRANSFER, A::TRANSFER_WRITE, S::TRANSFER, A::TRANSFER_READ)
        }
        (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            (S::TRANSFER, A::TRANSFER_READ, S::FRAGMENT_SHADER, A::SHADER_READ)
        }
        // Attachments, waited on by the acquire semaphore at color output
        (L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL) => (
            S::COLOR_ATTACHMENT_OUTPUT,
            A::NONE,
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_WRITE,
        ),
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
            fragment_tests,
            A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            fragment_tests,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        (L::COLOR_ATTACHMENT_OPTIMAL, L::PRESENT_SRC_KHR) => (
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_WRITE,
            S::BOTTOM_OF_PIPE,
            A::NONE,
        ),
        _ => anyhow::bail!("Unsupported layout transition: {:?} -> {:?}", old, new),
    };

    Ok(Transition {
        src_stage,
        src_access,
        dst_stage,
        dst_access,
    })
}

/// Record a synchronization2 barrier moving `range` of `image` from `old` to `new`
pub fn transition_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    let scopes = transition(old, new)?;

    let barrier = vk::ImageMemoryBarrier2::builder()
        .src_stage_mask(scopes.src_stage)
        .src_access_mask(scopes.src_access)
        .dst_stage_mask(scopes.dst_stage)
        .dst_access_mask(scopes.dst_access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
        .build();

    let barriers = [barrier];
    let dependency_info = vk::DependencyInfo::builder().image_memory_barriers(&barriers);

    unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };

    Ok(())
}

/// Subresource range covering `level_count` mips starting at `base_mip_level`
pub fn subresource_range(
    aspect_mask: vk::ImageAspectFlags,
    base_mip_level: u32,
    level_count: u32,
) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level,
        level_count,
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_upload_transitions() {
        let to_dst = transition(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .unwrap();
        assert_eq!(to_dst.src_access, vk::AccessFlags2::NONE);
        assert_eq!(to_dst.dst_stage, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(to_dst.dst_access, vk::AccessFlags2::TRANSFER_WRITE);

        let to_read = transition(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_read.src_stage, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(to_read.src_access, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(to_read.dst_stage, vk::PipelineStageFlags2::FRAGMENT_SHADER);
        assert_eq!(to_read.dst_access, vk::AccessFlags2::SHADER_READ);
    }

    #[test]
    fn mip_source_waits_for_previous_write() {
        let scopes = transition(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        )
        .unwrap();
        assert_eq!(scopes.src_access, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(scopes.dst_access, vk::AccessFlags2::TRANSFER_READ);
    }

    #[test]
    fn swapchain_image_waits_on_color_output() {
        let scopes = transition(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )
        .unwrap();
        assert_eq!(scopes.src_stage, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(scopes.dst_access, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE);
    }

    #[test]
    fn unsupported_transition_is_an_error() {
        let err = transition(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unsupported layout transition"));

        assert!(transition(vk::ImageLayout::PRESENT_SRC_KHR, vk::ImageLayout::GENERAL).is_err());
    }
}
