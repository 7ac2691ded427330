// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync
// Critical for correct and efficient multi-frame rendering

use ash::vk;
use anyhow::{Context, Result};
use std::sync::Arc;
use super::{Owned, VulkanDevice};

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: Owned<vk::Semaphore>,
    pub in_flight_fence: Owned<vk::Fence>,
}

impl FrameSync {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let image_available = create_semaphore(device)?;

        let fence_info = vk::FenceCreateInfo::builder()
            .flags(vk::FenceCreateFlags::SIGNALED); // Start signaled
        let fence = unsafe { device.device.create_fence(&fence_info, None) }
            .context("Failed to create fence")?;

        Ok(Self {
            image_available,
            in_flight_fence: Owned::new(device, fence),
        })
    }

    /// Block until the GPU has finished the last submission using this frame
    pub fn wait(&self, device: &ash::Device) -> Result<()> {
        unsafe { device.wait_for_fences(&[*self.in_flight_fence], true, u64::MAX) }
            .context("Failed to wait for in-flight fence")
    }

    pub fn reset(&self, device: &ash::Device) -> Result<()> {
        unsafe { device.reset_fences(&[*self.in_flight_fence]) }
            .context("Failed to reset in-flight fence")
    }
}

/// One render-finished semaphore per swapchain image.
///
/// Presentation holds the semaphore until the image is reacquired, so these
/// follow the image index rather than the frame index.
pub fn create_render_finished(
    device: &Arc<VulkanDevice>,
    count: usize,
) -> Result<Vec<Owned<vk::Semaphore>>> {
    (0..count)
        .map(|_| create_semaphore(device).context("Failed to create render-finished semaphore"))
        .collect()
}

fn create_semaphore(device: &Arc<VulkanDevice>) -> Result<Owned<vk::Semaphore>> {
    let semaphore_info = vk::SemaphoreCreateInfo::builder();
    let semaphore = unsafe { device.device.create_semaphore(&semaphore_info, None) }
        .context("Failed to create semaphore")?;
    Ok(Owned::new(device, semaphore))
}
