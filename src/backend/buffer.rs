// Buffer utilities for vertex, index, and uniform buffers
//
// Memory comes from the device's gpu-allocator. Host-visible buffers stay
// mapped for their whole life; device-local buffers are filled through a
// staging copy.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;
use super::commands;
use super::VulkanDevice;

/// GPU buffer with its memory, released on drop
pub struct Buffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl Buffer {
    /// Create a buffer and bind fresh memory from `location`
    pub fn new(
        device: &Arc<VulkanDevice>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer {}", name))?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = match device.allocate(name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            device.free(allocation);
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e).with_context(|| format!("Failed to bind memory for {}", name));
        }

        Ok(Self {
            buffer,
            size,
            allocation: Some(allocation),
            device: device.clone(),
        })
    }

    /// Host-visible buffer filled with `data`
    pub fn host_with_data<T: Pod>(
        device: &Arc<VulkanDevice>,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut buffer = Self::new(
            device,
            name,
            bytes.len() as vk::DeviceSize,
            usage,
            MemoryLocation::CpuToGpu,
        )?;
        buffer.write_bytes(bytes)?;
        Ok(buffer)
    }

    /// Device-local buffer filled through a temporary staging buffer
    pub fn device_local_with_data<T: Pod>(
        device: &Arc<VulkanDevice>,
        command_pool: vk::CommandPool,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let staging = Self::host_with_data(
            device,
            &format!("{} staging", name),
            vk::BufferUsageFlags::TRANSFER_SRC,
            data,
        )?;

        let buffer = Self::new(
            device,
            name,
            staging.size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )?;

        commands::one_time_submit(device, command_pool, |cmd| {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: staging.size,
            };
            unsafe {
                device
                    .device
                    .cmd_copy_buffer(cmd, staging.buffer, buffer.buffer, &[region]);
            }
            Ok(())
        })
        .with_context(|| format!("Failed to upload {}", name))?;

        Ok(buffer)
    }

    /// Copy raw bytes to the start of a mapped buffer
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .context("Buffer memory is not host visible")?;

        if bytes.len() > mapped.len() {
            anyhow::bail!(
                "Write of {} bytes exceeds buffer of {} bytes",
                bytes.len(),
                mapped.len()
            );
        }

        mapped[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn write<T: Pod>(&mut self, data: &[T]) -> Result<()> {
        self.write_bytes(bytemuck::cast_slice(data))
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.device.free(allocation);
        }
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
    }
}

/// One persistently mapped uniform buffer per frame in flight
pub fn create_uniform_buffers(
    device: &Arc<VulkanDevice>,
    count: usize,
    size: vk::DeviceSize,
) -> Result<Vec<Buffer>> {
    (0..count)
        .map(|i| {
            Buffer::new(
                device,
                &format!("uniform buffer {}", i),
                size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryLocation::CpuToGpu,
            )
        })
        .collect()
}
