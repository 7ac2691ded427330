// Images: render targets and the sampled texture
//
// Every image owns its memory and a single view covering all mip levels.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use std::path::Path;
use std::sync::Arc;
use super::buffer::Buffer;
use super::commands::{self, subresource_range};
use super::device::has_stencil_component;
use super::{Owned, VulkanDevice};

/// Color format of decoded textures
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Image, its memory and view, released on drop
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl GpuImage {
    /// Create a 2D image with optimal tiling in device-local memory
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &Arc<VulkanDevice>,
        name: &str,
        width: u32,
        height: u32,
        mip_levels: u32,
        samples: vk::SampleCountFlags,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self> {
        log::debug!("Creating image {} ({}x{}, {} mips)", name, width, height, mip_levels);

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(samples)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create image {}", name))?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = match device.allocate(name, requirements, MemoryLocation::GpuOnly, false)
        {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        // From here on Drop cleans up whatever was created
        let mut gpu_image = Self {
            image,
            view: vk::ImageView::null(),
            format,
            allocation: None,
            device: device.clone(),
        };

        let bound = unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }
        .with_context(|| format!("Failed to bind memory for {}", name));
        gpu_image.allocation = Some(allocation);
        bound?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(subresource_range(aspect, 0, mip_levels));

        gpu_image.view = unsafe { device.device.create_image_view(&view_info, None) }
            .with_context(|| format!("Failed to create view for {}", name))?;

        Ok(gpu_image)
    }

    /// Multisampled color target resolved into the swapchain image
    pub fn color_target(
        device: &Arc<VulkanDevice>,
        format: vk::Format,
        extent: vk::Extent2D,
        samples: vk::SampleCountFlags,
    ) -> Result<Self> {
        Self::new(
            device,
            "color target",
            extent.width,
            extent.height,
            1,
            samples,
            format,
            vk::ImageUsageFlags::TRANSIENT_ATTACHMENT | vk::ImageUsageFlags::COLOR_ATTACHMENT,
            vk::ImageAspectFlags::COLOR,
        )
    }

    pub fn depth_target(
        device: &Arc<VulkanDevice>,
        format: vk::Format,
        extent: vk::Extent2D,
        samples: vk::SampleCountFlags,
    ) -> Result<Self> {
        Self::new(
            device,
            "depth target",
            extent.width,
            extent.height,
            1,
            samples,
            format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        )
    }

    /// Decode an image file and upload it as a mipmapped texture
    pub fn texture_from_file(
        device: &Arc<VulkanDevice>,
        command_pool: vk::CommandPool,
        path: &Path,
    ) -> Result<Self> {
        let decoded = ::image::open(path)
            .with_context(|| format!("Failed to load texture {:?}", path))?
            .to_rgba8();
        let (width, height) = decoded.dimensions();

        log::info!("Loaded texture {:?} ({}x{})", path, width, height);

        Self::texture_from_rgba(device, command_pool, width, height, decoded.as_raw())
            .with_context(|| format!("Failed to upload texture {:?}", path))
    }

    /// Upload tightly packed RGBA8 pixels and generate the full mip chain
    pub fn texture_from_rgba(
        device: &Arc<VulkanDevice>,
        command_pool: vk::CommandPool,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<Self> {
        // Mips are produced by linear blits
        let properties = device.format_properties(TEXTURE_FORMAT);
        if !properties
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
        {
            anyhow::bail!("Texture format {:?} does not support linear blitting", TEXTURE_FORMAT);
        }

        let staging = Buffer::host_with_data(
            device,
            "texture staging",
            vk::BufferUsageFlags::TRANSFER_SRC,
            pixels,
        )?;

        let mip_levels = mip_level_count(width, height);
        let texture = Self::new(
            device,
            "texture",
            width,
            height,
            mip_levels,
            vk::SampleCountFlags::TYPE_1,
            TEXTURE_FORMAT,
            vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
        )?;

        commands::one_time_submit(device, command_pool, |cmd| {
            commands::transition_image(
                &device.device,
                cmd,
                texture.image,
                subresource_range(vk::ImageAspectFlags::COLOR, 0, mip_levels),
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )?;

            let region = vk::BufferImageCopy::builder()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_offset(vk::Offset3D::default())
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                })
                .build();

            unsafe {
                device.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    texture.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }

            record_mipmaps(&device.device, cmd, texture.image, width, height, mip_levels)
        })?;

        Ok(texture)
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.device.destroy_image_view(self.view, None);
            }
        }
        if let Some(allocation) = self.allocation.take() {
            self.device.free(allocation);
        }
        unsafe { self.device.device.destroy_image(self.image, None) };
    }
}

/// Blit each level from the one above it, leaving every level shader-readable.
///
/// Expects all levels in TRANSFER_DST_OPTIMAL with level 0 filled.
fn record_mipmaps(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    width: u32,
    height: u32,
    mip_levels: u32,
) -> Result<()> {
    let color = vk::ImageAspectFlags::COLOR;
    let mut mip_width = width as i32;
    let mut mip_height = height as i32;

    for level in 1..mip_levels {
        let source = subresource_range(color, level - 1, 1);

        commands::transition_image(
            device,
            cmd,
            image,
            source,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        )?;

        let next_width = (mip_width / 2).max(1);
        let next_height = (mip_height / 2).max(1);

        let blit = vk::ImageBlit::builder()
            .src_offsets([
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: mip_width,
                    y: mip_height,
                    z: 1,
                },
            ])
            .src_subresource(vk::ImageSubresourceLayers {
                aspect_mask: color,
                mip_level: level - 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .dst_offsets([
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: next_width,
                    y: next_height,
                    z: 1,
                },
            ])
            .dst_subresource(vk::ImageSubresourceLayers {
                aspect_mask: color,
                mip_level: level,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();

        unsafe {
            device.cmd_blit_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );
        }

        commands::transition_image(
            device,
            cmd,
            image,
            source,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        mip_width = next_width;
        mip_height = next_height;
    }

    // The last level was only ever written to
    commands::transition_image(
        device,
        cmd,
        image,
        subresource_range(color, mip_levels - 1, 1),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    )
}

/// Number of levels in a full mip chain: floor(log2(max(w, h))) + 1
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Aspects a barrier on a depth image must cover
pub fn depth_barrier_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    if has_stencil_component(format) {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::DEPTH
    }
}

/// Trilinear, repeating, anisotropic sampler over every mip level
pub fn create_texture_sampler(device: &Arc<VulkanDevice>) -> Result<Owned<vk::Sampler>> {
    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(true)
        .max_anisotropy(device.properties.limits.max_sampler_anisotropy)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .mip_lod_bias(0.0)
        .min_lod(0.0)
        .max_lod(vk::LOD_CLAMP_NONE);

    let sampler = unsafe { device.device.create_sampler(&sampler_info, None) }
        .context("Failed to create texture sampler")?;
    Ok(Owned::new(device, sampler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_levels_follow_largest_side() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(2, 1), 2);
        assert_eq!(mip_level_count(1024, 1024), 11);
        assert_eq!(mip_level_count(1024, 512), 11);
        assert_eq!(mip_level_count(1000, 3), 10);
        assert_eq!(mip_level_count(3, 4096), 13);
    }

    #[test]
    fn degenerate_size_has_one_level() {
        assert_eq!(mip_level_count(0, 0), 1);
    }

    #[test]
    fn depth_aspect_includes_stencil_when_present() {
        assert_eq!(
            depth_barrier_aspect(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            depth_barrier_aspect(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
