// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Ownership: buffers, images, raw handles and the swapchain free themselves
// on drop and keep the device alive through an Arc

pub mod buffer;
pub mod commands;
pub mod descriptors;
pub mod device;
pub mod handle;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use handle::Owned;
pub use swapchain::Swapchain;
