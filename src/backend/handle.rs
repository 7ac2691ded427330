// Owned device handles
//
// Raw objects created from the logical device. Each one is destroyed when
// its owner drops, so a step that fails part way through initialization
// releases everything created before it.

use ash::vk;
use std::ops::Deref;
use std::sync::Arc;
use super::VulkanDevice;

/// Something that can destroy handles of type `T`
pub trait Destroy<T> {
    fn destroy(&self, handle: T);
}

macro_rules! device_children {
    ($($handle:ty => $destroy:ident),* $(,)?) => {
        $(
            impl Destroy<$handle> for VulkanDevice {
                fn destroy(&self, handle: $handle) {
                    unsafe { self.device.$destroy(handle, None) }
                }
            }
        )*
    };
}

device_children! {
    vk::Semaphore => destroy_semaphore,
    vk::Fence => destroy_fence,
    vk::CommandPool => destroy_command_pool,
    vk::DescriptorSetLayout => destroy_descriptor_set_layout,
    vk::DescriptorPool => destroy_descriptor_pool,
    vk::PipelineLayout => destroy_pipeline_layout,
    vk::Pipeline => destroy_pipeline,
    vk::Sampler => destroy_sampler,
    vk::ImageView => destroy_image_view,
    vk::ShaderModule => destroy_shader_module,
}

/// A handle destroyed through its device on drop.
///
/// Holds the device alive, so the device is always destroyed after it.
pub struct Owned<T: Copy, D: Destroy<T> = VulkanDevice> {
    handle: T,
    device: Arc<D>,
}

impl<T: Copy, D: Destroy<T>> Owned<T, D> {
    pub fn new(device: &Arc<D>, handle: T) -> Self {
        Self {
            handle,
            device: device.clone(),
        }
    }
}

impl<T: Copy, D: Destroy<T>> Deref for Owned<T, D> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.handle
    }
}

impl<T: Copy, D: Destroy<T>> Drop for Owned<T, D> {
    fn drop(&mut self) {
        self.device.destroy(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use parking_lot::Mutex;

    /// Records destroyed handles in order
    #[derive(Default)]
    struct Recorder {
        destroyed: Mutex<Vec<u32>>,
    }

    impl Destroy<u32> for Recorder {
        fn destroy(&self, handle: u32) {
            self.destroyed.lock().push(handle);
        }
    }

    /// Creates three handles, failing before the third when asked
    fn build(device: &Arc<Recorder>, fail: bool) -> Result<Vec<Owned<u32, Recorder>>> {
        let first = Owned::new(device, 1);
        let second = Owned::new(device, 2);
        if fail {
            bail!("texture load failed");
        }
        let third = Owned::new(device, 3);
        Ok(vec![first, second, third])
    }

    #[test]
    fn failed_step_destroys_earlier_handles_in_reverse() {
        let device = Arc::new(Recorder::default());
        assert!(build(&device, true).is_err());
        assert_eq!(*device.destroyed.lock(), vec![2, 1]);
    }

    #[test]
    fn handles_live_until_their_owner_drops() {
        let device = Arc::new(Recorder::default());
        let handles = build(&device, false).unwrap();
        assert!(device.destroyed.lock().is_empty());
        assert_eq!(handles.iter().map(|h| **h).collect::<Vec<_>>(), vec![1, 2, 3]);

        drop(handles);
        assert_eq!(*device.destroyed.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn assigning_destroys_the_replaced_handle() {
        let device = Arc::new(Recorder::default());
        let mut pipeline = Owned::new(&device, 7);
        assert_eq!(*pipeline, 7);
        pipeline = Owned::new(&device, 8);
        assert_eq!(*device.destroyed.lock(), vec![7]);
        assert_eq!(*pipeline, 8);
    }

    #[test]
    fn owner_keeps_the_device_alive() {
        let device = Arc::new(Recorder::default());
        let handle = Owned::new(&device, 4);
        assert_eq!(Arc::strong_count(&device), 2);
        drop(handle);
        assert_eq!(Arc::strong_count(&device), 1);
    }
}
