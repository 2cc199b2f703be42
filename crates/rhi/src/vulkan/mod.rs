//! `ash` backend for the device and presentation interfaces.

mod device;
mod swapchain;

pub use device::{DEVICE_EXTENSIONS, DeviceExtensions, VulkanDevice};
pub use swapchain::{SwapchainSupportDetails, VulkanSwapchain};
