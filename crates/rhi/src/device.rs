//! Device and presentation interfaces.
//!
//! The renderer core never talks to Vulkan directly. Everything it needs from
//! the logical device is collected in the [`GraphicsDevice`] trait, and
//! everything it needs from the swapchain in [`PresentationSurface`]. The
//! trait object is resolved once when the device is created and handed to
//! every component explicitly as a [`DeviceRef`].
//!
//! Two implementations ship with this crate:
//! - [`crate::vulkan::VulkanDevice`] / [`crate::vulkan::VulkanSwapchain`] on top of `ash`
//! - `DummyDevice` / `DummySurface` (feature `dummy`) for tests without a GPU
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use inflight_rhi::device::DeviceRef;
//!
//! # fn example(device: DeviceRef) -> Result<(), inflight_rhi::RhiError> {
//! let fence = device.create_fence(true)?;
//! device.wait_for_fence(fence, Duration::from_secs(1))?;
//! device.reset_fence(fence)?;
//! device.destroy_fence(fence);
//! # Ok(())
//! # }
//! ```

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;

use crate::command::GpuCommand;
use crate::descriptor::{DescriptorWrite, PoolSizeRatio};
use crate::error::{RhiError, RhiResult};
use crate::pipeline::{FixedFunctionState, PipelineConfig};

/// Shared handle to the device implementation.
pub type DeviceRef = Arc<dyn GraphicsDevice>;

/// One batch of recorded commands handed to the graphics queue.
#[derive(Debug, Clone, Copy)]
pub struct Submission {
    /// Recorded, ended command buffer.
    pub command_buffer: vk::CommandBuffer,
    /// Semaphore the queue waits on before executing `wait_stage`.
    pub wait_semaphore: vk::Semaphore,
    /// Pipeline stage gated by `wait_semaphore`.
    pub wait_stage: vk::PipelineStageFlags,
    /// Semaphore signaled when the batch finishes.
    pub signal_semaphore: vk::Semaphore,
    /// Fence signaled when the batch finishes.
    pub fence: vk::Fence,
}

/// Logical device operations consumed by the frame pipelining core.
///
/// All handles are plain Vulkan handles. Ownership of each handle lies with
/// whichever wrapper created it (see [`crate::sync`], [`crate::command`]);
/// implementations never destroy a handle on their own.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`, but the renderer drives them from
/// a single thread. Handles passed to one call must not be used concurrently
/// from another thread.
pub trait GraphicsDevice: Send + Sync {
    // =========================================================================
    // Device
    // =========================================================================

    /// Queue family index of the graphics queue used by [`GraphicsDevice::submit`].
    fn graphics_queue_family(&self) -> u32;

    /// Blocks until all outstanding work on every queue has completed.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is lost.
    fn wait_idle(&self) -> RhiResult<()>;

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Creates a fence, optionally already signaled.
    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence>;

    /// Blocks the calling thread until `fence` signals or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`crate::RhiError::FenceTimeout`] when the timeout expires, or
    /// a Vulkan error if the device is lost.
    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> RhiResult<()>;

    /// Returns `fence` to the unsignaled state.
    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()>;

    /// Non-blocking query of the fence state.
    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool>;

    fn destroy_fence(&self, fence: vk::Fence);

    /// Creates a binary semaphore in the unsignaled state.
    fn create_semaphore(&self) -> RhiResult<vk::Semaphore>;

    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // =========================================================================
    // Command Recording
    // =========================================================================

    /// Creates a command pool whose buffers are submitted to `queue_family`.
    fn create_command_pool(&self, queue_family: u32) -> RhiResult<vk::CommandPool>;

    /// Allocates one primary command buffer from `pool`.
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> RhiResult<vk::CommandBuffer>;

    /// Rewinds every command buffer allocated from `pool` to the initial state.
    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()>;

    fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// Starts one-time-submit recording.
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()>;

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()>;

    /// Records a single command into a buffer in the recording state.
    fn record(&self, command_buffer: vk::CommandBuffer, command: &GpuCommand<'_>);

    /// Submits a batch to the graphics queue.
    ///
    /// # Errors
    ///
    /// Any error is a device-level failure and is fatal to the frame loop.
    fn submit(&self, submission: &Submission) -> RhiResult<()>;

    // =========================================================================
    // Descriptors
    // =========================================================================

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> RhiResult<vk::DescriptorSetLayout>;

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    /// Creates a pool able to hold `max_sets` sets, with per-type descriptor
    /// counts of `ratio * max_sets` for each entry of `ratios`.
    fn create_descriptor_pool(
        &self,
        ratios: &[PoolSizeRatio],
        max_sets: u32,
    ) -> RhiResult<vk::DescriptorPool>;

    /// Allocates one set from `pool`.
    ///
    /// # Errors
    ///
    /// Returns `ERROR_OUT_OF_POOL_MEMORY` or `ERROR_FRAGMENTED_POOL` when the
    /// pool cannot satisfy the request (see [`crate::RhiError::is_pool_exhausted`]).
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet>;

    /// Frees every set allocated from `pool` in one operation.
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()>;

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Points the bindings of `set` at the resources described by `writes`.
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    // =========================================================================
    // Pipelines
    // =========================================================================

    /// Compiles a graphics pipeline and its layout.
    ///
    /// # Errors
    ///
    /// Returns [`crate::RhiError::PipelineError`] for invalid configurations
    /// and Vulkan errors for driver failures.
    fn create_graphics_pipeline(
        &self,
        config: &PipelineConfig,
        state: &FixedFunctionState,
    ) -> RhiResult<(vk::Pipeline, vk::PipelineLayout)>;

    fn destroy_pipeline(&self, pipeline: vk::Pipeline, layout: vk::PipelineLayout);

    // =========================================================================
    // Buffers
    // =========================================================================

    /// Creates a host-visible buffer of `size` bytes.
    fn create_host_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> RhiResult<vk::Buffer>;

    /// Copies `data` into a host-visible buffer at `offset`.
    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> RhiResult<()>;

    fn destroy_buffer(&self, buffer: vk::Buffer);
}

/// Outcome of a non-fatal acquire or present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStatus {
    /// The target matches the surface.
    Optimal,
    /// Usable, but the surface properties no longer match exactly.
    Suboptimal,
    /// The target must be recreated before it can be used.
    OutOfDate,
}

impl SurfaceStatus {
    /// Whether the swapchain should be recreated.
    #[inline]
    pub fn needs_recreate(self) -> bool {
        !matches!(self, SurfaceStatus::Optimal)
    }
}

/// A presentable color image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// Depth image shared by all frames, owned by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthAttachment {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
}

/// Swapchain operations consumed by the frame loop.
///
/// Any error returned from these methods is fatal. Staleness is reported
/// through [`SurfaceStatus`] instead.
pub trait PresentationSurface {
    /// Acquires the next presentable image, signaling `signal` once it is
    /// ready to be written.
    ///
    /// When the status is [`SurfaceStatus::OutOfDate`] no image was acquired,
    /// `signal` is left untouched and the returned index is meaningless.
    fn acquire_next_image(
        &mut self,
        timeout: Duration,
        signal: vk::Semaphore,
    ) -> RhiResult<(u32, SurfaceStatus)>;

    /// Queues image `image_index` for presentation once `wait` signals.
    fn present(&mut self, wait: vk::Semaphore, image_index: u32) -> RhiResult<SurfaceStatus>;

    /// The render target backing image `image_index`.
    fn target(&self, image_index: u32) -> RenderTarget;

    /// Rebuilds the image set for the current surface properties.
    ///
    /// The caller guarantees that no submitted work references the old images.
    fn recreate(&mut self) -> RhiResult<()>;
}

/// Byte range of a `len`-byte write at `offset` into a buffer of `capacity`
/// bytes.
///
/// # Errors
///
/// Returns [`RhiError::InvalidHandle`] if the write does not fit, including
/// when `offset + len` overflows.
pub(crate) fn write_range(
    buffer: vk::Buffer,
    offset: u64,
    len: usize,
    capacity: usize,
) -> RhiResult<Range<usize>> {
    usize::try_from(offset)
        .ok()
        .and_then(|start| start.checked_add(len).map(|end| start..end))
        .filter(|range| range.end <= capacity)
        .ok_or_else(|| {
            RhiError::InvalidHandle(format!(
                "write of {len} bytes at {offset} overflows buffer {buffer:?} ({capacity} bytes)"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_surface_status_recreate() {
        assert!(!SurfaceStatus::Optimal.needs_recreate());
        assert!(SurfaceStatus::Suboptimal.needs_recreate());
        assert!(SurfaceStatus::OutOfDate.needs_recreate());
    }

    #[test]
    fn test_device_trait_is_object_safe() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn GraphicsDevice>();
    }

    #[rstest]
    #[case::start(0, 16, 64, Some(0..16))]
    #[case::exact_fit(48, 16, 64, Some(48..64))]
    #[case::past_end(56, 16, 64, None)]
    #[case::offset_beyond(128, 0, 64, None)]
    #[case::overflowing_offset(u64::MAX, 1, 64, None)]
    fn test_write_range(
        #[case] offset: u64,
        #[case] len: usize,
        #[case] capacity: usize,
        #[case] expected: Option<Range<usize>>,
    ) {
        let range = write_range(vk::Buffer::null(), offset, len, capacity);
        match expected {
            Some(expected) => assert_eq!(range.unwrap(), expected),
            None => assert!(matches!(range, Err(RhiError::InvalidHandle(_)))),
        }
    }
}
