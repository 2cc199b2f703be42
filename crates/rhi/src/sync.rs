//! Synchronization primitives.
//!
//! This module provides owning wrappers for the device's synchronization objects:
//! - [`Semaphore`] - GPU-to-GPU synchronization (between queue operations)
//! - [`Fence`] - GPU-to-CPU synchronization (for host waiting)
//!
//! Each wrapper destroys its handle exactly once, on drop.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use inflight_rhi::device::DeviceRef;
//! use inflight_rhi::sync::{Fence, Semaphore};
//!
//! # fn example(device: DeviceRef) -> Result<(), inflight_rhi::RhiError> {
//! let image_available = Semaphore::new(device.clone())?;
//!
//! // Created signaled so the first wait returns immediately
//! let in_flight = Fence::new(device.clone(), true)?;
//!
//! in_flight.wait(Duration::from_secs(5))?;
//! in_flight.reset()?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use ash::vk;
use tracing::debug;

use crate::device::DeviceRef;
use crate::error::RhiResult;

/// Semaphore wrapper.
///
/// Semaphores order work between queue operations without involving the CPU.
/// Common use cases include:
/// - Image available semaphore: signaled when a swapchain image is ready
/// - Render finished semaphore: signaled when rendering is complete
pub struct Semaphore {
    device: DeviceRef,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Creates a new semaphore in the unsignaled state.
    ///
    /// # Errors
    ///
    /// Returns an error if semaphore creation fails.
    pub fn new(device: DeviceRef) -> RhiResult<Self> {
        let semaphore = device.create_semaphore()?;

        debug!("Created semaphore {:?}", semaphore);

        Ok(Self { device, semaphore })
    }

    /// Returns the raw semaphore handle.
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.semaphore);
        debug!("Destroyed semaphore {:?}", self.semaphore);
    }
}

/// Fence wrapper.
///
/// Fences let the host wait for submitted GPU work. The frame ring waits on
/// one before it touches any per-frame resource the GPU might still read.
pub struct Fence {
    device: DeviceRef,
    fence: vk::Fence,
}

impl Fence {
    /// Creates a new fence.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `signaled` - If true, creates the fence in the signaled state.
    ///   This is useful for fences that are waited on before the first
    ///   GPU operation that would signal them.
    ///
    /// # Errors
    ///
    /// Returns an error if fence creation fails.
    pub fn new(device: DeviceRef, signaled: bool) -> RhiResult<Self> {
        let fence = device.create_fence(signaled)?;

        debug!(
            "Created fence {:?} ({})",
            fence,
            if signaled { "signaled" } else { "unsignaled" }
        );

        Ok(Self { device, fence })
    }

    /// Returns the raw fence handle.
    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }

    /// Waits for the fence to become signaled.
    ///
    /// # Errors
    ///
    /// Returns [`crate::RhiError::FenceTimeout`] if `timeout` expires first,
    /// or a Vulkan error if the wait fails for another reason.
    pub fn wait(&self, timeout: Duration) -> RhiResult<()> {
        self.device.wait_for_fence(self.fence, timeout)
    }

    /// Resets the fence to the unsignaled state.
    ///
    /// The fence must not be in use by any queue operation when this is called.
    pub fn reset(&self) -> RhiResult<()> {
        self.device.reset_fence(self.fence)
    }

    /// Checks if the fence is currently signaled without blocking.
    ///
    /// Errors from the status query are reported as "not signaled".
    pub fn is_signaled(&self) -> bool {
        matches!(self.device.fence_signaled(self.fence), Ok(true))
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
        debug!("Destroyed fence {:?}", self.fence);
    }
}
