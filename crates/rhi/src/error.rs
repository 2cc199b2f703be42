//! RHI-specific error types.

use std::time::Duration;

use ash::vk;
use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] vk::Result),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// A fence did not signal within the requested timeout
    #[error("Fence wait timed out after {0:?}")]
    FenceTimeout(Duration),

    /// Surface or swapchain error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// Invalid handle error
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Pipeline creation error
    #[error("Pipeline error: {0}")]
    PipelineError(String),
}

impl RhiError {
    /// Whether a descriptor allocation failed because its pool ran out of
    /// space, as opposed to a device-level failure.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(
            self,
            RhiError::VulkanError(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL)
        )
    }

    /// Whether the presentation target no longer matches the surface.
    pub fn is_out_of_date(&self) -> bool {
        matches!(self, RhiError::VulkanError(vk::Result::ERROR_OUT_OF_DATE_KHR))
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion_classification() {
        assert!(RhiError::from(vk::Result::ERROR_OUT_OF_POOL_MEMORY).is_pool_exhausted());
        assert!(RhiError::from(vk::Result::ERROR_FRAGMENTED_POOL).is_pool_exhausted());
        assert!(!RhiError::from(vk::Result::ERROR_DEVICE_LOST).is_pool_exhausted());
        assert!(!RhiError::FenceTimeout(Duration::from_secs(1)).is_pool_exhausted());
    }

    #[test]
    fn test_out_of_date_classification() {
        assert!(RhiError::from(vk::Result::ERROR_OUT_OF_DATE_KHR).is_out_of_date());
        assert!(!RhiError::from(vk::Result::SUBOPTIMAL_KHR).is_out_of_date());
    }
}
