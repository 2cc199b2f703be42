//! Renderer error types.

use std::time::Duration;

use inflight_rhi::RhiError;
use thiserror::Error;

/// Errors raised by the frame pipelining core.
#[derive(Error, Debug)]
pub enum RendererError {
    /// Device or presentation failure
    #[error(transparent)]
    Rhi(#[from] RhiError),

    /// Configuration or other core failure
    #[error(transparent)]
    Core(#[from] inflight_core::Error),

    /// A slot's completion fence did not signal in time
    #[error("Device lost: frame slot {slot} did not complete within {timeout:?}")]
    DeviceLost { slot: usize, timeout: Duration },

    /// Descriptor allocation failed even after growing the pool size
    #[error("Descriptor allocation failed after growing pools to {sets_per_pool} sets")]
    DescriptorExhausted { sets_per_pool: u32 },

    /// No pipeline cached under the requested name
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    /// Pipeline compilation failed
    #[error("Failed to build pipeline '{name}': {source}")]
    PipelineBuild {
        name: String,
        #[source]
        source: RhiError,
    },

    /// An operation was called out of order
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias for renderer operations.
pub type RendererResult<T> = std::result::Result<T, RendererError>;
