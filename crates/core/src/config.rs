//! Renderer configuration loaded from TOML.
//!
//! Every field has a default, so an empty document is a valid configuration:
//!
//! ```
//! use inflight_core::RendererConfig;
//!
//! let config = RendererConfig::from_toml_str(
//!     r#"
//!     frames_in_flight = 3
//!
//!     [descriptors]
//!     sets_per_pool = 256
//!     "#,
//! )?;
//! assert_eq!(config.frames_in_flight, 3);
//! assert_eq!(config.descriptors.max_sets_per_pool, 4096);
//! # Ok::<(), inflight_core::Error>(())
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Number of frame slots used when the configuration does not say otherwise.
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;

/// Upper bound accepted for `frames_in_flight`.
pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

/// Shader resource kinds a descriptor pool can reserve room for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorKind {
    Sampler,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    UniformBuffer,
    StorageBuffer,
}

/// Relative weight of one descriptor kind within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct DescriptorRatio {
    pub kind: DescriptorKind,
    pub ratio: f32,
}

impl DescriptorRatio {
    pub const fn new(kind: DescriptorKind, ratio: f32) -> Self {
        Self { kind, ratio }
    }
}

/// Sizing policy for the per-frame descriptor allocators.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DescriptorConfig {
    /// Sets reserved by each pool created up front.
    pub sets_per_pool: u32,
    /// Pools created when a frame slot is initialized.
    pub initial_pools: usize,
    /// Hard ceiling on sets per pool after growth.
    pub max_sets_per_pool: u32,
    /// Multiplier applied to the pool size on exhaustion.
    pub growth_factor: f32,
    pub ratios: Vec<DescriptorRatio>,
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            sets_per_pool: 1000,
            initial_pools: 1,
            max_sets_per_pool: 4096,
            growth_factor: 1.5,
            ratios: vec![
                DescriptorRatio::new(DescriptorKind::StorageImage, 3.0),
                DescriptorRatio::new(DescriptorKind::StorageBuffer, 3.0),
                DescriptorRatio::new(DescriptorKind::UniformBuffer, 3.0),
                DescriptorRatio::new(DescriptorKind::CombinedImageSampler, 4.0),
            ],
        }
    }
}

/// Top-level renderer configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Number of frame slots in the ring.
    pub frames_in_flight: usize,
    /// How long to wait on a slot's completion fence before declaring the
    /// device lost.
    pub fence_timeout_ms: u64,
    /// Timeout passed to swapchain image acquisition.
    pub acquire_timeout_ms: u64,
    /// RGBA clear value for the color target.
    pub clear_color: [f32; 4],
    pub descriptors: DescriptorConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            fence_timeout_ms: 5_000,
            acquire_timeout_ms: 5_000,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            descriptors: DescriptorConfig::default(),
        }
    }
}

impl RendererConfig {
    /// Parse and validate a configuration from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] for malformed TOML and [`Error::Config`] for
    /// values that fail [`RendererConfig::validate`].
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, otherwise the same
    /// errors as [`RendererConfig::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&source)?;
        debug!("Loaded renderer config from {}", path.display());
        Ok(config)
    }

    /// Check that every value is within the range the renderer supports.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_FRAMES_IN_FLIGHT).contains(&self.frames_in_flight) {
            return Err(Error::Config(format!(
                "frames_in_flight must be between 1 and {MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )));
        }
        if self.fence_timeout_ms == 0 {
            return Err(Error::Config("fence_timeout_ms must be non-zero".into()));
        }

        let descriptors = &self.descriptors;
        if descriptors.sets_per_pool == 0 {
            return Err(Error::Config("descriptors.sets_per_pool must be non-zero".into()));
        }
        if descriptors.sets_per_pool > descriptors.max_sets_per_pool {
            return Err(Error::Config(format!(
                "descriptors.sets_per_pool ({}) exceeds max_sets_per_pool ({})",
                descriptors.sets_per_pool, descriptors.max_sets_per_pool
            )));
        }
        if !(descriptors.growth_factor > 1.0) {
            return Err(Error::Config(format!(
                "descriptors.growth_factor must be greater than 1.0, got {}",
                descriptors.growth_factor
            )));
        }
        if descriptors.ratios.is_empty() {
            return Err(Error::Config("descriptors.ratios must not be empty".into()));
        }
        if let Some(bad) = descriptors.ratios.iter().find(|r| !(r.ratio > 0.0)) {
            return Err(Error::Config(format!(
                "descriptor ratio for {:?} must be positive, got {}",
                bad.kind, bad.ratio
            )));
        }

        Ok(())
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}
