//! Name-keyed cache of compiled graphics pipelines.
//!
//! Pipelines are keyed by [`PipelineConfig::name`], not by the configuration's
//! field values. Building under a name that is already cached replaces the
//! entry (last write wins) and hands the displaced [`PipelineObject`] back to
//! the caller, who decides when it is safe to destroy. Lookups with a
//! configuration that differs from the cached one still return the cached
//! object and log a warning.
//!
//! # Example
//!
//! ```no_run
//! use inflight_renderer::pipeline_cache::PipelineCache;
//! use inflight_rhi::device::DeviceRef;
//! use inflight_rhi::pipeline::PipelineConfig;
//!
//! # fn example(device: DeviceRef, config: PipelineConfig) -> inflight_renderer::RendererResult<()> {
//! let mut cache = PipelineCache::new(device);
//! let previous = cache.build(config.clone())?;
//! assert!(previous.is_none());
//!
//! let pipeline = cache.lookup(&config).expect("just built");
//! println!("{:?}", pipeline.handle());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use ash::vk;
use tracing::{debug, info, warn};

use inflight_rhi::device::DeviceRef;
use inflight_rhi::pipeline::{FixedFunctionState, PipelineConfig};

use crate::error::{RendererError, RendererResult};

/// A compiled pipeline, its layout, and the state that produced it.
///
/// Destroys the pipeline and its layout when dropped.
pub struct PipelineObject {
    device: DeviceRef,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    config: PipelineConfig,
    state: FixedFunctionState,
}

impl PipelineObject {
    /// Compiles `config` into a pipeline.
    ///
    /// The fixed-function state is derived from the config: triangle lists,
    /// dynamic viewport and scissor, back-face culling, single sampling,
    /// reversed-Z depth testing when enabled, and one vertex-stage push
    /// constant range for [`inflight_rhi::pipeline::GpuDrawPushConstants`].
    ///
    /// # Errors
    ///
    /// Returns [`RendererError::PipelineBuild`] if the configuration is
    /// invalid or the device fails to compile it.
    pub fn build(device: DeviceRef, config: PipelineConfig) -> RendererResult<Self> {
        let state = FixedFunctionState::from_config(&config);
        let (pipeline, layout) = device
            .create_graphics_pipeline(&config, &state)
            .map_err(|source| RendererError::PipelineBuild {
                name: config.name.clone(),
                source,
            })?;

        debug!("Built pipeline '{}' ({:?})", config.name, pipeline);

        Ok(Self {
            device,
            pipeline,
            layout,
            config,
            state,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[inline]
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    #[inline]
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// The configuration this pipeline was built from.
    #[inline]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[inline]
    pub fn state(&self) -> &FixedFunctionState {
        &self.state
    }
}

impl std::fmt::Debug for PipelineObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineObject")
            .field("name", &self.config.name)
            .field("pipeline", &self.pipeline)
            .field("layout", &self.layout)
            .finish()
    }
}

impl Drop for PipelineObject {
    fn drop(&mut self) {
        self.device.destroy_pipeline(self.pipeline, self.layout);
        debug!("Destroyed pipeline '{}'", self.config.name);
    }
}

/// Pipelines by name.
///
/// Written during setup and read during the frame loop. Not internally
/// synchronized.
pub struct PipelineCache {
    device: DeviceRef,
    pipelines: HashMap<String, PipelineObject>,
}

impl PipelineCache {
    pub fn new(device: DeviceRef) -> Self {
        Self {
            device,
            pipelines: HashMap::new(),
        }
    }

    /// Builds `config` and caches it under `config.name`.
    ///
    /// If a pipeline was already cached under that name it is replaced and
    /// returned. It may still be referenced by in-flight frames; retire it
    /// through a deletion queue rather than dropping it immediately.
    ///
    /// # Errors
    ///
    /// Returns [`RendererError::PipelineBuild`] on failure. The cache is left
    /// unchanged.
    #[must_use = "a replaced pipeline is destroyed as soon as it is dropped"]
    pub fn build(&mut self, config: PipelineConfig) -> RendererResult<Option<PipelineObject>> {
        let object = PipelineObject::build(self.device.clone(), config)?;
        let name = object.name().to_owned();

        let previous = self.pipelines.insert(name.clone(), object);
        if previous.is_some() {
            warn!("Pipeline '{}' rebuilt; previous pipeline replaced", name);
        } else {
            info!("Pipeline '{}' cached", name);
        }
        Ok(previous)
    }

    /// Returns the pipeline cached under `config.name`.
    ///
    /// The stored configuration is not required to match `config`; a
    /// mismatch is logged and the stored pipeline is returned anyway.
    pub fn lookup(&self, config: &PipelineConfig) -> Option<&PipelineObject> {
        let object = self.pipelines.get(&config.name)?;
        if object.config() != config {
            warn!(
                "Pipeline '{}' requested with a configuration that differs from the cached one",
                config.name
            );
        }
        Some(object)
    }

    /// Returns the pipeline cached under `name`.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&PipelineObject> {
        self.pipelines.get(name)
    }

    /// Like [`PipelineCache::get`], but a missing entry is an error.
    pub fn require(&self, name: &str) -> RendererResult<&PipelineObject> {
        self.get(name)
            .ok_or_else(|| RendererError::PipelineNotFound(name.to_owned()))
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.pipelines.contains_key(name)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Destroys every cached pipeline.
    ///
    /// The caller must ensure no submitted work still uses them.
    pub fn clear(&mut self) {
        let count = self.pipelines.len();
        self.pipelines.clear();
        if count > 0 {
            info!("Pipeline cache cleared ({} pipeline(s) destroyed)", count);
        }
    }
}
