//! Draw recording for render objects.

use ash::vk;
use glam::Mat4;

use inflight_rhi::pipeline::GpuDrawPushConstants;

use crate::error::RendererResult;
use crate::frame_loop::FrameContext;

/// One indexed draw with everything needed to record it.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderObject {
    pub index_count: u32,
    pub first_index: u32,
    pub index_buffer: vk::Buffer,
    /// Name of the cached pipeline to draw with.
    pub pipeline: String,
    /// Bound at set 1.
    pub material_set: vk::DescriptorSet,
    pub transform: Mat4,
    /// Device address of the vertex buffer read by the vertex shader.
    pub vertex_buffer_address: vk::DeviceAddress,
}

/// Objects to draw this frame, split by blending.
#[derive(Debug, Default, Clone)]
pub struct DrawContext {
    pub opaque: Vec<RenderObject>,
    pub transparent: Vec<RenderObject>,
}

impl DrawContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.opaque.clear();
        self.transparent.clear();
    }

    pub fn len(&self) -> usize {
        self.opaque.len() + self.transparent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.opaque.is_empty() && self.transparent.is_empty()
    }
}

/// Records every object in `draws`, opaque first, and returns the number of
/// draws issued.
///
/// `scene_set` is bound at set 0 whenever the pipeline changes; each object's
/// material set is bound at set 1.
///
/// # Errors
///
/// Returns [`crate::RendererError::PipelineNotFound`] if an object names a
/// pipeline that is not cached. Objects before it have already been recorded.
pub fn record_draws(
    ctx: &FrameContext<'_>,
    draws: &DrawContext,
    scene_set: vk::DescriptorSet,
) -> RendererResult<usize> {
    let recorder = ctx.recorder();
    let mut bound: Option<vk::Pipeline> = None;
    let mut count = 0;

    for object in draws.opaque.iter().chain(&draws.transparent) {
        let pipeline = ctx.pipelines().require(&object.pipeline)?;
        let layout = pipeline.layout();

        if bound != Some(pipeline.handle()) {
            recorder.bind_pipeline(pipeline.handle());
            recorder.bind_descriptor_sets(layout, 0, &[scene_set]);
            bound = Some(pipeline.handle());
        }
        recorder.bind_descriptor_sets(layout, 1, &[object.material_set]);

        let push_constants =
            GpuDrawPushConstants::new(object.transform, object.vertex_buffer_address);
        recorder.push_constants(layout, pipeline.state().push_constant_stages, 0, &push_constants);

        recorder.bind_index_buffer(object.index_buffer, 0);
        recorder.draw_indexed(object.index_count, 1, object.first_index, 0, 0);
        count += 1;
    }

    Ok(count)
}
