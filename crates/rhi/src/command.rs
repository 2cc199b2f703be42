//! Command pool and command recording.
//!
//! - [`CommandPool`] owns a device command pool and hands out recorders
//! - [`CommandRecorder`] wraps one primary command buffer with methods for
//!   the commands the frame loop records
//! - [`GpuCommand`] is the device-level description of a single command
//!
//! # Example
//!
//! ```no_run
//! use inflight_rhi::device::DeviceRef;
//! use inflight_rhi::command::CommandPool;
//!
//! # fn example(device: DeviceRef) -> Result<(), inflight_rhi::RhiError> {
//! let pool = CommandPool::new(device.clone(), device.graphics_queue_family())?;
//! let recorder = pool.allocate_recorder()?;
//!
//! recorder.begin()?;
//! // ... record rendering commands ...
//! recorder.end()?;
//!
//! // Next frame: rewind every buffer from the pool at once
//! pool.reset()?;
//! # Ok(())
//! # }
//! ```

use ash::vk;
use bytemuck::Pod;
use tracing::debug;

use crate::device::{DepthAttachment, DeviceRef, RenderTarget};
use crate::error::RhiResult;

/// A single command as seen by the device implementation.
#[derive(Debug, Clone, Copy)]
pub enum GpuCommand<'a> {
    /// Image layout transition with a full pipeline barrier for `image`.
    TransitionImage {
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
    /// Begins dynamic rendering into `color`, clearing it to `clear_color`.
    /// The depth attachment, if any, is cleared to 0.0 (reversed-Z).
    BeginRendering {
        color: &'a RenderTarget,
        depth: Option<&'a DepthAttachment>,
        clear_color: [f32; 4],
    },
    EndRendering,
    /// Full-extent viewport and scissor.
    SetViewportScissor { extent: vk::Extent2D },
    BindPipeline { pipeline: vk::Pipeline },
    BindDescriptorSets {
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &'a [vk::DescriptorSet],
    },
    PushConstants {
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &'a [u8],
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
}

impl GpuCommand<'_> {
    /// Short name used in logs and call traces.
    pub fn name(&self) -> &'static str {
        match self {
            GpuCommand::TransitionImage { .. } => "transition_image",
            GpuCommand::BeginRendering { .. } => "begin_rendering",
            GpuCommand::EndRendering => "end_rendering",
            GpuCommand::SetViewportScissor { .. } => "set_viewport_scissor",
            GpuCommand::BindPipeline { .. } => "bind_pipeline",
            GpuCommand::BindDescriptorSets { .. } => "bind_descriptor_sets",
            GpuCommand::PushConstants { .. } => "push_constants",
            GpuCommand::BindIndexBuffer { .. } => "bind_index_buffer",
            GpuCommand::Draw { .. } => "draw",
            GpuCommand::DrawIndexed { .. } => "draw_indexed",
        }
    }
}

/// Command pool wrapper.
///
/// A command pool is used to allocate command buffers. Each pool is associated
/// with a specific queue family and can only allocate command buffers that
/// will be submitted to queues of that family.
///
/// # Thread Safety
///
/// Command pools are not thread-safe. For multi-threaded command recording,
/// create a separate pool per thread.
pub struct CommandPool {
    device: DeviceRef,
    pool: vk::CommandPool,
    queue_family_index: u32,
}

impl CommandPool {
    /// Creates a new command pool for the specified queue family.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `queue_family_index` - The queue family for command buffer submission
    ///
    /// # Errors
    ///
    /// Returns an error if command pool creation fails.
    pub fn new(device: DeviceRef, queue_family_index: u32) -> RhiResult<Self> {
        let pool = device.create_command_pool(queue_family_index)?;

        debug!(
            "Command pool {:?} created for queue family {}",
            pool, queue_family_index
        );

        Ok(Self {
            device,
            pool,
            queue_family_index,
        })
    }

    /// Returns the raw command pool handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Returns the queue family index this pool belongs to.
    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Allocates a primary command buffer from this pool.
    ///
    /// The buffer lives as long as the pool; the recorder does not free it.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails.
    pub fn allocate_recorder(&self) -> RhiResult<CommandRecorder> {
        let buffer = self.device.allocate_command_buffer(self.pool)?;
        Ok(CommandRecorder {
            device: self.device.clone(),
            buffer,
        })
    }

    /// Resets the entire command pool, returning all allocated command buffers
    /// to their initial state.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset fails.
    pub fn reset(&self) -> RhiResult<()> {
        self.device.reset_command_pool(self.pool)
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.device.destroy_command_pool(self.pool);
        debug!(
            "Command pool {:?} destroyed for queue family {}",
            self.pool, self.queue_family_index
        );
    }
}

/// Records commands into one primary command buffer.
///
/// Commands are recorded between `begin()` and `end()` calls.
///
/// # Note
///
/// The recorder does NOT own the underlying command buffer handle.
/// The handle is freed when the owning [`CommandPool`] is destroyed.
pub struct CommandRecorder {
    device: DeviceRef,
    buffer: vk::CommandBuffer,
}

impl CommandRecorder {
    /// Returns the raw command buffer handle.
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    // =========================================================================
    // Recording Control
    // =========================================================================

    /// Begins one-time-submit recording.
    ///
    /// # Errors
    ///
    /// Returns an error if beginning fails (e.g., if already recording).
    pub fn begin(&self) -> RhiResult<()> {
        self.device.begin_command_buffer(self.buffer)
    }

    /// Ends recording. After this call, the command buffer is ready for submission.
    ///
    /// # Errors
    ///
    /// Returns an error if ending fails (e.g., if not recording).
    pub fn end(&self) -> RhiResult<()> {
        self.device.end_command_buffer(self.buffer)
    }

    /// Records an arbitrary command.
    #[inline]
    pub fn record(&self, command: &GpuCommand<'_>) {
        self.device.record(self.buffer, command);
    }

    // =========================================================================
    // Image Layouts and Dynamic Rendering
    // =========================================================================

    /// Transitions a color image between layouts.
    pub fn transition_image(
        &self,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        self.record(&GpuCommand::TransitionImage {
            image,
            aspect: vk::ImageAspectFlags::COLOR,
            old_layout,
            new_layout,
        });
    }

    /// Transitions a depth image between layouts.
    pub fn transition_depth_image(
        &self,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        self.record(&GpuCommand::TransitionImage {
            image,
            aspect: vk::ImageAspectFlags::DEPTH,
            old_layout,
            new_layout,
        });
    }

    /// Begins dynamic rendering into `color` and the optional depth attachment.
    pub fn begin_rendering(
        &self,
        color: &RenderTarget,
        depth: Option<&DepthAttachment>,
        clear_color: [f32; 4],
    ) {
        self.record(&GpuCommand::BeginRendering {
            color,
            depth,
            clear_color,
        });
    }

    /// Ends dynamic rendering.
    pub fn end_rendering(&self) {
        self.record(&GpuCommand::EndRendering);
    }

    /// Sets viewport and scissor to cover `extent`.
    pub fn set_viewport_scissor(&self, extent: vk::Extent2D) {
        self.record(&GpuCommand::SetViewportScissor { extent });
    }

    // =========================================================================
    // Binding
    // =========================================================================

    /// Binds a graphics pipeline.
    pub fn bind_pipeline(&self, pipeline: vk::Pipeline) {
        self.record(&GpuCommand::BindPipeline { pipeline });
    }

    /// Binds descriptor sets starting at `first_set`.
    pub fn bind_descriptor_sets(
        &self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.record(&GpuCommand::BindDescriptorSets {
            layout,
            first_set,
            sets,
        });
    }

    /// Binds a 32-bit index buffer.
    pub fn bind_index_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize) {
        self.record(&GpuCommand::BindIndexBuffer {
            buffer,
            offset,
            index_type: vk::IndexType::UINT32,
        });
    }

    /// Pushes a plain-old-data value as push constants.
    ///
    /// # Arguments
    ///
    /// * `layout` - Layout the push constant range belongs to
    /// * `stages` - Shader stages that read the range
    /// * `offset` - Byte offset into the range
    /// * `data` - The value to upload
    pub fn push_constants<T: Pod>(
        &self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &T,
    ) {
        self.record(&GpuCommand::PushConstants {
            layout,
            stages,
            offset,
            data: bytemuck::bytes_of(data),
        });
    }

    // =========================================================================
    // Drawing Commands
    // =========================================================================

    /// Draws non-indexed primitives.
    pub fn draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.record(&GpuCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    /// Draws indexed primitives from the bound index buffer.
    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.record(&GpuCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_recorder_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CommandRecorder>();
    }

    #[test]
    fn test_command_pool_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CommandPool>();
    }

    #[test]
    fn test_command_names() {
        assert_eq!(GpuCommand::EndRendering.name(), "end_rendering");
        assert_eq!(
            GpuCommand::BindPipeline {
                pipeline: vk::Pipeline::null()
            }
            .name(),
            "bind_pipeline"
        );
    }

    #[test]
    fn test_recorder_forwards_to_device() {
        use std::sync::Arc;

        use crate::dummy::{DeviceCall, DummyDevice};

        let dummy = Arc::new(DummyDevice::new());
        let pool = CommandPool::new(dummy.clone(), 0).unwrap();
        let recorder = pool.allocate_recorder().unwrap();
        let cmd = recorder.handle();

        recorder.begin().unwrap();
        recorder.draw(3, 1, 0, 0);
        recorder.end().unwrap();
        pool.reset().unwrap();

        let calls = dummy.calls();
        assert!(calls.contains(&DeviceCall::BeginCommandBuffer(cmd)));
        assert!(calls.contains(&DeviceCall::Record {
            command_buffer: cmd,
            command: "draw"
        }));
        assert!(calls.contains(&DeviceCall::ResetCommandPool(pool.handle())));
    }
}
