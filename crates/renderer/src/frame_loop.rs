//! Per-frame orchestration.
//!
//! [`FrameLoop`] drives one frame at a time through the ring protocol:
//! wait on the slot, reset it, acquire a target image, record, submit,
//! present, advance. Callers supply the scene-specific part of recording as a
//! closure that receives a [`FrameContext`].
//!
//! # Example
//!
//! ```no_run
//! use inflight_core::RendererConfig;
//! use inflight_renderer::frame_loop::{FrameLoop, FrameOutcome};
//! use inflight_rhi::device::{DeviceRef, PresentationSurface};
//!
//! # fn example(device: DeviceRef, surface: &mut dyn PresentationSurface) -> inflight_renderer::RendererResult<()> {
//! let mut frames = FrameLoop::new(device, RendererConfig::default())?;
//!
//! loop {
//!     let outcome = frames.render_frame(surface, |ctx| {
//!         // bind pipelines, upload per-frame data, draw...
//!         let _ = ctx.target();
//!         Ok(())
//!     })?;
//!
//!     if let FrameOutcome::SurfaceRecreated = outcome {
//!         // the window size changed; nothing was drawn this time
//!     }
//!     # break;
//! }
//!
//! frames.shutdown()?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use ash::vk;
use bytemuck::Pod;
use tracing::{debug, error, info, warn};

use inflight_core::{FrameTimer, RendererConfig};
use inflight_rhi::command::CommandRecorder;
use inflight_rhi::descriptor::DescriptorWriter;
use inflight_rhi::device::{
    DepthAttachment, DeviceRef, PresentationSurface, RenderTarget, Submission, SurfaceStatus,
};

use crate::deletion::DeletionQueue;
use crate::descriptor_allocator::DescriptorAllocator;
use crate::error::{RendererError, RendererResult};
use crate::frame_ring::FrameRing;
use crate::pipeline_cache::PipelineCache;

/// What happened to a call to [`FrameLoop::render_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was submitted and presented. `recreated` is set when the
    /// surface was rebuilt afterwards because it reported itself stale.
    Presented { image_index: u32, recreated: bool },
    /// The target was out of date on acquire. Nothing was recorded, submitted
    /// or presented, the frame counter did not advance, and the surface has
    /// been recreated.
    SurfaceRecreated,
}

/// Everything a recording closure may touch during one frame.
///
/// Borrowed from the current frame slot; valid only inside the closure passed
/// to [`FrameLoop::render_frame`].
pub struct FrameContext<'a> {
    device: &'a DeviceRef,
    recorder: &'a CommandRecorder,
    descriptors: &'a mut DescriptorAllocator,
    deletion_queue: &'a mut DeletionQueue,
    pipelines: &'a PipelineCache,
    target: RenderTarget,
    slot_index: usize,
    frame_number: u64,
}

impl<'a> FrameContext<'a> {
    #[inline]
    pub fn device(&self) -> &DeviceRef {
        self.device
    }

    /// The recorder for this frame, already inside dynamic rendering with
    /// viewport and scissor set to the target extent.
    #[inline]
    pub fn recorder(&self) -> &CommandRecorder {
        self.recorder
    }

    /// The slot's descriptor allocator. Sets allocated here are valid until
    /// this slot comes around again.
    #[inline]
    pub fn descriptors(&mut self) -> &mut DescriptorAllocator {
        &mut *self.descriptors
    }

    #[inline]
    pub fn pipelines(&self) -> &PipelineCache {
        self.pipelines
    }

    #[inline]
    pub fn target(&self) -> &RenderTarget {
        &self.target
    }

    #[inline]
    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Runs `deletor` once this frame's GPU work has completed.
    pub fn defer<F>(&mut self, deletor: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.deletion_queue.push(deletor);
    }

    /// Allocates a descriptor set from the slot's allocator.
    pub fn allocate_set(
        &mut self,
        layout: vk::DescriptorSetLayout,
    ) -> RendererResult<vk::DescriptorSet> {
        self.descriptors.allocate(layout)
    }

    /// Uploads `data` into a fresh uniform buffer and returns a set with the
    /// buffer bound at binding 0.
    ///
    /// The buffer is destroyed once this frame's GPU work has completed.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer cannot be created or written, or if no
    /// descriptor set can be allocated.
    pub fn upload_uniform<T: Pod>(
        &mut self,
        data: &T,
        layout: vk::DescriptorSetLayout,
    ) -> RendererResult<vk::DescriptorSet> {
        let size = std::mem::size_of::<T>() as vk::DeviceSize;
        let buffer = self
            .device
            .create_host_buffer(size, vk::BufferUsageFlags::UNIFORM_BUFFER)?;

        let device = self.device.clone();
        self.deletion_queue.push(move || device.destroy_buffer(buffer));

        self.device.write_buffer(buffer, 0, bytemuck::bytes_of(data))?;

        let set = self.descriptors.allocate(layout)?;
        let mut writer = DescriptorWriter::new();
        writer.write_buffer(0, buffer, size, 0, vk::DescriptorType::UNIFORM_BUFFER);
        writer.update(self.device.as_ref(), set);

        Ok(set)
    }
}

/// Drives frames through the ring protocol.
///
/// Owns the frame ring, the pipeline cache and a deletion queue for
/// resources shared by every frame. Shutdown runs on drop if it was not
/// called explicitly.
///
/// Any error from [`FrameLoop::render_frame`] stops the loop: later frames are
/// rejected and only [`FrameLoop::shutdown`] remains.
pub struct FrameLoop {
    device: DeviceRef,
    ring: FrameRing,
    pipelines: PipelineCache,
    timer: FrameTimer,
    clear_color: [f32; 4],
    acquire_timeout: Duration,
    depth: Option<DepthAttachment>,
    shared_cleanup: DeletionQueue,
    failed: bool,
    shut_down: bool,
}

impl FrameLoop {
    /// Creates the frame ring and an empty pipeline cache.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or any per-frame resource
    /// cannot be created.
    pub fn new(device: DeviceRef, config: RendererConfig) -> RendererResult<Self> {
        let ring = FrameRing::new(device.clone(), &config)?;
        let pipelines = PipelineCache::new(device.clone());

        info!(
            "Frame loop ready ({} frame(s) in flight, fence timeout {:?})",
            config.frames_in_flight,
            config.fence_timeout()
        );

        Ok(Self {
            device,
            ring,
            pipelines,
            timer: FrameTimer::new(),
            clear_color: config.clear_color,
            acquire_timeout: config.acquire_timeout(),
            depth: None,
            shared_cleanup: DeletionQueue::new(),
            failed: false,
            shut_down: false,
        })
    }

    #[inline]
    pub fn ring(&self) -> &FrameRing {
        &self.ring
    }

    #[inline]
    pub fn pipelines(&self) -> &PipelineCache {
        &self.pipelines
    }

    /// Mutable access to the pipeline cache, for setup outside the frame.
    #[inline]
    pub fn pipelines_mut(&mut self) -> &mut PipelineCache {
        &mut self.pipelines
    }

    #[inline]
    pub fn timer(&self) -> &FrameTimer {
        &self.timer
    }

    /// Sets the depth image cleared and bound with every frame's target.
    /// The image is owned by the caller.
    pub fn set_depth_attachment(&mut self, depth: Option<DepthAttachment>) {
        self.depth = depth;
    }

    /// Registers cleanup for a resource shared by every frame, such as a
    /// default texture or a global descriptor set layout.
    ///
    /// Runs once during [`FrameLoop::shutdown`], after every frame slot has
    /// been drained and before the pipeline cache is cleared.
    pub fn defer_shutdown<F>(&mut self, deletor: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared_cleanup.push(deletor);
    }

    /// Whether a frame has failed and the loop stopped.
    #[inline]
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Renders one frame.
    ///
    /// # Errors
    ///
    /// Every error is fatal to the loop: a fence timeout
    /// ([`RendererError::DeviceLost`]), a submit or present failure, a failed
    /// surface recreation, or any error returned by `record`. Once a frame has
    /// failed, or after shutdown, every call returns
    /// [`RendererError::InvalidState`].
    pub fn render_frame<S, F>(&mut self, surface: &mut S, record: F) -> RendererResult<FrameOutcome>
    where
        S: PresentationSurface + ?Sized,
        F: FnOnce(&mut FrameContext<'_>) -> RendererResult<()>,
    {
        if self.shut_down {
            return Err(RendererError::InvalidState(
                "render_frame called after shutdown".into(),
            ));
        }
        if self.failed {
            return Err(RendererError::InvalidState(
                "render_frame called after a fatal frame error".into(),
            ));
        }

        let result = self.run_frame(surface, record);
        if let Err(e) = &result {
            // An acquired image or a pending semaphore signal may be left
            // behind, so the slot cannot be reused safely.
            error!(
                "Frame {} failed, stopping the frame loop: {}",
                self.ring.frame_counter(),
                e
            );
            self.failed = true;
        }
        result
    }

    fn run_frame<S, F>(&mut self, surface: &mut S, record: F) -> RendererResult<FrameOutcome>
    where
        S: PresentationSurface + ?Sized,
        F: FnOnce(&mut FrameContext<'_>) -> RendererResult<()>,
    {
        let frame_number = self.ring.frame_counter();
        let slot = self.ring.begin_slot()?;
        let slot_index = slot.index();
        let acquire_signal = slot.acquire_signal().handle();
        let complete_signal = slot.complete_signal().handle();
        let fence = slot.completion_fence().handle();
        let command_buffer = slot.recorder().handle();

        let (image_index, acquire_status) =
            match surface.acquire_next_image(self.acquire_timeout, acquire_signal) {
                Ok(acquired) => acquired,
                Err(e) => {
                    self.ring.abandon_current();
                    return Err(e.into());
                }
            };

        if acquire_status == SurfaceStatus::OutOfDate {
            warn!("Surface out of date on acquire; recreating");
            self.ring.abandon_current();
            self.recreate_surface(surface)?;
            return Ok(FrameOutcome::SurfaceRecreated);
        }

        let target = surface.target(image_index);
        if let Err(e) = self.record_frame(target, frame_number, record) {
            self.ring.abandon_current();
            return Err(e);
        }

        self.ring.current().completion_fence().reset()?;
        self.device.submit(&Submission {
            command_buffer,
            wait_semaphore: acquire_signal,
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            signal_semaphore: complete_signal,
            fence,
        })?;
        self.ring.mark_submitted();

        let present_status = surface.present(complete_signal, image_index)?;
        self.ring.advance();
        self.tick_timer();

        let recreated = acquire_status.needs_recreate() || present_status.needs_recreate();
        if recreated {
            warn!(
                "Surface reported {:?} on acquire and {:?} on present; recreating",
                acquire_status, present_status
            );
            self.recreate_surface(surface)?;
        }

        debug!(
            "Frame {} presented image {} from slot {}",
            frame_number, image_index, slot_index
        );
        Ok(FrameOutcome::Presented {
            image_index,
            recreated,
        })
    }

    /// Drains every slot, waits for device idle and asks the surface to
    /// rebuild its images.
    pub fn recreate_surface<S>(&mut self, surface: &mut S) -> RendererResult<()>
    where
        S: PresentationSurface + ?Sized,
    {
        self.ring.wait_all()?;
        self.device.wait_idle()?;
        surface.recreate()?;
        info!("Surface recreated");
        Ok(())
    }

    /// Waits for all outstanding work and releases every deferred, pooled and
    /// cached resource. Per-frame cleanup runs first, then shared cleanup,
    /// then the pipeline cache is cleared. Further frames are rejected.
    pub fn shutdown(&mut self) -> RendererResult<()> {
        if self.shut_down {
            return Ok(());
        }

        self.ring.shutdown()?;
        self.shared_cleanup.flush();
        self.pipelines.clear();
        self.shut_down = true;

        info!(
            "Frame loop shut down after {} frame(s)",
            self.ring.frame_counter()
        );
        Ok(())
    }

    fn record_frame<F>(
        &mut self,
        target: RenderTarget,
        frame_number: u64,
        record: F,
    ) -> RendererResult<()>
    where
        F: FnOnce(&mut FrameContext<'_>) -> RendererResult<()>,
    {
        let slot = self.ring.current_mut();
        let slot_index = slot.index();
        let (recorder, descriptors, deletion_queue) = slot.recording_parts();

        recorder.begin()?;
        recorder.transition_image(
            target.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        if let Some(depth) = &self.depth {
            recorder.transition_depth_image(
                depth.image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            );
        }
        recorder.begin_rendering(&target, self.depth.as_ref(), self.clear_color);
        recorder.set_viewport_scissor(target.extent);

        let mut ctx = FrameContext {
            device: &self.device,
            recorder,
            descriptors,
            deletion_queue,
            pipelines: &self.pipelines,
            target,
            slot_index,
            frame_number,
        };
        record(&mut ctx)?;

        recorder.end_rendering();
        recorder.transition_image(
            target.image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        recorder.end()?;
        Ok(())
    }

    fn tick_timer(&mut self) {
        self.timer.tick();
        if self.timer.window_elapsed() {
            let average = self.timer.average_frame_time();
            let fps = if average.is_zero() {
                0.0
            } else {
                1.0 / average.as_secs_f64()
            };
            debug!(
                "Average frame time {:.3} ms ({:.1} fps) over the last window",
                average.as_secs_f64() * 1000.0,
                fps
            );
        }
    }
}

impl Drop for FrameLoop {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Frame loop shutdown failed during drop: {}", e);
        }
    }
}
