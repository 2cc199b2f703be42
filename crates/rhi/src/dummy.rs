//! In-memory device and surface for tests.
//!
//! [`DummyDevice`] fabricates handles, records every call in order and
//! simulates the few device behaviors the frame core depends on:
//! - fences signal when their submission "completes" (immediately, or when
//!   [`DummyDevice::complete_submissions`] is called in manual mode)
//! - descriptor pools hold at most `max_sets` sets until reset
//! - submitting with a fence that is still signaled is rejected
//!
//! [`DummySurface`] hands out images round-robin and replays scripted
//! acquire/present statuses.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::command::GpuCommand;
use crate::descriptor::{DescriptorWrite, PoolSizeRatio};
use crate::device::{
    GraphicsDevice, PresentationSurface, RenderTarget, Submission, SurfaceStatus, write_range,
};
use crate::error::{RhiError, RhiResult};
use crate::pipeline::{FixedFunctionState, PipelineConfig};

/// One call made against a [`DummyDevice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    WaitIdle,
    CreateFence { fence: vk::Fence, signaled: bool },
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    DestroyFence(vk::Fence),
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    CreateCommandPool(vk::CommandPool),
    AllocateCommandBuffer(vk::CommandBuffer),
    ResetCommandPool(vk::CommandPool),
    DestroyCommandPool(vk::CommandPool),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    Record {
        command_buffer: vk::CommandBuffer,
        command: &'static str,
    },
    Submit {
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
    },
    CreateDescriptorSetLayout(vk::DescriptorSetLayout),
    DestroyDescriptorSetLayout(vk::DescriptorSetLayout),
    CreateDescriptorPool {
        pool: vk::DescriptorPool,
        max_sets: u32,
    },
    AllocateDescriptorSet {
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    },
    ResetDescriptorPool(vk::DescriptorPool),
    DestroyDescriptorPool(vk::DescriptorPool),
    UpdateDescriptorSet {
        set: vk::DescriptorSet,
        writes: usize,
    },
    CreatePipeline {
        name: String,
        pipeline: vk::Pipeline,
    },
    DestroyPipeline(vk::Pipeline),
    CreateBuffer {
        buffer: vk::Buffer,
        size: u64,
    },
    WriteBuffer(vk::Buffer),
    DestroyBuffer(vk::Buffer),
}

#[derive(Debug, Clone, Copy)]
struct PoolUsage {
    max_sets: u32,
    allocated: u32,
}

#[derive(Default)]
struct DummyState {
    next_handle: u64,
    calls: Vec<DeviceCall>,
    live: HashSet<u64>,
    double_destroys: usize,
    fences: HashMap<vk::Fence, bool>,
    pending_fences: Vec<vk::Fence>,
    descriptor_pools: HashMap<vk::DescriptorPool, PoolUsage>,
    buffers: HashMap<vk::Buffer, Vec<u8>>,
    manual_fences: bool,
    fail_pipeline_builds: bool,
    fragment_descriptor_pools: bool,
    fail_next_submit: Option<vk::Result>,
}

impl DummyState {
    fn create<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        self.live.insert(self.next_handle);
        H::from_raw(self.next_handle)
    }

    fn destroy<H: Handle>(&mut self, handle: H) {
        let raw = handle.as_raw();
        if !self.live.remove(&raw) {
            warn!("Dummy device: handle {raw:#x} destroyed twice or never created");
            self.double_destroys += 1;
        }
    }
}

/// Device implementation that never touches a GPU.
#[derive(Default)]
pub struct DummyDevice {
    state: Mutex<DummyState>,
}

impl DummyDevice {
    /// Creates a device whose fences signal as soon as work is submitted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a device whose fences stay unsignaled until
    /// [`DummyDevice::complete_submissions`] is called.
    pub fn with_manual_fences() -> Self {
        let device = Self::default();
        device.state.lock().manual_fences = true;
        device
    }

    /// Signals every fence whose submission is still pending.
    pub fn complete_submissions(&self) {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending_fences);
        for fence in pending {
            state.fences.insert(fence, true);
        }
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Number of recorded calls matching `predicate`.
    pub fn count_calls(&self, predicate: impl Fn(&DeviceCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    /// Handles created and not yet destroyed.
    pub fn live_handles(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Destroy calls for handles that were not live.
    pub fn double_destroys(&self) -> usize {
        self.state.lock().double_destroys
    }

    /// `(allocated, max_sets)` for a live descriptor pool.
    pub fn descriptor_pool_usage(&self, pool: vk::DescriptorPool) -> Option<(u32, u32)> {
        self.state
            .lock()
            .descriptor_pools
            .get(&pool)
            .map(|usage| (usage.allocated, usage.max_sets))
    }

    /// Current contents of a live buffer.
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer).cloned()
    }

    /// Number of buffers created and not yet destroyed.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Makes every subsequent pipeline build fail.
    pub fn fail_pipeline_builds(&self, fail: bool) {
        self.state.lock().fail_pipeline_builds = fail;
    }

    /// Makes every descriptor set allocation fail with
    /// `ERROR_FRAGMENTED_POOL`, regardless of remaining capacity.
    pub fn fragment_descriptor_pools(&self, fragment: bool) {
        self.state.lock().fragment_descriptor_pools = fragment;
    }

    /// Makes the next submission fail with `result`.
    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state.lock().fail_next_submit = Some(result);
    }
}

impl GraphicsDevice for DummyDevice {
    fn graphics_queue_family(&self) -> u32 {
        0
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::WaitIdle);
        // Idle means every submission has retired.
        let pending = std::mem::take(&mut state.pending_fences);
        for fence in pending {
            state.fences.insert(fence, true);
        }
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let mut state = self.state.lock();
        let fence = state.create();
        state.fences.insert(fence, signaled);
        state.calls.push(DeviceCall::CreateFence { fence, signaled });
        trace!("Dummy device: created fence {:?}", fence);
        Ok(fence)
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> RhiResult<()> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::WaitFence(fence));
        match state.fences.get(&fence) {
            Some(true) => Ok(()),
            Some(false) => Err(RhiError::FenceTimeout(timeout)),
            None => Err(RhiError::InvalidHandle(format!("unknown fence {fence:?}"))),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::ResetFence(fence));
        match state.fences.get_mut(&fence) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(RhiError::InvalidHandle(format!("unknown fence {fence:?}"))),
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool> {
        self.state
            .lock()
            .fences
            .get(&fence)
            .copied()
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown fence {fence:?}")))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.fences.remove(&fence);
        state.pending_fences.retain(|pending| *pending != fence);
        state.destroy(fence);
        state.calls.push(DeviceCall::DestroyFence(fence));
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore = state.create();
        state.calls.push(DeviceCall::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.destroy(semaphore);
        state.calls.push(DeviceCall::DestroySemaphore(semaphore));
    }

    fn create_command_pool(&self, _queue_family: u32) -> RhiResult<vk::CommandPool> {
        let mut state = self.state.lock();
        let pool = state.create();
        state.calls.push(DeviceCall::CreateCommandPool(pool));
        Ok(pool)
    }

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> RhiResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        state.next_handle += 1;
        // Freed with the pool, so not tracked as a live handle.
        let buffer = vk::CommandBuffer::from_raw(state.next_handle);
        state.calls.push(DeviceCall::AllocateCommandBuffer(buffer));
        Ok(buffer)
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()> {
        self.state.lock().calls.push(DeviceCall::ResetCommandPool(pool));
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        state.destroy(pool);
        state.calls.push(DeviceCall::DestroyCommandPool(pool));
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        self.state
            .lock()
            .calls
            .push(DeviceCall::BeginCommandBuffer(command_buffer));
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        self.state
            .lock()
            .calls
            .push(DeviceCall::EndCommandBuffer(command_buffer));
        Ok(())
    }

    fn record(&self, command_buffer: vk::CommandBuffer, command: &GpuCommand<'_>) {
        self.state.lock().calls.push(DeviceCall::Record {
            command_buffer,
            command: command.name(),
        });
    }

    fn submit(&self, submission: &Submission) -> RhiResult<()> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::Submit {
            command_buffer: submission.command_buffer,
            fence: submission.fence,
        });

        if let Some(result) = state.fail_next_submit.take() {
            return Err(result.into());
        }

        let fence = submission.fence;
        match state.fences.get(&fence) {
            Some(false) => {}
            Some(true) => {
                return Err(RhiError::InvalidHandle(format!(
                    "fence {fence:?} submitted while still signaled"
                )));
            }
            None => return Err(RhiError::InvalidHandle(format!("unknown fence {fence:?}"))),
        }

        if state.manual_fences {
            state.pending_fences.push(fence);
        } else {
            state.fences.insert(fence, true);
        }
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        let mut state = self.state.lock();
        let layout = state.create();
        state.calls.push(DeviceCall::CreateDescriptorSetLayout(layout));
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        let mut state = self.state.lock();
        state.destroy(layout);
        state.calls.push(DeviceCall::DestroyDescriptorSetLayout(layout));
    }

    fn create_descriptor_pool(
        &self,
        _ratios: &[PoolSizeRatio],
        max_sets: u32,
    ) -> RhiResult<vk::DescriptorPool> {
        let mut state = self.state.lock();
        let pool = state.create();
        state.descriptor_pools.insert(
            pool,
            PoolUsage {
                max_sets,
                allocated: 0,
            },
        );
        state.calls.push(DeviceCall::CreateDescriptorPool { pool, max_sets });
        Ok(pool)
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet> {
        let mut state = self.state.lock();
        let fragmented = state.fragment_descriptor_pools;
        let usage = state
            .descriptor_pools
            .get_mut(&pool)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown descriptor pool {pool:?}")))?;
        if usage.allocated >= usage.max_sets {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY.into());
        }
        if fragmented {
            return Err(vk::Result::ERROR_FRAGMENTED_POOL.into());
        }
        usage.allocated += 1;

        state.next_handle += 1;
        let set = vk::DescriptorSet::from_raw(state.next_handle);
        state.calls.push(DeviceCall::AllocateDescriptorSet { pool, set });
        Ok(set)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()> {
        let mut state = self.state.lock();
        let usage = state
            .descriptor_pools
            .get_mut(&pool)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown descriptor pool {pool:?}")))?;
        usage.allocated = 0;
        state.calls.push(DeviceCall::ResetDescriptorPool(pool));
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        state.descriptor_pools.remove(&pool);
        state.destroy(pool);
        state.calls.push(DeviceCall::DestroyDescriptorPool(pool));
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        self.state.lock().calls.push(DeviceCall::UpdateDescriptorSet {
            set,
            writes: writes.len(),
        });
    }

    fn create_graphics_pipeline(
        &self,
        config: &PipelineConfig,
        _state: &FixedFunctionState,
    ) -> RhiResult<(vk::Pipeline, vk::PipelineLayout)> {
        config.validate()?;

        let mut state = self.state.lock();
        if state.fail_pipeline_builds {
            return Err(RhiError::PipelineError(format!(
                "simulated build failure for '{}'",
                config.name
            )));
        }
        let pipeline = state.create();
        // The layout shares the pipeline's lifetime.
        state.next_handle += 1;
        let layout = vk::PipelineLayout::from_raw(state.next_handle);
        state.calls.push(DeviceCall::CreatePipeline {
            name: config.name.clone(),
            pipeline,
        });
        Ok((pipeline, layout))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline, _layout: vk::PipelineLayout) {
        let mut state = self.state.lock();
        state.destroy(pipeline);
        state.calls.push(DeviceCall::DestroyPipeline(pipeline));
    }

    fn create_host_buffer(&self, size: u64, _usage: vk::BufferUsageFlags) -> RhiResult<vk::Buffer> {
        let mut state = self.state.lock();
        let buffer = state.create();
        state.buffers.insert(buffer, vec![0; size as usize]);
        state.calls.push(DeviceCall::CreateBuffer { buffer, size });
        Ok(buffer)
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        let mut state = self.state.lock();
        let contents = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown buffer {buffer:?}")))?;
        let range = write_range(buffer, offset, data.len(), contents.len())?;
        contents[range].copy_from_slice(data);
        state.calls.push(DeviceCall::WriteBuffer(buffer));
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        state.buffers.remove(&buffer);
        state.destroy(buffer);
        state.calls.push(DeviceCall::DestroyBuffer(buffer));
    }
}

/// Presentation surface that never touches a window.
pub struct DummySurface {
    targets: Vec<RenderTarget>,
    next_image: u32,
    acquire_script: VecDeque<SurfaceStatus>,
    present_script: VecDeque<SurfaceStatus>,
    acquires: usize,
    presented: Vec<u32>,
    recreations: usize,
}

impl DummySurface {
    /// Creates a surface with `image_count` images of the given size.
    pub fn new(image_count: u32, extent: vk::Extent2D) -> Self {
        let targets = (0..image_count.max(1))
            .map(|index| {
                let raw = 0x1000 + u64::from(index) * 2;
                RenderTarget {
                    image: vk::Image::from_raw(raw),
                    view: vk::ImageView::from_raw(raw + 1),
                    format: vk::Format::B8G8R8A8_SRGB,
                    extent,
                }
            })
            .collect();

        Self {
            targets,
            next_image: 0,
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            acquires: 0,
            presented: Vec::new(),
            recreations: 0,
        }
    }

    /// Queues the status returned by an upcoming acquire. Unscripted
    /// acquires return [`SurfaceStatus::Optimal`].
    pub fn script_acquire(&mut self, status: SurfaceStatus) -> &mut Self {
        self.acquire_script.push_back(status);
        self
    }

    /// Queues the status returned by an upcoming present.
    pub fn script_present(&mut self, status: SurfaceStatus) -> &mut Self {
        self.present_script.push_back(status);
        self
    }

    pub fn acquire_count(&self) -> usize {
        self.acquires
    }

    pub fn present_count(&self) -> usize {
        self.presented.len()
    }

    /// Image indices in presentation order.
    pub fn presented_images(&self) -> &[u32] {
        &self.presented
    }

    pub fn recreate_count(&self) -> usize {
        self.recreations
    }
}

impl PresentationSurface for DummySurface {
    fn acquire_next_image(
        &mut self,
        _timeout: Duration,
        _signal: vk::Semaphore,
    ) -> RhiResult<(u32, SurfaceStatus)> {
        self.acquires += 1;
        let status = self.acquire_script.pop_front().unwrap_or(SurfaceStatus::Optimal);
        if status == SurfaceStatus::OutOfDate {
            return Ok((0, status));
        }

        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.targets.len() as u32;
        Ok((index, status))
    }

    fn present(&mut self, _wait: vk::Semaphore, image_index: u32) -> RhiResult<SurfaceStatus> {
        self.presented.push(image_index);
        Ok(self.present_script.pop_front().unwrap_or(SurfaceStatus::Optimal))
    }

    fn target(&self, image_index: u32) -> RenderTarget {
        self.targets[image_index as usize % self.targets.len()]
    }

    fn recreate(&mut self) -> RhiResult<()> {
        self.recreations += 1;
        self.next_image = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion_is_reported() {
        let device = DummyDevice::new();
        let pool = device.create_descriptor_pool(&[], 1).unwrap();
        let layout = vk::DescriptorSetLayout::null();

        device.allocate_descriptor_set(pool, layout).unwrap();
        let err = device.allocate_descriptor_set(pool, layout).unwrap_err();
        assert!(err.is_pool_exhausted());

        device.reset_descriptor_pool(pool).unwrap();
        assert!(device.allocate_descriptor_set(pool, layout).is_ok());
    }

    #[test]
    fn test_manual_fences_signal_on_completion() {
        let device = DummyDevice::with_manual_fences();
        let fence = device.create_fence(false).unwrap();
        let submission = Submission {
            command_buffer: vk::CommandBuffer::null(),
            wait_semaphore: vk::Semaphore::null(),
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            signal_semaphore: vk::Semaphore::null(),
            fence,
        };

        device.submit(&submission).unwrap();
        assert!(!device.fence_signaled(fence).unwrap());
        assert!(matches!(
            device.wait_for_fence(fence, Duration::from_millis(5)),
            Err(RhiError::FenceTimeout(_))
        ));

        device.complete_submissions();
        assert!(device.fence_signaled(fence).unwrap());
    }

    #[test]
    fn test_submit_with_signaled_fence_rejected() {
        let device = DummyDevice::new();
        let fence = device.create_fence(true).unwrap();
        let submission = Submission {
            command_buffer: vk::CommandBuffer::null(),
            wait_semaphore: vk::Semaphore::null(),
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            signal_semaphore: vk::Semaphore::null(),
            fence,
        };
        assert!(device.submit(&submission).is_err());
    }

    #[test]
    fn test_out_of_range_write_rejected() {
        let device = DummyDevice::new();
        let buffer = device
            .create_host_buffer(16, vk::BufferUsageFlags::UNIFORM_BUFFER)
            .unwrap();

        assert!(device.write_buffer(buffer, 8, &[1; 8]).is_ok());
        assert!(matches!(
            device.write_buffer(buffer, 12, &[1; 8]),
            Err(RhiError::InvalidHandle(_))
        ));
        assert!(matches!(
            device.write_buffer(buffer, u64::MAX, &[1; 8]),
            Err(RhiError::InvalidHandle(_))
        ));
        assert_eq!(device.buffer_contents(buffer).unwrap()[8..], [1; 8]);
    }

    #[test]
    fn test_double_destroy_detected() {
        let device = DummyDevice::new();
        let semaphore = device.create_semaphore().unwrap();
        device.destroy_semaphore(semaphore);
        assert_eq!(device.double_destroys(), 0);
        device.destroy_semaphore(semaphore);
        assert_eq!(device.double_destroys(), 1);
    }

    #[test]
    fn test_surface_script() {
        let mut surface = DummySurface::new(
            2,
            vk::Extent2D {
                width: 64,
                height: 64,
            },
        );
        surface.script_acquire(SurfaceStatus::OutOfDate);

        let (_, status) = surface
            .acquire_next_image(Duration::from_secs(1), vk::Semaphore::null())
            .unwrap();
        assert_eq!(status, SurfaceStatus::OutOfDate);

        let (index, status) = surface
            .acquire_next_image(Duration::from_secs(1), vk::Semaphore::null())
            .unwrap();
        assert_eq!((index, status), (0, SurfaceStatus::Optimal));
        assert_eq!(surface.acquire_count(), 2);
        assert_ne!(surface.target(0).image, surface.target(1).image);
    }
}
