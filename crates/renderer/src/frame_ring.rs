//! Frames-in-flight ring and per-slot synchronization.
//!
//! The [`FrameRing`] owns N [`FrameSlot`]s, created once and reused round-robin
//! for the renderer's lifetime. Each slot carries everything one frame needs
//! while its GPU work is outstanding:
//!
//! - a command pool and the recorder allocated from it
//! - an acquire semaphore (target image ready) and a complete semaphore
//!   (rendering finished, consumed by present)
//! - a completion fence, created signaled
//! - a [`DeletionQueue`] and a [`DescriptorAllocator`] scoped to the slot
//!
//! # Synchronization Flow
//!
//! ```text
//! 1. i = counter mod N
//! 2. Wait on slot i's fence (bounded by the configured timeout)
//! 3. Flush slot i's deletion queue
//! 4. Reset slot i's descriptor pools and command pool
//!    ... acquire, record ...
//! 7. Reset the fence, submit (signals complete semaphore + fence)
//!    ... present ...
//! 9. counter += 1
//! ```
//!
//! Steps 2-4 are [`FrameRing::begin_slot`]; step 7's bookkeeping is
//! [`FrameRing::mark_submitted`] and step 9 is [`FrameRing::advance`]. Nothing
//! touches a slot's recorder, descriptors or deletion queue unless its fence
//! has been observed signaled since the slot's last submission.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use inflight_core::{DescriptorConfig, RendererConfig};
use inflight_rhi::RhiError;
use inflight_rhi::command::{CommandPool, CommandRecorder};
use inflight_rhi::descriptor::PoolSizeRatio;
use inflight_rhi::device::DeviceRef;
use inflight_rhi::sync::{Fence, Semaphore};

use crate::deletion::DeletionQueue;
use crate::descriptor_allocator::DescriptorAllocator;
use crate::error::{RendererError, RendererResult};

/// Lifecycle of a frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Fence signaled; the slot may be reused.
    Idle,
    /// Commands are being written.
    Recording,
    /// Commands are in the device queue; the fence is unsignaled until they retire.
    Submitted,
}

/// Per-frame resources for one ring position.
pub struct FrameSlot {
    index: usize,
    state: SlotState,
    // Declared before the handles they may reference so they drop first.
    pending_cleanup: DeletionQueue,
    descriptors: DescriptorAllocator,
    recorder: CommandRecorder,
    command_pool: CommandPool,
    acquire_signal: Semaphore,
    complete_signal: Semaphore,
    completion_fence: Fence,
}

impl FrameSlot {
    /// Creates the resources for slot `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if any device object cannot be created.
    fn new(device: DeviceRef, index: usize, descriptors: &DescriptorConfig) -> RendererResult<Self> {
        let command_pool = CommandPool::new(device.clone(), device.graphics_queue_family())?;
        let recorder = command_pool.allocate_recorder()?;
        let acquire_signal = Semaphore::new(device.clone())?;
        let complete_signal = Semaphore::new(device.clone())?;
        // Signaled so the first wait on this slot returns immediately.
        let completion_fence = Fence::new(device.clone(), true)?;

        let mut allocator = DescriptorAllocator::new(device, descriptors);
        let ratios: Vec<PoolSizeRatio> = descriptors
            .ratios
            .iter()
            .copied()
            .map(PoolSizeRatio::from)
            .collect();
        allocator.init_pools(&ratios, descriptors.initial_pools, descriptors.sets_per_pool)?;

        Ok(Self {
            index,
            state: SlotState::Idle,
            pending_cleanup: DeletionQueue::new(),
            descriptors: allocator,
            recorder,
            command_pool,
            acquire_signal,
            complete_signal,
            completion_fence,
        })
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn state(&self) -> SlotState {
        self.state
    }

    #[inline]
    pub fn recorder(&self) -> &CommandRecorder {
        &self.recorder
    }

    #[inline]
    pub fn command_pool(&self) -> &CommandPool {
        &self.command_pool
    }

    #[inline]
    pub fn acquire_signal(&self) -> &Semaphore {
        &self.acquire_signal
    }

    #[inline]
    pub fn complete_signal(&self) -> &Semaphore {
        &self.complete_signal
    }

    #[inline]
    pub fn completion_fence(&self) -> &Fence {
        &self.completion_fence
    }

    #[inline]
    pub fn descriptors(&self) -> &DescriptorAllocator {
        &self.descriptors
    }

    #[inline]
    pub fn deletion_queue(&self) -> &DeletionQueue {
        &self.pending_cleanup
    }

    /// Mutable access to the recording-time resources of this slot.
    pub(crate) fn recording_parts(
        &mut self,
    ) -> (&CommandRecorder, &mut DescriptorAllocator, &mut DeletionQueue) {
        (&self.recorder, &mut self.descriptors, &mut self.pending_cleanup)
    }

    fn wait(&self, timeout: Duration) -> RendererResult<()> {
        match self.completion_fence.wait(timeout) {
            Ok(()) => Ok(()),
            Err(RhiError::FenceTimeout(_)) => {
                error!(
                    "Frame slot {} did not complete within {:?}; treating device as lost",
                    self.index, timeout
                );
                Err(RendererError::DeviceLost {
                    slot: self.index,
                    timeout,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Ring of frame slots visited in round-robin order.
///
/// # Thread Safety
///
/// Driven from a single render thread.
pub struct FrameRing {
    device: DeviceRef,
    slots: Vec<FrameSlot>,
    frame_counter: u64,
    fence_timeout: Duration,
}

impl FrameRing {
    /// Creates `config.frames_in_flight` slots.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or any per-slot
    /// resource cannot be created.
    pub fn new(device: DeviceRef, config: &RendererConfig) -> RendererResult<Self> {
        config.validate()?;

        let slots = (0..config.frames_in_flight)
            .map(|index| FrameSlot::new(device.clone(), index, &config.descriptors))
            .collect::<RendererResult<Vec<_>>>()?;

        info!("Frame ring created with {} slot(s)", slots.len());

        Ok(Self {
            device,
            slots,
            frame_counter: 0,
            fence_timeout: config.fence_timeout(),
        })
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of frames advanced past since creation.
    #[inline]
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    /// Index of the slot the next frame uses.
    #[inline]
    pub fn current_index(&self) -> usize {
        (self.frame_counter % self.slots.len() as u64) as usize
    }

    #[inline]
    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.current_index()]
    }

    #[inline]
    pub(crate) fn current_mut(&mut self) -> &mut FrameSlot {
        let index = self.current_index();
        &mut self.slots[index]
    }

    #[inline]
    pub fn slot(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    /// Waits for the current slot's previous submission and prepares the slot
    /// for recording: flushes its deletion queue and resets its descriptor
    /// pools and command pool.
    ///
    /// # Errors
    ///
    /// Returns [`RendererError::DeviceLost`] if the fence does not signal
    /// within the configured timeout. The slot is left untouched in that case.
    pub fn begin_slot(&mut self) -> RendererResult<&mut FrameSlot> {
        let timeout = self.fence_timeout;
        let frame = self.frame_counter;
        let slot = self.current_mut();

        if slot.state == SlotState::Recording {
            warn!("Frame slot {} was left recording; discarding it", slot.index);
        }

        slot.wait(timeout)?;
        slot.state = SlotState::Idle;

        slot.pending_cleanup.flush();
        slot.descriptors.reset_all()?;
        slot.command_pool.reset()?;
        slot.state = SlotState::Recording;

        debug!("Frame {} recording in slot {}", frame, slot.index);
        Ok(slot)
    }

    /// Returns the current slot to idle without submitting. Its fence was not
    /// reset, so it is still signaled.
    pub fn abandon_current(&mut self) {
        let slot = self.current_mut();
        if slot.state == SlotState::Recording {
            slot.state = SlotState::Idle;
            debug!("Frame slot {} abandoned before submission", slot.index);
        }
    }

    /// Records that the current slot's commands were submitted with its fence.
    pub fn mark_submitted(&mut self) {
        self.current_mut().state = SlotState::Submitted;
    }

    /// Moves on to the next slot.
    pub fn advance(&mut self) {
        self.frame_counter += 1;
    }

    /// Blocks until every submitted slot has completed.
    ///
    /// # Errors
    ///
    /// Returns [`RendererError::DeviceLost`] for the first slot whose fence
    /// does not signal in time.
    pub fn wait_all(&mut self) -> RendererResult<()> {
        let timeout = self.fence_timeout;
        for slot in &mut self.slots {
            if slot.state == SlotState::Submitted {
                slot.wait(timeout)?;
                slot.state = SlotState::Idle;
            }
        }
        Ok(())
    }

    /// Drains the ring and releases every deferred and pooled resource.
    ///
    /// Waits for all slots and for device idle, then flushes every deletion
    /// queue and destroys every descriptor pool. The slots themselves stay
    /// valid and may be used again.
    pub fn shutdown(&mut self) -> RendererResult<()> {
        self.wait_all()?;
        self.device.wait_idle()?;

        for slot in &mut self.slots {
            slot.pending_cleanup.flush();
            slot.descriptors.destroy_all();
        }

        debug!("Frame ring drained");
        Ok(())
    }
}

impl Drop for FrameRing {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Failed to drain frame ring during drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ash::vk;
    use inflight_rhi::device::{GraphicsDevice, Submission};
    use inflight_rhi::dummy::{DeviceCall, DummyDevice};

    fn ring(device: &Arc<DummyDevice>, frames_in_flight: usize) -> FrameRing {
        let config = RendererConfig {
            frames_in_flight,
            ..RendererConfig::default()
        };
        FrameRing::new(device.clone(), &config).unwrap()
    }

    fn submit(device: &DummyDevice, ring: &mut FrameRing) {
        let slot = ring.current();
        slot.completion_fence().reset().unwrap();
        device
            .submit(&Submission {
                command_buffer: slot.recorder().handle(),
                wait_semaphore: slot.acquire_signal().handle(),
                wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                signal_semaphore: slot.complete_signal().handle(),
                fence: slot.completion_fence().handle(),
            })
            .unwrap();
        ring.mark_submitted();
        ring.advance();
    }

    #[test]
    fn test_slots_rotate_round_robin() {
        let device = Arc::new(DummyDevice::new());
        let mut ring = ring(&device, 3);

        let visited: Vec<usize> = (0..7)
            .map(|_| {
                let index = ring.begin_slot().unwrap().index();
                submit(&device, &mut ring);
                index
            })
            .collect();
        assert_eq!(visited, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(ring.frame_counter(), 7);
    }

    #[test]
    fn test_begin_slot_waits_before_reset() {
        let device = Arc::new(DummyDevice::new());
        let mut ring = ring(&device, 2);
        device.clear_calls();

        let slot = ring.begin_slot().unwrap();
        let fence = slot.completion_fence().handle();
        let pool = slot.command_pool.handle();

        let calls = device.calls();
        let wait = calls.iter().position(|c| *c == DeviceCall::WaitFence(fence));
        let reset = calls.iter().position(|c| *c == DeviceCall::ResetCommandPool(pool));
        assert!(wait.unwrap() < reset.unwrap());
    }

    #[test]
    fn test_deferred_action_waits_for_fence() {
        let device = Arc::new(DummyDevice::with_manual_fences());
        let mut ring = ring(&device, 1);
        let runs = Arc::new(AtomicUsize::new(0));

        let slot = ring.begin_slot().unwrap();
        let counter = runs.clone();
        slot.recording_parts().2.push(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        submit(&device, &mut ring);

        let err = ring.begin_slot().err().unwrap();
        assert!(matches!(err, RendererError::DeviceLost { slot: 0, .. }));
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        device.complete_submissions();
        ring.begin_slot().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        ring.abandon_current();
        ring.begin_slot().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_abandon_keeps_fence_signaled() {
        let device = Arc::new(DummyDevice::new());
        let mut ring = ring(&device, 2);

        ring.begin_slot().unwrap();
        ring.abandon_current();

        let slot = ring.current();
        assert_eq!(slot.state(), SlotState::Idle);
        assert!(slot.completion_fence().is_signaled());
        assert_eq!(ring.frame_counter(), 0);
    }

    #[test]
    fn test_drop_releases_every_handle() {
        let device = Arc::new(DummyDevice::new());
        {
            let mut ring = ring(&device, 2);
            for _ in 0..4 {
                ring.begin_slot().unwrap();
                submit(&device, &mut ring);
            }
        }
        assert_eq!(device.live_handles(), 0);
        assert_eq!(device.double_destroys(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let device = Arc::new(DummyDevice::new());
        let config = RendererConfig {
            frames_in_flight: 0,
            ..RendererConfig::default()
        };
        assert!(matches!(
            FrameRing::new(device, &config),
            Err(RendererError::Core(_))
        ));
    }
}
