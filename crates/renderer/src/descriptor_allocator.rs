//! Growable descriptor set allocator.
//!
//! [`DescriptorAllocator`] hands out descriptor sets from a set of pools. Pools
//! that still have room sit in the ready bucket; a pool that reports
//! exhaustion moves to the full bucket until the next [`reset_all`]. When a
//! pool runs out, the per-pool size grows by the configured factor (capped at
//! a hard ceiling) and the allocation is retried exactly once.
//!
//! Resetting invalidates every set handed out since the previous reset, so
//! [`reset_all`] must only run once the fence guarding their last use has
//! signaled. The frame ring owns one allocator per slot for that reason.
//!
//! [`reset_all`]: DescriptorAllocator::reset_all

use ash::vk;
use tracing::{debug, info, warn};

use inflight_core::DescriptorConfig;
use inflight_rhi::descriptor::PoolSizeRatio;
use inflight_rhi::device::DeviceRef;

use crate::error::{RendererError, RendererResult};

/// Pool-of-pools descriptor set allocator.
///
/// # Thread Safety
///
/// Not internally synchronized; owned by one frame slot and used from the
/// render thread.
pub struct DescriptorAllocator {
    device: DeviceRef,
    ratios: Vec<PoolSizeRatio>,
    ready_pools: Vec<vk::DescriptorPool>,
    full_pools: Vec<vk::DescriptorPool>,
    /// Capacity of the next pool created.
    sets_per_pool: u32,
    max_sets_per_pool: u32,
    growth_factor: f32,
    initialized: bool,
}

impl DescriptorAllocator {
    /// Creates an allocator with no pools. Pools are created by
    /// [`DescriptorAllocator::init_pools`] or lazily on first allocation.
    ///
    /// # Arguments
    ///
    /// * `device` - The device pools are created on
    /// * `config` - Initial pool size, ceiling, growth factor and type ratios
    pub fn new(device: DeviceRef, config: &DescriptorConfig) -> Self {
        Self {
            device,
            ratios: config.ratios.iter().copied().map(PoolSizeRatio::from).collect(),
            ready_pools: Vec::new(),
            full_pools: Vec::new(),
            sets_per_pool: config.sets_per_pool.min(config.max_sets_per_pool),
            max_sets_per_pool: config.max_sets_per_pool,
            growth_factor: config.growth_factor,
            initialized: false,
        }
    }

    /// Pre-creates `pool_count` pools of `sets_per_pool` sets each, sized by
    /// `ratios`. The ratios and size become the allocator's sizing policy.
    ///
    /// # Errors
    ///
    /// Returns [`RendererError::InvalidState`] if pools were already
    /// initialized and not destroyed since, or a device error if pool creation
    /// fails.
    pub fn init_pools(
        &mut self,
        ratios: &[PoolSizeRatio],
        pool_count: usize,
        sets_per_pool: u32,
    ) -> RendererResult<()> {
        if self.initialized {
            return Err(RendererError::InvalidState(
                "descriptor pools are already initialized".into(),
            ));
        }

        self.ratios = ratios.to_vec();
        self.sets_per_pool = sets_per_pool.min(self.max_sets_per_pool);

        for _ in 0..pool_count {
            let pool = self.create_pool(self.sets_per_pool)?;
            self.ready_pools.push(pool);
        }
        self.initialized = true;

        debug!(
            "Initialized {} descriptor pool(s) of {} sets",
            pool_count, self.sets_per_pool
        );
        Ok(())
    }

    /// Allocates one descriptor set with the given layout.
    ///
    /// # Errors
    ///
    /// Returns [`RendererError::DescriptorExhausted`] if the allocation still
    /// fails after one grow-and-retry cycle, or the device error for any
    /// failure other than pool exhaustion.
    pub fn allocate(&mut self, layout: vk::DescriptorSetLayout) -> RendererResult<vk::DescriptorSet> {
        let pool = self.get_pool()?;

        match self.device.allocate_descriptor_set(pool, layout) {
            Ok(set) => {
                self.ready_pools.push(pool);
                return Ok(set);
            }
            Err(e) if e.is_pool_exhausted() => {
                self.full_pools.push(pool);
                self.grow();
            }
            Err(e) => {
                self.ready_pools.push(pool);
                return Err(e.into());
            }
        }

        let pool = self.get_pool()?;
        match self.device.allocate_descriptor_set(pool, layout) {
            Ok(set) => {
                self.ready_pools.push(pool);
                Ok(set)
            }
            Err(e) if e.is_pool_exhausted() => {
                self.full_pools.push(pool);
                Err(RendererError::DescriptorExhausted {
                    sets_per_pool: self.sets_per_pool,
                })
            }
            Err(e) => {
                self.ready_pools.push(pool);
                Err(e.into())
            }
        }
    }

    /// Resets every pool and returns all of them to the ready bucket.
    ///
    /// Every set previously allocated from this allocator becomes invalid.
    pub fn reset_all(&mut self) -> RendererResult<()> {
        for &pool in &self.ready_pools {
            self.device.reset_descriptor_pool(pool)?;
        }

        while let Some(pool) = self.full_pools.pop() {
            let result = self.device.reset_descriptor_pool(pool);
            self.ready_pools.push(pool);
            result?;
        }
        Ok(())
    }

    /// Destroys every pool in both buckets.
    ///
    /// The allocator stays usable; the next allocation creates a new pool at
    /// the current size.
    pub fn destroy_all(&mut self) {
        let count = self.ready_pools.len() + self.full_pools.len();
        for pool in self.ready_pools.drain(..).chain(self.full_pools.drain(..)) {
            self.device.destroy_descriptor_pool(pool);
        }
        self.initialized = false;

        if count > 0 {
            debug!("Destroyed {} descriptor pool(s)", count);
        }
    }

    #[inline]
    pub fn ready_pool_count(&self) -> usize {
        self.ready_pools.len()
    }

    #[inline]
    pub fn full_pool_count(&self) -> usize {
        self.full_pools.len()
    }

    /// Capacity, in sets, of the next pool this allocator creates.
    #[inline]
    pub fn sets_per_pool(&self) -> u32 {
        self.sets_per_pool
    }

    /// Hard ceiling on [`DescriptorAllocator::sets_per_pool`].
    #[inline]
    pub fn max_sets_per_pool(&self) -> u32 {
        self.max_sets_per_pool
    }

    fn get_pool(&mut self) -> RendererResult<vk::DescriptorPool> {
        match self.ready_pools.pop() {
            Some(pool) => Ok(pool),
            None => self.create_pool(self.sets_per_pool),
        }
    }

    fn create_pool(&self, max_sets: u32) -> RendererResult<vk::DescriptorPool> {
        let pool = self.device.create_descriptor_pool(&self.ratios, max_sets)?;
        debug!("Created descriptor pool {:?} ({} sets)", pool, max_sets);
        Ok(pool)
    }

    fn grow(&mut self) {
        // Rounds up and adds at least one set so small pools still grow.
        let grown = (self.sets_per_pool as f32 * self.growth_factor).ceil() as u32;
        let next = grown
            .max(self.sets_per_pool.saturating_add(1))
            .min(self.max_sets_per_pool);

        if next == self.sets_per_pool {
            warn!(
                "Descriptor pool exhausted at the {} set ceiling",
                self.max_sets_per_pool
            );
        } else {
            info!(
                "Descriptor pool exhausted; growing pools from {} to {} sets",
                self.sets_per_pool, next
            );
        }
        self.sets_per_pool = next;
    }
}

impl Drop for DescriptorAllocator {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use inflight_core::{DescriptorKind, DescriptorRatio};
    use inflight_rhi::dummy::{DeviceCall, DummyDevice};
    use rstest::rstest;

    fn config(sets_per_pool: u32, max_sets_per_pool: u32) -> DescriptorConfig {
        DescriptorConfig {
            sets_per_pool,
            initial_pools: 0,
            max_sets_per_pool,
            growth_factor: 1.5,
            ratios: vec![DescriptorRatio::new(DescriptorKind::UniformBuffer, 1.0)],
        }
    }

    fn layout() -> vk::DescriptorSetLayout {
        vk::DescriptorSetLayout::null()
    }

    #[test]
    fn test_exhausted_pool_moves_to_full_bucket() {
        let device = Arc::new(DummyDevice::new());
        let mut allocator = DescriptorAllocator::new(device.clone(), &config(4, 4096));

        for _ in 0..5 {
            allocator.allocate(layout()).unwrap();
        }

        let created = device.count_calls(|call| matches!(call, DeviceCall::CreateDescriptorPool { .. }));
        assert_eq!(created, 2);
        assert_eq!(allocator.full_pool_count(), 1);
        assert_eq!(allocator.ready_pool_count(), 1);
        assert_eq!(allocator.sets_per_pool(), 6);

        allocator.reset_all().unwrap();
        assert_eq!(allocator.ready_pool_count(), 2);
        assert_eq!(allocator.full_pool_count(), 0);
    }

    #[test]
    fn test_pool_serves_many_allocations() {
        let device = Arc::new(DummyDevice::new());
        let mut allocator = DescriptorAllocator::new(device.clone(), &config(8, 4096));

        for _ in 0..8 {
            allocator.allocate(layout()).unwrap();
        }
        let created = device.count_calls(|call| matches!(call, DeviceCall::CreateDescriptorPool { .. }));
        assert_eq!(created, 1);
        assert_eq!(allocator.ready_pool_count(), 1);
    }

    #[test]
    fn test_reset_all_resets_ready_pools_too() {
        let device = Arc::new(DummyDevice::new());
        let mut allocator = DescriptorAllocator::new(device.clone(), &config(2, 4096));

        allocator.allocate(layout()).unwrap();
        allocator.reset_all().unwrap();

        let resets = device.count_calls(|call| matches!(call, DeviceCall::ResetDescriptorPool(_)));
        assert_eq!(resets, 1);

        // The reset pool has its full capacity again.
        allocator.allocate(layout()).unwrap();
        allocator.allocate(layout()).unwrap();
        let created = device.count_calls(|call| matches!(call, DeviceCall::CreateDescriptorPool { .. }));
        assert_eq!(created, 1);
    }

    #[rstest]
    #[case(1, 1)]
    #[case(2, 10)]
    #[case(4, 4096)]
    #[case(100, 120)]
    fn test_capacity_never_shrinks_or_exceeds_ceiling(#[case] initial: u32, #[case] ceiling: u32) {
        let device = Arc::new(DummyDevice::new());
        let mut allocator = DescriptorAllocator::new(device, &config(initial, ceiling));

        let mut previous = allocator.sets_per_pool();
        for frame in 0..6 {
            for _ in 0..(initial * 3) {
                allocator.allocate(layout()).unwrap();
                let current = allocator.sets_per_pool();
                assert!(current >= previous);
                assert!(current <= ceiling);
                previous = current;
            }
            if frame % 2 == 1 {
                allocator.reset_all().unwrap();
            }
        }
    }

    #[test]
    fn test_single_set_pools_still_grow() {
        let device = Arc::new(DummyDevice::new());
        let mut allocator = DescriptorAllocator::new(device.clone(), &config(1, 4096));

        allocator.allocate(layout()).unwrap();
        allocator.allocate(layout()).unwrap();
        assert_eq!(allocator.sets_per_pool(), 2);

        allocator.allocate(layout()).unwrap();
        allocator.allocate(layout()).unwrap();
        assert_eq!(allocator.sets_per_pool(), 3);

        let sizes: Vec<u32> = device
            .calls()
            .iter()
            .filter_map(|call| match call {
                DeviceCall::CreateDescriptorPool { max_sets, .. } => Some(*max_sets),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![1, 2, 3]);
    }

    #[test]
    fn test_failed_retry_is_fatal_after_one_cycle() {
        let device = Arc::new(DummyDevice::new());
        device.fragment_descriptor_pools(true);
        let mut allocator = DescriptorAllocator::new(device.clone(), &config(4, 4096));

        let err = allocator.allocate(layout()).unwrap_err();
        assert!(matches!(err, RendererError::DescriptorExhausted { sets_per_pool: 6 }));

        let created = device.count_calls(|call| matches!(call, DeviceCall::CreateDescriptorPool { .. }));
        assert_eq!(created, 2);
        assert_eq!(allocator.full_pool_count(), 2);

        device.fragment_descriptor_pools(false);
        allocator.reset_all().unwrap();
        assert!(allocator.allocate(layout()).is_ok());
    }

    #[test]
    fn test_double_init_is_rejected() {
        let device = Arc::new(DummyDevice::new());
        let mut allocator = DescriptorAllocator::new(device.clone(), &config(4, 4096));
        let ratios = [PoolSizeRatio::new(vk::DescriptorType::UNIFORM_BUFFER, 3.0)];

        allocator.init_pools(&ratios, 2, 16).unwrap();
        assert_eq!(allocator.ready_pool_count(), 2);
        assert_eq!(allocator.sets_per_pool(), 16);

        let err = allocator.init_pools(&ratios, 2, 16).unwrap_err();
        assert!(matches!(err, RendererError::InvalidState(_)));
        assert_eq!(allocator.ready_pool_count(), 2);

        allocator.destroy_all();
        assert!(allocator.init_pools(&ratios, 1, 16).is_ok());
    }

    #[test]
    fn test_drop_destroys_every_pool() {
        let device = Arc::new(DummyDevice::new());
        {
            let mut allocator = DescriptorAllocator::new(device.clone(), &config(1, 4096));
            for _ in 0..3 {
                allocator.allocate(layout()).unwrap();
            }
            assert!(device.live_handles() > 0);
        }
        assert_eq!(device.live_handles(), 0);
        assert_eq!(device.double_destroys(), 0);
    }
}
