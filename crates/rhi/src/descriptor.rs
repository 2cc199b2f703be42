//! Descriptor set management for shader resource binding.
//!
//! This module provides:
//! - [`DescriptorSetLayout`] defines the layout of shader bindings
//! - [`PoolSizeRatio`] describes the descriptor mix a pool reserves
//! - [`DescriptorWriter`] batches resource writes into one set update
//! - [`DescriptorBindingBuilder`] shortcuts for common layout bindings
//!
//! Pools themselves are managed by the renderer's growable allocator; this
//! module only describes how they are sized.
//!
//! # Example
//!
//! ```no_run
//! use ash::vk;
//! use inflight_rhi::device::DeviceRef;
//! use inflight_rhi::descriptor::{DescriptorBindingBuilder, DescriptorSetLayout, DescriptorWriter};
//!
//! # fn example(device: DeviceRef, set: vk::DescriptorSet, buffer: vk::Buffer) -> Result<(), inflight_rhi::RhiError> {
//! let binding = DescriptorBindingBuilder::uniform_buffer(
//!     0,
//!     vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
//! );
//! let layout = DescriptorSetLayout::new(device.clone(), &[binding])?;
//!
//! let mut writer = DescriptorWriter::new();
//! writer.write_buffer(0, buffer, 256, 0, vk::DescriptorType::UNIFORM_BUFFER);
//! writer.update(device.as_ref(), set);
//! # Ok(())
//! # }
//! ```

use ash::vk;
use inflight_core::{DescriptorKind, DescriptorRatio};
use tracing::debug;

use crate::device::{DeviceRef, GraphicsDevice};
use crate::error::RhiResult;

/// Maps a configured descriptor kind to its Vulkan type.
pub fn descriptor_type(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::Sampler => vk::DescriptorType::SAMPLER,
        DescriptorKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        DescriptorKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
    }
}

/// Relative number of descriptors of one type reserved per set in a pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolSizeRatio {
    pub ty: vk::DescriptorType,
    pub ratio: f32,
}

impl PoolSizeRatio {
    pub const fn new(ty: vk::DescriptorType, ratio: f32) -> Self {
        Self { ty, ratio }
    }
}

impl From<DescriptorRatio> for PoolSizeRatio {
    fn from(ratio: DescriptorRatio) -> Self {
        Self::new(descriptor_type(ratio.kind), ratio.ratio)
    }
}

/// Scales `ratios` by `max_sets` into per-type pool sizes.
///
/// Every type gets room for at least one descriptor.
pub fn pool_sizes(ratios: &[PoolSizeRatio], max_sets: u32) -> Vec<vk::DescriptorPoolSize> {
    ratios
        .iter()
        .map(|ratio| {
            let count = (ratio.ratio * max_sets as f32) as u32;
            vk::DescriptorPoolSize::default()
                .ty(ratio.ty)
                .descriptor_count(count.max(1))
        })
        .collect()
}

/// Descriptor set layout wrapper.
///
/// A layout defines the types and binding points of the resources a shader
/// reads. Pipelines list the layouts of every set they bind.
pub struct DescriptorSetLayout {
    device: DeviceRef,
    layout: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    /// Creates a new descriptor set layout.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `bindings` - Slice of binding descriptions
    ///
    /// # Errors
    ///
    /// Returns an error if layout creation fails.
    pub fn new(device: DeviceRef, bindings: &[vk::DescriptorSetLayoutBinding<'_>]) -> RhiResult<Self> {
        let layout = device.create_descriptor_set_layout(bindings)?;

        debug!(
            "Created descriptor set layout {:?} with {} binding(s)",
            layout,
            bindings.len()
        );

        Ok(Self { device, layout })
    }

    /// Returns the raw layout handle.
    #[inline]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.device.destroy_descriptor_set_layout(self.layout);
        debug!("Destroyed descriptor set layout {:?}", self.layout);
    }
}

/// One pending write into a descriptor set binding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DescriptorWrite {
    Buffer {
        binding: u32,
        ty: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    Image {
        binding: u32,
        ty: vk::DescriptorType,
        sampler: vk::Sampler,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
}

impl DescriptorWrite {
    #[inline]
    pub fn binding(&self) -> u32 {
        match self {
            DescriptorWrite::Buffer { binding, .. } | DescriptorWrite::Image { binding, .. } => {
                *binding
            }
        }
    }
}

/// Accumulates descriptor writes and applies them to a set in one call.
#[derive(Debug, Default)]
pub struct DescriptorWriter {
    writes: Vec<DescriptorWrite>,
}

impl DescriptorWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a buffer binding.
    pub fn write_buffer(
        &mut self,
        binding: u32,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
        offset: vk::DeviceSize,
        ty: vk::DescriptorType,
    ) -> &mut Self {
        self.writes.push(DescriptorWrite::Buffer {
            binding,
            ty,
            buffer,
            offset,
            range,
        });
        self
    }

    /// Queues an image binding.
    pub fn write_image(
        &mut self,
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
        ty: vk::DescriptorType,
    ) -> &mut Self {
        self.writes.push(DescriptorWrite::Image {
            binding,
            ty,
            sampler,
            view,
            layout,
        });
        self
    }

    /// Pending writes, in the order they were queued.
    pub fn writes(&self) -> &[DescriptorWrite] {
        &self.writes
    }

    /// Drops all pending writes so the writer can be reused.
    pub fn clear(&mut self) {
        self.writes.clear();
    }

    /// Applies every pending write to `set`. Pending writes are kept.
    pub fn update(&self, device: &dyn GraphicsDevice, set: vk::DescriptorSet) {
        if self.writes.is_empty() {
            return;
        }
        device.update_descriptor_set(set, &self.writes);
        debug!("Updated descriptor set {:?} ({} write(s))", set, self.writes.len());
    }
}

/// Builder for common descriptor set layout bindings.
pub struct DescriptorBindingBuilder;

impl DescriptorBindingBuilder {
    /// Single descriptor of type `ty` at `binding`.
    #[inline]
    pub fn binding(
        binding: u32,
        ty: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(ty)
            .descriptor_count(1)
            .stage_flags(stage_flags)
    }

    #[inline]
    pub fn uniform_buffer(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        Self::binding(binding, vk::DescriptorType::UNIFORM_BUFFER, stage_flags)
    }

    #[inline]
    pub fn storage_buffer(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        Self::binding(binding, vk::DescriptorType::STORAGE_BUFFER, stage_flags)
    }

    #[inline]
    pub fn combined_image_sampler(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        Self::binding(binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stage_flags)
    }

    #[inline]
    pub fn storage_image(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        Self::binding(binding, vk::DescriptorType::STORAGE_IMAGE, stage_flags)
    }
}
