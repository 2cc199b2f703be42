//! Vulkan logical device.
//!
//! [`VulkanDevice`] creates the logical device on an adapter chosen by the
//! caller, resolves the extension entry points once into a
//! [`DeviceExtensions`] table, and implements [`GraphicsDevice`] on top of
//! `ash`. Host-visible buffers are sub-allocated with gpu-allocator.

use std::collections::HashMap;
use std::ffi::CString;
use std::time::Duration;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::command::GpuCommand;
use crate::descriptor::{DescriptorWrite, PoolSizeRatio, pool_sizes};
use crate::device::{GraphicsDevice, Submission, write_range};
use crate::error::{RhiError, RhiResult};
use crate::pipeline::{FixedFunctionState, PipelineConfig};

/// Required device extensions.
pub const DEVICE_EXTENSIONS: &[&std::ffi::CStr] =
    &[ash::khr::swapchain::NAME, ash::khr::dynamic_rendering::NAME];

/// Extension entry points, loaded once when the device is created.
pub struct DeviceExtensions {
    pub swapchain: ash::khr::swapchain::Device,
    pub dynamic_rendering: ash::khr::dynamic_rendering::Device,
}

impl DeviceExtensions {
    fn load(instance: &ash::Instance, device: &ash::Device) -> Self {
        Self {
            swapchain: ash::khr::swapchain::Device::new(instance, device),
            dynamic_rendering: ash::khr::dynamic_rendering::Device::new(instance, device),
        }
    }
}

/// Vulkan logical device wrapper.
///
/// # Thread Safety
///
/// The device is shared through `Arc`. The allocator and the buffer table are
/// each behind a `Mutex`.
pub struct VulkanDevice {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    extensions: DeviceExtensions,
    graphics_queue: vk::Queue,
    graphics_family: u32,
    /// `None` only while the device is being dropped.
    allocator: Mutex<Option<Allocator>>,
    buffers: Mutex<HashMap<vk::Buffer, Allocation>>,
}

impl VulkanDevice {
    /// Creates a logical device on `physical_device`.
    ///
    /// This function creates a Vulkan logical device with:
    /// - Required extensions (swapchain, dynamic rendering)
    /// - Vulkan 1.2 buffer device address
    /// - Vulkan 1.3 dynamic rendering and synchronization2
    ///
    /// # Arguments
    ///
    /// * `instance` - The Vulkan instance the adapter belongs to
    /// * `physical_device` - The adapter selected by the caller
    /// * `graphics_family` - Queue family used for both rendering and presentation
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Device creation fails
    /// - Allocator initialization fails
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_family: u32,
    ) -> RhiResult<Self> {
        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_family)
            .queue_priorities(&queue_priorities)];

        let mut features_1_2 = vk::PhysicalDeviceVulkan12Features::default().buffer_device_address(true);
        let mut features_1_3 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);

        let extension_names: Vec<*const std::ffi::c_char> =
            DEVICE_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features_1_2)
            .push_next(&mut features_1_3);

        let device = unsafe { instance.create_device(physical_device, &create_info, None)? };

        info!(
            "Logical device created with {} extension(s)",
            DEVICE_EXTENSIONS.len()
        );

        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        debug!("Graphics queue retrieved from family {}", graphics_family);

        let extensions = DeviceExtensions::load(instance, &device);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        });
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };

        info!("GPU memory allocator initialized");

        Ok(Self {
            device,
            physical_device,
            extensions,
            graphics_queue,
            graphics_family,
            allocator: Mutex::new(Some(allocator)),
            buffers: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the Vulkan logical device handle.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Returns the extension entry point table.
    #[inline]
    pub fn extensions(&self) -> &DeviceExtensions {
        &self.extensions
    }

    /// Returns the queue used for both submission and presentation.
    #[inline]
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    fn record_transition(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        aspect_mask: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let masks = transition_masks(old_layout, new_layout);

        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect_mask)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .src_access_mask(masks.src_access)
            .dst_access_mask(masks.dst_access);

        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                masks.src_stage,
                masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    fn record_begin_rendering(
        &self,
        cmd: vk::CommandBuffer,
        color: &crate::device::RenderTarget,
        depth: Option<&crate::device::DepthAttachment>,
        clear_color: [f32; 4],
    ) {
        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(color.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            });

        // Reversed-Z: the far plane is 0.0.
        let depth_attachment = depth.map(|depth| {
            vk::RenderingAttachmentInfo::default()
                .image_view(depth.view)
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 0.0,
                        stencil: 0,
                    },
                })
        });

        let color_attachments = [color_attachment];
        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: color.extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments);

        if let Some(depth_attachment) = depth_attachment.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth_attachment);
        }

        unsafe {
            self.extensions
                .dynamic_rendering
                .cmd_begin_rendering(cmd, &rendering_info);
        }
    }
}

/// Stage and access masks for an image layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransitionMasks {
    pub src_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
}

pub(crate) fn transition_masks(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> TransitionMasks {
    let (src_stage, src_access, dst_stage, dst_access) = match (old_layout, new_layout) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL) => (
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL) => (
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        (vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR) => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::AccessFlags::empty(),
        ),
        _ => {
            warn!(
                "Unhandled layout transition: {:?} -> {:?}",
                old_layout, new_layout
            );
            (
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            )
        }
    };

    TransitionMasks {
        src_stage,
        src_access,
        dst_stage,
        dst_access,
    }
}

impl GraphicsDevice for VulkanDevice {
    fn graphics_queue_family(&self) -> u32 {
        self.graphics_family
    }

    fn wait_idle(&self) -> RhiResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device.create_fence(&create_info, None)? })
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> RhiResult<()> {
        let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_for_fences(&[fence], true, nanos) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RhiError::FenceTimeout(timeout)),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> RhiResult<()> {
        unsafe { self.device.reset_fences(&[fence])? };
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool> {
        Ok(unsafe { self.device.get_fence_status(fence)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.device.create_semaphore(&create_info, None)? })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    // =========================================================================
    // Command Recording
    // =========================================================================

    fn create_command_pool(&self, queue_family: u32) -> RhiResult<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        Ok(unsafe { self.device.create_command_pool(&create_info, None)? })
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> RhiResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info)? };
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| RhiError::InvalidHandle("driver returned no command buffer".into()))
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> RhiResult<()> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())?
        };
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info)? };
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer)? };
        Ok(())
    }

    fn record(&self, cmd: vk::CommandBuffer, command: &GpuCommand<'_>) {
        match *command {
            GpuCommand::TransitionImage {
                image,
                aspect,
                old_layout,
                new_layout,
            } => self.record_transition(cmd, image, aspect, old_layout, new_layout),
            GpuCommand::BeginRendering {
                color,
                depth,
                clear_color,
            } => self.record_begin_rendering(cmd, color, depth, clear_color),
            GpuCommand::EndRendering => unsafe {
                self.extensions.dynamic_rendering.cmd_end_rendering(cmd);
            },
            GpuCommand::SetViewportScissor { extent } => {
                let viewport = vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: extent.width as f32,
                    height: extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                };
                let scissor = vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                };
                unsafe {
                    self.device.cmd_set_viewport(cmd, 0, &[viewport]);
                    self.device.cmd_set_scissor(cmd, 0, &[scissor]);
                }
            }
            GpuCommand::BindPipeline { pipeline } => unsafe {
                self.device
                    .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
            },
            GpuCommand::BindDescriptorSets {
                layout,
                first_set,
                sets,
            } => unsafe {
                self.device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    layout,
                    first_set,
                    sets,
                    &[],
                );
            },
            GpuCommand::PushConstants {
                layout,
                stages,
                offset,
                data,
            } => unsafe {
                self.device
                    .cmd_push_constants(cmd, layout, stages, offset, data);
            },
            GpuCommand::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            } => unsafe {
                self.device
                    .cmd_bind_index_buffer(cmd, buffer, offset, index_type);
            },
            GpuCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => unsafe {
                self.device.cmd_draw(
                    cmd,
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                );
            },
            GpuCommand::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => unsafe {
                self.device.cmd_draw_indexed(
                    cmd,
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                );
            },
        }
    }

    fn submit(&self, submission: &Submission) -> RhiResult<()> {
        let wait_semaphores = [submission.wait_semaphore];
        let wait_stages = [submission.wait_stage];
        let command_buffers = [submission.command_buffer];
        let signal_semaphores = [submission.signal_semaphore];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], submission.fence)?
        };
        Ok(())
    }

    // =========================================================================
    // Descriptors
    // =========================================================================

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> RhiResult<vk::DescriptorSetLayout> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        Ok(unsafe { self.device.create_descriptor_set_layout(&create_info, None)? })
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(
        &self,
        ratios: &[PoolSizeRatio],
        max_sets: u32,
    ) -> RhiResult<vk::DescriptorPool> {
        let sizes = pool_sizes(ratios, max_sets);
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(&sizes);
        Ok(unsafe { self.device.create_descriptor_pool(&create_info, None)? })
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> RhiResult<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info)? };
        sets.into_iter()
            .next()
            .ok_or_else(|| RhiError::InvalidHandle("driver returned no descriptor set".into()))
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RhiResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())?
        };
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        // The info structs must outlive the write structs that point at them.
        let buffer_infos: Vec<[vk::DescriptorBufferInfo; 1]> = writes
            .iter()
            .map(|write| match *write {
                DescriptorWrite::Buffer {
                    buffer,
                    offset,
                    range,
                    ..
                } => [vk::DescriptorBufferInfo::default()
                    .buffer(buffer)
                    .offset(offset)
                    .range(range)],
                DescriptorWrite::Image { .. } => [vk::DescriptorBufferInfo::default()],
            })
            .collect();
        let image_infos: Vec<[vk::DescriptorImageInfo; 1]> = writes
            .iter()
            .map(|write| match *write {
                DescriptorWrite::Image {
                    sampler,
                    view,
                    layout,
                    ..
                } => [vk::DescriptorImageInfo::default()
                    .sampler(sampler)
                    .image_view(view)
                    .image_layout(layout)],
                DescriptorWrite::Buffer { .. } => [vk::DescriptorImageInfo::default()],
            })
            .collect();

        let vk_writes: Vec<vk::WriteDescriptorSet<'_>> = writes
            .iter()
            .enumerate()
            .map(|(i, write)| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(write.binding());
                match *write {
                    DescriptorWrite::Buffer { ty, .. } => {
                        base.descriptor_type(ty).buffer_info(&buffer_infos[i])
                    }
                    DescriptorWrite::Image { ty, .. } => {
                        base.descriptor_type(ty).image_info(&image_infos[i])
                    }
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    // =========================================================================
    // Pipelines
    // =========================================================================

    fn create_graphics_pipeline(
        &self,
        config: &PipelineConfig,
        state: &FixedFunctionState,
    ) -> RhiResult<(vk::Pipeline, vk::PipelineLayout)> {
        config.validate()?;

        let push_constant_ranges = [state.push_constant_range()];
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&config.binding_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let layout = unsafe { self.device.create_pipeline_layout(&layout_info, None)? };

        match self.build_pipeline(config, state, layout) {
            Ok(pipeline) => {
                info!("Graphics pipeline '{}' created", config.name);
                Ok((pipeline, layout))
            }
            Err(e) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                Err(e)
            }
        }
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline, layout: vk::PipelineLayout) {
        unsafe {
            self.device.destroy_pipeline(pipeline, None);
            self.device.destroy_pipeline_layout(layout, None);
        }
    }

    // =========================================================================
    // Buffers
    // =========================================================================

    fn create_host_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> RhiResult<vk::Buffer> {
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&create_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = {
            let mut allocator = self.allocator.lock();
            let Some(allocator) = allocator.as_mut() else {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(RhiError::InvalidHandle("allocator already shut down".into()));
            };
            allocator.allocate(&AllocationCreateDesc {
                name: "host buffer",
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
        };
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            self.free_allocation(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        debug!("Created host buffer {:?} ({} bytes)", buffer, size);
        self.buffers.lock().insert(buffer, allocation);
        Ok(buffer)
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> RhiResult<()> {
        let mut buffers = self.buffers.lock();
        let allocation = buffers
            .get_mut(&buffer)
            .ok_or_else(|| RhiError::InvalidHandle(format!("unknown buffer {buffer:?}")))?;
        let mapped = allocation
            .mapped_slice_mut()
            .ok_or_else(|| RhiError::InvalidHandle(format!("buffer {buffer:?} is not mapped")))?;

        let range = write_range(buffer, offset, data.len(), mapped.len())?;
        mapped[range].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let allocation = self.buffers.lock().remove(&buffer);
        unsafe { self.device.destroy_buffer(buffer, None) };
        if let Some(allocation) = allocation {
            self.free_allocation(allocation);
        }
    }
}

impl VulkanDevice {
    fn free_allocation(&self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                error!("Failed to free buffer allocation: {}", e);
            }
        }
    }

    fn build_pipeline(
        &self,
        config: &PipelineConfig,
        state: &FixedFunctionState,
        layout: vk::PipelineLayout,
    ) -> RhiResult<vk::Pipeline> {
        let vertex_entry = CString::new(config.vertex_stage.entry_point.as_str())
            .map_err(|e| RhiError::PipelineError(e.to_string()))?;
        let fragment_entry = CString::new(config.fragment_stage.entry_point.as_str())
            .map_err(|e| RhiError::PipelineError(e.to_string()))?;

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(config.vertex_stage.module)
                .name(&vertex_entry),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(config.fragment_stage.module)
                .name(&fragment_entry),
        ];

        // Vertices are pulled through the buffer device address.
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default();

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(state.topology)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(state.polygon_mode)
            .line_width(1.0)
            .cull_mode(state.cull_mode)
            .front_face(state.front_face);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(state.samples)
            .min_sample_shading(1.0);

        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(state.depth_test_enable)
            .depth_write_enable(state.depth_write_enable)
            .depth_compare_op(state.depth_compare_op)
            .depth_bounds_test_enable(false)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0)
            .stencil_test_enable(false);

        let color_blend_attachments = [state.color_blend.to_vk()];
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&state.dynamic_states);

        let color_formats = [config.color_format];
        let mut rendering_info =
            vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);
        if let Some(depth_format) = config.depth_format {
            rendering_info = rendering_info.depth_attachment_format(depth_format);
        }

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, result)| result)?
        };
        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| RhiError::PipelineError(format!("no pipeline returned for '{}'", config.name)))
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            error!("Failed to wait for device idle during drop: {:?}", e);
        }

        let leaked: Vec<(vk::Buffer, Allocation)> = self.buffers.lock().drain().collect();
        if !leaked.is_empty() {
            warn!("{} host buffer(s) still alive at device drop", leaked.len());
        }
        for (buffer, allocation) in leaked {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free_allocation(allocation);
        }

        // The allocator must go before the device it allocates from.
        drop(self.allocator.lock().take());

        unsafe { self.device.destroy_device(None) };
        info!("Logical device destroyed");
    }
}
