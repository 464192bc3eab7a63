//! Typed command pools and command buffers.
//!
//! Command buffers are parameterized over a [`QueueRole`] marker so the
//! recording API only offers operations the underlying queue can run:
//! draws on raster buffers, dispatches on compute buffers, trace and
//! build operations on ray-trace buffers.

use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::memory::{Buffer, Image2D};
use crate::pipeline::{ComputePipeline, RasterPipeline};
use crate::sync::Fence;
use ash::vk;
use std::marker::PhantomData;
use std::sync::Arc;

mod sealed {
    pub trait Sealed {}
}

/// Marker trait tying a command pool to the queue it submits on.
pub trait QueueRole: sealed::Sealed + 'static {
    /// Role name for logging.
    const NAME: &'static str;

    /// Queue family the role records for.
    fn family(device: &Device) -> u32;

    /// Queue the role submits on.
    fn queue(device: &Device) -> vk::Queue;
}

/// Rasterization work on the graphics queue.
pub enum Raster {}

/// Compute dispatches on the compute queue.
pub enum Compute {}

/// Ray tracing work; records on the graphics family.
pub enum RayTrace {}

/// Transfer work on the transfer queue.
pub enum Transfer {}

impl sealed::Sealed for Raster {}
impl sealed::Sealed for Compute {}
impl sealed::Sealed for RayTrace {}
impl sealed::Sealed for Transfer {}

impl QueueRole for Raster {
    const NAME: &'static str = "raster";

    fn family(device: &Device) -> u32 {
        device.queue_families().graphics
    }

    fn queue(device: &Device) -> vk::Queue {
        device.graphics_queue()
    }
}

impl QueueRole for Compute {
    const NAME: &'static str = "compute";

    fn family(device: &Device) -> u32 {
        device.queue_families().compute
    }

    fn queue(device: &Device) -> vk::Queue {
        device.compute_queue()
    }
}

impl QueueRole for RayTrace {
    const NAME: &'static str = "ray-trace";

    fn family(device: &Device) -> u32 {
        device.queue_families().graphics
    }

    fn queue(device: &Device) -> vk::Queue {
        device.graphics_queue()
    }
}

impl QueueRole for Transfer {
    const NAME: &'static str = "transfer";

    fn family(device: &Device) -> u32 {
        device.queue_families().transfer
    }

    fn queue(device: &Device) -> vk::Queue {
        device.transfer_queue()
    }
}

/// Command pool for one queue role, with resettable buffers.
pub struct CommandPool<R: QueueRole> {
    device: Arc<ash::Device>,
    handle: vk::CommandPool,
    queue: vk::Queue,
    family: u32,
    _role: PhantomData<R>,
}

impl<R: QueueRole> CommandPool<R> {
    /// Create a pool on the role's queue family.
    ///
    /// # Safety
    /// The device must be valid.
    pub(crate) unsafe fn new(device: &Device) -> Result<Self> {
        let family = R::family(device);
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let handle = device.handle().create_command_pool(&info, None)?;
        tracing::debug!("Created {} command pool on family {family}", R::NAME);

        Ok(Self {
            device: device.shared(),
            handle,
            queue: R::queue(device),
            family,
            _role: PhantomData,
        })
    }

    /// Get the raw pool handle.
    #[must_use]
    pub const fn handle(&self) -> vk::CommandPool {
        self.handle
    }

    /// Queue family this pool records for.
    #[must_use]
    pub const fn family(&self) -> u32 {
        self.family
    }

    /// Allocate one primary command buffer.
    pub fn allocate(&self) -> Result<CommandBuffer<R>> {
        Ok(self
            .allocate_level(vk::CommandBufferLevel::PRIMARY, 1)?
            .remove(0))
    }

    /// Allocate `count` primary command buffers.
    pub fn allocate_many(&self, count: u32) -> Result<Vec<CommandBuffer<R>>> {
        self.allocate_level(vk::CommandBufferLevel::PRIMARY, count)
    }

    /// Allocate one secondary command buffer.
    pub fn allocate_secondary(&self) -> Result<CommandBuffer<R>> {
        Ok(self
            .allocate_level(vk::CommandBufferLevel::SECONDARY, 1)?
            .remove(0))
    }

    fn allocate_level(
        &self,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<CommandBuffer<R>>> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.handle)
            .level(level)
            .command_buffer_count(count);

        let handles = unsafe { self.device.allocate_command_buffers(&info) }?;

        Ok(handles
            .into_iter()
            .map(|handle| CommandBuffer {
                device: Arc::clone(&self.device),
                pool: self.handle,
                queue: self.queue,
                handle,
                _role: PhantomData,
            })
            .collect())
    }
}

impl<R: QueueRole> Drop for CommandPool<R> {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.handle, None);
        }
    }
}

/// A primary or secondary command buffer tied to one queue role.
pub struct CommandBuffer<R: QueueRole> {
    device: Arc<ash::Device>,
    pool: vk::CommandPool,
    queue: vk::Queue,
    handle: vk::CommandBuffer,
    _role: PhantomData<R>,
}

impl<R: QueueRole> CommandBuffer<R> {
    /// Get the raw command buffer handle.
    #[must_use]
    pub const fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// Reset the buffer so it can be recorded again.
    ///
    /// # Safety
    /// The buffer must not be pending execution.
    pub unsafe fn reset(&self) -> Result<()> {
        self.device
            .reset_command_buffer(self.handle, vk::CommandBufferResetFlags::empty())?;
        Ok(())
    }

    /// Reset, then record `f` between begin and end.
    ///
    /// Calling this twice leaves only the second recording.
    ///
    /// # Safety
    /// The buffer must not be pending execution.
    pub unsafe fn record<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Self) -> Result<()>,
    {
        self.reset()?;
        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);
        self.device.begin_command_buffer(self.handle, &begin)?;
        f(self)?;
        self.device.end_command_buffer(self.handle)?;
        Ok(())
    }

    /// Record `f` as a one-time submission, run it on the role's queue
    /// and block until it completes.
    ///
    /// # Safety
    /// The buffer must not be pending execution.
    pub unsafe fn execute_immediately<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Self) -> Result<()>,
    {
        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        self.device.begin_command_buffer(self.handle, &begin)?;
        f(self)?;
        self.device.end_command_buffer(self.handle)?;

        let submit_info =
            vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&self.handle));
        self.submit_and_wait(&submit_info)?;
        self.reset()
    }

    /// Submit the recorded buffer.
    ///
    /// Without a fence the call creates a temporary one and blocks until
    /// the work completes, so the buffer is immediately re-recordable.
    ///
    /// # Safety
    /// The buffer must contain a finished recording.
    pub unsafe fn submit(
        &self,
        waits: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signals: &[vk::Semaphore],
        fence: Option<&Fence>,
    ) -> Result<()> {
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(waits)
            .wait_dst_stage_mask(wait_stages)
            .signal_semaphores(signals)
            .command_buffers(std::slice::from_ref(&self.handle));

        match fence {
            Some(fence) => {
                self.device
                    .queue_submit(self.queue, std::slice::from_ref(&submit_info), fence.handle())?;
                Ok(())
            }
            None => self.submit_and_wait(&submit_info),
        }
    }

    unsafe fn submit_and_wait(&self, submit_info: &vk::SubmitInfo<'_>) -> Result<()> {
        let fence = self
            .device
            .create_fence(&vk::FenceCreateInfo::default(), None)?;

        let result = (|| -> Result<()> {
            self.device
                .queue_submit(self.queue, std::slice::from_ref(submit_info), fence)?;
            self.device.wait_for_fences(&[fence], true, u64::MAX)?;
            Ok(())
        })();

        self.device.destroy_fence(fence, None);
        result
    }

    /// Record a buffer-to-buffer copy.
    ///
    /// # Safety
    /// Must be called during recording.
    pub unsafe fn copy_buffer(&self, src: &Buffer, dst: &Buffer, size: u64) {
        let region = vk::BufferCopy::default().size(size);
        self.device
            .cmd_copy_buffer(self.handle, src.handle(), dst.handle(), &[region]);
    }

    /// Record a buffer-to-image copy covering the whole image.
    ///
    /// # Safety
    /// Must be called during recording; the image must be in
    /// `TRANSFER_DST_OPTIMAL` layout.
    pub unsafe fn copy_buffer_to_image(&self, src: &Buffer, image: &Image2D) {
        let extent = image.extent();
        let region = vk::BufferImageCopy::default()
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(image.aspect())
                    .layer_count(1),
            )
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });

        self.device.cmd_copy_buffer_to_image(
            self.handle,
            src.handle(),
            image.handle(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    }

    /// Record an image barrier with explicit access and stage masks.
    ///
    /// # Safety
    /// Must be called during recording.
    pub unsafe fn image_barrier(
        &self,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect)
                    .level_count(1)
                    .layer_count(1),
            )
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);

        self.device.cmd_pipeline_barrier(
            self.handle,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }

    /// Record a layout transition for one of the known layout pairs.
    ///
    /// Any pair outside the supported set is reported as
    /// [`GpuError::UnsupportedLayoutTransition`].
    ///
    /// # Safety
    /// Must be called during recording.
    pub unsafe fn transition_image(
        &self,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Result<()> {
        let masks = transition_masks(old_layout, new_layout)?;
        self.image_barrier(
            image,
            aspect,
            old_layout,
            new_layout,
            masks.src_access,
            masks.dst_access,
            masks.src_stage,
            masks.dst_stage,
        );
        Ok(())
    }
}

impl<R: QueueRole> Drop for CommandBuffer<R> {
    fn drop(&mut self) {
        unsafe {
            self.device.free_command_buffers(self.pool, &[self.handle]);
        }
    }
}

impl CommandBuffer<Raster> {
    /// Begin a render pass over `framebuffer`.
    ///
    /// # Safety
    /// Must be called during recording.
    pub unsafe fn begin_render_pass(
        &self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) {
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(clear_values);

        self.device
            .cmd_begin_render_pass(self.handle, &info, vk::SubpassContents::INLINE);
    }

    /// End the current render pass.
    ///
    /// # Safety
    /// Must be called during recording, inside a render pass.
    pub unsafe fn end_render_pass(&self) {
        self.device.cmd_end_render_pass(self.handle);
    }

    /// Bind a raster pipeline.
    ///
    /// # Safety
    /// Must be called during recording.
    pub unsafe fn bind_pipeline(&self, pipeline: &RasterPipeline) {
        self.device.cmd_bind_pipeline(
            self.handle,
            vk::PipelineBindPoint::GRAPHICS,
            pipeline.handle(),
        );
    }

    /// Bind descriptor sets for graphics.
    ///
    /// # Safety
    /// Must be called during recording.
    pub unsafe fn bind_descriptor_sets(
        &self,
        layout: vk::PipelineLayout,
        sets: &[vk::DescriptorSet],
    ) {
        self.device.cmd_bind_descriptor_sets(
            self.handle,
            vk::PipelineBindPoint::GRAPHICS,
            layout,
            0,
            sets,
            &[],
        );
    }

    /// Bind a vertex buffer to binding 0.
    ///
    /// # Safety
    /// Must be called during recording.
    pub unsafe fn bind_vertex_buffer(&self, buffer: &Buffer) {
        self.device
            .cmd_bind_vertex_buffers(self.handle, 0, &[buffer.handle()], &[0]);
    }

    /// Bind an index buffer.
    ///
    /// # Safety
    /// Must be called during recording.
    pub unsafe fn bind_index_buffer(&self, buffer: &Buffer, index_type: vk::IndexType) {
        self.device
            .cmd_bind_index_buffer(self.handle, buffer.handle(), 0, index_type);
    }

    /// Push constants through `layout`.
    ///
    /// # Safety
    /// Must be called during recording.
    pub unsafe fn push_constants(
        &self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        data: &[u8],
    ) {
        self.device
            .cmd_push_constants(self.handle, layout, stages, 0, data);
    }

    /// Set viewport and scissor to cover `extent`.
    ///
    /// # Safety
    /// Must be called during recording.
    pub unsafe fn set_viewport_scissor(&self, extent: vk::Extent2D) {
        let viewport = vk::Viewport::default()
            .width(extent.width as f32)
            .height(extent.height as f32)
            .max_depth(1.0);
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        self.device.cmd_set_viewport(self.handle, 0, &[viewport]);
        self.device.cmd_set_scissor(self.handle, 0, &[scissor]);
    }

    /// Record a non-indexed draw.
    ///
    /// # Safety
    /// Must be called during recording, inside a render pass.
    pub unsafe fn draw(&self, vertex_count: u32, instance_count: u32) {
        self.device
            .cmd_draw(self.handle, vertex_count, instance_count, 0, 0);
    }

    /// Record an indexed draw.
    ///
    /// # Safety
    /// Must be called during recording, inside a render pass.
    pub unsafe fn draw_indexed(&self, index_count: u32, instance_count: u32) {
        self.device
            .cmd_draw_indexed(self.handle, index_count, instance_count, 0, 0, 0);
    }
}

impl CommandBuffer<Compute> {
    /// Bind a compute pipeline.
    ///
    /// # Safety
    /// Must be called during recording.
    pub unsafe fn bind_pipeline(&self, pipeline: &ComputePipeline) {
        self.device.cmd_bind_pipeline(
            self.handle,
            vk::PipelineBindPoint::COMPUTE,
            pipeline.handle(),
        );
    }

    /// Bind descriptor sets for compute.
    ///
    /// # Safety
    /// Must be called during recording.
    pub unsafe fn bind_descriptor_sets(
        &self,
        layout: vk::PipelineLayout,
        sets: &[vk::DescriptorSet],
    ) {
        self.device.cmd_bind_descriptor_sets(
            self.handle,
            vk::PipelineBindPoint::COMPUTE,
            layout,
            0,
            sets,
            &[],
        );
    }

    /// Record a dispatch.
    ///
    /// # Safety
    /// Must be called during recording.
    pub unsafe fn dispatch(&self, x: u32, y: u32, z: u32) {
        self.device.cmd_dispatch(self.handle, x, y, z);
    }
}

impl CommandBuffer<RayTrace> {
    /// Bind descriptor sets for ray tracing.
    ///
    /// # Safety
    /// Must be called during recording.
    pub unsafe fn bind_descriptor_sets(
        &self,
        layout: vk::PipelineLayout,
        sets: &[vk::DescriptorSet],
    ) {
        self.device.cmd_bind_descriptor_sets(
            self.handle,
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            layout,
            0,
            sets,
            &[],
        );
    }
}

pub(crate) struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Access and stage masks for the supported layout transition pairs.
pub(crate) fn transition_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<TransitionMasks> {
    match (old, new) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => {
            Ok(TransitionMasks {
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::TRANSFER_WRITE,
                src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                dst_stage: vk::PipelineStageFlags::TRANSFER,
            })
        }
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
            Ok(TransitionMasks {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            })
        }
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => {
            Ok(TransitionMasks {
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            })
        }
        (old, new) => Err(GpuError::UnsupportedLayoutTransition { old, new }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_transition_pairs_resolve() {
        assert!(transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        )
        .is_ok());
        assert!(transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        )
        .is_ok());
        assert!(transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        )
        .is_ok());
    }

    #[test]
    fn unknown_transition_pair_is_reported() {
        let result = transition_masks(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert!(matches!(
            result,
            Err(GpuError::UnsupportedLayoutTransition { .. })
        ));
    }

    #[test]
    fn upload_transition_masks_order_transfer_before_sampling() {
        let to_dst = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_dst.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let to_read = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_read.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(to_read.dst_access, vk::AccessFlags::SHADER_READ);
    }
}
