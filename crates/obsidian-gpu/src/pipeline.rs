//! Shader modules, pipeline layouts, and pipeline builders.
//!
//! Builders resolve to built pipeline values in a single `build` call;
//! there is no deferred compilation behind accessors.

use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::CStr;
use std::sync::Arc;

const SHADER_ENTRY: &CStr = c"main";

/// SPIR-V shader module with its pipeline stage.
pub struct ShaderModule {
    device: Arc<ash::Device>,
    handle: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
}

impl ShaderModule {
    /// Create a module from SPIR-V words.
    pub fn new(device: &Device, spirv: &[u32], stage: vk::ShaderStageFlags) -> Result<Self> {
        if spirv.is_empty() {
            return Err(GpuError::InvalidState("empty SPIR-V module".to_string()));
        }
        let info = vk::ShaderModuleCreateInfo::default().code(spirv);
        let handle = unsafe { device.handle().create_shader_module(&info, None) }?;
        Ok(Self {
            device: device.shared(),
            handle,
            stage,
        })
    }

    /// Get the raw module handle.
    #[must_use]
    pub const fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    /// Stage the module was created for.
    #[must_use]
    pub const fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    /// Stage create info referencing this module, entry point `main`.
    #[must_use]
    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage)
            .module(self.handle)
            .name(SHADER_ENTRY)
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.handle, None);
        }
    }
}

/// Fluent builder for [`PipelineLayout`].
#[derive(Default)]
pub struct PipelineLayoutBuilder {
    set_layouts: Vec<vk::DescriptorSetLayout>,
    push_constant_ranges: Vec<vk::PushConstantRange>,
}

impl PipelineLayoutBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a descriptor set layout.
    #[must_use]
    pub fn set_layout(mut self, layout: vk::DescriptorSetLayout) -> Self {
        self.set_layouts.push(layout);
        self
    }

    /// Replace the full set layout list.
    #[must_use]
    pub fn set_layouts(mut self, layouts: &[vk::DescriptorSetLayout]) -> Self {
        self.set_layouts = layouts.to_vec();
        self
    }

    /// Append a push constant range.
    #[must_use]
    pub fn push_constant_range(mut self, stages: vk::ShaderStageFlags, size: u32) -> Self {
        self.push_constant_ranges.push(
            vk::PushConstantRange::default()
                .stage_flags(stages)
                .size(size),
        );
        self
    }

    /// Build the native layout.
    pub fn build(self, device: &Device) -> Result<PipelineLayout> {
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&self.set_layouts)
            .push_constant_ranges(&self.push_constant_ranges);
        let handle = unsafe { device.handle().create_pipeline_layout(&info, None) }?;
        Ok(PipelineLayout {
            device: device.shared(),
            handle,
        })
    }
}

/// Owned pipeline layout.
pub struct PipelineLayout {
    device: Arc<ash::Device>,
    handle: vk::PipelineLayout,
}

impl PipelineLayout {
    /// Get the raw layout handle.
    #[must_use]
    pub const fn handle(&self) -> vk::PipelineLayout {
        self.handle
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline_layout(self.handle, None);
        }
    }
}

/// States left dynamic on every raster pipeline; the rest is baked.
pub const RASTER_DYNAMIC_STATES: [vk::DynamicState; 9] = [
    vk::DynamicState::VIEWPORT,
    vk::DynamicState::SCISSOR,
    vk::DynamicState::LINE_WIDTH,
    vk::DynamicState::DEPTH_BIAS,
    vk::DynamicState::BLEND_CONSTANTS,
    vk::DynamicState::DEPTH_BOUNDS,
    vk::DynamicState::STENCIL_COMPARE_MASK,
    vk::DynamicState::STENCIL_WRITE_MASK,
    vk::DynamicState::STENCIL_REFERENCE,
];

/// Fluent builder for [`RasterPipeline`].
pub struct RasterPipelineBuilder {
    vertex: Option<ShaderModule>,
    fragment: Option<ShaderModule>,
    vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    topology: vk::PrimitiveTopology,
    polygon_mode: vk::PolygonMode,
    cull_mode: vk::CullModeFlags,
    front_face: vk::FrontFace,
    samples: vk::SampleCountFlags,
    depth_test: bool,
    depth_write: bool,
    color_attachment_count: u32,
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
    subpass: u32,
}

impl Default for RasterPipelineBuilder {
    fn default() -> Self {
        Self {
            vertex: None,
            fragment: None,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            samples: vk::SampleCountFlags::TYPE_1,
            depth_test: true,
            depth_write: true,
            color_attachment_count: 1,
            layout: vk::PipelineLayout::null(),
            render_pass: vk::RenderPass::null(),
            subpass: 0,
        }
    }
}

impl RasterPipelineBuilder {
    /// Create a builder with default raster state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the vertex shader. Required.
    #[must_use]
    pub fn vertex_shader(mut self, shader: ShaderModule) -> Self {
        self.vertex = Some(shader);
        self
    }

    /// Set the fragment shader. Required.
    #[must_use]
    pub fn fragment_shader(mut self, shader: ShaderModule) -> Self {
        self.fragment = Some(shader);
        self
    }

    /// Set vertex input bindings and attributes.
    #[must_use]
    pub fn vertex_input(
        mut self,
        bindings: Vec<vk::VertexInputBindingDescription>,
        attributes: Vec<vk::VertexInputAttributeDescription>,
    ) -> Self {
        self.vertex_bindings = bindings;
        self.vertex_attributes = attributes;
        self
    }

    /// Set the primitive topology.
    #[must_use]
    pub const fn topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    /// Set the polygon mode.
    #[must_use]
    pub const fn polygon_mode(mut self, mode: vk::PolygonMode) -> Self {
        self.polygon_mode = mode;
        self
    }

    /// Set the cull mode.
    #[must_use]
    pub const fn cull_mode(mut self, mode: vk::CullModeFlags) -> Self {
        self.cull_mode = mode;
        self
    }

    /// Set the front face winding.
    #[must_use]
    pub const fn front_face(mut self, front_face: vk::FrontFace) -> Self {
        self.front_face = front_face;
        self
    }

    /// Set the sample count.
    #[must_use]
    pub const fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    /// Enable or disable depth test and write.
    #[must_use]
    pub const fn depth(mut self, test: bool, write: bool) -> Self {
        self.depth_test = test;
        self.depth_write = write;
        self
    }

    /// Number of color attachments in the target subpass.
    #[must_use]
    pub const fn color_attachments(mut self, count: u32) -> Self {
        self.color_attachment_count = count;
        self
    }

    /// Set the pipeline layout. Required.
    #[must_use]
    pub const fn layout(mut self, layout: vk::PipelineLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Set the render pass and subpass. Required.
    #[must_use]
    pub const fn render_pass(mut self, render_pass: vk::RenderPass, subpass: u32) -> Self {
        self.render_pass = render_pass;
        self.subpass = subpass;
        self
    }

    /// Compile the pipeline. Shader modules are released afterwards.
    pub fn build(self, device: &Device) -> Result<RasterPipeline> {
        let vertex = self
            .vertex
            .ok_or_else(|| GpuError::PipelineCreation("missing vertex shader".to_string()))?;
        let fragment = self
            .fragment
            .ok_or_else(|| GpuError::PipelineCreation("missing fragment shader".to_string()))?;
        if self.render_pass == vk::RenderPass::null() {
            return Err(GpuError::PipelineCreation("missing render pass".to_string()));
        }

        let stages = [vertex.stage_info(), fragment.stage_info()];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&self.vertex_bindings)
            .vertex_attribute_descriptions(&self.vertex_attributes);

        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(self.topology);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(self.polygon_mode)
            .cull_mode(self.cull_mode)
            .front_face(self.front_face)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(self.samples);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(self.depth_test)
            .depth_write_enable(self.depth_write)
            .depth_compare_op(vk::CompareOp::LESS)
            .max_depth_bounds(1.0);

        let blend_attachments = vec![
            vk::PipelineColorBlendAttachmentState::default()
                .color_write_mask(vk::ColorComponentFlags::RGBA);
            self.color_attachment_count as usize
        ];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&RASTER_DYNAMIC_STATES);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(self.layout)
            .render_pass(self.render_pass)
            .subpass(self.subpass);

        let handle = unsafe {
            device
                .handle()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, e)| GpuError::from(e))?[0]
        };

        Ok(RasterPipeline {
            device: device.shared(),
            handle,
            layout: self.layout,
        })
    }
}

/// Compiled raster pipeline.
pub struct RasterPipeline {
    device: Arc<ash::Device>,
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl RasterPipeline {
    /// Get the raw pipeline handle.
    #[must_use]
    pub const fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    /// Layout the pipeline was built with.
    #[must_use]
    pub const fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for RasterPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.handle, None);
        }
    }
}

/// Fluent builder for [`ComputePipeline`].
#[derive(Default)]
pub struct ComputePipelineBuilder {
    shader: Option<ShaderModule>,
    layout: vk::PipelineLayout,
}

impl ComputePipelineBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the compute shader. Required.
    #[must_use]
    pub fn shader(mut self, shader: ShaderModule) -> Self {
        self.shader = Some(shader);
        self
    }

    /// Set the pipeline layout. Required.
    #[must_use]
    pub const fn layout(mut self, layout: vk::PipelineLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Compile the pipeline. The shader module is released afterwards.
    pub fn build(self, device: &Device) -> Result<ComputePipeline> {
        let shader = self
            .shader
            .ok_or_else(|| GpuError::PipelineCreation("missing compute shader".to_string()))?;

        let info = vk::ComputePipelineCreateInfo::default()
            .stage(shader.stage_info())
            .layout(self.layout);

        let handle = unsafe {
            device
                .handle()
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
                .map_err(|(_, e)| GpuError::from(e))?[0]
        };

        Ok(ComputePipeline {
            device: device.shared(),
            handle,
            layout: self.layout,
        })
    }
}

/// Compiled compute pipeline.
pub struct ComputePipeline {
    device: Arc<ash::Device>,
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl ComputePipeline {
    /// Get the raw pipeline handle.
    #[must_use]
    pub const fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    /// Layout the pipeline was built with.
    #[must_use]
    pub const fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_state_list_is_fixed() {
        assert_eq!(RASTER_DYNAMIC_STATES.len(), 9);
        assert!(RASTER_DYNAMIC_STATES.contains(&vk::DynamicState::VIEWPORT));
        assert!(RASTER_DYNAMIC_STATES.contains(&vk::DynamicState::SCISSOR));
        assert!(RASTER_DYNAMIC_STATES.contains(&vk::DynamicState::STENCIL_REFERENCE));
    }
}
