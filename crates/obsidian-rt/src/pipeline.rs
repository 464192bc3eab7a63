//! Ray tracing pipeline builder and trace commands.
//!
//! Shader stages are laid out in a fixed category order so that group
//! indices map directly onto shader binding table records: ray
//! generation first, then miss, hit groups, and callables.

use ash::vk;
use obsidian_gpu::{CommandBuffer, Device, GpuError, RayTrace, Result, ShaderModule};
use std::sync::Arc;

use crate::sbt::{SbtCounts, ShaderBindingTable};

/// A hit group: closest-hit plus optional any-hit, and for procedural
/// geometry an intersection shader.
pub struct HitGroup {
    closest_hit: Option<ShaderModule>,
    any_hit: Option<ShaderModule>,
    intersection: Option<ShaderModule>,
}

impl HitGroup {
    /// Triangle hit group.
    #[must_use]
    pub const fn triangles(closest_hit: ShaderModule) -> Self {
        Self {
            closest_hit: Some(closest_hit),
            any_hit: None,
            intersection: None,
        }
    }

    /// Triangle hit group with an any-hit shader.
    #[must_use]
    pub const fn triangles_with_any_hit(closest_hit: ShaderModule, any_hit: ShaderModule) -> Self {
        Self {
            closest_hit: Some(closest_hit),
            any_hit: Some(any_hit),
            intersection: None,
        }
    }

    /// Procedural hit group driven by an intersection shader.
    #[must_use]
    pub const fn procedural(intersection: ShaderModule, closest_hit: Option<ShaderModule>) -> Self {
        Self {
            closest_hit,
            any_hit: None,
            intersection: Some(intersection),
        }
    }

    const fn group_type(&self) -> vk::RayTracingShaderGroupTypeKHR {
        if self.intersection.is_some() {
            vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
        } else {
            vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
        }
    }
}

/// Fluent builder for [`RayTracePipeline`].
///
/// Owns its shader modules until `build` consumes them.
pub struct RayTracePipelineBuilder {
    raygen: Option<ShaderModule>,
    miss: Vec<ShaderModule>,
    hit_groups: Vec<HitGroup>,
    callable: Vec<ShaderModule>,
    layout: vk::PipelineLayout,
    max_recursion_depth: u32,
}

impl RayTracePipelineBuilder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            raygen: None,
            miss: Vec::new(),
            hit_groups: Vec::new(),
            callable: Vec::new(),
            layout: vk::PipelineLayout::null(),
            max_recursion_depth: 1,
        }
    }

    /// Set the single required ray generation shader.
    #[must_use]
    pub fn raygen(mut self, shader: ShaderModule) -> Self {
        self.raygen = Some(shader);
        self
    }

    /// Append a miss shader. Miss indices follow insertion order.
    #[must_use]
    pub fn miss(mut self, shader: ShaderModule) -> Self {
        self.miss.push(shader);
        self
    }

    /// Append a hit group. Hit group indices follow insertion order.
    #[must_use]
    pub fn hit_group(mut self, group: HitGroup) -> Self {
        self.hit_groups.push(group);
        self
    }

    /// Append a callable shader.
    #[must_use]
    pub fn callable(mut self, shader: ShaderModule) -> Self {
        self.callable.push(shader);
        self
    }

    /// Set the pipeline layout.
    #[must_use]
    pub const fn layout(mut self, layout: vk::PipelineLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Maximum recursion depth, clamped by the device at trace time.
    /// Defaults to 1 (no recursion beyond the initial trace).
    #[must_use]
    pub const fn max_recursion_depth(mut self, depth: u32) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    /// Build the pipeline and its shader binding table.
    ///
    /// # Safety
    /// The pipeline layout must remain valid while the pipeline lives.
    pub unsafe fn build(self, device: &Device) -> Result<RayTracePipeline> {
        let raygen = self
            .raygen
            .ok_or_else(|| GpuError::InvalidState("missing ray generation shader".to_string()))?;
        if self.layout == vk::PipelineLayout::null() {
            return Err(GpuError::InvalidState(
                "missing pipeline layout".to_string(),
            ));
        }

        let counts = SbtCounts {
            miss: self.miss.len() as u32,
            hit: self.hit_groups.len() as u32,
            callable: self.callable.len() as u32,
        };

        fn push_general<'a>(
            module: &'a ShaderModule,
            stages: &mut Vec<vk::PipelineShaderStageCreateInfo<'a>>,
            groups: &mut Vec<vk::RayTracingShaderGroupCreateInfoKHR<'a>>,
        ) {
            let index = stages.len() as u32;
            stages.push(module.stage_info());
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                    .general_shader(index)
                    .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR),
            );
        }

        // Stage order mirrors the record order in the binding table.
        let mut stages = Vec::new();
        let mut groups = Vec::new();

        push_general(&raygen, &mut stages, &mut groups);
        for shader in &self.miss {
            push_general(shader, &mut stages, &mut groups);
        }
        for group in &self.hit_groups {
            let mut next = stages.len() as u32;
            let closest_hit = stage_index(&mut next, group.closest_hit.is_some());
            let any_hit = stage_index(&mut next, group.any_hit.is_some());
            let intersection = stage_index(&mut next, group.intersection.is_some());
            for module in [&group.closest_hit, &group.any_hit, &group.intersection]
                .into_iter()
                .flatten()
            {
                stages.push(module.stage_info());
            }
            groups.push(
                vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .ty(group.group_type())
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(closest_hit)
                    .any_hit_shader(any_hit)
                    .intersection_shader(intersection),
            );
        }
        for shader in &self.callable {
            push_general(shader, &mut stages, &mut groups);
        }

        let max_depth = device
            .capabilities()
            .ray_tracing
            .map_or(1, |caps| caps.max_ray_recursion_depth)
            .min(self.max_recursion_depth);

        let info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(max_depth)
            .layout(self.layout);

        let handle = device
            .ray_tracing_loader()?
            .create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(&info),
                None,
            )
            .map_err(|(_, e)| GpuError::from(e))?[0];

        tracing::debug!(
            groups = groups.len(),
            max_depth,
            "Created ray tracing pipeline"
        );

        let sbt = match ShaderBindingTable::new(device, handle, counts) {
            Ok(sbt) => sbt,
            Err(e) => {
                device.handle().destroy_pipeline(handle, None);
                return Err(e);
            }
        };

        Ok(RayTracePipeline {
            device: device.shared(),
            handle,
            layout: self.layout,
            sbt,
        })
    }
}

impl Default for RayTracePipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Assign the next stage slot when the shader is present, `SHADER_UNUSED_KHR`
/// otherwise. Keeps hit group records consistent with the stage array.
fn stage_index(next: &mut u32, present: bool) -> u32 {
    if present {
        let index = *next;
        *next += 1;
        index
    } else {
        vk::SHADER_UNUSED_KHR
    }
}

/// Built ray tracing pipeline with its shader binding table.
pub struct RayTracePipeline {
    device: Arc<ash::Device>,
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
    sbt: ShaderBindingTable,
}

impl RayTracePipeline {
    /// Get the raw pipeline handle.
    #[must_use]
    pub const fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    /// The layout the pipeline was built with.
    #[must_use]
    pub const fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// The pipeline's shader binding table.
    #[must_use]
    pub const fn sbt(&self) -> &ShaderBindingTable {
        &self.sbt
    }
}

impl Drop for RayTracePipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.handle, None);
        }
    }
}

/// Trace commands recorded on a ray tracing command buffer.
pub trait RayTraceCommands {
    /// Bind a ray tracing pipeline.
    ///
    /// # Safety
    /// Must be called inside an active recording.
    unsafe fn bind_ray_trace_pipeline(&self, device: &Device, pipeline: &RayTracePipeline);

    /// Dispatch rays over a `width` x `height` x `depth` grid using the
    /// pipeline's binding table regions.
    ///
    /// # Safety
    /// The pipeline must be bound on this buffer.
    unsafe fn trace_rays(
        &self,
        device: &Device,
        pipeline: &RayTracePipeline,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Result<()>;
}

impl RayTraceCommands for CommandBuffer<RayTrace> {
    unsafe fn bind_ray_trace_pipeline(&self, device: &Device, pipeline: &RayTracePipeline) {
        device.handle().cmd_bind_pipeline(
            self.handle(),
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            pipeline.handle(),
        );
    }

    unsafe fn trace_rays(
        &self,
        device: &Device,
        pipeline: &RayTracePipeline,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Result<()> {
        let regions = pipeline.sbt().regions();
        device.ray_tracing_loader()?.cmd_trace_rays(
            self.handle(),
            &regions.raygen,
            &regions.miss,
            &regions.hit,
            &regions.callable,
            width,
            height,
            depth,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_shaders_take_consecutive_stage_slots() {
        let mut next = 2;
        assert_eq!(stage_index(&mut next, true), 2);
        assert_eq!(stage_index(&mut next, true), 3);
        assert_eq!(next, 4);
    }

    #[test]
    fn absent_shaders_map_to_unused_without_consuming_a_slot() {
        let mut next = 5;
        assert_eq!(stage_index(&mut next, false), vk::SHADER_UNUSED_KHR);
        assert_eq!(stage_index(&mut next, true), 5);
        assert_eq!(stage_index(&mut next, false), vk::SHADER_UNUSED_KHR);
        assert_eq!(next, 6);
    }
}
