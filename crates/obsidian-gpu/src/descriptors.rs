//! Descriptor set layouts, pools, sets, and the table that couples them.
//!
//! Sets follow a stage-then-update protocol: `bind_*` calls only cache
//! the write, and [`DescriptorSet::update`] materializes every staged
//! write into a single `vkUpdateDescriptorSets` call.

use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::memory::Buffer;
use ash::vk;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One binding slot of a descriptor set layout.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorBinding {
    /// Binding point in the shader.
    pub binding: u32,
    /// Number of descriptors in the slot.
    pub count: u32,
    /// Descriptor type.
    pub ty: vk::DescriptorType,
    /// Stages that access the slot.
    pub stages: vk::ShaderStageFlags,
    /// Optional immutable sampler for sampled-image slots.
    pub sampler: Option<vk::Sampler>,
}

impl DescriptorBinding {
    /// Shorthand without an immutable sampler.
    #[must_use]
    pub const fn new(
        binding: u32,
        count: u32,
        ty: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        Self {
            binding,
            count,
            ty,
            stages,
            sampler: None,
        }
    }
}

/// Fluent builder for [`DescriptorSetLayout`].
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<DescriptorBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an explicit binding.
    #[must_use]
    pub fn binding(mut self, binding: DescriptorBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Add a storage buffer binding.
    #[must_use]
    pub fn storage_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(DescriptorBinding::new(
            binding,
            1,
            vk::DescriptorType::STORAGE_BUFFER,
            stages,
        ))
    }

    /// Add a uniform buffer binding.
    #[must_use]
    pub fn uniform_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(DescriptorBinding::new(
            binding,
            1,
            vk::DescriptorType::UNIFORM_BUFFER,
            stages,
        ))
    }

    /// Add a storage image binding.
    #[must_use]
    pub fn storage_image(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(DescriptorBinding::new(
            binding,
            1,
            vk::DescriptorType::STORAGE_IMAGE,
            stages,
        ))
    }

    /// Add a combined image sampler binding.
    #[must_use]
    pub fn sampled_image(self, binding: u32, count: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(DescriptorBinding::new(
            binding,
            count,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            stages,
        ))
    }

    /// Add an acceleration structure binding.
    #[must_use]
    pub fn acceleration_structure(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.binding(DescriptorBinding::new(
            binding,
            1,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            stages,
        ))
    }

    /// Build the native layout.
    pub fn build(self, device: &Device) -> Result<DescriptorSetLayout> {
        DescriptorSetLayout::from_shared(device.shared(), self.bindings)
    }
}

/// Owned descriptor set layout plus the binding list it was built from.
pub struct DescriptorSetLayout {
    device: Arc<ash::Device>,
    handle: vk::DescriptorSetLayout,
    bindings: Vec<DescriptorBinding>,
}

impl DescriptorSetLayout {
    pub(crate) fn from_shared(
        device: Arc<ash::Device>,
        bindings: Vec<DescriptorBinding>,
    ) -> Result<Self> {
        // Immutable sampler handles need stable addresses during the call.
        let samplers: Vec<[vk::Sampler; 1]> = bindings
            .iter()
            .map(|b| [b.sampler.unwrap_or(vk::Sampler::null()); 1])
            .collect();

        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .zip(&samplers)
            .map(|(b, sampler)| {
                let mut vk_binding = vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_count(b.count)
                    .descriptor_type(b.ty)
                    .stage_flags(b.stages);
                if b.sampler.is_some() {
                    vk_binding = vk_binding.immutable_samplers(sampler);
                }
                vk_binding
            })
            .collect();

        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        let handle = unsafe { device.create_descriptor_set_layout(&info, None) }?;

        Ok(Self {
            device,
            handle,
            bindings,
        })
    }

    /// Get the raw layout handle.
    #[must_use]
    pub const fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    /// Look up a binding by its binding point.
    #[must_use]
    pub fn binding(&self, binding: u32) -> Option<&DescriptorBinding> {
        self.bindings.iter().find(|b| b.binding == binding)
    }

    /// All bindings in declaration order.
    #[must_use]
    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.handle, None);
        }
    }
}

/// Accumulated per-type descriptor counts; the pool is sized to exactly
/// these totals.
#[derive(Debug, Default, Clone)]
pub struct PoolSizes {
    counts: BTreeMap<vk::DescriptorType, u32>,
}

impl PoolSizes {
    /// Add `count` descriptors of `ty`.
    pub fn add(&mut self, ty: vk::DescriptorType, count: u32) {
        *self.counts.entry(ty).or_insert(0) += count;
    }

    /// Total descriptors across all types.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    /// Whether nothing was accumulated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Materialize the native pool size list.
    #[must_use]
    pub fn to_vk(&self) -> Vec<vk::DescriptorPoolSize> {
        self.counts
            .iter()
            .map(|(&ty, &count)| {
                vk::DescriptorPoolSize::default()
                    .ty(ty)
                    .descriptor_count(count)
            })
            .collect()
    }
}

/// Descriptor pool built lazily from accumulated sizes.
pub struct DescriptorPool {
    device: Arc<ash::Device>,
    sizes: PoolSizes,
    handle: Option<vk::DescriptorPool>,
}

impl DescriptorPool {
    /// Create an empty pool description.
    #[must_use]
    pub fn new(device: &Device) -> Self {
        Self::from_shared(device.shared())
    }

    pub(crate) fn from_shared(device: Arc<ash::Device>) -> Self {
        Self {
            device,
            sizes: PoolSizes::default(),
            handle: None,
        }
    }

    /// Reserve `count` descriptors of `ty`. Only valid before the first
    /// allocation.
    pub fn add(&mut self, ty: vk::DescriptorType, count: u32) -> Result<()> {
        if self.handle.is_some() {
            return Err(GpuError::InvalidState(
                "descriptor pool already built".to_string(),
            ));
        }
        self.sizes.add(ty, count);
        Ok(())
    }

    /// Accumulated sizes.
    #[must_use]
    pub const fn sizes(&self) -> &PoolSizes {
        &self.sizes
    }

    /// Allocate one set over `layout`.
    pub fn allocate(&mut self, layout: &DescriptorSetLayout) -> Result<DescriptorSet> {
        Ok(self.allocate_many(layout, 1)?.remove(0))
    }

    /// Allocate `count` sets over `layout`.
    pub fn allocate_many(
        &mut self,
        layout: &DescriptorSetLayout,
        count: u32,
    ) -> Result<Vec<DescriptorSet>> {
        let pool = self.build()?;
        let layouts = vec![layout.handle(); count as usize];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        let handles = unsafe { self.device.allocate_descriptor_sets(&info) }?;
        Ok(handles
            .into_iter()
            .map(|handle| DescriptorSet::new(Arc::clone(&self.device), handle, layout.bindings().to_vec()))
            .collect())
    }

    /// Return all allocated sets to the pool.
    pub fn reset(&mut self) -> Result<()> {
        if let Some(pool) = self.handle {
            unsafe {
                self.device
                    .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())?;
            }
        }
        Ok(())
    }

    fn build(&mut self) -> Result<vk::DescriptorPool> {
        if let Some(handle) = self.handle {
            return Ok(handle);
        }
        if self.sizes.is_empty() {
            return Err(GpuError::InvalidState(
                "descriptor pool has no accumulated sizes".to_string(),
            ));
        }

        let pool_sizes = self.sizes.to_vk();
        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(self.sizes.total())
            .pool_sizes(&pool_sizes);

        let handle = unsafe { self.device.create_descriptor_pool(&info, None) }?;
        self.handle = Some(handle);
        Ok(handle)
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        if let Some(handle) = self.handle {
            unsafe {
                self.device.destroy_descriptor_pool(handle, None);
            }
        }
    }
}

/// An allocated descriptor set with staged writes.
pub struct DescriptorSet {
    device: Arc<ash::Device>,
    handle: vk::DescriptorSet,
    bindings: Vec<DescriptorBinding>,

    staged_buffers: Vec<(u32, vk::DescriptorBufferInfo)>,
    staged_images: Vec<(u32, vk::DescriptorImageInfo)>,
    staged_image_arrays: Vec<(u32, Vec<vk::DescriptorImageInfo>)>,
    staged_accels: Vec<(u32, vk::AccelerationStructureKHR)>,
}

impl DescriptorSet {
    fn new(
        device: Arc<ash::Device>,
        handle: vk::DescriptorSet,
        bindings: Vec<DescriptorBinding>,
    ) -> Self {
        Self {
            device,
            handle,
            bindings,
            staged_buffers: Vec::new(),
            staged_images: Vec::new(),
            staged_image_arrays: Vec::new(),
            staged_accels: Vec::new(),
        }
    }

    /// Get the raw set handle.
    #[must_use]
    pub const fn handle(&self) -> vk::DescriptorSet {
        self.handle
    }

    /// Stage a whole-buffer write for `binding`.
    pub fn bind_buffer(&mut self, binding: u32, buffer: &Buffer) -> Result<()> {
        self.require_binding(binding)?;
        let info = vk::DescriptorBufferInfo::default()
            .buffer(buffer.handle())
            .range(vk::WHOLE_SIZE);
        self.staged_buffers.push((binding, info));
        Ok(())
    }

    /// Stage a single image write for `binding`.
    pub fn bind_image(
        &mut self,
        binding: u32,
        view: vk::ImageView,
        sampler: Option<vk::Sampler>,
        layout: vk::ImageLayout,
    ) -> Result<()> {
        self.require_binding(binding)?;
        let info = vk::DescriptorImageInfo::default()
            .image_view(view)
            .sampler(sampler.unwrap_or(vk::Sampler::null()))
            .image_layout(layout);
        self.staged_images.push((binding, info));
        Ok(())
    }

    /// Stage an image array write for `binding`.
    pub fn bind_images(
        &mut self,
        binding: u32,
        infos: Vec<vk::DescriptorImageInfo>,
    ) -> Result<()> {
        self.require_binding(binding)?;
        self.staged_image_arrays.push((binding, infos));
        Ok(())
    }

    /// Stage an acceleration structure write for `binding`.
    pub fn bind_acceleration_structure(
        &mut self,
        binding: u32,
        accel: vk::AccelerationStructureKHR,
    ) -> Result<()> {
        self.require_binding(binding)?;
        self.staged_accels.push((binding, accel));
        Ok(())
    }

    /// Number of currently staged writes across all kinds.
    #[must_use]
    pub fn staged_count(&self) -> usize {
        self.staged_buffers.len()
            + self.staged_images.len()
            + self.staged_image_arrays.len()
            + self.staged_accels.len()
    }

    /// Flush every staged write in a single update call, then clear the
    /// caches. Descriptor types are resolved from the layout bindings.
    pub fn update(&mut self) -> Result<()> {
        if self.staged_count() == 0 {
            return Ok(());
        }

        let mut writes: Vec<vk::WriteDescriptorSet> = Vec::with_capacity(self.staged_count());

        for (binding, info) in &self.staged_buffers {
            let ty = self.binding_type(*binding)?;
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(self.handle)
                    .dst_binding(*binding)
                    .descriptor_type(ty)
                    .buffer_info(std::slice::from_ref(info)),
            );
        }

        for (binding, info) in &self.staged_images {
            let ty = self.binding_type(*binding)?;
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(self.handle)
                    .dst_binding(*binding)
                    .descriptor_type(ty)
                    .image_info(std::slice::from_ref(info)),
            );
        }

        for (binding, infos) in &self.staged_image_arrays {
            let ty = self.binding_type(*binding)?;
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(self.handle)
                    .dst_binding(*binding)
                    .descriptor_type(ty)
                    .image_info(infos),
            );
        }

        let mut accel_infos: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> = self
            .staged_accels
            .iter()
            .map(|(_, accel)| {
                vk::WriteDescriptorSetAccelerationStructureKHR::default()
                    .acceleration_structures(std::slice::from_ref(accel))
            })
            .collect();

        for ((binding, _), accel_info) in self.staged_accels.iter().zip(accel_infos.iter_mut()) {
            let mut write = vk::WriteDescriptorSet::default()
                .dst_set(self.handle)
                .dst_binding(*binding)
                .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .push_next(accel_info);
            write.descriptor_count = 1;
            writes.push(write);
        }

        unsafe {
            self.device.update_descriptor_sets(&writes, &[]);
        }

        self.staged_buffers.clear();
        self.staged_images.clear();
        self.staged_image_arrays.clear();
        self.staged_accels.clear();
        Ok(())
    }

    fn require_binding(&self, binding: u32) -> Result<()> {
        if self.bindings.iter().any(|b| b.binding == binding) {
            Ok(())
        } else {
            Err(GpuError::InvalidState(format!(
                "binding {binding} is not part of the set layout"
            )))
        }
    }

    fn binding_type(&self, binding: u32) -> Result<vk::DescriptorType> {
        self.bindings
            .iter()
            .find(|b| b.binding == binding)
            .map(|b| b.ty)
            .ok_or_else(|| {
                GpuError::InvalidState(format!("binding {binding} is not part of the set layout"))
            })
    }
}

/// Couples one layout and one pool: every added binding feeds the layout
/// definition and reserves matching pool capacity.
pub struct DescriptorTable {
    device: Arc<ash::Device>,
    bindings: Vec<DescriptorBinding>,
    built: Option<(DescriptorSetLayout, DescriptorPool)>,
}

impl DescriptorTable {
    /// Create an empty table for `device`.
    #[must_use]
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.shared(),
            bindings: Vec::new(),
            built: None,
        }
    }

    /// Add a binding. Only valid before the first allocation.
    pub fn add_binding(&mut self, binding: DescriptorBinding) -> Result<&mut Self> {
        if self.built.is_some() {
            return Err(GpuError::InvalidState(
                "descriptor table already built".to_string(),
            ));
        }
        self.bindings.push(binding);
        Ok(self)
    }

    /// Layout handle, building layout and pool on first use.
    pub fn layout(&mut self) -> Result<vk::DescriptorSetLayout> {
        let (layout, _) = self.build()?;
        Ok(layout.handle())
    }

    /// Allocate one set.
    pub fn allocate(&mut self) -> Result<DescriptorSet> {
        let (layout, pool) = self.build()?;
        pool.allocate(layout)
    }

    /// Allocate `count` sets.
    pub fn allocate_many(&mut self, count: u32) -> Result<Vec<DescriptorSet>> {
        let (layout, pool) = self.build()?;
        pool.allocate_many(layout, count)
    }

    fn build(&mut self) -> Result<(&DescriptorSetLayout, &mut DescriptorPool)> {
        if self.built.is_none() {
            let layout =
                DescriptorSetLayout::from_shared(Arc::clone(&self.device), self.bindings.clone())?;
            let mut pool = DescriptorPool::from_shared(Arc::clone(&self.device));
            for binding in &self.bindings {
                pool.add(binding.ty, binding.count)?;
            }
            self.built = Some((layout, pool));
        }
        let (layout, pool) = self
            .built
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("descriptor table build failed".to_string()))?;
        Ok((&*layout, pool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_sizes_accumulate_per_type() {
        let mut sizes = PoolSizes::default();
        sizes.add(vk::DescriptorType::STORAGE_BUFFER, 2);
        sizes.add(vk::DescriptorType::STORAGE_BUFFER, 3);
        sizes.add(vk::DescriptorType::UNIFORM_BUFFER, 1);
        sizes.add(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, 1);

        assert_eq!(sizes.total(), 7);

        let vk_sizes = sizes.to_vk();
        assert_eq!(vk_sizes.len(), 3);
        let storage = vk_sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::STORAGE_BUFFER)
            .unwrap();
        assert_eq!(storage.descriptor_count, 5);
        let uniform = vk_sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::UNIFORM_BUFFER)
            .unwrap();
        assert_eq!(uniform.descriptor_count, 1);
    }

    #[test]
    fn pool_sizes_empty() {
        let sizes = PoolSizes::default();
        assert!(sizes.is_empty());
        assert_eq!(sizes.total(), 0);
        assert!(sizes.to_vk().is_empty());
    }

    #[test]
    fn builder_collects_bindings_in_order() {
        let builder = DescriptorSetLayoutBuilder::new()
            .storage_buffer(0, vk::ShaderStageFlags::COMPUTE)
            .uniform_buffer(1, vk::ShaderStageFlags::VERTEX)
            .acceleration_structure(2, vk::ShaderStageFlags::RAYGEN_KHR);

        assert_eq!(builder.bindings.len(), 3);
        assert_eq!(builder.bindings[0].ty, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(builder.bindings[1].binding, 1);
        assert_eq!(
            builder.bindings[2].ty,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
        );
    }
}
