//! Logical device management: selection, creation, queues and pools.

use crate::capabilities::DeviceCapabilities;
use crate::command::{Compute, CommandPool, Raster, RayTrace, Transfer};
use crate::descriptors::DescriptorTable;
use crate::error::{GpuError, Result};
use crate::instance::Instance;
use crate::memory::{Buffer, Image2D, Sampler, SamplerConfig};
use crate::pipeline::ShaderModule;
use crate::swapchain::SwapChain;
use crate::sync::{Fence, Semaphore};
use ash::vk;
use bytemuck::Pod;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::ffi::CStr;
use std::sync::Arc;

bitflags::bitflags! {
    /// Optional device features selectable at device creation.
    ///
    /// `RAY_TRACE` carries the `BUFFER_ADDRESS` bit: acceleration
    /// structure builds dereference buffer device addresses, so enabling
    /// ray tracing always enables addresses too.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFeatures: u32 {
        const BUFFER_ADDRESS = 0b0001;
        const RAY_TRACE = 0b0011;
        const ANISOTROPY = 0b0100;
    }
}

/// Queue family indices resolved for a physical device.
#[derive(Debug, Clone, Copy)]
pub struct QueueFamilyIndices {
    /// Graphics family; also serves raster and ray-trace command pools.
    pub graphics: u32,
    /// Compute family (dedicated when available, else graphics).
    pub compute: u32,
    /// Transfer family (dedicated when available, else compute).
    pub transfer: u32,
    /// Present family (only meaningful when a surface exists).
    pub present: u32,
}

impl QueueFamilyIndices {
    /// Whether graphics and present are the same family.
    #[must_use]
    pub const fn shares_present_family(&self) -> bool {
        self.graphics == self.present
    }

    /// Deduplicated family list for queue creation.
    #[must_use]
    pub fn unique(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = [self.graphics, self.compute, self.transfer, self.present]
            .into_iter()
            .collect();
        set.into_iter().collect()
    }
}

/// Logical device plus everything resolved at creation time: queues,
/// capabilities, extension loaders, and lazily created command pools.
///
/// Resources created from a `Device` hold an `Arc` of the raw device and
/// must be dropped before the `Device` itself.
pub struct Device {
    physical_device: vk::PhysicalDevice,
    handle: Arc<ash::Device>,
    capabilities: DeviceCapabilities,
    features: DeviceFeatures,
    families: QueueFamilyIndices,

    graphics_queue: vk::Queue,
    compute_queue: vk::Queue,
    transfer_queue: vk::Queue,
    present_queue: vk::Queue,

    swapchain_loader: Option<ash::khr::swapchain::Device>,
    acceleration_loader: Option<ash::khr::acceleration_structure::Device>,
    ray_tracing_loader: Option<ash::khr::ray_tracing_pipeline::Device>,

    raster_pool: Mutex<Option<Arc<CommandPool<Raster>>>>,
    compute_pool: Mutex<Option<Arc<CommandPool<Compute>>>>,
    ray_trace_pool: Mutex<Option<Arc<CommandPool<RayTrace>>>>,
    transfer_pool: Mutex<Option<Arc<CommandPool<Transfer>>>>,
}

/// Builder for [`Device`].
pub struct DeviceBuilder {
    features: DeviceFeatures,
}

impl Default for DeviceBuilder {
    fn default() -> Self {
        Self {
            features: DeviceFeatures::empty(),
        }
    }
}

impl DeviceBuilder {
    /// Create a builder with no optional features.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an optional feature set.
    #[must_use]
    pub const fn features(mut self, features: DeviceFeatures) -> Self {
        self.features = features;
        self
    }

    /// Select a physical device and create the logical device.
    ///
    /// # Safety
    /// The instance must outlive the returned device.
    pub unsafe fn build(self, instance: &Instance) -> Result<Device> {
        let features = self.features;

        let (physical_device, capabilities, families) = select_physical_device(instance, features)?;
        tracing::info!("Selected GPU: {}", capabilities.summary());

        let handle = create_device(
            instance.handle(),
            physical_device,
            &families,
            features,
            instance.surface().is_some(),
        )?;
        let handle = Arc::new(handle);

        let graphics_queue = handle.get_device_queue(families.graphics, 0);
        let compute_queue = handle.get_device_queue(families.compute, 0);
        let transfer_queue = handle.get_device_queue(families.transfer, 0);
        let present_queue = handle.get_device_queue(families.present, 0);

        let swapchain_loader = instance
            .surface()
            .map(|_| ash::khr::swapchain::Device::new(instance.handle(), &handle));

        let (acceleration_loader, ray_tracing_loader) =
            if features.contains(DeviceFeatures::RAY_TRACE) {
                (
                    Some(ash::khr::acceleration_structure::Device::new(
                        instance.handle(),
                        &handle,
                    )),
                    Some(ash::khr::ray_tracing_pipeline::Device::new(
                        instance.handle(),
                        &handle,
                    )),
                )
            } else {
                (None, None)
            };

        Ok(Device {
            physical_device,
            handle,
            capabilities,
            features,
            families,
            graphics_queue,
            compute_queue,
            transfer_queue,
            present_queue,
            swapchain_loader,
            acceleration_loader,
            ray_tracing_loader,
            raster_pool: Mutex::new(None),
            compute_pool: Mutex::new(None),
            ray_trace_pool: Mutex::new(None),
            transfer_pool: Mutex::new(None),
        })
    }
}

impl Device {
    /// Get the raw device.
    #[must_use]
    pub fn handle(&self) -> &ash::Device {
        &self.handle
    }

    /// Clone the shared raw device for a resource to hold.
    #[must_use]
    pub fn shared(&self) -> Arc<ash::Device> {
        Arc::clone(&self.handle)
    }

    /// Get the physical device handle.
    #[must_use]
    pub const fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get detected capabilities.
    #[must_use]
    pub const fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// Features that were enabled at creation.
    #[must_use]
    pub const fn features(&self) -> DeviceFeatures {
        self.features
    }

    /// Get the resolved queue family indices.
    #[must_use]
    pub const fn queue_families(&self) -> QueueFamilyIndices {
        self.families
    }

    /// Get the graphics queue.
    #[must_use]
    pub const fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the compute queue.
    #[must_use]
    pub const fn compute_queue(&self) -> vk::Queue {
        self.compute_queue
    }

    /// Get the transfer queue.
    #[must_use]
    pub const fn transfer_queue(&self) -> vk::Queue {
        self.transfer_queue
    }

    /// Get the present queue.
    #[must_use]
    pub const fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// Swapchain loader; present only for windowed instances.
    pub fn swapchain_loader(&self) -> Result<&ash::khr::swapchain::Device> {
        self.swapchain_loader
            .as_ref()
            .ok_or(GpuError::FeatureNotEnabled("presentation surface"))
    }

    /// Acceleration structure loader; present when `RAY_TRACE` is enabled.
    pub fn acceleration_loader(&self) -> Result<&ash::khr::acceleration_structure::Device> {
        self.acceleration_loader
            .as_ref()
            .ok_or(GpuError::FeatureNotEnabled("RAY_TRACE"))
    }

    /// Ray tracing pipeline loader; present when `RAY_TRACE` is enabled.
    pub fn ray_tracing_loader(&self) -> Result<&ash::khr::ray_tracing_pipeline::Device> {
        self.ray_tracing_loader
            .as_ref()
            .ok_or(GpuError::FeatureNotEnabled("RAY_TRACE"))
    }

    /// First memory type whose bit is set in `type_bits` and whose
    /// property flags contain `properties`. No fallback: a miss is an
    /// error.
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        let memory = &self.capabilities.memory_properties;
        memory
            .memory_types
            .iter()
            .take(memory.memory_type_count as usize)
            .enumerate()
            .find(|(i, ty)| type_bits & (1 << i) != 0 && ty.property_flags.contains(properties))
            .map(|(i, _)| i as u32)
            .ok_or(GpuError::NoSuitableMemoryType {
                type_bits,
                properties,
            })
    }

    /// Wait for the device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.handle.device_wait_idle()?;
        }
        Ok(())
    }

    /// Command pool on the graphics family, created on first request.
    pub fn raster_pool(&self) -> Result<Arc<CommandPool<Raster>>> {
        Self::cached_pool(&self.raster_pool, self)
    }

    /// Command pool on the compute family, created on first request.
    pub fn compute_pool(&self) -> Result<Arc<CommandPool<Compute>>> {
        Self::cached_pool(&self.compute_pool, self)
    }

    /// Ray-trace command pool (graphics family), created on first request.
    pub fn ray_trace_pool(&self) -> Result<Arc<CommandPool<RayTrace>>> {
        Self::cached_pool(&self.ray_trace_pool, self)
    }

    /// Command pool on the transfer family, created on first request.
    pub fn transfer_pool(&self) -> Result<Arc<CommandPool<Transfer>>> {
        Self::cached_pool(&self.transfer_pool, self)
    }

    fn cached_pool<R: crate::command::QueueRole>(
        slot: &Mutex<Option<Arc<CommandPool<R>>>>,
        device: &Self,
    ) -> Result<Arc<CommandPool<R>>> {
        let mut slot = slot.lock();
        if let Some(pool) = slot.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(unsafe { CommandPool::new(device) }?);
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    // --- resource factories ---

    /// Create a host-visible, host-coherent buffer.
    pub fn create_host_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<Buffer> {
        Buffer::new_host(self, size, usage)
    }

    /// Create a host-visible buffer initialized with `data`.
    pub fn create_host_buffer_with_data<T: Pod>(
        &self,
        data: &[T],
        usage: vk::BufferUsageFlags,
    ) -> Result<Buffer> {
        Buffer::new_host_with_data(self, data, usage)
    }

    /// Create a device-local buffer.
    pub fn create_device_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<Buffer> {
        Buffer::new_device_local(self, size, usage)
    }

    /// Device-local storage buffer usable as a transfer destination.
    pub fn create_storage_buffer(&self, size: u64) -> Result<Buffer> {
        self.create_device_buffer(
            size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        )
    }

    /// Host-visible uniform buffer.
    pub fn create_uniform_buffer(&self, size: u64) -> Result<Buffer> {
        self.create_host_buffer(size, vk::BufferUsageFlags::UNIFORM_BUFFER)
    }

    /// Device-local vertex buffer initialized by staging upload.
    pub fn create_vertex_buffer<T: Pod>(&self, vertices: &[T]) -> Result<Buffer> {
        self.create_device_buffer_with_data(
            vertices,
            vk::BufferUsageFlags::VERTEX_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
        )
    }

    /// Device-local index buffer initialized by staging upload.
    pub fn create_index_buffer<T: Pod>(&self, indices: &[T]) -> Result<Buffer> {
        self.create_device_buffer_with_data(
            indices,
            vk::BufferUsageFlags::INDEX_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
        )
    }

    /// Device-local buffer initialized from `data` via a staging copy.
    pub fn create_device_buffer_with_data<T: Pod>(
        &self,
        data: &[T],
        usage: vk::BufferUsageFlags,
    ) -> Result<Buffer> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let staging =
            Buffer::new_host_with_data(self, bytes, vk::BufferUsageFlags::TRANSFER_SRC)?;
        let buffer = Buffer::new_device_local(
            self,
            bytes.len() as u64,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
        )?;
        buffer.upload_from(self, &staging)?;
        Ok(buffer)
    }

    /// Device-local backing store for an acceleration structure.
    pub fn create_acceleration_storage_buffer(&self, size: u64) -> Result<Buffer> {
        self.create_device_buffer(
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )
    }

    /// Create a 2D image with a view.
    pub fn create_image(
        &self,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Image2D> {
        Image2D::new(self, format, extent, usage, aspect)
    }

    /// Create a sampler. Anisotropy is applied only when the feature is on.
    pub fn create_sampler(&self, config: &SamplerConfig) -> Result<Sampler> {
        Sampler::new(self, config)
    }

    /// Create a fence, optionally already signaled.
    pub fn create_fence(&self, signaled: bool) -> Result<Fence> {
        Fence::new(self, signaled)
    }

    /// Create a binary semaphore.
    pub fn create_semaphore(&self) -> Result<Semaphore> {
        Semaphore::new(self)
    }

    /// Create a shader module from SPIR-V words.
    pub fn create_shader_module(
        &self,
        spirv: &[u32],
        stage: vk::ShaderStageFlags,
    ) -> Result<ShaderModule> {
        ShaderModule::new(self, spirv, stage)
    }

    /// Create an empty descriptor table bound to this device.
    #[must_use]
    pub fn create_descriptor_table(&self) -> DescriptorTable {
        DescriptorTable::new(self)
    }

    /// Create a swapchain for the instance's surface.
    ///
    /// # Safety
    /// The surface must remain valid for the swapchain's lifetime.
    pub unsafe fn create_swapchain(
        &self,
        instance: &Instance,
        width: u32,
        height: u32,
    ) -> Result<SwapChain> {
        SwapChain::new(self, instance, width, height)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            let _ = self.handle.device_wait_idle();

            // Cached pools destroy themselves while the device is alive.
            self.raster_pool.lock().take();
            self.compute_pool.lock().take();
            self.ray_trace_pool.lock().take();
            self.transfer_pool.lock().take();

            self.handle.destroy_device(None);
        }
    }
}

/// Pick the best physical device that can serve `features`.
///
/// # Safety
/// The instance must be valid.
unsafe fn select_physical_device(
    instance: &Instance,
    features: DeviceFeatures,
) -> Result<(vk::PhysicalDevice, DeviceCapabilities, QueueFamilyIndices)> {
    let devices = instance.handle().enumerate_physical_devices()?;
    if devices.is_empty() {
        return Err(GpuError::NoSuitableDevice);
    }

    let mut best: Option<(vk::PhysicalDevice, DeviceCapabilities, QueueFamilyIndices)> = None;
    let mut best_score = 0i64;

    for device in devices {
        let capabilities = DeviceCapabilities::query(instance.handle(), device);
        if !capabilities.meets_requirements(features) {
            continue;
        }

        // Ray tracing is only worth it on discrete hardware.
        if features.contains(DeviceFeatures::RAY_TRACE)
            && capabilities.device_type != vk::PhysicalDeviceType::DISCRETE_GPU
        {
            continue;
        }

        let Some(families) = find_queue_families(instance, device) else {
            continue;
        };

        let score = score_physical_device(&capabilities);
        if score > best_score {
            best_score = score;
            best = Some((device, capabilities, families));
        }
    }

    best.ok_or(GpuError::NoSuitableDevice)
}

fn score_physical_device(capabilities: &DeviceCapabilities) -> i64 {
    let mut score = 1;

    match capabilities.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => score += 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => score += 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => score += 50,
        _ => {}
    }

    // +1 per GB of VRAM
    score += (capabilities.device_local_memory_mb / 1024) as i64;

    score
}

/// Find queue families; `None` when graphics (or present, for windowed
/// instances) is unavailable.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_queue_families(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> Option<QueueFamilyIndices> {
    let queue_families = instance
        .handle()
        .get_physical_device_queue_family_properties(physical_device);

    let mut graphics_family = None;
    let mut compute_family = None;
    let mut transfer_family = None;
    let mut present_family = None;

    for (i, family) in queue_families.iter().enumerate() {
        let i = i as u32;

        // Prefer a dedicated compute queue (no graphics)
        if family.queue_flags.contains(vk::QueueFlags::COMPUTE)
            && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && compute_family.is_none()
        {
            compute_family = Some(i);
        }

        // Prefer a dedicated transfer queue (no graphics or compute)
        if family.queue_flags.contains(vk::QueueFlags::TRANSFER)
            && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && !family.queue_flags.contains(vk::QueueFlags::COMPUTE)
            && transfer_family.is_none()
        {
            transfer_family = Some(i);
        }

        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
            graphics_family = Some(i);
        }

        if present_family.is_none() {
            if let (Some(surface), Some(loader)) = (instance.surface(), instance.surface_loader()) {
                let supported = loader
                    .get_physical_device_surface_support(physical_device, i, surface)
                    .unwrap_or(false);
                if supported {
                    present_family = Some(i);
                }
            }
        }
    }

    let graphics = graphics_family?;
    let compute = compute_family.unwrap_or(graphics);
    let transfer = transfer_family.unwrap_or(compute);
    let present = if instance.surface().is_some() {
        present_family?
    } else {
        graphics
    };

    Some(QueueFamilyIndices {
        graphics,
        compute,
        transfer,
        present,
    })
}

/// Device extensions required for `features`.
fn required_device_extensions(features: DeviceFeatures, presentable: bool) -> Vec<&'static CStr> {
    let mut extensions = Vec::new();

    if presentable {
        extensions.push(ash::khr::swapchain::NAME);
    }

    if features.contains(DeviceFeatures::RAY_TRACE) {
        extensions.extend([
            ash::khr::acceleration_structure::NAME,
            ash::khr::ray_tracing_pipeline::NAME,
            ash::khr::deferred_host_operations::NAME,
            ash::khr::pipeline_library::NAME,
            ash::khr::spirv_1_4::NAME,
            ash::khr::shader_float_controls::NAME,
        ]);
    }

    extensions
}

/// Create the logical device with the feature chain for `features`.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: &QueueFamilyIndices,
    features: DeviceFeatures,
    presentable: bool,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extensions = required_device_extensions(features, presentable);
    let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let base_features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(features.contains(DeviceFeatures::ANISOTROPY));
    let mut features2 = vk::PhysicalDeviceFeatures2::default().features(base_features);

    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(features.contains(DeviceFeatures::BUFFER_ADDRESS))
        .descriptor_indexing(true)
        .scalar_block_layout(true)
        .runtime_descriptor_array(true);

    let mut acceleration_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
    let mut ray_tracing_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

    let mut create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2)
        .push_next(&mut vulkan_1_2_features);

    if features.contains(DeviceFeatures::RAY_TRACE) {
        create_info = create_info
            .push_next(&mut acceleration_features)
            .push_next(&mut ray_tracing_features);
    }

    let device = instance
        .create_device(physical_device, &create_info, None)
        .map_err(GpuError::from)?;

    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ray_trace_implies_buffer_address() {
        assert!(DeviceFeatures::RAY_TRACE.contains(DeviceFeatures::BUFFER_ADDRESS));
        assert!(!DeviceFeatures::BUFFER_ADDRESS.contains(DeviceFeatures::RAY_TRACE));
        assert!(!DeviceFeatures::ANISOTROPY.contains(DeviceFeatures::BUFFER_ADDRESS));
    }

    #[test]
    fn unique_families_deduplicate() {
        let families = QueueFamilyIndices {
            graphics: 0,
            compute: 0,
            transfer: 1,
            present: 0,
        };
        assert_eq!(families.unique(), vec![0, 1]);
        assert!(families.shares_present_family());

        let split = QueueFamilyIndices {
            graphics: 0,
            compute: 1,
            transfer: 2,
            present: 3,
        };
        assert_eq!(split.unique(), vec![0, 1, 2, 3]);
        assert!(!split.shares_present_family());
    }

    #[test]
    fn device_extensions_follow_features() {
        let minimal = required_device_extensions(DeviceFeatures::empty(), true);
        assert_eq!(minimal, vec![ash::khr::swapchain::NAME]);

        let rt = required_device_extensions(DeviceFeatures::RAY_TRACE, true);
        assert!(rt.contains(&ash::khr::acceleration_structure::NAME));
        assert!(rt.contains(&ash::khr::ray_tracing_pipeline::NAME));
        assert!(rt.contains(&ash::khr::deferred_host_operations::NAME));

        let headless = required_device_extensions(DeviceFeatures::empty(), false);
        assert!(headless.is_empty());
    }
}
