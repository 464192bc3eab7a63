//! GPU capability detection.

use crate::device::DeviceFeatures;
use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    #[must_use]
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Ray tracing limits queried from the extension property structs.
#[derive(Debug, Clone, Copy)]
pub struct RayTracingCapabilities {
    /// Size of one shader group handle, in bytes.
    pub shader_group_handle_size: u32,
    /// Required alignment of each handle within a group record.
    pub shader_group_handle_alignment: u32,
    /// Required alignment of each table region's base address.
    pub shader_group_base_alignment: u32,
    /// Maximum recursion depth supported by trace calls.
    pub max_ray_recursion_depth: u32,
    /// Required alignment of acceleration structure scratch offsets.
    pub min_scratch_offset_alignment: u32,
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Device type (discrete, integrated, ...)
    pub device_type: vk::PhysicalDeviceType,
    /// Device memory properties, consumed by the memory-type search.
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Maximum sampler anisotropy
    pub max_sampler_anisotropy: f32,
    /// Whether the device supports sampler anisotropy at all
    pub supports_anisotropy: bool,
    /// Whether acceleration structures are supported
    pub supports_acceleration_structure: bool,
    /// Ray tracing limits, present when the extensions are available.
    pub ray_tracing: Option<RayTracingCapabilities>,
    /// Available device extensions
    pub available_extensions: HashSet<String>,
}

impl DeviceCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);
        let features = instance.get_physical_device_features(physical_device);

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();
        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let supports_acceleration_structure =
            available_extensions.contains("VK_KHR_acceleration_structure");
        let supports_ray_tracing_pipeline =
            available_extensions.contains("VK_KHR_ray_tracing_pipeline");

        let ray_tracing = if supports_acceleration_structure && supports_ray_tracing_pipeline {
            let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
            let mut as_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
            let mut properties2 = vk::PhysicalDeviceProperties2::default()
                .push_next(&mut rt_props)
                .push_next(&mut as_props);
            instance.get_physical_device_properties2(physical_device, &mut properties2);

            Some(RayTracingCapabilities {
                shader_group_handle_size: rt_props.shader_group_handle_size,
                shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
                shader_group_base_alignment: rt_props.shader_group_base_alignment,
                max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
                min_scratch_offset_alignment: as_props
                    .min_acceleration_structure_scratch_offset_alignment,
            })
        } else {
            None
        };

        Self {
            vendor,
            device_name,
            api_version: properties.api_version,
            device_type: properties.device_type,
            memory_properties,
            device_local_memory_mb,
            max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,
            supports_anisotropy: features.sampler_anisotropy == vk::TRUE,
            supports_acceleration_structure,
            ray_tracing,
            available_extensions,
        }
    }

    /// Check whether this device can serve the requested feature set.
    #[must_use]
    pub fn meets_requirements(&self, features: DeviceFeatures) -> bool {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);
        if api_major < 1 || (api_major == 1 && api_minor < 2) {
            return false;
        }

        if features.contains(DeviceFeatures::RAY_TRACE) && self.ray_tracing.is_none() {
            return false;
        }
        if features.contains(DeviceFeatures::ANISOTROPY) && !self.supports_anisotropy {
            return false;
        }

        true
    }

    /// Get a human-readable summary of capabilities.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - ray tracing: {}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            self.ray_tracing.is_some(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0xFFFF), GpuVendor::Other(0xFFFF));
    }
}
