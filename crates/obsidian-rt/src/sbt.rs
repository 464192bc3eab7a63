//! Shader binding table layout and construction.
//!
//! The table packs one shader group handle per record, each record
//! occupying a base-aligned slot. Region arithmetic is kept in
//! [`SbtLayout`] so it can be checked without a device.

use ash::vk;
use obsidian_core::round_up_u32;
use obsidian_gpu::{Buffer, Device, GpuError, RayTracingCapabilities, Result};

/// Per-category group counts. The ray generation group is always one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SbtCounts {
    /// Miss shader groups.
    pub miss: u32,
    /// Hit groups (triangle or procedural).
    pub hit: u32,
    /// Callable shader groups.
    pub callable: u32,
}

/// Pure shader-binding-table arithmetic derived from device limits.
#[derive(Debug, Clone, Copy)]
pub struct SbtLayout {
    /// Raw handle size reported by the device.
    pub handle_size: u32,
    /// Handle size rounded to the handle alignment.
    pub handle_stride: u32,
    /// Record size: handle size rounded to the base alignment.
    pub group_stride: u32,
    /// Group counts per category.
    pub counts: SbtCounts,
}

impl SbtLayout {
    /// Derive the layout from device limits and group counts.
    #[must_use]
    pub fn new(caps: &RayTracingCapabilities, counts: SbtCounts) -> Self {
        Self {
            handle_size: caps.shader_group_handle_size,
            handle_stride: round_up_u32(
                caps.shader_group_handle_size,
                caps.shader_group_handle_alignment,
            ),
            group_stride: round_up_u32(
                caps.shader_group_handle_size,
                caps.shader_group_base_alignment,
            ),
            counts,
        }
    }

    /// Total number of groups, ray generation included.
    #[must_use]
    pub const fn group_count(&self) -> u32 {
        1 + self.counts.miss + self.counts.hit + self.counts.callable
    }

    /// Size of the backing buffer: one record per group.
    #[must_use]
    pub const fn buffer_size(&self) -> u64 {
        self.group_count() as u64 * self.group_stride as u64
    }

    /// Byte offset of the record for group index `group`.
    #[must_use]
    pub const fn record_offset(&self, group: u32) -> u64 {
        group as u64 * self.group_stride as u64
    }

    /// The four strided regions relative to `base_address`. Empty
    /// categories yield zeroed regions.
    #[must_use]
    pub fn regions(&self, base_address: vk::DeviceAddress) -> SbtRegions {
        let stride = u64::from(self.group_stride);
        let category = |first_group: u32, count: u32| {
            if count == 0 {
                vk::StridedDeviceAddressRegionKHR::default()
            } else {
                vk::StridedDeviceAddressRegionKHR {
                    device_address: base_address + self.record_offset(first_group),
                    stride,
                    size: u64::from(count) * stride,
                }
            }
        };

        // Trace calls require the ray-gen region's size to equal its
        // stride (VUID-vkCmdTraceRaysKHR-size-04023).
        let raygen = vk::StridedDeviceAddressRegionKHR {
            device_address: base_address,
            stride,
            size: stride,
        };
        let miss = category(1, self.counts.miss);
        let hit = category(1 + self.counts.miss, self.counts.hit);
        let callable = category(
            1 + self.counts.miss + self.counts.hit,
            self.counts.callable,
        );

        SbtRegions {
            raygen,
            miss,
            hit,
            callable,
        }
    }
}

/// The four regions handed to trace calls.
#[derive(Debug, Clone, Copy)]
pub struct SbtRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

/// Shader binding table: a host-visible buffer of group handles plus the
/// regions describing it.
pub struct ShaderBindingTable {
    buffer: Buffer,
    layout: SbtLayout,
    regions: SbtRegions,
}

impl ShaderBindingTable {
    /// Fetch all group handles from `pipeline` and pack them into a
    /// fresh table.
    ///
    /// # Safety
    /// The pipeline must be a valid ray tracing pipeline with exactly
    /// the groups described by `counts`.
    pub unsafe fn new(
        device: &Device,
        pipeline: vk::Pipeline,
        counts: SbtCounts,
    ) -> Result<Self> {
        let caps = device
            .capabilities()
            .ray_tracing
            .ok_or(GpuError::FeatureNotEnabled("RAY_TRACE"))?;
        let layout = SbtLayout::new(&caps, counts);
        let group_count = layout.group_count();

        let handles = device.ray_tracing_loader()?.get_ray_tracing_shader_group_handles(
            pipeline,
            0,
            group_count,
            (layout.handle_size * group_count) as usize,
        )?;

        let buffer = device.create_host_buffer(
            layout.buffer_size(),
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR,
        )?;
        buffer.fill_zero()?;

        let handle_size = layout.handle_size as usize;
        for group in 0..group_count {
            let start = group as usize * handle_size;
            buffer.write_at(
                layout.record_offset(group),
                &handles[start..start + handle_size],
            )?;
        }

        let regions = layout.regions(buffer.address()?);

        Ok(Self {
            buffer,
            layout,
            regions,
        })
    }

    /// The backing buffer.
    #[must_use]
    pub const fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// The layout the table was packed with.
    #[must_use]
    pub const fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    /// Regions for trace calls.
    #[must_use]
    pub const fn regions(&self) -> &SbtRegions {
        &self.regions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(handle_size: u32, handle_alignment: u32, base_alignment: u32) -> RayTracingCapabilities {
        RayTracingCapabilities {
            shader_group_handle_size: handle_size,
            shader_group_handle_alignment: handle_alignment,
            shader_group_base_alignment: base_alignment,
            max_ray_recursion_depth: 1,
            min_scratch_offset_alignment: 128,
        }
    }

    #[test]
    fn strides_follow_alignment_limits() {
        // Nvidia-like limits
        let layout = SbtLayout::new(&caps(32, 32, 64), SbtCounts::default());
        assert_eq!(layout.handle_stride, 32);
        assert_eq!(layout.group_stride, 64);

        let layout = SbtLayout::new(&caps(32, 64, 64), SbtCounts::default());
        assert_eq!(layout.handle_stride, 64);
        assert_eq!(layout.group_stride, 64);
    }

    #[test]
    fn buffer_size_is_group_count_times_group_stride() {
        let counts = SbtCounts {
            miss: 2,
            hit: 3,
            callable: 1,
        };
        let layout = SbtLayout::new(&caps(32, 32, 64), counts);
        assert_eq!(layout.group_count(), 7);
        assert_eq!(layout.buffer_size(), 7 * 64);
    }

    #[test]
    fn region_sizes_sum_to_buffer_size() {
        let counts = SbtCounts {
            miss: 2,
            hit: 3,
            callable: 1,
        };
        let layout = SbtLayout::new(&caps(32, 32, 64), counts);
        let regions = layout.regions(0x1_0000);

        let sum =
            regions.raygen.size + regions.miss.size + regions.hit.size + regions.callable.size;
        assert_eq!(sum, layout.buffer_size());
    }

    #[test]
    fn raygen_region_size_equals_stride() {
        let layout = SbtLayout::new(&caps(32, 32, 64), SbtCounts::default());
        let regions = layout.regions(0x1_0000);
        assert_eq!(regions.raygen.size, regions.raygen.stride);
        assert_eq!(regions.raygen.device_address, 0x1_0000);
    }

    #[test]
    fn empty_categories_yield_zeroed_regions() {
        let layout = SbtLayout::new(&caps(32, 32, 64), SbtCounts::default());
        let regions = layout.regions(0x1_0000);

        for region in [regions.miss, regions.hit, regions.callable] {
            assert_eq!(region.device_address, 0);
            assert_eq!(region.stride, 0);
            assert_eq!(region.size, 0);
        }
    }

    #[test]
    fn regions_are_contiguous_records() {
        let counts = SbtCounts {
            miss: 1,
            hit: 2,
            callable: 0,
        };
        let layout = SbtLayout::new(&caps(32, 32, 64), counts);
        let base = 0x8000;
        let regions = layout.regions(base);

        assert_eq!(regions.miss.device_address, base + 64);
        assert_eq!(regions.hit.device_address, base + 2 * 64);
        assert_eq!(regions.hit.size, 2 * 64);
    }

    #[test]
    fn record_offsets_use_group_stride() {
        let layout = SbtLayout::new(&caps(32, 32, 64), SbtCounts { miss: 1, hit: 1, callable: 0 });
        assert_eq!(layout.record_offset(0), 0);
        assert_eq!(layout.record_offset(1), 64);
        assert_eq!(layout.record_offset(2), 128);
    }
}
