//! Bottom- and top-level acceleration structures.
//!
//! Both levels share one build protocol: query build sizes, round the
//! structure size to 256 bytes and the scratch size to the device's
//! scratch offset alignment, allocate device-local storage and scratch,
//! then build synchronously on the ray tracing queue.

use ash::vk;
use bytemuck::Pod;
use glam::Mat4;
use obsidian_core::round_up;
use obsidian_gpu::{Buffer, Device, GpuError, Result};

/// Acceleration structure storage lives at 256-byte granularity.
const STRUCTURE_SIZE_ALIGNMENT: u64 = 256;

/// Number of triangles described by `index_count` indices. The index list
/// must form whole triangles.
fn triangle_count(index_count: usize) -> Result<u32> {
    if index_count < 3 || index_count % 3 != 0 {
        return Err(GpuError::AccelerationBuild(format!(
            "index count {index_count} does not form whole triangles"
        )));
    }
    Ok((index_count / 3) as u32)
}

/// Instance custom indices carry 24 bits.
const MAX_INSTANCE_ID: u32 = (1 << 24) - 1;

mod sealed {
    pub trait Sealed {}
    impl Sealed for u16 {}
    impl Sealed for u32 {}
}

/// Index element types accepted by [`Blas::new`].
pub trait IndexElement: sealed::Sealed + Pod {
    const INDEX_TYPE: vk::IndexType;
}

impl IndexElement for u16 {
    const INDEX_TYPE: vk::IndexType = vk::IndexType::UINT16;
}

impl IndexElement for u32 {
    const INDEX_TYPE: vk::IndexType = vk::IndexType::UINT32;
}

/// Hands out unique, strictly increasing 24-bit instance ids.
#[derive(Debug, Default)]
pub struct InstanceAllocator {
    next: u32,
}

impl InstanceAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    /// Allocate the next id. Errors once the 24-bit space is exhausted.
    pub fn allocate(&mut self) -> Result<u32> {
        if self.next > MAX_INSTANCE_ID {
            return Err(GpuError::InvalidState(
                "instance id space exhausted".to_string(),
            ));
        }
        let id = self.next;
        self.next += 1;
        Ok(id)
    }

    /// Number of ids handed out so far.
    #[must_use]
    pub const fn allocated(&self) -> u32 {
        self.next
    }
}

struct BuiltStructure {
    loader: ash::khr::acceleration_structure::Device,
    handle: vk::AccelerationStructureKHR,
    /// Backing allocation, kept alive for the structure's lifetime.
    _storage: Buffer,
    address: vk::DeviceAddress,
}

impl Drop for BuiltStructure {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_acceleration_structure(self.handle, None);
        }
    }
}

/// Run the shared build protocol for one geometry.
unsafe fn build_structure(
    device: &Device,
    ty: vk::AccelerationStructureTypeKHR,
    geometry: vk::AccelerationStructureGeometryKHR<'_>,
    primitive_count: u32,
) -> Result<BuiltStructure> {
    let loader = device.acceleration_loader()?.clone();
    let scratch_alignment = u64::from(
        device
            .capabilities()
            .ray_tracing
            .ok_or(GpuError::FeatureNotEnabled("RAY_TRACE"))?
            .min_scratch_offset_alignment,
    );

    let geometries = [geometry];
    let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(ty)
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(&geometries);

    let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
    loader.get_acceleration_structure_build_sizes(
        vk::AccelerationStructureBuildTypeKHR::DEVICE,
        &build_info,
        &[primitive_count],
        &mut size_info,
    );

    let structure_size = round_up(
        size_info.acceleration_structure_size,
        STRUCTURE_SIZE_ALIGNMENT,
    );
    let scratch_size = round_up(size_info.build_scratch_size, scratch_alignment);

    let storage = device.create_acceleration_storage_buffer(structure_size)?;
    let handle = loader.create_acceleration_structure(
        &vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(storage.handle())
            .size(structure_size)
            .ty(ty),
        None,
    )?;

    // Over-allocate so the scratch address can be rounded up to the
    // device's scratch offset alignment.
    let scratch = match device.create_device_buffer(
        scratch_size + scratch_alignment,
        vk::BufferUsageFlags::STORAGE_BUFFER,
    ) {
        Ok(scratch) => scratch,
        Err(e) => {
            loader.destroy_acceleration_structure(handle, None);
            return Err(e);
        }
    };

    let result: Result<()> = (|| {
        let scratch_address = round_up(scratch.address()?, scratch_alignment);
        build_info = build_info
            .dst_acceleration_structure(handle)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            });

        let range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(primitive_count);

        let pool = device.ray_trace_pool()?;
        let cmd = pool.allocate()?;
        cmd.execute_immediately(|cb| {
            loader.cmd_build_acceleration_structures(
                cb.handle(),
                std::slice::from_ref(&build_info),
                &[std::slice::from_ref(&range)],
            );
            Ok(())
        })
    })();
    if let Err(e) = result {
        loader.destroy_acceleration_structure(handle, None);
        return Err(e);
    }

    let address = loader.get_acceleration_structure_device_address(
        &vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle),
    );
    if address == 0 {
        loader.destroy_acceleration_structure(handle, None);
        return Err(GpuError::AccelerationBuild(
            "acceleration structure reported a null device address".to_string(),
        ));
    }

    tracing::debug!(?ty, primitive_count, address, "Built acceleration structure");

    Ok(BuiltStructure {
        loader,
        handle,
        _storage: storage,
        address,
    })
}

/// Bottom-level acceleration structure over an indexed triangle mesh.
///
/// Vertex types must start with a `[f32; 3]` position; the remaining
/// bytes are skipped via the vertex stride.
pub struct Blas {
    built: BuiltStructure,
    vertex_buffer: Buffer,
    index_buffer: Buffer,
}

impl Blas {
    /// Upload the mesh and build the structure.
    ///
    /// # Safety
    /// The device must outlive the returned value.
    pub unsafe fn new<V: Pod, I: IndexElement>(
        device: &Device,
        vertices: &[V],
        indices: &[I],
    ) -> Result<Self> {
        if vertices.is_empty() {
            return Err(GpuError::AccelerationBuild(
                "mesh has no vertices".to_string(),
            ));
        }
        let primitive_count = triangle_count(indices.len())?;

        let vertex_buffer = device.create_vertex_buffer(vertices)?;
        let index_buffer = device.create_index_buffer(indices)?;

        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: vertex_buffer.address()?,
            })
            .vertex_stride(std::mem::size_of::<V>() as u64)
            .max_vertex(vertices.len() as u32 - 1)
            .index_type(I::INDEX_TYPE)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: index_buffer.address()?,
            });
        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(vk::GeometryFlagsKHR::OPAQUE);

        let built = build_structure(
            device,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            geometry,
            primitive_count,
        )?;

        Ok(Self {
            built,
            vertex_buffer,
            index_buffer,
        })
    }

    /// Get the raw structure handle.
    #[must_use]
    pub const fn handle(&self) -> vk::AccelerationStructureKHR {
        self.built.handle
    }

    /// Device address referenced by instances.
    #[must_use]
    pub const fn address(&self) -> vk::DeviceAddress {
        self.built.address
    }

    /// The uploaded vertex buffer.
    #[must_use]
    pub const fn vertex_buffer(&self) -> &Buffer {
        &self.vertex_buffer
    }

    /// The uploaded index buffer.
    #[must_use]
    pub const fn index_buffer(&self) -> &Buffer {
        &self.index_buffer
    }

    /// An instance of this structure with a fresh id from `ids`.
    ///
    /// The instance is visible to all ray masks and disables facing
    /// culling.
    pub fn instance(
        &self,
        ids: &mut InstanceAllocator,
        transform: Mat4,
    ) -> Result<vk::AccelerationStructureInstanceKHR> {
        let id = ids.allocate()?;
        Ok(vk::AccelerationStructureInstanceKHR {
            transform: transform_to_vk(transform),
            instance_custom_index_and_mask: vk::Packed24_8::new(id, 0xFF),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                0,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: self.built.address,
            },
        })
    }
}

/// Convert a column-major matrix into the row-major 3x4 layout instance
/// transforms use.
#[must_use]
pub fn transform_to_vk(transform: Mat4) -> vk::TransformMatrixKHR {
    let r0 = transform.row(0).to_array();
    let r1 = transform.row(1).to_array();
    let r2 = transform.row(2).to_array();
    vk::TransformMatrixKHR {
        matrix: [
            r0[0], r0[1], r0[2], r0[3], //
            r1[0], r1[1], r1[2], r1[3], //
            r2[0], r2[1], r2[2], r2[3],
        ],
    }
}

/// Top-level acceleration structure over instances of bottom-level ones.
pub struct Tlas {
    built: BuiltStructure,
    instance_buffer: Buffer,
    instance_count: u32,
}

impl Tlas {
    /// Build over `instances`. An empty slice yields a valid structure
    /// that traces to miss shaders only.
    ///
    /// # Safety
    /// Every referenced bottom-level structure must outlive the result.
    pub unsafe fn new(
        device: &Device,
        instances: &[vk::AccelerationStructureInstanceKHR],
    ) -> Result<Self> {
        let instance_size = std::mem::size_of::<vk::AccelerationStructureInstanceKHR>();
        let buffer_size = (instance_size * instances.len().max(1)) as u64;
        let instance_buffer = device.create_host_buffer(
            buffer_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
        )?;
        instance_buffer.fill_zero()?;
        if !instances.is_empty() {
            // vk::AccelerationStructureInstanceKHR contains unions, so
            // view it as raw bytes for the copy.
            let bytes = std::slice::from_raw_parts(
                instances.as_ptr().cast::<u8>(),
                std::mem::size_of_val(instances),
            );
            instance_buffer.write(bytes)?;
        }

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instance_buffer.address()?,
            });
        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data,
            })
            .flags(vk::GeometryFlagsKHR::OPAQUE);

        let built = build_structure(
            device,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            geometry,
            instances.len() as u32,
        )?;

        Ok(Self {
            built,
            instance_buffer,
            instance_count: instances.len() as u32,
        })
    }

    /// Replace the structure with a build over a new instance set.
    ///
    /// Waits for the device to go idle before releasing the old
    /// structure.
    ///
    /// # Safety
    /// See [`Tlas::new`].
    pub unsafe fn rebuild(
        &mut self,
        device: &Device,
        instances: &[vk::AccelerationStructureInstanceKHR],
    ) -> Result<()> {
        let replacement = Self::new(device, instances)?;
        device.wait_idle()?;
        *self = replacement;
        Ok(())
    }

    /// Get the raw structure handle.
    #[must_use]
    pub const fn handle(&self) -> vk::AccelerationStructureKHR {
        self.built.handle
    }

    /// Device address of the structure.
    #[must_use]
    pub const fn address(&self) -> vk::DeviceAddress {
        self.built.address
    }

    /// Number of instances the current build covers.
    #[must_use]
    pub const fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// The host-visible buffer holding the instance records the build
    /// consumed.
    #[must_use]
    pub const fn instance_buffer(&self) -> &Buffer {
        &self.instance_buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_counts_must_form_whole_triangles() {
        assert_eq!(triangle_count(3).unwrap(), 1);
        assert_eq!(triangle_count(6).unwrap(), 2);
        assert_eq!(triangle_count(36).unwrap(), 12);

        for bad in [0, 1, 2, 4, 5, 7] {
            assert!(
                matches!(triangle_count(bad), Err(GpuError::AccelerationBuild(_))),
                "index count {bad} must be rejected"
            );
        }
    }

    #[test]
    fn instance_ids_are_unique_and_increasing() {
        let mut ids = InstanceAllocator::new();
        let first = ids.allocate().unwrap();
        let second = ids.allocate().unwrap();
        let third = ids.allocate().unwrap();
        assert_eq!(first, 0);
        assert!(second > first);
        assert!(third > second);
        assert_eq!(ids.allocated(), 3);
    }

    #[test]
    fn instance_ids_exhaust_at_24_bits() {
        let mut ids = InstanceAllocator {
            next: MAX_INSTANCE_ID,
        };
        assert_eq!(ids.allocate().unwrap(), MAX_INSTANCE_ID);
        assert!(ids.allocate().is_err());
    }

    #[test]
    fn identity_transform_maps_to_identity_rows() {
        let m = transform_to_vk(Mat4::IDENTITY).matrix;
        let expected = [
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0,
        ];
        for (actual, expected) in m.iter().zip(expected) {
            approx::assert_relative_eq!(*actual, expected);
        }
    }

    #[test]
    fn translation_lands_in_the_fourth_column() {
        let m = transform_to_vk(Mat4::from_translation(glam::Vec3::new(1.0, 2.0, 3.0))).matrix;
        approx::assert_relative_eq!(m[3], 1.0);
        approx::assert_relative_eq!(m[7], 2.0);
        approx::assert_relative_eq!(m[11], 3.0);
    }
}
