//! Buffers, images and samplers with explicit memory typing.
//!
//! Allocation picks the first memory type that satisfies the requested
//! property flags; there is no suballocation and no silent fallback.

use crate::device::{Device, DeviceFeatures};
use crate::error::{GpuError, Result};
use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;

/// A Vulkan buffer with its dedicated memory allocation.
pub struct Buffer {
    device: Arc<ash::Device>,
    handle: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
    host_visible: bool,
    has_address: bool,
}

impl Buffer {
    /// Host-visible, host-coherent buffer.
    pub fn new_host(device: &Device, size: u64, usage: vk::BufferUsageFlags) -> Result<Self> {
        Self::new(
            device,
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    /// Host-visible buffer initialized with `data`.
    pub fn new_host_with_data<T: Pod>(
        device: &Device,
        data: &[T],
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buffer = Self::new_host(device, bytes.len() as u64, usage)?;
        buffer.write(bytes)?;
        Ok(buffer)
    }

    /// Device-local buffer.
    pub fn new_device_local(
        device: &Device,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        Self::new(device, size, usage, vk::MemoryPropertyFlags::DEVICE_LOCAL)
    }

    /// Create a buffer and bind a fresh allocation of the first matching
    /// memory type.
    pub fn new(
        device: &Device,
        size: u64,
        mut usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        if size == 0 {
            return Err(GpuError::InvalidState("zero-sized buffer".to_string()));
        }

        let has_address = device.features().contains(DeviceFeatures::BUFFER_ADDRESS);
        if has_address {
            usage |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        unsafe {
            let handle = device.handle().create_buffer(&buffer_info, None)?;
            let requirements = device.handle().get_buffer_memory_requirements(handle);

            let memory_type = match device.find_memory_type(requirements.memory_type_bits, properties)
            {
                Ok(index) => index,
                Err(e) => {
                    device.handle().destroy_buffer(handle, None);
                    return Err(e);
                }
            };

            let mut flags_info = vk::MemoryAllocateFlagsInfo::default()
                .flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
            let mut alloc_info = vk::MemoryAllocateInfo::default()
                .allocation_size(requirements.size)
                .memory_type_index(memory_type);
            if has_address {
                alloc_info = alloc_info.push_next(&mut flags_info);
            }

            let memory = match device.handle().allocate_memory(&alloc_info, None) {
                Ok(memory) => memory,
                Err(e) => {
                    device.handle().destroy_buffer(handle, None);
                    return Err(e.into());
                }
            };

            if let Err(e) = device.handle().bind_buffer_memory(handle, memory, 0) {
                device.handle().destroy_buffer(handle, None);
                device.handle().free_memory(memory, None);
                return Err(e.into());
            }

            Ok(Self {
                device: device.shared(),
                handle,
                memory,
                size,
                host_visible: properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
                has_address,
            })
        }
    }

    /// Get the raw buffer handle.
    #[must_use]
    pub const fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Buffer size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Whether the buffer is mappable.
    #[must_use]
    pub const fn is_host_visible(&self) -> bool {
        self.host_visible
    }

    /// Device address of the buffer.
    ///
    /// Reported as [`GpuError::FeatureNotEnabled`] when the device was
    /// created without `BUFFER_ADDRESS`.
    pub fn address(&self) -> Result<vk::DeviceAddress> {
        if !self.has_address {
            return Err(GpuError::FeatureNotEnabled("BUFFER_ADDRESS"));
        }
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.handle);
        Ok(unsafe { self.device.get_buffer_device_address(&info) })
    }

    /// Write `bytes` at the start of a host-visible buffer.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        self.write_at(0, bytes)
    }

    /// Write `bytes` at `offset` into a host-visible buffer.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        if offset + bytes.len() as u64 > self.size {
            return Err(GpuError::InvalidState(format!(
                "write of {} bytes at offset {offset} exceeds buffer size {}",
                bytes.len(),
                self.size
            )));
        }
        let ptr = self.map(offset, bytes.len() as u64)?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
            self.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Write a `Pod` slice at the start of a host-visible buffer.
    pub fn write_slice<T: Pod>(&self, data: &[T]) -> Result<()> {
        self.write(bytemuck::cast_slice(data))
    }

    /// Zero the whole buffer through a mapping.
    pub fn fill_zero(&self) -> Result<()> {
        let ptr = self.map(0, self.size)?;
        unsafe {
            std::ptr::write_bytes(ptr, 0, self.size as usize);
            self.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    fn map(&self, offset: u64, len: u64) -> Result<*mut u8> {
        if !self.host_visible {
            return Err(GpuError::InvalidState(
                "mapping a device-local buffer".to_string(),
            ));
        }
        let ptr = unsafe {
            self.device
                .map_memory(self.memory, offset, len, vk::MemoryMapFlags::empty())?
        };
        Ok(ptr.cast())
    }

    /// Copy the full contents of `staging` into this buffer through a
    /// blocking transfer submission. The staging buffer must fit in the
    /// destination.
    pub fn upload_from(&self, device: &Device, staging: &Self) -> Result<()> {
        let size = upload_copy_size(self.size, staging.size)?;
        let pool = device.transfer_pool()?;
        let cmd = pool.allocate()?;
        unsafe {
            cmd.execute_immediately(|cmd| {
                cmd.copy_buffer(staging, self, size);
                Ok(())
            })
        }
    }
}

/// Size copied by [`Buffer::upload_from`]. A staging buffer larger than the
/// destination would lose bytes, so it is rejected.
fn upload_copy_size(dst_size: u64, staging_size: u64) -> Result<u64> {
    if staging_size > dst_size {
        return Err(GpuError::InvalidState(format!(
            "staging buffer of {staging_size} bytes exceeds destination of {dst_size} bytes"
        )));
    }
    Ok(staging_size)
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.handle, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// A 2D image with its allocation, view, and tracked layout.
pub struct Image2D {
    device: Arc<ash::Device>,
    handle: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    format: vk::Format,
    extent: vk::Extent2D,
    aspect: vk::ImageAspectFlags,
    layout: vk::ImageLayout,
}

impl Image2D {
    /// Create a device-local 2D image with a full view.
    pub fn new(
        device: &Device,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        unsafe {
            let handle = device.handle().create_image(&image_info, None)?;
            let requirements = device.handle().get_image_memory_requirements(handle);

            let memory_type = match device.find_memory_type(
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ) {
                Ok(index) => index,
                Err(e) => {
                    device.handle().destroy_image(handle, None);
                    return Err(e);
                }
            };

            let alloc_info = vk::MemoryAllocateInfo::default()
                .allocation_size(requirements.size)
                .memory_type_index(memory_type);
            let memory = match device.handle().allocate_memory(&alloc_info, None) {
                Ok(memory) => memory,
                Err(e) => {
                    device.handle().destroy_image(handle, None);
                    return Err(e.into());
                }
            };

            if let Err(e) = device.handle().bind_image_memory(handle, memory, 0) {
                device.handle().destroy_image(handle, None);
                device.handle().free_memory(memory, None);
                return Err(e.into());
            }

            let view_info = vk::ImageViewCreateInfo::default()
                .image(handle)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(aspect)
                        .level_count(1)
                        .layer_count(1),
                );
            let view = match device.handle().create_image_view(&view_info, None) {
                Ok(view) => view,
                Err(e) => {
                    device.handle().destroy_image(handle, None);
                    device.handle().free_memory(memory, None);
                    return Err(e.into());
                }
            };

            Ok(Self {
                device: device.shared(),
                handle,
                memory,
                view,
                format,
                extent,
                aspect,
                layout: vk::ImageLayout::UNDEFINED,
            })
        }
    }

    /// Get the raw image handle.
    #[must_use]
    pub const fn handle(&self) -> vk::Image {
        self.handle
    }

    /// Get the image view.
    #[must_use]
    pub const fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Image format.
    #[must_use]
    pub const fn format(&self) -> vk::Format {
        self.format
    }

    /// Image extent.
    #[must_use]
    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Aspect used for views and barriers.
    #[must_use]
    pub const fn aspect(&self) -> vk::ImageAspectFlags {
        self.aspect
    }

    /// Layout the image is currently tracked in.
    #[must_use]
    pub const fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Transition the image to `new_layout` with a blocking one-shot
    /// submission. Only the known layout pairs are supported.
    pub fn transition_layout(&mut self, device: &Device, new_layout: vk::ImageLayout) -> Result<()> {
        let pool = device.raster_pool()?;
        let cmd = pool.allocate()?;
        let (handle, aspect, old_layout) = (self.handle, self.aspect, self.layout);
        unsafe {
            cmd.execute_immediately(|cmd| {
                cmd.transition_image(handle, aspect, old_layout, new_layout)
            })?;
        }
        self.layout = new_layout;
        Ok(())
    }

    /// Upload pixel data from `staging` and leave the image in
    /// `final_layout`. Both transitions go through the known-pair rules.
    pub fn upload_from(
        &mut self,
        device: &Device,
        staging: &Buffer,
        final_layout: vk::ImageLayout,
    ) -> Result<()> {
        let pool = device.raster_pool()?;
        let cmd = pool.allocate()?;
        let (handle, aspect, old_layout) = (self.handle, self.aspect, self.layout);
        unsafe {
            cmd.execute_immediately(|cmd| {
                cmd.transition_image(
                    handle,
                    aspect,
                    old_layout,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                )?;
                cmd.copy_buffer_to_image(staging, self);
                cmd.transition_image(
                    handle,
                    aspect,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    final_layout,
                )
            })?;
        }
        self.layout = final_layout;
        Ok(())
    }
}

impl Drop for Image2D {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.handle, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// Sampler creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    /// Magnification filter.
    pub mag_filter: vk::Filter,
    /// Minification filter.
    pub min_filter: vk::Filter,
    /// Address mode for all coordinates.
    pub address_mode: vk::SamplerAddressMode,
    /// Request anisotropic filtering.
    pub anisotropy: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            anisotropy: false,
        }
    }
}

/// Owned sampler handle.
pub struct Sampler {
    device: Arc<ash::Device>,
    handle: vk::Sampler,
}

impl Sampler {
    /// Create a sampler. Anisotropy is dropped with a warning when the
    /// device was created without the feature.
    pub fn new(device: &Device, config: &SamplerConfig) -> Result<Self> {
        let anisotropy_enabled =
            config.anisotropy && device.features().contains(DeviceFeatures::ANISOTROPY);
        if config.anisotropy && !anisotropy_enabled {
            tracing::warn!("Anisotropy requested but ANISOTROPY feature is not enabled");
        }

        let info = vk::SamplerCreateInfo::default()
            .mag_filter(config.mag_filter)
            .min_filter(config.min_filter)
            .address_mode_u(config.address_mode)
            .address_mode_v(config.address_mode)
            .address_mode_w(config.address_mode)
            .anisotropy_enable(anisotropy_enabled)
            .max_anisotropy(if anisotropy_enabled {
                device.capabilities().max_sampler_anisotropy
            } else {
                1.0
            })
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR);

        let handle = unsafe { device.handle().create_sampler(&info, None) }?;
        Ok(Self {
            device: device.shared(),
            handle,
        })
    }

    /// Get the raw sampler handle.
    #[must_use]
    pub const fn handle(&self) -> vk::Sampler {
        self.handle
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_sampler(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_copies_the_whole_staging_buffer() {
        assert_eq!(upload_copy_size(256, 256).ok(), Some(256));
        assert_eq!(upload_copy_size(256, 64).ok(), Some(64));
    }

    #[test]
    fn oversized_staging_buffer_is_rejected() {
        let err = upload_copy_size(64, 256).unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));
    }
}
