//! Swapchain with its default render pass and framebuffers.

use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::instance::Instance;
use crate::memory::Image2D;
use crate::sync::Semaphore;
use ash::vk;
use std::sync::Arc;

const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Owned render pass.
pub struct RenderPass {
    device: Arc<ash::Device>,
    handle: vk::RenderPass,
}

impl RenderPass {
    /// Color + depth pass that transitions the color attachment to
    /// present layout.
    pub fn new_presentation(device: &Device, color_format: vk::Format) -> Result<Self> {
        let attachments = [
            vk::AttachmentDescription::default()
                .format(color_format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::PRESENT_SRC_KHR),
            vk::AttachmentDescription::default()
                .format(DEPTH_FORMAT)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        ];

        let color_ref = vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let depth_ref = vk::AttachmentReference::default()
            .attachment(1)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(std::slice::from_ref(&color_ref))
            .depth_stencil_attachment(&depth_ref);

        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(std::slice::from_ref(&dependency));

        let handle = unsafe { device.handle().create_render_pass(&info, None) }?;
        Ok(Self {
            device: device.shared(),
            handle,
        })
    }

    /// Get the raw render pass handle.
    #[must_use]
    pub const fn handle(&self) -> vk::RenderPass {
        self.handle
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_render_pass(self.handle, None);
        }
    }
}

/// Owned framebuffer.
pub struct Framebuffer {
    device: Arc<ash::Device>,
    handle: vk::Framebuffer,
}

impl Framebuffer {
    /// Create a framebuffer over `attachments`.
    pub fn new(
        device: &Device,
        render_pass: &RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass.handle())
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let handle = unsafe { device.handle().create_framebuffer(&info, None) }?;
        Ok(Self {
            device: device.shared(),
            handle,
        })
    }

    /// Get the raw framebuffer handle.
    #[must_use]
    pub const fn handle(&self) -> vk::Framebuffer {
        self.handle
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_framebuffer(self.handle, None);
        }
    }
}

/// Outcome of [`SwapChain::acquire_next_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    /// An image is ready; `suboptimal` asks for a rebuild after the frame.
    Ready { index: u32, suboptimal: bool },
    /// The swapchain no longer matches the surface; rebuild required.
    OutOfDate,
}

/// Swapchain plus the default presentation chain built on it: image
/// views, a depth buffer, a render pass, and one framebuffer per image.
pub struct SwapChain {
    device: Arc<ash::Device>,
    loader: ash::khr::swapchain::Device,
    surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
    present_queue: vk::Queue,
    graphics_family: u32,
    present_family: u32,

    handle: vk::SwapchainKHR,
    image_views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    depth: Image2D,
    render_pass: RenderPass,
    framebuffers: Vec<Framebuffer>,
}

impl SwapChain {
    /// Build a swapchain for the instance's surface.
    ///
    /// # Safety
    /// The surface must remain valid for the swapchain's lifetime.
    pub unsafe fn new(
        device: &Device,
        instance: &Instance,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let surface = instance
            .surface()
            .ok_or(GpuError::FeatureNotEnabled("presentation surface"))?;
        let surface_loader = instance
            .surface_loader()
            .ok_or(GpuError::FeatureNotEnabled("presentation surface"))?
            .clone();
        let loader = device.swapchain_loader()?.clone();

        let families = device.queue_families();
        let mut swapchain = Self {
            device: device.shared(),
            loader,
            surface,
            surface_loader,
            present_queue: device.present_queue(),
            graphics_family: families.graphics,
            present_family: families.present,
            handle: vk::SwapchainKHR::null(),
            image_views: Vec::new(),
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            depth: Image2D::new(
                device,
                DEPTH_FORMAT,
                vk::Extent2D {
                    width: width.max(1),
                    height: height.max(1),
                },
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                vk::ImageAspectFlags::DEPTH,
            )?,
            render_pass: RenderPass::new_presentation(device, vk::Format::B8G8R8A8_SRGB)?,
            framebuffers: Vec::new(),
        };

        swapchain.build(device, width, height)?;
        Ok(swapchain)
    }

    unsafe fn build(&mut self, device: &Device, width: u32, height: u32) -> Result<()> {
        let capabilities = self
            .surface_loader
            .get_physical_device_surface_capabilities(device.physical_device(), self.surface)?;
        let formats = self
            .surface_loader
            .get_physical_device_surface_formats(device.physical_device(), self.surface)?;
        let present_modes = self
            .surface_loader
            .get_physical_device_surface_present_modes(device.physical_device(), self.surface)?;

        if formats.is_empty() || present_modes.is_empty() {
            return Err(GpuError::SwapchainCreation(
                "surface reports no formats or present modes".to_string(),
            ));
        }

        let format = select_surface_format(&formats);
        let present_mode = select_present_mode(&present_modes);
        let extent = calculate_extent(&capabilities, width, height);
        let image_count = select_image_count(&capabilities);

        let mut info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(self.handle);

        let family_indices = [self.graphics_family, self.present_family];
        if self.graphics_family == self.present_family {
            info = info.image_sharing_mode(vk::SharingMode::EXCLUSIVE);
        } else {
            info = info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices);
        }

        let handle = self.loader.create_swapchain(&info, None)?;
        if self.handle != vk::SwapchainKHR::null() {
            self.loader.destroy_swapchain(self.handle, None);
        }
        self.handle = handle;

        let images = self.loader.get_swapchain_images(handle)?;
        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1),
                );
            match self.device.create_image_view(&view_info, None) {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    for view in image_views {
                        self.device.destroy_image_view(view, None);
                    }
                    return Err(e.into());
                }
            }
        }
        self.image_views = image_views;

        if format.format != self.format.format {
            self.render_pass = RenderPass::new_presentation(device, format.format)?;
        }
        self.format = format;
        self.extent = extent;

        self.depth = Image2D::new(
            device,
            DEPTH_FORMAT,
            extent,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        )?;

        self.framebuffers = self
            .image_views
            .iter()
            .map(|&view| {
                Framebuffer::new(
                    device,
                    &self.render_pass,
                    &[view, self.depth.view()],
                    extent,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            "Swapchain: {} images, {:?}, {}x{}",
            self.image_views.len(),
            format.format,
            extent.width,
            extent.height
        );
        Ok(())
    }

    /// Tear down the per-image chain and rebuild it for a new extent.
    /// The image view count survives the rebuild; the extent is adopted
    /// from the surface.
    pub fn rebuild(&mut self, device: &Device, width: u32, height: u32) -> Result<()> {
        device.wait_idle()?;
        self.destroy_chain();
        unsafe { self.build(device, width, height) }
    }

    fn destroy_chain(&mut self) {
        self.framebuffers.clear();
        unsafe {
            for view in self.image_views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
        }
    }

    /// Acquire the next image, signaling `semaphore` when it is usable.
    pub fn acquire_next_image(&self, semaphore: &Semaphore) -> Result<AcquireResult> {
        let result = unsafe {
            self.loader.acquire_next_image(
                self.handle,
                u64::MAX,
                semaphore.handle(),
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, suboptimal)) => Ok(AcquireResult::Ready { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireResult::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    /// Present `image_index` on the present queue after `wait` signals.
    /// Returns `true` when the swapchain needs a rebuild.
    pub fn present(&self, wait: &Semaphore, image_index: u32) -> Result<bool> {
        let wait_semaphores = [wait.handle()];
        let swapchains = [self.handle];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let result = unsafe { self.loader.queue_present(self.present_queue, &info) };
        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Current extent.
    #[must_use]
    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Surface format in use.
    #[must_use]
    pub const fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Number of swapchain images.
    #[must_use]
    pub fn image_count(&self) -> usize {
        self.image_views.len()
    }

    /// Image views, one per swapchain image.
    #[must_use]
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    /// The default render pass.
    #[must_use]
    pub const fn render_pass(&self) -> &RenderPass {
        &self.render_pass
    }

    /// Framebuffer for `image_index`.
    #[must_use]
    pub fn framebuffer(&self, image_index: u32) -> Option<&Framebuffer> {
        self.framebuffers.get(image_index as usize)
    }
}

impl Drop for SwapChain {
    fn drop(&mut self) {
        self.destroy_chain();
        unsafe {
            if self.handle != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(self.handle, None);
            }
        }
    }
}

/// Prefer B8G8R8A8 sRGB; fall back to the first reported format.
#[must_use]
pub fn select_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
        .unwrap_or_default()
}

/// Prefer MAILBOX; FIFO is always available as the fallback.
#[must_use]
pub fn select_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Surface extent, clamped to the surface limits when unbounded.
#[must_use]
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One more than the minimum, clamped to the maximum (0 = unlimited).
#[must_use]
pub fn select_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count = count.min(capabilities.max_image_count);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_format_prefers_srgb_bgra() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            select_surface_format(&formats).format,
            vk::Format::B8G8R8A8_SRGB
        );
    }

    #[test]
    fn surface_format_falls_back_to_first() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::R16G16B16A16_SFLOAT,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        assert_eq!(
            select_surface_format(&formats).format,
            vk::Format::R16G16B16A16_SFLOAT
        );
    }

    #[test]
    fn present_mode_prefers_mailbox_then_fifo() {
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE]),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_uses_surface_extent_when_bounded() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        let extent = calculate_extent(&capabilities, 1920, 1080);
        assert_eq!(extent.width, 800);
        assert_eq!(extent.height, 600);
    }

    #[test]
    fn extent_clamps_when_unbounded() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
            max_image_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            ..Default::default()
        };
        let extent = calculate_extent(&capabilities, 1920, 32);
        assert_eq!(extent.width, 1280);
        assert_eq!(extent.height, 64);
    }

    #[test]
    fn image_count_is_min_plus_one_clamped() {
        let unbounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(select_image_count(&unbounded), 3);

        let tight = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 2,
            ..Default::default()
        };
        assert_eq!(select_image_count(&tight), 2);
    }
}
