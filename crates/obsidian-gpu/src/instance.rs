//! Vulkan instance creation and debug messaging.

use crate::error::{GpuError, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{c_char, c_void, CStr, CString};

/// Instance extensions added on top of the surface set reported by the
/// display backend.
fn optional_instance_extensions(enable_validation: bool) -> Vec<&'static CStr> {
    let mut extensions = Vec::new();
    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_enumeration::NAME);
    if enable_validation {
        extensions.push(ash::ext::debug_utils::NAME);
    }
    extensions
}

/// Validation layers to enable when requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![
        // Standard validation layer
        c"VK_LAYER_KHRONOS_validation",
    ]
}

/// Owns the Vulkan entry, instance, debug messenger and (for windowed use)
/// the presentation surface.
pub struct Instance {
    entry: ash::Entry,
    handle: ash::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    surface: Option<vk::SurfaceKHR>,
    surface_loader: Option<ash::khr::surface::Instance>,
}

/// Builder for [`Instance`].
pub struct InstanceBuilder {
    app_name: String,
    engine_name: String,
    enable_validation: bool,
}

impl Default for InstanceBuilder {
    fn default() -> Self {
        Self {
            app_name: "Obsidian App".to_string(),
            engine_name: "Obsidian".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl InstanceBuilder {
    /// Create a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Set the engine name.
    #[must_use]
    pub fn engine_name(mut self, name: impl Into<String>) -> Self {
        self.engine_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub const fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build a headless instance without a presentation surface.
    ///
    /// # Safety
    /// The Vulkan loader must be available on the system.
    pub unsafe fn build_headless(self) -> Result<Instance> {
        self.build_inner(None::<&NoWindow>)
    }

    /// Build an instance with a presentation surface for `window`.
    ///
    /// # Safety
    /// The window handles must remain valid for the surface's lifetime.
    pub unsafe fn build<W>(self, window: &W) -> Result<Instance>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        self.build_inner(Some(window))
    }

    unsafe fn build_inner<W>(self, window: Option<&W>) -> Result<Instance>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let entry = ash::Entry::load()
            .map_err(|e| GpuError::InvalidState(format!("Failed to load Vulkan entry: {e}")))?;

        let app_name = CString::new(self.app_name)
            .map_err(|e| GpuError::InvalidState(format!("Invalid application name: {e}")))?;
        let engine_name = CString::new(self.engine_name)
            .map_err(|e| GpuError::InvalidState(format!("Invalid engine name: {e}")))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        // The display backend reports the surface extensions it needs; the
        // headless path requests none.
        let mut extension_names: Vec<*const c_char> = match window {
            Some(window) => {
                let display = window.display_handle().map_err(|e| {
                    GpuError::SurfaceCreation(format!("Failed to get display handle: {e}"))
                })?;
                ash_window::enumerate_required_extensions(display.as_raw())?.to_vec()
            }
            None => Vec::new(),
        };
        extension_names.extend(
            optional_instance_extensions(self.enable_validation)
                .iter()
                .map(|ext| ext.as_ptr()),
        );

        // Check that requested layers are available; a missing validation
        // layer downgrades to a warning, never an error.
        let mut layers = if self.enable_validation {
            validation_layers()
        } else {
            vec![]
        };
        let available_layers = entry.enumerate_instance_layer_properties()?;
        layers.retain(|layer| {
            let found = available_layers.iter().any(|props| {
                CStr::from_ptr(props.layer_name.as_ptr()) == *layer
            });
            if !found {
                tracing::warn!("Validation layer {:?} not available", layer);
            }
            found
        });
        let layer_names: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

        // Required for MoltenVK on macOS
        #[cfg(target_os = "macos")]
        let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        #[cfg(not(target_os = "macos"))]
        let create_flags = vk::InstanceCreateFlags::empty();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names)
            .flags(create_flags);

        let handle = entry.create_instance(&create_info, None)?;

        let debug_utils = if self.enable_validation {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &handle);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));
            let messenger = loader.create_debug_utils_messenger(&messenger_info, None)?;
            Some((loader, messenger))
        } else {
            None
        };

        let (surface, surface_loader) = match window {
            Some(window) => {
                let display = window.display_handle().map_err(|e| {
                    GpuError::SurfaceCreation(format!("Failed to get display handle: {e}"))
                })?;
                let window_handle = window.window_handle().map_err(|e| {
                    GpuError::SurfaceCreation(format!("Failed to get window handle: {e}"))
                })?;
                let surface = ash_window::create_surface(
                    &entry,
                    &handle,
                    display.as_raw(),
                    window_handle.as_raw(),
                    None,
                )
                .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
                let loader = ash::khr::surface::Instance::new(&entry, &handle);
                (Some(surface), Some(loader))
            }
            None => (None, None),
        };

        Ok(Instance {
            entry,
            handle,
            debug_utils,
            surface,
            surface_loader,
        })
    }
}

impl Instance {
    /// Get the Vulkan entry point.
    #[must_use]
    pub const fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Get the raw instance.
    #[must_use]
    pub const fn handle(&self) -> &ash::Instance {
        &self.handle
    }

    /// Get the presentation surface, if one was created.
    #[must_use]
    pub const fn surface(&self) -> Option<vk::SurfaceKHR> {
        self.surface
    }

    /// Get the surface extension loader, if a surface was created.
    #[must_use]
    pub const fn surface_loader(&self) -> Option<&ash::khr::surface::Instance> {
        self.surface_loader.as_ref()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let (Some(surface), Some(loader)) = (self.surface, self.surface_loader.as_ref()) {
                loader.destroy_surface(surface, None);
            }
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.handle.destroy_instance(None);
        }
    }
}

/// Never used as a window; stands in for `W` on the headless path.
enum NoWindow {}

impl HasDisplayHandle for NoWindow {
    fn display_handle(
        &self,
    ) -> std::result::Result<raw_window_handle::DisplayHandle<'_>, raw_window_handle::HandleError>
    {
        match *self {}
    }
}

impl HasWindowHandle for NoWindow {
    fn window_handle(
        &self,
    ) -> std::result::Result<raw_window_handle::WindowHandle<'_>, raw_window_handle::HandleError>
    {
        match *self {}
    }
}

/// Routes validation messages to `tracing`. Must not unwind across FFI.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    let message = (*data)
        .message_as_c_str()
        .map_or_else(|| "<invalid message>".into(), CStr::to_string_lossy);

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vulkan", "{message}");
    } else {
        tracing::debug!(target: "vulkan", "{message}");
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_toggles_the_debug_utils_extension() {
        let with_validation = optional_instance_extensions(true);
        assert!(with_validation.contains(&ash::ext::debug_utils::NAME));

        let without_validation = optional_instance_extensions(false);
        assert!(!without_validation.contains(&ash::ext::debug_utils::NAME));
    }

    #[test]
    fn khronos_validation_is_the_requested_layer() {
        let layers = validation_layers();
        assert_eq!(layers, vec![c"VK_LAYER_KHRONOS_validation"]);
    }
}
