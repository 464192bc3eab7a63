//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// A device feature required by the call was not enabled.
    #[error("Device feature not enabled: {0}")]
    FeatureNotEnabled(&'static str),

    /// No memory type satisfies the requested property flags.
    #[error("No suitable memory type for requirement bits {type_bits:#x} with properties {properties:?}")]
    NoSuitableMemoryType {
        /// Memory requirement bits reported for the resource.
        type_bits: u32,
        /// Property flags the allocation asked for.
        properties: vk::MemoryPropertyFlags,
    },

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// The convenience barrier only knows a fixed set of layout pairs.
    #[error("Unsupported image layout transition: {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        /// Layout the image is currently in.
        old: vk::ImageLayout,
        /// Layout the transition asked for.
        new: vk::ImageLayout,
    },

    /// Acceleration structure build produced an invalid result.
    #[error("Acceleration structure build failed: {0}")]
    AccelerationBuild(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<GpuError> for obsidian_core::Error {
    fn from(e: GpuError) -> Self {
        Self::Gpu(e.to_string())
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
