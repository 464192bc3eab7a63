//! Vulkan abstraction layer for the Obsidian renderer.
//!
//! This crate provides:
//! - Instance and logical device management with feature selection
//! - Explicitly typed memory for buffers and images
//! - Command pools and buffers typed by queue role
//! - Descriptor layouts, pools and staged-write sets
//! - Raster and compute pipeline builders
//! - Swapchain handling with a default presentation chain

pub mod capabilities;
pub mod command;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod swapchain;
pub mod sync;

pub use capabilities::{DeviceCapabilities, GpuVendor, RayTracingCapabilities};
pub use command::{CommandBuffer, CommandPool, Compute, QueueRole, Raster, RayTrace, Transfer};
pub use descriptors::{
    DescriptorBinding, DescriptorPool, DescriptorSet, DescriptorSetLayout,
    DescriptorSetLayoutBuilder, DescriptorTable, PoolSizes,
};
pub use device::{Device, DeviceBuilder, DeviceFeatures, QueueFamilyIndices};
pub use error::{GpuError, Result};
pub use instance::{Instance, InstanceBuilder};
pub use memory::{Buffer, Image2D, Sampler, SamplerConfig};
pub use pipeline::{
    ComputePipeline, ComputePipelineBuilder, PipelineLayout, PipelineLayoutBuilder, RasterPipeline,
    RasterPipelineBuilder, ShaderModule,
};
pub use swapchain::{AcquireResult, Framebuffer, RenderPass, SwapChain};
pub use sync::{Fence, FenceStatus, FrameSync, FrameSyncManager, Semaphore};
