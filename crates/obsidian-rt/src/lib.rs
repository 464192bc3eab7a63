//! Hardware ray tracing on top of `obsidian-gpu`.
//!
//! Builds bottom- and top-level acceleration structures, assembles ray
//! tracing pipelines with their shader binding tables, and records
//! trace dispatches on the typed ray tracing command buffers.

pub mod acceleration;
pub mod pipeline;
pub mod sbt;

pub use acceleration::{Blas, IndexElement, InstanceAllocator, Tlas};
pub use pipeline::{HitGroup, RayTraceCommands, RayTracePipeline, RayTracePipelineBuilder};
pub use sbt::{SbtCounts, SbtLayout, SbtRegions, ShaderBindingTable};
