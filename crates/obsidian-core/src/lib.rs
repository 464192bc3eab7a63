//! Core types and helpers for the Obsidian renderer.
//!
//! This crate provides the foundational pieces used throughout the
//! renderer:
//! - Alignment arithmetic for GPU resource sizing
//! - Common error types

pub mod align;
pub mod error;

pub use align::{is_aligned, round_up, round_up_u32};
pub use error::{Error, Result};
