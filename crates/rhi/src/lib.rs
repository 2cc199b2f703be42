//! Vulkan abstraction layer (Render Hardware Interface).
//!
//! This crate provides a safe abstraction over Vulkan using the `ash` crate.
//! It handles:
//! - The device and presentation interfaces consumed by the renderer
//! - Command buffer recording
//! - Descriptor layouts, pool sizing and writes
//! - Pipeline configuration and fixed-function state
//! - Synchronization primitives
//!
//! With the `dummy` feature enabled, an in-memory device and surface are
//! available for tests that run without a GPU.

mod error;

pub mod command;
pub mod descriptor;
pub mod device;
pub mod pipeline;
pub mod sync;
pub mod vulkan;

#[cfg(any(test, feature = "dummy"))]
pub mod dummy;

pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;
