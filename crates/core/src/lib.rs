//! Core utilities for the in-flight frame renderer.
//!
//! This crate provides foundational types and utilities used across the renderer:
//! - Error types and result aliases
//! - Logging initialization
//! - Frame timing
//! - Configuration management

mod config;
mod error;
mod logging;
mod timer;

pub use config::{
    DEFAULT_FRAMES_IN_FLIGHT, DescriptorConfig, DescriptorKind, DescriptorRatio,
    MAX_FRAMES_IN_FLIGHT, RendererConfig,
};
pub use error::{Error, Result};
pub use logging::{init_logging, try_init_logging};
pub use timer::FrameTimer;
