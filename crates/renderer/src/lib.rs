//! Frame pipelining and GPU resource lifecycle.
//!
//! This crate keeps several frames in flight without the CPU ever touching
//! resources the GPU may still be reading:
//! - [`frame_ring`]: per-frame slots and the fence-guarded reuse protocol
//! - [`frame_loop`]: the acquire / record / submit / present sequence
//! - [`deletion`]: cleanup deferred until a frame's fence signals
//! - [`descriptor_allocator`]: growable per-frame descriptor pools
//! - [`pipeline_cache`]: compiled pipelines by name
//! - [`draw`]: recording of indexed render objects

mod error;

pub mod deletion;
pub mod descriptor_allocator;
pub mod draw;
pub mod frame_loop;
pub mod frame_ring;
pub mod pipeline_cache;

pub use deletion::DeletionQueue;
pub use descriptor_allocator::DescriptorAllocator;
pub use draw::{DrawContext, RenderObject, record_draws};
pub use error::{RendererError, RendererResult};
pub use frame_loop::{FrameContext, FrameLoop, FrameOutcome};
pub use frame_ring::{FrameRing, FrameSlot, SlotState};
pub use pipeline_cache::{PipelineCache, PipelineObject};

pub use inflight_core::DEFAULT_FRAMES_IN_FLIGHT;
