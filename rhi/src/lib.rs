//! gsg-vk: the Vulkan rendering-backend core for a retained-mode 3D
//! scene-graph engine (frame lifecycle/GPU-CPU sync, automatic resource-state
//! barrier tracking, shader-binding/pipeline-state caching).
//!
//! Module layout follows the teacher's flat `src/` (one file per concern)
//! rather than its `vulkan/` subtree, since this crate has exactly one
//! backend: there is no longer a trait boundary to keep Metal/Vulkan apart.

pub mod command_buffer;
pub mod config;
pub mod descriptor_cache;
pub mod device;
pub mod error;
pub mod framebuffer;
pub mod gsg;
pub mod memory;
pub mod pipeline_cache;
pub mod reflect;
pub mod resource;
pub mod scene_types;
pub mod shader_input;
pub mod state;
pub mod swapchain;

pub use config::GsgConfig;
pub use device::GsgDevice;
pub use error::{Error, Result};
pub use gsg::{ColorTarget, DrawInput, Gsg, GpuBuffer, GpuImage, RenderTargets, ScreenshotRequest};
pub use resource::ResourceId;
pub use state::{RenderState, TransformState};
