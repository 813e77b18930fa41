// vkcore - Vulkan rendering core
//
// Device acquisition, memory-backed resources, staged transfers, command
// recording and the per-frame acquire/submit/present protocol.

pub mod backend;
pub mod config;
pub mod error;
pub mod renderer;

pub use config::Config;
pub use error::{ErrorKind, RenderError, Result};
pub use renderer::{FrameStatus, Renderer};
