// Backend module - Vulkan abstraction layer
//
// Design: RAII wrappers over ash behind the `GpuDevice` seam
// Leaf-first: device -> allocator -> transfer -> command -> frame

pub mod allocator;
pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod frame;
pub mod framebuffer;
pub mod gpu;
pub mod image;
pub mod memory;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod transfer;

pub use allocator::ResourceAllocator;
pub use buffer::Buffer;
pub use command::{CommandBuffer, CommandBufferState, CommandRecorder, DrawBatch, SubmitWait};
pub use descriptor::{DescriptorPool, DescriptorSet, DescriptorSetLayout, LayoutBinding, PipelineLayout};
pub use device::{DeviceCapabilities, DeviceContext, VulkanDevice};
pub use frame::{FrameOutcome, FrameSynchronizer, SlotState};
pub use framebuffer::{DrawOutcome, FrameResources};
pub use gpu::{GpuDevice, PresentTarget, Submission};
pub use image::{Image, ImageDesc, ImageView, Sampler, Texture};
pub use memory::MemoryBlock;
pub use pipeline::{GraphicsPipeline, PipelineCache, PipelineConfig, RenderPass};
pub use shader::ShaderModule;
pub use swapchain::{Surface, Swapchain};
pub use sync::{Fence, Semaphore};
pub use transfer::{MipLevel, TextureData, TransferEngine, UploadStrategy};
