//! Recording mock device
//!
//! `MockGpu` implements `GpuDevice` without touching a GPU:
//! - every call of interest is appended to an event log
//! - memory is backed by host vectors, so mapping hands out real pointers
//! - buffer-to-buffer copies run when their command buffer is submitted
//! - fences move through signaled / unsignaled / pending; a pending fence
//!   signals when waited on unless fences are stalled
//!
//! Protocol breaches are collected as violations instead of panicking inside
//! `Drop` impls; tests assert on them at the end.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;

use vkcore::backend::allocator::HOST_MEMORY;
use vkcore::backend::pipeline::VertexLayout;
use vkcore::backend::{
    DescriptorPool, DescriptorSetLayout, DeviceCapabilities, DeviceContext, DrawBatch, GpuDevice,
    GraphicsPipeline, LayoutBinding, PipelineCache, PipelineConfig, PipelineLayout, PresentTarget, RenderPass,
    ShaderModule, Submission, UploadStrategy,
};
use vkcore::{RenderError, Result};

pub const ALIGNMENT: u64 = 256;

/// Memory types: device-local, host-visible (non-coherent), host-visible + coherent.
pub const DEVICE_LOCAL_TYPE: u32 = 0;
pub const HOST_VISIBLE_TYPE: u32 = 1;
pub const HOST_COHERENT_TYPE: u32 = 2;

#[derive(Debug, Clone)]
pub enum Event {
    CreateBuffer { buffer: vk::Buffer, size: u64, usage: vk::BufferUsageFlags },
    DestroyBuffer(vk::Buffer),
    AllocateMemory { memory: vk::DeviceMemory, size: u64, type_index: u32 },
    FreeMemory(vk::DeviceMemory),
    FlushMemory(vk::DeviceMemory),
    InvalidateMemory(vk::DeviceMemory),
    CreateImage {
        image: vk::Image,
        tiling: vk::ImageTiling,
        initial_layout: vk::ImageLayout,
        mip_levels: u32,
    },
    DestroyImage(vk::Image),
    CopyBuffer { cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: u64 },
    CopyBufferToImage {
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    Barrier {
        cmd: vk::CommandBuffer,
        image: vk::Image,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    },
    DrawIndexed { cmd: vk::CommandBuffer, index_count: u32 },
    Submit {
        fence: vk::Fence,
        command_buffers: Vec<vk::CommandBuffer>,
        wait: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
        signal: Option<vk::Semaphore>,
    },
    WaitFence { fence: vk::Fence, signaled: bool },
    ResetFence(vk::Fence),
    DestroyFence(vk::Fence),
    QueueWaitIdle,
    DeviceWaitIdle,
    FreeCommandBuffer(vk::CommandBuffer),
    UpdateDescriptor { set: vk::DescriptorSet, binding: u32, descriptor_type: vk::DescriptorType },
    DestroyDescriptorPool(vk::DescriptorPool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    Signaled,
    Unsignaled,
    Pending,
}

struct BufferRecord {
    size: u64,
    memory: Option<u64>,
}

struct ImageRecord {
    extent: vk::Extent3D,
    tiling: vk::ImageTiling,
    mip_levels: u32,
}

struct PendingSubmission {
    fence: Option<u64>,
    command_buffers: Vec<u64>,
}

#[derive(Default)]
struct CommandRecord {
    copies: Vec<(u64, u64, Vec<vk::BufferCopy>)>,
    buffers: Vec<u64>,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    events: Vec<Event>,
    violations: Vec<String>,

    memory: HashMap<u64, Vec<u8>>,
    mapped: Vec<u64>,
    buffers: HashMap<u64, BufferRecord>,
    images: HashMap<u64, ImageRecord>,
    fences: HashMap<u64, FenceState>,
    commands: HashMap<u64, CommandRecord>,
    pending: Vec<PendingSubmission>,

    fail_next_allocation: Option<vk::Result>,
    stall_fences: bool,
    linear_sampling: bool,
}

impl MockState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn violation(&mut self, message: String) {
        self.violations.push(message);
    }

    fn cmd_pending(&self, cmd: u64) -> bool {
        self.pending.iter().any(|sub| sub.command_buffers.contains(&cmd))
    }

    fn buffer_pending(&self, buffer: u64) -> bool {
        self.pending.iter().any(|sub| {
            sub.command_buffers.iter().any(|cmd| {
                self.commands
                    .get(cmd)
                    .is_some_and(|record| record.buffers.contains(&buffer))
            })
        })
    }

    fn complete_fence(&mut self, fence: u64) {
        self.pending.retain(|sub| sub.fence != Some(fence));
        self.fences.insert(fence, FenceState::Signaled);
    }

    fn complete_all(&mut self) {
        for sub in self.pending.drain(..) {
            if let Some(fence) = sub.fence {
                self.fences.insert(fence, FenceState::Signaled);
            }
        }
    }

    fn run_copies(&mut self, cmd: u64) {
        let copies = match self.commands.get(&cmd) {
            Some(record) => record.copies.clone(),
            None => return,
        };
        for (src, dst, regions) in copies {
            let src_memory = self.buffers.get(&src).and_then(|b| b.memory);
            let dst_memory = self.buffers.get(&dst).and_then(|b| b.memory);
            let (Some(src_memory), Some(dst_memory)) = (src_memory, dst_memory) else {
                self.violation(format!("copy between unbound buffers {src} -> {dst}"));
                continue;
            };
            for region in regions {
                let start = region.src_offset as usize;
                let end = start + region.size as usize;
                let bytes = self.memory[&src_memory][start..end].to_vec();
                let dst_start = region.dst_offset as usize;
                if let Some(target) = self.memory.get_mut(&dst_memory) {
                    target[dst_start..dst_start + bytes.len()].copy_from_slice(&bytes);
                }
            }
        }
    }
}

pub struct MockGpu {
    state: Mutex<MockState>,
    capabilities: DeviceCapabilities,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl MockGpu {
    pub fn new() -> Arc<Self> {
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties::default();
        memory_properties.memory_type_count = 3;
        memory_properties.memory_types[DEVICE_LOCAL_TYPE as usize] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        memory_properties.memory_types[HOST_VISIBLE_TYPE as usize] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
            heap_index: 1,
        };
        memory_properties.memory_types[HOST_COHERENT_TYPE as usize] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 1,
        };
        memory_properties.memory_heap_count = 2;

        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            capabilities: DeviceCapabilities {
                device_name: "mock".to_string(),
                sampler_anisotropy: true,
                max_sampler_anisotropy: 16.0,
                ..Default::default()
            },
            memory_properties,
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn assert_no_violations(&self) {
        let violations = self.violations();
        assert!(violations.is_empty(), "protocol violations: {violations:#?}");
    }

    /// Fence waits on pending work time out instead of completing it.
    pub fn stall_fences(&self, stall: bool) {
        self.state.lock().stall_fences = stall;
    }

    /// The next memory allocation fails with `result`.
    pub fn fail_next_allocation(&self, result: vk::Result) {
        self.state.lock().fail_next_allocation = Some(result);
    }

    /// Whether R8G8B8A8 can be sampled from linear tiling.
    pub fn set_linear_sampling(&self, supported: bool) {
        self.state.lock().linear_sampling = supported;
    }

    pub fn fence_state(&self, fence: vk::Fence) -> Option<FenceState> {
        self.state.lock().fences.get(&fence.as_raw()).copied()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_images(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().memory.len()
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Raw contents of the memory bound to `buffer`.
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        let state = self.state.lock();
        let record = &state.buffers[&buffer.as_raw()];
        let memory = record.memory.expect("buffer has no memory bound");
        state.memory[&memory][..record.size as usize].to_vec()
    }
}

/// Context over `gpu` with a short one-shot fence timeout.
pub fn context(gpu: &Arc<MockGpu>) -> DeviceContext {
    let device: Arc<dyn GpuDevice> = gpu.clone();
    DeviceContext::new(device, Duration::from_millis(50)).expect("context over the mock device")
}

pub fn device(gpu: &Arc<MockGpu>) -> Arc<dyn GpuDevice> {
    gpu.clone()
}

/// Smallest module the SPIR-V parser accepts.
pub fn spirv_bytes() -> Vec<u8> {
    [0x0723_0203u32, 0x0001_0000, 0, 8, 0]
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect()
}

pub fn render_pass(gpu: &Arc<MockGpu>) -> RenderPass {
    RenderPass::new(device(gpu), vk::Format::B8G8R8A8_SRGB, vk::Format::D32_SFLOAT).expect("render pass")
}

/// Stand-in swapchain image views; the mock never dereferences them.
pub fn color_views(count: usize) -> Vec<vk::ImageView> {
    (0..count as u64).map(|i| vk::ImageView::from_raw(1_000_000 + i)).collect()
}

pub const TRIANGLE_INDICES: [u32; 3] = [0, 1, 2];

/// One-triangle batch: staged vertex/index buffers, a uniform buffer bound
/// at set 0 binding 0, and a pipeline over it.
pub fn draw_batch(ctx: &DeviceContext, render_pass: &RenderPass) -> DrawBatch {
    let device = ctx.device().clone();
    let transfer = ctx.transfer();

    let vertices: [[f32; 3]; 3] = [[0.0, -0.5, 0.0], [0.5, 0.5, 0.0], [-0.5, 0.5, 0.0]];
    let vertex_buffer = transfer
        .upload_slice(&vertices, vk::BufferUsageFlags::VERTEX_BUFFER, UploadStrategy::Staged)
        .expect("vertex upload");
    let index_buffer = transfer
        .upload_slice(&TRIANGLE_INDICES, vk::BufferUsageFlags::INDEX_BUFFER, UploadStrategy::Staged)
        .expect("index upload");
    let uniform_buffer = ctx
        .allocator()
        .create_buffer(64, vk::BufferUsageFlags::UNIFORM_BUFFER, HOST_MEMORY)
        .expect("uniform buffer");

    let set_layout = DescriptorSetLayout::new(
        device.clone(),
        &[LayoutBinding::uniform_buffer(0, vk::ShaderStageFlags::VERTEX)],
    )
    .expect("set layout");
    let pool = DescriptorPool::new(device.clone(), 1, &[(vk::DescriptorType::UNIFORM_BUFFER, 1)]).expect("pool");
    let mut set = pool.allocate(&set_layout).expect("descriptor set");
    set.write_uniform_buffer(0, Arc::new(uniform_buffer)).expect("uniform write");

    let pipeline_layout = PipelineLayout::new(device.clone(), &[set_layout]).expect("pipeline layout");
    let cache = PipelineCache::new(device.clone()).expect("pipeline cache");
    let vert = ShaderModule::from_spirv(device.clone(), &spirv_bytes(), vk::ShaderStageFlags::VERTEX, "vert")
        .expect("vertex shader");
    let frag = ShaderModule::from_spirv(device.clone(), &spirv_bytes(), vk::ShaderStageFlags::FRAGMENT, "frag")
        .expect("fragment shader");
    let config = PipelineConfig::new(VertexLayout::new(12).attribute(0, vk::Format::R32G32B32_SFLOAT, 0));
    let pipeline = GraphicsPipeline::new(device, &cache, render_pass, pipeline_layout, &config, &vert, &frag)
        .expect("pipeline");

    DrawBatch {
        pipeline: Arc::new(pipeline),
        descriptor_sets: vec![Arc::new(set)],
        vertex_buffer: Arc::new(vertex_buffer),
        index_buffer: Arc::new(index_buffer),
        index_count: TRIANGLE_INDICES.len() as u32,
    }
}

fn round_up(size: u64) -> u64 {
    size.div_ceil(ALIGNMENT) * ALIGNMENT
}

fn linear_row_pitch(width: u32) -> u64 {
    round_up(u64::from(width) * 4)
}

impl GpuDevice for MockGpu {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        let linear_sampling = self.state.lock().linear_sampling;
        let mut props = vk::FormatProperties::default();
        match format {
            vk::Format::D32_SFLOAT => {
                props.optimal_tiling_features = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
            }
            vk::Format::R8G8B8A8_UNORM => {
                props.optimal_tiling_features =
                    vk::FormatFeatureFlags::SAMPLED_IMAGE | vk::FormatFeatureFlags::TRANSFER_DST;
                if linear_sampling {
                    props.linear_tiling_features = vk::FormatFeatureFlags::SAMPLED_IMAGE;
                }
            }
            _ => {}
        }
        props
    }

    fn queue_family_index(&self) -> u32 {
        0
    }

    // ── Memory ────────────────────────────────────────────────────────────

    fn allocate_memory(&self, size: vk::DeviceSize, memory_type_index: u32) -> VkResult<vk::DeviceMemory> {
        let mut state = self.state.lock();
        if let Some(result) = state.fail_next_allocation.take() {
            return Err(result);
        }
        let raw = state.handle();
        state.memory.insert(raw, vec![0u8; size as usize]);
        let memory = vk::DeviceMemory::from_raw(raw);
        state.events.push(Event::AllocateMemory {
            memory,
            size,
            type_index: memory_type_index,
        });
        Ok(memory)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        if state.memory.remove(&memory.as_raw()).is_none() {
            state.violation(format!("free of unknown memory {memory:?}"));
        }
        state.events.push(Event::FreeMemory(memory));
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> VkResult<*mut u8> {
        let mut state = self.state.lock();
        let raw = memory.as_raw();
        if state.mapped.contains(&raw) {
            state.violation(format!("memory {memory:?} mapped twice"));
        }
        state.mapped.push(raw);
        match state.memory.get_mut(&raw) {
            Some(bytes) => Ok(bytes.as_mut_ptr().add(offset as usize)),
            None => Err(vk::Result::ERROR_MEMORY_MAP_FAILED),
        }
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        let raw = memory.as_raw();
        match state.mapped.iter().position(|&m| m == raw) {
            Some(index) => {
                state.mapped.swap_remove(index);
            }
            None => state.violation(format!("unmap of unmapped memory {memory:?}")),
        }
    }

    fn flush_memory(&self, memory: vk::DeviceMemory, _offset: vk::DeviceSize, _size: vk::DeviceSize) -> VkResult<()> {
        self.state.lock().events.push(Event::FlushMemory(memory));
        Ok(())
    }

    fn invalidate_memory(&self, memory: vk::DeviceMemory, _offset: vk::DeviceSize, _size: vk::DeviceSize) -> VkResult<()> {
        self.state.lock().events.push(Event::InvalidateMemory(memory));
        Ok(())
    }

    // ── Buffers and images ────────────────────────────────────────────────

    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.buffers.insert(
            raw,
            BufferRecord {
                size: info.size,
                memory: None,
            },
        );
        let buffer = vk::Buffer::from_raw(raw);
        state.events.push(Event::CreateBuffer {
            buffer,
            size: info.size,
            usage: info.usage,
        });
        Ok(buffer)
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let state = self.state.lock();
        let size = state.buffers.get(&buffer.as_raw()).map_or(0, |b| b.size);
        vk::MemoryRequirements {
            size: round_up(size),
            alignment: ALIGNMENT,
            memory_type_bits: 0b111,
        }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        let mut state = self.state.lock();
        match state.buffers.get_mut(&buffer.as_raw()) {
            Some(record) => {
                record.memory = Some(memory.as_raw());
                Ok(())
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        let raw = buffer.as_raw();
        if state.buffer_pending(raw) {
            state.violation(format!("buffer {buffer:?} destroyed while a submission using it is pending"));
        }
        if state.buffers.remove(&raw).is_none() {
            state.violation(format!("destroy of unknown buffer {buffer:?}"));
        }
        state.events.push(Event::DestroyBuffer(buffer));
    }

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> VkResult<vk::Image> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.images.insert(
            raw,
            ImageRecord {
                extent: info.extent,
                tiling: info.tiling,
                mip_levels: info.mip_levels,
            },
        );
        let image = vk::Image::from_raw(raw);
        state.events.push(Event::CreateImage {
            image,
            tiling: info.tiling,
            initial_layout: info.initial_layout,
            mip_levels: info.mip_levels,
        });
        Ok(image)
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let state = self.state.lock();
        let size = state.images.get(&image.as_raw()).map_or(0, |record| {
            let (width, height) = (record.extent.width, record.extent.height);
            if record.tiling == vk::ImageTiling::LINEAR {
                linear_row_pitch(width) * u64::from(height)
            } else {
                (0..record.mip_levels)
                    .map(|level| u64::from((width >> level).max(1)) * u64::from((height >> level).max(1)) * 4)
                    .sum::<u64>()
            }
        });
        vk::MemoryRequirements {
            size: round_up(size),
            alignment: ALIGNMENT,
            memory_type_bits: 0b111,
        }
    }

    fn bind_image_memory(&self, image: vk::Image, _memory: vk::DeviceMemory) -> VkResult<()> {
        if self.state.lock().images.contains_key(&image.as_raw()) {
            Ok(())
        } else {
            Err(vk::Result::ERROR_UNKNOWN)
        }
    }

    fn image_subresource_layout(&self, image: vk::Image, _subresource: vk::ImageSubresource) -> vk::SubresourceLayout {
        let state = self.state.lock();
        let extent = state
            .images
            .get(&image.as_raw())
            .map_or(vk::Extent3D::default(), |record| record.extent);
        let row_pitch = linear_row_pitch(extent.width);
        vk::SubresourceLayout {
            offset: 0,
            size: row_pitch * u64::from(extent.height),
            row_pitch,
            array_pitch: 0,
            depth_pitch: 0,
        }
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state.lock();
        if state.images.remove(&image.as_raw()).is_none() {
            state.violation(format!("destroy of unknown image {image:?}"));
        }
        state.events.push(Event::DestroyImage(image));
    }

    fn create_image_view(&self, _info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView> {
        Ok(vk::ImageView::from_raw(self.state.lock().handle()))
    }

    fn destroy_image_view(&self, _view: vk::ImageView) {}

    fn create_sampler(&self, _info: &vk::SamplerCreateInfo<'_>) -> VkResult<vk::Sampler> {
        Ok(vk::Sampler::from_raw(self.state.lock().handle()))
    }

    fn destroy_sampler(&self, _sampler: vk::Sampler) {}

    // ── Command pools and buffers ─────────────────────────────────────────

    fn create_command_pool(&self, _flags: vk::CommandPoolCreateFlags) -> VkResult<vk::CommandPool> {
        Ok(vk::CommandPool::from_raw(self.state.lock().handle()))
    }

    fn destroy_command_pool(&self, _pool: vk::CommandPool) {}

    fn allocate_command_buffers(&self, _pool: vk::CommandPool, count: u32) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        Ok((0..count)
            .map(|_| {
                let raw = state.handle();
                state.commands.insert(raw, CommandRecord::default());
                vk::CommandBuffer::from_raw(raw)
            })
            .collect())
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for &cmd in buffers {
            let raw = cmd.as_raw();
            if state.cmd_pending(raw) {
                state.violation(format!("command buffer {cmd:?} freed while pending"));
            }
            state.commands.remove(&raw);
            state.events.push(Event::FreeCommandBuffer(cmd));
        }
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, _flags: vk::CommandBufferUsageFlags) -> VkResult<()> {
        let mut state = self.state.lock();
        let raw = cmd.as_raw();
        if state.cmd_pending(raw) {
            state.violation(format!("command buffer {cmd:?} re-recorded while pending"));
        }
        state.commands.insert(raw, CommandRecord::default());
        Ok(())
    }

    fn end_command_buffer(&self, _cmd: vk::CommandBuffer) -> VkResult<()> {
        Ok(())
    }

    // ── Recorded commands ─────────────────────────────────────────────────

    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        let mut state = self.state.lock();
        if let Some(record) = state.commands.get_mut(&cmd.as_raw()) {
            record.copies.push((src.as_raw(), dst.as_raw(), regions.to_vec()));
            record.buffers.extend([src.as_raw(), dst.as_raw()]);
        }
        state.events.push(Event::CopyBuffer {
            cmd,
            src,
            dst,
            size: regions.iter().map(|r| r.size).sum(),
        });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        let mut state = self.state.lock();
        if let Some(record) = state.commands.get_mut(&cmd.as_raw()) {
            record.buffers.push(src.as_raw());
        }
        state.events.push(Event::CopyBufferToImage {
            cmd,
            src,
            dst,
            layout: dst_layout,
            regions: regions.to_vec(),
        });
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        let mut state = self.state.lock();
        for barrier in image_barriers {
            state.events.push(Event::Barrier {
                cmd,
                image: barrier.image,
                old: barrier.old_layout,
                new: barrier.new_layout,
                src_access: barrier.src_access_mask,
                dst_access: barrier.dst_access_mask,
                src_stage,
                dst_stage,
            });
        }
    }

    fn cmd_begin_render_pass(&self, _cmd: vk::CommandBuffer, _info: &vk::RenderPassBeginInfo<'_>) {}

    fn cmd_end_render_pass(&self, _cmd: vk::CommandBuffer) {}

    fn cmd_set_viewport(&self, _cmd: vk::CommandBuffer, _viewport: vk::Viewport) {}

    fn cmd_set_scissor(&self, _cmd: vk::CommandBuffer, _scissor: vk::Rect2D) {}

    fn cmd_bind_descriptor_sets(&self, _cmd: vk::CommandBuffer, _layout: vk::PipelineLayout, _sets: &[vk::DescriptorSet]) {}

    fn cmd_bind_pipeline(&self, _cmd: vk::CommandBuffer, _pipeline: vk::Pipeline) {}

    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, _binding: u32, buffer: vk::Buffer, _offset: vk::DeviceSize) {
        let mut state = self.state.lock();
        if let Some(record) = state.commands.get_mut(&cmd.as_raw()) {
            record.buffers.push(buffer.as_raw());
        }
    }

    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
        _index_type: vk::IndexType,
    ) {
        let mut state = self.state.lock();
        if let Some(record) = state.commands.get_mut(&cmd.as_raw()) {
            record.buffers.push(buffer.as_raw());
        }
    }

    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32, _instance_count: u32) {
        self.state.lock().events.push(Event::DrawIndexed { cmd, index_count });
    }

    // ── Synchronization ───────────────────────────────────────────────────

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        let raw = state.handle();
        let initial = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        state.fences.insert(raw, initial);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        if state.fences.get(&fence.as_raw()) == Some(&FenceState::Pending) {
            state.violation(format!("fence {fence:?} destroyed while pending"));
        }
        state.fences.remove(&fence.as_raw());
        state.events.push(Event::DestroyFence(fence));
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        let raw = fence.as_raw();
        let result = match state.fences.get(&raw).copied() {
            Some(FenceState::Signaled) => Ok(()),
            Some(FenceState::Pending) if !state.stall_fences => {
                state.complete_fence(raw);
                Ok(())
            }
            Some(FenceState::Pending) => Err(vk::Result::TIMEOUT),
            Some(FenceState::Unsignaled) => {
                state.violation(format!("wait on fence {fence:?} that was never submitted"));
                Err(vk::Result::TIMEOUT)
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        };
        state.events.push(Event::WaitFence {
            fence,
            signaled: result.is_ok(),
        });
        result
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        let raw = fence.as_raw();
        if state.fences.get(&raw) == Some(&FenceState::Pending) {
            state.violation(format!("fence {fence:?} reset while pending"));
        }
        state.fences.insert(raw, FenceState::Unsignaled);
        state.events.push(Event::ResetFence(fence));
        Ok(())
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        Ok(vk::Semaphore::from_raw(self.state.lock().handle()))
    }

    fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {}

    // ── Queue ─────────────────────────────────────────────────────────────

    fn queue_submit(&self, submission: &Submission<'_>, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();

        let fence_raw = (fence != vk::Fence::null()).then(|| fence.as_raw());
        if let Some(raw) = fence_raw {
            match state.fences.get(&raw).copied() {
                Some(FenceState::Unsignaled) => {}
                other => state.violation(format!("submit with fence {fence:?} in state {other:?}")),
            }
            state.fences.insert(raw, FenceState::Pending);
        }

        let command_buffers: Vec<u64> = submission.command_buffers.iter().map(|cmd| cmd.as_raw()).collect();
        for &cmd in &command_buffers {
            if state.cmd_pending(cmd) {
                state.violation(format!("command buffer {cmd} submitted while still pending"));
            }
            state.run_copies(cmd);
        }

        state.pending.push(PendingSubmission {
            fence: fence_raw,
            command_buffers,
        });
        state.events.push(Event::Submit {
            fence,
            command_buffers: submission.command_buffers.to_vec(),
            wait: submission.wait,
            signal: submission.signal,
        });
        Ok(())
    }

    fn queue_wait_idle(&self) -> VkResult<()> {
        let mut state = self.state.lock();
        state.complete_all();
        state.events.push(Event::QueueWaitIdle);
        Ok(())
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        let mut state = self.state.lock();
        state.complete_all();
        state.events.push(Event::DeviceWaitIdle);
        Ok(())
    }

    // ── Binding objects ───────────────────────────────────────────────────

    fn create_descriptor_pool(&self, _info: &vk::DescriptorPoolCreateInfo<'_>) -> VkResult<vk::DescriptorPool> {
        Ok(vk::DescriptorPool::from_raw(self.state.lock().handle()))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.state.lock().events.push(Event::DestroyDescriptorPool(pool));
    }

    fn create_descriptor_set_layout(
        &self,
        _info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorSetLayout> {
        Ok(vk::DescriptorSetLayout::from_raw(self.state.lock().handle()))
    }

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {}

    fn allocate_descriptor_sets(
        &self,
        _pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let mut state = self.state.lock();
        Ok(layouts
            .iter()
            .map(|_| vk::DescriptorSet::from_raw(state.handle()))
            .collect())
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        let mut state = self.state.lock();
        for write in writes {
            state.events.push(Event::UpdateDescriptor {
                set: write.dst_set,
                binding: write.dst_binding,
                descriptor_type: write.descriptor_type,
            });
        }
    }

    fn create_pipeline_layout(&self, _info: &vk::PipelineLayoutCreateInfo<'_>) -> VkResult<vk::PipelineLayout> {
        Ok(vk::PipelineLayout::from_raw(self.state.lock().handle()))
    }

    fn destroy_pipeline_layout(&self, _layout: vk::PipelineLayout) {}

    // ── Render passes, shaders, pipelines ─────────────────────────────────

    fn create_render_pass(&self, _info: &vk::RenderPassCreateInfo<'_>) -> VkResult<vk::RenderPass> {
        Ok(vk::RenderPass::from_raw(self.state.lock().handle()))
    }

    fn destroy_render_pass(&self, _render_pass: vk::RenderPass) {}

    fn create_framebuffer(&self, _info: &vk::FramebufferCreateInfo<'_>) -> VkResult<vk::Framebuffer> {
        Ok(vk::Framebuffer::from_raw(self.state.lock().handle()))
    }

    fn destroy_framebuffer(&self, _framebuffer: vk::Framebuffer) {}

    fn create_shader_module(&self, _code: &[u32]) -> VkResult<vk::ShaderModule> {
        Ok(vk::ShaderModule::from_raw(self.state.lock().handle()))
    }

    fn destroy_shader_module(&self, _module: vk::ShaderModule) {}

    fn create_pipeline_cache(&self) -> VkResult<vk::PipelineCache> {
        Ok(vk::PipelineCache::from_raw(self.state.lock().handle()))
    }

    fn destroy_pipeline_cache(&self, _cache: vk::PipelineCache) {}

    fn create_graphics_pipeline(
        &self,
        _cache: vk::PipelineCache,
        _info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> VkResult<vk::Pipeline> {
        Ok(vk::Pipeline::from_raw(self.state.lock().handle()))
    }

    fn destroy_pipeline(&self, _pipeline: vk::Pipeline) {}
}

/// Scripted swapchain. Without a script, acquire hands out indices
/// round-robin and present succeeds.
pub struct MockSwapchain {
    image_count: usize,
    extent: vk::Extent2D,
    next: Mutex<u32>,
    acquire_script: Mutex<VecDeque<Result<(u32, bool)>>>,
    present_script: Mutex<VecDeque<Result<bool>>>,
    presented: Mutex<Vec<u32>>,
    acquire_signals: Mutex<Vec<vk::Semaphore>>,
}

impl MockSwapchain {
    pub fn new(image_count: usize) -> Self {
        Self {
            image_count,
            extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
            next: Mutex::new(0),
            acquire_script: Mutex::new(VecDeque::new()),
            present_script: Mutex::new(VecDeque::new()),
            presented: Mutex::new(Vec::new()),
            acquire_signals: Mutex::new(Vec::new()),
        }
    }

    pub fn script_acquire(&self, result: Result<(u32, bool)>) {
        self.acquire_script.lock().push_back(result);
    }

    pub fn script_present(&self, result: Result<bool>) {
        self.present_script.lock().push_back(result);
    }

    pub fn presented(&self) -> Vec<u32> {
        self.presented.lock().clone()
    }

    /// Semaphore handed to each successful acquire, in order.
    pub fn acquire_signals(&self) -> Vec<vk::Semaphore> {
        self.acquire_signals.lock().clone()
    }
}

impl PresentTarget for MockSwapchain {
    fn image_count(&self) -> usize {
        self.image_count
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn acquire_next_image(&self, signal: vk::Semaphore) -> Result<(u32, bool)> {
        let result = match self.acquire_script.lock().pop_front() {
            Some(result) => result,
            None => {
                let mut next = self.next.lock();
                let index = *next;
                *next = (index + 1) % self.image_count as u32;
                Ok((index, false))
            }
        };
        if result.is_ok() {
            self.acquire_signals.lock().push(signal);
        }
        result
    }

    fn present(&self, image_index: u32, _wait: vk::Semaphore) -> Result<bool> {
        let result = self.present_script.lock().pop_front().unwrap_or(Ok(false));
        if result.is_ok() {
            self.presented.lock().push(image_index);
        }
        result
    }
}

/// `SurfaceInvalidated`, for scripting stale-swapchain results.
pub fn surface_invalidated<T>() -> Result<T> {
    Err(RenderError::SurfaceInvalidated)
}
