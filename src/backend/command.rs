// Command pool, command buffers and recording
//
// Responsibilities:
// - Process-wide command pool (resettable buffers)
// - One-shot setup buffers: begin, submit, block on a fence or queue idle
// - Per-slot draw buffers recorded once per topology change

use ash::vk;
use std::sync::Arc;

use super::buffer::Buffer;
use super::descriptor::DescriptorSet;
use super::framebuffer::FrameResources;
use super::gpu::{GpuDevice, Submission};
use super::pipeline::{GraphicsPipeline, RenderPass};
use super::sync::Fence;
use crate::error::{vk_err, RenderError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Submitted,
}

pub struct CommandPool {
    device: Arc<dyn GpuDevice>,
    handle: vk::CommandPool,
}

impl CommandPool {
    pub fn new(device: Arc<dyn GpuDevice>, flags: vk::CommandPoolCreateFlags) -> Result<Arc<Self>> {
        let handle = device
            .create_command_pool(flags)
            .map_err(vk_err("vkCreateCommandPool"))?;
        Ok(Arc::new(Self { device, handle }))
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.handle
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.device.destroy_command_pool(self.handle);
    }
}

/// Primary command buffer with its recording state.
///
/// Dropping frees the buffer back to its pool, except while it is still
/// `Submitted`: then the handle is leaked, since freeing it could pull the
/// recording out from under the GPU.
pub struct CommandBuffer {
    pool: Arc<CommandPool>,
    handle: vk::CommandBuffer,
    state: CommandBufferState,
}

impl CommandBuffer {
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.pool.device
    }

    pub(crate) fn require(&self, expected: CommandBufferState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RenderError::CommandBufferState {
                expected: state_name(expected),
                actual: self.state,
            })
        }
    }

    /// Start recording. A previously recorded buffer is implicitly reset.
    pub fn begin(&mut self, flags: vk::CommandBufferUsageFlags) -> Result<()> {
        match self.state {
            CommandBufferState::Initial | CommandBufferState::Executable => {}
            actual => {
                return Err(RenderError::CommandBufferState {
                    expected: "Initial or Executable",
                    actual,
                })
            }
        }
        self.device()
            .begin_command_buffer(self.handle, flags)
            .map_err(vk_err("vkBeginCommandBuffer"))?;
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        self.require(CommandBufferState::Recording)?;
        self.device()
            .end_command_buffer(self.handle)
            .map_err(vk_err("vkEndCommandBuffer"))?;
        self.state = CommandBufferState::Executable;
        Ok(())
    }

    pub(crate) fn mark_submitted(&mut self) {
        self.state = CommandBufferState::Submitted;
    }

    /// The submission this buffer belonged to has been waited on.
    pub(crate) fn mark_complete(&mut self) {
        if self.state == CommandBufferState::Submitted {
            self.state = CommandBufferState::Executable;
        }
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if self.state == CommandBufferState::Submitted {
            log::warn!(
                "Leaking command buffer {:?}: its submission was never waited on",
                self.handle
            );
            return;
        }
        self.pool
            .device
            .free_command_buffers(self.pool.handle, &[self.handle]);
    }
}

fn state_name(state: CommandBufferState) -> &'static str {
    match state {
        CommandBufferState::Initial => "Initial",
        CommandBufferState::Recording => "Recording",
        CommandBufferState::Executable => "Executable",
        CommandBufferState::Submitted => "Submitted",
    }
}

/// How `submit_and_wait` blocks until the GPU is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitWait {
    /// Fresh fence, waited with the configured timeout.
    Fence,
    /// No fence; unbounded queue-idle wait.
    QueueIdle,
}

/// Everything one indexed draw needs. Recorded buffers keep a clone, so the
/// referenced resources stay alive as long as the recording does.
#[derive(Clone)]
pub struct DrawBatch {
    pub pipeline: Arc<GraphicsPipeline>,
    pub descriptor_sets: Vec<Arc<DescriptorSet>>,
    pub vertex_buffer: Arc<Buffer>,
    pub index_buffer: Arc<Buffer>,
    pub index_count: u32,
}

impl DrawBatch {
    pub fn validate(&self) -> Result<()> {
        if !self.vertex_buffer.usage().contains(vk::BufferUsageFlags::VERTEX_BUFFER) {
            return Err(RenderError::MissingUsage("VERTEX_BUFFER on vertex buffer".to_string()));
        }
        if !self.index_buffer.usage().contains(vk::BufferUsageFlags::INDEX_BUFFER) {
            return Err(RenderError::MissingUsage("INDEX_BUFFER on index buffer".to_string()));
        }
        let capacity = self.index_buffer.size() / std::mem::size_of::<u32>() as u64;
        if u64::from(self.index_count) > capacity {
            return Err(RenderError::DataTooLarge {
                data_bytes: u64::from(self.index_count) * std::mem::size_of::<u32>() as u64,
                capacity: self.index_buffer.size(),
            });
        }
        Ok(())
    }
}

pub struct CommandRecorder {
    device: Arc<dyn GpuDevice>,
    pool: Arc<CommandPool>,
    fence_timeout_ns: u64,
}

impl CommandRecorder {
    pub fn new(device: Arc<dyn GpuDevice>, fence_timeout_ns: u64) -> Result<Self> {
        let pool = CommandPool::new(device.clone(), vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)?;
        Ok(Self {
            device,
            pool,
            fence_timeout_ns,
        })
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn pool(&self) -> &Arc<CommandPool> {
        &self.pool
    }

    pub fn fence_timeout_ns(&self) -> u64 {
        self.fence_timeout_ns
    }

    pub fn allocate_primary(&self, count: u32) -> Result<Vec<CommandBuffer>> {
        let handles = self
            .device
            .allocate_command_buffers(self.pool.handle(), count)
            .map_err(vk_err("vkAllocateCommandBuffers"))?;

        Ok(handles
            .into_iter()
            .map(|handle| CommandBuffer {
                pool: self.pool.clone(),
                handle,
                state: CommandBufferState::Initial,
            })
            .collect())
    }

    /// Allocate a primary buffer and begin a one-time-submit recording.
    pub fn begin_one_shot(&self) -> Result<CommandBuffer> {
        let mut cmd = self
            .allocate_primary(1)?
            .pop()
            .ok_or(RenderError::Vulkan {
                call: "vkAllocateCommandBuffers",
                result: vk::Result::ERROR_UNKNOWN,
            })?;
        cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        Ok(cmd)
    }

    /// End recording (if still open), submit alone on the queue and block
    /// until the GPU has finished it.
    ///
    /// On a timed-out or failed wait the buffer stays `Submitted` and its
    /// fence is leaked.
    pub fn submit_and_wait(&self, cmd: &mut CommandBuffer, wait: SubmitWait) -> Result<()> {
        if cmd.state() == CommandBufferState::Recording {
            cmd.end()?;
        }
        cmd.require(CommandBufferState::Executable)?;

        let fence = match wait {
            SubmitWait::Fence => Some(Fence::new(self.device.clone(), false)?),
            SubmitWait::QueueIdle => None,
        };
        let fence_handle = fence.as_ref().map_or(vk::Fence::null(), Fence::handle);

        let command_buffers = [cmd.handle()];
        let submission = Submission {
            command_buffers: &command_buffers,
            ..Default::default()
        };
        self.device
            .queue_submit(&submission, fence_handle)
            .map_err(vk_err("vkQueueSubmit"))?;
        cmd.mark_submitted();

        let waited = match &fence {
            Some(fence) => fence.wait(self.fence_timeout_ns),
            None => self.device.queue_wait_idle().map_err(vk_err("vkQueueWaitIdle")),
        };

        match waited {
            Ok(()) => {
                cmd.mark_complete();
                Ok(())
            }
            Err(e) => {
                log::error!("One-shot submission did not complete: {}", e);
                if let Some(fence) = fence {
                    fence.leak();
                }
                Err(e)
            }
        }
    }

    /// `submit_and_wait`, then free the buffer.
    pub fn flush_one_shot(&self, mut cmd: CommandBuffer, wait: SubmitWait) -> Result<()> {
        self.submit_and_wait(&mut cmd, wait)
    }

    /// Record one render pass with a single indexed draw into `cmd`.
    pub fn record_draw(
        &self,
        cmd: &mut CommandBuffer,
        render_pass: &RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
        batch: &DrawBatch,
    ) -> Result<()> {
        cmd.begin(vk::CommandBufferUsageFlags::empty())?;
        let handle = cmd.handle();
        let device = &self.device;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue { float32: clear_color },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            },
        ];

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass.handle())
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);

        device.cmd_begin_render_pass(handle, &begin_info);

        device.cmd_set_viewport(
            handle,
            vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
        );
        device.cmd_set_scissor(handle, render_area);

        let sets: Vec<vk::DescriptorSet> = batch.descriptor_sets.iter().map(|set| set.handle()).collect();
        if !sets.is_empty() {
            device.cmd_bind_descriptor_sets(handle, batch.pipeline.layout().handle(), &sets);
        }
        device.cmd_bind_pipeline(handle, batch.pipeline.handle());
        device.cmd_bind_vertex_buffer(handle, 0, batch.vertex_buffer.handle(), 0);
        device.cmd_bind_index_buffer(handle, batch.index_buffer.handle(), 0, vk::IndexType::UINT32);
        device.cmd_draw_indexed(handle, batch.index_count, 1);

        device.cmd_end_render_pass(handle);
        cmd.end()
    }

    /// Re-record every slot's draw buffer against its framebuffer.
    ///
    /// Refuses (before touching any buffer) if a slot is still in flight.
    pub fn build_command_buffers(
        &self,
        frames: &mut FrameResources,
        render_pass: &RenderPass,
        clear_color: [f32; 4],
        batch: &DrawBatch,
    ) -> Result<()> {
        batch.validate()?;
        frames.sync().ensure_not_in_flight()?;

        let extent = frames.extent();
        for slot in 0..frames.slot_count() {
            let framebuffer = frames.framebuffer(slot);
            let cmd = frames.sync_mut().recordable_command_buffer(slot)?;
            self.record_draw(cmd, render_pass, framebuffer, extent, clear_color, batch)?;
        }

        frames.set_recorded(batch.clone());
        log::debug!(
            "Recorded {} draw command buffers ({}x{}, {} indices)",
            frames.slot_count(),
            extent.width,
            extent.height,
            batch.index_count
        );
        Ok(())
    }
}
