// Frame synchronizer
//
// One slot per swapchain image, each with a prerecorded draw buffer and a
// fence. Per frame:
//   acquire (signals `image_acquired`)
//   -> wait + reset the slot fence
//   -> submit (waits `image_acquired` at color output, signals `render_complete`)
//   -> present (waits `render_complete`)
//
// `SlotState` is the only record of where a slot is in that cycle:
//   Idle       fence signaled, nothing pending
//   Recording  fence reset, command buffer not yet submitted
//   Submitted  fence unsignaled until the GPU finishes
//
// An acquire whose frame never reached submit leaves `image_acquired` with a
// signal nobody waits on. The next acquire swaps in a fresh semaphore.

use ash::vk;
use std::sync::Arc;

use super::command::{CommandBuffer, CommandBufferState, CommandRecorder};
use super::gpu::{GpuDevice, PresentTarget, Submission};
use super::sync::{Fence, Semaphore};
use crate::error::{vk_err, RenderError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Recording,
    Submitted,
}

pub struct FrameSlot {
    command_buffer: CommandBuffer,
    fence: Fence,
    state: SlotState,
}

impl FrameSlot {
    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn command_buffer(&self) -> &CommandBuffer {
        &self.command_buffer
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }
}

/// Result of one acquire/submit/present cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOutcome {
    pub image_index: u32,
    /// The surface no longer matches exactly; recreate when convenient.
    pub suboptimal: bool,
}

pub struct FrameSynchronizer {
    // Slots drop after `Drop::drop` has waited their fences
    slots: Vec<FrameSlot>,
    image_acquired: Semaphore,
    // `image_acquired` signaled with no submission waiting on it
    acquire_unconsumed: bool,
    render_complete: Semaphore,
    device: Arc<dyn GpuDevice>,
    teardown_timeout_ns: u64,
}

impl FrameSynchronizer {
    /// Create `slot_count` slots, fences signaled so the first wait on each
    /// returns immediately.
    pub fn new(recorder: &CommandRecorder, slot_count: usize) -> Result<Self> {
        let device = recorder.device().clone();
        let command_buffers = recorder.allocate_primary(slot_count as u32)?;

        let slots = command_buffers
            .into_iter()
            .map(|command_buffer| {
                Ok(FrameSlot {
                    command_buffer,
                    fence: Fence::new(device.clone(), true)?,
                    state: SlotState::Idle,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        log::debug!("Frame synchronizer: {} slots", slot_count);

        Ok(Self {
            slots,
            image_acquired: Semaphore::new(device.clone())?,
            acquire_unconsumed: false,
            render_complete: Semaphore::new(device.clone())?,
            device,
            teardown_timeout_ns: recorder.fence_timeout_ns(),
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    pub fn slot_state(&self, index: usize) -> SlotState {
        self.slots[index].state
    }

    /// Number of slots whose submission has not been waited on.
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.state == SlotState::Submitted).count()
    }

    pub fn ensure_not_in_flight(&self) -> Result<()> {
        match self.slots.iter().position(|slot| slot.state == SlotState::Submitted) {
            Some(slot) => Err(RenderError::CommandBufferInFlight { slot }),
            None => Ok(()),
        }
    }

    /// Command buffer of a slot that is not in flight, for re-recording.
    pub fn recordable_command_buffer(&mut self, index: usize) -> Result<&mut CommandBuffer> {
        let slot = &mut self.slots[index];
        if slot.state == SlotState::Submitted {
            return Err(RenderError::CommandBufferInFlight { slot: index });
        }
        Ok(&mut slot.command_buffer)
    }

    /// Acquire the next image and make its slot safe to reuse.
    ///
    /// Blocks on the slot's fence without a timeout. A slot left in
    /// `Recording` by an aborted frame already has a reset fence and is
    /// taken as is.
    pub fn acquire(&mut self, target: &dyn PresentTarget) -> Result<FrameOutcome> {
        if self.acquire_unconsumed {
            log::debug!("Previous frame aborted before submit, replacing acquire semaphore");
            self.image_acquired = Semaphore::new(self.device.clone())?;
            self.acquire_unconsumed = false;
        }

        let (image_index, suboptimal) = target.acquire_next_image(self.image_acquired.handle())?;
        self.acquire_unconsumed = true;

        let index = image_index as usize;
        // More images than slots: the swapchain changed under us
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(RenderError::SurfaceInvalidated)?;

        match slot.state {
            SlotState::Idle | SlotState::Submitted => {
                slot.fence.wait(u64::MAX)?;
                slot.command_buffer.mark_complete();
                slot.fence.reset()?;
            }
            SlotState::Recording => {}
        }
        slot.state = SlotState::Recording;

        Ok(FrameOutcome {
            image_index,
            suboptimal,
        })
    }

    /// Submit the acquired slot's prerecorded buffer.
    pub fn submit(&mut self, image_index: u32) -> Result<()> {
        let index = image_index as usize;
        let slot = &mut self.slots[index];

        if slot.state != SlotState::Recording {
            return Err(RenderError::FrameSlotState {
                slot: index,
                expected: SlotState::Recording,
                actual: slot.state,
            });
        }
        slot.command_buffer.require(CommandBufferState::Executable)?;

        let command_buffers = [slot.command_buffer.handle()];
        let submission = Submission {
            wait: Some((
                self.image_acquired.handle(),
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            )),
            command_buffers: &command_buffers,
            signal: Some(self.render_complete.handle()),
        };

        self.device
            .queue_submit(&submission, slot.fence.handle())
            .map_err(vk_err("vkQueueSubmit"))?;

        slot.command_buffer.mark_submitted();
        slot.state = SlotState::Submitted;
        self.acquire_unconsumed = false;
        Ok(())
    }

    /// Present `image_index` once rendering has completed. Returns the
    /// suboptimal flag.
    pub fn present(&self, target: &dyn PresentTarget, image_index: u32) -> Result<bool> {
        target.present(image_index, self.render_complete.handle())
    }

    /// Full acquire, fence wait, submit, present cycle.
    pub fn draw_frame(&mut self, target: &dyn PresentTarget) -> Result<FrameOutcome> {
        let acquired = self.acquire(target)?;
        self.submit(acquired.image_index)?;
        let suboptimal = self.present(target, acquired.image_index)?;

        Ok(FrameOutcome {
            image_index: acquired.image_index,
            suboptimal: acquired.suboptimal || suboptimal,
        })
    }

    /// Wait for one slot's submission; the slot becomes `Idle`.
    pub fn wait_slot(&mut self, index: usize, timeout_ns: u64) -> Result<()> {
        let slot = &mut self.slots[index];
        if slot.state != SlotState::Submitted {
            return Err(RenderError::FenceNotSubmitted);
        }
        slot.fence.wait(timeout_ns)?;
        slot.command_buffer.mark_complete();
        slot.state = SlotState::Idle;
        Ok(())
    }

    /// Wait out every submitted slot. Slots become `Idle`.
    pub fn wait_all(&mut self, timeout_ns: u64) -> Result<()> {
        for index in 0..self.slots.len() {
            if self.slots[index].state == SlotState::Submitted {
                self.wait_slot(index, timeout_ns)?;
            }
        }
        Ok(())
    }
}

impl Drop for FrameSynchronizer {
    fn drop(&mut self) {
        if let Err(e) = self.wait_all(self.teardown_timeout_ns) {
            log::error!("Frame fences did not signal during teardown: {}", e);

            // Whatever is still pending keeps its fence and command buffer
            for slot in self.slots.drain(..) {
                if slot.state == SlotState::Submitted {
                    slot.fence.leak();
                    drop(slot.command_buffer);
                }
            }
        }
    }
}
