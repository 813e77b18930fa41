// Synchronization primitives
//
// Fences for GPU-CPU sync, semaphores for GPU-GPU ordering between queue
// operations. Both destroy their handle on drop.

use ash::vk;
use std::sync::Arc;

use super::gpu::GpuDevice;
use crate::error::{vk_err, RenderError, Result};

/// CPU-visible completion signal for a submitted batch.
pub struct Fence {
    device: Arc<dyn GpuDevice>,
    handle: vk::Fence,
}

impl Fence {
    pub fn new(device: Arc<dyn GpuDevice>, signaled: bool) -> Result<Self> {
        let handle = device.create_fence(signaled).map_err(vk_err("vkCreateFence"))?;
        Ok(Self { device, handle })
    }

    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Block until signaled or `timeout_ns` elapses.
    pub fn wait(&self, timeout_ns: u64) -> Result<()> {
        match self.device.wait_for_fence(self.handle, timeout_ns) {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RenderError::SynchronizationTimeout { timeout_ns }),
            Err(e) => Err(RenderError::from_vk("vkWaitForFences", e)),
        }
    }

    pub fn reset(&self) -> Result<()> {
        self.device
            .reset_fence(self.handle)
            .map_err(vk_err("vkResetFences"))
    }

    /// Drop the handle without destroying it; a fence still attached to
    /// pending work must not be destroyed.
    pub fn leak(mut self) {
        log::warn!("Leaking fence {:?} after a timed-out wait", self.handle);
        self.handle = vk::Fence::null();
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        if self.handle != vk::Fence::null() {
            self.device.destroy_fence(self.handle);
        }
    }
}

/// GPU-side ordering signal. No CPU wait.
pub struct Semaphore {
    device: Arc<dyn GpuDevice>,
    handle: vk::Semaphore,
}

impl Semaphore {
    pub fn new(device: Arc<dyn GpuDevice>) -> Result<Self> {
        let handle = device
            .create_semaphore()
            .map_err(vk_err("vkCreateSemaphore"))?;
        Ok(Self { device, handle })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.handle);
    }
}
