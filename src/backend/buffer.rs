// GPU buffers for vertex, index, uniform and staging data
//
// A `Buffer` owns its memory block and releases both on drop. Host access
// goes through `write_bytes`/`read_bytes`, which map for the duration of the
// copy and flush or invalidate when the memory is not host-coherent.

use ash::vk;
use std::sync::Arc;

use super::gpu::GpuDevice;
use super::memory::MemoryBlock;
use crate::error::{vk_err, RenderError, Result};

pub struct Buffer {
    device: Arc<dyn GpuDevice>,
    handle: vk::Buffer,
    memory: MemoryBlock,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
}

impl Buffer {
    /// Takes ownership of an already bound buffer.
    pub(crate) fn from_parts(
        device: Arc<dyn GpuDevice>,
        handle: vk::Buffer,
        memory: MemoryBlock,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Self {
        Self {
            device,
            handle,
            memory,
            size,
            usage,
        }
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Requested size in bytes. The backing block may be larger.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn memory(&self) -> &MemoryBlock {
        &self.memory
    }

    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.handle,
            offset: 0,
            range: self.size,
        }
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn write_bytes(&self, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        self.check_host_access(offset, data.len() as u64)?;
        if data.is_empty() {
            return Ok(());
        }

        let memory = self.memory.handle();
        unsafe {
            let ptr = self
                .device
                .map_memory(memory, 0, vk::WHOLE_SIZE)
                .map_err(vk_err("vkMapMemory"))?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        let flushed = if self.memory.is_host_coherent() {
            Ok(())
        } else {
            self.device
                .flush_memory(memory, 0, vk::WHOLE_SIZE)
                .map_err(vk_err("vkFlushMappedMemoryRanges"))
        };
        self.device.unmap_memory(memory);
        flushed
    }

    /// Write a slice of plain-old-data values starting at offset 0.
    pub fn write_slice<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    /// Copy the whole buffer out to host memory.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        self.check_host_access(0, self.size)?;
        let memory = self.memory.handle();

        unsafe {
            let ptr = self
                .device
                .map_memory(memory, 0, vk::WHOLE_SIZE)
                .map_err(vk_err("vkMapMemory"))?;

            if !self.memory.is_host_coherent() {
                if let Err(e) = self.device.invalidate_memory(memory, 0, vk::WHOLE_SIZE) {
                    self.device.unmap_memory(memory);
                    return Err(RenderError::from_vk("vkInvalidateMappedMemoryRanges", e));
                }
            }

            let bytes = std::slice::from_raw_parts(ptr, self.size as usize).to_vec();
            self.device.unmap_memory(memory);
            Ok(bytes)
        }
    }

    /// Give up ownership without destroying anything. Used when a wait timed
    /// out and the GPU may still be reading or writing the buffer.
    pub fn leak(mut self) {
        log::warn!(
            "Leaking buffer {:?} ({} bytes): GPU work may still reference it",
            self.handle,
            self.size
        );
        self.handle = vk::Buffer::null();
        self.memory.memory = vk::DeviceMemory::null();
    }

    fn check_host_access(&self, offset: vk::DeviceSize, len: u64) -> Result<()> {
        if !self.memory.is_host_visible() {
            return Err(RenderError::MissingUsage(
                "HOST_VISIBLE memory for host access".to_string(),
            ));
        }
        let end = offset.saturating_add(len);
        if end > self.size {
            return Err(RenderError::DataTooLarge {
                data_bytes: end,
                capacity: self.size,
            });
        }
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.handle != vk::Buffer::null() {
            self.device.destroy_buffer(self.handle);
        }
        if self.memory.memory != vk::DeviceMemory::null() {
            self.device.free_memory(self.memory.memory);
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("memory", &self.memory)
            .finish()
    }
}
