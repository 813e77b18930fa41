// Resource allocator
//
// One dedicated memory block per buffer or image, sized to the driver's
// memory requirements. A resource is returned only once it is bound; if any
// step fails, everything created so far is released before the error is
// returned.

use ash::vk;
use std::sync::Arc;

use super::buffer::Buffer;
use super::gpu::GpuDevice;
use super::image::{Image, ImageDesc};
use super::memory::MemoryBlock;
use crate::error::{vk_err, RenderError, Result};

/// Host-visible + coherent: staging, readback and uniform buffers.
pub const HOST_MEMORY: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

pub struct ResourceAllocator {
    device: Arc<dyn GpuDevice>,
}

impl ResourceAllocator {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Buffer> {
        if size == 0 {
            return Err(RenderError::ZeroSized("buffer"));
        }

        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = self.device.create_buffer(&info).map_err(vk_err("vkCreateBuffer"))?;
        let requirements = self.device.buffer_memory_requirements(handle);

        let memory = match self.allocate(requirements, properties) {
            Ok(memory) => memory,
            Err(e) => {
                self.device.destroy_buffer(handle);
                return Err(e);
            }
        };

        if let Err(e) = self.device.bind_buffer_memory(handle, memory.memory) {
            self.device.destroy_buffer(handle);
            self.device.free_memory(memory.memory);
            return Err(RenderError::from_vk("vkBindBufferMemory", e));
        }

        log::debug!(
            "Created buffer: {} bytes (allocated {}), usage {:?}, memory type {}",
            size,
            memory.size,
            usage,
            memory.type_index
        );

        Ok(Buffer::from_parts(self.device.clone(), handle, memory, size, usage))
    }

    pub fn create_image(&self, desc: &ImageDesc, properties: vk::MemoryPropertyFlags) -> Result<Image> {
        if desc.extent.width == 0 || desc.extent.height == 0 || desc.mip_levels == 0 {
            return Err(RenderError::ZeroSized("image"));
        }
        if !matches!(
            desc.initial_layout,
            vk::ImageLayout::UNDEFINED | vk::ImageLayout::PREINITIALIZED
        ) {
            return Err(RenderError::InvalidInitialLayout(desc.initial_layout));
        }

        let handle = self
            .device
            .create_image(&desc.create_info())
            .map_err(vk_err("vkCreateImage"))?;
        let requirements = self.device.image_memory_requirements(handle);

        let memory = match self.allocate(requirements, properties) {
            Ok(memory) => memory,
            Err(e) => {
                self.device.destroy_image(handle);
                return Err(e);
            }
        };

        if let Err(e) = self.device.bind_image_memory(handle, memory.memory) {
            self.device.destroy_image(handle);
            self.device.free_memory(memory.memory);
            return Err(RenderError::from_vk("vkBindImageMemory", e));
        }

        log::debug!(
            "Created image: {}x{} {:?}, {} mips, {:?} tiling, {} bytes",
            desc.extent.width,
            desc.extent.height,
            desc.format,
            desc.mip_levels,
            desc.tiling,
            memory.size
        );

        Ok(Image::from_parts(self.device.clone(), handle, memory, *desc))
    }

    fn allocate(
        &self,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<MemoryBlock> {
        let type_index = self
            .device
            .memory_type_index(requirements.memory_type_bits, properties)?;

        // Requirement size, alignment padding included
        let memory = self
            .device
            .allocate_memory(requirements.size, type_index)
            .map_err(vk_err("vkAllocateMemory"))?;

        Ok(MemoryBlock {
            memory,
            size: requirements.size,
            type_index,
            properties: self.device.memory_properties().memory_types[type_index as usize].property_flags,
        })
    }
}
