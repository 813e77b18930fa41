// Images, views, samplers and textures

use ash::vk;
use std::sync::Arc;

use super::device::DeviceCapabilities;
use super::gpu::GpuDevice;
use super::memory::MemoryBlock;
use crate::error::{vk_err, RenderError, Result};

/// Creation parameters for a 2D image.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub usage: vk::ImageUsageFlags,
    pub tiling: vk::ImageTiling,
    /// `UNDEFINED` or `PREINITIALIZED`.
    pub initial_layout: vk::ImageLayout,
}

impl ImageDesc {
    /// Optimal-tiling image starting in `UNDEFINED`.
    pub fn optimal(extent: vk::Extent2D, format: vk::Format, mip_levels: u32, usage: vk::ImageUsageFlags) -> Self {
        Self {
            extent,
            format,
            mip_levels,
            usage,
            tiling: vk::ImageTiling::OPTIMAL,
            initial_layout: vk::ImageLayout::UNDEFINED,
        }
    }

    /// Host-writable linear image starting in `PREINITIALIZED`.
    pub fn linear(extent: vk::Extent2D, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            extent,
            format,
            mip_levels: 1,
            usage,
            tiling: vk::ImageTiling::LINEAR,
            initial_layout: vk::ImageLayout::PREINITIALIZED,
        }
    }

    pub(crate) fn create_info(&self) -> vk::ImageCreateInfo<'static> {
        vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(self.format)
            .extent(vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            })
            .mip_levels(self.mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(self.tiling)
            .usage(self.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(self.initial_layout)
    }
}

/// Aspect mask implied by a format.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D32_SFLOAT | vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D32_SFLOAT_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D16_UNORM_S8_UINT => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Memory-backed image. Tracks the layout it was last transitioned to.
pub struct Image {
    device: Arc<dyn GpuDevice>,
    handle: vk::Image,
    memory: MemoryBlock,
    desc: ImageDesc,
    layout: vk::ImageLayout,
}

impl Image {
    pub(crate) fn from_parts(device: Arc<dyn GpuDevice>, handle: vk::Image, memory: MemoryBlock, desc: ImageDesc) -> Self {
        Self {
            device,
            handle,
            memory,
            layout: desc.initial_layout,
            desc,
        }
    }

    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.desc.extent
    }

    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    pub fn mip_levels(&self) -> u32 {
        self.desc.mip_levels
    }

    pub fn memory(&self) -> &MemoryBlock {
        &self.memory
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    pub(crate) fn set_layout(&mut self, layout: vk::ImageLayout) {
        self.layout = layout;
    }

    /// Give up ownership without destroying anything, like `Buffer::leak`.
    pub fn leak(mut self) {
        log::warn!(
            "Leaking image {:?}: GPU work may still reference it",
            self.handle
        );
        self.handle = vk::Image::null();
        self.memory.memory = vk::DeviceMemory::null();
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_for_format(self.desc.format)
    }

    /// Every mip level of the single array layer.
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect(),
            base_mip_level: 0,
            level_count: self.desc.mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    /// Write tightly packed rows of mip 0 into a linear, host-visible image,
    /// honouring the driver's row pitch.
    pub fn write_linear(&self, pixels: &[u8], row_bytes: usize) -> Result<()> {
        if self.desc.tiling != vk::ImageTiling::LINEAR || !self.memory.is_host_visible() {
            return Err(RenderError::MissingUsage(
                "linear tiling in HOST_VISIBLE memory for direct writes".to_string(),
            ));
        }
        let height = self.desc.extent.height as usize;
        if row_bytes == 0 || pixels.len() < row_bytes.saturating_mul(height) {
            return Err(RenderError::InvalidTextureData(format!(
                "{} bytes cannot fill {} rows of {} bytes",
                pixels.len(),
                height,
                row_bytes
            )));
        }

        let layout = self.device.image_subresource_layout(
            self.handle,
            vk::ImageSubresource {
                aspect_mask: self.aspect(),
                mip_level: 0,
                array_layer: 0,
            },
        );
        if (row_bytes as u64) > layout.row_pitch {
            return Err(RenderError::DataTooLarge {
                data_bytes: row_bytes as u64,
                capacity: layout.row_pitch,
            });
        }
        // Last byte written must land inside the bound memory
        let end = layout
            .row_pitch
            .checked_mul((height as u64).saturating_sub(1))
            .and_then(|rows| rows.checked_add(layout.offset))
            .and_then(|start| start.checked_add(row_bytes as u64));
        match end {
            Some(end) if end <= self.memory.size() => {}
            _ => {
                return Err(RenderError::DataTooLarge {
                    data_bytes: end.unwrap_or(u64::MAX),
                    capacity: self.memory.size(),
                })
            }
        }

        let memory = self.memory.handle();
        unsafe {
            let base = self
                .device
                .map_memory(memory, 0, vk::WHOLE_SIZE)
                .map_err(vk_err("vkMapMemory"))?;
            let dst = base.add(layout.offset as usize);
            for (row, src) in pixels.chunks_exact(row_bytes).take(height).enumerate() {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr(),
                    dst.add(row * layout.row_pitch as usize),
                    row_bytes,
                );
            }
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
}

impl Drop for Image {
    fn drop(&mut self) {
        if self.handle != vk::Image::null() {
            self.device.destroy_image(self.handle);
        }
        if self.memory.memory != vk::DeviceMemory::null() {
            self.device.free_memory(self.memory.memory);
        }
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("handle", &self.handle)
            .field("desc", &self.desc)
            .field("layout", &self.layout)
            .finish()
    }
}

pub struct ImageView {
    device: Arc<dyn GpuDevice>,
    handle: vk::ImageView,
}

impl ImageView {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        image: vk::Image,
        format: vk::Format,
        range: vk::ImageSubresourceRange,
    ) -> Result<Self> {
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::R,
                g: vk::ComponentSwizzle::G,
                b: vk::ComponentSwizzle::B,
                a: vk::ComponentSwizzle::A,
            })
            .subresource_range(range);

        let handle = device
            .create_image_view(&info)
            .map_err(vk_err("vkCreateImageView"))?;

        Ok(Self { device, handle })
    }

    /// View over every mip level of `image`.
    pub fn for_image(device: Arc<dyn GpuDevice>, image: &Image) -> Result<Self> {
        Self::new(device, image.handle(), image.format(), image.full_range())
    }

    pub fn handle(&self) -> vk::ImageView {
        self.handle
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        self.device.destroy_image_view(self.handle);
    }
}

/// Anisotropy to request: the device limit when the feature is present and
/// enabled in config, otherwise none.
pub fn sampler_anisotropy(caps: &DeviceCapabilities, enabled: bool) -> Option<f32> {
    (enabled && caps.sampler_anisotropy).then_some(caps.max_sampler_anisotropy)
}

pub struct Sampler {
    device: Arc<dyn GpuDevice>,
    handle: vk::Sampler,
    max_lod: f32,
    anisotropy: Option<f32>,
}

impl Sampler {
    /// Linear filtering with repeat addressing.
    pub fn new(device: Arc<dyn GpuDevice>, max_lod: f32, anisotropy: Option<f32>) -> Result<Self> {
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .mip_lod_bias(0.0)
            .compare_op(vk::CompareOp::NEVER)
            .min_lod(0.0)
            .max_lod(max_lod)
            .anisotropy_enable(anisotropy.is_some())
            .max_anisotropy(anisotropy.unwrap_or(1.0))
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE);

        let handle = device.create_sampler(&info).map_err(vk_err("vkCreateSampler"))?;

        Ok(Self {
            device,
            handle,
            max_lod,
            anisotropy,
        })
    }

    pub fn handle(&self) -> vk::Sampler {
        self.handle
    }

    pub fn max_lod(&self) -> f32 {
        self.max_lod
    }

    pub fn anisotropy(&self) -> Option<f32> {
        self.anisotropy
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.device.destroy_sampler(self.handle);
    }
}

/// A sampled image ready for a combined image-sampler descriptor.
pub struct Texture {
    // View and sampler go before the image they refer to
    sampler: Sampler,
    view: ImageView,
    image: Image,
}

impl Texture {
    pub fn new(image: Image, view: ImageView, sampler: Sampler) -> Self {
        Self { sampler, view, image }
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn view(&self) -> &ImageView {
        &self.view
    }

    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler.handle(),
            image_view: self.view.handle(),
            image_layout: self.image.layout(),
        }
    }
}
