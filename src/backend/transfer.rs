// Transfer engine
//
// Responsibilities:
// - Staged uploads: host-visible staging buffer -> device-local buffer/image
// - Direct uploads into host-visible resources
// - Image layout transitions from a fixed (old, new) lattice
// - Device -> host readback
//
// Every staging buffer outlives the wait on the submission that reads it.
// If that wait times out the staging buffer is leaked instead of freed.

use ash::vk;

use super::allocator::{ResourceAllocator, HOST_MEMORY};
use super::buffer::Buffer;
use super::command::{CommandBuffer, CommandRecorder, SubmitWait};
use super::gpu::GpuDevice;
use super::image::{sampler_anisotropy, Image, ImageDesc, ImageView, Sampler, Texture};
use crate::error::{RenderError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadStrategy {
    /// Through a staging buffer into device-local memory.
    #[default]
    Staged,
    /// Written straight into host-visible memory.
    Direct,
}

impl UploadStrategy {
    pub fn from_use_staging(use_staging: bool) -> Self {
        if use_staging {
            Self::Staged
        } else {
            Self::Direct
        }
    }
}

/// Dimensions and byte size of one mip level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MipLevel {
    pub width: u32,
    pub height: u32,
    pub size: u64,
}

/// Decoded texture: mip 0 first, levels packed back to back in `pixels`.
#[derive(Debug, Clone)]
pub struct TextureData {
    pub format: vk::Format,
    pub mips: Vec<MipLevel>,
    pub pixels: Vec<u8>,
}

impl TextureData {
    pub fn extent(&self) -> vk::Extent2D {
        self.mips
            .first()
            .map(|mip| vk::Extent2D {
                width: mip.width,
                height: mip.height,
            })
            .unwrap_or_default()
    }

    /// Check the mip chain against the format before anything is created:
    /// each level halves the previous one (clamped to 1), holds at least the
    /// bytes its extent needs, and the chain is no longer than a full one.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RenderError::InvalidTextureData(msg));

        let Some(base) = self.mips.first() else {
            return invalid("no mip levels".to_string());
        };
        let Some(block) = texel_block(self.format) else {
            return invalid(format!("unsupported format {:?}", self.format));
        };
        if base.width == 0 || base.height == 0 {
            return invalid("mip 0 is empty".to_string());
        }

        let full_chain = 32 - base.width.max(base.height).leading_zeros();
        if self.mips.len() as u32 > full_chain {
            return invalid(format!(
                "{} mips for a {}x{} base, at most {}",
                self.mips.len(),
                base.width,
                base.height,
                full_chain
            ));
        }

        let mut total = 0u64;
        for (level, mip) in self.mips.iter().enumerate() {
            let expected = ((base.width >> level).max(1), (base.height >> level).max(1));
            if (mip.width, mip.height) != expected {
                return invalid(format!(
                    "mip {level} is {}x{}, expected {}x{}",
                    mip.width, mip.height, expected.0, expected.1
                ));
            }
            let needed = block.level_bytes(mip.width, mip.height);
            if mip.size < needed {
                return invalid(format!("mip {level} holds {} bytes, needs {}", mip.size, needed));
            }
            total = total.saturating_add(mip.size);
        }

        if total > self.pixels.len() as u64 {
            return invalid(format!("mips need {} bytes, {} provided", total, self.pixels.len()));
        }
        Ok(())
    }

    /// Tightly packed bytes of one row of mip 0, for uncompressed formats.
    pub fn row_bytes(&self) -> Option<u64> {
        let block = texel_block(self.format)?;
        (block.dim == 1).then(|| u64::from(self.extent().width) * block.bytes)
    }
}

/// Texel block of a sampled format: `dim`x`dim` texels in `bytes` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TexelBlock {
    pub dim: u32,
    pub bytes: u64,
}

impl TexelBlock {
    pub fn level_bytes(&self, width: u32, height: u32) -> u64 {
        u64::from(width.div_ceil(self.dim)) * u64::from(height.div_ceil(self.dim)) * self.bytes
    }
}

pub fn texel_block(format: vk::Format) -> Option<TexelBlock> {
    let (dim, bytes) = match format {
        vk::Format::R8_UNORM => (1, 1),
        vk::Format::R8G8_UNORM => (1, 2),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R32_SFLOAT => (1, 4),
        vk::Format::R16G16B16A16_SFLOAT => (1, 8),
        vk::Format::R32G32B32A32_SFLOAT => (1, 16),
        vk::Format::BC1_RGB_UNORM_BLOCK
        | vk::Format::BC1_RGB_SRGB_BLOCK
        | vk::Format::BC1_RGBA_UNORM_BLOCK
        | vk::Format::BC1_RGBA_SRGB_BLOCK => (4, 8),
        vk::Format::BC2_UNORM_BLOCK
        | vk::Format::BC2_SRGB_BLOCK
        | vk::Format::BC3_UNORM_BLOCK
        | vk::Format::BC3_SRGB_BLOCK
        | vk::Format::BC7_UNORM_BLOCK
        | vk::Format::BC7_SRGB_BLOCK => (4, 16),
        _ => return None,
    };
    Some(TexelBlock { dim, bytes })
}

/// Access masks and stages for one barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Barrier parameters for `old -> new`. Pairs outside the lattice are an
/// error rather than an empty access mask.
pub fn layout_transition(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<LayoutTransition> {
    use vk::AccessFlags as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags as S;

    let (src_access, dst_access, src_stage, dst_stage) = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => {
            (A::empty(), A::TRANSFER_WRITE, S::TOP_OF_PIPE, S::TRANSFER)
        }
        (L::PREINITIALIZED, L::TRANSFER_DST_OPTIMAL) => {
            (A::HOST_WRITE, A::TRANSFER_WRITE, S::HOST, S::TRANSFER)
        }
        (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_DST_OPTIMAL) => {
            (A::TRANSFER_WRITE, A::TRANSFER_WRITE, S::TRANSFER, S::TRANSFER)
        }
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::TRANSFER_WRITE, A::SHADER_READ, S::TRANSFER, S::FRAGMENT_SHADER)
        }
        (L::PREINITIALIZED, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::HOST_WRITE, A::SHADER_READ, S::HOST, S::FRAGMENT_SHADER)
        }
        (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => {
            (A::SHADER_READ, A::TRANSFER_READ, S::FRAGMENT_SHADER, S::TRANSFER)
        }
        (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::TRANSFER_READ, A::SHADER_READ, S::TRANSFER, S::FRAGMENT_SHADER)
        }
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
            A::empty(),
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            S::TOP_OF_PIPE,
            S::EARLY_FRAGMENT_TESTS,
        ),
        _ => return Err(RenderError::UnsupportedLayoutTransition { old, new }),
    };

    Ok(LayoutTransition {
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    })
}

/// Record a layout barrier for `range` of `image` into `cmd`.
pub fn record_layout_transition(
    device: &dyn GpuDevice,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    let transition = layout_transition(old, new)?;

    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(transition.src_access)
        .dst_access_mask(transition.dst_access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range);

    device.cmd_pipeline_barrier(cmd, transition.src_stage, transition.dst_stage, &[barrier]);
    Ok(())
}

/// One buffer-to-image copy per mip level; each starts where the previous
/// level's bytes end.
pub fn mip_copy_regions(mips: &[MipLevel], aspect: vk::ImageAspectFlags) -> Vec<vk::BufferImageCopy> {
    let mut offset = 0u64;
    mips.iter()
        .enumerate()
        .map(|(level, mip)| {
            let region = vk::BufferImageCopy {
                buffer_offset: offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: aspect,
                    mip_level: level as u32,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                image_extent: vk::Extent3D {
                    width: mip.width,
                    height: mip.height,
                    depth: 1,
                },
            };
            offset += mip.size;
            region
        })
        .collect()
}

pub struct TransferEngine<'a> {
    allocator: &'a ResourceAllocator,
    recorder: &'a CommandRecorder,
}

impl<'a> TransferEngine<'a> {
    pub fn new(allocator: &'a ResourceAllocator, recorder: &'a CommandRecorder) -> Self {
        Self { allocator, recorder }
    }

    fn device(&self) -> &dyn GpuDevice {
        self.allocator.device().as_ref()
    }

    /// Upload `data` into a new buffer usable as `usage`.
    pub fn upload_buffer(
        &self,
        data: &[u8],
        usage: vk::BufferUsageFlags,
        strategy: UploadStrategy,
    ) -> Result<Buffer> {
        let size = data.len() as vk::DeviceSize;

        match strategy {
            UploadStrategy::Direct => {
                let buffer = self.allocator.create_buffer(size, usage, HOST_MEMORY)?;
                buffer.write_bytes(0, data)?;
                log::debug!("Direct upload: {} bytes", size);
                Ok(buffer)
            }
            UploadStrategy::Staged => {
                let staging = self.staging_buffer(data)?;
                let buffer = self.allocator.create_buffer(
                    size,
                    usage | vk::BufferUsageFlags::TRANSFER_DST,
                    vk::MemoryPropertyFlags::DEVICE_LOCAL,
                )?;

                let cmd = self.recorder.begin_one_shot()?;
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                };
                self.device()
                    .cmd_copy_buffer(cmd.handle(), staging.handle(), buffer.handle(), &[region]);

                let buffer = self.finish(cmd, staging, buffer)?;
                log::debug!("Staged upload: {} bytes", size);
                Ok(buffer)
            }
        }
    }

    /// `upload_buffer` for a slice of plain-old-data values.
    pub fn upload_slice<T: bytemuck::Pod>(
        &self,
        data: &[T],
        usage: vk::BufferUsageFlags,
        strategy: UploadStrategy,
    ) -> Result<Buffer> {
        self.upload_buffer(bytemuck::cast_slice(data), usage, strategy)
    }

    /// Upload a texture into a sampled image, ending in
    /// `SHADER_READ_ONLY_OPTIMAL`.
    ///
    /// `Direct` needs linear-tiling sampling support for the format and only
    /// uploads mip 0; without that support it falls back to `Staged`.
    pub fn upload_image(&self, data: &TextureData, strategy: UploadStrategy) -> Result<Image> {
        data.validate()?;

        if strategy == UploadStrategy::Direct {
            let features = self.device().format_properties(data.format).linear_tiling_features;
            if let (true, Some(row_bytes)) = (
                features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE),
                data.row_bytes(),
            ) {
                return self.upload_image_direct(data, row_bytes as usize);
            }
            log::warn!(
                "{:?} has no direct path (linear sampling or block format), using staged upload",
                data.format
            );
        }

        self.upload_image_staged(data)
    }

    fn upload_image_staged(&self, data: &TextureData) -> Result<Image> {
        let total: u64 = data.mips.iter().map(|mip| mip.size).sum();
        let staging = self.staging_buffer(&data.pixels[..total as usize])?;

        let desc = ImageDesc::optimal(
            data.extent(),
            data.format,
            data.mips.len() as u32,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        );
        let image = self
            .allocator
            .create_image(&desc, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;

        let cmd = self.recorder.begin_one_shot()?;
        let range = image.full_range();

        record_layout_transition(
            self.device(),
            cmd.handle(),
            image.handle(),
            range,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;

        let regions = mip_copy_regions(&data.mips, image.aspect());
        self.device().cmd_copy_buffer_to_image(
            cmd.handle(),
            staging.handle(),
            image.handle(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &regions,
        );

        record_layout_transition(
            self.device(),
            cmd.handle(),
            image.handle(),
            range,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        let mut image = self.finish(cmd, staging, image)?;
        image.set_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        log::debug!(
            "Staged texture upload: {}x{} {:?}, {} mips, {} bytes",
            desc.extent.width,
            desc.extent.height,
            desc.format,
            desc.mip_levels,
            total
        );
        Ok(image)
    }

    fn upload_image_direct(&self, data: &TextureData, row_bytes: usize) -> Result<Image> {
        let base = data.mips[0];
        let desc = ImageDesc::linear(data.extent(), data.format, vk::ImageUsageFlags::SAMPLED);
        let mut image = self.allocator.create_image(&desc, HOST_MEMORY)?;

        image.write_linear(&data.pixels[..base.size as usize], row_bytes)?;

        if let Err(e) = self.transition_layout(&mut image, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) {
            return Err(abandon_if_pending(e, image));
        }

        log::debug!(
            "Direct texture upload: {}x{} {:?}, {} bytes",
            base.width,
            base.height,
            data.format,
            base.size
        );
        Ok(image)
    }

    /// Upload and wrap in a view and sampler. The sampler covers every
    /// uploaded mip level and uses anisotropy when allowed.
    pub fn upload_texture(
        &self,
        data: &TextureData,
        strategy: UploadStrategy,
        anisotropy: bool,
    ) -> Result<Texture> {
        let image = self.upload_image(data, strategy)?;
        let device = self.allocator.device().clone();

        let view = ImageView::for_image(device.clone(), &image)?;
        // Linear images carry only mip 0
        let max_lod = if image.desc().tiling == vk::ImageTiling::OPTIMAL {
            image.mip_levels() as f32
        } else {
            0.0
        };
        let sampler = Sampler::new(
            device.clone(),
            max_lod,
            sampler_anisotropy(device.capabilities(), anisotropy),
        )?;

        Ok(Texture::new(image, view, sampler))
    }

    /// Move every mip level of `image` to `new` in a blocking one-shot
    /// submission.
    pub fn transition_layout(&self, image: &mut Image, new: vk::ImageLayout) -> Result<()> {
        self.transition_layout_with(image, new, SubmitWait::Fence)
    }

    /// `transition_layout` with an explicit completion wait. Setup code
    /// that runs with nothing else queued uses `SubmitWait::QueueIdle`.
    pub fn transition_layout_with(&self, image: &mut Image, new: vk::ImageLayout, wait: SubmitWait) -> Result<()> {
        let old = image.layout();
        let cmd = self.recorder.begin_one_shot()?;

        record_layout_transition(self.device(), cmd.handle(), image.handle(), image.full_range(), old, new)?;

        self.recorder.flush_one_shot(cmd, wait)?;
        image.set_layout(new);
        log::debug!("Image {:?}: {:?} -> {:?}", image.handle(), old, new);
        Ok(())
    }

    /// Copy a buffer back to host memory through a readback buffer.
    pub fn read_buffer(&self, source: &Buffer) -> Result<Vec<u8>> {
        if !source.usage().contains(vk::BufferUsageFlags::TRANSFER_SRC) {
            return Err(RenderError::MissingUsage("TRANSFER_SRC for readback".to_string()));
        }

        let readback = self.allocator.create_buffer(
            source.size(),
            vk::BufferUsageFlags::TRANSFER_DST,
            HOST_MEMORY,
        )?;

        let cmd = self.recorder.begin_one_shot()?;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: source.size(),
        };
        self.device()
            .cmd_copy_buffer(cmd.handle(), source.handle(), readback.handle(), &[region]);

        if let Err(e) = self.recorder.flush_one_shot(cmd, SubmitWait::Fence) {
            return Err(abandon_if_pending(e, readback));
        }
        readback.read_bytes()
    }

    fn staging_buffer(&self, data: &[u8]) -> Result<Buffer> {
        let staging = self.allocator.create_buffer(
            data.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            HOST_MEMORY,
        )?;
        staging.write_bytes(0, data)?;
        Ok(staging)
    }

    /// Submit and wait, then free `staging` and hand back `target`. On a
    /// timed-out wait both are leaked.
    fn finish<T: Abandon>(&self, cmd: CommandBuffer, staging: Buffer, target: T) -> Result<T> {
        match self.recorder.flush_one_shot(cmd, SubmitWait::Fence) {
            Ok(()) => {
                drop(staging);
                Ok(target)
            }
            Err(e) => {
                let e = abandon_if_pending(e, staging);
                Err(abandon_if_pending(e, target))
            }
        }
    }
}

/// Resources that can be leaked instead of destroyed.
trait Abandon {
    fn abandon(self);
}

impl Abandon for Buffer {
    fn abandon(self) {
        self.leak();
    }
}

impl Abandon for Image {
    fn abandon(self) {
        self.leak();
    }
}

/// After a timed-out wait the submission may still be running, so
/// `resource` is leaked; any other error drops it normally.
fn abandon_if_pending<T: Abandon>(err: RenderError, resource: T) -> RenderError {
    if matches!(err, RenderError::SynchronizationTimeout { .. }) {
        resource.abandon();
    }
    err
}
