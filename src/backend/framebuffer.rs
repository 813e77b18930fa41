// Swapchain-dependent frame resources
//
// Depth target, one framebuffer per swapchain image, the per-slot fences and
// draw buffers. Rebuilt as a group when the surface is invalidated; the
// device, allocator and pipelines are untouched.

use ash::vk;
use std::sync::Arc;

use super::command::{DrawBatch, SubmitWait};
use super::device::DeviceContext;
use super::frame::{FrameOutcome, FrameSynchronizer};
use super::gpu::{GpuDevice, PresentTarget};
use super::image::{Image, ImageDesc, ImageView};
use super::pipeline::RenderPass;
use crate::error::{vk_err, RenderError, Result};

pub struct Framebuffer {
    device: Arc<dyn GpuDevice>,
    handle: vk::Framebuffer,
}

impl Framebuffer {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        render_pass: &RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass.handle())
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let handle = device
            .create_framebuffer(&info)
            .map_err(vk_err("vkCreateFramebuffer"))?;

        Ok(Self { device, handle })
    }

    pub fn handle(&self) -> vk::Framebuffer {
        self.handle
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.device.destroy_framebuffer(self.handle);
    }
}

/// Declaration order is drop order: fences are waited before anything the
/// recorded draws reference goes away.
pub struct FrameResources {
    sync: FrameSynchronizer,
    recorded: Option<DrawBatch>,
    framebuffers: Vec<Framebuffer>,
    depth_view: ImageView,
    depth_image: Image,
    extent: vk::Extent2D,
}

impl FrameResources {
    /// Build the group for `color_views` (one per swapchain image).
    pub fn new(
        ctx: &DeviceContext,
        render_pass: &RenderPass,
        color_views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let device = ctx.device().clone();
        let depth_format = ctx.capabilities().depth_format;

        let mut depth_image = ctx.allocator().create_image(
            &ImageDesc::optimal(
                extent,
                depth_format,
                1,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            ),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        ctx.transfer().transition_layout_with(
            &mut depth_image,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            SubmitWait::QueueIdle,
        )?;
        let depth_view = ImageView::for_image(device.clone(), &depth_image)?;

        let framebuffers = color_views
            .iter()
            .map(|&color| {
                Framebuffer::new(device.clone(), render_pass, &[color, depth_view.handle()], extent)
            })
            .collect::<Result<Vec<_>>>()?;

        let sync = FrameSynchronizer::new(ctx.recorder(), color_views.len())?;

        log::info!(
            "Frame resources: {} framebuffers at {}x{}, depth {:?}",
            framebuffers.len(),
            extent.width,
            extent.height,
            depth_format
        );

        Ok(Self {
            sync,
            recorded: None,
            framebuffers,
            depth_view,
            depth_image,
            extent,
        })
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn slot_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn framebuffer(&self, slot: usize) -> vk::Framebuffer {
        self.framebuffers[slot].handle()
    }

    pub fn depth_image(&self) -> &Image {
        &self.depth_image
    }

    pub fn depth_view(&self) -> &ImageView {
        &self.depth_view
    }

    pub fn sync(&self) -> &FrameSynchronizer {
        &self.sync
    }

    pub fn sync_mut(&mut self) -> &mut FrameSynchronizer {
        &mut self.sync
    }

    /// The batch the current draw buffers were recorded from.
    pub fn recorded(&self) -> Option<&DrawBatch> {
        self.recorded.as_ref()
    }

    pub(crate) fn set_recorded(&mut self, batch: DrawBatch) {
        self.recorded = Some(batch);
    }

    /// One acquire/submit/present cycle. A stale surface, or a suboptimal
    /// one after presenting, asks for a rebuild instead of failing.
    pub fn draw(&mut self, target: &dyn PresentTarget) -> Result<DrawOutcome> {
        match self.sync.draw_frame(target) {
            Ok(outcome) if outcome.suboptimal => {
                log::warn!("Swapchain suboptimal, rebuilding before next frame");
                Ok(DrawOutcome::Rebuild(Some(outcome)))
            }
            Ok(outcome) => Ok(DrawOutcome::Presented(outcome)),
            Err(RenderError::SurfaceInvalidated) => {
                log::info!("Surface invalidated");
                Ok(DrawOutcome::Rebuild(None))
            }
            Err(e) => Err(e),
        }
    }

    /// Wait out every slot and the device, then drop the group. Must run
    /// before the swapchain images its framebuffers point at go away.
    pub fn retire(frames: &mut Option<Self>, ctx: &DeviceContext, timeout_ns: u64) -> Result<()> {
        if let Some(current) = frames.as_mut() {
            current.sync.wait_all(timeout_ns)?;
        }
        // The presentation engine may still hold the shared semaphores
        ctx.wait_idle()?;
        *frames = None;
        Ok(())
    }

    /// A fresh group for `color_views`, with `batch` (if any) re-recorded
    /// into every slot.
    pub fn rebuilt(
        ctx: &DeviceContext,
        render_pass: &RenderPass,
        color_views: &[vk::ImageView],
        extent: vk::Extent2D,
        batch: Option<&DrawBatch>,
        clear_color: [f32; 4],
    ) -> Result<Self> {
        let mut frames = Self::new(ctx, render_pass, color_views, extent)?;
        if let Some(batch) = batch {
            ctx.recorder()
                .build_command_buffers(&mut frames, render_pass, clear_color, batch)?;
        }
        Ok(frames)
    }
}

/// Result of `FrameResources::draw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawOutcome {
    Presented(FrameOutcome),
    /// Retire and rebuild before the next frame. Carries the outcome when
    /// the frame was still presented (suboptimal surface).
    Rebuild(Option<FrameOutcome>),
}
