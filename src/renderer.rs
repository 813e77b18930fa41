// Renderer - top-level ownership graph and present loop
//
// Device -> DeviceContext (allocator + recorder) -> render pass / pipeline
// cache -> swapchain -> frame resources. Only the last two are rebuilt when
// the surface is invalidated.

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::command::DrawBatch;
use crate::backend::device::{DeviceContext, VulkanDevice};
use crate::backend::frame::FrameOutcome;
use crate::backend::framebuffer::{DrawOutcome, FrameResources};
use crate::backend::gpu::{GpuDevice, PresentTarget};
use crate::backend::pipeline::{PipelineCache, RenderPass};
use crate::backend::swapchain::{Surface, Swapchain};
use crate::backend::transfer::UploadStrategy;
use crate::config::Config;
use crate::error::Result;

/// What `Renderer::render` did this call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented(FrameOutcome),
    /// Swapchain and frame resources were rebuilt; nothing is in flight.
    Recreated(vk::Extent2D),
    /// Minimized, or nothing recorded yet.
    Skipped,
}

pub struct Renderer {
    // Drop order: frames wait their fences before anything else goes away
    frames: Option<FrameResources>,
    batch: Option<DrawBatch>,
    swapchain: Option<Swapchain>,
    pipeline_cache: PipelineCache,
    render_pass: RenderPass,
    ctx: DeviceContext,
    surface: Surface,
    device: Arc<VulkanDevice>,

    requested_extent: vk::Extent2D,
    needs_recreate: bool,
    present_mode: vk::PresentModeKHR,
    clear_color: [f32; 4],
    upload_strategy: UploadStrategy,
    anisotropy: bool,
    fence_timeout_ns: u64,
}

impl Renderer {
    pub fn new(
        display: RawDisplayHandle,
        window: RawWindowHandle,
        extent: vk::Extent2D,
        config: &Config,
    ) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        // Validation only in debug builds
        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let (device, surface) = VulkanDevice::new(&config.window.title, enable_validation, display, window)?;

        let gpu: Arc<dyn GpuDevice> = device.clone();
        let fence_timeout = Duration::from_millis(config.sync.fence_timeout_ms);
        let ctx = DeviceContext::new(gpu.clone(), fence_timeout)?;

        let present_mode = config.present_mode();
        let swapchain = Swapchain::new(device.clone(), &surface, extent, present_mode, None)?;

        let render_pass = RenderPass::new(gpu.clone(), swapchain.format(), ctx.capabilities().depth_format)?;
        let pipeline_cache = PipelineCache::new(gpu)?;

        let frames = FrameResources::new(&ctx, &render_pass, &swapchain.view_handles(), swapchain.extent())?;

        log::info!("Vulkan initialized successfully!");

        Ok(Self {
            frames: Some(frames),
            batch: None,
            swapchain: Some(swapchain),
            pipeline_cache,
            render_pass,
            fence_timeout_ns: ctx.fence_timeout_ns(),
            ctx,
            surface,
            device,
            requested_extent: extent,
            needs_recreate: false,
            present_mode,
            clear_color: config.graphics.clear_color,
            upload_strategy: UploadStrategy::from_use_staging(config.graphics.use_staging),
            anisotropy: config.graphics.anisotropy,
        })
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn gpu(&self) -> Arc<dyn GpuDevice> {
        self.ctx.device().clone()
    }

    pub fn render_pass(&self) -> &RenderPass {
        &self.render_pass
    }

    pub fn pipeline_cache(&self) -> &PipelineCache {
        &self.pipeline_cache
    }

    pub fn upload_strategy(&self) -> UploadStrategy {
        self.upload_strategy
    }

    pub fn anisotropy(&self) -> bool {
        self.anisotropy
    }

    /// Current swapchain extent, or the requested one while minimized.
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain
            .as_ref()
            .map_or(self.requested_extent, |swapchain| swapchain.extent())
    }

    /// Replace what every frame draws. Waits out in-flight frames first.
    pub fn set_draw_batch(&mut self, batch: DrawBatch) -> Result<()> {
        batch.validate()?;
        if let Some(frames) = self.frames.as_mut() {
            frames.sync_mut().wait_all(self.fence_timeout_ns)?;
            self.ctx
                .recorder()
                .build_command_buffers(frames, &self.render_pass, self.clear_color, &batch)?;
        }
        self.batch = Some(batch);
        Ok(())
    }

    /// Block until no frame is in flight. Host-visible data read by the
    /// recorded draws may be rewritten afterwards.
    pub fn wait_frames(&mut self) -> Result<()> {
        match self.frames.as_mut() {
            Some(frames) => frames.sync_mut().wait_all(self.fence_timeout_ns),
            None => Ok(()),
        }
    }

    /// The window changed size; rebuild before the next frame.
    pub fn resize(&mut self, extent: vk::Extent2D) {
        self.requested_extent = extent;
        self.needs_recreate = true;
    }

    pub fn render(&mut self) -> Result<FrameStatus> {
        if self.requested_extent.width == 0 || self.requested_extent.height == 0 {
            return Ok(FrameStatus::Skipped);
        }

        if self.needs_recreate || self.swapchain.is_none() {
            let extent = self.recreate()?;
            return Ok(FrameStatus::Recreated(extent));
        }

        let (Some(frames), Some(swapchain)) = (self.frames.as_mut(), self.swapchain.as_ref()) else {
            return Ok(FrameStatus::Skipped);
        };
        if frames.recorded().is_none() {
            return Ok(FrameStatus::Skipped);
        }

        match frames.draw(swapchain)? {
            DrawOutcome::Presented(outcome) => Ok(FrameStatus::Presented(outcome)),
            DrawOutcome::Rebuild(Some(outcome)) => {
                self.needs_recreate = true;
                Ok(FrameStatus::Presented(outcome))
            }
            DrawOutcome::Rebuild(None) => {
                let extent = self.recreate()?;
                Ok(FrameStatus::Recreated(extent))
            }
        }
    }

    /// Rebuild swapchain and frame resources, re-record the current batch.
    fn recreate(&mut self) -> Result<vk::Extent2D> {
        FrameResources::retire(&mut self.frames, &self.ctx, self.fence_timeout_ns)?;

        let old = self.swapchain.take();
        let swapchain = Swapchain::new(
            self.device.clone(),
            &self.surface,
            self.requested_extent,
            self.present_mode,
            old.as_ref(),
        )?;
        drop(old);

        let frames = FrameResources::rebuilt(
            &self.ctx,
            &self.render_pass,
            &swapchain.view_handles(),
            swapchain.extent(),
            self.batch.as_ref(),
            self.clear_color,
        )?;

        let extent = swapchain.extent();
        self.swapchain = Some(swapchain);
        self.frames = Some(frames);
        self.needs_recreate = false;

        log::info!("Recreated swapchain at {}x{}", extent.width, extent.height);
        Ok(extent)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up renderer...");
        if let Err(e) = self.wait_frames() {
            log::error!("Frames still in flight at teardown: {}", e);
        }
        if let Err(e) = self.ctx.wait_idle() {
            log::error!("Device wait idle failed: {}", e);
        }
    }
}
