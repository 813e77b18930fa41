// =============================================================================
// VKCORE DEMO - textured quad on the rendering core
// =============================================================================
//
// FRAME FLOW:
// 1. Acquire swapchain image
// 2. Wait for the fence of that image's slot
// 3. Submit the slot's pre-recorded command buffer
// 4. Present
//
// A stale surface (resize, out-of-date) rebuilds the swapchain and the
// frame resources; the device and uploaded data are kept.
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::fs::File;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

use vkcore::backend::allocator::HOST_MEMORY;
use vkcore::backend::pipeline::{CullMode, VertexLayout};
use vkcore::backend::{
    Buffer, DescriptorPool, DescriptorSetLayout, DrawBatch, GraphicsPipeline, LayoutBinding,
    MipLevel, PipelineConfig, PipelineLayout, ShaderModule, TextureData,
};
use vkcore::{Config, FrameStatus, Renderer};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config)?;
    log::info!("Starting vkcore demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// env_logger at `info` unless RUST_LOG says otherwise; optionally into a file
fn init_logging(config: &Config) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(log::LevelFilter::Info);
    builder.parse_default_env();

    if config.debug.log_to_file {
        let file = File::create(&config.debug.log_file)
            .with_context(|| format!("Failed to create log file {}", config.debug.log_file))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

// =============================================================================
// SCENE DATA
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    pos: [f32; 3],
    color: [f32; 3],
    uv: [f32; 2],
}

impl Vertex {
    fn layout() -> VertexLayout {
        VertexLayout::new(std::mem::size_of::<Vertex>() as u32)
            .attribute(0, vk::Format::R32G32B32_SFLOAT, 0)
            .attribute(1, vk::Format::R32G32B32_SFLOAT, 12)
            .attribute(2, vk::Format::R32G32_SFLOAT, 24)
    }
}

const VERTICES: [Vertex; 4] = [
    Vertex { pos: [1.0, 1.0, 0.0], color: [1.0, 0.6, 0.6], uv: [1.0, 1.0] },
    Vertex { pos: [-1.0, 1.0, 0.0], color: [0.6, 1.0, 0.6], uv: [0.0, 1.0] },
    Vertex { pos: [-1.0, -1.0, 0.0], color: [0.6, 0.6, 1.0], uv: [0.0, 0.0] },
    Vertex { pos: [1.0, -1.0, 0.0], color: [1.0, 1.0, 1.0], uv: [1.0, 0.0] },
];

const INDICES: [u32; 6] = [0, 1, 2, 2, 3, 0];

/// Uniform block at binding 0 of the vertex shader
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct UniformData {
    projection: Mat4,
    view: Mat4,
    model: Mat4,
}

impl UniformData {
    fn for_extent(extent: vk::Extent2D) -> Self {
        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let mut projection = Mat4::perspective_rh(60f32.to_radians(), aspect, 0.1, 256.0);
        // Vulkan clip space has Y pointing down
        projection.y_axis.y *= -1.0;

        Self {
            projection,
            view: Mat4::from_translation(Vec3::new(0.0, 0.0, -2.5)),
            model: Mat4::from_rotation_x(-30f32.to_radians()),
        }
    }
}

/// Checkerboard with a full mip chain, RGBA8, levels packed back to back
fn checkerboard(size: u32, levels: u32) -> TextureData {
    let mut mips = Vec::new();
    let mut pixels = Vec::new();

    for level in 0..levels {
        let dim = (size >> level).max(1);
        let cell = (dim / 8).max(1);
        for y in 0..dim {
            for x in 0..dim {
                let light = ((x / cell) + (y / cell)) % 2 == 0;
                let v = if light { 230 } else { 40 };
                pixels.extend_from_slice(&[v, v, v, 255]);
            }
        }
        mips.push(MipLevel {
            width: dim,
            height: dim,
            size: u64::from(dim) * u64::from(dim) * 4,
        });
    }

    TextureData {
        format: vk::Format::R8G8B8A8_UNORM,
        mips,
        pixels,
    }
}

/// Host-side handles the demo keeps; the draw batch owns the rest
struct Scene {
    uniform_buffer: Arc<Buffer>,
    _descriptor_pool: DescriptorPool,
}

impl Scene {
    fn new(renderer: &mut Renderer, config: &Config) -> Result<Self> {
        let gpu = renderer.gpu();
        let strategy = renderer.upload_strategy();
        log::info!("Uploading scene ({:?})", strategy);

        let (vertex_buffer, index_buffer, texture, uniform_buffer) = {
            let ctx = renderer.context();
            let transfer = ctx.transfer();

            let vertex_buffer = transfer
                .upload_slice(&VERTICES, vk::BufferUsageFlags::VERTEX_BUFFER, strategy)
                .context("Failed to upload vertices")?;
            let index_buffer = transfer
                .upload_slice(&INDICES, vk::BufferUsageFlags::INDEX_BUFFER, strategy)
                .context("Failed to upload indices")?;
            let texture = transfer
                .upload_texture(&checkerboard(256, 9), strategy, renderer.anisotropy())
                .context("Failed to upload texture")?;

            let uniform_buffer = ctx.allocator().create_buffer(
                std::mem::size_of::<UniformData>() as vk::DeviceSize,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                HOST_MEMORY,
            )?;
            uniform_buffer.write_slice(&[UniformData::for_extent(renderer.extent())])?;

            (
                Arc::new(vertex_buffer),
                Arc::new(index_buffer),
                Arc::new(texture),
                Arc::new(uniform_buffer),
            )
        };

        // Binding layer
        let set_layout = DescriptorSetLayout::new(
            gpu.clone(),
            &[
                LayoutBinding::uniform_buffer(0, vk::ShaderStageFlags::VERTEX),
                LayoutBinding::combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT),
            ],
        )?;
        let descriptor_pool = DescriptorPool::new(
            gpu.clone(),
            1,
            &[
                (vk::DescriptorType::UNIFORM_BUFFER, 1),
                (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1),
            ],
        )?;
        let mut descriptor_set = descriptor_pool.allocate(&set_layout)?;
        descriptor_set.write_uniform_buffer(0, uniform_buffer.clone())?;
        descriptor_set.write_texture(1, texture)?;

        let pipeline_layout = PipelineLayout::new(gpu.clone(), &[set_layout])?;

        // Shader modules are only needed while the pipeline is created
        let vertex_shader = ShaderModule::load(gpu.clone(), &config.assets.vertex_shader, vk::ShaderStageFlags::VERTEX)
            .context("Failed to load vertex shader")?;
        let fragment_shader =
            ShaderModule::load(gpu.clone(), &config.assets.fragment_shader, vk::ShaderStageFlags::FRAGMENT)
                .context("Failed to load fragment shader")?;

        let pipeline = GraphicsPipeline::new(
            gpu,
            renderer.pipeline_cache(),
            renderer.render_pass(),
            pipeline_layout,
            &PipelineConfig::new(Vertex::layout()).cull_mode(CullMode::None),
            &vertex_shader,
            &fragment_shader,
        )?;

        renderer.set_draw_batch(DrawBatch {
            pipeline: Arc::new(pipeline),
            descriptor_sets: vec![Arc::new(descriptor_set)],
            vertex_buffer,
            index_buffer,
            index_count: INDICES.len() as u32,
        })?;

        Ok(Self {
            uniform_buffer,
            _descriptor_pool: descriptor_pool,
        })
    }

    /// Only called with no frame in flight
    fn update_uniforms(&self, extent: vk::Extent2D) -> Result<()> {
        self.uniform_buffer
            .write_slice(&[UniformData::for_extent(extent)])?;
        Ok(())
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the renderer waits out in-flight frames
/// before the scene's handles are released.
struct App {
    renderer: Option<Renderer>,
    scene: Option<Scene>,
    window: Option<Arc<Window>>,
    config: Config,
    is_fullscreen: bool,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            renderer: None,
            scene: None,
            window: None,
            config,
            is_fullscreen,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        let display = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let size = window.inner_size();
        let extent = vk::Extent2D {
            width: size.width,
            height: size.height,
        };

        let mut renderer = Renderer::new(display, window_handle, extent, &self.config)
            .context("Failed to create renderer")?;
        let scene = Scene::new(&mut renderer, &self.config)?;

        self.renderer = Some(renderer);
        self.scene = Some(scene);
        Ok(())
    }

    /// Returns whether a frame was presented
    fn render_frame(&mut self) -> Result<bool> {
        let (Some(renderer), Some(scene)) = (self.renderer.as_mut(), self.scene.as_ref()) else {
            return Ok(false);
        };

        match renderer.render()? {
            FrameStatus::Presented(_) => Ok(true),
            FrameStatus::Recreated(extent) => {
                scene.update_uniforms(extent)?;
                Ok(false)
            }
            FrameStatus::Skipped => Ok(false),
        }
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;
            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0
                ));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&window) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.resize(vk::Extent2D {
                        width: size.width,
                        height: size.height,
                    });
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => {
                    let recoverable = e
                        .downcast_ref::<vkcore::RenderError>()
                        .is_some_and(vkcore::RenderError::is_recoverable);
                    log::error!("Render error: {:?}", e);
                    if !recoverable {
                        event_loop.exit();
                    }
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
