// Surface and swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Out-of-date and lost surfaces come back as `SurfaceInvalidated`; the
// renderer rebuilds the swapchain from the same `Surface`.

use ash::vk;
use std::sync::Arc;

use super::device::VulkanDevice;
use super::gpu::{GpuDevice, PresentTarget};
use super::image::ImageView;
use crate::error::{vk_err, RenderError, Result};

pub struct Surface {
    loader: ash::khr::surface::Instance,
    handle: vk::SurfaceKHR,
    device: Arc<VulkanDevice>,
}

impl Surface {
    /// Take ownership of a surface created alongside `device`.
    pub(crate) fn from_raw(
        device: Arc<VulkanDevice>,
        loader: ash::khr::surface::Instance,
        handle: vk::SurfaceKHR,
    ) -> Self {
        Self { loader, handle, device }
    }

    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// Whether the device's queue can still present here.
    pub fn supports_present(&self) -> bool {
        unsafe {
            self.loader.get_physical_device_surface_support(
                self.device.physical_device(),
                self.device.queue_family_index(),
                self.handle,
            )
        }
        .unwrap_or(false)
    }

    fn capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.loader
                .get_physical_device_surface_capabilities(self.device.physical_device(), self.handle)
        }
        .map_err(vk_err("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))
    }

    fn formats(&self) -> Result<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_formats(self.device.physical_device(), self.handle)
        }
        .map_err(vk_err("vkGetPhysicalDeviceSurfaceFormatsKHR"))
    }

    fn present_modes(&self) -> Result<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_present_modes(self.device.physical_device(), self.handle)
        }
        .map_err(vk_err("vkGetPhysicalDeviceSurfacePresentModesKHR"))
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.handle, None) };
    }
}

/// Prefer an sRGB BGRA format, else whatever the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    // A lone UNDEFINED entry means no preference
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return Some(vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: only.color_space,
            });
        }
    }

    formats
        .iter()
        .find(|f| f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first())
        .copied()
}

/// The configured mode if the surface offers it, otherwise FIFO (always
/// available).
pub fn choose_present_mode(preferred: vk::PresentModeKHR, available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        if preferred != vk::PresentModeKHR::FIFO {
            log::warn!("Present mode {:?} unavailable, using FIFO", preferred);
        }
        vk::PresentModeKHR::FIFO
    }
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: requested
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: requested
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped by the maximum (0 = no cap).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

pub struct Swapchain {
    image_views: Vec<ImageView>,
    loader: ash::khr::swapchain::Device,
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    format: vk::Format,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    /// Create a swapchain for `surface`. Pass the previous swapchain's handle
    /// as `old` when recreating.
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: &Surface,
        requested: vk::Extent2D,
        preferred_mode: vk::PresentModeKHR,
        old: Option<&Swapchain>,
    ) -> Result<Self> {
        if !surface.supports_present() {
            return Err(RenderError::DeviceInitialization(
                "Queue can no longer present to this surface".to_string(),
            ));
        }

        let caps = surface.capabilities()?;
        let formats = surface.formats()?;
        let present_modes = surface.present_modes()?;

        let surface_format = choose_surface_format(&formats)
            .ok_or_else(|| RenderError::DeviceInitialization("Surface reports no formats".to_string()))?;
        let present_mode = choose_present_mode(preferred_mode, &present_modes);
        let extent = choose_extent(&caps, requested);
        let image_count = choose_image_count(&caps);

        let composite_alpha = [
            vk::CompositeAlphaFlagsKHR::OPAQUE,
            vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
            vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
            vk::CompositeAlphaFlagsKHR::INHERIT,
        ]
        .into_iter()
        .find(|&flag| caps.supported_composite_alpha.contains(flag))
        .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE);

        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let loader = ash::khr::swapchain::Device::new(device.instance(), device.raw());

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(pre_transform)
            .composite_alpha(composite_alpha)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |s| s.handle));

        let handle = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(vk_err("vkCreateSwapchainKHR"))?;

        let images = match unsafe { loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { loader.destroy_swapchain(handle, None) };
                return Err(RenderError::from_vk("vkGetSwapchainImagesKHR", e));
            }
        };

        let gpu: Arc<dyn GpuDevice> = device.clone();
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let image_views = images
            .iter()
            .map(|&image| ImageView::new(gpu.clone(), image, surface_format.format, range))
            .collect::<Result<Vec<_>>>();
        let image_views = match image_views {
            Ok(views) => views,
            Err(e) => {
                unsafe { loader.destroy_swapchain(handle, None) };
                return Err(e);
            }
        };

        log::info!(
            "Created swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            images.len(),
            surface_format.format,
            present_mode
        );

        Ok(Self {
            image_views,
            loader,
            handle,
            images,
            format: surface_format.format,
            extent,
            present_mode,
            device,
        })
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn view_handles(&self) -> Vec<vk::ImageView> {
        self.image_views.iter().map(ImageView::handle).collect()
    }
}

impl PresentTarget for Swapchain {
    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn acquire_next_image(&self, signal: vk::Semaphore) -> Result<(u32, bool)> {
        unsafe {
            self.loader
                .acquire_next_image(self.handle, u64::MAX, signal, vk::Fence::null())
        }
        .map_err(vk_err("vkAcquireNextImageKHR"))
    }

    fn present(&self, image_index: u32, wait: vk::Semaphore) -> Result<bool> {
        let wait_semaphores = [wait];
        let swapchains = [self.handle];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let queue = self.device.queue();
        unsafe { self.loader.queue_present(*queue, &present_info) }.map_err(vk_err("vkQueuePresentKHR"))
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // Views first, then the images' owner
        self.image_views.clear();
        unsafe { self.loader.destroy_swapchain(self.handle, None) };
    }
}
