// Error types for the rendering core
//
// Every fallible operation returns `Result<T>`. Raw `vk::Result` codes are
// funnelled through `RenderError::from_vk` so the few recoverable conditions
// (stale swapchain, allocation pressure) arrive as distinct variants instead
// of a generic API failure.

use ash::vk;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RenderError>;

/// Coarse classification of a [`RenderError`], used by callers to decide
/// between recreating the surface, shedding resources, or giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    DeviceInitializationFailure,
    ResourceAllocationFailure,
    SynchronizationTimeout,
    SurfaceInvalidated,
    DeviceLost,
    Configuration,
    Internal,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Device initialization failed: {0}")]
    DeviceInitialization(String),

    #[error("No memory type in bits {type_bits:#b} provides {required:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("Out of device memory")]
    OutOfDeviceMemory,

    #[error("Out of host memory")]
    OutOfHostMemory,

    #[error("Descriptor pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Fence wait exceeded {timeout_ns} ns (GPU hang or lost device)")]
    SynchronizationTimeout { timeout_ns: u64 },

    #[error("Device lost")]
    DeviceLost,

    #[error("Surface invalidated, swapchain must be recreated")]
    SurfaceInvalidated,

    #[error("Unsupported image layout transition {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("Failed to load shader module {path}: {reason}")]
    ShaderModuleLoad { path: String, reason: String },

    #[error("Invalid pipeline configuration: {0}")]
    InvalidPipelineConfig(String),

    #[error("Invalid texture data: {0}")]
    InvalidTextureData(String),

    #[error("Data size ({data_bytes} bytes) exceeds capacity ({capacity} bytes)")]
    DataTooLarge {
        data_bytes: u64,
        capacity: u64,
    },

    #[error("Command buffer is {actual:?}, expected {expected}")]
    CommandBufferState {
        expected: &'static str,
        actual: crate::backend::command::CommandBufferState,
    },

    #[error("Command buffer for slot {slot} is still in flight")]
    CommandBufferInFlight { slot: usize },

    #[error("Frame slot {slot} is {actual:?}, expected {expected:?}")]
    FrameSlotState {
        slot: usize,
        expected: crate::backend::frame::SlotState,
        actual: crate::backend::frame::SlotState,
    },

    #[error("Fence wait requested but no submission is pending")]
    FenceNotSubmitted,

    #[error("Zero-sized {0} requested")]
    ZeroSized(&'static str),

    #[error("Images start UNDEFINED or PREINITIALIZED, not {0:?}")]
    InvalidInitialLayout(vk::ImageLayout),

    #[error("Descriptor binding {binding}: {reason}")]
    DescriptorBinding { binding: u32, reason: String },

    #[error("Resource lacks required usage {0}")]
    MissingUsage(String),

    #[error("Vulkan call {call} failed: {result}")]
    Vulkan { call: &'static str, result: vk::Result },
}

impl RenderError {
    /// Map a raw API result code to the matching variant.
    pub fn from_vk(call: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR => {
                Self::SurfaceInvalidated
            }
            vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                Self::PoolExhausted(format!("{call} returned {result}"))
            }
            vk::Result::TIMEOUT => Self::SynchronizationTimeout { timeout_ns: 0 },
            _ => Self::Vulkan { call, result },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceInitialization(_) => ErrorKind::DeviceInitializationFailure,
            Self::NoSuitableMemoryType { .. }
            | Self::OutOfDeviceMemory
            | Self::OutOfHostMemory
            | Self::PoolExhausted(_) => ErrorKind::ResourceAllocationFailure,
            Self::SynchronizationTimeout { .. } => ErrorKind::SynchronizationTimeout,
            Self::SurfaceInvalidated => ErrorKind::SurfaceInvalidated,
            Self::DeviceLost => ErrorKind::DeviceLost,
            Self::UnsupportedLayoutTransition { .. }
            | Self::ShaderModuleLoad { .. }
            | Self::InvalidPipelineConfig(_)
            | Self::InvalidTextureData(_)
            | Self::DataTooLarge { .. }
            | Self::ZeroSized(_)
            | Self::InvalidInitialLayout(_)
            | Self::DescriptorBinding { .. }
            | Self::MissingUsage(_) => ErrorKind::Configuration,
            Self::CommandBufferState { .. }
            | Self::CommandBufferInFlight { .. }
            | Self::FrameSlotState { .. }
            | Self::FenceNotSubmitted
            | Self::Vulkan { .. } => ErrorKind::Internal,
        }
    }

    /// Recoverable without recreating the device.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SurfaceInvalidated | ErrorKind::ResourceAllocationFailure
        )
    }
}

/// `map_err` adapter: `.map_err(vk_err("vkCreateBuffer"))`.
pub(crate) fn vk_err(call: &'static str) -> impl FnOnce(vk::Result) -> RenderError {
    move |result| RenderError::from_vk(call, result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_date_maps_to_surface_invalidated() {
        let err = RenderError::from_vk("vkAcquireNextImageKHR", vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert!(matches!(err, RenderError::SurfaceInvalidated));
        assert_eq!(err.kind(), ErrorKind::SurfaceInvalidated);
        assert!(err.is_recoverable());
    }

    #[test]
    fn allocation_failures_are_recoverable() {
        let err = RenderError::from_vk("vkAllocateMemory", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(matches!(err, RenderError::OutOfDeviceMemory));
        assert_eq!(err.kind(), ErrorKind::ResourceAllocationFailure);
        assert!(err.is_recoverable());

        let pool = RenderError::from_vk("vkAllocateDescriptorSets", vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        assert!(matches!(pool, RenderError::PoolExhausted(_)));
    }

    #[test]
    fn device_loss_is_distinct_and_fatal() {
        let err = RenderError::from_vk("vkQueueSubmit", vk::Result::ERROR_DEVICE_LOST);
        assert_eq!(err.kind(), ErrorKind::DeviceLost);
        assert!(!err.is_recoverable());

        let timeout = RenderError::SynchronizationTimeout { timeout_ns: 10 };
        assert_eq!(timeout.kind(), ErrorKind::SynchronizationTimeout);
        assert!(!timeout.is_recoverable());
    }

    #[test]
    fn unknown_codes_keep_the_call_name() {
        let err = RenderError::from_vk("vkCreateRenderPass", vk::Result::ERROR_INITIALIZATION_FAILED);
        assert!(err.to_string().contains("vkCreateRenderPass"));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
