// Shader module loading and management
//
// Vulkan consumes SPIR-V bytecode. Bytes are checked (word-aligned length,
// magic number) and re-packed into aligned words before module creation.

use ash::vk;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use super::gpu::GpuDevice;
use crate::error::{vk_err, RenderError, Result};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Decode SPIR-V bytes into words. `source` names the input in errors.
pub fn parse_spirv(bytes: &[u8], source: &str) -> Result<Vec<u32>> {
    let fail = |reason: String| RenderError::ShaderModuleLoad {
        path: source.to_string(),
        reason,
    };

    if bytes.is_empty() {
        return Err(fail("empty shader".to_string()));
    }

    // read_spv checks the length and fixes up endianness from the magic word
    let words = ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|e| fail(e.to_string()))?;

    if words.first() != Some(&SPIRV_MAGIC) {
        return Err(fail("missing SPIR-V magic number".to_string()));
    }
    Ok(words)
}

pub struct ShaderModule {
    device: Arc<dyn GpuDevice>,
    handle: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
}

impl ShaderModule {
    pub fn from_spirv(
        device: Arc<dyn GpuDevice>,
        bytes: &[u8],
        stage: vk::ShaderStageFlags,
        source: &str,
    ) -> Result<Self> {
        let words = parse_spirv(bytes, source)?;
        let handle = device
            .create_shader_module(&words)
            .map_err(vk_err("vkCreateShaderModule"))?;

        log::debug!("Loaded {:?} shader {} ({} words)", stage, source, words.len());
        Ok(Self { device, handle, stage })
    }

    /// Read a compiled `.spv` file.
    pub fn load(device: Arc<dyn GpuDevice>, path: impl AsRef<Path>, stage: vk::ShaderStageFlags) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| RenderError::ShaderModuleLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_spirv(device, &bytes, stage, &path.display().to_string())
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        self.device.destroy_shader_module(self.handle);
    }
}
