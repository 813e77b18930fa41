// Binding layer: descriptor set layouts, pool, sets and pipeline layouts
//
// The pool tracks its own capacity so exhaustion is reported as
// `PoolExhausted` before the driver is asked. A `DescriptorSet` holds strong
// references to whatever it was written to point at; the resources cannot
// be released while the set (or a recording that cloned it) exists.

use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

use super::buffer::Buffer;
use super::gpu::GpuDevice;
use super::image::Texture;
use crate::error::{vk_err, RenderError, Result};

/// One binding slot declaration. Holds no resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

impl LayoutBinding {
    pub fn uniform_buffer(binding: u32, stages: vk::ShaderStageFlags) -> Self {
        Self {
            binding,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            count: 1,
            stages,
        }
    }

    pub fn combined_image_sampler(binding: u32, stages: vk::ShaderStageFlags) -> Self {
        Self {
            binding,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count: 1,
            stages,
        }
    }
}

pub struct DescriptorSetLayout {
    device: Arc<dyn GpuDevice>,
    handle: vk::DescriptorSetLayout,
    bindings: Vec<LayoutBinding>,
}

impl DescriptorSetLayout {
    pub fn new(device: Arc<dyn GpuDevice>, bindings: &[LayoutBinding]) -> Result<Arc<Self>> {
        let raw: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
            })
            .collect();

        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&raw);
        let handle = device
            .create_descriptor_set_layout(&info)
            .map_err(vk_err("vkCreateDescriptorSetLayout"))?;

        Ok(Arc::new(Self {
            device,
            handle,
            bindings: bindings.to_vec(),
        }))
    }

    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    fn binding(&self, binding: u32) -> Option<&LayoutBinding> {
        self.bindings.iter().find(|b| b.binding == binding)
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.device.destroy_descriptor_set_layout(self.handle);
    }
}

#[derive(Debug, Default)]
struct PoolUsage {
    sets: u32,
    per_type: Vec<(vk::DescriptorType, u32)>,
}

struct PoolInner {
    device: Arc<dyn GpuDevice>,
    handle: vk::DescriptorPool,
    max_sets: u32,
    capacity: Vec<(vk::DescriptorType, u32)>,
    usage: Mutex<PoolUsage>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // Frees every set allocated from it
        self.device.destroy_descriptor_pool(self.handle);
    }
}

/// Fixed-capacity descriptor pool. Destroyed when the pool handle and every
/// set allocated from it are gone.
pub struct DescriptorPool {
    inner: Arc<PoolInner>,
}

impl DescriptorPool {
    /// `sizes` gives the maximum number of descriptors per type across all
    /// sets.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        max_sets: u32,
        sizes: &[(vk::DescriptorType, u32)],
    ) -> Result<Self> {
        let pool_sizes: Vec<vk::DescriptorPoolSize> = sizes
            .iter()
            .map(|&(ty, descriptor_count)| vk::DescriptorPoolSize { ty, descriptor_count })
            .collect();

        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);

        let handle = device
            .create_descriptor_pool(&info)
            .map_err(vk_err("vkCreateDescriptorPool"))?;

        log::debug!("Descriptor pool: {} sets, sizes {:?}", max_sets, sizes);

        Ok(Self {
            inner: Arc::new(PoolInner {
                device,
                handle,
                max_sets,
                capacity: sizes.to_vec(),
                usage: Mutex::new(PoolUsage::default()),
            }),
        })
    }

    pub fn handle(&self) -> vk::DescriptorPool {
        self.inner.handle
    }

    pub fn allocated_sets(&self) -> u32 {
        self.inner.usage.lock().sets
    }

    /// Allocate one set with `layout`.
    pub fn allocate(&self, layout: &Arc<DescriptorSetLayout>) -> Result<DescriptorSet> {
        let inner = &self.inner;
        let mut usage = inner.usage.lock();

        if usage.sets >= inner.max_sets {
            return Err(RenderError::PoolExhausted(format!(
                "all {} sets allocated",
                inner.max_sets
            )));
        }

        // Descriptor counts after this allocation, per type
        let mut wanted = usage.per_type.clone();
        for binding in layout.bindings() {
            match wanted.iter_mut().find(|(ty, _)| *ty == binding.descriptor_type) {
                Some((_, used)) => *used += binding.count,
                None => wanted.push((binding.descriptor_type, binding.count)),
            }
        }
        for &(ty, used) in &wanted {
            let capacity = inner
                .capacity
                .iter()
                .find(|(cap_ty, _)| *cap_ty == ty)
                .map_or(0, |&(_, n)| n);
            if used > capacity {
                return Err(RenderError::PoolExhausted(format!(
                    "{ty:?}: {used} descriptors requested, capacity {capacity}"
                )));
            }
        }

        let handle = inner
            .device
            .allocate_descriptor_sets(inner.handle, &[layout.handle()])
            .map_err(vk_err("vkAllocateDescriptorSets"))?
            .pop()
            .ok_or_else(|| RenderError::PoolExhausted("driver returned no set".to_string()))?;

        usage.sets += 1;
        usage.per_type = wanted;

        Ok(DescriptorSet {
            pool: inner.clone(),
            layout: layout.clone(),
            handle,
            bound: Vec::new(),
        })
    }
}

/// Resource a descriptor points at.
#[derive(Clone)]
pub enum BoundResource {
    UniformBuffer(Arc<Buffer>),
    Texture(Arc<Texture>),
}

pub struct DescriptorSet {
    // Keeps the pool (and so the set) alive
    pool: Arc<PoolInner>,
    layout: Arc<DescriptorSetLayout>,
    handle: vk::DescriptorSet,
    bound: Vec<(u32, BoundResource)>,
}

impl std::fmt::Debug for DescriptorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSet")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl DescriptorSet {
    pub fn handle(&self) -> vk::DescriptorSet {
        self.handle
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    pub fn bound(&self, binding: u32) -> Option<&BoundResource> {
        self.bound.iter().find(|(b, _)| *b == binding).map(|(_, r)| r)
    }

    fn check_binding(&self, binding: u32, expected: vk::DescriptorType) -> Result<()> {
        let declared = self.layout.binding(binding).ok_or_else(|| RenderError::DescriptorBinding {
            binding,
            reason: "not declared in the set layout".to_string(),
        })?;
        if declared.descriptor_type != expected {
            return Err(RenderError::DescriptorBinding {
                binding,
                reason: format!("declared {:?}, written {:?}", declared.descriptor_type, expected),
            });
        }
        Ok(())
    }

    /// Point `binding` at `buffer` (which needs `UNIFORM_BUFFER` usage).
    ///
    /// Takes `&mut self`: a set shared with a recorded draw cannot be
    /// rewritten.
    pub fn write_uniform_buffer(&mut self, binding: u32, buffer: Arc<Buffer>) -> Result<()> {
        self.check_binding(binding, vk::DescriptorType::UNIFORM_BUFFER)?;
        if !buffer.usage().contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
            return Err(RenderError::MissingUsage("UNIFORM_BUFFER for a uniform descriptor".to_string()));
        }

        let info = [buffer.descriptor_info()];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.handle)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&info);
        self.pool.device.update_descriptor_sets(&[write]);

        self.bind(binding, BoundResource::UniformBuffer(buffer));
        Ok(())
    }

    /// Point `binding` at a sampled texture.
    pub fn write_texture(&mut self, binding: u32, texture: Arc<Texture>) -> Result<()> {
        self.check_binding(binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER)?;
        if texture.image().layout() != vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL {
            return Err(RenderError::DescriptorBinding {
                binding,
                reason: format!("texture is in {:?}, not shader-read-only", texture.image().layout()),
            });
        }

        let info = [texture.descriptor_info()];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.handle)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&info);
        self.pool.device.update_descriptor_sets(&[write]);

        self.bind(binding, BoundResource::Texture(texture));
        Ok(())
    }

    fn bind(&mut self, binding: u32, resource: BoundResource) {
        match self.bound.iter_mut().find(|(b, _)| *b == binding) {
            Some((_, slot)) => *slot = resource,
            None => self.bound.push((binding, resource)),
        }
    }
}

pub struct PipelineLayout {
    device: Arc<dyn GpuDevice>,
    handle: vk::PipelineLayout,
    _set_layouts: Vec<Arc<DescriptorSetLayout>>,
}

impl PipelineLayout {
    pub fn new(device: Arc<dyn GpuDevice>, set_layouts: &[Arc<DescriptorSetLayout>]) -> Result<Arc<Self>> {
        let handles: Vec<vk::DescriptorSetLayout> = set_layouts.iter().map(|l| l.handle()).collect();
        let info = vk::PipelineLayoutCreateInfo::default().set_layouts(&handles);

        let handle = device
            .create_pipeline_layout(&info)
            .map_err(vk_err("vkCreatePipelineLayout"))?;

        Ok(Arc::new(Self {
            device,
            handle,
            _set_layouts: set_layouts.to_vec(),
        }))
    }

    pub fn handle(&self) -> vk::PipelineLayout {
        self.handle
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        self.device.destroy_pipeline_layout(self.handle);
    }
}
