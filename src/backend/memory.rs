// Memory type selection and the device memory block backing a resource

use ash::vk;

use crate::error::{RenderError, Result};

/// Linear scan of the device memory-type table.
///
/// Returns the lowest index `i` whose bit is set in `type_bits` and whose
/// property flags contain every flag in `required`.
pub fn find_memory_type_index(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32> {
    let count = properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);

    for i in 0..count {
        let allowed = (type_bits & (1 << i)) != 0;
        let has_properties = properties.memory_types[i as usize]
            .property_flags
            .contains(required);

        if allowed && has_properties {
            return Ok(i);
        }
    }

    Err(RenderError::NoSuitableMemoryType { type_bits, required })
}

/// A device allocation owned by exactly one buffer or image.
#[derive(Debug)]
pub struct MemoryBlock {
    pub(crate) memory: vk::DeviceMemory,
    pub(crate) size: vk::DeviceSize,
    pub(crate) type_index: u32,
    pub(crate) properties: vk::MemoryPropertyFlags,
}

impl MemoryBlock {
    pub fn handle(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Allocation size as reported by the memory requirements, alignment
    /// padding included.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn type_index(&self) -> u32 {
        self.type_index
    }

    pub fn properties(&self) -> vk::MemoryPropertyFlags {
        self.properties
    }

    pub fn is_host_visible(&self) -> bool {
        self.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_host_coherent(&self) -> bool {
        self.properties.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = types.len() as u32;
        for (i, flags) in types.iter().enumerate() {
            props.memory_types[i].property_flags = *flags;
        }
        props
    }

    #[test]
    fn picks_lowest_allowed_superset() {
        let props = table(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);

        let index = find_memory_type_index(&props, 0b0110, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn skips_types_masked_out_by_type_bits() {
        let props = table(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);

        let required = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type_index(&props, 0b110, required).unwrap(), 2);
    }

    #[test]
    fn superset_not_subset() {
        let props = table(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);

        let required = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type_index(&props, 0b11, required).unwrap(), 1);
    }

    #[test]
    fn no_match_reports_bits_and_flags() {
        let props = table(&[vk::MemoryPropertyFlags::DEVICE_LOCAL, vk::MemoryPropertyFlags::HOST_VISIBLE]);

        let err = find_memory_type_index(&props, 0b01, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap_err();
        match err {
            RenderError::NoSuitableMemoryType { type_bits, required } => {
                assert_eq!(type_bits, 0b01);
                assert_eq!(required, vk::MemoryPropertyFlags::HOST_VISIBLE);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn bits_beyond_type_count_are_ignored() {
        let props = table(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        assert!(find_memory_type_index(&props, 0b10, vk::MemoryPropertyFlags::empty()).is_err());
        assert_eq!(find_memory_type_index(&props, 0b11, vk::MemoryPropertyFlags::empty()).unwrap(), 0);
    }
}
