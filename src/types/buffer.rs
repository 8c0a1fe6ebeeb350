//! Buffer descriptions.

use super::ResourceUsage;

/// Where an allocation should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryLocation {
    /// Let the allocator decide.
    #[default]
    Auto,
    /// Device-local memory, fastest for GPU access.
    DeviceLocal,
    /// Host-visible, persistently mapped, sequential-write friendly.
    HostVisible,
    /// Host-visible and cached, for readback.
    HostCached,
}

/// Description of a buffer resource.
#[derive(Debug, Clone)]
pub struct BufferDescription {
    pub size: u64,
    pub usage: ResourceUsage,
    pub location: MemoryLocation,
    pub debug_name: Option<String>,
}

impl BufferDescription {
    pub fn new(size: u64, usage: ResourceUsage) -> Self {
        Self {
            size,
            usage,
            location: MemoryLocation::Auto,
            debug_name: None,
        }
    }

    pub fn with_location(mut self, location: MemoryLocation) -> Self {
        self.location = location;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_description_builder() {
        let desc = BufferDescription::new(1024, ResourceUsage::STORAGE_BUFFER)
            .with_location(MemoryLocation::HostVisible)
            .with_name("particles");
        assert_eq!(desc.size, 1024);
        assert_eq!(desc.location, MemoryLocation::HostVisible);
        assert_eq!(desc.debug_name.as_deref(), Some("particles"));
    }
}
