//! Common types and descriptors for graph resources.
//!
//! This module contains usage flags, extents and the description structs
//! attached to graph resources before allocation.

mod buffer;
mod image;

pub use buffer::{BufferDescription, MemoryLocation};
pub use image::{Extent3d, ImageDescription, TextureDescription};

use bitflags::bitflags;

bitflags! {
    /// How a resource may be used on the GPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const UNIFORM_BUFFER = 1 << 2;
        const STORAGE_BUFFER = 1 << 3;
        const COLOR_ATTACHMENT = 1 << 4;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 5;
        const TRANSFER_SRC = 1 << 6;
        const TRANSFER_DST = 1 << 7;
        const VERTEX_BUFFER = 1 << 8;
        const INDEX_BUFFER = 1 << 9;
        const INDIRECT = 1 << 10;
    }
}

/// Opaque host-side payload description.
///
/// Used for resources that carry typed host data between nodes (shader
/// bundles, gathered descriptor arrays, packed push-constant blobs)
/// rather than a GPU allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleDescription {
    /// Human-readable payload type name for diagnostics.
    pub type_name: String,
}

impl HandleDescription {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
        }
    }
}

/// Tagged description of what a resource is before allocation.
#[derive(Debug, Clone)]
pub enum ResourceDescription {
    Image(ImageDescription),
    Buffer(BufferDescription),
    Texture(TextureDescription),
    Handle(HandleDescription),
}

impl ResourceDescription {
    /// Usage flags declared by the description, if it has any.
    pub fn usage(&self) -> Option<ResourceUsage> {
        match self {
            ResourceDescription::Image(desc) => Some(desc.usage),
            ResourceDescription::Buffer(desc) => Some(desc.usage),
            ResourceDescription::Texture(desc) => Some(desc.usage),
            ResourceDescription::Handle(_) => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&BufferDescription> {
        match self {
            ResourceDescription::Buffer(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&ImageDescription> {
        match self {
            ResourceDescription::Image(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn as_texture(&self) -> Option<&TextureDescription> {
        match self {
            ResourceDescription::Texture(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<&HandleDescription> {
        match self {
            ResourceDescription::Handle(desc) => Some(desc),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_flags_combine() {
        let usage = ResourceUsage::SAMPLED | ResourceUsage::TRANSFER_DST;
        assert!(usage.contains(ResourceUsage::SAMPLED));
        assert!(!usage.contains(ResourceUsage::STORAGE));
    }

    #[test]
    fn test_description_accessors() {
        let desc = ResourceDescription::Buffer(BufferDescription::new(
            256,
            ResourceUsage::UNIFORM_BUFFER,
        ));
        assert!(desc.as_buffer().is_some());
        assert!(desc.as_image().is_none());
        assert_eq!(desc.usage(), Some(ResourceUsage::UNIFORM_BUFFER));
    }
}
