//! Image and texture descriptions.

use ash::vk;

use super::ResourceUsage;

/// Three-dimensional extent in texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent3d {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3d {
    pub fn new_2d(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            depth: 1,
        }
    }

    pub fn new_3d(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }
}

/// Full description of an image resource.
#[derive(Debug, Clone)]
pub struct ImageDescription {
    pub extent: Extent3d,
    pub format: vk::Format,
    pub samples: u32,
    pub usage: ResourceUsage,
    pub tiling: vk::ImageTiling,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub debug_name: Option<String>,
}

impl ImageDescription {
    pub fn new_2d(width: u32, height: u32, format: vk::Format, usage: ResourceUsage) -> Self {
        Self {
            extent: Extent3d::new_2d(width, height),
            format,
            samples: 1,
            usage,
            tiling: vk::ImageTiling::OPTIMAL,
            mip_levels: 1,
            array_layers: 1,
            debug_name: None,
        }
    }

    pub fn with_mips(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = Some(name.into());
        self
    }
}

/// Lightweight description for sampled-only textures.
#[derive(Debug, Clone)]
pub struct TextureDescription {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub usage: ResourceUsage,
}

impl TextureDescription {
    pub fn new(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            mip_levels: 1,
            usage: ResourceUsage::SAMPLED | ResourceUsage::TRANSFER_DST,
        }
    }
}
