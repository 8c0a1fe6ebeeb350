//! Device capability reporting and the descriptor-object seam.
//!
//! Nodes reach the Vulkan device through [`GpuDevice`] so graphs can be
//! compiled and executed against [`NullDevice`] in tests, the same way
//! the rest of the runtime records commands through a mockable recorder.

use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use bitflags::bitflags;

use crate::error::{GraphError, GraphResult};
use crate::shader::DescriptorLayoutSpec;

bitflags! {
    /// Optional device features a node type may require.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceFeatures: u32 {
        const MESH_SHADER = 1 << 0;
        const TASK_SHADER = 1 << 1;
        const RAY_TRACING = 1 << 2;
    }
}

/// Capability and limit snapshot for one device.
#[derive(Debug, Clone)]
pub struct DeviceCaps {
    pub timestamp_period_ns: f32,
    pub timestamp_valid_bits: u32,
    pub max_bound_descriptor_sets: u32,
    pub max_per_stage_samplers: u32,
    pub max_per_stage_sampled_images: u32,
    pub max_per_stage_storage_images: u32,
    pub max_per_stage_uniform_buffers: u32,
    pub max_per_stage_storage_buffers: u32,
    pub max_push_constants_size: u32,
    pub max_vertex_input_attributes: u32,
    pub features: DeviceFeatures,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        // Conservative desktop-class limits.
        Self {
            timestamp_period_ns: 1.0,
            timestamp_valid_bits: 64,
            max_bound_descriptor_sets: 4,
            max_per_stage_samplers: 16,
            max_per_stage_sampled_images: 16,
            max_per_stage_storage_images: 8,
            max_per_stage_uniform_buffers: 12,
            max_per_stage_storage_buffers: 8,
            max_push_constants_size: 128,
            max_vertex_input_attributes: 16,
            features: DeviceFeatures::empty(),
        }
    }
}

impl DeviceCaps {
    /// Per-stage limit for a descriptor type.
    pub fn per_stage_limit(&self, descriptor_type: vk::DescriptorType) -> Option<u32> {
        match descriptor_type {
            vk::DescriptorType::SAMPLER | vk::DescriptorType::COMBINED_IMAGE_SAMPLER => {
                Some(self.max_per_stage_samplers)
            }
            vk::DescriptorType::SAMPLED_IMAGE => Some(self.max_per_stage_sampled_images),
            vk::DescriptorType::STORAGE_IMAGE => Some(self.max_per_stage_storage_images),
            vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC => {
                Some(self.max_per_stage_uniform_buffers)
            }
            vk::DescriptorType::STORAGE_BUFFER | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => {
                Some(self.max_per_stage_storage_buffers)
            }
            _ => None,
        }
    }
}

/// A buffer or image write into a descriptor set.
#[derive(Debug, Clone)]
pub enum DescriptorWriteInfo {
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    Image {
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
}

/// One descriptor-set update.
#[derive(Debug, Clone)]
pub struct DescriptorWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub info: DescriptorWriteInfo,
}

/// The device operations the graph core calls.
pub trait GpuDevice: Send + Sync {
    fn caps(&self) -> &DeviceCaps;

    fn create_descriptor_set_layout(
        &self,
        spec: &DescriptorLayoutSpec,
    ) -> GraphResult<vk::DescriptorSetLayout>;

    fn create_descriptor_pool(&self, spec: &DescriptorLayoutSpec)
        -> GraphResult<vk::DescriptorPool>;

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> GraphResult<Vec<vk::DescriptorSet>>;

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
}

/// Real device backed by ash.
pub struct VulkanDevice {
    device: ash::Device,
    caps: DeviceCaps,
}

impl VulkanDevice {
    pub fn new(device: ash::Device, caps: DeviceCaps) -> Self {
        Self { device, caps }
    }

    /// Build a capability snapshot from queried device properties.
    pub fn caps_from_properties(properties: &vk::PhysicalDeviceProperties) -> DeviceCaps {
        let limits = &properties.limits;
        DeviceCaps {
            timestamp_period_ns: limits.timestamp_period,
            timestamp_valid_bits: 64,
            max_bound_descriptor_sets: limits.max_bound_descriptor_sets,
            max_per_stage_samplers: limits.max_per_stage_descriptor_samplers,
            max_per_stage_sampled_images: limits.max_per_stage_descriptor_sampled_images,
            max_per_stage_storage_images: limits.max_per_stage_descriptor_storage_images,
            max_per_stage_uniform_buffers: limits.max_per_stage_descriptor_uniform_buffers,
            max_per_stage_storage_buffers: limits.max_per_stage_descriptor_storage_buffers,
            max_push_constants_size: limits.max_push_constants_size,
            max_vertex_input_attributes: limits.max_vertex_input_attributes,
            features: DeviceFeatures::empty(),
        }
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }
}

impl GpuDevice for VulkanDevice {
    fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    fn create_descriptor_set_layout(
        &self,
        spec: &DescriptorLayoutSpec,
    ) -> GraphResult<vk::DescriptorSetLayout> {
        let bindings = spec.to_vulkan_bindings();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        unsafe { self.device.create_descriptor_set_layout(&info, None) }
            .map_err(GraphError::VulkanCallFailed)
    }

    fn create_descriptor_pool(
        &self,
        spec: &DescriptorLayoutSpec,
    ) -> GraphResult<vk::DescriptorPool> {
        let pool_sizes = spec.to_pool_sizes();
        let info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(spec.max_sets.max(1));
        unsafe { self.device.create_descriptor_pool(&info, None) }
            .map_err(GraphError::VulkanCallFailed)
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> GraphResult<Vec<vk::DescriptorSet>> {
        let layouts = vec![layout; count as usize];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        unsafe { self.device.allocate_descriptor_sets(&info) }
            .map_err(GraphError::VulkanCallFailed)
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        for write in writes {
            match &write.info {
                DescriptorWriteInfo::Buffer {
                    buffer,
                    offset,
                    range,
                } => buffer_infos.push(vk::DescriptorBufferInfo {
                    buffer: *buffer,
                    offset: *offset,
                    range: *range,
                }),
                DescriptorWriteInfo::Image {
                    view,
                    sampler,
                    layout,
                } => image_infos.push(vk::DescriptorImageInfo {
                    sampler: *sampler,
                    image_view: *view,
                    image_layout: *layout,
                }),
            }
        }

        let mut vk_writes = Vec::with_capacity(writes.len());
        let mut buffer_cursor = 0;
        let mut image_cursor = 0;
        for write in writes {
            let base = vk::WriteDescriptorSet::default()
                .dst_set(write.set)
                .dst_binding(write.binding)
                .descriptor_type(write.descriptor_type);
            let vk_write = match &write.info {
                DescriptorWriteInfo::Buffer { .. } => {
                    let info = &buffer_infos[buffer_cursor..buffer_cursor + 1];
                    buffer_cursor += 1;
                    base.buffer_info(info)
                }
                DescriptorWriteInfo::Image { .. } => {
                    let info = &image_infos[image_cursor..image_cursor + 1];
                    image_cursor += 1;
                    base.image_info(info)
                }
            };
            vk_writes.push(vk_write);
        }

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }
}

/// Device stand-in that performs no GPU work.
///
/// Hands out fabricated non-null handles so descriptor plumbing can be
/// exercised without hardware.
pub struct NullDevice {
    caps: DeviceCaps,
    next_handle: AtomicU64,
}

impl NullDevice {
    pub fn new() -> Self {
        Self::with_caps(DeviceCaps::default())
    }

    pub fn with_caps(caps: DeviceCaps) -> Self {
        Self {
            caps,
            next_handle: AtomicU64::new(1),
        }
    }

    fn fabricate(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for NullDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for NullDevice {
    fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    fn create_descriptor_set_layout(
        &self,
        _spec: &DescriptorLayoutSpec,
    ) -> GraphResult<vk::DescriptorSetLayout> {
        use vk::Handle;
        Ok(vk::DescriptorSetLayout::from_raw(self.fabricate()))
    }

    fn create_descriptor_pool(
        &self,
        _spec: &DescriptorLayoutSpec,
    ) -> GraphResult<vk::DescriptorPool> {
        use vk::Handle;
        Ok(vk::DescriptorPool::from_raw(self.fabricate()))
    }

    fn allocate_descriptor_sets(
        &self,
        _pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> GraphResult<Vec<vk::DescriptorSet>> {
        use vk::Handle;
        Ok((0..count)
            .map(|_| vk::DescriptorSet::from_raw(self.fabricate()))
            .collect())
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        log::trace!("NullDevice: {} descriptor writes dropped", writes.len());
    }

    fn destroy_descriptor_pool(&self, _pool: vk::DescriptorPool) {}

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_stage_limits() {
        let caps = DeviceCaps::default();
        assert_eq!(
            caps.per_stage_limit(vk::DescriptorType::STORAGE_IMAGE),
            Some(8)
        );
        assert_eq!(
            caps.per_stage_limit(vk::DescriptorType::INPUT_ATTACHMENT),
            None
        );
    }

    #[test]
    fn test_null_device_fabricates_distinct_handles() {
        let device = NullDevice::new();
        let spec = DescriptorLayoutSpec::new();
        let a = device.create_descriptor_set_layout(&spec).unwrap();
        let b = device.create_descriptor_set_layout(&spec).unwrap();
        assert_ne!(a, b);

        let pool = device.create_descriptor_pool(&spec).unwrap();
        let sets = device.allocate_descriptor_sets(pool, a, 3).unwrap();
        assert_eq!(sets.len(), 3);
    }
}
