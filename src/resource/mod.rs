//! Typed resources flowing along graph edges.
//!
//! A [`Resource`] is an owned, typed handle to a GPU object or a
//! host-side payload. Producer nodes own resources; consumers hold
//! non-owning handles into the graph's resource arena.

mod allocator;
mod budget;

pub use allocator::{
    Allocation, Allocator, BufferAllocation, BufferAllocationRequest, GpuAllocator,
    ImageAllocation, ImageAllocationRequest,
};
pub use budget::{AtomicBudgetManager, BudgetClass, BudgetManager};

use std::any::Any;
use std::sync::Arc;

use ash::vk;

use crate::error::{AllocationError, GraphResult};
use crate::types::{BufferDescription, ImageDescription, ResourceDescription, ResourceUsage};

/// What kind of GPU object (or host payload) a resource wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Image,
    Image3d,
    CubeMap,
    StorageImage,
    Buffer,
    AccelerationStructure,
    Opaque,
}

/// Whether a resource may be aliased during compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceLifetime {
    /// May share an allocation with other transients whose lifetimes do
    /// not overlap in the execution order.
    #[default]
    Transient,
    /// Never aliased; lives for the whole graph.
    Persistent,
}

/// Sum over the Vulkan descriptor handle variants a binding can take.
#[derive(Debug, Clone, Default)]
pub enum DescriptorHandle {
    #[default]
    None,
    ImageView(vk::ImageView),
    Buffer(vk::Buffer),
    Sampler(vk::Sampler),
    AccelerationStructure(vk::AccelerationStructureKHR),
    /// Raw host bytes, used for push-constant sources.
    Bytes(Arc<Vec<u8>>),
    CombinedImageSampler {
        view: vk::ImageView,
        sampler: vk::Sampler,
    },
}

impl DescriptorHandle {
    pub fn is_none(&self) -> bool {
        matches!(self, DescriptorHandle::None)
    }
}

/// Capability implemented by resources that support debug readback.
///
/// Downstream readback nodes query this through
/// [`Resource::debug_capture`] and schedule a capture once per frame.
pub trait DebugCapture: Send + Sync {
    /// Name shown in capture logs.
    fn debug_name(&self) -> &str;

    /// Request a capture of the resource's current contents.
    ///
    /// Implementations record the copy themselves; callers must have
    /// synchronized with the GPU before reading results back.
    fn request_capture(&self);
}

/// An owned, typed handle to a GPU object or host payload.
pub struct Resource {
    kind: ResourceKind,
    lifetime: ResourceLifetime,
    description: ResourceDescription,
    handle: DescriptorHandle,
    allocation: Option<Allocation>,
    payload: Option<Arc<dyn Any + Send + Sync>>,
    debug_capture: Option<Arc<dyn DebugCapture>>,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("kind", &self.kind)
            .field("lifetime", &self.lifetime)
            .field("allocated", &self.allocation.is_some())
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

impl Resource {
    /// Create an unallocated resource.
    pub fn create(
        kind: ResourceKind,
        lifetime: ResourceLifetime,
        description: ResourceDescription,
    ) -> Self {
        Self {
            kind,
            lifetime,
            description,
            handle: DescriptorHandle::None,
            allocation: None,
            payload: None,
            debug_capture: None,
        }
    }

    /// Create an opaque host-payload resource.
    pub fn opaque<T: Any + Send + Sync>(type_name: &str, payload: T) -> Self {
        let mut resource = Self::create(
            ResourceKind::Opaque,
            ResourceLifetime::Persistent,
            ResourceDescription::Handle(crate::types::HandleDescription::new(type_name)),
        );
        resource.payload = Some(Arc::new(payload));
        resource
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn lifetime(&self) -> ResourceLifetime {
        self.lifetime
    }

    pub fn description(&self) -> &ResourceDescription {
        &self.description
    }

    /// Usage flags declared by the description, if any.
    pub fn usage(&self) -> Option<ResourceUsage> {
        self.description.usage()
    }

    /// True iff allocated (or externally supplied) and the underlying
    /// handle is non-null.
    pub fn is_valid(&self) -> bool {
        !self.handle.is_none() || self.payload.is_some()
    }

    /// Descriptor handle for binding this resource into a descriptor set.
    pub fn descriptor_handle(&self) -> DescriptorHandle {
        self.handle.clone()
    }

    /// Override the underlying handle (externally owned objects such as
    /// swapchain image views).
    pub fn set_handle(&mut self, handle: DescriptorHandle) {
        self.handle = handle;
    }

    /// Typed read of an opaque host payload.
    pub fn payload<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.payload.clone().and_then(|p| p.downcast::<T>().ok())
    }

    /// Replace the host payload.
    pub fn set_payload<T: Any + Send + Sync>(&mut self, payload: T) {
        self.payload = Some(Arc::new(payload));
    }

    /// Query the debug-capture capability, if implemented.
    pub fn debug_capture(&self) -> Option<Arc<dyn DebugCapture>> {
        self.debug_capture.clone()
    }

    pub fn set_debug_capture(&mut self, capture: Arc<dyn DebugCapture>) {
        self.debug_capture = Some(capture);
    }

    /// Allocate backing memory for a buffer description.
    pub fn allocate_buffer(
        &mut self,
        allocator: &dyn Allocator,
        description: &BufferDescription,
    ) -> Result<(), AllocationError> {
        let request = BufferAllocationRequest {
            size: description.size,
            usage: description.usage,
            location: description.location,
            can_alias: self.lifetime == ResourceLifetime::Transient,
            debug_name: description.debug_name.clone().unwrap_or_default(),
        };
        let allocation = allocator.allocate_buffer(&request)?;
        self.handle = DescriptorHandle::Buffer(allocation.buffer);
        self.allocation = Some(Allocation::Buffer(allocation));
        Ok(())
    }

    /// Allocate backing memory for an image description.
    pub fn allocate_image(
        &mut self,
        allocator: &dyn Allocator,
        description: &ImageDescription,
    ) -> Result<(), AllocationError> {
        let request = ImageAllocationRequest {
            description: description.clone(),
            can_alias: self.lifetime == ResourceLifetime::Transient,
        };
        let allocation = allocator.allocate_image(&request)?;
        self.handle = DescriptorHandle::ImageView(allocation.view);
        self.allocation = Some(Allocation::Image(allocation));
        Ok(())
    }

    pub fn is_allocated(&self) -> bool {
        self.allocation.is_some()
    }

    /// Release the owned allocation back to the allocator.
    pub fn release(&mut self, allocator: &dyn Allocator) {
        match self.allocation.take() {
            Some(Allocation::Buffer(mut alloc)) => allocator.free_buffer(&mut alloc),
            Some(Allocation::Image(mut alloc)) => allocator.free_image(&mut alloc),
            None => {}
        }
        self.handle = DescriptorHandle::None;
    }

    /// Map the owned buffer allocation for host access.
    pub fn map(&self, allocator: &dyn Allocator) -> GraphResult<*mut u8> {
        match &self.allocation {
            Some(Allocation::Buffer(alloc)) => Ok(allocator.map_buffer(alloc)?),
            _ => Err(crate::error::GraphError::InvalidParameters(
                "map requires an allocated buffer resource".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HandleDescription;
    use ash::vk::Handle;

    struct Probe {
        name: String,
    }

    impl DebugCapture for Probe {
        fn debug_name(&self) -> &str {
            &self.name
        }
        fn request_capture(&self) {}
    }

    #[test]
    fn test_unallocated_resource_is_invalid() {
        let resource = Resource::create(
            ResourceKind::Buffer,
            ResourceLifetime::Transient,
            ResourceDescription::Buffer(BufferDescription::new(64, ResourceUsage::UNIFORM_BUFFER)),
        );
        assert!(!resource.is_valid());
        assert!(resource.descriptor_handle().is_none());
    }

    #[test]
    fn test_opaque_payload_round_trip() {
        let resource = Resource::opaque("u32", 42u32);
        assert!(resource.is_valid());
        assert_eq!(*resource.payload::<u32>().unwrap(), 42);
        assert!(resource.payload::<String>().is_none());
    }

    #[test]
    fn test_debug_capture_capability() {
        let mut resource = Resource::create(
            ResourceKind::StorageImage,
            ResourceLifetime::Persistent,
            ResourceDescription::Handle(HandleDescription::new("probe")),
        );
        assert!(resource.debug_capture().is_none());

        resource.set_debug_capture(Arc::new(Probe {
            name: "voxel_grid".into(),
        }));
        assert_eq!(resource.debug_capture().unwrap().debug_name(), "voxel_grid");
    }

    #[test]
    fn test_set_handle_marks_valid() {
        let mut resource = Resource::create(
            ResourceKind::Image,
            ResourceLifetime::Transient,
            ResourceDescription::Image(ImageDescription::new_2d(
                4,
                4,
                vk::Format::R8G8B8A8_UNORM,
                ResourceUsage::SAMPLED,
            )),
        );
        resource.set_handle(DescriptorHandle::ImageView(vk::ImageView::from_raw(0x10)));
        assert!(resource.is_valid());
    }
}
