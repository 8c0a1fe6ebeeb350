//! GPU memory allocation seam.
//!
//! All device allocation goes through the [`Allocator`] trait so the
//! graph can be compiled against a mock in tests. The production
//! implementation, [`GpuAllocator`], wraps the `gpu-allocator` crate.

use std::collections::HashMap;

use ash::vk;
use parking_lot::Mutex;

use crate::error::AllocationError;
use crate::resource::budget::{BudgetClass, BudgetManager};
use crate::types::{ImageDescription, MemoryLocation, ResourceUsage};

/// Request for a buffer allocation.
#[derive(Debug, Clone)]
pub struct BufferAllocationRequest {
    pub size: u64,
    pub usage: ResourceUsage,
    pub location: MemoryLocation,
    pub can_alias: bool,
    pub debug_name: String,
}

/// Request for an image allocation.
#[derive(Debug, Clone)]
pub struct ImageAllocationRequest {
    pub description: ImageDescription,
    pub can_alias: bool,
}

/// A live buffer allocation. Exactly one [`Resource`](crate::Resource)
/// owns it; `free_buffer` clears the struct to prevent reuse.
#[derive(Debug, Default)]
pub struct BufferAllocation {
    pub buffer: vk::Buffer,
    pub size: u64,
    pub mapped: Option<*mut u8>,
    pub can_alias: bool,
    pub(crate) id: u64,
}

// The mapped pointer targets persistently mapped GPU memory owned by the
// allocation; moving it across threads is safe as long as access is
// externally synchronized, which the single-threaded execute loop
// guarantees.
unsafe impl Send for BufferAllocation {}
unsafe impl Sync for BufferAllocation {}

/// A live image allocation.
#[derive(Debug, Default)]
pub struct ImageAllocation {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub size: u64,
    pub can_alias: bool,
    pub(crate) id: u64,
}

/// Either allocation kind, owned by a resource.
#[derive(Debug)]
pub enum Allocation {
    Buffer(BufferAllocation),
    Image(ImageAllocation),
}

/// Mediates all GPU allocation.
pub trait Allocator: Send + Sync {
    fn allocate_buffer(
        &self,
        request: &BufferAllocationRequest,
    ) -> Result<BufferAllocation, AllocationError>;

    fn allocate_image(
        &self,
        request: &ImageAllocationRequest,
    ) -> Result<ImageAllocation, AllocationError>;

    /// Free a buffer allocation and clear the passed struct.
    fn free_buffer(&self, allocation: &mut BufferAllocation);

    /// Free an image allocation and clear the passed struct.
    fn free_image(&self, allocation: &mut ImageAllocation);

    /// Map a buffer for host access. Persistently mapped allocations
    /// return the existing pointer.
    fn map_buffer(&self, allocation: &BufferAllocation) -> Result<*mut u8, AllocationError>;

    fn unmap_buffer(&self, allocation: &BufferAllocation);

    fn flush_mapped_range(&self, allocation: &BufferAllocation, offset: u64, size: u64);

    fn invalidate_mapped_range(&self, allocation: &BufferAllocation, offset: u64, size: u64);
}

struct AllocationRecord {
    size: u64,
    mapped: bool,
    name: String,
    allocation: gpu_allocator::vulkan::Allocation,
}

/// Production allocator backed by the `gpu-allocator` crate.
pub struct GpuAllocator {
    device: ash::Device,
    inner: Mutex<gpu_allocator::vulkan::Allocator>,
    records: Mutex<HashMap<u64, AllocationRecord>>,
    budget: Option<std::sync::Arc<dyn BudgetManager>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl GpuAllocator {
    /// Create an allocator for the given device.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        budget: Option<std::sync::Arc<dyn BudgetManager>>,
    ) -> Result<Self, AllocationError> {
        let inner = gpu_allocator::vulkan::Allocator::new(
            &gpu_allocator::vulkan::AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: gpu_allocator::AllocationSizes::default(),
            },
        )
        .map_err(|_| AllocationError::Unknown)?;

        Ok(Self {
            device,
            inner: Mutex::new(inner),
            records: Mutex::new(HashMap::new()),
            budget,
            next_id: std::sync::atomic::AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    fn check_budget(&self, bytes: u64) -> Result<(), AllocationError> {
        if let Some(budget) = &self.budget {
            if !budget.try_allocate(BudgetClass::DeviceMemory, bytes) {
                return Err(AllocationError::OverBudget);
            }
        }
        Ok(())
    }

    fn rollback_budget(&self, bytes: u64) {
        if let Some(budget) = &self.budget {
            budget.record_deallocation(BudgetClass::DeviceMemory, bytes);
        }
    }

    fn memory_location(location: MemoryLocation) -> gpu_allocator::MemoryLocation {
        match location {
            MemoryLocation::DeviceLocal | MemoryLocation::Auto => {
                gpu_allocator::MemoryLocation::GpuOnly
            }
            MemoryLocation::HostVisible => gpu_allocator::MemoryLocation::CpuToGpu,
            MemoryLocation::HostCached => gpu_allocator::MemoryLocation::GpuToCpu,
        }
    }

    fn buffer_usage_flags(usage: ResourceUsage) -> vk::BufferUsageFlags {
        let mut flags = vk::BufferUsageFlags::empty();
        if usage.contains(ResourceUsage::UNIFORM_BUFFER) {
            flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if usage.contains(ResourceUsage::STORAGE_BUFFER) {
            flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if usage.contains(ResourceUsage::TRANSFER_SRC) {
            flags |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if usage.contains(ResourceUsage::TRANSFER_DST) {
            flags |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        if usage.contains(ResourceUsage::VERTEX_BUFFER) {
            flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if usage.contains(ResourceUsage::INDEX_BUFFER) {
            flags |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if usage.contains(ResourceUsage::INDIRECT) {
            flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
        }
        flags
    }

    fn image_usage_flags(usage: ResourceUsage) -> vk::ImageUsageFlags {
        let mut flags = vk::ImageUsageFlags::empty();
        if usage.contains(ResourceUsage::SAMPLED) {
            flags |= vk::ImageUsageFlags::SAMPLED;
        }
        if usage.contains(ResourceUsage::STORAGE) {
            flags |= vk::ImageUsageFlags::STORAGE;
        }
        if usage.contains(ResourceUsage::COLOR_ATTACHMENT) {
            flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if usage.contains(ResourceUsage::DEPTH_STENCIL_ATTACHMENT) {
            flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        if usage.contains(ResourceUsage::TRANSFER_SRC) {
            flags |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if usage.contains(ResourceUsage::TRANSFER_DST) {
            flags |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        flags
    }

    fn map_vk_error(result: vk::Result) -> AllocationError {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => AllocationError::OutOfDeviceMemory,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => AllocationError::OutOfHostMemory,
            _ => AllocationError::Unknown,
        }
    }
}

impl Allocator for GpuAllocator {
    fn allocate_buffer(
        &self,
        request: &BufferAllocationRequest,
    ) -> Result<BufferAllocation, AllocationError> {
        if request.size == 0 {
            return Err(AllocationError::InvalidParameters);
        }
        self.check_budget(request.size)?;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(request.size)
            .usage(Self::buffer_usage_flags(request.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }.map_err(|e| {
            self.rollback_budget(request.size);
            Self::map_vk_error(e)
        })?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = self
            .inner
            .lock()
            .allocate(&gpu_allocator::vulkan::AllocationCreateDesc {
                name: &request.debug_name,
                requirements,
                location: Self::memory_location(request.location),
                linear: true,
                allocation_scheme: gpu_allocator::vulkan::AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|_| {
                unsafe { self.device.destroy_buffer(buffer, None) };
                self.rollback_budget(request.size);
                AllocationError::OutOfDeviceMemory
            })?;

        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        }
        .map_err(|e| {
            self.rollback_budget(request.size);
            Self::map_vk_error(e)
        })?;

        let mapped = allocation
            .mapped_ptr()
            .map(|p| p.as_ptr().cast::<u8>());
        let size = allocation.size();
        let id = self.next_id();

        self.records.lock().insert(
            id,
            AllocationRecord {
                size,
                mapped: mapped.is_some(),
                name: request.debug_name.clone(),
                allocation,
            },
        );

        Ok(BufferAllocation {
            buffer,
            size,
            mapped,
            can_alias: request.can_alias,
            id,
        })
    }

    fn allocate_image(
        &self,
        request: &ImageAllocationRequest,
    ) -> Result<ImageAllocation, AllocationError> {
        let desc = &request.description;
        if desc.extent.width == 0 || desc.extent.height == 0 || desc.extent.depth == 0 {
            return Err(AllocationError::InvalidParameters);
        }

        let image_info = vk::ImageCreateInfo::default()
            .image_type(if desc.extent.depth > 1 {
                vk::ImageType::TYPE_3D
            } else {
                vk::ImageType::TYPE_2D
            })
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: desc.extent.depth,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::from_raw(desc.samples))
            .tiling(desc.tiling)
            .usage(Self::image_usage_flags(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&image_info, None) }
            .map_err(Self::map_vk_error)?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        self.check_budget(requirements.size).inspect_err(|_| {
            unsafe { self.device.destroy_image(image, None) };
        })?;

        let allocation = self
            .inner
            .lock()
            .allocate(&gpu_allocator::vulkan::AllocationCreateDesc {
                name: desc.debug_name.as_deref().unwrap_or("image"),
                requirements,
                location: gpu_allocator::MemoryLocation::GpuOnly,
                linear: desc.tiling == vk::ImageTiling::LINEAR,
                allocation_scheme: gpu_allocator::vulkan::AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|_| {
                unsafe { self.device.destroy_image(image, None) };
                self.rollback_budget(requirements.size);
                AllocationError::OutOfDeviceMemory
            })?;

        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }
        .map_err(Self::map_vk_error)?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(if desc.extent.depth > 1 {
                vk::ImageViewType::TYPE_3D
            } else {
                vk::ImageViewType::TYPE_2D
            })
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: desc.mip_levels,
                base_array_layer: 0,
                layer_count: desc.array_layers,
            });
        let view = unsafe { self.device.create_image_view(&view_info, None) }
            .map_err(Self::map_vk_error)?;

        let size = allocation.size();
        let id = self.next_id();
        self.records.lock().insert(
            id,
            AllocationRecord {
                size,
                mapped: false,
                name: desc.debug_name.clone().unwrap_or_default(),
                allocation,
            },
        );

        Ok(ImageAllocation {
            image,
            view,
            size,
            can_alias: request.can_alias,
            id,
        })
    }

    fn free_buffer(&self, allocation: &mut BufferAllocation) {
        if allocation.buffer == vk::Buffer::null() {
            return;
        }
        if let Some(record) = self.records.lock().remove(&allocation.id) {
            let _ = self.inner.lock().free(record.allocation);
            self.rollback_budget(record.size);
        }
        unsafe { self.device.destroy_buffer(allocation.buffer, None) };
        *allocation = BufferAllocation::default();
    }

    fn free_image(&self, allocation: &mut ImageAllocation) {
        if allocation.image == vk::Image::null() {
            return;
        }
        if let Some(record) = self.records.lock().remove(&allocation.id) {
            let _ = self.inner.lock().free(record.allocation);
            self.rollback_budget(record.size);
        }
        unsafe {
            self.device.destroy_image_view(allocation.view, None);
            self.device.destroy_image(allocation.image, None);
        }
        *allocation = ImageAllocation::default();
    }

    fn map_buffer(&self, allocation: &BufferAllocation) -> Result<*mut u8, AllocationError> {
        // Persistently mapped allocations hand back the existing pointer.
        if let Some(ptr) = allocation.mapped {
            return Ok(ptr);
        }
        let mut records = self.records.lock();
        let record = records
            .get_mut(&allocation.id)
            .ok_or(AllocationError::InvalidParameters)?;
        let ptr = record
            .allocation
            .mapped_ptr()
            .ok_or(AllocationError::InvalidParameters)?
            .as_ptr()
            .cast::<u8>();
        record.mapped = true;
        Ok(ptr)
    }

    fn unmap_buffer(&self, allocation: &BufferAllocation) {
        if let Some(record) = self.records.lock().get_mut(&allocation.id) {
            record.mapped = false;
        }
    }

    fn flush_mapped_range(&self, _allocation: &BufferAllocation, _offset: u64, _size: u64) {
        // gpu-allocator keeps host-visible memory coherent; nothing to do.
    }

    fn invalidate_mapped_range(&self, _allocation: &BufferAllocation, _offset: u64, _size: u64) {}
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        // Leak check: anything still recorded was never freed by its
        // owning resource.
        let records = self.records.lock();
        for record in records.values() {
            log::warn!(
                "leaked GPU allocation '{}' ({} bytes, mapped={})",
                record.name,
                record.size,
                record.mapped
            );
        }
    }
}
