//! Shader-facing data consumed by the graph.
//!
//! The core does not compile or reflect shaders. It receives
//! [`ShaderDataBundle`]s (compiled SPIR-V plus reflection records and a
//! descriptor layout specification) and reads them byte-for-byte
//! unchanged.

use std::collections::HashMap;

use ash::vk;

/// One binding inside a descriptor set layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorBindingSpec {
    pub set: u32,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,
    pub stage_flags: vk::ShaderStageFlags,
    pub name: String,
}

impl DescriptorBindingSpec {
    pub fn new(binding: u32, descriptor_type: vk::DescriptorType, name: impl Into<String>) -> Self {
        Self {
            set: 0,
            binding,
            descriptor_type,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::ALL,
            name: name.into(),
        }
    }

    pub fn with_stages(mut self, stages: vk::ShaderStageFlags) -> Self {
        self.stage_flags = stages;
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.descriptor_count = count;
        self
    }
}

/// Complete descriptor set layout specification.
///
/// Populated from SPIR-V reflection by the shader subsystem, or built
/// manually for tests.
#[derive(Debug, Clone, Default)]
pub struct DescriptorLayoutSpec {
    pub bindings: Vec<DescriptorBindingSpec>,
    pub max_sets: u32,
}

impl DescriptorLayoutSpec {
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
            max_sets: 1,
        }
    }

    pub fn add_binding(&mut self, binding: DescriptorBindingSpec) {
        self.bindings.push(binding);
    }

    /// Find a binding by its binding index.
    pub fn find_binding(&self, binding: u32) -> Option<&DescriptorBindingSpec> {
        self.bindings.iter().find(|b| b.binding == binding)
    }

    /// Count descriptors of a specific type, for pool sizing.
    pub fn count_descriptor_type(&self, descriptor_type: vk::DescriptorType) -> u32 {
        self.bindings
            .iter()
            .filter(|b| b.descriptor_type == descriptor_type)
            .map(|b| b.descriptor_count)
            .sum()
    }

    /// Per-type descriptor counts across all bindings.
    pub fn descriptor_counts(&self) -> HashMap<vk::DescriptorType, u32> {
        let mut counts = HashMap::new();
        for binding in &self.bindings {
            *counts.entry(binding.descriptor_type).or_insert(0) += binding.descriptor_count;
        }
        counts
    }

    /// Highest binding index, if any bindings exist.
    pub fn max_binding(&self) -> Option<u32> {
        self.bindings.iter().map(|b| b.binding).max()
    }

    /// Convert to Vulkan layout bindings.
    pub fn to_vulkan_bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        self.bindings
            .iter()
            .map(|spec| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(spec.binding)
                    .descriptor_type(spec.descriptor_type)
                    .descriptor_count(spec.descriptor_count)
                    .stage_flags(spec.stage_flags)
            })
            .collect()
    }

    /// Pool sizes covering `max_sets` sets of this layout.
    pub fn to_pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        self.descriptor_counts()
            .into_iter()
            .map(|(ty, count)| vk::DescriptorPoolSize {
                ty,
                descriptor_count: count * self.max_sets.max(1),
            })
            .collect()
    }

    pub fn is_valid(&self) -> bool {
        !self.bindings.is_empty()
    }
}

/// One push-constant range declared by a shader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConstantRange {
    pub name: String,
    pub offset: u32,
    pub size: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

/// A struct member recorded by reflection, for field extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructMember {
    pub name: String,
    pub offset: u32,
    pub size: u32,
}

/// A struct definition recorded by reflection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StructDefinition {
    pub name: String,
    pub size: u32,
    pub members: Vec<StructMember>,
}

/// A vertex input attribute recorded by reflection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexInput {
    pub location: u32,
    pub format: vk::Format,
    pub name: String,
}

/// Reflection record extracted from SPIR-V by the shader subsystem.
#[derive(Debug, Clone, Default)]
pub struct ReflectionData {
    pub bindings: Vec<DescriptorBindingSpec>,
    pub push_constant_ranges: Vec<PushConstantRange>,
    pub vertex_inputs: Vec<VertexInput>,
    pub struct_definitions: Vec<StructDefinition>,
}

/// Shader stage of a compiled SPIR-V module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
    Mesh,
    Task,
    RayGen,
}

impl ShaderStage {
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
            ShaderStage::Mesh => vk::ShaderStageFlags::MESH_EXT,
            ShaderStage::Task => vk::ShaderStageFlags::TASK_EXT,
            ShaderStage::RayGen => vk::ShaderStageFlags::RAYGEN_KHR,
        }
    }
}

/// A compiled-program package: SPIR-V per stage, reflection, descriptor
/// layout and two content hashes.
///
/// The full interface hash covers the whole reflected interface; the
/// descriptor interface hash covers only descriptor bindings and is used
/// for hot-reload decisions and descriptor-set sharing.
#[derive(Debug, Clone, Default)]
pub struct ShaderDataBundle {
    pub name: String,
    pub spirv: HashMap<ShaderStage, Vec<u32>>,
    pub reflection: ReflectionData,
    pub descriptor_layout: Option<DescriptorLayoutSpec>,
    pub interface_hash: u64,
    pub descriptor_interface_hash: u64,
}

impl ShaderDataBundle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_layout(mut self, layout: DescriptorLayoutSpec) -> Self {
        self.descriptor_layout = Some(layout);
        self
    }

    pub fn with_push_constants(mut self, ranges: Vec<PushConstantRange>) -> Self {
        self.reflection.push_constant_ranges = ranges;
        self
    }

    /// Whether two bundles can share descriptor sets.
    pub fn descriptor_compatible(&self, other: &ShaderDataBundle) -> bool {
        self.descriptor_interface_hash == other.descriptor_interface_hash
    }
}
