//! Variadic slot model.
//!
//! A variadic node exposes a bundle of dynamically registered input
//! slots. Slots may be pre-registered tentatively at graph-construction
//! time from generated binding constants, then reconciled against the
//! connected shader bundle during Compile.

use ash::vk;

use crate::graph::{NodeHandle, ResourceHandle};
use crate::node::SlotRole;
use crate::resource::ResourceKind;

/// Binding sentinel for slots created by framework resizing rather
/// than explicit registration. Such slots are skipped everywhere.
pub const UNINITIALIZED_BINDING: u32 = u32::MAX;

/// Lifecycle of a pre-registered variadic slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VariadicSlotState {
    /// Pre-registered from external binding constants; not yet checked
    /// against the shader.
    #[default]
    Tentative,
    /// Confirmed against a shader binding; eligible for gathering.
    Validated,
    /// No matching shader binding; skipped with a warning, never
    /// gathered.
    Invalid,
}

/// Metadata for one variadic input slot.
#[derive(Debug, Clone)]
pub struct VariadicSlotInfo {
    pub resource: Option<ResourceHandle>,
    pub resource_kind: ResourceKind,
    pub slot_name: String,
    /// Shader binding index; [`UNINITIALIZED_BINDING`] when unset.
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub source_node: Option<NodeHandle>,
    pub source_output: u32,
    pub role: SlotRole,
    pub has_field_extraction: bool,
    pub field_offset: u32,
    pub field_size: u32,
    pub state: VariadicSlotState,
}

impl Default for VariadicSlotInfo {
    fn default() -> Self {
        Self {
            resource: None,
            resource_kind: ResourceKind::Opaque,
            slot_name: String::new(),
            binding: UNINITIALIZED_BINDING,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            source_node: None,
            source_output: 0,
            role: SlotRole::DEPENDENCY,
            has_field_extraction: false,
            field_offset: 0,
            field_size: 0,
            state: VariadicSlotState::Tentative,
        }
    }
}

impl VariadicSlotInfo {
    /// A tentative slot created from a binding reference.
    pub fn tentative(binding: u32, descriptor_type: vk::DescriptorType, name: &str) -> Self {
        Self {
            slot_name: name.to_string(),
            binding,
            descriptor_type,
            ..Default::default()
        }
    }

    pub fn is_uninitialized(&self) -> bool {
        self.binding == UNINITIALIZED_BINDING
    }

    pub fn with_role(mut self, role: SlotRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_field_extraction(mut self, offset: u32, size: u32) -> Self {
        self.has_field_extraction = true;
        self.field_offset = offset;
        self.field_size = size;
        self
    }
}

/// Min/max bound on a node's variadic input count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariadicConstraints {
    pub min_inputs: usize,
    pub max_inputs: usize,
}

impl Default for VariadicConstraints {
    fn default() -> Self {
        Self {
            min_inputs: 0,
            max_inputs: usize::MAX,
        }
    }
}

impl VariadicConstraints {
    pub fn exact(count: usize) -> Self {
        Self {
            min_inputs: count,
            max_inputs: count,
        }
    }

    pub fn allows(&self, count: usize) -> bool {
        count >= self.min_inputs && count <= self.max_inputs
    }
}

/// External binding reference supplied by generated constants files.
#[derive(Debug, Clone)]
pub struct BindingRef {
    pub set: u32,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub name: &'static str,
}

impl BindingRef {
    pub const fn new(binding: u32, descriptor_type: vk::DescriptorType, name: &'static str) -> Self {
        Self {
            set: 0,
            binding,
            descriptor_type,
            name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_slot_is_uninitialized() {
        let slot = VariadicSlotInfo::default();
        assert!(slot.is_uninitialized());
        assert_eq!(slot.state, VariadicSlotState::Tentative);
    }

    #[test]
    fn test_tentative_slot() {
        let slot =
            VariadicSlotInfo::tentative(2, vk::DescriptorType::STORAGE_IMAGE, "output_image");
        assert_eq!(slot.binding, 2);
        assert!(!slot.is_uninitialized());
        assert_eq!(slot.slot_name, "output_image");
    }

    #[test]
    fn test_constraints() {
        let constraints = VariadicConstraints::exact(3);
        assert!(constraints.allows(3));
        assert!(!constraints.allows(2));
        assert!(!constraints.allows(4));

        assert!(VariadicConstraints::default().allows(100));
    }
}
