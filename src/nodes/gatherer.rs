//! Shader-driven descriptor resource gathering.
//!
//! Reconciles what the shader demands (the bundle's descriptor layout)
//! with what the graph connected (the variadic slot bundle), then
//! gathers descriptor handles into a binding-indexed array for the
//! descriptor-set node.

use std::sync::Arc;

use ash::vk;

use crate::error::{GraphError, GraphResult};
use crate::node::{
    CleanupContext, CompileContext, ExecuteContext, Node, NodeType, SetupContext, SlotRole,
    SlotSchema, VariadicSlotState,
};
use crate::resource::{DebugCapture, DescriptorHandle, Resource, ResourceKind};
use crate::shader::ShaderDataBundle;
use crate::types::ResourceUsage;

/// Slot indices for the gatherer node.
pub mod slots {
    use crate::node::SlotIndex;

    pub const SHADER_DATA_BUNDLE: SlotIndex = 0;

    pub const DESCRIPTOR_RESOURCES: SlotIndex = 0;
    pub const SHADER_DATA_BUNDLE_OUT: SlotIndex = 1;
    pub const DEBUG_CAPTURE: SlotIndex = 2;
}

/// One gathered descriptor entry, indexed by shader binding.
#[derive(Clone, Default)]
pub struct GatheredResource {
    pub handle: DescriptorHandle,
    pub role: SlotRole,
    pub debug_capture: Option<Arc<dyn DebugCapture>>,
}

impl std::fmt::Debug for GatheredResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatheredResource")
            .field("handle", &self.handle)
            .field("role", &self.role)
            .field("has_debug_capture", &self.debug_capture.is_some())
            .finish()
    }
}

/// Variadic node gathering descriptor resources against a shader
/// bundle.
#[derive(Default)]
pub struct DescriptorResourceGathererNode {
    resource_array: Vec<GatheredResource>,
}

impl DescriptorResourceGathererNode {
    pub fn node_type() -> NodeType {
        NodeType::new("DescriptorResourceGatherer", |_| {
            Box::new(DescriptorResourceGathererNode::default())
        })
        .with_inputs(vec![SlotSchema::required("shader_data_bundle")])
        .with_outputs(vec![
            SlotSchema::required("descriptor_resources"),
            SlotSchema::required("shader_data_bundle_out"),
            SlotSchema::optional("debug_capture"),
        ])
    }

    fn validate_device_limits(
        ctx: &CompileContext,
        bundle: &ShaderDataBundle,
    ) -> GraphResult<()> {
        let Some(device) = ctx.device() else {
            return Ok(());
        };
        let Some(layout) = bundle.descriptor_layout.as_ref() else {
            return Ok(());
        };

        let caps = device.caps();
        for (descriptor_type, count) in layout.descriptor_counts() {
            let Some(limit) = caps.per_stage_limit(descriptor_type) else {
                continue;
            };
            if count > limit {
                return Err(GraphError::DescriptorLimitExceeded(format!(
                    "{descriptor_type:?} count {count} exceeds device limit {limit}"
                )));
            }
            let usage_percent = count as f32 / limit as f32 * 100.0;
            log::info!(
                "{}: {descriptor_type:?} usage {count}/{limit} ({usage_percent:.0}%, {} remaining)",
                ctx.instance_name(),
                limit - count
            );
        }
        Ok(())
    }

    /// Reconcile pre-registered tentative slots against the shader's
    /// bindings. The shader is authoritative for descriptor types.
    fn validate_tentative_slots(ctx: &mut CompileContext, bundle: &ShaderDataBundle) {
        let Some(layout) = bundle.descriptor_layout.as_ref() else {
            return;
        };

        for index in 0..ctx.variadic_count() {
            let Some(slot) = ctx.variadic_slot(index) else {
                continue;
            };
            if slot.is_uninitialized() || slot.state != VariadicSlotState::Tentative {
                continue;
            }

            let mut updated = slot.clone();
            match layout.find_binding(slot.binding) {
                Some(shader_binding) => {
                    if shader_binding.descriptor_type != updated.descriptor_type {
                        log::debug!(
                            "{}: slot {index} (binding {}) descriptor type {:?} -> {:?} from shader",
                            ctx.instance_name(),
                            updated.binding,
                            updated.descriptor_type,
                            shader_binding.descriptor_type
                        );
                        updated.descriptor_type = shader_binding.descriptor_type;
                    }
                    updated.state = VariadicSlotState::Validated;
                }
                None => {
                    log::warn!(
                        "{}: slot {index} (binding {}) has no matching shader binding",
                        ctx.instance_name(),
                        updated.binding
                    );
                    updated.state = VariadicSlotState::Invalid;
                }
            }
            ctx.update_variadic_slot(index, updated);
        }
    }

    /// Base validation: resource presence and type compatibility for
    /// every slot that will be gathered.
    fn validate_variadic_inputs(ctx: &CompileContext) -> GraphResult<()> {
        for index in 0..ctx.variadic_count() {
            let Some(slot) = ctx.variadic_slot(index) else {
                continue;
            };
            if slot.is_uninitialized() || slot.state == VariadicSlotState::Invalid {
                continue;
            }
            // Execute-role slots are refreshed per frame; field
            // extractions are resolved downstream.
            if slot.role.contains(SlotRole::EXECUTE) || slot.has_field_extraction {
                continue;
            }

            let resource = ctx.variadic_resource(index);
            if resource.is_none() && slot.slot_name.is_empty() {
                // Placeholder from incomplete wiring; skipped, not fatal.
                continue;
            }

            let Some(resource) = resource else {
                return Err(GraphError::Validation(format!(
                    "slot {index} (binding {}) on '{}' has no resource",
                    slot.binding,
                    ctx.instance_name()
                )));
            };

            if !resource_compatible_with_descriptor(resource, slot.descriptor_type) {
                return Err(GraphError::Validation(format!(
                    "slot {index} ({}) binding {} incompatible with {:?}",
                    slot.slot_name, slot.binding, slot.descriptor_type
                )));
            }
        }
        Ok(())
    }

    fn gather(&mut self, ctx: &CompileContext) {
        for index in 0..ctx.variadic_count() {
            let Some(slot) = ctx.variadic_slot(index) else {
                continue;
            };
            if slot.is_uninitialized() || slot.state == VariadicSlotState::Invalid {
                continue;
            }
            let binding = slot.binding as usize;
            if binding >= self.resource_array.len() {
                continue;
            }
            self.resource_array[binding].role = slot.role;

            // Execute-only slots get a placeholder; their handle is
            // gathered per frame.
            if !slot.role.contains(SlotRole::DEPENDENCY) {
                self.resource_array[binding].handle = DescriptorHandle::None;
                continue;
            }

            let Some(resource) = ctx.variadic_resource(index) else {
                log::warn!(
                    "{}: validated slot {index} (binding {}) has no resource",
                    ctx.instance_name(),
                    slot.binding
                );
                continue;
            };

            self.resource_array[binding].handle = resource.descriptor_handle();

            if slot.role.contains(SlotRole::DEBUG) {
                match resource.debug_capture() {
                    Some(capture) => {
                        log::debug!(
                            "{}: attached debug capture '{}' to binding {}",
                            ctx.instance_name(),
                            capture.debug_name(),
                            slot.binding
                        );
                        self.resource_array[binding].debug_capture = Some(capture);
                    }
                    None => log::warn!(
                        "{}: debug-flagged slot {index} has no capture capability",
                        ctx.instance_name()
                    ),
                }
            }
        }
    }

    fn first_debug_capture(&self) -> Option<Arc<dyn DebugCapture>> {
        self.resource_array
            .iter()
            .find_map(|entry| entry.debug_capture.clone())
    }

    fn emit_outputs(&self, ctx: &mut CompileContext, bundle: &Arc<ShaderDataBundle>) {
        ctx.set_output_payload(
            slots::DESCRIPTOR_RESOURCES,
            "Vec<GatheredResource>",
            self.resource_array.clone(),
        );
        ctx.set_output_payload(
            slots::SHADER_DATA_BUNDLE_OUT,
            "ShaderDataBundle",
            (**bundle).clone(),
        );
        ctx.set_output_payload(
            slots::DEBUG_CAPTURE,
            "Option<DebugCapture>",
            self.first_debug_capture(),
        );
    }
}

impl Node for DescriptorResourceGathererNode {
    fn setup(&mut self, ctx: &mut SetupContext) -> GraphResult<()> {
        // Node initialization only; connected inputs may not be read.
        log::debug!("{}: setup", ctx.instance_name());
        Ok(())
    }

    fn compile(&mut self, ctx: &mut CompileContext) -> GraphResult<()> {
        let bundle: Arc<ShaderDataBundle> = ctx
            .input_payload(slots::SHADER_DATA_BUNDLE)
            .ok_or_else(|| GraphError::MissingShaderBundle(ctx.instance_name().to_string()))?;
        let layout = bundle
            .descriptor_layout
            .as_ref()
            .ok_or_else(|| GraphError::MissingLayout(ctx.instance_name().to_string()))?;

        log::debug!(
            "{}: shader expects {} descriptor bindings",
            ctx.instance_name(),
            layout.bindings.len()
        );

        Self::validate_device_limits(ctx, &bundle)?;
        Self::validate_tentative_slots(ctx, &bundle);
        Self::validate_variadic_inputs(ctx)?;

        // Size the output array to the highest binding and gather.
        let array_len = layout.max_binding().map(|b| b as usize + 1).unwrap_or(0);
        self.resource_array = vec![GatheredResource::default(); array_len];
        self.gather(ctx);

        self.emit_outputs(ctx, &bundle);
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecuteContext) -> GraphResult<()> {
        // Refresh transient (Execute-role) slots from their producer's
        // current output; Dependency-only slots were gathered during
        // Compile.
        let mut has_transients = false;

        for index in 0..ctx.variadic_count() {
            let Some(slot) = ctx.variadic_slot(index).cloned() else {
                continue;
            };
            if slot.is_uninitialized() || !slot.role.contains(SlotRole::EXECUTE) {
                continue;
            }
            has_transients = true;

            let Some(source) = slot.source_node else {
                log::warn!(
                    "{}: transient slot {index} has no source node",
                    ctx.instance_name()
                );
                continue;
            };
            let Some(fresh) = ctx
                .peers()
                .output_of(source, slot.source_output)
                .and_then(|handle| ctx.resource(handle))
            else {
                log::warn!(
                    "{}: transient slot {index} source output is unset",
                    ctx.instance_name()
                );
                continue;
            };

            let binding = slot.binding as usize;
            if binding >= self.resource_array.len() {
                log::error!(
                    "{}: binding {} out of range (array len {})",
                    ctx.instance_name(),
                    binding,
                    self.resource_array.len()
                );
                continue;
            }
            self.resource_array[binding].handle = fresh.descriptor_handle();
        }

        if has_transients {
            ctx.set_output_payload(
                slots::DESCRIPTOR_RESOURCES,
                "Vec<GatheredResource>",
                self.resource_array.clone(),
            );
        }

        // Debug capture is re-emitted every frame so downstream
        // readback nodes run once per frame.
        let capture = self.first_debug_capture();
        ctx.set_output_payload(slots::DEBUG_CAPTURE, "Option<DebugCapture>", capture);
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut CleanupContext) {
        self.resource_array.clear();
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Compatibility of a connected resource with the descriptor type the
/// shader expects at its binding.
pub fn resource_compatible_with_descriptor(
    resource: &Resource,
    descriptor_type: vk::DescriptorType,
) -> bool {
    match resource.usage() {
        Some(usage) => usage_compatible(usage, resource.kind(), descriptor_type),
        // HandleDescriptor resources carry no usage flags; fall back to
        // kind-based compatibility.
        None => kind_compatible(resource.kind(), descriptor_type),
    }
}

fn usage_compatible(
    usage: ResourceUsage,
    kind: ResourceKind,
    descriptor_type: vk::DescriptorType,
) -> bool {
    match descriptor_type {
        vk::DescriptorType::UNIFORM_BUFFER => usage.contains(ResourceUsage::UNIFORM_BUFFER),
        vk::DescriptorType::STORAGE_BUFFER => usage.contains(ResourceUsage::STORAGE_BUFFER),
        vk::DescriptorType::STORAGE_IMAGE => {
            usage.contains(ResourceUsage::STORAGE)
                && matches!(kind, ResourceKind::Image | ResourceKind::StorageImage)
        }
        vk::DescriptorType::SAMPLED_IMAGE | vk::DescriptorType::COMBINED_IMAGE_SAMPLER => {
            usage.contains(ResourceUsage::SAMPLED)
                && matches!(kind, ResourceKind::Image | ResourceKind::Image3d)
        }
        // VkSampler travels as a Buffer-kind opaque handle.
        vk::DescriptorType::SAMPLER => kind == ResourceKind::Buffer,
        vk::DescriptorType::ACCELERATION_STRUCTURE_KHR => {
            kind == ResourceKind::AccelerationStructure
        }
        _ => {
            log::error!("unhandled descriptor type {descriptor_type:?} for kind {kind:?}");
            false
        }
    }
}

fn kind_compatible(kind: ResourceKind, descriptor_type: vk::DescriptorType) -> bool {
    match descriptor_type {
        vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::STORAGE_BUFFER => {
            kind == ResourceKind::Buffer
        }
        vk::DescriptorType::STORAGE_IMAGE | vk::DescriptorType::SAMPLED_IMAGE => matches!(
            kind,
            ResourceKind::Image | ResourceKind::StorageImage | ResourceKind::Image3d
        ),
        // Combined samplers accept both the image view and the
        // sampler-as-buffer halves.
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER => matches!(
            kind,
            ResourceKind::Image
                | ResourceKind::StorageImage
                | ResourceKind::Image3d
                | ResourceKind::Buffer
        ),
        vk::DescriptorType::SAMPLER => kind == ResourceKind::Buffer,
        vk::DescriptorType::ACCELERATION_STRUCTURE_KHR => {
            kind == ResourceKind::AccelerationStructure
        }
        _ => {
            log::error!("unhandled descriptor type {descriptor_type:?} for kind {kind:?}");
            false
        }
    }
}
