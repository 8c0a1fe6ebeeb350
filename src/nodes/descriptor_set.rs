//! Descriptor set creation from gathered resources.
//!
//! Consumes the gathered resource array plus the shader bundle and
//! produces the Vulkan descriptor set layout, pool and allocated sets.
//! The bundle is the authoritative layout source; a layout supplied
//! through the `layout_spec` parameter is an optional fallback for
//! graphs without a bundle connection.

use std::sync::Arc;

use ash::vk;

use crate::device::{DescriptorWrite, DescriptorWriteInfo, GpuDevice};
use crate::error::{GraphError, GraphResult};
use crate::node::{CleanupContext, CompileContext, Node, NodeType, SlotSchema};
use crate::nodes::gatherer::GatheredResource;
use crate::resource::DescriptorHandle;
use crate::shader::{DescriptorLayoutSpec, ShaderDataBundle};

/// Slot indices for the descriptor-set node.
pub mod slots {
    use crate::node::SlotIndex;

    pub const DESCRIPTOR_RESOURCES: SlotIndex = 0;
    pub const SHADER_DATA_BUNDLE: SlotIndex = 1;

    pub const DESCRIPTOR_SET_LAYOUT: SlotIndex = 0;
    pub const DESCRIPTOR_POOL: SlotIndex = 1;
    pub const DESCRIPTOR_SETS: SlotIndex = 2;
}

/// Parameter naming an externally supplied layout spec
/// (`Arc<DescriptorLayoutSpec>` opaque value).
pub const PARAM_LAYOUT_SPEC: &str = "layout_spec";

/// Node producing descriptor set objects.
#[derive(Default)]
pub struct DescriptorSetNode {
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    device: Option<Arc<dyn GpuDevice>>,
}

impl DescriptorSetNode {
    pub fn node_type() -> NodeType {
        NodeType::new("DescriptorSet", |_| Box::new(DescriptorSetNode::default()))
            .with_inputs(vec![
                SlotSchema::required("descriptor_resources"),
                SlotSchema::optional("shader_data_bundle"),
            ])
            .with_outputs(vec![
                SlotSchema::required("descriptor_set_layout"),
                SlotSchema::required("descriptor_pool"),
                SlotSchema::required("descriptor_sets"),
            ])
    }

    pub fn descriptor_sets(&self) -> &[vk::DescriptorSet] {
        &self.sets
    }

    fn resolve_layout(ctx: &CompileContext) -> GraphResult<DescriptorLayoutSpec> {
        // The shader bundle is authoritative.
        if let Some(bundle) = ctx.input_payload::<ShaderDataBundle>(slots::SHADER_DATA_BUNDLE) {
            if let Some(layout) = bundle.descriptor_layout.clone() {
                log::debug!(
                    "{}: using descriptor layout from shader bundle '{}'",
                    ctx.instance_name(),
                    bundle.name
                );
                return Ok(layout);
            }
        }

        // Optional fallback: manually specified layout parameter.
        if let Some(layout) = ctx
            .instance()
            .params
            .get_opaque::<DescriptorLayoutSpec>(PARAM_LAYOUT_SPEC)
        {
            log::debug!(
                "{}: using manually specified descriptor layout",
                ctx.instance_name()
            );
            return Ok((*layout).clone());
        }

        Err(GraphError::MissingLayout(ctx.instance_name().to_string()))
    }

    fn validate_layout(layout: &DescriptorLayoutSpec) -> GraphResult<()> {
        if !layout.is_valid() {
            return Err(GraphError::InvalidParameters(
                "descriptor layout has no bindings".into(),
            ));
        }
        if layout.max_sets == 0 {
            return Err(GraphError::InvalidParameters("max_sets must be > 0".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for binding in &layout.bindings {
            if !seen.insert(binding.binding) {
                return Err(GraphError::Validation(format!(
                    "duplicate descriptor binding {}",
                    binding.binding
                )));
            }
        }
        Ok(())
    }

    /// Write gathered handles into the allocated sets.
    fn write_gathered(
        &self,
        device: &Arc<dyn GpuDevice>,
        layout: &DescriptorLayoutSpec,
        gathered: &[GatheredResource],
    ) {
        let mut writes = Vec::new();
        for (binding_index, entry) in gathered.iter().enumerate() {
            let Some(spec) = layout.find_binding(binding_index as u32) else {
                continue;
            };
            for &set in &self.sets {
                let info = match &entry.handle {
                    DescriptorHandle::Buffer(buffer) => DescriptorWriteInfo::Buffer {
                        buffer: *buffer,
                        offset: 0,
                        range: vk::WHOLE_SIZE,
                    },
                    DescriptorHandle::ImageView(view) => DescriptorWriteInfo::Image {
                        view: *view,
                        sampler: vk::Sampler::null(),
                        layout: vk::ImageLayout::GENERAL,
                    },
                    DescriptorHandle::Sampler(sampler) => DescriptorWriteInfo::Image {
                        view: vk::ImageView::null(),
                        sampler: *sampler,
                        layout: vk::ImageLayout::UNDEFINED,
                    },
                    DescriptorHandle::CombinedImageSampler { view, sampler } => {
                        DescriptorWriteInfo::Image {
                            view: *view,
                            sampler: *sampler,
                            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        }
                    }
                    // Bytes feed push constants; acceleration
                    // structures need their own write extension; both
                    // are skipped here.
                    DescriptorHandle::None
                    | DescriptorHandle::Bytes(_)
                    | DescriptorHandle::AccelerationStructure(_) => continue,
                };
                writes.push(DescriptorWrite {
                    set,
                    binding: binding_index as u32,
                    descriptor_type: spec.descriptor_type,
                    info,
                });
            }
        }

        if !writes.is_empty() {
            device.update_descriptor_sets(&writes);
        }
    }

    fn destroy_objects(&mut self) {
        if let Some(device) = &self.device {
            if self.pool != vk::DescriptorPool::null() {
                device.destroy_descriptor_pool(self.pool);
            }
            if self.layout != vk::DescriptorSetLayout::null() {
                device.destroy_descriptor_set_layout(self.layout);
            }
        }
        self.pool = vk::DescriptorPool::null();
        self.layout = vk::DescriptorSetLayout::null();
        self.sets.clear();
    }
}

impl Node for DescriptorSetNode {
    fn compile(&mut self, ctx: &mut CompileContext) -> GraphResult<()> {
        let layout_spec = Self::resolve_layout(ctx)?;
        Self::validate_layout(&layout_spec)?;

        let device = ctx
            .device()
            .cloned()
            .ok_or_else(|| {
                GraphError::Validation(format!(
                    "node '{}' requires a device",
                    ctx.instance_name()
                ))
            })?;

        // Recompilation replaces previous objects.
        self.destroy_objects();
        self.device = Some(device.clone());

        self.layout = device.create_descriptor_set_layout(&layout_spec)?;
        self.pool = device.create_descriptor_pool(&layout_spec)?;
        self.sets =
            device.allocate_descriptor_sets(self.pool, self.layout, layout_spec.max_sets.max(1))?;

        if let Some(gathered) =
            ctx.input_payload::<Vec<GatheredResource>>(slots::DESCRIPTOR_RESOURCES)
        {
            self.write_gathered(&device, &layout_spec, &gathered);
        }

        ctx.set_output_payload(
            slots::DESCRIPTOR_SET_LAYOUT,
            "VkDescriptorSetLayout",
            self.layout,
        );
        ctx.set_output_payload(slots::DESCRIPTOR_POOL, "VkDescriptorPool", self.pool);
        ctx.set_output_payload(
            slots::DESCRIPTOR_SETS,
            "Vec<VkDescriptorSet>",
            self.sets.clone(),
        );

        log::debug!(
            "{}: allocated {} descriptor sets over {} bindings",
            ctx.instance_name(),
            self.sets.len(),
            layout_spec.bindings.len()
        );
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut CleanupContext) {
        self.destroy_objects();
        self.device = None;
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
