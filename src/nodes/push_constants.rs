//! Push constant gathering.
//!
//! Packs per-source values and struct-field extractions into the byte
//! block the shader's push-constant ranges describe, then emits one
//! stage-tagged buffer per range. Producers publish their source
//! structs as byte resources, typically cast through [`pod_bytes`].

use std::sync::Arc;

use crate::dispatch::PushConstantData;
use crate::error::{GraphError, GraphResult};
use crate::node::{
    CleanupContext, CompileContext, ExecuteContext, Node, NodeContext, NodeType, SlotSchema,
};
use crate::resource::DescriptorHandle;
use crate::shader::ShaderDataBundle;

/// Slot indices for the push-constant gatherer.
pub mod slots {
    use crate::node::SlotIndex;

    pub const SHADER_DATA_BUNDLE: SlotIndex = 0;

    pub const PUSH_CONSTANT_DATA: SlotIndex = 0;
}

/// Byte-cast a plain-old-data struct into a push-constant source,
/// ready for [`DescriptorHandle::Bytes`].
pub fn pod_bytes<T: bytemuck::NoUninit>(value: &T) -> Arc<Vec<u8>> {
    Arc::new(bytemuck::bytes_of(value).to_vec())
}

/// Variadic node packing push-constant bytes.
///
/// Each variadic slot's `binding` is its destination byte offset in
/// the push-constant block. Slots with field extraction copy
/// `field_size` bytes starting at `field_offset` within the producer's
/// struct; others copy the producer's whole byte payload.
#[derive(Default)]
pub struct PushConstantGathererNode {
    packed: Vec<PushConstantData>,
}

impl PushConstantGathererNode {
    pub fn node_type() -> NodeType {
        NodeType::new("PushConstantGatherer", |_| {
            Box::new(PushConstantGathererNode::default())
        })
        .with_inputs(vec![SlotSchema::required("shader_data_bundle")])
        .with_outputs(vec![SlotSchema::required("push_constant_data")])
    }

    fn source_bytes(ctx: &NodeContext, index: usize) -> Option<Arc<Vec<u8>>> {
        let resource = ctx.variadic_resource(index)?;
        if let DescriptorHandle::Bytes(bytes) = resource.descriptor_handle() {
            return Some(bytes);
        }
        resource.payload::<Vec<u8>>()
    }

    fn pack(&mut self, ctx: &NodeContext, bundle: &ShaderDataBundle) -> GraphResult<()> {
        let ranges = &bundle.reflection.push_constant_ranges;
        self.packed.clear();
        if ranges.is_empty() {
            return Ok(());
        }

        let block_size = ranges
            .iter()
            .map(|range| range.offset + range.size)
            .max()
            .unwrap_or(0);

        if let Some(device) = ctx.device() {
            let limit = device.caps().max_push_constants_size;
            if block_size > limit {
                return Err(GraphError::DescriptorLimitExceeded(format!(
                    "push constant block of {block_size} bytes exceeds device limit {limit}"
                )));
            }
        }

        let mut block = vec![0u8; block_size as usize];

        for index in 0..ctx.variadic_count() {
            let Some(slot) = ctx.variadic_slot(index) else {
                continue;
            };
            if slot.is_uninitialized() {
                continue;
            }
            let Some(bytes) = Self::source_bytes(ctx, index) else {
                log::warn!(
                    "{}: push constant slot {index} ({}) has no byte source",
                    ctx.instance_name(),
                    slot.slot_name
                );
                continue;
            };

            let destination = slot.binding as usize;
            let (source_offset, copy_len) = if slot.has_field_extraction {
                (slot.field_offset as usize, slot.field_size as usize)
            } else {
                (0, bytes.len())
            };

            if source_offset + copy_len > bytes.len() {
                return Err(GraphError::InvalidParameters(format!(
                    "field extraction [{source_offset}, {}) outside source struct of {} bytes",
                    source_offset + copy_len,
                    bytes.len()
                )));
            }
            if destination + copy_len > block.len() {
                return Err(GraphError::InvalidParameters(format!(
                    "push constant write [{destination}, {}) outside block of {} bytes",
                    destination + copy_len,
                    block.len()
                )));
            }

            let source: &[u8] =
                bytemuck::cast_slice(&bytes[source_offset..source_offset + copy_len]);
            block[destination..destination + copy_len].copy_from_slice(source);
        }

        self.packed = ranges
            .iter()
            .map(|range| PushConstantData {
                data: block[range.offset as usize..(range.offset + range.size) as usize].to_vec(),
                stage_flags: range.stage_flags,
                offset: range.offset,
            })
            .collect();
        Ok(())
    }
}

impl Node for PushConstantGathererNode {
    fn compile(&mut self, ctx: &mut CompileContext) -> GraphResult<()> {
        let bundle: Arc<ShaderDataBundle> = ctx
            .input_payload(slots::SHADER_DATA_BUNDLE)
            .ok_or_else(|| GraphError::MissingShaderBundle(ctx.instance_name().to_string()))?;

        self.pack(ctx, &bundle)?;
        ctx.set_output_payload(
            slots::PUSH_CONSTANT_DATA,
            "Vec<PushConstantData>",
            self.packed.clone(),
        );
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecuteContext) -> GraphResult<()> {
        // Re-pack every frame; producer values may have changed.
        let Some(bundle) = ctx.input_payload::<ShaderDataBundle>(slots::SHADER_DATA_BUNDLE) else {
            return Ok(());
        };
        self.pack(ctx, &bundle)?;
        ctx.set_output_payload(
            slots::PUSH_CONSTANT_DATA,
            "Vec<PushConstantData>",
            self.packed.clone(),
        );
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut CleanupContext) {
        self.packed.clear();
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
