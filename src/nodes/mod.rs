//! Built-in orchestration nodes.
//!
//! The descriptor pipeline is three cooperating nodes: the gatherer
//! reconciles connected resources with the shader layout, the
//! push-constant gatherer packs inline byte ranges, and the
//! descriptor-set node turns the gathered array into Vulkan objects.
//! The multi-dispatch node records the resulting compute work.

pub mod descriptor_set;
pub mod gatherer;
pub mod multi_dispatch;
pub mod push_constants;

pub use descriptor_set::DescriptorSetNode;
pub use gatherer::{DescriptorResourceGathererNode, GatheredResource};
pub use multi_dispatch::MultiDispatchNode;
pub use push_constants::PushConstantGathererNode;

use crate::graph::NodeTypeRegistry;

/// Register the built-in node types on a registry.
pub fn register_builtin_nodes(registry: &mut NodeTypeRegistry) {
    registry.register(DescriptorResourceGathererNode::node_type());
    registry.register(PushConstantGathererNode::node_type());
    registry.register(DescriptorSetNode::node_type());
    registry.register(MultiDispatchNode::node_type());
}
