//! # Vantage Graph
//!
//! A Vulkan render graph runtime built around a typed dataflow graph
//! of nodes connected by slots.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`Graph`] - node instances, edges, multi-phase compilation and
//!   per-frame execution
//! - [`Node`] / [`NodeType`] - the node model with typed phase contexts,
//!   parameters and variadic slots
//! - [`Resource`] - typed GPU and host-payload resources with an
//!   injected allocation seam
//! - [`nodes`] - shader-data-driven descriptor orchestration and
//!   multi-dispatch recording
//! - [`timeline`] - budget-aware task queueing, capacity tracking and
//!   prediction-error learning
//! - [`events`] - the pre-allocated publish/subscribe bus driving frame
//!   lifecycle and budget events
//!
//! ## Example
//!
//! ```ignore
//! use vantage_graph::{Graph, NodeTypeRegistry, nodes};
//!
//! let mut registry = NodeTypeRegistry::new();
//! nodes::register_builtin_nodes(&mut registry);
//!
//! let mut graph = Graph::new(registry);
//! let gatherer = graph.add_node("DescriptorResourceGatherer", "gather")?;
//! let sets = graph.add_node("DescriptorSet", "sets")?;
//! graph.connect_nodes(gatherer, 0, sets, 0)?;
//! graph.compile()?;
//! graph.render_frame()?;
//! # Ok::<(), vantage_graph::GraphError>(())
//! ```

pub mod connection;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod graph;
pub mod node;
pub mod nodes;
pub mod resource;
pub mod shader;
pub mod timeline;
pub mod types;

// Re-export main types for convenience.
pub use connection::{ConnectionContext, ConnectionMetadata, ConnectionModifier, GroupKeyModifier};
pub use device::{DeviceCaps, DeviceFeatures, GpuDevice, NullDevice, VulkanDevice};
pub use dispatch::{
    CommandRecorder, DispatchBarrier, DispatchPass, MultiDispatchStats, NullRecorder,
    PushConstantData, RecordedCommand, TraceRecorder, VulkanRecorder,
};
pub use error::{AllocationError, GraphError, GraphResult};
pub use events::{EventCategory, EventMessage, MessageBus, ScopedSubscriptions};
pub use graph::{Graph, GraphEdge, NodeHandle, NodeTypeRegistry, ResourceHandle};
pub use node::{
    AccumulatedInput, BindingRef, CleanupContext, CompileContext, ExecuteContext, FromParameter,
    Node, NodeContext, NodeInstance, NodeState, NodeType, NodeTypeId, ParameterMap,
    ParameterValue, PeerView, PipelineType, SetupContext, SlotIndex, SlotRole, SlotSchema,
    VariadicConstraints, VariadicSlotInfo, VariadicSlotState,
};
pub use resource::{
    Allocator, AtomicBudgetManager, BudgetClass, BudgetManager, DebugCapture, DescriptorHandle,
    GpuAllocator, Resource, ResourceKind, ResourceLifetime,
};
pub use shader::{
    DescriptorBindingSpec, DescriptorLayoutSpec, PushConstantRange, ReflectionData,
    ShaderDataBundle, ShaderStage,
};
pub use timeline::{
    Bottleneck, CapacityTrackerConfig, PredictionErrorTracker, TaskBudget, TaskQueue, TaskSlot,
    TimelineCapacityTracker,
};
pub use types::{
    BufferDescription, Extent3d, ImageDescription, MemoryLocation, ResourceDescription,
    ResourceUsage,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the runtime. Call before using any graph functionality.
pub fn init() {
    log::info!("vantage-graph v{VERSION} initialized");
}
