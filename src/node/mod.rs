//! Node model: types, instances, slots and the multi-phase lifecycle.

mod context;
mod params;
mod variadic;

pub use context::{
    AccumulatedInput, CleanupContext, CompileContext, ExecuteContext, NodeContext, PeerView,
    SetupContext,
};
pub(crate) use context::split_instances;
pub use params::{FromParameter, ParameterMap, ParameterValue};
pub use variadic::{
    BindingRef, VariadicConstraints, VariadicSlotInfo, VariadicSlotState, UNINITIALIZED_BINDING,
};

use std::any::Any;

use bitflags::bitflags;

use crate::device::DeviceFeatures;
use crate::error::GraphResult;
use crate::graph::ResourceHandle;

/// Process-wide unique identifier for a node type.
pub type NodeTypeId = u32;

/// Index into a node's input or output slot array.
pub type SlotIndex = u32;

bitflags! {
    /// Roles a slot participates in. Combinable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SlotRole: u8 {
        /// Static input gathered during Compile.
        const DEPENDENCY = 1 << 0;
        /// Transient per-frame input refreshed during Execute.
        const EXECUTE = 1 << 1;
        /// Participates in debug readback plumbing.
        const DEBUG = 1 << 2;
    }
}

impl Default for SlotRole {
    fn default() -> Self {
        SlotRole::DEPENDENCY
    }
}

/// Pipeline class a node type belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineType {
    Graphics,
    Compute,
    Transfer,
    /// Host-side orchestration only.
    #[default]
    Host,
}

/// Schema for one declared (non-variadic) slot.
#[derive(Debug, Clone)]
pub struct SlotSchema {
    pub name: String,
    /// Unconnected required inputs fail validation.
    pub required: bool,
    pub role: SlotRole,
    /// Accumulation slots collect multiple producer outputs into a
    /// sequence instead of rebinding.
    pub accumulation: bool,
}

impl SlotSchema {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            role: SlotRole::DEPENDENCY,
            accumulation: false,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            role: SlotRole::DEPENDENCY,
            accumulation: false,
        }
    }

    pub fn accumulation(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            role: SlotRole::DEPENDENCY,
            accumulation: true,
        }
    }

    pub fn with_role(mut self, role: SlotRole) -> Self {
        self.role = role;
        self
    }
}

/// Lifecycle state of a node instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    Created,
    Setup,
    GraphCompileSetup,
    Compiled,
    Ready,
    Executing,
    Complete,
    Cleanup,
    /// Terminal state on unrecoverable error.
    Failed,
}

impl NodeState {
    /// Whether moving to `next` is an allowed transition.
    ///
    /// States advance in declaration order; `Cleanup` may be entered
    /// from any non-`Created` state, `Failed` from anywhere, and
    /// `Complete` returns to `Ready` between frames. Recompilation
    /// resets nodes to `Created`.
    pub fn can_transition(self, next: NodeState) -> bool {
        use NodeState::*;
        match (self, next) {
            (_, Failed) => true,
            (Created, Setup) => true,
            (Setup, GraphCompileSetup) => true,
            (GraphCompileSetup, Compiled) => true,
            (Compiled, Ready) => true,
            (Ready, Executing) => true,
            (Executing, Complete) => true,
            (Complete, Ready) => true,
            (state, Cleanup) => state != Created,
            (_, Created) => true,
            _ => false,
        }
    }
}

/// Describes a class of nodes and creates instances of it.
pub struct NodeType {
    pub type_id: NodeTypeId,
    pub type_name: String,
    pub inputs: Vec<SlotSchema>,
    pub outputs: Vec<SlotSchema>,
    pub pipeline_type: PipelineType,
    pub required_features: DeviceFeatures,
    /// Maximum concurrent instances; zero means unlimited.
    pub max_instances: u32,
    factory: Box<dyn Fn(&str) -> Box<dyn Node> + Send + Sync>,
}

impl std::fmt::Debug for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeType")
            .field("type_id", &self.type_id)
            .field("type_name", &self.type_name)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

impl NodeType {
    pub fn new(
        type_name: impl Into<String>,
        factory: impl Fn(&str) -> Box<dyn Node> + Send + Sync + 'static,
    ) -> Self {
        Self {
            type_id: 0,
            type_name: type_name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            pipeline_type: PipelineType::Host,
            required_features: DeviceFeatures::empty(),
            max_instances: 0,
            factory: Box::new(factory),
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<SlotSchema>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<SlotSchema>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_pipeline_type(mut self, pipeline_type: PipelineType) -> Self {
        self.pipeline_type = pipeline_type;
        self
    }

    pub fn with_required_features(mut self, features: DeviceFeatures) -> Self {
        self.required_features = features;
        self
    }

    pub fn with_max_instances(mut self, max_instances: u32) -> Self {
        self.max_instances = max_instances;
        self
    }

    pub fn create_instance(&self, instance_name: &str) -> Box<dyn Node> {
        (self.factory)(instance_name)
    }

    pub fn input_count(&self) -> u32 {
        self.inputs.len() as u32
    }

    pub fn output_count(&self) -> u32 {
        self.outputs.len() as u32
    }
}

/// Behavior of a node across its lifecycle phases.
///
/// Setup runs once per graph compilation, Compile builds static
/// artifacts (pipelines, descriptor sets), Execute runs per frame, and
/// Cleanup runs on graph teardown or node removal.
pub trait Node: Any {
    fn setup(&mut self, _ctx: &mut SetupContext) -> GraphResult<()> {
        Ok(())
    }

    fn compile(&mut self, _ctx: &mut CompileContext) -> GraphResult<()> {
        Ok(())
    }

    fn execute(&mut self, _ctx: &mut ExecuteContext) -> GraphResult<()> {
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut CleanupContext) {}

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// One connected (non-variadic) input slot.
#[derive(Debug, Clone, Default)]
pub struct InputSlot {
    pub resource: Option<ResourceHandle>,
    /// Populated instead of `resource` for accumulation slots.
    pub accumulated: Vec<AccumulatedInput>,
}

/// Live bookkeeping for a node instance.
#[derive(Debug)]
pub struct NodeInstance {
    pub name: String,
    pub type_id: NodeTypeId,
    pub type_name: String,
    pub device_index: u32,
    pub state: NodeState,
    pub params: ParameterMap,
    pub dependencies: Vec<crate::graph::NodeHandle>,
    pub inputs: Vec<InputSlot>,
    pub outputs: Vec<Option<ResourceHandle>>,
    pub variadic_slots: Vec<VariadicSlotInfo>,
    pub variadic_constraints: VariadicConstraints,
    pub execution_order: u32,
    /// Diagnostic recorded when the node fails.
    pub diagnostic: Option<String>,
    log_name: String,
}

impl NodeInstance {
    pub fn new(name: &str, node_type: &NodeType, device_index: u32) -> Self {
        Self {
            name: name.to_string(),
            type_id: node_type.type_id,
            type_name: node_type.type_name.clone(),
            device_index,
            state: NodeState::Created,
            params: ParameterMap::new(),
            dependencies: Vec::new(),
            inputs: vec![InputSlot::default(); node_type.inputs.len()],
            outputs: vec![None; node_type.outputs.len()],
            variadic_slots: Vec::new(),
            variadic_constraints: VariadicConstraints::default(),
            execution_order: 0,
            diagnostic: None,
            log_name: format!("{}({})", node_type.type_name, name),
        }
    }

    pub fn log_name(&self) -> &str {
        &self.log_name
    }

    /// Transition state, enforcing the lifecycle machine.
    pub fn set_state(&mut self, next: NodeState) -> bool {
        if self.state.can_transition(next) {
            self.state = next;
            true
        } else {
            log::warn!(
                "{}: illegal state transition {:?} -> {:?}",
                self.log_name,
                self.state,
                next
            );
            false
        }
    }

    pub fn mark_failed(&mut self, diagnostic: impl Into<String>) {
        let diagnostic = diagnostic.into();
        log::error!("{}: {}", self.log_name, diagnostic);
        self.diagnostic = Some(diagnostic);
        self.state = NodeState::Failed;
    }

    /// Register a variadic slot, returning its index in the bundle.
    pub fn register_variadic_slot(&mut self, slot: VariadicSlotInfo) -> usize {
        self.variadic_slots.push(slot);
        self.variadic_slots.len() - 1
    }

    pub fn set_variadic_constraints(&mut self, min_inputs: usize, max_inputs: usize) {
        self.variadic_constraints = VariadicConstraints {
            min_inputs,
            max_inputs,
        };
    }

    /// Typed parameter read with default fallback.
    pub fn get_parameter_value<T: FromParameter>(&self, name: &str, default: T) -> T {
        self.params.get_value(name, default)
    }
}
