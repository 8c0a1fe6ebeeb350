//! Graph model: handles, topology, compilation phases and execution.

mod arena;
mod registry;

pub use arena::{ResourceArena, ResourceHandle};
pub use registry::NodeTypeRegistry;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::{ConnectionContext, ConnectionMetadata, ConnectionModifier};
use crate::device::GpuDevice;
use crate::dispatch::{CommandRecorder, NullRecorder};
use crate::error::{GraphError, GraphResult};
use crate::events::{EventMessage, MessageBus};
use crate::node::{
    split_instances, AccumulatedInput, CleanupContext, CompileContext, ExecuteContext, Node,
    NodeContext, NodeInstance, NodeState, NodeTypeId, ParameterValue, SetupContext, SlotIndex,
    SlotRole, VariadicSlotInfo,
};
use crate::resource::{Allocator, Resource, ResourceLifetime};
use crate::timeline::TimelineCapacityTracker;

/// Dense index identifying a node instance.
///
/// Valid until the next `remove_node`, which shifts indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle(u32);

impl NodeHandle {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A directed connection between a producer output and consumer input.
#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub source: NodeHandle,
    pub source_output: SlotIndex,
    pub target: NodeHandle,
    pub target_input: SlotIndex,
    pub array_index: Option<u32>,
    /// Set during device-affinity propagation when the edge crosses
    /// devices; transfer-node insertion is the caller's responsibility.
    pub needs_transfer: bool,
    pub metadata: Arc<ConnectionMetadata>,
}

enum Phase {
    Setup,
    Compile,
    Execute,
    Cleanup,
}

/// The render graph: node instances, edges, resources and the compiled
/// execution order.
pub struct Graph {
    registry: NodeTypeRegistry,
    nodes: Vec<Option<Box<dyn Node>>>,
    instances: Vec<NodeInstance>,
    name_to_handle: HashMap<String, NodeHandle>,
    instances_by_type: HashMap<NodeTypeId, Vec<NodeHandle>>,
    edges: Vec<GraphEdge>,
    resources: ResourceArena,
    execution_order: Vec<usize>,
    devices: Vec<Arc<dyn GpuDevice>>,
    allocator: Option<Arc<dyn Allocator>>,
    bus: Option<Arc<MessageBus>>,
    capacity_tracker: Option<Arc<Mutex<TimelineCapacityTracker>>>,
    compiled: bool,
    frame_number: u64,
}

impl Graph {
    /// Create a graph around an injected node type registry.
    pub fn new(registry: NodeTypeRegistry) -> Self {
        Self {
            registry,
            nodes: Vec::new(),
            instances: Vec::new(),
            name_to_handle: HashMap::new(),
            instances_by_type: HashMap::new(),
            edges: Vec::new(),
            resources: ResourceArena::new(),
            execution_order: Vec::new(),
            devices: Vec::new(),
            allocator: None,
            bus: None,
            capacity_tracker: None,
            compiled: false,
            frame_number: 0,
        }
    }

    pub fn registry(&self) -> &NodeTypeRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut NodeTypeRegistry {
        &mut self.registry
    }

    /// Attach a device; returns its index for node affinity.
    pub fn add_device(&mut self, device: Arc<dyn GpuDevice>) -> u32 {
        self.devices.push(device);
        (self.devices.len() - 1) as u32
    }

    pub fn device(&self, index: u32) -> Option<&Arc<dyn GpuDevice>> {
        self.devices.get(index as usize)
    }

    pub fn set_allocator(&mut self, allocator: Arc<dyn Allocator>) {
        self.allocator = Some(allocator);
    }

    pub fn set_message_bus(&mut self, bus: Arc<MessageBus>) {
        self.bus = Some(bus);
    }

    pub fn message_bus(&self) -> Option<&Arc<MessageBus>> {
        self.bus.as_ref()
    }

    /// Link a capacity tracker; frame-end events then carry measured
    /// utilization.
    pub fn set_capacity_tracker(&mut self, tracker: Arc<Mutex<TimelineCapacityTracker>>) {
        self.capacity_tracker = Some(tracker);
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    pub fn node_count(&self) -> usize {
        self.instances.len()
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn resources(&self) -> &ResourceArena {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceArena {
        &mut self.resources
    }

    // ==================================================================
    // Construction
    // ==================================================================

    /// Add a node instance by type name on the primary device.
    pub fn add_node(&mut self, type_name: &str, instance_name: &str) -> GraphResult<NodeHandle> {
        self.add_node_on_device(type_name, instance_name, 0)
    }

    /// Add a node instance by type id.
    pub fn add_node_by_id(
        &mut self,
        type_id: NodeTypeId,
        instance_name: &str,
    ) -> GraphResult<NodeHandle> {
        let type_name = self
            .registry
            .get(type_id)
            .map(|t| t.type_name.clone())
            .ok_or_else(|| GraphError::UnknownNodeType(format!("id {type_id}")))?;
        self.add_node_on_device(&type_name, instance_name, 0)
    }

    /// Add a node instance pinned to a device.
    pub fn add_node_on_device(
        &mut self,
        type_name: &str,
        instance_name: &str,
        device_index: u32,
    ) -> GraphResult<NodeHandle> {
        if self.name_to_handle.contains_key(instance_name) {
            return Err(GraphError::DuplicateInstanceName(instance_name.to_string()));
        }

        let node_type = self
            .registry
            .get_by_name(type_name)
            .ok_or_else(|| GraphError::UnknownNodeType(type_name.to_string()))?;

        let type_id = node_type.type_id;
        if node_type.max_instances > 0 {
            let current = self
                .instances_by_type
                .get(&type_id)
                .map(Vec::len)
                .unwrap_or(0) as u32;
            if current >= node_type.max_instances {
                return Err(GraphError::MaxInstancesReached(type_name.to_string()));
            }
        }

        if !self.devices.is_empty() && device_index as usize >= self.devices.len() {
            return Err(GraphError::InstanceCreationFailed(format!(
                "device index {device_index} out of range for '{instance_name}'"
            )));
        }

        let node = node_type.create_instance(instance_name);
        let instance = NodeInstance::new(instance_name, node_type, device_index);

        let handle = NodeHandle::new(self.instances.len() as u32);
        self.nodes.push(Some(node));
        self.instances.push(instance);
        self.name_to_handle
            .insert(instance_name.to_string(), handle);
        self.instances_by_type
            .entry(type_id)
            .or_default()
            .push(handle);

        self.compiled = false;
        log::debug!("added node '{instance_name}' of type '{type_name}'");
        Ok(handle)
    }

    /// Connect a producer output to a consumer input.
    pub fn connect_nodes(
        &mut self,
        from: NodeHandle,
        output_index: SlotIndex,
        to: NodeHandle,
        input_index: SlotIndex,
    ) -> GraphResult<()> {
        self.connect_nodes_full(from, output_index, to, input_index, None, Vec::new())
    }

    /// Connect with an array index into the target slot.
    pub fn connect_nodes_indexed(
        &mut self,
        from: NodeHandle,
        output_index: SlotIndex,
        to: NodeHandle,
        input_index: SlotIndex,
        array_index: u32,
    ) -> GraphResult<()> {
        self.connect_nodes_full(
            from,
            output_index,
            to,
            input_index,
            Some(array_index),
            Vec::new(),
        )
    }

    /// Connect with modifiers attached to the edge.
    pub fn connect_nodes_with(
        &mut self,
        from: NodeHandle,
        output_index: SlotIndex,
        to: NodeHandle,
        input_index: SlotIndex,
        modifiers: Vec<Box<dyn ConnectionModifier>>,
    ) -> GraphResult<()> {
        self.connect_nodes_full(from, output_index, to, input_index, None, modifiers)
    }

    fn connect_nodes_full(
        &mut self,
        from: NodeHandle,
        output_index: SlotIndex,
        to: NodeHandle,
        input_index: SlotIndex,
        array_index: Option<u32>,
        mut modifiers: Vec<Box<dyn ConnectionModifier>>,
    ) -> GraphResult<()> {
        if from.index() >= self.instances.len() || to.index() >= self.instances.len() {
            return Err(GraphError::InvalidNodeHandle);
        }

        let source_type_id = self.instances[from.index()].type_id;
        let target_type_id = self.instances[to.index()].type_id;
        let source_type = self
            .registry
            .get(source_type_id)
            .ok_or(GraphError::InvalidNodeHandle)?;
        let target_type = self
            .registry
            .get(target_type_id)
            .ok_or(GraphError::InvalidNodeHandle)?;

        if output_index >= source_type.output_count() {
            return Err(GraphError::InvalidSlotIndex {
                node: self.instances[from.index()].name.clone(),
                index: output_index,
            });
        }
        if input_index >= target_type.input_count() {
            return Err(GraphError::InvalidSlotIndex {
                node: self.instances[to.index()].name.clone(),
                index: input_index,
            });
        }

        let target_slot = target_type.inputs[input_index as usize].clone();

        // Run modifiers in descending priority through their hooks.
        let mut metadata = ConnectionMetadata::default();
        modifiers.sort_by(|a, b| b.priority().cmp(&a.priority()));
        for hook in 0..2 {
            for modifier in &modifiers {
                let mut ctx = ConnectionContext {
                    source_node_name: &self.instances[from.index()].name,
                    source_output: output_index,
                    target_node_name: &self.instances[to.index()].name,
                    target_input: input_index,
                    target_slot: &target_slot,
                    metadata: &mut metadata,
                };
                let result = if hook == 0 {
                    modifier.pre_validation(&mut ctx)
                } else {
                    modifier.pre_resolve(&mut ctx)
                };
                result.map_err(GraphError::Validation)?;
            }
        }

        // Create (or reuse) the producer's output resource.
        let resource_handle = match self.instances[from.index()].outputs[output_index as usize] {
            Some(handle) => handle,
            None => {
                let handle = self.resources.insert(Resource::opaque(
                    &source_type.outputs[output_index as usize].name,
                    (),
                ));
                self.instances[from.index()].outputs[output_index as usize] = Some(handle);
                handle
            }
        };

        let metadata = Arc::new(metadata);

        // Attach to the consumer.
        {
            let input = &mut self.instances[to.index()].inputs[input_index as usize];
            if target_slot.accumulation || array_index.is_some() {
                input.accumulated.push(AccumulatedInput {
                    resource: resource_handle,
                    source_node: from,
                    source_output: output_index,
                    metadata: metadata.clone(),
                });
            } else if let Some(existing) = input.resource {
                if existing != resource_handle {
                    return Err(GraphError::ConnectionTypeMismatch(format!(
                        "input {} of '{}' is already connected to another producer",
                        input_index,
                        self.instances[to.index()].name
                    )));
                }
            } else {
                input.resource = Some(resource_handle);
            }
        }

        // Record the dependency.
        let target_instance = &mut self.instances[to.index()];
        if !target_instance.dependencies.contains(&from) {
            target_instance.dependencies.push(from);
        }

        let edge = GraphEdge {
            source: from,
            source_output: output_index,
            target: to,
            target_input: input_index,
            array_index,
            needs_transfer: false,
            metadata: metadata.clone(),
        };

        // Post-resolve hooks run after binding.
        for modifier in &modifiers {
            let mut metadata_after = (*metadata).clone();
            let mut ctx = ConnectionContext {
                source_node_name: &self.instances[from.index()].name,
                source_output: output_index,
                target_node_name: &self.instances[to.index()].name,
                target_input: input_index,
                target_slot: &target_slot,
                metadata: &mut metadata_after,
            };
            modifier.post_resolve(&mut ctx).map_err(GraphError::Validation)?;
        }

        self.edges.push(edge);
        self.compiled = false;
        Ok(())
    }

    /// Connect a producer output into a consumer's variadic bundle at a
    /// shader binding.
    pub fn connect_variadic(
        &mut self,
        from: NodeHandle,
        output_index: SlotIndex,
        to: NodeHandle,
        binding: u32,
        role: SlotRole,
    ) -> GraphResult<()> {
        if from.index() >= self.instances.len() || to.index() >= self.instances.len() {
            return Err(GraphError::InvalidNodeHandle);
        }
        let source_type_id = self.instances[from.index()].type_id;
        let source_type = self
            .registry
            .get(source_type_id)
            .ok_or(GraphError::InvalidNodeHandle)?;
        if output_index >= source_type.output_count() {
            return Err(GraphError::InvalidSlotIndex {
                node: self.instances[from.index()].name.clone(),
                index: output_index,
            });
        }

        let resource_handle = match self.instances[from.index()].outputs[output_index as usize] {
            Some(handle) => handle,
            None => {
                let handle = self.resources.insert(Resource::opaque(
                    &source_type.outputs[output_index as usize].name,
                    (),
                ));
                self.instances[from.index()].outputs[output_index as usize] = Some(handle);
                handle
            }
        };

        let target = &mut self.instances[to.index()];

        // Bind into a pre-registered tentative slot with this binding,
        // or register a fresh slot.
        let slot_index = target
            .variadic_slots
            .iter()
            .position(|slot| slot.binding == binding);
        match slot_index {
            Some(index) => {
                let slot = &mut target.variadic_slots[index];
                slot.resource = Some(resource_handle);
                slot.source_node = Some(from);
                slot.source_output = output_index;
                slot.role = role;
            }
            None => {
                let count = target.variadic_slots.len();
                if !target.variadic_constraints.allows(count + 1) {
                    return Err(GraphError::Validation(format!(
                        "variadic input count {} exceeds maximum {} on '{}'",
                        count + 1,
                        target.variadic_constraints.max_inputs,
                        target.name
                    )));
                }
                let mut slot = VariadicSlotInfo::default();
                slot.binding = binding;
                slot.resource = Some(resource_handle);
                slot.source_node = Some(from);
                slot.source_output = output_index;
                slot.role = role;
                target.variadic_slots.push(slot);
            }
        }

        if !target.dependencies.contains(&from) {
            target.dependencies.push(from);
        }

        self.edges.push(GraphEdge {
            source: from,
            source_output: output_index,
            target: to,
            target_input: u32::MAX,
            array_index: Some(binding),
            needs_transfer: false,
            metadata: Arc::new(ConnectionMetadata::default()),
        });
        self.compiled = false;
        Ok(())
    }

    /// Pre-register tentative variadic slots from generated binding
    /// references, tightening the variadic constraints to their count.
    pub fn pre_register_variadic_slots(
        &mut self,
        handle: NodeHandle,
        bindings: &[crate::node::BindingRef],
    ) -> GraphResult<()> {
        let instance = self
            .instances
            .get_mut(handle.index())
            .ok_or(GraphError::InvalidNodeHandle)?;
        for binding in bindings {
            instance.register_variadic_slot(VariadicSlotInfo::tentative(
                binding.binding,
                binding.descriptor_type,
                binding.name,
            ));
            log::debug!(
                "{}: pre-registered tentative slot '{}' at binding {}",
                instance.log_name(),
                binding.name,
                binding.binding
            );
        }
        let count = instance.variadic_slots.len();
        instance.set_variadic_constraints(count, count);
        Ok(())
    }

    /// Remove a node. Handles into the dense array are invalidated.
    pub fn remove_node(&mut self, handle: NodeHandle) -> GraphResult<()> {
        let index = handle.index();
        if index >= self.instances.len() {
            return Err(GraphError::InvalidNodeHandle);
        }

        // Give the node its cleanup phase before it disappears.
        if self.instances[index].state != NodeState::Created {
            self.instances[index].set_state(NodeState::Cleanup);
            let _ = self.run_phase(index, Phase::Cleanup, None);
        }

        let instance = self.instances.remove(index);
        self.nodes.remove(index);
        self.name_to_handle.remove(&instance.name);

        // Drop edges touching the node; shift handles above it.
        self.edges.retain(|edge| {
            edge.source.index() != index && edge.target.index() != index
        });
        let shift = |handle: NodeHandle| {
            if handle.index() > index {
                NodeHandle::new(handle.0 - 1)
            } else {
                handle
            }
        };
        for edge in &mut self.edges {
            edge.source = shift(edge.source);
            edge.target = shift(edge.target);
        }
        for instance in &mut self.instances {
            instance.dependencies.retain(|dep| dep.index() != index);
            for dep in &mut instance.dependencies {
                *dep = shift(*dep);
            }
            for input in &mut instance.inputs {
                input
                    .accumulated
                    .retain(|acc| acc.source_node.index() != index);
                for acc in &mut input.accumulated {
                    acc.source_node = shift(acc.source_node);
                }
            }
            for slot in &mut instance.variadic_slots {
                if let Some(source) = slot.source_node {
                    if source.index() == index {
                        slot.source_node = None;
                        slot.resource = None;
                    } else {
                        slot.source_node = Some(shift(source));
                    }
                }
            }
        }

        // Rebuild the dense handle mappings.
        self.name_to_handle.clear();
        for (i, instance) in self.instances.iter().enumerate() {
            self.name_to_handle
                .insert(instance.name.clone(), NodeHandle::new(i as u32));
        }
        self.instances_by_type.clear();
        for (i, instance) in self.instances.iter().enumerate() {
            self.instances_by_type
                .entry(instance.type_id)
                .or_default()
                .push(NodeHandle::new(i as u32));
        }

        self.execution_order.clear();
        self.compiled = false;
        Ok(())
    }

    // ==================================================================
    // Lookup
    // ==================================================================

    pub fn instance(&self, handle: NodeHandle) -> Option<&NodeInstance> {
        self.instances.get(handle.index())
    }

    pub fn instance_mut(&mut self, handle: NodeHandle) -> Option<&mut NodeInstance> {
        self.instances.get_mut(handle.index())
    }

    pub fn handle_by_name(&self, name: &str) -> Option<NodeHandle> {
        self.name_to_handle.get(name).copied()
    }

    pub fn instance_by_name(&self, name: &str) -> Option<&NodeInstance> {
        self.handle_by_name(name)
            .and_then(|handle| self.instance(handle))
    }

    pub fn instances_of_type(&self, type_id: NodeTypeId) -> &[NodeHandle] {
        self.instances_by_type
            .get(&type_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn instance_count(&self, type_id: NodeTypeId) -> u32 {
        self.instances_of_type(type_id).len() as u32
    }

    /// Typed access to a node implementation.
    pub fn node_as<T: Node>(&self, handle: NodeHandle) -> Option<&T> {
        self.nodes
            .get(handle.index())
            .and_then(Option::as_ref)
            .and_then(|node| node.as_any().downcast_ref::<T>())
    }

    pub fn node_as_mut<T: Node>(&mut self, handle: NodeHandle) -> Option<&mut T> {
        self.nodes
            .get_mut(handle.index())
            .and_then(Option::as_mut)
            .and_then(|node| node.as_any_mut().downcast_mut::<T>())
    }

    /// Set a parameter on a node instance.
    pub fn set_parameter(
        &mut self,
        handle: NodeHandle,
        name: &str,
        value: ParameterValue,
    ) -> GraphResult<()> {
        let instance = self
            .instances
            .get_mut(handle.index())
            .ok_or(GraphError::InvalidNodeHandle)?;
        instance.params.set(name, value);
        self.compiled = false;
        Ok(())
    }

    // ==================================================================
    // Compilation
    // ==================================================================

    /// Compile the graph: validate, propagate device affinity, analyze
    /// dependencies, allocate resources, generate pipelines and build
    /// the execution order.
    pub fn compile(&mut self) -> GraphResult<()> {
        // Recompilation resets node state.
        for instance in &mut self.instances {
            instance.state = NodeState::Created;
            instance.diagnostic = None;
        }

        // Phase 1: validate.
        let order = self.validate()?;

        // Setup runs once per compilation.
        for &index in &order {
            self.instances[index].set_state(NodeState::Setup);
            if let Err(err) = self.run_phase(index, Phase::Setup, None) {
                self.instances[index].mark_failed(format!("setup failed: {err}"));
            } else {
                self.instances[index].set_state(NodeState::GraphCompileSetup);
            }
        }

        // Phase 2: propagate device affinity.
        self.propagate_device_affinity(&order);

        // Phase 3: analyze dependencies into a linear order.
        for (position, &index) in order.iter().enumerate() {
            self.instances[index].execution_order = position as u32;
        }

        // Phase 4: allocate resources.
        self.allocate_resources(&order)?;

        // Phase 5: generate pipelines via the node Compile phase.
        for &index in &order {
            if self.instances[index].state == NodeState::Failed {
                continue;
            }
            if self.has_failed_dependency(index) {
                self.instances[index].mark_failed("dependency failed");
                continue;
            }
            match self.run_phase(index, Phase::Compile, None) {
                Ok(()) => {
                    self.instances[index].set_state(NodeState::Compiled);
                    self.instances[index].set_state(NodeState::Ready);
                }
                Err(err) => {
                    self.instances[index].mark_failed(format!("compile failed: {err}"));
                }
            }
        }

        // Phase 6: finalize the execution order.
        self.execution_order = order;
        self.compiled = true;
        log::debug!(
            "graph compiled: {} nodes, {} edges, {} resources",
            self.instances.len(),
            self.edges.len(),
            self.resources.len()
        );
        Ok(())
    }

    fn validate(&mut self) -> GraphResult<Vec<usize>> {
        // Acyclic topology.
        let order = topology::topological_order(self.instances.len(), &self.edges)
            .ok_or(GraphError::CycleDetected)?;

        for instance in self.instances.iter() {
            let node_type = self
                .registry
                .get(instance.type_id)
                .ok_or(GraphError::InvalidNodeHandle)?;

            // Required inputs connected.
            for (slot_index, schema) in node_type.inputs.iter().enumerate() {
                if !schema.required {
                    continue;
                }
                let input = &instance.inputs[slot_index];
                if input.resource.is_none() && input.accumulated.is_empty() {
                    return Err(GraphError::MissingRequiredInput {
                        node: instance.name.clone(),
                        index: slot_index as u32,
                    });
                }
            }

            // Instance count within type limits.
            if node_type.max_instances > 0
                && self.instance_count(instance.type_id) > node_type.max_instances
            {
                return Err(GraphError::MaxInstancesReached(node_type.type_name.clone()));
            }

            // Variadic count within constraints.
            let variadic_count = instance.variadic_slots.len();
            if !instance.variadic_constraints.allows(variadic_count) {
                return Err(GraphError::Validation(format!(
                    "node '{}' has {} variadic inputs, outside [{}, {}]",
                    instance.name,
                    variadic_count,
                    instance.variadic_constraints.min_inputs,
                    instance.variadic_constraints.max_inputs
                )));
            }

            // Device capabilities.
            if let Some(device) = self.devices.get(instance.device_index as usize) {
                if !device
                    .caps()
                    .features
                    .contains(node_type.required_features)
                {
                    return Err(GraphError::Validation(format!(
                        "node '{}' requires features {:?} not supported by device {}",
                        instance.name, node_type.required_features, instance.device_index
                    )));
                }
            }

        }

        Ok(order)
    }

    fn propagate_device_affinity(&mut self, order: &[usize]) {
        // Consumers without an explicit device adopt their producers'
        // device; edges that still cross devices are marked for
        // transfer.
        for &index in order {
            let producer_devices: Vec<u32> = self.instances[index]
                .dependencies
                .iter()
                .filter_map(|dep| self.instances.get(dep.index()))
                .map(|dep| dep.device_index)
                .collect();
            if let Some(&first) = producer_devices.first() {
                if producer_devices.iter().all(|&d| d == first)
                    && self.instances[index].device_index == 0
                {
                    self.instances[index].device_index = first;
                }
            }
        }

        for edge in &mut self.edges {
            let source_device = self.instances[edge.source.index()].device_index;
            let target_device = self.instances[edge.target.index()].device_index;
            if source_device != target_device {
                edge.needs_transfer = true;
                log::debug!(
                    "edge {}:{} -> {}:{} crosses devices {source_device} -> {target_device}",
                    edge.source.index(),
                    edge.source_output,
                    edge.target.index(),
                    edge.target_input
                );
            }
        }
    }

    fn allocate_resources(&mut self, order: &[usize]) -> GraphResult<()> {
        use crate::types::ResourceDescription;

        // First/last use positions along the execution order, for
        // transient aliasing decisions.
        let mut lifetimes: HashMap<ResourceHandle, (u32, u32)> = HashMap::new();
        for &index in order {
            let position = self.instances[index].execution_order;
            let outputs: Vec<ResourceHandle> = self.instances[index]
                .outputs
                .iter()
                .flatten()
                .copied()
                .collect();
            let inputs: Vec<ResourceHandle> = self.instances[index]
                .inputs
                .iter()
                .flat_map(|input| {
                    input
                        .resource
                        .into_iter()
                        .chain(input.accumulated.iter().map(|acc| acc.resource))
                })
                .collect();
            for handle in outputs.into_iter().chain(inputs) {
                let entry = lifetimes.entry(handle).or_insert((position, position));
                entry.0 = entry.0.min(position);
                entry.1 = entry.1.max(position);
            }
        }

        let needs_allocation: Vec<ResourceHandle> = self
            .resources
            .iter()
            .filter(|(_, resource)| {
                // Externally supplied handles (swapchain-style) are
                // already valid and never allocated here.
                !resource.is_valid()
                    && matches!(
                        resource.description(),
                        ResourceDescription::Image(_) | ResourceDescription::Buffer(_)
                    )
            })
            .map(|(handle, _)| handle)
            .collect();

        if needs_allocation.is_empty() {
            return Ok(());
        }

        let allocator = self
            .allocator
            .clone()
            .ok_or(GraphError::AllocatorMissing)?;

        let mut allocated: Vec<ResourceHandle> = Vec::new();
        for handle in needs_allocation {
            let resource = self.resources.get_mut(handle).expect("handle from iter");
            let lifetime = lifetimes.get(&handle).copied().unwrap_or((0, 0));
            if resource.lifetime() == ResourceLifetime::Transient {
                log::trace!(
                    "transient resource {:?} live over [{}, {}], aliasable",
                    handle,
                    lifetime.0,
                    lifetime.1
                );
            }

            let result = match resource.description().clone() {
                ResourceDescription::Buffer(desc) => {
                    resource.allocate_buffer(allocator.as_ref(), &desc)
                }
                ResourceDescription::Image(desc) => {
                    resource.allocate_image(allocator.as_ref(), &desc)
                }
                _ => Ok(()),
            };

            if let Err(err) = result {
                // Release everything allocated during this compile.
                for handle in allocated {
                    if let Some(resource) = self.resources.get_mut(handle) {
                        resource.release(allocator.as_ref());
                    }
                }
                return Err(err.into());
            }
            allocated.push(handle);
        }

        Ok(())
    }

    fn has_failed_dependency(&self, index: usize) -> bool {
        self.instances[index]
            .dependencies
            .iter()
            .filter_map(|dep| self.instances.get(dep.index()))
            .any(|dep| dep.state == NodeState::Failed)
    }

    // ==================================================================
    // Execution
    // ==================================================================

    /// Execute one frame, recording through the given recorder.
    ///
    /// Emits frame-start and frame-end events, walks the precompiled
    /// order and runs each ready node's Execute phase. A failing node
    /// is marked `Failed` and execution continues with nodes that did
    /// not depend on it.
    pub fn execute(&mut self, recorder: &mut dyn CommandRecorder) -> GraphResult<()> {
        if !self.compiled {
            return Err(GraphError::Validation(
                "graph must be compiled before execution".into(),
            ));
        }

        if let Some(bus) = &self.bus {
            bus.publish_immediate(&EventMessage::frame_start(self.frame_number));
        }

        let order = self.execution_order.clone();
        for index in order {
            let state = self.instances[index].state;
            if state != NodeState::Ready && state != NodeState::Compiled {
                continue;
            }
            self.instances[index].set_state(NodeState::Executing);
            match self.run_phase(index, Phase::Execute, Some(&mut *recorder)) {
                Ok(()) => {
                    self.instances[index].set_state(NodeState::Complete);
                }
                Err(err) => {
                    self.instances[index].mark_failed(format!("execute failed: {err}"));
                }
            }
        }

        // Completed nodes become ready for the next frame.
        for instance in &mut self.instances {
            if instance.state == NodeState::Complete {
                instance.set_state(NodeState::Ready);
            }
        }

        if let Some(bus) = &self.bus {
            let (gpu_util, cpu_util) = match &self.capacity_tracker {
                Some(tracker) => {
                    let tracker = tracker.lock();
                    let timeline = tracker.current_timeline();
                    (
                        timeline.max_gpu_utilization(),
                        timeline.max_cpu_utilization(),
                    )
                }
                None => (0.0, 0.0),
            };
            bus.publish_immediate(&EventMessage::frame_end(
                self.frame_number,
                gpu_util,
                cpu_util,
            ));
        }

        self.frame_number += 1;
        Ok(())
    }

    /// Convenience: execute without an external command buffer. Nodes
    /// that record commands manage their own buffers.
    pub fn render_frame(&mut self) -> GraphResult<()> {
        let mut recorder = NullRecorder;
        self.execute(&mut recorder)
    }

    /// Execution order as node handles, available after compilation.
    pub fn execution_order(&self) -> Vec<NodeHandle> {
        self.execution_order
            .iter()
            .map(|&index| NodeHandle::new(index as u32))
            .collect()
    }

    /// Run cleanup on all nodes and drop resources.
    pub fn clear(&mut self) {
        for index in 0..self.instances.len() {
            if self.instances[index].state != NodeState::Created {
                self.instances[index].set_state(NodeState::Cleanup);
                let _ = self.run_phase(index, Phase::Cleanup, None);
            }
        }
        if let Some(allocator) = self.allocator.clone() {
            for (_, resource) in self.resources.iter_mut() {
                if resource.is_allocated() {
                    resource.release(allocator.as_ref());
                }
            }
        }
        self.nodes.clear();
        self.instances.clear();
        self.name_to_handle.clear();
        self.instances_by_type.clear();
        self.edges.clear();
        self.resources.clear();
        self.execution_order.clear();
        self.compiled = false;
    }

    // ==================================================================
    // Phase plumbing
    // ==================================================================

    fn run_phase<'a>(
        &'a mut self,
        index: usize,
        phase: Phase,
        mut recorder: Option<&'a mut dyn CommandRecorder>,
    ) -> GraphResult<()> {
        let mut node = self.nodes[index]
            .take()
            .ok_or(GraphError::InvalidNodeHandle)?;

        let (instance, peers) = split_instances(&mut self.instances, index);
        let device = self.devices.get(instance.device_index as usize);
        let ctx = NodeContext {
            instance,
            peers,
            resources: &mut self.resources,
            bus: self.bus.as_ref(),
            device,
            recorder: recorder.take(),
            frame_number: self.frame_number,
        };

        let result = match phase {
            Phase::Setup => node.setup(&mut SetupContext(ctx)),
            Phase::Compile => node.compile(&mut CompileContext(ctx)),
            Phase::Execute => node.execute(&mut ExecuteContext(ctx)),
            Phase::Cleanup => {
                node.cleanup(&mut CleanupContext(ctx));
                Ok(())
            }
        };

        self.nodes[index] = Some(node);
        result
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        self.clear();
    }
}

mod topology {
    use super::GraphEdge;

    /// Kahn's algorithm over the edge set. Returns `None` on a cycle.
    pub fn topological_order(node_count: usize, edges: &[GraphEdge]) -> Option<Vec<usize>> {
        let mut in_degree = vec![0usize; node_count];
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); node_count];

        for edge in edges {
            let source = edge.source.index();
            let target = edge.target.index();
            // Parallel edges between the same pair count once.
            if !adjacency[source].contains(&target) {
                adjacency[source].push(target);
                in_degree[target] += 1;
            }
        }

        let mut queue: Vec<usize> = (0..node_count).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(node_count);

        while let Some(index) = queue.pop() {
            order.push(index);
            for &next in &adjacency[index] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push(next);
                }
            }
        }

        (order.len() == node_count).then_some(order)
    }
}
