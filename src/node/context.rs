//! Typed phase contexts handed to node implementations.
//!
//! Each lifecycle phase receives its own context type; all of them
//! deref to [`NodeContext`], which borrows the executing node's
//! instance bookkeeping, a read-only view of its peers and the graph's
//! resource arena.

use std::any::Any;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::connection::ConnectionMetadata;
use crate::device::GpuDevice;
use crate::dispatch::CommandRecorder;
use crate::events::MessageBus;
use crate::graph::{NodeHandle, ResourceArena, ResourceHandle};
use crate::node::{NodeInstance, SlotIndex, VariadicSlotInfo};
use crate::resource::Resource;

/// One element collected by an accumulation slot.
#[derive(Debug, Clone)]
pub struct AccumulatedInput {
    pub resource: ResourceHandle,
    pub source_node: NodeHandle,
    pub source_output: SlotIndex,
    pub metadata: Arc<ConnectionMetadata>,
}

/// Read-only view of every other node's instance bookkeeping.
///
/// The executing node's instance is mutably borrowed by the context, so
/// peers are exposed as the two dense-array halves around it.
pub struct PeerView<'g> {
    before: &'g [NodeInstance],
    after: &'g [NodeInstance],
}

impl<'g> PeerView<'g> {
    pub(crate) fn new(before: &'g [NodeInstance], after: &'g [NodeInstance]) -> Self {
        Self { before, after }
    }

    /// Look up a peer instance by handle. Returns `None` for the
    /// executing node itself.
    pub fn instance(&self, handle: NodeHandle) -> Option<&NodeInstance> {
        let index = handle.index();
        if index < self.before.len() {
            self.before.get(index)
        } else if index == self.before.len() {
            None
        } else {
            self.after.get(index - self.before.len() - 1)
        }
    }

    /// Resource currently attached to a peer's output slot.
    pub fn output_of(&self, handle: NodeHandle, output_index: SlotIndex) -> Option<ResourceHandle> {
        self.instance(handle)
            .and_then(|instance| instance.outputs.get(output_index as usize).copied())
            .flatten()
    }
}

/// Shared state behind every phase context.
pub struct NodeContext<'g> {
    pub(crate) instance: &'g mut NodeInstance,
    pub(crate) peers: PeerView<'g>,
    pub(crate) resources: &'g mut ResourceArena,
    pub(crate) bus: Option<&'g Arc<MessageBus>>,
    pub(crate) device: Option<&'g Arc<dyn GpuDevice>>,
    pub(crate) recorder: Option<&'g mut dyn CommandRecorder>,
    pub(crate) frame_number: u64,
}

impl<'g> NodeContext<'g> {
    pub fn instance(&self) -> &NodeInstance {
        self.instance
    }

    pub fn instance_mut(&mut self) -> &mut NodeInstance {
        self.instance
    }

    pub fn instance_name(&self) -> &str {
        &self.instance.name
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    // ------------------------------------------------------------------
    // Inputs and outputs
    // ------------------------------------------------------------------

    /// Typed read of an input slot's resource. `None` when the slot is
    /// unconnected.
    pub fn input_resource(&self, slot: SlotIndex) -> Option<&Resource> {
        self.instance
            .inputs
            .get(slot as usize)
            .and_then(|input| input.resource)
            .and_then(|handle| self.resources.get(handle))
    }

    /// Typed read of an input's opaque payload.
    pub fn input_payload<T: Any + Send + Sync>(&self, slot: SlotIndex) -> Option<Arc<T>> {
        self.input_resource(slot).and_then(Resource::payload)
    }

    /// Elements collected by an accumulation input slot.
    pub fn accumulated(&self, slot: SlotIndex) -> &[AccumulatedInput] {
        self.instance
            .inputs
            .get(slot as usize)
            .map(|input| input.accumulated.as_slice())
            .unwrap_or(&[])
    }

    /// Write a typed payload to an output slot, creating the backing
    /// resource if no consumer connection created it yet.
    pub fn set_output_payload<T: Any + Send + Sync>(
        &mut self,
        slot: SlotIndex,
        type_name: &str,
        value: T,
    ) -> Option<ResourceHandle> {
        let slot_index = slot as usize;
        if slot_index >= self.instance.outputs.len() {
            log::warn!(
                "{}: output slot {slot} out of range",
                self.instance.log_name()
            );
            return None;
        }
        let handle = match self.instance.outputs[slot_index] {
            Some(handle) => handle,
            None => {
                let handle = self.resources.insert(Resource::opaque(type_name, ()));
                self.instance.outputs[slot_index] = Some(handle);
                handle
            }
        };
        if let Some(resource) = self.resources.get_mut(handle) {
            resource.set_payload(value);
        }
        Some(handle)
    }

    /// Replace the resource behind an output slot, preserving the
    /// handle consumers already hold.
    pub fn set_output_resource(
        &mut self,
        slot: SlotIndex,
        resource: Resource,
    ) -> Option<ResourceHandle> {
        let slot_index = slot as usize;
        if slot_index >= self.instance.outputs.len() {
            log::warn!(
                "{}: output slot {slot} out of range",
                self.instance.log_name()
            );
            return None;
        }
        let handle = match self.instance.outputs[slot_index] {
            Some(handle) => handle,
            None => {
                let handle = self.resources.insert(resource);
                self.instance.outputs[slot_index] = Some(handle);
                return Some(handle);
            }
        };
        *self.resources.get_mut(handle)? = resource;
        Some(handle)
    }

    /// Mutable access to the resource behind an output slot.
    pub fn output_resource_mut(&mut self, slot: SlotIndex) -> Option<&mut Resource> {
        let handle = self.instance.outputs.get(slot as usize).copied().flatten()?;
        self.resources.get_mut(handle)
    }

    /// Resolve any resource handle.
    pub fn resource(&self, handle: ResourceHandle) -> Option<&Resource> {
        self.resources.get(handle)
    }

    pub fn resource_mut(&mut self, handle: ResourceHandle) -> Option<&mut Resource> {
        self.resources.get_mut(handle)
    }

    // ------------------------------------------------------------------
    // Variadic slots
    // ------------------------------------------------------------------

    pub fn variadic_count(&self) -> usize {
        self.instance.variadic_slots.len()
    }

    pub fn variadic_slot(&self, index: usize) -> Option<&VariadicSlotInfo> {
        self.instance.variadic_slots.get(index)
    }

    /// Resource attached to a variadic slot.
    pub fn variadic_resource(&self, index: usize) -> Option<&Resource> {
        self.instance
            .variadic_slots
            .get(index)
            .and_then(|slot| slot.resource)
            .and_then(|handle| self.resources.get(handle))
    }

    /// Replace a variadic slot's metadata.
    pub fn update_variadic_slot(&mut self, index: usize, slot: VariadicSlotInfo) {
        if let Some(existing) = self.instance.variadic_slots.get_mut(index) {
            *existing = slot;
        }
    }

    // ------------------------------------------------------------------
    // Collaborators
    // ------------------------------------------------------------------

    /// Peer view for following stored source-node references.
    pub fn peers(&self) -> &PeerView<'g> {
        &self.peers
    }

    pub fn message_bus(&self) -> Option<&Arc<MessageBus>> {
        self.bus
    }

    pub fn device(&self) -> Option<&Arc<dyn GpuDevice>> {
        self.device
    }
}

macro_rules! phase_context {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub struct $name<'g>(pub(crate) NodeContext<'g>);

        impl<'g> Deref for $name<'g> {
            type Target = NodeContext<'g>;
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl<'g> DerefMut for $name<'g> {
            fn deref_mut(&mut self) -> &mut Self::Target {
                &mut self.0
            }
        }
    };
}

phase_context!(
    /// Context for the Setup phase: node initialization only, connected
    /// inputs may not be read.
    SetupContext
);
phase_context!(
    /// Context for the Compile phase: static inputs are connected and
    /// readable, pipelines and descriptor artifacts are built here.
    CompileContext
);
phase_context!(
    /// Context for the per-frame Execute phase.
    ExecuteContext
);
phase_context!(
    /// Context for teardown.
    CleanupContext
);

impl<'g> ExecuteContext<'g> {
    /// Command recorder for this frame, when one was supplied to
    /// `execute`.
    pub fn recorder(&mut self) -> Option<&mut dyn CommandRecorder> {
        match &mut self.0.recorder {
            Some(recorder) => Some(&mut **recorder),
            None => None,
        }
    }
}

/// Split the instance array around the executing node.
pub(crate) fn split_instances(
    instances: &mut [NodeInstance],
    index: usize,
) -> (&mut NodeInstance, PeerView<'_>) {
    let (before, rest) = instances.split_at_mut(index);
    let (instance, after) = rest.split_first_mut().expect("index in bounds");
    (instance, PeerView::new(before, after))
}
