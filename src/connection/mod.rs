//! Connection modifiers.
//!
//! Modifiers are first-class objects attached to an edge at
//! `connect_nodes_with` time. They run in descending priority through
//! three lifecycle hooks: pre-validation (may reject the connection or
//! stash metadata), pre-resolve (may transform slot descriptors) and
//! post-resolve.

use std::sync::Arc;

use crate::dispatch::DispatchPass;
use crate::node::{SlotIndex, SlotSchema};

/// Closure extracting a group id from an accumulation element.
pub type GroupKeyExtractor = Arc<dyn Fn(&DispatchPass) -> Option<u32> + Send + Sync>;

/// Per-edge metadata written by modifiers and read by consumer nodes.
#[derive(Default, Clone)]
pub struct ConnectionMetadata {
    /// Set by [`GroupKeyModifier`]; consumed by the multi-dispatch node
    /// to partition accumulated passes by group.
    pub group_key_extractor: Option<GroupKeyExtractor>,
    /// Whether the extractor may return `None` for ungrouped elements.
    pub group_key_optional: bool,
    /// Field-extraction transform applied by a pre-resolve hook.
    pub field_offset: Option<u32>,
    pub field_size: Option<u32>,
}

impl std::fmt::Debug for ConnectionMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMetadata")
            .field("has_group_key", &self.group_key_extractor.is_some())
            .field("field_offset", &self.field_offset)
            .finish()
    }
}

/// Context visible to modifier hooks while a connection is being made.
pub struct ConnectionContext<'a> {
    pub source_node_name: &'a str,
    pub source_output: SlotIndex,
    pub target_node_name: &'a str,
    pub target_input: SlotIndex,
    pub target_slot: &'a SlotSchema,
    pub metadata: &'a mut ConnectionMetadata,
}

/// Hook outcome: an error string rejects the connection.
pub type ModifierResult = Result<(), String>;

/// A modifier participating in connection resolution.
pub trait ConnectionModifier: Send + Sync {
    /// Executed in descending order across an edge's modifiers.
    fn priority(&self) -> u32;

    fn name(&self) -> &str;

    /// May reject the connection or write metadata.
    fn pre_validation(&self, _ctx: &mut ConnectionContext) -> ModifierResult {
        Ok(())
    }

    /// Runs before the edge is finalized; may transform slot
    /// descriptors.
    fn pre_resolve(&self, _ctx: &mut ConnectionContext) -> ModifierResult {
        Ok(())
    }

    /// Runs after binding.
    fn post_resolve(&self, _ctx: &mut ConnectionContext) -> ModifierResult {
        Ok(())
    }
}

/// Partitions accumulation-slot elements by a group key.
///
/// Requires the target to be an accumulation slot; stores an extractor
/// closure in the connection metadata which the multi-dispatch node
/// reads during Compile to partition dispatches by group.
pub struct GroupKeyModifier {
    extractor: GroupKeyExtractor,
    optional: bool,
}

impl GroupKeyModifier {
    /// Extract from a required field; every element gets a group.
    pub fn from_field(extract: impl Fn(&DispatchPass) -> u32 + Send + Sync + 'static) -> Self {
        Self {
            extractor: Arc::new(move |pass| Some(extract(pass))),
            optional: false,
        }
    }

    /// Extract from an optional field; elements without a group id are
    /// treated as ungrouped.
    pub fn from_optional_field(
        extract: impl Fn(&DispatchPass) -> Option<u32> + Send + Sync + 'static,
    ) -> Self {
        Self {
            extractor: Arc::new(extract),
            optional: true,
        }
    }

    /// Extract the pass's own `group_id` field.
    pub fn from_group_id() -> Self {
        Self::from_optional_field(|pass| pass.group_id)
    }

    pub fn extracts_optional(&self) -> bool {
        self.optional
    }
}

impl ConnectionModifier for GroupKeyModifier {
    // After field extraction (75), before type validation (50).
    fn priority(&self) -> u32 {
        60
    }

    fn name(&self) -> &str {
        "GroupKeyModifier"
    }

    fn pre_validation(&self, ctx: &mut ConnectionContext) -> ModifierResult {
        if !ctx.target_slot.accumulation {
            return Err(format!(
                "GroupKeyModifier requires an accumulation slot target; \
                 input {} of {} is not an accumulation slot",
                ctx.target_input, ctx.target_node_name
            ));
        }

        ctx.metadata.group_key_extractor = Some(self.extractor.clone());
        ctx.metadata.group_key_optional = self.optional;
        Ok(())
    }
}
