//! Node type registry.
//!
//! A per-graph dependency injected at construction; type ids are
//! assigned at registration.

use std::collections::HashMap;

use crate::node::{NodeType, NodeTypeId};

/// Registry of node types keyed by id and name.
#[derive(Debug, Default)]
pub struct NodeTypeRegistry {
    types: Vec<NodeType>,
    by_name: HashMap<String, NodeTypeId>,
    next_type_id: NodeTypeId,
}

impl NodeTypeRegistry {
    pub fn new() -> Self {
        Self {
            types: Vec::new(),
            by_name: HashMap::new(),
            next_type_id: 1,
        }
    }

    /// Register a node type, assigning its process-unique id. Returns
    /// `None` if the name is already registered.
    pub fn register(&mut self, mut node_type: NodeType) -> Option<NodeTypeId> {
        if self.by_name.contains_key(&node_type.type_name) {
            log::warn!("node type '{}' already registered", node_type.type_name);
            return None;
        }
        let type_id = self.next_type_id;
        self.next_type_id += 1;
        node_type.type_id = type_id;
        self.by_name.insert(node_type.type_name.clone(), type_id);
        self.types.push(node_type);
        Some(type_id)
    }

    pub fn get(&self, type_id: NodeTypeId) -> Option<&NodeType> {
        self.types.iter().find(|t| t.type_id == type_id)
    }

    pub fn get_by_name(&self, type_name: &str) -> Option<&NodeType> {
        self.by_name
            .get(type_name)
            .and_then(|type_id| self.get(*type_id))
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
