//! Dense resource arena owned by the graph.
//!
//! Resources are stored by index; nodes hold [`ResourceHandle`]s
//! rather than references, so producers own allocations while
//! consumers hold non-owning handles.

use crate::resource::Resource;

/// Index of a resource in the graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(u32);

impl ResourceHandle {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Dense storage for graph resources.
#[derive(Debug, Default)]
pub struct ResourceArena {
    resources: Vec<Resource>,
}

impl ResourceArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, resource: Resource) -> ResourceHandle {
        let handle = ResourceHandle::new(self.resources.len() as u32);
        self.resources.push(resource);
        handle
    }

    pub fn get(&self, handle: ResourceHandle) -> Option<&Resource> {
        self.resources.get(handle.index())
    }

    pub fn get_mut(&mut self, handle: ResourceHandle) -> Option<&mut Resource> {
        self.resources.get_mut(handle.index())
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceHandle, &Resource)> {
        self.resources
            .iter()
            .enumerate()
            .map(|(index, resource)| (ResourceHandle::new(index as u32), resource))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ResourceHandle, &mut Resource)> {
        self.resources
            .iter_mut()
            .enumerate()
            .map(|(index, resource)| (ResourceHandle::new(index as u32), resource))
    }

    pub fn clear(&mut self) {
        self.resources.clear();
    }
}
