//! Error types for the render graph runtime.

use ash::vk;
use thiserror::Error;

/// Errors surfaced by graph construction, compilation and execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("instance name already exists: {0}")]
    DuplicateInstanceName(String),
    #[error("unknown node type: {0}")]
    UnknownNodeType(String),
    #[error("max instance count reached for type: {0}")]
    MaxInstancesReached(String),
    #[error("failed to create instance for type: {0}")]
    InstanceCreationFailed(String),
    #[error("invalid node handle")]
    InvalidNodeHandle,
    #[error("invalid slot index {index} on node {node}")]
    InvalidSlotIndex { node: String, index: u32 },
    #[error("connection type mismatch: {0}")]
    ConnectionTypeMismatch(String),
    #[error("render graph contains a cycle")]
    CycleDetected,
    #[error("node {node} missing required input at index {index}")]
    MissingRequiredInput { node: String, index: u32 },
    #[error("allocation rejected: over budget")]
    OverBudget,
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("descriptor limit exceeded: {0}")]
    DescriptorLimitExceeded(String),
    #[error("no shader bundle connected for node {0}")]
    MissingShaderBundle(String),
    #[error("shader bundle has no descriptor layout for node {0}")]
    MissingLayout(String),
    #[error("vulkan call failed: {0:?}")]
    VulkanCallFailed(vk::Result),
    #[error("no allocator configured")]
    AllocatorMissing,
    #[error("graph validation failed: {0}")]
    Validation(String),
    #[error("unknown error: {0}")]
    Unknown(String),
}

/// Errors returned by the allocation seam.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationError {
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("allocation rejected by budget manager")]
    OverBudget,
    #[error("invalid allocation parameters")]
    InvalidParameters,
    #[error("allocation failed for an unknown reason")]
    Unknown,
}

impl From<AllocationError> for GraphError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::OutOfDeviceMemory => GraphError::OutOfDeviceMemory,
            AllocationError::OutOfHostMemory => GraphError::OutOfHostMemory,
            AllocationError::OverBudget => GraphError::OverBudget,
            AllocationError::InvalidParameters => {
                GraphError::InvalidParameters("allocation request".into())
            }
            AllocationError::Unknown => GraphError::Unknown("allocation failed".into()),
        }
    }
}

pub type GraphResult<T> = Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphError::DuplicateInstanceName("main_pass".into());
        assert_eq!(err.to_string(), "instance name already exists: main_pass");

        let err = GraphError::CycleDetected;
        assert_eq!(err.to_string(), "render graph contains a cycle");
    }

    #[test]
    fn test_allocation_error_conversion() {
        let err: GraphError = AllocationError::OverBudget.into();
        assert_eq!(err, GraphError::OverBudget);

        let err: GraphError = AllocationError::OutOfDeviceMemory.into();
        assert_eq!(err, GraphError::OutOfDeviceMemory);
    }
}
