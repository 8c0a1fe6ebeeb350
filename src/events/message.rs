//! Event message types.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;

/// Identifies the sender of a message. Zero is reserved for "system".
pub type SenderId = u64;

/// Message type identifier for filtering. Types 0-99 are reserved for
/// the runtime; applications define their own above that.
pub type MessageType = u32;

/// Reserved runtime message types.
pub mod message_type {
    use super::MessageType;

    pub const GENERIC: MessageType = 0;
    pub const FRAME_START: MessageType = 1;
    pub const FRAME_END: MessageType = 2;
    pub const GPU_OVER_BUDGET: MessageType = 3;
    pub const CPU_OVER_BUDGET: MessageType = 4;
    pub const UTILIZATION_BELOW_ADAPTIVE: MessageType = 5;
}

bitflags! {
    /// Category flags for mask-based subscription filtering.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventCategory: u64 {
        const FRAME = 1 << 0;
        const BUDGET = 1 << 1;
        const RESOURCE = 1 << 2;
        const DIAGNOSTIC = 1 << 3;
    }
}

/// Payload carried by a message.
#[derive(Clone)]
pub enum EventPayload {
    None,
    FrameStart {
        frame: u64,
    },
    FrameEnd {
        frame: u64,
        gpu_utilization: f32,
        cpu_utilization: f32,
    },
    GpuOverBudget {
        queue_index: u32,
        utilization: f32,
    },
    CpuOverBudget {
        thread_index: u32,
        utilization: f32,
    },
    UtilizationBelowAdaptive {
        utilization: f32,
        threshold: f32,
    },
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl std::fmt::Debug for EventPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventPayload::None => write!(f, "None"),
            EventPayload::FrameStart { frame } => write!(f, "FrameStart({frame})"),
            EventPayload::FrameEnd { frame, .. } => write!(f, "FrameEnd({frame})"),
            EventPayload::GpuOverBudget { queue_index, .. } => {
                write!(f, "GpuOverBudget(queue {queue_index})")
            }
            EventPayload::CpuOverBudget { thread_index, .. } => {
                write!(f, "CpuOverBudget(thread {thread_index})")
            }
            EventPayload::UtilizationBelowAdaptive { utilization, .. } => {
                write!(f, "UtilizationBelowAdaptive({utilization})")
            }
            EventPayload::Opaque(_) => write!(f, "Opaque"),
        }
    }
}

/// A message published on the bus.
#[derive(Debug, Clone)]
pub struct EventMessage {
    pub type_id: MessageType,
    pub categories: EventCategory,
    pub sender: SenderId,
    pub timestamp: Instant,
    pub payload: EventPayload,
}

impl EventMessage {
    pub fn new(type_id: MessageType, categories: EventCategory, sender: SenderId) -> Self {
        Self {
            type_id,
            categories,
            sender,
            timestamp: Instant::now(),
            payload: EventPayload::None,
        }
    }

    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn frame_start(frame: u64) -> Self {
        Self::new(message_type::FRAME_START, EventCategory::FRAME, 0)
            .with_payload(EventPayload::FrameStart { frame })
    }

    pub fn frame_end(frame: u64, gpu_utilization: f32, cpu_utilization: f32) -> Self {
        Self::new(message_type::FRAME_END, EventCategory::FRAME, 0).with_payload(
            EventPayload::FrameEnd {
                frame,
                gpu_utilization,
                cpu_utilization,
            },
        )
    }

    pub fn gpu_over_budget(queue_index: u32, utilization: f32) -> Self {
        Self::new(message_type::GPU_OVER_BUDGET, EventCategory::BUDGET, 0).with_payload(
            EventPayload::GpuOverBudget {
                queue_index,
                utilization,
            },
        )
    }

    pub fn cpu_over_budget(thread_index: u32, utilization: f32) -> Self {
        Self::new(message_type::CPU_OVER_BUDGET, EventCategory::BUDGET, 0).with_payload(
            EventPayload::CpuOverBudget {
                thread_index,
                utilization,
            },
        )
    }

    pub fn utilization_below_adaptive(utilization: f32, threshold: f32) -> Self {
        Self::new(
            message_type::UTILIZATION_BELOW_ADAPTIVE,
            EventCategory::BUDGET,
            0,
        )
        .with_payload(EventPayload::UtilizationBelowAdaptive {
            utilization,
            threshold,
        })
    }
}
