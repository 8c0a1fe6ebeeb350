//! Timeline capacity and scheduling.
//!
//! Budget-aware task queueing, multi-device capacity tracking with
//! damped adaptive scaling, prediction-error learning and GPU
//! timestamp query coordination.

mod budget;
mod capacity;
mod prediction;
mod query;
mod task_queue;

pub use budget::{BudgetOverflowMode, TaskBudget};
pub use capacity::{
    Bottleneck, CapacityTrackerConfig, DeviceTimeline, SystemTimeline, TimelineCapacityTracker,
};
pub use prediction::{
    GlobalPredictionStats, PredictionError, PredictionErrorTracker, PredictionTrackerConfig,
    TaskPredictionStats,
};
pub use query::{GpuQueryManager, QuerySlotHandle, INVALID_QUERY_SLOT};
pub use task_queue::{BudgetWarningCallback, TaskQueue, TaskSlot};
