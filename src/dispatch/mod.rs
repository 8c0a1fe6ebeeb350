//! Compute dispatch descriptors and the command recording seam.

mod pass;
mod recorder;

pub use pass::{
    DispatchBarrier, DispatchPass, GroupDispatchStats, MultiDispatchStats, PushConstantData,
};
pub use recorder::{
    CommandRecorder, NullRecorder, RecordedCommand, TraceRecorder, VulkanRecorder,
};
