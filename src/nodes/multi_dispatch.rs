//! Queued multi-dispatch recording.
//!
//! Records many compute dispatches into one command buffer per frame,
//! with optional automatic UAV barriers between passes and optional
//! group partitioning driven by a group-key connection modifier on the
//! accumulation input.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::dispatch::{
    CommandRecorder, DispatchBarrier, DispatchPass, GroupDispatchStats, MultiDispatchStats,
};
use crate::error::{GraphError, GraphResult};
use crate::node::{
    CleanupContext, CompileContext, ExecuteContext, Node, NodeType, SlotSchema,
};

/// Slot indices for the multi-dispatch node.
pub mod slots {
    use crate::node::SlotIndex;

    /// Accumulation slot collecting `DispatchPass` elements.
    pub const GROUP_INPUTS: SlotIndex = 0;
    pub const DESCRIPTOR_SETS: SlotIndex = 1;
}

/// Parameter toggling automatic UAV barriers (default true).
pub const PARAM_AUTO_BARRIERS: &str = "auto_barriers";

/// Node recording queued compute dispatches.
#[derive(Default)]
pub struct MultiDispatchNode {
    dispatch_queue: Vec<DispatchPass>,
    /// Explicit barriers keyed by the queue position they precede.
    barrier_queue: Vec<(usize, DispatchBarrier)>,
    auto_barriers: bool,
    stats: MultiDispatchStats,
}

impl MultiDispatchNode {
    pub fn node_type() -> NodeType {
        NodeType::new("MultiDispatch", |_| {
            Box::new(MultiDispatchNode {
                auto_barriers: true,
                ..Default::default()
            })
        })
        .with_inputs(vec![
            SlotSchema::accumulation("group_inputs"),
            SlotSchema::optional("descriptor_sets"),
        ])
        .with_pipeline_type(crate::node::PipelineType::Compute)
    }

    // ------------------------------------------------------------------
    // Public queue API
    // ------------------------------------------------------------------

    /// Queue a dispatch; returns its index for barrier placement.
    pub fn queue_dispatch(&mut self, pass: DispatchPass) -> GraphResult<usize> {
        if !pass.is_valid() {
            return Err(GraphError::InvalidParameters(format!(
                "dispatch pass '{}' is invalid",
                pass.debug_name
            )));
        }
        self.dispatch_queue.push(pass);
        Ok(self.dispatch_queue.len() - 1)
    }

    /// Queue an explicit barrier before the next queued dispatch.
    pub fn queue_barrier(&mut self, barrier: DispatchBarrier) {
        self.barrier_queue.push((self.dispatch_queue.len(), barrier));
    }

    /// Clear queued dispatches and barriers. Idempotent.
    pub fn clear_queue(&mut self) {
        self.dispatch_queue.clear();
        self.barrier_queue.clear();
    }

    pub fn queue_size(&self) -> usize {
        self.dispatch_queue.len()
    }

    /// Statistics from the most recent recording.
    pub fn stats(&self) -> &MultiDispatchStats {
        &self.stats
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    /// Partition accumulated inputs by group id. Elements whose
    /// connection carries no extractor, or whose extractor returns
    /// `None`, stay ungrouped.
    fn partition(ctx: &ExecuteContext) -> (BTreeMap<u32, Vec<DispatchPass>>, Vec<DispatchPass>) {
        let mut grouped: BTreeMap<u32, Vec<DispatchPass>> = BTreeMap::new();
        let mut ungrouped = Vec::new();

        for accumulated in ctx.accumulated(slots::GROUP_INPUTS) {
            let Some(pass) = ctx
                .resource(accumulated.resource)
                .and_then(|resource| resource.payload::<DispatchPass>())
            else {
                continue;
            };
            let pass = (*pass).clone();
            match &accumulated.metadata.group_key_extractor {
                Some(extractor) => match extractor(&pass) {
                    Some(group_id) => grouped.entry(group_id).or_default().push(pass),
                    None => ungrouped.push(pass),
                },
                None => ungrouped.push(pass),
            }
        }

        (grouped, ungrouped)
    }

    fn record_pass(recorder: &mut dyn CommandRecorder, pass: &DispatchPass) {
        recorder.bind_compute_pipeline(pass.pipeline);
        if !pass.descriptor_sets.is_empty() {
            recorder.bind_descriptor_sets(pass.layout, pass.first_set, &pass.descriptor_sets);
        }
        if let Some(push_constants) = &pass.push_constants {
            recorder.push_constants(
                pass.layout,
                push_constants.stage_flags,
                push_constants.offset,
                &push_constants.data,
            );
        }
        recorder.dispatch(
            pass.work_group_count.x,
            pass.work_group_count.y,
            pass.work_group_count.z,
        );
    }

    fn record_barrier(recorder: &mut dyn CommandRecorder, barrier: &DispatchBarrier) {
        recorder.pipeline_barrier(
            barrier.src_stage,
            barrier.dst_stage,
            barrier.src_access,
            barrier.dst_access,
        );
    }

    fn record_group(
        &mut self,
        recorder: &mut dyn CommandRecorder,
        group_id: Option<u32>,
        passes: &[DispatchPass],
    ) {
        let start = Instant::now();
        let mut group_stats = GroupDispatchStats::default();

        for (position, pass) in passes.iter().enumerate() {
            if self.auto_barriers && position > 0 {
                Self::record_barrier(recorder, &DispatchBarrier::compute_uav());
                self.stats.barrier_count += 1;
            }
            Self::record_pass(recorder, pass);
            group_stats.dispatch_count += 1;
            group_stats.total_work_groups += pass.total_work_groups();
        }

        group_stats.record_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.stats.dispatch_count += group_stats.dispatch_count;
        self.stats.total_work_groups += group_stats.total_work_groups;
        if let Some(group_id) = group_id {
            self.stats.group_stats.insert(group_id, group_stats);
        }
    }

    /// Record the linear queue with explicit barriers interleaved at
    /// their recorded positions.
    fn record_linear(&mut self, recorder: &mut dyn CommandRecorder) {
        let start = Instant::now();
        let passes = std::mem::take(&mut self.dispatch_queue);
        let barriers = std::mem::take(&mut self.barrier_queue);

        let mut group_stats = GroupDispatchStats::default();
        for (position, pass) in passes.iter().enumerate() {
            for (barrier_position, barrier) in &barriers {
                if *barrier_position == position {
                    Self::record_barrier(recorder, barrier);
                    self.stats.barrier_count += 1;
                }
            }
            if self.auto_barriers && position > 0 {
                Self::record_barrier(recorder, &DispatchBarrier::compute_uav());
                self.stats.barrier_count += 1;
            }
            Self::record_pass(recorder, pass);
            group_stats.dispatch_count += 1;
            group_stats.total_work_groups += pass.total_work_groups();
        }
        // Trailing barriers queued after the final dispatch.
        for (barrier_position, barrier) in &barriers {
            if *barrier_position >= passes.len() && !passes.is_empty() {
                Self::record_barrier(recorder, barrier);
                self.stats.barrier_count += 1;
            }
        }

        group_stats.record_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.stats.dispatch_count += group_stats.dispatch_count;
        self.stats.total_work_groups += group_stats.total_work_groups;
        self.stats.record_time_ms += group_stats.record_time_ms;
    }
}

impl Node for MultiDispatchNode {
    fn compile(&mut self, ctx: &mut CompileContext) -> GraphResult<()> {
        self.auto_barriers = ctx
            .instance()
            .get_parameter_value(PARAM_AUTO_BARRIERS, true);
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ExecuteContext) -> GraphResult<()> {
        self.stats = MultiDispatchStats::default();

        let (grouped, ungrouped) = Self::partition(ctx);
        let log_name = ctx.instance_name().to_string();

        let Some(recorder) = ctx.recorder() else {
            log::warn!("{log_name}: no command recorder supplied, skipping dispatch recording");
            return Ok(());
        };

        let frame_start = Instant::now();

        if !grouped.is_empty() || !ungrouped.is_empty() {
            // Accumulated elements supersede the imperative queue this
            // frame: grouped ones in ascending group id, ungrouped
            // appended after.
            for (group_id, passes) in &grouped {
                self.record_group(recorder, Some(*group_id), passes);
            }
            if !ungrouped.is_empty() {
                self.record_group(recorder, None, &ungrouped);
            }
        } else {
            // No accumulated elements: the linear queue is one implicit
            // group.
            self.record_linear(recorder);
        }

        self.stats.record_time_ms = frame_start.elapsed().as_secs_f64() * 1000.0;

        self.clear_queue();
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut CleanupContext) {
        self.clear_queue();
        self.stats = MultiDispatchStats::default();
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
