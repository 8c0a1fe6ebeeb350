//! Command recording seam.
//!
//! Nodes record GPU commands through [`CommandRecorder`] rather than a
//! raw `vk::CommandBuffer`, so graphs run against [`TraceRecorder`] in
//! tests and against [`VulkanRecorder`] on hardware.

use ash::vk;

/// The command-buffer operations the graph core records.
pub trait CommandRecorder {
    fn bind_compute_pipeline(&mut self, pipeline: vk::Pipeline);

    fn bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );

    fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stage_flags: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );

    fn dispatch(&mut self, x: u32, y: u32, z: u32);

    fn pipeline_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    );

    fn write_timestamp(&mut self, stage: vk::PipelineStageFlags, query_index: u32);
}

/// Real recorder over an ash device and command buffer.
pub struct VulkanRecorder<'a> {
    device: &'a ash::Device,
    command_buffer: vk::CommandBuffer,
    query_pool: vk::QueryPool,
}

impl<'a> VulkanRecorder<'a> {
    pub fn new(device: &'a ash::Device, command_buffer: vk::CommandBuffer) -> Self {
        Self {
            device,
            command_buffer,
            query_pool: vk::QueryPool::null(),
        }
    }

    /// Attach a query pool for timestamp writes.
    pub fn with_query_pool(mut self, query_pool: vk::QueryPool) -> Self {
        self.query_pool = query_pool;
        self
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }
}

impl CommandRecorder for VulkanRecorder<'_> {
    fn bind_compute_pipeline(&mut self, pipeline: vk::Pipeline) {
        unsafe {
            self.device.cmd_bind_pipeline(
                self.command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                pipeline,
            );
        }
    }

    fn bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                layout,
                first_set,
                sets,
                &[],
            );
        }
    }

    fn push_constants(
        &mut self,
        layout: vk::PipelineLayout,
        stage_flags: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.device
                .cmd_push_constants(self.command_buffer, layout, stage_flags, offset, data);
        }
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        unsafe {
            self.device.cmd_dispatch(self.command_buffer, x, y, z);
        }
    }

    fn pipeline_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    fn write_timestamp(&mut self, stage: vk::PipelineStageFlags, query_index: u32) {
        if self.query_pool == vk::QueryPool::null() {
            return;
        }
        unsafe {
            self.device.cmd_write_timestamp(
                self.command_buffer,
                stage,
                self.query_pool,
                query_index,
            );
        }
    }
}

/// No-op recorder, used by `render_frame` when nodes manage their own
/// command buffers.
#[derive(Debug, Default)]
pub struct NullRecorder;

impl CommandRecorder for NullRecorder {
    fn bind_compute_pipeline(&mut self, _pipeline: vk::Pipeline) {}
    fn bind_descriptor_sets(
        &mut self,
        _layout: vk::PipelineLayout,
        _first_set: u32,
        _sets: &[vk::DescriptorSet],
    ) {
    }
    fn push_constants(
        &mut self,
        _layout: vk::PipelineLayout,
        _stage_flags: vk::ShaderStageFlags,
        _offset: u32,
        _data: &[u8],
    ) {
    }
    fn dispatch(&mut self, _x: u32, _y: u32, _z: u32) {}
    fn pipeline_barrier(
        &mut self,
        _src_stage: vk::PipelineStageFlags,
        _dst_stage: vk::PipelineStageFlags,
        _src_access: vk::AccessFlags,
        _dst_access: vk::AccessFlags,
    ) {
    }
    fn write_timestamp(&mut self, _stage: vk::PipelineStageFlags, _query_index: u32) {}
}

/// A recorded command, for inspection.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BindComputePipeline(vk::Pipeline),
    BindDescriptorSets {
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
    },
    PushConstants {
        stage_flags: vk::ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    PipelineBarrier {
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    },
    WriteTimestamp {
        query_index: u32,
    },
}

/// Recorder that captures commands instead of submitting them.
///
/// Backs GPU-less tests the same way a dummy backend does: every call
/// is appended to [`TraceRecorder::commands`] in recording order.
#[derive(Debug, Default)]
pub struct TraceRecorder {
    pub commands: Vec<RecordedCommand>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::Dispatch { .. }))
            .count()
    }

    pub fn barrier_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::PipelineBarrier { .. }))
            .count()
    }

    /// Dispatches in recording order.
    pub fn dispatches(&self) -> Vec<(u32, u32, u32)> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::Dispatch { x, y, z } => Some((*x, *y, *z)),
                _ => None,
            })
            .collect()
    }
}

impl CommandRecorder for TraceRecorder {
    fn bind_compute_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.commands
            .push(RecordedCommand::BindComputePipeline(pipeline));
    }

    fn bind_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.commands.push(RecordedCommand::BindDescriptorSets {
            layout,
            first_set,
            sets: sets.to_vec(),
        });
    }

    fn push_constants(
        &mut self,
        _layout: vk::PipelineLayout,
        stage_flags: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.commands.push(RecordedCommand::PushConstants {
            stage_flags,
            offset,
            data: data.to_vec(),
        });
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.commands.push(RecordedCommand::Dispatch { x, y, z });
    }

    fn pipeline_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        _src_access: vk::AccessFlags,
        _dst_access: vk::AccessFlags,
    ) {
        self.commands.push(RecordedCommand::PipelineBarrier {
            src_stage,
            dst_stage,
        });
    }

    fn write_timestamp(&mut self, _stage: vk::PipelineStageFlags, query_index: u32) {
        self.commands
            .push(RecordedCommand::WriteTimestamp { query_index });
    }
}
