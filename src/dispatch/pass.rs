//! Compute dispatch descriptors and statistics.

use std::collections::BTreeMap;

use ash::vk;
use glam::UVec3;

/// Push constant bytes and metadata for one dispatch.
#[derive(Debug, Clone, Default)]
pub struct PushConstantData {
    pub data: Vec<u8>,
    pub stage_flags: vk::ShaderStageFlags,
    /// Byte offset in the push constant range.
    pub offset: u32,
}

impl PushConstantData {
    pub fn compute(data: Vec<u8>) -> Self {
        Self {
            data,
            stage_flags: vk::ShaderStageFlags::COMPUTE,
            offset: 0,
        }
    }

    /// Byte-cast a plain-old-data value into compute-stage push
    /// constants.
    pub fn from_pod<T: bytemuck::NoUninit>(value: &T) -> Self {
        Self::compute(bytemuck::bytes_of(value).to_vec())
    }

    pub fn with_stages(mut self, stage_flags: vk::ShaderStageFlags) -> Self {
        self.stage_flags = stage_flags;
        self
    }
}

/// Everything needed to record one `vkCmdDispatch`.
#[derive(Debug, Clone, Default)]
pub struct DispatchPass {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,

    pub descriptor_sets: Vec<vk::DescriptorSet>,
    pub first_set: u32,

    pub push_constants: Option<PushConstantData>,

    pub work_group_count: UVec3,

    pub debug_name: String,

    /// When set, this pass belongs to a group for partitioned recording.
    pub group_id: Option<u32>,
}

impl DispatchPass {
    pub fn new(pipeline: vk::Pipeline, layout: vk::PipelineLayout, work_groups: UVec3) -> Self {
        Self {
            pipeline,
            layout,
            work_group_count: work_groups,
            ..Default::default()
        }
    }

    pub fn with_descriptor_sets(mut self, sets: Vec<vk::DescriptorSet>, first_set: u32) -> Self {
        self.descriptor_sets = sets;
        self.first_set = first_set;
        self
    }

    pub fn with_push_constants(mut self, push_constants: PushConstantData) -> Self {
        self.push_constants = Some(push_constants);
        self
    }

    pub fn with_group(mut self, group_id: u32) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.debug_name = name.into();
        self
    }

    pub fn is_valid(&self) -> bool {
        self.pipeline != vk::Pipeline::null()
            && self.layout != vk::PipelineLayout::null()
            && self.work_group_count.x > 0
            && self.work_group_count.y > 0
            && self.work_group_count.z > 0
    }

    pub fn total_work_groups(&self) -> u64 {
        self.work_group_count.x as u64
            * self.work_group_count.y as u64
            * self.work_group_count.z as u64
    }
}

/// Explicit synchronization point between dispatches.
#[derive(Debug, Clone, Default)]
pub struct DispatchBarrier {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

impl DispatchBarrier {
    /// Conservative compute-to-compute memory barrier covering UAV
    /// read-after-write hazards.
    pub fn compute_uav() -> Self {
        Self {
            src_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
            dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
            src_access: vk::AccessFlags::SHADER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        }
    }
}

/// Per-group recording statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GroupDispatchStats {
    pub dispatch_count: u32,
    pub total_work_groups: u64,
    pub record_time_ms: f64,
}

/// Aggregate statistics for one multi-dispatch recording.
#[derive(Debug, Clone, Default)]
pub struct MultiDispatchStats {
    pub dispatch_count: u32,
    pub barrier_count: u32,
    pub total_work_groups: u64,
    pub record_time_ms: f64,

    /// Per-group breakdown; empty when no group partitioning was used.
    pub group_stats: BTreeMap<u32, GroupDispatchStats>,
}

impl MultiDispatchStats {
    pub fn group_count(&self) -> u32 {
        self.group_stats.len() as u32
    }

    pub fn group_stats(&self, group_id: u32) -> Option<&GroupDispatchStats> {
        self.group_stats.get(&group_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_pass_validity() {
        let pass = DispatchPass::default();
        assert!(!pass.is_valid());

        let pass = DispatchPass::new(
            vk::Pipeline::from_raw(1),
            vk::PipelineLayout::from_raw(2),
            UVec3::new(8, 8, 1),
        );
        assert!(pass.is_valid());

        let zero_groups = DispatchPass::new(
            vk::Pipeline::from_raw(1),
            vk::PipelineLayout::from_raw(2),
            UVec3::new(8, 0, 1),
        );
        assert!(!zero_groups.is_valid());
    }

    #[test]
    fn test_push_constants_from_pod() {
        #[repr(C)]
        #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
        struct Params {
            scale: f32,
            iterations: u32,
        }

        let params = Params {
            scale: 0.5,
            iterations: 7,
        };
        let push_constants = PushConstantData::from_pod(&params);
        assert_eq!(push_constants.data, bytemuck::bytes_of(&params));
        assert_eq!(push_constants.stage_flags, vk::ShaderStageFlags::COMPUTE);
        assert_eq!(push_constants.offset, 0);
    }

    #[test]
    fn test_total_work_groups() {
        let pass = DispatchPass::new(
            vk::Pipeline::from_raw(1),
            vk::PipelineLayout::from_raw(2),
            UVec3::new(4, 4, 2),
        );
        assert_eq!(pass.total_work_groups(), 32);
    }

    #[test]
    fn test_group_stats_lookup() {
        let mut stats = MultiDispatchStats::default();
        stats.group_stats.insert(
            3,
            GroupDispatchStats {
                dispatch_count: 2,
                total_work_groups: 16,
                record_time_ms: 0.1,
            },
        );
        assert_eq!(stats.group_count(), 1);
        assert_eq!(stats.group_stats(3).unwrap().dispatch_count, 2);
        assert!(stats.group_stats(4).is_none());
    }
}
