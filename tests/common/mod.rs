//! Shared helpers for the integration tests: small producer node types
//! and shader bundle builders.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::any::Any;
use std::sync::Arc;

use ash::vk::{self, Handle};
use glam::UVec3;

use vantage_graph::nodes::register_builtin_nodes;
use vantage_graph::{
    CompileContext, DescriptorBindingSpec, DescriptorHandle, DescriptorLayoutSpec, DispatchPass,
    Graph, GraphResult, ImageDescription, Node, NodeType, NodeTypeRegistry, NullDevice, Resource,
    ResourceDescription, ResourceKind, ResourceLifetime, ResourceUsage, SetupContext,
    ShaderDataBundle, SlotSchema,
};

/// Node producing a storage image with a fabricated image view handle.
pub struct ImageProducer {
    raw_handle: u64,
}

impl Node for ImageProducer {
    fn setup(&mut self, ctx: &mut SetupContext) -> GraphResult<()> {
        let mut resource = Resource::create(
            ResourceKind::StorageImage,
            ResourceLifetime::Transient,
            ResourceDescription::Image(ImageDescription::new_2d(
                64,
                64,
                vk::Format::R8G8B8A8_UNORM,
                ResourceUsage::STORAGE,
            )),
        );
        resource.set_handle(DescriptorHandle::ImageView(vk::ImageView::from_raw(
            self.raw_handle,
        )));
        ctx.set_output_resource(0, resource);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub fn image_producer_type(raw_handle: u64) -> NodeType {
    NodeType::new("ImageProducer", move |_| {
        Box::new(ImageProducer { raw_handle })
    })
    .with_outputs(vec![SlotSchema::required("image")])
}

/// Node producing a buffer resource with the given usage and handle.
pub struct BufferProducer {
    raw_handle: u64,
    usage: ResourceUsage,
}

impl Node for BufferProducer {
    fn setup(&mut self, ctx: &mut SetupContext) -> GraphResult<()> {
        let mut resource = Resource::create(
            ResourceKind::Buffer,
            ResourceLifetime::Persistent,
            ResourceDescription::Buffer(vantage_graph::BufferDescription::new(256, self.usage)),
        );
        resource.set_handle(DescriptorHandle::Buffer(vk::Buffer::from_raw(
            self.raw_handle,
        )));
        ctx.set_output_resource(0, resource);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub fn buffer_producer_type(name: &str, raw_handle: u64, usage: ResourceUsage) -> NodeType {
    NodeType::new(name, move |_| {
        Box::new(BufferProducer { raw_handle, usage })
    })
    .with_outputs(vec![SlotSchema::required("buffer")])
}

/// Node producing a raw byte payload for push-constant gathering.
pub struct BytesProducer {
    bytes: Vec<u8>,
}

impl Node for BytesProducer {
    fn setup(&mut self, ctx: &mut SetupContext) -> GraphResult<()> {
        let mut resource = Resource::create(
            ResourceKind::Opaque,
            ResourceLifetime::Persistent,
            ResourceDescription::Handle(vantage_graph::types::HandleDescription::new("bytes")),
        );
        resource.set_handle(DescriptorHandle::Bytes(Arc::new(self.bytes.clone())));
        ctx.set_output_resource(0, resource);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub fn bytes_producer_type(name: &str, bytes: Vec<u8>) -> NodeType {
    NodeType::new(name, move |_| {
        Box::new(BytesProducer {
            bytes: bytes.clone(),
        })
    })
    .with_outputs(vec![SlotSchema::required("bytes")])
}

/// Node handing a prebuilt shader bundle downstream.
pub struct BundleProducer {
    bundle: ShaderDataBundle,
}

impl Node for BundleProducer {
    fn compile(&mut self, ctx: &mut CompileContext) -> GraphResult<()> {
        ctx.set_output_payload(0, "ShaderDataBundle", self.bundle.clone());
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub fn bundle_producer_type(bundle: ShaderDataBundle) -> NodeType {
    NodeType::new("BundleProducer", move |_| {
        Box::new(BundleProducer {
            bundle: bundle.clone(),
        })
    })
    .with_outputs(vec![SlotSchema::required("bundle")])
}

/// Node producing one dispatch pass for accumulation inputs.
pub struct PassProducer {
    pass: DispatchPass,
}

impl Node for PassProducer {
    fn compile(&mut self, ctx: &mut CompileContext) -> GraphResult<()> {
        ctx.set_output_payload(0, "DispatchPass", self.pass.clone());
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub fn pass_producer_type(name: &str, pass: DispatchPass) -> NodeType {
    NodeType::new(name, move |_| {
        Box::new(PassProducer { pass: pass.clone() })
    })
    .with_outputs(vec![SlotSchema::required("pass")])
}

/// A dispatch pass distinguishable by its x work-group count.
pub fn tagged_pass(tag: u32, group_id: Option<u32>) -> DispatchPass {
    let mut pass = DispatchPass::new(
        vk::Pipeline::from_raw(0x100),
        vk::PipelineLayout::from_raw(0x200),
        UVec3::new(tag, 1, 1),
    );
    pass.group_id = group_id;
    pass
}

/// Bundle with a single storage-image binding at binding 0.
pub fn compute_bundle_single_image() -> ShaderDataBundle {
    let mut layout = DescriptorLayoutSpec::new();
    layout.add_binding(
        DescriptorBindingSpec::new(0, vk::DescriptorType::STORAGE_IMAGE, "outputImage")
            .with_stages(vk::ShaderStageFlags::COMPUTE),
    );
    ShaderDataBundle::new("compute_test").with_layout(layout)
}

/// Bundle with a uniform buffer at binding 0 and a storage buffer at
/// binding 1.
pub fn compute_bundle_two_buffers() -> ShaderDataBundle {
    let mut layout = DescriptorLayoutSpec::new();
    layout.add_binding(
        DescriptorBindingSpec::new(0, vk::DescriptorType::UNIFORM_BUFFER, "u")
            .with_stages(vk::ShaderStageFlags::COMPUTE),
    );
    layout.add_binding(
        DescriptorBindingSpec::new(1, vk::DescriptorType::STORAGE_BUFFER, "b")
            .with_stages(vk::ShaderStageFlags::COMPUTE),
    );
    ShaderDataBundle::new("two_buffers").with_layout(layout)
}

/// Graph with the built-in node types registered and a null device.
pub fn test_graph() -> Graph {
    let mut registry = NodeTypeRegistry::new();
    register_builtin_nodes(&mut registry);
    let mut graph = Graph::new(registry);
    graph.add_device(Arc::new(NullDevice::new()));
    graph
}
