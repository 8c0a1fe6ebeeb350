//! Descriptor orchestration tests: gatherer reconciliation, descriptor
//! set creation and the full compute chain.

mod common;

use ash::vk::{self, Handle};

use common::{
    buffer_producer_type, bundle_producer_type, compute_bundle_single_image,
    compute_bundle_two_buffers, image_producer_type, tagged_pass, test_graph,
};
use vantage_graph::nodes::{
    descriptor_set, gatherer, multi_dispatch, DescriptorSetNode, GatheredResource,
    MultiDispatchNode,
};
use vantage_graph::{
    BindingRef, DescriptorHandle, GraphError, NodeState, PushConstantData, RecordedCommand,
    ResourceUsage, SlotRole, TraceRecorder, VariadicSlotState,
};

const IMAGE_HANDLE: u64 = 0xA11CE;

/// Scenario: image producer -> gatherer -> descriptor set ->
/// multi-dispatch, one storage-image binding. Compile succeeds and a
/// frame records exactly one dispatch.
#[test]
fn test_simple_compute_chain() {
    let mut graph = test_graph();
    graph
        .registry_mut()
        .register(image_producer_type(IMAGE_HANDLE));
    graph
        .registry_mut()
        .register(bundle_producer_type(compute_bundle_single_image()));

    let image = graph.add_node("ImageProducer", "image").unwrap();
    let bundle = graph.add_node("BundleProducer", "bundle").unwrap();
    let gather = graph
        .add_node("DescriptorResourceGatherer", "gather")
        .unwrap();
    let sets = graph.add_node("DescriptorSet", "sets").unwrap();
    let dispatch = graph.add_node("MultiDispatch", "dispatch").unwrap();

    graph
        .pre_register_variadic_slots(
            gather,
            &[BindingRef::new(
                0,
                vk::DescriptorType::STORAGE_IMAGE,
                "outputImage",
            )],
        )
        .unwrap();

    graph
        .connect_nodes(bundle, 0, gather, gatherer::slots::SHADER_DATA_BUNDLE)
        .unwrap();
    graph
        .connect_variadic(image, 0, gather, 0, SlotRole::DEPENDENCY)
        .unwrap();
    graph
        .connect_nodes(
            gather,
            gatherer::slots::DESCRIPTOR_RESOURCES,
            sets,
            descriptor_set::slots::DESCRIPTOR_RESOURCES,
        )
        .unwrap();
    graph
        .connect_nodes(
            gather,
            gatherer::slots::SHADER_DATA_BUNDLE_OUT,
            sets,
            descriptor_set::slots::SHADER_DATA_BUNDLE,
        )
        .unwrap();
    graph
        .connect_nodes(
            sets,
            descriptor_set::slots::DESCRIPTOR_SETS,
            dispatch,
            multi_dispatch::slots::DESCRIPTOR_SETS,
        )
        .unwrap();

    graph.compile().unwrap();
    for handle in [image, bundle, gather, sets, dispatch] {
        assert_eq!(
            graph.instance(handle).unwrap().state,
            NodeState::Ready,
            "{} not ready",
            graph.instance(handle).unwrap().name
        );
    }

    // Queue one compute pass and execute on a trace recorder.
    let params = 0.5f32;
    graph
        .node_as_mut::<MultiDispatchNode>(dispatch)
        .unwrap()
        .queue_dispatch(
            tagged_pass(4, None).with_push_constants(PushConstantData::from_pod(&params)),
        )
        .unwrap();

    let mut recorder = TraceRecorder::new();
    graph.execute(&mut recorder).unwrap();
    assert_eq!(recorder.dispatch_count(), 1);
    assert_eq!(recorder.dispatches(), vec![(4, 1, 1)]);

    // The pass's push constants were recorded before its dispatch.
    let pushed = recorder
        .commands
        .iter()
        .find_map(|command| match command {
            RecordedCommand::PushConstants { data, .. } => Some(data.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(pushed, bytemuck::bytes_of(&params));
}

/// Scenario: pre-registration order does not matter; slots associate by
/// binding, not argument order.
#[test]
fn test_order_agnostic_pre_registration() {
    let mut graph = test_graph();
    graph
        .registry_mut()
        .register(bundle_producer_type(compute_bundle_two_buffers()));
    graph.registry_mut().register(buffer_producer_type(
        "UniformProducer",
        0x11,
        ResourceUsage::UNIFORM_BUFFER,
    ));
    graph.registry_mut().register(buffer_producer_type(
        "StorageProducer",
        0x22,
        ResourceUsage::STORAGE_BUFFER,
    ));

    let bundle = graph.add_node("BundleProducer", "bundle").unwrap();
    let uniform = graph.add_node("UniformProducer", "uniform").unwrap();
    let storage = graph.add_node("StorageProducer", "storage").unwrap();
    let gather = graph
        .add_node("DescriptorResourceGatherer", "gather")
        .unwrap();

    // Declared in reverse binding order on purpose.
    graph
        .pre_register_variadic_slots(
            gather,
            &[
                BindingRef::new(1, vk::DescriptorType::STORAGE_BUFFER, "b"),
                BindingRef::new(0, vk::DescriptorType::UNIFORM_BUFFER, "u"),
            ],
        )
        .unwrap();

    graph
        .connect_nodes(bundle, 0, gather, gatherer::slots::SHADER_DATA_BUNDLE)
        .unwrap();
    graph
        .connect_variadic(storage, 0, gather, 1, SlotRole::DEPENDENCY)
        .unwrap();
    graph
        .connect_variadic(uniform, 0, gather, 0, SlotRole::DEPENDENCY)
        .unwrap();

    graph.compile().unwrap();

    // Each slot validated against its own binding.
    let instance = graph.instance(gather).unwrap();
    for slot in &instance.variadic_slots {
        assert_eq!(slot.state, VariadicSlotState::Validated, "{slot:?}");
        let expected = match slot.binding {
            0 => vk::DescriptorType::UNIFORM_BUFFER,
            1 => vk::DescriptorType::STORAGE_BUFFER,
            other => panic!("unexpected binding {other}"),
        };
        assert_eq!(slot.descriptor_type, expected);
    }

    // The gathered array is binding-indexed.
    let gathered = gathered_output(&graph, gather);
    assert_eq!(gathered.len(), 2);
    assert!(
        matches!(&gathered[0].handle, DescriptorHandle::Buffer(b) if b.as_raw() == 0x11),
        "{:?}",
        gathered[0]
    );
    assert!(
        matches!(&gathered[1].handle, DescriptorHandle::Buffer(b) if b.as_raw() == 0x22),
        "{:?}",
        gathered[1]
    );
}

/// Round trip: the output array at a binding carries the descriptor
/// handle of the resource wired to that binding's slot.
#[test]
fn test_round_trip_gathering() {
    let (graph, gather) = compile_single_image_chain();
    let gathered = gathered_output(&graph, gather);
    assert_eq!(gathered.len(), 1);
    assert!(
        matches!(&gathered[0].handle, DescriptorHandle::ImageView(v) if v.as_raw() == IMAGE_HANDLE)
    );
}

/// Validation monotonicity: extra pre-registered slots without a shader
/// binding are marked Invalid and excluded from the output, without
/// failing compilation.
#[test]
fn test_stale_pre_registration_marked_invalid() {
    let mut graph = test_graph();
    graph
        .registry_mut()
        .register(image_producer_type(IMAGE_HANDLE));
    graph
        .registry_mut()
        .register(bundle_producer_type(compute_bundle_single_image()));

    let image = graph.add_node("ImageProducer", "image").unwrap();
    let bundle = graph.add_node("BundleProducer", "bundle").unwrap();
    let gather = graph
        .add_node("DescriptorResourceGatherer", "gather")
        .unwrap();

    graph
        .pre_register_variadic_slots(
            gather,
            &[
                BindingRef::new(0, vk::DescriptorType::STORAGE_IMAGE, "outputImage"),
                // Stale: the shader has no binding 7.
                BindingRef::new(7, vk::DescriptorType::UNIFORM_BUFFER, "legacy"),
            ],
        )
        .unwrap();
    graph
        .connect_nodes(bundle, 0, gather, gatherer::slots::SHADER_DATA_BUNDLE)
        .unwrap();
    graph
        .connect_variadic(image, 0, gather, 0, SlotRole::DEPENDENCY)
        .unwrap();

    graph.compile().unwrap();

    let instance = graph.instance(gather).unwrap();
    let stale = instance
        .variadic_slots
        .iter()
        .find(|slot| slot.binding == 7)
        .unwrap();
    assert_eq!(stale.state, VariadicSlotState::Invalid);

    // Output sized to the shader's max binding; the stale slot never
    // appears.
    let gathered = gathered_output(&graph, gather);
    assert_eq!(gathered.len(), 1);
    assert_eq!(instance.state, NodeState::Ready);
}

/// Shader descriptor type is authoritative over a mismatched
/// pre-registration.
#[test]
fn test_shader_type_overrides_pre_registration() {
    let mut graph = test_graph();
    graph
        .registry_mut()
        .register(image_producer_type(IMAGE_HANDLE));
    graph
        .registry_mut()
        .register(bundle_producer_type(compute_bundle_single_image()));

    let image = graph.add_node("ImageProducer", "image").unwrap();
    let bundle = graph.add_node("BundleProducer", "bundle").unwrap();
    let gather = graph
        .add_node("DescriptorResourceGatherer", "gather")
        .unwrap();

    // Pre-registered with the wrong type; the shader says storage
    // image.
    graph
        .pre_register_variadic_slots(
            gather,
            &[BindingRef::new(
                0,
                vk::DescriptorType::SAMPLED_IMAGE,
                "outputImage",
            )],
        )
        .unwrap();
    graph
        .connect_nodes(bundle, 0, gather, gatherer::slots::SHADER_DATA_BUNDLE)
        .unwrap();
    graph
        .connect_variadic(image, 0, gather, 0, SlotRole::DEPENDENCY)
        .unwrap();

    graph.compile().unwrap();

    let slot = &graph.instance(gather).unwrap().variadic_slots[0];
    assert_eq!(slot.descriptor_type, vk::DescriptorType::STORAGE_IMAGE);
    assert_eq!(slot.state, VariadicSlotState::Validated);
}

#[test]
fn test_missing_bundle_fails_gatherer() {
    let mut graph = test_graph();
    let gather = graph
        .add_node("DescriptorResourceGatherer", "gather")
        .unwrap();
    // Required bundle input unconnected: build-time validation error.
    let err = graph.compile().unwrap_err();
    assert!(matches!(err, GraphError::MissingRequiredInput { .. }));
    let _ = gather;
}

#[test]
fn test_bundle_without_layout_fails_node() {
    let mut graph = test_graph();
    graph.registry_mut().register(bundle_producer_type(
        vantage_graph::ShaderDataBundle::new("layoutless"),
    ));
    let bundle = graph.add_node("BundleProducer", "bundle").unwrap();
    let gather = graph
        .add_node("DescriptorResourceGatherer", "gather")
        .unwrap();
    graph
        .connect_nodes(bundle, 0, gather, gatherer::slots::SHADER_DATA_BUNDLE)
        .unwrap();

    graph.compile().unwrap();
    let instance = graph.instance(gather).unwrap();
    assert_eq!(instance.state, NodeState::Failed);
    assert!(instance
        .diagnostic
        .as_deref()
        .unwrap()
        .contains("descriptor layout"));
}

#[test]
fn test_descriptor_set_node_outputs() {
    let (graph, _) = compile_single_image_chain_with_sets();
    let sets_handle = graph.handle_by_name("sets").unwrap();
    let node = graph.node_as::<DescriptorSetNode>(sets_handle).unwrap();
    assert_eq!(node.descriptor_sets().len(), 1);

    let instance = graph.instance(sets_handle).unwrap();
    for output in &instance.outputs {
        assert!(output.is_some());
    }
}

/// Push constants: whole-struct copies and field extractions land at
/// their declared offsets, per range, stage-tagged.
#[test]
fn test_push_constant_packing() {
    use vantage_graph::nodes::push_constants;
    use vantage_graph::PushConstantRange;

    #[repr(C)]
    #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    struct FieldSource {
        header: u32,
        payload: [u8; 4],
    }

    let whole_bytes = bytemuck::bytes_of(&[1u8, 2, 3, 4]).to_vec();
    let field_source = FieldSource {
        header: 0xDDCC_BBAA,
        payload: [9, 8, 7, 6],
    };
    let field_bytes = push_constants::pod_bytes(&field_source);

    let mut graph = test_graph();
    let bundle = vantage_graph::ShaderDataBundle::new("pc").with_push_constants(vec![
        PushConstantRange {
            name: "params".into(),
            offset: 0,
            size: 8,
            stage_flags: vk::ShaderStageFlags::COMPUTE,
        },
    ]);
    graph.registry_mut().register(bundle_producer_type(bundle));
    graph
        .registry_mut()
        .register(common::bytes_producer_type("WholeStruct", whole_bytes));
    graph
        .registry_mut()
        .register(common::bytes_producer_type(
            "FieldSource",
            (*field_bytes).clone(),
        ));

    let bundle = graph.add_node("BundleProducer", "bundle").unwrap();
    let whole = graph.add_node("WholeStruct", "whole").unwrap();
    let field = graph.add_node("FieldSource", "field").unwrap();
    let gather = graph.add_node("PushConstantGatherer", "pc_gather").unwrap();

    graph
        .connect_nodes(bundle, 0, gather, push_constants::slots::SHADER_DATA_BUNDLE)
        .unwrap();
    // Whole struct copied to destination offset 0.
    graph
        .connect_variadic(whole, 0, gather, 0, SlotRole::DEPENDENCY)
        .unwrap();
    // Last four bytes of the second struct extracted to offset 4.
    graph
        .connect_variadic(field, 0, gather, 4, SlotRole::DEPENDENCY)
        .unwrap();
    {
        let instance = graph.instance_mut(gather).unwrap();
        let slot = instance
            .variadic_slots
            .iter_mut()
            .find(|slot| slot.binding == 4)
            .unwrap();
        slot.has_field_extraction = true;
        slot.field_offset = 4;
        slot.field_size = 4;
    }

    graph.compile().unwrap();
    assert_eq!(graph.instance(gather).unwrap().state, NodeState::Ready);

    let handle = graph.instance(gather).unwrap().outputs
        [push_constants::slots::PUSH_CONSTANT_DATA as usize]
        .unwrap();
    let packed = graph
        .resources()
        .get(handle)
        .unwrap()
        .payload::<Vec<vantage_graph::PushConstantData>>()
        .unwrap();

    assert_eq!(packed.len(), 1);
    assert_eq!(packed[0].stage_flags, vk::ShaderStageFlags::COMPUTE);
    assert_eq!(packed[0].offset, 0);

    let mut expected = vec![1, 2, 3, 4];
    expected.extend_from_slice(&field_bytes[4..8]);
    assert_eq!(packed[0].data, expected);
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

fn compile_single_image_chain() -> (vantage_graph::Graph, vantage_graph::NodeHandle) {
    let mut graph = test_graph();
    graph
        .registry_mut()
        .register(image_producer_type(IMAGE_HANDLE));
    graph
        .registry_mut()
        .register(bundle_producer_type(compute_bundle_single_image()));

    let image = graph.add_node("ImageProducer", "image").unwrap();
    let bundle = graph.add_node("BundleProducer", "bundle").unwrap();
    let gather = graph
        .add_node("DescriptorResourceGatherer", "gather")
        .unwrap();

    graph
        .pre_register_variadic_slots(
            gather,
            &[BindingRef::new(
                0,
                vk::DescriptorType::STORAGE_IMAGE,
                "outputImage",
            )],
        )
        .unwrap();
    graph
        .connect_nodes(bundle, 0, gather, gatherer::slots::SHADER_DATA_BUNDLE)
        .unwrap();
    graph
        .connect_variadic(image, 0, gather, 0, SlotRole::DEPENDENCY)
        .unwrap();

    graph.compile().unwrap();
    (graph, gather)
}

fn compile_single_image_chain_with_sets() -> (vantage_graph::Graph, vantage_graph::NodeHandle) {
    let mut graph = test_graph();
    graph
        .registry_mut()
        .register(image_producer_type(IMAGE_HANDLE));
    graph
        .registry_mut()
        .register(bundle_producer_type(compute_bundle_single_image()));

    let image = graph.add_node("ImageProducer", "image").unwrap();
    let bundle = graph.add_node("BundleProducer", "bundle").unwrap();
    let gather = graph
        .add_node("DescriptorResourceGatherer", "gather")
        .unwrap();
    let sets = graph.add_node("DescriptorSet", "sets").unwrap();

    graph
        .pre_register_variadic_slots(
            gather,
            &[BindingRef::new(
                0,
                vk::DescriptorType::STORAGE_IMAGE,
                "outputImage",
            )],
        )
        .unwrap();
    graph
        .connect_nodes(bundle, 0, gather, gatherer::slots::SHADER_DATA_BUNDLE)
        .unwrap();
    graph
        .connect_variadic(image, 0, gather, 0, SlotRole::DEPENDENCY)
        .unwrap();
    graph
        .connect_nodes(gather, 0, sets, descriptor_set::slots::DESCRIPTOR_RESOURCES)
        .unwrap();
    graph
        .connect_nodes(gather, 1, sets, descriptor_set::slots::SHADER_DATA_BUNDLE)
        .unwrap();

    graph.compile().unwrap();
    (graph, gather)
}

fn gathered_output(
    graph: &vantage_graph::Graph,
    gather: vantage_graph::NodeHandle,
) -> Vec<GatheredResource> {
    let handle = graph.instance(gather).unwrap().outputs
        [gatherer::slots::DESCRIPTOR_RESOURCES as usize]
        .unwrap();
    let resource = graph.resources().get(handle).unwrap();
    (*resource.payload::<Vec<GatheredResource>>().unwrap()).clone()
}
