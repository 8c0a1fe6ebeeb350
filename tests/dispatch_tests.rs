//! Group-partitioned multi-dispatch tests.

mod common;

use common::{pass_producer_type, tagged_pass, test_graph};
use vantage_graph::nodes::{multi_dispatch, MultiDispatchNode};
use vantage_graph::{GroupKeyModifier, ParameterValue, TraceRecorder};

/// Scenario: three accumulated passes with group ids {2, 1, 2} are
/// recorded as group 1 first, then group 2 in insertion order, with
/// matching per-group statistics.
#[test]
fn test_group_partitioned_dispatch() {
    let mut graph = test_graph();
    // Work-group x counts tag the passes: 21 and 22 belong to group 2,
    // 11 to group 1.
    graph
        .registry_mut()
        .register(pass_producer_type("PassA", tagged_pass(21, Some(2))));
    graph
        .registry_mut()
        .register(pass_producer_type("PassB", tagged_pass(11, Some(1))));
    graph
        .registry_mut()
        .register(pass_producer_type("PassC", tagged_pass(22, Some(2))));

    let a = graph.add_node("PassA", "a").unwrap();
    let b = graph.add_node("PassB", "b").unwrap();
    let c = graph.add_node("PassC", "c").unwrap();
    let dispatch = graph.add_node("MultiDispatch", "dispatch").unwrap();
    // Auto barriers off so only dispatches land in the trace.
    graph
        .set_parameter(
            dispatch,
            multi_dispatch::PARAM_AUTO_BARRIERS,
            ParameterValue::Bool(false),
        )
        .unwrap();

    for source in [a, b, c] {
        graph
            .connect_nodes_with(
                source,
                0,
                dispatch,
                multi_dispatch::slots::GROUP_INPUTS,
                vec![Box::new(GroupKeyModifier::from_group_id())],
            )
            .unwrap();
    }

    graph.compile().unwrap();

    let mut recorder = TraceRecorder::new();
    graph.execute(&mut recorder).unwrap();

    // Group 1 first, then group 2 preserving insertion order.
    assert_eq!(
        recorder.dispatches(),
        vec![(11, 1, 1), (21, 1, 1), (22, 1, 1)]
    );

    let node = graph.node_as::<MultiDispatchNode>(dispatch).unwrap();
    let stats = node.stats();
    assert_eq!(stats.group_count(), 2);
    assert_eq!(stats.group_stats(1).unwrap().dispatch_count, 1);
    assert_eq!(stats.group_stats(2).unwrap().dispatch_count, 2);
    assert_eq!(stats.dispatch_count, 3);
}

/// When the accumulation slot supplied elements, the imperative
/// `queue_dispatch` queue is not replayed in the same frame; it is
/// still cleared after recording.
#[test]
fn test_accumulated_inputs_supersede_imperative_queue() {
    let mut graph = test_graph();
    graph
        .registry_mut()
        .register(pass_producer_type("Pass", tagged_pass(11, Some(1))));

    let source = graph.add_node("Pass", "p").unwrap();
    let dispatch = graph.add_node("MultiDispatch", "dispatch").unwrap();
    graph
        .set_parameter(
            dispatch,
            multi_dispatch::PARAM_AUTO_BARRIERS,
            ParameterValue::Bool(false),
        )
        .unwrap();
    graph
        .connect_nodes_with(
            source,
            0,
            dispatch,
            multi_dispatch::slots::GROUP_INPUTS,
            vec![Box::new(GroupKeyModifier::from_group_id())],
        )
        .unwrap();

    graph.compile().unwrap();

    graph
        .node_as_mut::<MultiDispatchNode>(dispatch)
        .unwrap()
        .queue_dispatch(tagged_pass(99, None))
        .unwrap();

    let mut recorder = TraceRecorder::new();
    graph.execute(&mut recorder).unwrap();

    // Only the accumulated pass is recorded.
    assert_eq!(recorder.dispatches(), vec![(11, 1, 1)]);

    let node = graph.node_as::<MultiDispatchNode>(dispatch).unwrap();
    assert_eq!(node.queue_size(), 0);
    assert_eq!(node.stats().dispatch_count, 1);
}

/// The modifier rejects non-accumulation targets at connect time.
#[test]
fn test_group_key_modifier_rejects_plain_slot() {
    let mut graph = test_graph();
    graph
        .registry_mut()
        .register(pass_producer_type("Pass", tagged_pass(1, Some(0))));
    let source = graph.add_node("Pass", "p").unwrap();
    let dispatch = graph.add_node("MultiDispatch", "dispatch").unwrap();

    // DESCRIPTOR_SETS is a plain input slot.
    let err = graph
        .connect_nodes_with(
            source,
            0,
            dispatch,
            multi_dispatch::slots::DESCRIPTOR_SETS,
            vec![Box::new(GroupKeyModifier::from_group_id())],
        )
        .unwrap_err();
    assert!(err.to_string().contains("accumulation"));
}

/// Without a group-key modifier, accumulated passes run as one
/// implicit group in insertion order.
#[test]
fn test_ungrouped_accumulation_preserves_order() {
    let mut graph = test_graph();
    graph
        .registry_mut()
        .register(pass_producer_type("PassA", tagged_pass(5, None)));
    graph
        .registry_mut()
        .register(pass_producer_type("PassB", tagged_pass(6, None)));

    let a = graph.add_node("PassA", "a").unwrap();
    let b = graph.add_node("PassB", "b").unwrap();
    let dispatch = graph.add_node("MultiDispatch", "dispatch").unwrap();
    graph
        .set_parameter(
            dispatch,
            multi_dispatch::PARAM_AUTO_BARRIERS,
            ParameterValue::Bool(false),
        )
        .unwrap();

    graph
        .connect_nodes(a, 0, dispatch, multi_dispatch::slots::GROUP_INPUTS)
        .unwrap();
    graph
        .connect_nodes(b, 0, dispatch, multi_dispatch::slots::GROUP_INPUTS)
        .unwrap();

    graph.compile().unwrap();
    let mut recorder = TraceRecorder::new();
    graph.execute(&mut recorder).unwrap();

    assert_eq!(recorder.dispatches(), vec![(5, 1, 1), (6, 1, 1)]);
    let stats = graph
        .node_as::<MultiDispatchNode>(dispatch)
        .unwrap()
        .stats();
    // No group partitioning took place.
    assert_eq!(stats.group_count(), 0);
    assert_eq!(stats.dispatch_count, 2);
}

/// Auto barriers appear between successive dispatches within a group.
#[test]
fn test_auto_barriers_between_group_members() {
    let mut graph = test_graph();
    graph
        .registry_mut()
        .register(pass_producer_type("PassA", tagged_pass(1, Some(0))));
    graph
        .registry_mut()
        .register(pass_producer_type("PassB", tagged_pass(2, Some(0))));

    let a = graph.add_node("PassA", "a").unwrap();
    let b = graph.add_node("PassB", "b").unwrap();
    let dispatch = graph.add_node("MultiDispatch", "dispatch").unwrap();

    for source in [a, b] {
        graph
            .connect_nodes_with(
                source,
                0,
                dispatch,
                multi_dispatch::slots::GROUP_INPUTS,
                vec![Box::new(GroupKeyModifier::from_group_id())],
            )
            .unwrap();
    }

    graph.compile().unwrap();
    let mut recorder = TraceRecorder::new();
    graph.execute(&mut recorder).unwrap();

    assert_eq!(recorder.dispatch_count(), 2);
    assert_eq!(recorder.barrier_count(), 1);
}
