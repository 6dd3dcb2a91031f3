use std::collections::{HashSet, VecDeque};

use crate::error::{GraphError, GraphResult};
use crate::graph::{Graph, NodeId};

/// Nodes strictly between the tensor `start` and the node producing `end`.
///
/// Forward reachability from the consumers of `start` is intersected with
/// reverse reachability from the producer of `end`; that producer itself is
/// not part of the span. The result follows topological order.
pub fn nodes_between(graph: &Graph, start: &str, end: &str) -> GraphResult<Vec<NodeId>> {
    let end_node = graph.producer_of(end).ok_or_else(|| {
        GraphError::invalid(format!("layer end `{end}` has no producing node"))
    })?;

    let mut downstream: HashSet<NodeId> = HashSet::new();
    let mut queue: VecDeque<NodeId> = graph.consumer_ids(start).into();
    while let Some(id) = queue.pop_front() {
        if !downstream.insert(id) {
            continue;
        }
        let Some(node) = graph.node(id) else {
            continue;
        };
        for output in node.output_names() {
            queue.extend(graph.consumer_ids(output));
        }
    }

    let mut upstream: HashSet<NodeId> = HashSet::new();
    let mut queue: VecDeque<NodeId> = end_node
        .input_names()
        .filter_map(|name| graph.producer_of(name).map(|p| p.id))
        .collect();
    while let Some(id) = queue.pop_front() {
        if !upstream.insert(id) {
            continue;
        }
        let Some(node) = graph.node(id) else {
            continue;
        };
        queue.extend(
            node.input_names()
                .filter_map(|name| graph.producer_of(name).map(|p| p.id)),
        );
    }

    Ok(graph
        .topological_order()?
        .into_iter()
        .filter(|id| *id != end_node.id && downstream.contains(id) && upstream.contains(id))
        .collect())
}
