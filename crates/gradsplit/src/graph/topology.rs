use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use super::node::NodeId;
use super::Graph;
use crate::error::{GraphError, GraphResult};

/// Ready-set ordering used by Kahn's algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadyOrder {
    /// Smallest node id first.
    ById,
    /// Highest priority first, then smallest node id.
    ByPriority,
}

pub(crate) fn kahn(graph: &Graph, order: ReadyOrder) -> GraphResult<Vec<NodeId>> {
    let mut indegree: HashMap<NodeId, usize> = HashMap::with_capacity(graph.len());
    let mut successors: HashMap<NodeId, BTreeSet<NodeId>> = HashMap::with_capacity(graph.len());

    for node in graph.nodes() {
        let preds: BTreeSet<NodeId> = node
            .input_names()
            .filter_map(|name| graph.indices().producer(name))
            .collect();
        indegree.insert(node.id, preds.len());
        for pred in preds {
            successors.entry(pred).or_default().insert(node.id);
        }
    }

    let key = |id: NodeId| -> (i32, Reverse<NodeId>) {
        let priority = match order {
            ReadyOrder::ById => 0,
            ReadyOrder::ByPriority => graph.node(id).map(|n| n.priority).unwrap_or(0),
        };
        (priority, Reverse(id))
    };

    let mut ready: BinaryHeap<(i32, Reverse<NodeId>)> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| key(*id))
        .collect();

    let mut sorted = Vec::with_capacity(graph.len());
    while let Some((_, Reverse(id))) = ready.pop() {
        sorted.push(id);
        let Some(next) = successors.get(&id) else {
            continue;
        };
        for succ in next {
            if let Some(degree) = indegree.get_mut(succ) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(key(*succ));
                }
            }
        }
    }

    if sorted.len() != graph.len() {
        let mut stuck: Vec<NodeId> = indegree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(id, _)| id)
            .collect();
        stuck.sort();
        let nodes = stuck
            .into_iter()
            .filter_map(|id| graph.node(id).map(|n| n.name.clone()))
            .collect();
        return Err(GraphError::CycleDetected { nodes });
    }

    Ok(sorted)
}
