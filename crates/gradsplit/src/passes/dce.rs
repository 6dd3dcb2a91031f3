use std::collections::HashSet;

use super::{has_effects, GraphPass, PassContext, PassResult};
use crate::error::GraphResult;
use crate::graph::{Graph, NodeId};

/// Removes nodes whose outputs never reach a graph output.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeadNodeEliminationPass;

impl DeadNodeEliminationPass {
    const NAME: &'static str = "dead_node_elimination";
}

impl GraphPass for DeadNodeEliminationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, cx: &mut PassContext) -> GraphResult<PassResult> {
        let mut worklist: Vec<String> = graph.outputs().to_vec();
        for node in graph.nodes() {
            if has_effects(node) || node.output_names().any(|name| cx.is_protected(name)) {
                worklist.extend(node.input_names().map(str::to_string));
            }
        }

        let mut live: HashSet<String> = HashSet::new();
        while let Some(name) = worklist.pop() {
            if !live.insert(name.clone()) {
                continue;
            }
            let Some(producer) = graph.producer_of(&name) else {
                continue;
            };
            worklist.extend(producer.input_names().map(str::to_string));
        }

        let dead: Vec<NodeId> = graph
            .nodes()
            .filter(|node| !has_effects(node))
            .filter(|node| !node.output_names().any(|name| live.contains(name)))
            .filter(|node| !node.output_names().any(|name| cx.is_protected(name)))
            .map(|node| node.id)
            .collect();
        for id in &dead {
            graph.remove_node(*id);
        }

        Ok(PassResult {
            changed: !dead.is_empty(),
            erased_nodes: dead.len(),
            ..PassResult::default()
        })
    }
}
