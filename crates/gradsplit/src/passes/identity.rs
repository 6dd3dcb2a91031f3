use super::{GraphPass, PassContext, PassResult};
use crate::error::GraphResult;
use crate::graph::{Graph, NodeId};

/// Forwards consumers of an `Identity` output to its input and drops the node.
///
/// Identities whose output is a declared graph output or a protected name are
/// left alone, as are identities that would cross from one pass tag to the
/// other.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityEliminationPass;

impl IdentityEliminationPass {
    const NAME: &'static str = "identity_elimination";
}

impl GraphPass for IdentityEliminationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, cx: &mut PassContext) -> GraphResult<PassResult> {
        let candidates: Vec<NodeId> = graph
            .nodes()
            .filter(|node| node.op_type == "Identity" && node.domain.is_empty())
            .map(|node| node.id)
            .collect();

        let mut result = PassResult::default();
        for id in candidates {
            // Re-read: an earlier elimination may have rewired this node's input.
            let Some(node) = graph.node(id) else {
                continue;
            };
            if node.inputs.len() != 1 || node.outputs.len() != 1 {
                continue;
            }
            let (source, target, tag) = (node.inputs[0].clone(), node.outputs[0].clone(), node.pass);
            if source.is_empty()
                || target.is_empty()
                || graph.is_output(&target)
                || cx.is_protected(&target)
            {
                continue;
            }
            let consumers = graph.consumer_ids(&target);
            let crosses = consumers
                .iter()
                .filter_map(|consumer| graph.node(*consumer))
                .any(|consumer| consumer.pass != tag);
            if crosses {
                continue;
            }
            result.rewrites_applied += graph.replace_all_uses(&target, &source)?;
            graph.remove_node(id);
            result.erased_nodes += 1;
            result.changed = true;
        }
        Ok(result)
    }
}
