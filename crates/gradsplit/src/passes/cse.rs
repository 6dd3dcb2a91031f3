use std::collections::HashMap;

use super::{has_effects, is_nondeterministic, GraphPass, PassContext, PassResult};
use crate::error::GraphResult;
use crate::graph::{Graph, NodeId, PassTag};

/// Common-subexpression elimination for deterministic nodes.
///
/// Hashes `(op, domain, inputs, attributes, pass tag, output arity)` in
/// topological order and forwards the outputs of later duplicates to the first
/// occurrence. Recompute duplicates are never merged, and neither is a node
/// whose outputs are declared graph outputs or protected.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommonSubexpressionEliminationPass;

impl CommonSubexpressionEliminationPass {
    const NAME: &'static str = "cse";
}

impl GraphPass for CommonSubexpressionEliminationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, cx: &mut PassContext) -> GraphResult<PassResult> {
        let mut seen: HashMap<Vec<u8>, NodeId> = HashMap::new();
        let mut stats = PassResult::default();

        for id in graph.topological_order()? {
            let Some(node) = graph.node(id) else {
                continue;
            };
            if is_nondeterministic(&node.op_type) || has_effects(node) || node.is_recompute() {
                continue;
            }
            let pinned = node
                .output_names()
                .any(|name| graph.is_output(name) || cx.is_protected(name));

            let arity: Vec<bool> = node.outputs.iter().map(|o| !o.is_empty()).collect();
            let key = (
                &node.op_type,
                &node.domain,
                &node.inputs,
                &node.attributes,
                node.pass == PassTag::Backward,
                &arity,
            );
            let Ok(key_bytes) = bincode::serialize(&key) else {
                continue;
            };

            match seen.get(&key_bytes).copied() {
                Some(existing) if !pinned => {
                    let Some(first) = graph.node(existing) else {
                        continue;
                    };
                    let pairs: Vec<(String, String)> = node
                        .outputs
                        .iter()
                        .zip(first.outputs.iter())
                        .filter(|(dup, _)| !dup.is_empty())
                        .map(|(dup, keep)| (dup.clone(), keep.clone()))
                        .collect();
                    for (dup, keep) in pairs {
                        stats.rewrites_applied += graph.replace_all_uses(&dup, &keep)?;
                    }
                    graph.remove_node(id);
                    stats.erased_nodes += 1;
                    stats.changed = true;
                }
                Some(_) => {}
                None => {
                    seen.insert(key_bytes, id);
                }
            }
        }

        Ok(stats)
    }
}
