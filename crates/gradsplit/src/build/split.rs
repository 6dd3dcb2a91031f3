//! Partition of a combined gradient graph into forward and backward graphs.

use std::collections::HashSet;

use tracing::debug;

use super::SplitGraphsInfo;
use crate::error::{GraphError, GraphResult};
use crate::graph::{Graph, Node, NodeId};

/// Splits `combined` by pass tag.
///
/// The forward graph takes the user inputs and trainable initializers and
/// returns the user outputs followed by every activation a backward node
/// reads. The backward graph takes, in order, the user inputs it reads, the
/// trainable initializers it reads, those activations, the user outputs it
/// reads and the output gradients the host feeds. `info` is updated only when
/// both graphs resolve.
pub fn split_graph(combined: &Graph, info: &mut SplitGraphsInfo) -> GraphResult<(Graph, Graph)> {
    let order = combined.topological_order()?;
    let nodes: Vec<&Node> = order.iter().filter_map(|id| combined.node(*id)).collect();

    let mut forward_ids: Vec<NodeId> = Vec::new();
    let mut backward_ids: Vec<NodeId> = Vec::new();
    let mut forward_inputs: HashSet<String> = HashSet::new();
    let mut backward_inputs: HashSet<String> = HashSet::new();
    let mut backward_outputs: HashSet<String> = HashSet::new();
    for node in &nodes {
        if node.is_backward() {
            backward_ids.push(node.id);
            backward_inputs.extend(node.input_names().map(str::to_string));
            backward_outputs.extend(node.output_names().map(str::to_string));
        } else {
            forward_ids.push(node.id);
            forward_inputs.extend(node.input_names().map(str::to_string));
        }
    }

    let user_outputs: HashSet<&str> = info.user_output_names.iter().map(String::as_str).collect();
    let mut intermediates: Vec<String> = Vec::new();
    for node in nodes.iter().filter(|node| !node.is_backward()) {
        for output in node.output_names() {
            if backward_inputs.contains(output)
                && !user_outputs.contains(output)
                && !intermediates.iter().any(|name| name == output)
            {
                intermediates.push(output.to_string());
            }
        }
    }

    // Forward graph.
    let mut forward = combined.clone();
    for id in &backward_ids {
        forward.remove_node(*id);
    }
    forward.retain_initializers(&forward_inputs);
    forward.set_inputs(
        info.user_input_names
            .iter()
            .chain(info.initializer_names_to_train.iter())
            .cloned()
            .collect(),
    );
    forward.set_outputs(
        info.user_output_names
            .iter()
            .chain(intermediates.iter())
            .cloned()
            .collect(),
    );
    forward.prune_values();
    forward.resolve()?;

    // Backward graph.
    let mut backward = combined.clone();
    for id in &forward_ids {
        backward.remove_node(*id);
    }
    backward.retain_initializers(&backward_inputs);

    let backward_user_inputs: Vec<String> = info
        .user_input_names
        .iter()
        .filter(|name| backward_inputs.contains(*name))
        .cloned()
        .collect();
    let backward_trainables: Vec<String> = info
        .initializer_names_to_train
        .iter()
        .filter(|name| backward_inputs.contains(*name))
        .cloned()
        .collect();
    for name in &backward_trainables {
        backward.demote_initializer(name);
    }
    let backward_user_outputs: Vec<String> = info
        .user_output_names
        .iter()
        .filter(|name| backward_inputs.contains(*name) && !backward_outputs.contains(*name))
        .cloned()
        .collect();
    for name in intermediates.iter().chain(backward_user_outputs.iter()) {
        if let Some(ty) = forward.type_of(name).cloned() {
            backward.set_value_type(name, ty);
        }
    }

    let declared: Vec<String> = backward_user_inputs
        .iter()
        .chain(backward_trainables.iter())
        .chain(intermediates.iter())
        .chain(backward_user_outputs.iter())
        .chain(info.backward_output_grad_names.iter())
        .cloned()
        .collect();
    backward.set_inputs(declared.clone());
    backward.set_outputs(
        combined
            .outputs()
            .iter()
            .filter(|name| backward_outputs.contains(*name))
            .cloned()
            .collect(),
    );
    backward.prune_values();

    check_backward_closure(&backward, &declared, &intermediates, &forward)?;
    backward.resolve()?;

    debug!(
        forward_nodes = forward.len(),
        backward_nodes = backward.len(),
        intermediates = intermediates.len(),
        "split gradient graph"
    );

    info.intermediate_tensor_names = intermediates;
    info.backward_user_input_names = backward_user_inputs;
    info.backward_initializer_names_as_input = backward_trainables;
    info.backward_user_output_names = backward_user_outputs;
    Ok((forward, backward))
}

fn check_backward_closure(
    backward: &Graph,
    declared: &[String],
    intermediates: &[String],
    forward: &Graph,
) -> GraphResult<()> {
    for name in intermediates {
        if forward.producer_of(name).is_none() {
            return Err(GraphError::split(name, "no forward node produces this activation"));
        }
    }
    for name in declared {
        if backward.consumers_of(name).is_empty() {
            return Err(GraphError::split(name, "declared as a backward input but never read"));
        }
    }
    for node in backward.nodes() {
        for input in node.input_names() {
            let available = backward.producer_of(input).is_some()
                || backward.is_input(input)
                || backward.is_initializer(input);
            if !available {
                return Err(GraphError::split(
                    input,
                    format!("read by backward node `{}` but not handed over from the forward graph", node.name),
                ));
            }
        }
    }
    Ok(())
}
