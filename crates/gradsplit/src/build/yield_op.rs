//! Yield hand-off points for running the gradient graph as one model.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::autodiff::gradient_name;
use crate::error::{GraphError, GraphResult};
use crate::graph::{Attribute, Graph, NodeSpec, PassTag, MS_DOMAIN};

use super::SplitGraphsInfo;

pub const FORWARD_YIELD_NAME: &str = "YieldOp_fw_op";
const YIELD_OP: &str = "Yield";
const YIELD_DESCRIPTION: &str = "Yield Op";

/// Inserts the forward yield and one gradient yield per trainable
/// initializer gradient.
///
/// The forward yield takes the user outputs (those whose gradient the host
/// supplies first) and produces the gradients the host supplies. Gradient
/// yields follow the gradient graph's topological order; the reverse of that
/// order is recorded as the forward order of the initializers.
pub fn add_yield_ops(graph: &mut Graph, info: &mut SplitGraphsInfo) -> GraphResult<()> {
    let order = graph.topological_order()?;

    let output_grads: HashSet<String> = info
        .user_output_names
        .iter()
        .map(|name| gradient_name(name))
        .collect();
    let produced: HashSet<String> = order
        .iter()
        .filter_map(|id| graph.node(*id))
        .flat_map(|node| node.output_names())
        .filter(|name| output_grads.contains(*name))
        .map(str::to_string)
        .collect();

    let mut yield_inputs = Vec::new();
    let mut supplied = Vec::new();
    for name in &info.user_output_names {
        let grad = gradient_name(name);
        if !produced.contains(&grad) {
            let ty = graph.type_of(name).cloned();
            graph.get_or_create_value(&grad, ty.as_ref());
            yield_inputs.push(name.clone());
            supplied.push(grad);
        }
    }
    for name in &info.user_output_names {
        if produced.contains(&gradient_name(name)) {
            yield_inputs.push(name.clone());
        }
    }

    let initializer_grads: Vec<String> = info
        .initializer_names_to_train
        .iter()
        .map(|name| gradient_name(name))
        .collect();
    let grad_to_initializer: HashMap<&str, &str> = initializer_grads
        .iter()
        .map(String::as_str)
        .zip(info.initializer_names_to_train.iter().map(String::as_str))
        .collect();

    let mut captured: Vec<(String, String)> = Vec::new();
    for id in &order {
        let Some(node) = graph.node(*id) else {
            continue;
        };
        for output in node.output_names() {
            if let Some(initializer) = grad_to_initializer.get(output) {
                captured.push((output.to_string(), initializer.to_string()));
            }
        }
    }

    if graph.node_by_name(FORWARD_YIELD_NAME).is_some() {
        return Err(GraphError::invalid(format!(
            "graph already contains a node named `{FORWARD_YIELD_NAME}`"
        )));
    }
    graph.add_node(
        NodeSpec::new(FORWARD_YIELD_NAME, YIELD_OP)
            .domain(MS_DOMAIN)
            .description(YIELD_DESCRIPTION)
            .pass(PassTag::Forward)
            .inputs(yield_inputs)
            .outputs(supplied.clone()),
    )?;

    let mut ordered = Vec::with_capacity(captured.len());
    for (grad, initializer) in captured {
        let name = graph.unique_node_name(&format!("YieldOp_{grad}"));
        graph.add_node(
            NodeSpec::new(name, YIELD_OP)
                .domain(MS_DOMAIN)
                .description(YIELD_DESCRIPTION)
                .backward()
                .attr("push_input", Attribute::Int(1))
                .inputs([grad]),
        )?;
        ordered.push(initializer);
    }
    ordered.reverse();

    info.user_output_grad_names = info
        .user_output_names
        .iter()
        .map(|name| gradient_name(name))
        .collect();
    info.backward_output_grad_names = supplied;
    info.initializer_grad_names_to_train = initializer_grads;
    info.ordered_initializer_names = ordered;
    Ok(())
}

/// Sets the outputs to user outputs, then gradients of grad-requiring user
/// inputs in user-input order, then trainable initializer gradients in
/// configuration order. Fails if any of those gradients is not produced.
pub fn reorder_outputs(
    graph: &mut Graph,
    info: &mut SplitGraphsInfo,
    input_names_require_grad: &[String],
) -> GraphResult<()> {
    let mut outputs = info.user_output_names.clone();
    let mut input_grads = BTreeMap::new();
    for input in &info.user_input_names {
        if !input_names_require_grad.contains(input) {
            continue;
        }
        let grad = gradient_name(input);
        if graph.producer_of(&grad).is_none() {
            return Err(GraphError::MissingRequiredGradient { name: grad });
        }
        input_grads.insert(input.clone(), grad.clone());
        outputs.push(grad);
    }
    for grad in &info.initializer_grad_names_to_train {
        if graph.producer_of(grad).is_none() {
            return Err(GraphError::MissingRequiredGradient { name: grad.clone() });
        }
        outputs.push(grad.clone());
    }
    graph.set_outputs(outputs);
    info.user_input_grad_names = input_grads;
    Ok(())
}
