//! Reverse-mode differentiation of a forward graph.
//!
//! [`Differentiator`] is the seam the build orchestrator calls through;
//! [`ChainRuleDifferentiator`] is a reference implementation covering the
//! operators found in transformer blocks.

mod rules;

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::error::{GraphError, GraphResult};
use crate::graph::{Graph, Node, NodeSpec, BACKWARD_DESCRIPTION};
use rules::{Emitter, Rule};

/// Name of the gradient tensor for `name`.
pub fn gradient_name(name: &str) -> String {
    format!("{name}_grad")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GradientRequest {
    /// Tensors whose gradients are seeded as `<name>_grad`.
    pub output_names: Vec<String>,
    /// Tensors that need `<name>_grad` computed.
    pub trainable_names: Vec<String>,
    pub use_invertible_layernorm_grad: bool,
    /// Append every produced trainable gradient to the graph outputs.
    pub set_gradients_as_graph_outputs: bool,
}

impl GradientRequest {
    pub fn new<O, T, S>(output_names: O, trainable_names: T) -> Self
    where
        O: IntoIterator<Item = S>,
        T: IntoIterator<Item = S>,
        S: Into<String>,
    {
        GradientRequest {
            output_names: output_names.into_iter().map(Into::into).collect(),
            trainable_names: trainable_names.into_iter().map(Into::into).collect(),
            ..GradientRequest::default()
        }
    }

    pub fn with_invertible_layernorm_grad(mut self, enabled: bool) -> Self {
        self.use_invertible_layernorm_grad = enabled;
        self
    }

    pub fn with_gradients_as_outputs(mut self, enabled: bool) -> Self {
        self.set_gradients_as_graph_outputs = enabled;
        self
    }
}

/// Extends a forward graph with backward-tagged gradient nodes.
///
/// Implementations return a new graph; output gradient seeds get reference
/// records but are not declared as graph inputs, so the result is generally
/// not resolvable until the caller wires them.
pub trait Differentiator: Send + Sync {
    fn differentiate(&self, graph: &Graph, request: &GradientRequest) -> GraphResult<Graph>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ChainRuleDifferentiator;

impl Differentiator for ChainRuleDifferentiator {
    fn differentiate(&self, graph: &Graph, request: &GradientRequest) -> GraphResult<Graph> {
        let forward: Vec<&Node> = graph
            .topological_order()?
            .into_iter()
            .filter_map(|id| graph.node(id))
            .filter(|node| !node.is_backward())
            .collect();

        let mut requires: HashSet<&str> =
            request.trainable_names.iter().map(String::as_str).collect();
        for node in &forward {
            let (inputs, outputs) = gradient_edges(node);
            if slot_names(&node.inputs, &inputs).iter().any(|name| requires.contains(name)) {
                requires.extend(slot_names(&node.outputs, &outputs));
            }
        }
        let mut reaches: HashSet<&str> = request.output_names.iter().map(String::as_str).collect();
        for node in forward.iter().rev() {
            let (inputs, outputs) = gradient_edges(node);
            if slot_names(&node.outputs, &outputs).iter().any(|name| reaches.contains(name)) {
                reaches.extend(slot_names(&node.inputs, &inputs));
            }
        }
        let needs = |name: &str| requires.contains(name) && reaches.contains(name);

        let relevant: Vec<&Node> = forward
            .iter()
            .rev()
            .copied()
            .filter(|node| {
                let (_, outputs) = gradient_edges(node);
                slot_names(&node.outputs, &outputs).iter().any(|name| needs(*name))
            })
            .collect();

        let mut expected: HashMap<&str, usize> = HashMap::new();
        let mut rules = Vec::with_capacity(relevant.len());
        for node in &relevant {
            let rule = Rule::for_op(&node.op_type).ok_or_else(|| GraphError::NoGradientRule {
                op_type: node.op_type.clone(),
                node: node.name.clone(),
            })?;
            for slot in rule.differentiable_slots(node) {
                let input = node.inputs.get(slot);
                if let Some(input) = input.filter(|i| !i.is_empty() && needs(i.as_str())) {
                    *expected.entry(input.as_str()).or_default() += 1;
                }
            }
            rules.push(rule);
        }

        let seeded: HashSet<&str> = request
            .output_names
            .iter()
            .map(String::as_str)
            .filter(|name| needs(*name))
            .collect();

        let mut out = graph.clone();
        for name in &seeded {
            let ty = graph.type_of(name).cloned();
            out.get_or_create_value(&gradient_name(name), ty.as_ref());
        }

        let mut acc = Accumulator {
            source: graph,
            expected,
            seeded: &seeded,
            issued: HashMap::new(),
            contributions: BTreeMap::new(),
        };
        let mut emitter = Emitter::new(&mut out, request.use_invertible_layernorm_grad);

        for (node, rule) in relevant.iter().zip(rules) {
            let mut dy = None;
            for (slot, output) in node.outputs.iter().enumerate() {
                if output.is_empty() || !needs(output.as_str()) {
                    continue;
                }
                let grad = acc.finalize(&mut emitter, output)?;
                if slot == 0 {
                    dy = grad;
                }
            }
            let Some(dy) = dy else {
                continue;
            };
            let slots = rule.differentiable_slots(node);
            let mut dx = Vec::with_capacity(node.inputs.len());
            for (slot, input) in node.inputs.iter().enumerate() {
                let wanted = slots.contains(&slot) && !input.is_empty() && needs(input.as_str());
                dx.push(wanted.then(|| acc.contribution(&mut emitter, input)));
            }
            rule.emit(&mut emitter, node, &dy, &dx)?;
        }

        let leftovers: Vec<String> = acc.contributions.keys().cloned().collect();
        for name in leftovers {
            acc.finalize(&mut emitter, &name)?;
        }
        drop(emitter);

        if request.set_gradients_as_graph_outputs {
            let mut outputs = out.outputs().to_vec();
            for name in &request.trainable_names {
                let grad = gradient_name(name);
                if out.producer_of(&grad).is_some() && !outputs.contains(&grad) {
                    outputs.push(grad);
                }
            }
            out.set_outputs(outputs);
        }

        debug!(
            forward_nodes = forward.len(),
            gradient_nodes = out.len().saturating_sub(graph.len()),
            "differentiated graph"
        );
        Ok(out)
    }
}

/// Input and output slots a gradient flows through. A rule always consumes
/// the gradient of output 0; ops without a rule connect every slot so they
/// surface as `NoGradientRule` when they sit on a gradient path.
fn gradient_edges(node: &Node) -> (Vec<usize>, Vec<usize>) {
    match Rule::for_op(&node.op_type) {
        Some(rule) => (rule.differentiable_slots(node), vec![0]),
        None => ((0..node.inputs.len()).collect(), (0..node.outputs.len()).collect()),
    }
}

/// Non-empty names at `slots`.
fn slot_names<'n>(names: &'n [String], slots: &[usize]) -> Vec<&'n str> {
    slots
        .iter()
        .filter_map(|slot| names.get(*slot))
        .map(String::as_str)
        .filter(|name| !name.is_empty())
        .collect()
}

/// Tracks gradient contributions per tensor and sums them once complete.
struct Accumulator<'a> {
    source: &'a Graph,
    expected: HashMap<&'a str, usize>,
    seeded: &'a HashSet<&'a str>,
    issued: HashMap<String, usize>,
    contributions: BTreeMap<String, Vec<String>>,
}

impl Accumulator<'_> {
    fn total(&self, name: &str) -> usize {
        self.expected.get(name).copied().unwrap_or(0) + usize::from(self.seeded.contains(name))
    }

    /// Reserves the tensor name the next contribution to `name` is written to.
    fn contribution(&mut self, emitter: &mut Emitter<'_>, name: &str) -> String {
        let ty = self.source.type_of(name).cloned();
        let grad = if self.total(name) == 1 {
            emitter.reserve(&gradient_name(name), ty)
        } else {
            let index = self.issued.entry(name.to_string()).or_default();
            *index += 1;
            emitter.reserve(&format!("{name}_grad_{index}"), ty)
        };
        self.contributions
            .entry(name.to_string())
            .or_default()
            .push(grad.clone());
        grad
    }

    /// The complete gradient of `name`, summing contributions if needed.
    fn finalize(&mut self, emitter: &mut Emitter<'_>, name: &str) -> GraphResult<Option<String>> {
        let mut parts = self.contributions.remove(name).unwrap_or_default();
        let seeded = self.seeded.contains(name);
        match (seeded, parts.len()) {
            (false, 0) => Ok(None),
            (true, 0) => Ok(Some(gradient_name(name))),
            (false, 1) => Ok(parts.pop()),
            _ => {
                let ty = self.source.type_of(name).cloned();
                let target = if seeded {
                    parts.insert(0, gradient_name(name));
                    emitter.reserve(&format!("{name}_grad_accum"), ty)
                } else {
                    emitter.reserve(&gradient_name(name), ty)
                };
                let spec = NodeSpec::new(emitter.node_name(name, "Sum"), "Sum")
                    .inputs(parts)
                    .outputs([target.clone()])
                    .backward()
                    .description(BACKWARD_DESCRIPTION);
                emitter.add(spec)?;
                Ok(Some(target))
            }
        }
    }
}
