//! Per-operator gradient formulas.

use crate::error::{GraphError, GraphResult};
use crate::graph::{Graph, Node, NodeSpec, TypeInfo, BACKWARD_DESCRIPTION, MS_DOMAIN};

/// Writes gradient nodes into the graph being extended.
pub(crate) struct Emitter<'a> {
    graph: &'a mut Graph,
    invertible_layernorm: bool,
}

impl<'a> Emitter<'a> {
    pub(crate) fn new(graph: &'a mut Graph, invertible_layernorm: bool) -> Self {
        Emitter {
            graph,
            invertible_layernorm,
        }
    }

    /// Claims a fresh tensor name derived from `base`.
    pub(crate) fn reserve(&mut self, base: &str, ty: Option<TypeInfo>) -> String {
        let name = self.graph.unique_value_name(base);
        self.graph.get_or_create_value(&name, ty.as_ref());
        name
    }

    pub(crate) fn node_name(&self, base: &str, part: &str) -> String {
        self.graph.unique_node_name(&format!("{base}_Grad/{part}"))
    }

    pub(crate) fn add(&mut self, spec: NodeSpec) -> GraphResult<()> {
        self.graph.add_node(spec).map(|_| ())
    }

    fn grad_node(&self, node: &Node, part: &str, op_type: &str) -> NodeSpec {
        NodeSpec::new(self.node_name(&node.name, part), op_type)
            .backward()
            .description(BACKWARD_DESCRIPTION)
    }

    fn unary(&mut self, node: &Node, op_type: &str, input: &str, output: &str) -> GraphResult<()> {
        let spec = self
            .grad_node(node, op_type, op_type)
            .inputs([input])
            .outputs([output]);
        self.add(spec)
    }

    fn transposed(&mut self, node: &Node, name: &str) -> GraphResult<String> {
        let ty = self.graph.type_of(name).map(TypeInfo::without_shape);
        let target = self.reserve(&format!("{}_Grad/{name}_T", node.name), ty);
        let spec = self
            .grad_node(node, &format!("Transpose_{name}"), "Transpose")
            .inputs([name])
            .outputs([target.clone()]);
        self.add(spec)?;
        Ok(target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rule {
    MatMul,
    Add,
    Sub,
    Mul,
    Relu,
    Gelu,
    FastGelu,
    Identity,
    Softmax,
    Dropout,
    LayerNorm,
    Sum,
}

impl Rule {
    pub(crate) fn for_op(op_type: &str) -> Option<Rule> {
        Some(match op_type {
            "MatMul" => Rule::MatMul,
            "Add" => Rule::Add,
            "Sub" => Rule::Sub,
            "Mul" => Rule::Mul,
            "Relu" => Rule::Relu,
            "Gelu" => Rule::Gelu,
            "FastGelu" => Rule::FastGelu,
            "Identity" => Rule::Identity,
            "Softmax" => Rule::Softmax,
            "Dropout" | "TrainableDropout" => Rule::Dropout,
            "LayerNormalization" => Rule::LayerNorm,
            "Sum" => Rule::Sum,
            _ => return None,
        })
    }

    pub(crate) fn differentiable_slots(self, node: &Node) -> Vec<usize> {
        match self {
            Rule::MatMul | Rule::Add | Rule::Sub | Rule::Mul => vec![0, 1],
            Rule::LayerNorm => vec![0, 1, 2],
            Rule::Sum => (0..node.inputs.len()).collect(),
            Rule::Relu
            | Rule::Gelu
            | Rule::FastGelu
            | Rule::Identity
            | Rule::Softmax
            | Rule::Dropout => vec![0],
        }
    }

    /// Emits nodes writing the gradient of each `Some` slot in `dx`.
    pub(crate) fn emit(
        self,
        em: &mut Emitter<'_>,
        node: &Node,
        dy: &str,
        dx: &[Option<String>],
    ) -> GraphResult<()> {
        let input = |slot: usize| node.inputs.get(slot).map(String::as_str).unwrap_or("");
        let output = |slot: usize| node.outputs.get(slot).map(String::as_str).unwrap_or("");
        let wants = |slot: usize| dx.get(slot).and_then(Option::as_deref);

        match self {
            Rule::MatMul => {
                if let Some(da) = wants(0) {
                    let bt = em.transposed(node, input(1))?;
                    let spec = em
                        .grad_node(node, "dA", "MatMul")
                        .inputs([dy, bt.as_str()])
                        .outputs([da]);
                    em.add(spec)?;
                }
                if let Some(db) = wants(1) {
                    let at = em.transposed(node, input(0))?;
                    let spec = em
                        .grad_node(node, "dB", "MatMul")
                        .inputs([at.as_str(), dy])
                        .outputs([db]);
                    em.add(spec)?;
                }
            }
            Rule::Add | Rule::Sum => {
                for slot in 0..node.inputs.len() {
                    if let Some(grad) = wants(slot) {
                        em.unary(node, "Identity", dy, grad)?;
                    }
                }
            }
            Rule::Sub => {
                if let Some(grad) = wants(0) {
                    em.unary(node, "Identity", dy, grad)?;
                }
                if let Some(grad) = wants(1) {
                    em.unary(node, "Neg", dy, grad)?;
                }
            }
            Rule::Mul => {
                for (slot, other) in [(0, input(1)), (1, input(0))] {
                    if let Some(grad) = wants(slot) {
                        let spec = em
                            .grad_node(node, &format!("Mul_{slot}"), "Mul")
                            .inputs([dy, other])
                            .outputs([grad]);
                        em.add(spec)?;
                    }
                }
            }
            Rule::Identity => {
                if let Some(grad) = wants(0) {
                    em.unary(node, "Identity", dy, grad)?;
                }
            }
            Rule::Relu | Rule::Gelu | Rule::FastGelu | Rule::Softmax => {
                let Some(grad) = wants(0) else {
                    return Ok(());
                };
                let (op_type, saved) = match self {
                    Rule::Relu => ("ReluGrad", output(0)),
                    Rule::Gelu => ("GeluGrad", input(0)),
                    Rule::FastGelu => ("FastGeluGrad", input(0)),
                    _ => ("SoftmaxGrad", output(0)),
                };
                let spec = em
                    .grad_node(node, op_type, op_type)
                    .domain(MS_DOMAIN)
                    .attributes(node.attributes.clone())
                    .inputs([dy, saved])
                    .outputs([grad]);
                em.add(spec)?;
            }
            Rule::Dropout => {
                let Some(grad) = wants(0) else {
                    return Ok(());
                };
                let mask = output(1);
                if mask.is_empty() {
                    return Err(missing_saved(node));
                }
                let mut inputs = vec![dy, mask];
                if !input(1).is_empty() {
                    inputs.push(input(1));
                }
                let op_type = match node.op_type.as_str() {
                    "TrainableDropout" => "TrainableDropoutGrad",
                    _ => "DropoutGrad",
                };
                let spec = em
                    .grad_node(node, op_type, op_type)
                    .domain(MS_DOMAIN)
                    .inputs(inputs)
                    .outputs([grad]);
                em.add(spec)?;
            }
            Rule::LayerNorm => {
                let grads: Vec<String> = (0..3)
                    .map(|slot| wants(slot).unwrap_or_default().to_string())
                    .collect();
                if grads.iter().all(String::is_empty) {
                    return Ok(());
                }
                let spec = if em.invertible_layernorm {
                    let inv_std = output(2);
                    if inv_std.is_empty() {
                        return Err(missing_saved(node));
                    }
                    em.grad_node(node, "InvertibleLayerNormalizationGrad", "InvertibleLayerNormalizationGrad")
                        .inputs([dy, output(0), input(1), input(2), inv_std])
                } else {
                    let (mean, inv_std) = (output(1), output(2));
                    if mean.is_empty() || inv_std.is_empty() {
                        return Err(missing_saved(node));
                    }
                    em.grad_node(node, "LayerNormalizationGrad", "LayerNormalizationGrad")
                        .inputs([dy, input(0), input(1), mean, inv_std])
                };
                em.add(
                    spec.domain(MS_DOMAIN)
                        .attributes(node.attributes.clone())
                        .outputs(grads),
                )?;
            }
        }
        Ok(())
    }
}

/// The formula needs a saved forward output the node does not expose.
fn missing_saved(node: &Node) -> GraphError {
    GraphError::NoGradientRule {
        op_type: node.op_type.clone(),
        node: node.name.clone(),
    }
}
