mod support;

use gradsplit::graph::BACKWARD_DESCRIPTION;
use gradsplit::{
    dataflow_graph, ChainRuleDifferentiator, Differentiator, Graph, GradientRequest, GraphError,
};

fn differentiate(graph: &Graph, outputs: &[&str], trainable: &[&str]) -> Graph {
    ChainRuleDifferentiator
        .differentiate(graph, &GradientRequest::new(outputs.to_vec(), trainable.to_vec()))
        .expect("differentiable")
}

fn producer_op(graph: &Graph, name: &str) -> String {
    graph
        .producer_of(name)
        .unwrap_or_else(|| panic!("nothing produces {name}"))
        .op_type
        .clone()
}

#[test]
fn matmul_weight_gradient_uses_transposed_activation() {
    let graph = support::single_matmul();
    let gradient = differentiate(&graph, &["y"], &["w"]);

    let transpose = gradient
        .node_by_name("mm_Grad/Transpose_x")
        .expect("transpose of x");
    assert_eq!(transpose.inputs, ["x"]);
    let matmul = gradient.node_by_name("mm_Grad/dB").expect("weight matmul");
    assert_eq!(matmul.op_type, "MatMul");
    assert_eq!(matmul.inputs, [transpose.outputs[0].as_str(), "y_grad"]);
    assert_eq!(matmul.outputs, ["w_grad"]);

    for node in gradient.nodes().filter(|node| node.is_backward()) {
        assert_eq!(node.description, BACKWARD_DESCRIPTION);
    }
    assert!(gradient.producer_of("x_grad").is_none(), "x is not trainable");
    assert!(gradient.value("y_grad").is_some(), "seed is referenced");
    assert!(!gradient.is_input("y_grad"), "seed wiring is the caller's job");
    assert_eq!(gradient.outputs(), ["y"]);
}

#[test]
fn fan_out_contributions_are_summed() {
    let graph = dataflow_graph!(
        r#"
graph fan {
  input w: f32[4]
  node a: Relu(w) -> p
  node b: Identity(w) -> q
  node s: Add(p, q) -> y
  output y
}
"#
    );
    let gradient = differentiate(&graph, &["y"], &["w"]);

    let sum = gradient.node_by_name("w_Grad/Sum").expect("accumulation");
    assert_eq!(sum.op_type, "Sum");
    assert!(sum.is_backward());
    assert_eq!(sum.outputs, ["w_grad"]);
    let mut parts = sum.inputs.clone();
    parts.sort();
    assert_eq!(parts, ["w_grad_1", "w_grad_2"]);
    assert_eq!(producer_op(&gradient, "p_grad"), "Identity");
    let relu_grad = gradient.producer_of("w_grad_2").expect("relu contribution");
    assert_eq!(relu_grad.op_type, "ReluGrad");
    assert_eq!(relu_grad.inputs, ["p_grad", "p"]);
}

#[test]
fn seeded_output_with_consumers_accumulates_seed() {
    let graph = dataflow_graph!(
        r#"
graph both {
  input w: f32[4]
  node a: Relu(w) -> y
  node b: Identity(y) -> z
  output y, z
}
"#
    );
    let gradient = differentiate(&graph, &["y", "z"], &["w"]);

    let sum = gradient.node_by_name("y_Grad/Sum").expect("seed accumulation");
    assert_eq!(sum.inputs, ["y_grad", "y_grad_1"]);
    assert_eq!(sum.outputs, ["y_grad_accum"]);
    let relu_grad = gradient.producer_of("w_grad").expect("w gradient");
    assert_eq!(relu_grad.inputs, ["y_grad_accum", "y"]);
}

#[test]
fn only_paths_from_trainables_to_outputs_are_differentiated() {
    let graph = dataflow_graph!(
        r#"
graph paths {
  input x: f32[4]
  input w: f32[4]
  node frozen: Relu(x) -> fx
  node mix: Mul(fx, w) -> y
  node side: Relu(w) -> unused
  output y, unused
}
"#
    );
    let gradient = differentiate(&graph, &["y"], &["w"]);

    assert!(gradient.node_by_name("frozen_Grad/ReluGrad").is_none());
    assert!(gradient.node_by_name("side_Grad/ReluGrad").is_none());
    assert!(gradient.producer_of("fx_grad").is_none());
    let mul = gradient.producer_of("w_grad").expect("w gradient");
    assert_eq!(mul.inputs, ["y_grad", "fx"]);
}

#[test]
fn unknown_op_on_the_gradient_path_fails() {
    let graph = dataflow_graph!(
        r#"
graph trig {
  input w: f32[4]
  node c: Cos(w) -> y
  output y
}
"#
    );
    let err = ChainRuleDifferentiator
        .differentiate(&graph, &GradientRequest::new(["y"], ["w"]))
        .expect_err("Cos has no rule");
    match err {
        GraphError::NoGradientRule { op_type, node } => {
            assert_eq!(op_type, "Cos");
            assert_eq!(node, "c");
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn layer_norm_gradient_flavours() {
    const SRC: &str = r#"
graph norm {
  input x: f32[2, 4]
  input s: f32[4]
  input b: f32[4]
  node ln: LayerNormalization(x, s, b) -> (y, mean, inv_std) {axis = -1}
  output y
}
"#;
    let graph = dataflow_graph!(SRC);

    let standard = differentiate(&graph, &["y"], &["s", "b"]);
    let node = standard
        .node_by_name("ln_Grad/LayerNormalizationGrad")
        .expect("standard grad");
    assert_eq!(node.domain, "com.microsoft");
    assert_eq!(node.inputs, ["y_grad", "x", "s", "mean", "inv_std"]);
    assert_eq!(node.outputs, ["", "s_grad", "b_grad"]);
    assert_eq!(node.int_attribute("axis"), Some(-1));

    let invertible = ChainRuleDifferentiator
        .differentiate(
            &graph,
            &GradientRequest::new(["y"], ["x", "s", "b"]).with_invertible_layernorm_grad(true),
        )
        .expect("differentiable");
    let node = invertible
        .node_by_name("ln_Grad/InvertibleLayerNormalizationGrad")
        .expect("invertible grad");
    assert_eq!(node.inputs, ["y_grad", "y", "s", "b", "inv_std"]);
    assert_eq!(node.outputs, ["x_grad", "s_grad", "b_grad"]);
}

#[test]
fn dropout_gradient_reads_saved_mask() {
    let graph = dataflow_graph!(
        r#"
graph drop {
  input w: f32[4]
  init ratio: f32
  node d: Dropout(w, ratio) -> (y, mask)
  output y
}
"#
    );
    let gradient = differentiate(&graph, &["y"], &["w"]);
    let node = gradient.producer_of("w_grad").expect("w gradient");
    assert_eq!(node.op_type, "DropoutGrad");
    assert_eq!(node.domain, "com.microsoft");
    assert_eq!(node.inputs, ["y_grad", "mask", "ratio"]);

    let maskless = dataflow_graph!(
        r#"
graph drop {
  input w: f32[4]
  node d: Dropout(w) -> y
  output y
}
"#
    );
    assert!(matches!(
        ChainRuleDifferentiator.differentiate(&maskless, &GradientRequest::new(["y"], ["w"])),
        Err(GraphError::NoGradientRule { .. })
    ));
}

#[test]
fn gradients_can_be_appended_to_outputs() {
    let graph = support::single_matmul();
    let gradient = ChainRuleDifferentiator
        .differentiate(
            &graph,
            &GradientRequest::new(["y"], ["w", "x"]).with_gradients_as_outputs(true),
        )
        .expect("differentiable");
    assert_eq!(gradient.outputs(), ["y", "w_grad", "x_grad"]);
}

#[test]
fn weight_feeding_a_dropout_ratio_keeps_a_single_gradient() {
    let graph = dataflow_graph!(
        r#"
graph ratio_from_weight {
  input x: f32[2, 4]
  input w: f32[4, 4]
  node mm: MatMul(x, w) -> h
  node rw: Relu(w) -> r
  node drop: Dropout(h, r) -> (d, mask)
  output d
}
"#
    );
    let gradient = differentiate(&graph, &["d"], &["w"]);

    let producer = gradient.producer_of("w_grad").expect("w gradient");
    assert_eq!(producer.name, "mm_Grad/dB");
    assert!(gradient.value("w_grad_1").is_none());
    assert!(gradient.node_by_name("rw_Grad/ReluGrad").is_none());
    assert!(gradient.node_by_name("w_Grad/Sum").is_none());
}

#[test]
fn dropout_mask_is_not_a_gradient_path() {
    let graph = dataflow_graph!(
        r#"
graph masked {
  input x: f32[2, 4]
  input w: f32[4, 4]
  init ratio: f32
  node mm: MatMul(x, w) -> h
  node drop: Dropout(h, ratio) -> (d, mask)
  node scale: Mul(d, mask) -> y
  output y
}
"#
    );
    let gradient = differentiate(&graph, &["y"], &["w"]);

    assert!(gradient.producer_of("mask_grad").is_none());
    assert!(gradient.node_by_name("scale_Grad/Mul_1").is_none());
    assert_eq!(producer_op(&gradient, "d_grad"), "Mul");
    assert_eq!(producer_op(&gradient, "h_grad"), "DropoutGrad");
    assert_eq!(
        gradient.producer_of("w_grad").expect("w gradient").name,
        "mm_Grad/dB"
    );
}

#[test]
fn trainable_dropout_uses_its_own_gradient_op() {
    let graph = dataflow_graph!(
        r#"
graph trainable_drop {
  input w: f32[4]
  init ratio: f32
  node d: TrainableDropout(w, ratio) -> (y, mask)
  output y
}
"#
    );
    let gradient = differentiate(&graph, &["y"], &["w"]);
    let node = gradient.producer_of("w_grad").expect("w gradient");
    assert_eq!(node.name, "d_Grad/TrainableDropoutGrad");
    assert_eq!(node.inputs, ["y_grad", "mask", "ratio"]);
}
