#![allow(dead_code)]

use gradsplit::graph::Graph;
use gradsplit::{dataflow_graph, Model, ModelCodec, ModelFormat, NodeId};

/// One pre-norm transformer block: attention projections fan out of `h0`,
/// the feed-forward branch closes through Gelu, Dropout and the final
/// LayerNormalization.
pub const TRANSFORMER_LAYER: &str = r#"
graph layer {
  input x: f32[2, 4]
  init s0: f32[4]
  init b0: f32[4]
  init wq: f32[4, 4]
  init wk: f32[4, 4]
  init wv: f32[4, 4]
  init w1: f32[4, 8]
  init w2: f32[8, 4]
  init ratio: f32
  init s1: f32[4]
  init b1: f32[4]
  node ln0: LayerNormalization(x, s0, b0) -> (h0, m0, v0) {axis = -1}
  node q: MatMul(h0, wq) -> q_out
  node k: MatMul(h0, wk) -> k_out
  node v: MatMul(h0, wv) -> v_out
  node attn_add: Add(q_out, k_out) -> qk
  node attn_mul: Mul(qk, v_out) -> ctx
  node res0: Add(ctx, h0) -> r0
  node ffn: MatMul(r0, w1) -> f1
  node act: Gelu(f1) -> g
  node proj: MatMul(g, w2) -> f2
  node drop: Dropout(f2, ratio) -> (d, mask)
  node res1: Add(d, r0) -> r1
  node ln1: LayerNormalization(r1, s1, b1) -> (y, m1, v1) {axis = -1}
  output y
}
"#;

/// Nodes strictly inside the layer, in topological order.
pub const LAYER_SPAN: [&str; 11] = [
    "q", "k", "v", "attn_add", "attn_mul", "res0", "ffn", "act", "proj", "drop", "res1",
];

pub const LAYER_TRAINABLES: [&str; 9] = ["s0", "b0", "wq", "wk", "wv", "w1", "w2", "s1", "b1"];

pub const SINGLE_MATMUL: &str = r#"
graph linear {
  input x: f32[2, 4]
  init w: f32[4, 3]
  node mm: MatMul(x, w) -> y
  output y
}
"#;

pub fn transformer_layer() -> Graph {
    dataflow_graph!(TRANSFORMER_LAYER)
}

pub fn single_matmul() -> Graph {
    dataflow_graph!(SINGLE_MATMUL)
}

pub fn model_bytes(graph: Graph, format: ModelFormat) -> Vec<u8> {
    format
        .codec()
        .save(&Model::new(graph))
        .expect("model encodes")
}

pub fn node_names(graph: &Graph, ids: &[NodeId]) -> Vec<String> {
    ids.iter()
        .map(|id| graph.node(*id).expect("node exists").name.clone())
        .collect()
}

pub fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("gradsplit=debug")
        .try_init();
}
