mod support;

use gradsplit::graph::model::{ModelSerdeError, SPEC_VERSION};
use gradsplit::graph::text::{parse_graph, TextError};
use gradsplit::graph::{Attribute, Dimension, PassTag};
use gradsplit::{GraphError, Model, ModelCodec, ModelFormat, NodeSpec};

#[test]
fn parses_node_flags_and_attributes() {
    let graph = parse_graph(
        r#"
graph flags {
  input dy: f32[B, 4]
  input y: f32[B, 4]
  // trailing comment
  node g: SoftmaxGrad@com.microsoft(dy, y) -> dx {axis = -1, mode = "fast", scales = [0.5, 2.0]} backward priority=3 desc="Backward pass"
  output dx
}
"#,
    )
    .expect("parses");

    let node = graph.node_by_name("g").expect("g");
    assert_eq!(node.domain, "com.microsoft");
    assert_eq!(node.pass, PassTag::Backward);
    assert_eq!(node.priority, 3);
    assert_eq!(node.description, "Backward pass");
    assert_eq!(node.int_attribute("axis"), Some(-1));
    assert_eq!(node.attribute("mode"), Some(&Attribute::Str("fast".into())));
    assert_eq!(
        node.attribute("scales"),
        Some(&Attribute::Floats(vec![0.5, 2.0]))
    );
    let shape = graph
        .type_of("dy")
        .and_then(|ty| ty.shape.clone())
        .expect("dy has a shape");
    assert_eq!(shape.dims[0], Dimension::Symbolic("B".into()));
    assert_eq!(shape.dims[1], Dimension::Static(4));
}

#[test]
fn empty_slots_and_recompute_provenance() {
    let graph = parse_graph(
        r#"
graph slots {
  input x: f32[4]
  init s: f32[4]
  node ln: LayerNormalization(x, s, _) -> (y, _, inv)
  node ln_recompute: LayerNormalization(x, s, _) -> (y_recompute, _, _) backward recompute_of=ln
  twin y -> y_recompute
  output y
}
"#,
    )
    .expect("parses");

    let ln = graph.node_by_name("ln").expect("ln");
    assert_eq!(ln.inputs, ["x", "s", ""]);
    assert_eq!(ln.outputs, ["y", "", "inv"]);
    let twin = graph.node_by_name("ln_recompute").expect("twin node");
    assert_eq!(twin.recompute_of, Some(ln.id));
    assert!(twin.is_recompute());
    assert_eq!(graph.recompute_twin("y"), Some("y_recompute"));
}

#[test]
fn syntax_errors_carry_line_numbers() {
    let err = parse_graph("graph bad {\n  input x\n  node r Relu(x) -> y\n}\n")
        .expect_err("missing colon after node name");
    match err {
        TextError::Syntax { line, .. } => assert_eq!(line, 3),
        other => panic!("unexpected error {other}"),
    }

    assert!(matches!(
        parse_graph("graph open {\n  input x\n"),
        Err(TextError::Syntax { .. })
    ));
    assert!(matches!(
        parse_graph("graph dup {\n  node a: Relu(x) -> y\n  node b: Relu(x) -> y\n}\n"),
        Err(TextError::Graph(GraphError::InvalidGraph(_)))
    ));
}

#[test]
fn printed_text_parses_back_to_the_same_graph() {
    let graph = support::transformer_layer();
    let printed = graph.to_string();
    let mut reparsed = parse_graph(&printed).expect("printed text parses");
    reparsed.resolve().expect("printed text resolves");
    assert_eq!(reparsed.to_string(), printed);
    assert_eq!(reparsed.len(), graph.len());
}

#[test]
fn codecs_preserve_graph_and_metadata() {
    let model = Model::new(support::transformer_layer()).with_opset("com.microsoft", 1);
    for format in [ModelFormat::Json, ModelFormat::Bincode] {
        let codec = format.codec();
        let bytes = codec.save(&model).expect("encodes");
        let loaded = codec.load(&bytes).expect("decodes and resolves");
        assert_eq!(loaded.spec_version, SPEC_VERSION);
        assert_eq!(loaded.opset_imports.get("com.microsoft"), Some(&1));
        assert_eq!(loaded.graph.to_string(), model.graph.to_string(), "{}", codec.name());
        assert_eq!(
            loaded.graph.producer_of("y").map(|n| n.name.as_str()),
            Some("ln1"),
            "indices are rebuilt on load"
        );
    }
}

#[test]
fn json_rejects_foreign_spec_version() {
    let mut model = Model::new(support::single_matmul());
    model.spec_version = "other.v9".into();
    let json = model.to_json_string().expect("encodes");
    match Model::from_json_str(&json) {
        Err(ModelSerdeError::SpecVersionMismatch { found, .. }) => assert_eq!(found, "other.v9"),
        other => panic!("expected a version mismatch, got {other:?}"),
    }
}

#[test]
fn load_reports_unresolvable_graph_as_model_load() {
    let mut graph = support::single_matmul();
    graph.set_outputs(vec!["nowhere".into()]);
    let bytes = ModelFormat::Json
        .codec()
        .save(&Model::new(graph))
        .expect("encodes");
    let err = ModelFormat::Json.codec().load(&bytes).expect_err("output is undefined");
    assert!(matches!(err, GraphError::ModelLoad(_)), "{err}");

    let err = ModelFormat::Bincode
        .codec()
        .load(b"not a model")
        .expect_err("garbage");
    assert!(matches!(err, GraphError::ModelLoad(_)));
}

#[test]
fn node_ids_at_the_end_of_the_id_space_are_rejected() {
    let bytes = ModelFormat::Json
        .codec()
        .save(&Model::new(support::single_matmul()))
        .expect("encodes");
    let mut value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");

    let mut last_id = value.clone();
    last_id["graph"]["nodes"][0]["id"] = serde_json::json!(u32::MAX);
    let err = ModelFormat::Json
        .codec()
        .load(&serde_json::to_vec(&last_id).expect("json"))
        .expect_err("id has no successor");
    assert!(matches!(err, GraphError::ModelLoad(_)), "{err}");

    value["graph"]["next_node_id"] = serde_json::json!(u32::MAX);
    let mut model = ModelFormat::Json
        .codec()
        .load(&serde_json::to_vec(&value).expect("json"))
        .expect("counter alone is valid");
    let err = model
        .graph
        .add_node(NodeSpec::new("extra", "Relu").inputs(["y"]).outputs(["z"]))
        .expect_err("no id left");
    assert!(matches!(err, GraphError::InvalidGraph(_)));
    assert!(model.graph.node_by_name("extra").is_none());
}

#[test]
fn model_files_round_trip_through_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let model = Model::new(support::single_matmul());

    let json = dir.path().join("model.json");
    model.save_json(&json).expect("write json");
    let bin = dir.path().join("model.bin");
    model.save_bincode(&bin).expect("write bincode");

    assert_eq!(Model::load_json(&json).expect("read json").graph.len(), 1);
    assert_eq!(Model::load_bincode(&bin).expect("read bincode").graph.len(), 1);
}
