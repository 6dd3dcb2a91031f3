mod support;

use gradsplit::build::FORWARD_YIELD_NAME;
use gradsplit::graph::{Attribute, DType, Initializer, Shape, TypeInfo};
use gradsplit::{
    BuildConfig, BuildError, BuildPhase, Differentiator, Graph, GradientGraphBuilder,
    GradientRequest, GraphError, GraphResult, Model, ModelCodec, ModelFormat,
};

fn linear_builder(config: BuildConfig) -> GradientGraphBuilder {
    let mut builder = GradientGraphBuilder::new();
    let bytes = support::model_bytes(support::single_matmul(), config.model_format);
    builder.initialize(&bytes, config).expect("initializes");
    builder
}

fn layer_builder(config: BuildConfig) -> GradientGraphBuilder {
    support::init_tracing();
    let mut builder = GradientGraphBuilder::new();
    let bytes = support::model_bytes(support::transformer_layer(), config.model_format);
    builder
        .initialize(
            &bytes,
            config.with_trainable_initializers(support::LAYER_TRAINABLES),
        )
        .expect("initializes");
    builder
}

fn phase_of(err: &BuildError) -> BuildPhase {
    err.phase().unwrap_or_else(|| panic!("no phase on {err}"))
}

#[test]
fn linear_model_splits_into_forward_and_backward() {
    let mut builder = linear_builder(BuildConfig::default().with_trainable_initializers(["w"]));
    builder.build_and_split(&[vec![2, 4]]).expect("builds");

    let forward = builder.forward_graph().expect("forward");
    assert_eq!(forward.inputs(), ["x", "w"]);
    assert_eq!(forward.outputs(), ["y"]);
    assert_eq!(forward.len(), 1);
    assert_eq!(
        forward
            .type_of("x")
            .and_then(|ty| ty.shape.as_ref())
            .and_then(|shape| shape.static_dims()),
        Some(vec![2, 4])
    );

    let backward = builder.backward_graph().expect("backward");
    assert_eq!(backward.inputs(), ["x", "y_grad"]);
    assert_eq!(backward.outputs(), ["w_grad"]);
    let ops: Vec<&str> = backward.nodes().map(|n| n.op_type.as_str()).collect();
    assert_eq!(ops, ["Transpose", "MatMul"]);

    let info = builder.split_graphs_info().expect("info");
    assert_eq!(info.user_input_names, ["x"]);
    assert_eq!(info.user_output_names, ["y"]);
    assert_eq!(info.initializer_names_to_train, ["w"]);
    assert_eq!(info.initializer_grad_names_to_train, ["w_grad"]);
    assert_eq!(info.user_output_grad_names, ["y_grad"]);
    assert_eq!(info.backward_output_grad_names, ["y_grad"]);
    assert_eq!(info.backward_user_input_names, ["x"]);
    assert!(info.intermediate_tensor_names.is_empty());

    let trainable = builder.trainable_initializers().expect("initialized");
    assert_eq!(
        trainable,
        [("w".to_string(), Initializer::zeros(DType::F32, vec![4, 3]))]
    );
}

#[test]
fn serialized_models_decode_with_the_configured_codec() {
    let mut builder = linear_builder(
        BuildConfig::default()
            .with_trainable_initializers(["w"])
            .with_model_format(ModelFormat::Json),
    );
    builder.build_and_split(&[vec![2, 4]]).expect("builds");

    let bytes = builder.backward_model().expect("backward bytes");
    let text = std::str::from_utf8(&bytes).expect("json is utf-8");
    let model = Model::from_json_str(text).expect("json model");
    assert_eq!(model.graph.outputs(), ["w_grad"]);

    let forward = ModelFormat::Json
        .codec()
        .load(&builder.forward_model().expect("forward bytes"))
        .expect("forward decodes");
    assert_eq!(forward.graph.len(), 1);
}

#[test]
fn accessors_report_missing_session_and_builds() {
    let builder = GradientGraphBuilder::new();
    assert!(matches!(builder.forward_model(), Err(BuildError::NotInitialized)));
    assert!(matches!(builder.split_graphs_info(), Err(BuildError::NotInitialized)));

    let mut builder = linear_builder(BuildConfig::default().with_trainable_initializers(["w"]));
    assert!(matches!(builder.forward_graph(), Err(BuildError::NotBuilt("forward"))));
    assert!(matches!(builder.gradient_model(), Err(BuildError::NotBuilt("gradient"))));
    assert!(matches!(
        GradientGraphBuilder::new().build(),
        Err(BuildError::NotInitialized)
    ));

    builder.build().expect("builds gradient graph");
    assert!(builder.gradient_graph().is_ok());
    assert!(matches!(builder.backward_graph(), Err(BuildError::NotBuilt("backward"))));
}

#[test]
fn initialize_rejects_bad_configuration() {
    let bytes = support::model_bytes(support::single_matmul(), ModelFormat::Bincode);

    let err = GradientGraphBuilder::new()
        .initialize(&bytes, BuildConfig::default().with_trainable_initializers(["nope"]))
        .expect_err("nope is not an initializer");
    assert_eq!(phase_of(&err), BuildPhase::Initialize);
    assert!(matches!(err.graph_error(), Some(GraphError::ModelLoad(_))));

    let err = GradientGraphBuilder::new()
        .initialize(&bytes, BuildConfig::default().with_inputs_requiring_grad(["w"]))
        .expect_err("w is a constant, not a user input");
    assert!(matches!(err.graph_error(), Some(GraphError::InvalidConfig(_))));

    let err = GradientGraphBuilder::new()
        .initialize(&bytes, BuildConfig::default().with_model_format(ModelFormat::Json))
        .expect_err("bincode bytes are not json");
    assert!(matches!(err.graph_error(), Some(GraphError::ModelLoad(_))));
}

#[test]
fn wrong_shape_count_keeps_the_previous_build() {
    let mut builder = linear_builder(BuildConfig::default().with_trainable_initializers(["w"]));
    builder.build_and_split(&[vec![2, 4]]).expect("builds");

    let err = builder
        .build_and_split(&[vec![2, 4], vec![1]])
        .expect_err("one user input");
    assert_eq!(phase_of(&err), BuildPhase::Specialize);
    assert!(matches!(
        err.graph_error(),
        Some(GraphError::InvalidShapeRequest { expected: 1, found: 2 })
    ));
    assert_eq!(
        builder.backward_graph().expect("still built").outputs(),
        ["w_grad"]
    );
}

#[test]
fn input_gradients_precede_initializer_gradients() {
    let mut builder = linear_builder(
        BuildConfig::default()
            .with_trainable_initializers(["w"])
            .with_inputs_requiring_grad(["x"]),
    );
    builder.build_and_split(&[vec![2, 4]]).expect("builds");

    let backward = builder.backward_graph().expect("backward");
    assert_eq!(backward.outputs(), ["x_grad", "w_grad"]);
    assert_eq!(backward.inputs(), ["x", "w", "y_grad"]);
    let info = builder.split_graphs_info().expect("info");
    assert!(info.requires_grad("x"));
    assert_eq!(info.user_input_grad_names.get("x").map(String::as_str), Some("x_grad"));
    assert_eq!(info.backward_initializer_names_as_input, ["w"]);
}

#[test]
fn unreachable_required_gradient_is_reported() {
    let mut graph = support::single_matmul();
    let mut inputs = graph.inputs().to_vec();
    inputs.push("unused".into());
    graph.set_inputs(inputs);
    graph.set_value_type("unused", TypeInfo::new(DType::F32, Shape::from_static(&[3])));
    graph.resolve().expect("resolves");

    let mut builder = GradientGraphBuilder::new();
    builder
        .initialize(
            &support::model_bytes(graph, ModelFormat::Bincode),
            BuildConfig::default()
                .with_trainable_initializers(["w"])
                .with_inputs_requiring_grad(["unused"]),
        )
        .expect("initializes");
    let err = builder
        .build_and_split(&[vec![2, 4], vec![3]])
        .expect_err("unused never reaches y");
    assert_eq!(phase_of(&err), BuildPhase::Differentiate);
    match err.graph_error() {
        Some(GraphError::MissingRequiredGradient { name }) => assert_eq!(name, "unused_grad"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn transformer_layer_splits_with_recompute() {
    let mut plain = layer_builder(BuildConfig::default());
    plain.build_and_split(&[vec![2, 4]]).expect("builds");
    let plain_info = plain.split_graphs_info().expect("info").clone();

    let mut builder = layer_builder(BuildConfig::default().with_recompute(true));
    builder.build_and_split(&[vec![2, 4]]).expect("builds");

    let forward = builder.forward_graph().expect("forward");
    assert!(forward.nodes().all(|node| !node.is_recompute()));
    let backward = builder.backward_graph().expect("backward");
    for original in support::LAYER_SPAN {
        assert!(
            backward.node_by_name(&format!("{original}_recompute")).is_some(),
            "{original} is recomputed in the backward graph"
        );
    }

    let info = builder.split_graphs_info().expect("info");
    for kept in ["h0", "mask", "m1", "v1"] {
        assert!(
            info.intermediate_tensor_names.iter().any(|n| n == kept),
            "{kept} is handed over"
        );
    }
    for dropped in ["f1", "r0", "r1"] {
        assert!(
            plain_info.intermediate_tensor_names.iter().any(|n| n == dropped),
            "{dropped} is handed over without recompute"
        );
        assert!(
            !info.intermediate_tensor_names.iter().any(|n| n == dropped),
            "{dropped} is regenerated with recompute"
        );
    }
    assert_eq!(
        backward.outputs(),
        support::LAYER_TRAINABLES
            .iter()
            .map(|name| format!("{name}_grad"))
            .collect::<Vec<_>>()
    );
}

#[test]
fn gradient_graph_hands_off_through_yields() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("gradient.bin");
    let mut builder = linear_builder(
        BuildConfig::default()
            .with_trainable_initializers(["w"])
            .with_gradient_dump(&dump),
    );
    builder.build()?;

    let graph = builder.gradient_graph()?;
    let fw = graph
        .node_by_name(FORWARD_YIELD_NAME)
        .ok_or_else(|| anyhow::anyhow!("forward yield missing"))?;
    assert_eq!(fw.op_type, "Yield");
    assert_eq!(fw.domain, "com.microsoft");
    assert!(!fw.is_backward());
    assert_eq!(fw.inputs, ["y"]);
    assert_eq!(fw.outputs, ["y_grad"]);

    let push = graph
        .node_by_name("YieldOp_w_grad")
        .ok_or_else(|| anyhow::anyhow!("gradient yield missing"))?;
    assert!(push.is_backward());
    assert_eq!(push.inputs, ["w_grad"]);
    assert_eq!(push.attribute("push_input"), Some(&Attribute::Int(1)));

    assert_eq!(graph.inputs(), ["x", "w"]);
    assert_eq!(graph.outputs(), ["y", "w_grad"]);
    let info = builder.split_graphs_info()?;
    assert_eq!(info.backward_output_grad_names, ["y_grad"]);
    assert_eq!(info.ordered_initializer_names, ["w"]);

    let dumped = std::fs::read(&dump)?;
    let model = ModelFormat::Bincode.codec().load(&dumped)?;
    assert!(model.graph.node_by_name(FORWARD_YIELD_NAME).is_some());
    assert_eq!(builder.gradient_model()?, dumped);
    Ok(())
}

#[test]
fn gradient_graph_with_recompute_resolves() {
    let mut builder = layer_builder(BuildConfig::default().with_recompute(true));
    builder.build().expect("builds");

    let graph = builder.gradient_graph().expect("gradient");
    assert!(graph.node_by_name("drop_recompute").is_some());
    // Gradient yields fire from the last layer norm back to the first; the
    // recorded order is that visitation reversed.
    let info = builder.split_graphs_info().expect("info");
    assert_eq!(
        info.ordered_initializer_names,
        ["b0", "s0", "wq", "wk", "wv", "w1", "w2", "b1", "s1"]
    );
    let yields: Vec<&str> = graph
        .nodes()
        .filter(|node| node.op_type == "Yield" && node.is_backward())
        .map(|node| node.inputs[0].as_str())
        .collect();
    assert_eq!(yields.len(), support::LAYER_TRAINABLES.len());
    let reversed: Vec<String> = info
        .ordered_initializer_names
        .iter()
        .rev()
        .map(|name| format!("{name}_grad"))
        .collect();
    assert_eq!(yields, reversed);
}

struct Refusing;

impl Differentiator for Refusing {
    fn differentiate(&self, _graph: &Graph, _request: &GradientRequest) -> GraphResult<Graph> {
        Err(GraphError::InvalidGraph("refused".into()))
    }
}

#[test]
fn differentiator_failures_are_tagged_with_their_phase() {
    let mut builder = GradientGraphBuilder::new().with_differentiator(Refusing);
    let bytes = support::model_bytes(support::single_matmul(), ModelFormat::Bincode);
    builder
        .initialize(&bytes, BuildConfig::default().with_trainable_initializers(["w"]))
        .expect("initializes");
    let err = builder.build_and_split(&[vec![2, 4]]).expect_err("refused");
    assert_eq!(phase_of(&err), BuildPhase::Differentiate);
    assert!(err.to_string().starts_with("differentiation failed"));
}
