//! Build orchestration: differentiate a model, optionally insert recompute,
//! then either split it into forward/backward graphs or insert yield
//! hand-off points.
//!
//! A [`GradientGraphBuilder`] session is initialized once with model bytes
//! and a [`BuildConfig`]; each build clones the base model, so a failed build
//! leaves the session exactly as it was.

mod config;
mod info;
mod split;
mod yield_op;

use std::collections::HashSet;
use std::fs;

use tracing::{debug, info};

use crate::autodiff::{gradient_name, ChainRuleDifferentiator, Differentiator, GradientRequest};
use crate::error::{BuildError, BuildPhase, GraphError, GraphResult, InPhase};
use crate::graph::model::{Model, ModelCodec};
use crate::graph::{Graph, Initializer, Shape, TypeInfo};
use crate::passes::recompute::RecomputePass;
use crate::passes::{GraphPass, PassContext, PassManager};

pub use config::BuildConfig;
pub use info::SplitGraphsInfo;
pub use split::split_graph;
pub use yield_op::{add_yield_ops, reorder_outputs, FORWARD_YIELD_NAME};

pub struct GradientGraphBuilder {
    passes: PassManager,
    differentiator: Box<dyn Differentiator>,
    recompute: RecomputePass,
    session: Option<Session>,
}

struct Session {
    config: BuildConfig,
    base: Model,
    info: SplitGraphsInfo,
    trainable: Vec<(String, Initializer)>,
    forward: Option<Model>,
    backward: Option<Model>,
    gradient: Option<Model>,
}

impl Default for GradientGraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GradientGraphBuilder {
    pub fn new() -> Self {
        GradientGraphBuilder {
            passes: PassManager::default_pipeline(),
            differentiator: Box::new(ChainRuleDifferentiator),
            recompute: RecomputePass::transformer_layers(),
            session: None,
        }
    }

    pub fn with_pass_manager(mut self, passes: PassManager) -> Self {
        self.passes = passes;
        self
    }

    pub fn with_differentiator(mut self, differentiator: impl Differentiator + 'static) -> Self {
        self.differentiator = Box::new(differentiator);
        self
    }

    /// Replaces the recompute pass. Its configuration is overwritten by
    /// `BuildConfig::recompute` on `initialize`.
    pub fn with_recompute_pass(mut self, recompute: RecomputePass) -> Self {
        self.recompute = recompute;
        self
    }

    /// Loads the model, records the user boundary and promotes the trainable
    /// initializers to graph inputs.
    pub fn initialize(&mut self, model_bytes: &[u8], config: BuildConfig) -> Result<(), BuildError> {
        let mut model = config
            .model_format
            .codec()
            .load(model_bytes)
            .in_phase(BuildPhase::Initialize)?;
        let graph = &mut model.graph;

        let mut info = SplitGraphsInfo {
            user_input_names: graph.inputs().to_vec(),
            user_output_names: graph.outputs().to_vec(),
            ..SplitGraphsInfo::default()
        };
        for name in &config.initializer_names_to_train {
            if !info.initializer_names_to_train.contains(name) {
                info.initializer_names_to_train.push(name.clone());
            }
        }
        for name in &config.input_names_require_grad {
            if !info.user_input_names.contains(name) {
                return Err(BuildError::Phase {
                    phase: BuildPhase::Initialize,
                    source: GraphError::InvalidConfig(format!(
                        "`{name}` requires grad but is not a user input"
                    )),
                });
            }
        }

        let mut trainable = Vec::with_capacity(info.initializer_names_to_train.len());
        for name in &info.initializer_names_to_train {
            let init = graph
                .promote_initializer_to_input(name)
                .in_phase(BuildPhase::Initialize)?;
            trainable.push((name.clone(), init));
        }
        graph.resolve().in_phase(BuildPhase::Initialize)?;

        debug!(
            inputs = info.user_input_names.len(),
            outputs = info.user_output_names.len(),
            trainable = trainable.len(),
            "initialized gradient graph builder"
        );
        self.recompute.set_config(config.recompute.clone());
        self.session = Some(Session {
            config,
            base: model,
            info,
            trainable,
            forward: None,
            backward: None,
            gradient: None,
        });
        Ok(())
    }

    /// Builds the gradient graph for concrete user input shapes and splits it
    /// into forward and backward models.
    pub fn build_and_split(&mut self, input_shapes: &[Vec<i64>]) -> Result<(), BuildError> {
        let session = self.session.as_mut().ok_or(BuildError::NotInitialized)?;
        let config = &session.config;
        let mut info = session.info.clone();

        let mut graph = session.base.graph.clone();
        specialize_input_shapes(&mut graph, &info.user_input_names, input_shapes)
            .in_phase(BuildPhase::Specialize)?;
        graph.resolve().in_phase(BuildPhase::Specialize)?;

        let mut cx = PassContext::new(config.gradient_targets());
        let mut graph = differentiate(&self.passes, self.differentiator.as_ref(), graph, config, &mut cx)?;
        wire_gradient_inputs(&mut graph, &mut info);
        set_gradient_outputs(&mut graph, config, &mut info).in_phase(BuildPhase::Differentiate)?;
        graph.resolve().in_phase(BuildPhase::Differentiate)?;

        self.passes
            .apply_up_to(&mut graph, config.optimization_level, &mut cx)
            .in_phase(BuildPhase::Optimize)?;
        if config.recompute_enabled() {
            self.recompute
                .run(&mut graph, &mut cx)
                .in_phase(BuildPhase::Recompute)?;
        }

        let (forward, backward) = split_graph(&graph, &mut info).in_phase(BuildPhase::Split)?;
        info!(
            forward_nodes = forward.len(),
            backward_nodes = backward.len(),
            intermediates = info.intermediate_tensor_names.len(),
            "built forward and backward graphs"
        );
        session.forward = Some(session.base.with_graph(forward));
        session.backward = Some(session.base.with_graph(backward));
        session.info = info;
        Ok(())
    }

    /// Builds a single gradient graph whose forward and backward halves are
    /// separated by yield nodes.
    pub fn build(&mut self) -> Result<(), BuildError> {
        let session = self.session.as_mut().ok_or(BuildError::NotInitialized)?;
        let config = &session.config;
        let mut info = session.info.clone();

        let mut cx = PassContext::new(config.gradient_targets());
        let graph = session.base.graph.clone();
        let mut graph = differentiate(&self.passes, self.differentiator.as_ref(), graph, config, &mut cx)?;
        set_gradient_outputs(&mut graph, config, &mut info).in_phase(BuildPhase::Differentiate)?;

        self.passes
            .apply_up_to(&mut graph, config.optimization_level, &mut cx)
            .in_phase(BuildPhase::Optimize)?;

        add_yield_ops(&mut graph, &mut info).in_phase(BuildPhase::Yield)?;
        reorder_outputs(&mut graph, &mut info, &config.input_names_require_grad)
            .in_phase(BuildPhase::Yield)?;
        graph.resolve().in_phase(BuildPhase::Yield)?;

        if config.recompute_enabled() {
            self.recompute
                .run(&mut graph, &mut cx)
                .in_phase(BuildPhase::Recompute)?;
        }

        let model = session.base.with_graph(graph);
        let dump = config
            .dump_gradient_model
            .clone()
            .or_else(crate::env::dump_gradient_path);
        if let Some(path) = dump {
            let bytes = config
                .model_format
                .codec()
                .save(&model)
                .in_phase(BuildPhase::Serialize)?;
            fs::write(&path, bytes)
                .map_err(GraphError::from)
                .in_phase(BuildPhase::Serialize)?;
            debug!(path = %path.display(), "wrote gradient model");
        }

        info!(nodes = model.graph.len(), "built gradient graph");
        session.gradient = Some(model);
        session.info = info;
        Ok(())
    }

    pub fn forward_model(&self) -> Result<Vec<u8>, BuildError> {
        self.serialize(self.forward_graph_model()?)
    }

    pub fn backward_model(&self) -> Result<Vec<u8>, BuildError> {
        self.serialize(self.backward_graph_model()?)
    }

    pub fn gradient_model(&self) -> Result<Vec<u8>, BuildError> {
        self.serialize(self.gradient_graph_model()?)
    }

    pub fn forward_graph(&self) -> Result<&Graph, BuildError> {
        self.forward_graph_model().map(|model| &model.graph)
    }

    pub fn backward_graph(&self) -> Result<&Graph, BuildError> {
        self.backward_graph_model().map(|model| &model.graph)
    }

    pub fn gradient_graph(&self) -> Result<&Graph, BuildError> {
        self.gradient_graph_model().map(|model| &model.graph)
    }

    pub fn split_graphs_info(&self) -> Result<&SplitGraphsInfo, BuildError> {
        self.session().map(|session| &session.info)
    }

    /// Constants removed from the model when their names were promoted to
    /// graph inputs, in configuration order.
    pub fn trainable_initializers(&self) -> Result<&[(String, Initializer)], BuildError> {
        self.session().map(|session| session.trainable.as_slice())
    }

    fn session(&self) -> Result<&Session, BuildError> {
        self.session.as_ref().ok_or(BuildError::NotInitialized)
    }

    fn forward_graph_model(&self) -> Result<&Model, BuildError> {
        self.session()?
            .forward
            .as_ref()
            .ok_or(BuildError::NotBuilt("forward"))
    }

    fn backward_graph_model(&self) -> Result<&Model, BuildError> {
        self.session()?
            .backward
            .as_ref()
            .ok_or(BuildError::NotBuilt("backward"))
    }

    fn gradient_graph_model(&self) -> Result<&Model, BuildError> {
        self.session()?
            .gradient
            .as_ref()
            .ok_or(BuildError::NotBuilt("gradient"))
    }

    fn serialize(&self, model: &Model) -> Result<Vec<u8>, BuildError> {
        self.session()?
            .config
            .model_format
            .codec()
            .save(model)
            .in_phase(BuildPhase::Serialize)
    }
}

fn specialize_input_shapes(
    graph: &mut Graph,
    user_inputs: &[String],
    shapes: &[Vec<i64>],
) -> GraphResult<()> {
    if shapes.len() != user_inputs.len() {
        return Err(GraphError::InvalidShapeRequest {
            expected: user_inputs.len(),
            found: shapes.len(),
        });
    }
    for (name, dims) in user_inputs.iter().zip(shapes) {
        let dtype = graph.type_of(name).and_then(|ty| ty.dtype);
        graph.set_value_type(
            name,
            TypeInfo {
                dtype,
                shape: Some(Shape::from_static(dims)),
            },
        );
    }
    Ok(())
}

/// Runs the pre-training passes and differentiates the user outputs with
/// respect to the trainable initializers and grad-requiring inputs.
fn differentiate(
    passes: &PassManager,
    differentiator: &dyn Differentiator,
    mut graph: Graph,
    config: &BuildConfig,
    cx: &mut PassContext,
) -> Result<Graph, BuildError> {
    passes
        .apply_up_to(&mut graph, config.optimization_level, cx)
        .in_phase(BuildPhase::Optimize)?;
    let request = GradientRequest::new(graph.outputs().to_vec(), config.gradient_targets())
        .with_invertible_layernorm_grad(config.use_invertible_layernorm_grad);
    differentiator
        .differentiate(&graph, &request)
        .in_phase(BuildPhase::Differentiate)
}

/// Declares output gradients that gradient nodes read but nothing produces
/// as graph inputs, so the host can feed them.
fn wire_gradient_inputs(graph: &mut Graph, info: &mut SplitGraphsInfo) {
    let mut consumed: HashSet<String> = HashSet::new();
    let mut produced: HashSet<String> = HashSet::new();
    for node in graph.nodes() {
        consumed.extend(node.input_names().map(str::to_string));
        produced.extend(node.output_names().map(str::to_string));
    }

    info.user_output_grad_names.clear();
    info.backward_output_grad_names.clear();
    let mut inputs = graph.inputs().to_vec();
    for output in &info.user_output_names {
        let grad = gradient_name(output);
        if !consumed.contains(&grad) {
            continue;
        }
        info.user_output_grad_names.push(grad.clone());
        if produced.contains(&grad) {
            continue;
        }
        let ty = graph.type_of(output).cloned();
        graph.get_or_create_value(&grad, ty.as_ref());
        info.backward_output_grad_names.push(grad.clone());
        if !inputs.contains(&grad) {
            inputs.push(grad);
        }
    }
    graph.set_inputs(inputs);
}

/// Outputs become user outputs, input gradients, initializer gradients.
fn set_gradient_outputs(
    graph: &mut Graph,
    config: &BuildConfig,
    info: &mut SplitGraphsInfo,
) -> GraphResult<()> {
    info.initializer_grad_names_to_train = info
        .initializer_names_to_train
        .iter()
        .map(|name| gradient_name(name))
        .collect();
    reorder_outputs(graph, info, &config.input_names_require_grad)
}
