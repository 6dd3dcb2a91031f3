//! Transformer-layer recompute (activation checkpointing).
//!
//! For every detected layer the nodes strictly inside it are duplicated into a
//! parallel branch tagged for the backward pass, so gradient nodes can read
//! regenerated activations instead of keeping the forward ones alive. Dropout
//! nodes are replayed from their saved mask so the regenerated values match.
//!
//! The pass plans every addition against the unmodified graph, then applies
//! the plan to a staged copy that replaces the graph only when it resolves.

mod boundary;
mod span;

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{GraphPass, PassContext, PassResult};
use crate::error::{GraphError, GraphResult};
use crate::graph::{first_free, Graph, Node, NodeId, NodeSpec, MS_DOMAIN, RECOMPUTE_PRIORITY};

pub use boundary::{LayerBoundary, LayerBoundaryStrategy, TransformerLayerBoundaries};
pub use span::nodes_between;

const RECOMPUTE_SUFFIX: &str = "_recompute";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecomputeConfig {
    /// Point backward consumers of in-layer activations at the regenerated
    /// twins.
    pub rewire_backward_consumers: bool,
    /// Source op to the op that replays it from the saved mask output
    /// instead of re-running it.
    pub mask_replay_ops: BTreeMap<String, String>,
}

impl Default for RecomputeConfig {
    fn default() -> Self {
        RecomputeConfig {
            rewire_backward_consumers: true,
            mask_replay_ops: BTreeMap::from([
                ("Dropout".to_string(), "DropoutGrad".to_string()),
                ("TrainableDropout".to_string(), "TrainableDropoutGrad".to_string()),
            ]),
        }
    }
}

impl RecomputeConfig {
    pub fn with_rewire_backward_consumers(mut self, enabled: bool) -> Self {
        self.rewire_backward_consumers = enabled;
        self
    }
}

/// A backward input slot to point at a twin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewire {
    pub node: NodeId,
    pub slot: usize,
    pub twin: String,
}

/// Every mutation one recompute run will make.
#[derive(Debug, Clone, Default)]
pub struct RecomputePlan {
    pub layers: Vec<LayerBoundary>,
    pub duplicates: Vec<NodeSpec>,
    /// (original tensor, twin tensor), in creation order.
    pub twins: Vec<(String, String)>,
    pub rewires: Vec<Rewire>,
}

impl RecomputePlan {
    pub fn is_empty(&self) -> bool {
        self.duplicates.is_empty() && self.rewires.is_empty()
    }
}

pub struct RecomputePass {
    strategy: Box<dyn LayerBoundaryStrategy>,
    config: RecomputeConfig,
}

impl RecomputePass {
    const NAME: &'static str = "transformer_layer_recompute";

    pub fn new(strategy: impl LayerBoundaryStrategy + 'static) -> Self {
        RecomputePass {
            strategy: Box::new(strategy),
            config: RecomputeConfig::default(),
        }
    }

    pub fn transformer_layers() -> Self {
        Self::new(TransformerLayerBoundaries::default())
    }

    pub fn with_config(mut self, config: RecomputeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RecomputeConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: RecomputeConfig) {
        self.config = config;
    }

    /// Computes the duplicates, twins and rewires without touching the graph.
    pub fn plan(&self, graph: &Graph) -> GraphResult<RecomputePlan> {
        let layers = self.strategy.find_boundaries(graph)?;
        let mut planner = Planner::new(graph, &self.config);
        for layer in &layers {
            let span = nodes_between(graph, &layer.start, &layer.end)?;
            debug!(start = %layer.start, end = %layer.end, nodes = span.len(), "layer span");
            planner.duplicate_span(&span)?;
        }
        let mut plan = planner.finish();
        plan.layers = layers;
        Ok(plan)
    }

    /// Applies `plan` to a staged copy and swaps it in once it resolves.
    pub fn apply_plan(&self, graph: &mut Graph, plan: &RecomputePlan) -> GraphResult<PassResult> {
        if plan.is_empty() {
            return Ok(PassResult::default());
        }
        let mut staged = graph.clone();
        for (original, twin) in &plan.twins {
            let ty = staged.type_of(original).cloned();
            staged.get_or_create_value(twin, ty.as_ref());
            staged.record_recompute_twin(original, twin);
        }
        for spec in &plan.duplicates {
            staged.add_node(spec.clone())?;
        }
        for rewire in &plan.rewires {
            staged.replace_input(rewire.node, rewire.slot, &rewire.twin)?;
        }
        staged.resolve()?;
        *graph = staged;

        info!(
            layers = plan.layers.len(),
            duplicates = plan.duplicates.len(),
            rewires = plan.rewires.len(),
            "inserted recompute nodes"
        );
        Ok(PassResult {
            changed: true,
            iterations: 1,
            rewrites_applied: plan.rewires.len(),
            erased_nodes: 0,
            inserted_nodes: plan.duplicates.len(),
        })
    }
}

impl Default for RecomputePass {
    fn default() -> Self {
        Self::transformer_layers()
    }
}

impl GraphPass for RecomputePass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut PassContext) -> GraphResult<PassResult> {
        let plan = self.plan(graph)?;
        self.apply_plan(graph, &plan)
    }
}

struct Planner<'g> {
    graph: &'g Graph,
    config: &'g RecomputeConfig,
    planned: HashSet<NodeId>,
    twins: HashMap<String, String>,
    twin_order: Vec<(String, String)>,
    value_names: HashSet<String>,
    node_names: HashSet<String>,
    duplicates: Vec<NodeSpec>,
}

impl<'g> Planner<'g> {
    fn new(graph: &'g Graph, config: &'g RecomputeConfig) -> Self {
        Planner {
            graph,
            config,
            planned: HashSet::new(),
            twins: HashMap::new(),
            twin_order: Vec::new(),
            value_names: HashSet::new(),
            node_names: HashSet::new(),
            duplicates: Vec::new(),
        }
    }

    fn duplicate_span(&mut self, span: &[NodeId]) -> GraphResult<()> {
        let graph = self.graph;
        let members: HashSet<NodeId> = span.iter().copied().collect();
        for &id in span {
            let node = graph.node(id).ok_or(GraphError::UnknownNode(id))?;
            if node.is_backward() || node.is_recompute() || self.planned.contains(&id) {
                continue;
            }
            if self.already_recomputed(node) {
                continue;
            }
            self.planned.insert(id);
            let spec = self.duplicate(node, &members);
            self.duplicates.push(spec);
        }
        Ok(())
    }

    fn already_recomputed(&self, node: &Node) -> bool {
        node.output_names()
            .next()
            .is_some_and(|name| self.graph.recompute_twin(name).is_some())
    }

    fn duplicate(&mut self, node: &Node, members: &HashSet<NodeId>) -> NodeSpec {
        let inputs: Vec<String> = node
            .inputs
            .iter()
            .map(|input| self.rebased_input(input, members))
            .collect();

        let name = first_free(&format!("{}{RECOMPUTE_SUFFIX}", node.name), |candidate| {
            self.node_names.contains(candidate) || self.graph.node_by_name(candidate).is_some()
        });
        self.node_names.insert(name.clone());

        let config = self.config;
        let replay_op = config.mask_replay_ops.get(&node.op_type);
        let mask = node.outputs.get(1).filter(|mask| !mask.is_empty());
        let base = NodeSpec::new(name, node.op_type.clone())
            .description(format!("Recompute of {}", node.name))
            .backward()
            .priority(RECOMPUTE_PRIORITY)
            .recompute_of(node.id);

        match (replay_op, mask, node.outputs.first()) {
            (Some(replay_op), Some(mask), Some(output)) if !output.is_empty() => {
                let mut replay_inputs = vec![inputs.first().cloned().unwrap_or_default(), mask.clone()];
                if let Some(ratio) = node.inputs.get(1).filter(|ratio| !ratio.is_empty()) {
                    replay_inputs.push(ratio.clone());
                }
                let twin = self.twin_for(output);
                NodeSpec {
                    op_type: replay_op.clone(),
                    domain: MS_DOMAIN.to_string(),
                    ..base
                }
                .inputs(replay_inputs)
                .outputs([twin])
            }
            _ => {
                if replay_op.is_some() {
                    warn!(node = %node.name, "dropout without a mask output; recomputing it directly");
                }
                let outputs: Vec<String> = node
                    .outputs
                    .iter()
                    .map(|output| {
                        if output.is_empty() {
                            String::new()
                        } else {
                            self.twin_for(output)
                        }
                    })
                    .collect();
                base.domain(node.domain.clone())
                    .attributes(node.attributes.clone())
                    .inputs(inputs)
                    .outputs(outputs)
            }
        }
    }

    /// Inputs produced inside the span read the twin; all others are reused.
    fn rebased_input(&self, input: &str, members: &HashSet<NodeId>) -> String {
        if input.is_empty() || self.graph.is_initializer(input) {
            return input.to_string();
        }
        let inside = self
            .graph
            .producer_of(input)
            .is_some_and(|producer| members.contains(&producer.id));
        if !inside {
            return input.to_string();
        }
        self.twins
            .get(input)
            .cloned()
            .or_else(|| self.graph.recompute_twin(input).map(str::to_string))
            .unwrap_or_else(|| input.to_string())
    }

    fn twin_for(&mut self, original: &str) -> String {
        if let Some(existing) = self.twins.get(original) {
            return existing.clone();
        }
        let twin = first_free(&format!("{original}{RECOMPUTE_SUFFIX}"), |candidate| {
            self.value_names.contains(candidate) || self.graph.value_name_in_use(candidate)
        });
        self.value_names.insert(twin.clone());
        self.twins.insert(original.to_string(), twin.clone());
        self.twin_order.push((original.to_string(), twin.clone()));
        twin
    }

    fn finish(self) -> RecomputePlan {
        let mut rewires = Vec::new();
        if self.config.rewire_backward_consumers {
            for node in self.graph.nodes() {
                if !node.is_backward() || node.is_recompute() {
                    continue;
                }
                for (slot, input) in node.inputs.iter().enumerate() {
                    if let Some(twin) = self.twins.get(input) {
                        rewires.push(Rewire {
                            node: node.id,
                            slot,
                            twin: twin.clone(),
                        });
                    }
                }
            }
        }
        RecomputePlan {
            layers: Vec::new(),
            duplicates: self.duplicates,
            twins: self.twin_order,
            rewires,
        }
    }
}
