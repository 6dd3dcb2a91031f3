//! Layer boundary detection.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{GraphError, GraphResult};
use crate::graph::{Graph, Node};

/// Start and end tensor names bracketing one repeated layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerBoundary {
    pub start: String,
    pub end: String,
}

/// Locates layer boundaries in a graph.
pub trait LayerBoundaryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns matched (start, end) pairs in discovery order.
    fn find_boundaries(&self, graph: &Graph) -> GraphResult<Vec<LayerBoundary>>;
}

/// Matches the transformer block motif: a layer opens at a normalization or
/// dropout node fanning out to the attention projections and closes at the
/// normalization reached from the feed-forward activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerLayerBoundaries {
    pub normalization_ops: Vec<String>,
    pub dropout_ops: Vec<String>,
    pub activation_ops: Vec<String>,
    /// Consumer edge count that marks a layer start.
    pub start_fanout: usize,
}

impl Default for TransformerLayerBoundaries {
    fn default() -> Self {
        TransformerLayerBoundaries {
            normalization_ops: vec!["LayerNormalization".into()],
            dropout_ops: vec![
                "Dropout".into(),
                "BiasDropout".into(),
                "TrainableDropout".into(),
            ],
            activation_ops: vec!["Gelu".into(), "BiasGelu".into(), "FastGelu".into()],
            start_fanout: 4,
        }
    }
}

impl TransformerLayerBoundaries {
    pub fn with_start_fanout(mut self, fanout: usize) -> Self {
        self.start_fanout = fanout;
        self
    }

    fn is_normalization(&self, op_type: &str) -> bool {
        self.normalization_ops.iter().any(|op| op == op_type)
    }

    fn is_dropout(&self, op_type: &str) -> bool {
        self.dropout_ops.iter().any(|op| op == op_type)
    }

    fn is_activation(&self, op_type: &str) -> bool {
        self.activation_ops.iter().any(|op| op == op_type)
    }

    /// From an activation, walks first consumers to a dropout and then to a
    /// normalization node; its first output closes the layer.
    fn trace_layer_end(&self, graph: &Graph, activation: &Node) -> Option<String> {
        let mut next = first_structural_consumer(graph, activation)?;
        while !self.is_dropout(&next.op_type) {
            match first_structural_consumer(graph, next) {
                Some(consumer) => next = consumer,
                None => break,
            }
        }
        while !self.is_normalization(&next.op_type) {
            match first_structural_consumer(graph, next) {
                Some(consumer) => next = consumer,
                None => break,
            }
        }
        if !self.is_normalization(&next.op_type) {
            return None;
        }
        next.outputs.first().filter(|name| !name.is_empty()).cloned()
    }
}

impl LayerBoundaryStrategy for TransformerLayerBoundaries {
    fn name(&self) -> &'static str {
        "transformer_layers"
    }

    fn find_boundaries(&self, graph: &Graph) -> GraphResult<Vec<LayerBoundary>> {
        let mut starts = Vec::new();
        let mut ends = Vec::new();

        for id in graph.topological_order()? {
            let Some(node) = graph.node(id) else {
                continue;
            };
            if !is_structural(node) {
                continue;
            }
            let opens = self.is_normalization(&node.op_type) || self.is_dropout(&node.op_type);
            if opens && structural_edge_count(graph, node) == self.start_fanout {
                if let Some(start) = node.outputs.first().filter(|name| !name.is_empty()) {
                    debug!(node = %node.name, start = %start, "layer start");
                    starts.push(start.clone());
                }
            }
            if self.is_activation(&node.op_type) {
                if let Some(end) = self.trace_layer_end(graph, node) {
                    debug!(node = %node.name, end = %end, "layer end");
                    ends.push(end);
                }
            }
        }

        if starts.len() != ends.len() {
            return Err(GraphError::UnbalancedLayerBoundaries {
                starts: starts.len(),
                ends: ends.len(),
            });
        }
        info!(layers = starts.len(), strategy = self.name(), "found layer boundaries");
        Ok(starts
            .into_iter()
            .zip(ends)
            .map(|(start, end)| LayerBoundary { start, end })
            .collect())
    }
}

/// Original forward compute nodes; duplicates, gradient nodes and yields are
/// ignored.
fn is_structural(node: &Node) -> bool {
    !node.is_backward() && !node.is_recompute() && node.op_type != "Yield"
}

fn structural_edge_count(graph: &Graph, node: &Node) -> usize {
    node.output_names()
        .flat_map(|name| {
            graph
                .consumers_of(name)
                .into_iter()
                .filter(|consumer| is_structural(consumer))
                .map(move |consumer| consumer.input_names().filter(|n| *n == name).count())
        })
        .sum()
}

fn first_structural_consumer<'g>(graph: &'g Graph, node: &Node) -> Option<&'g Node> {
    node.output_names().find_map(|name| {
        graph
            .consumers_of(name)
            .into_iter()
            .find(|consumer| is_structural(consumer))
    })
}
