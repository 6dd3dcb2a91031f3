//! Graph rewrite passes and the per-session pass manager.

mod cse;
mod dce;
mod identity;
mod pipeline;
pub mod recompute;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::GraphResult;
use crate::graph::{Graph, Node};

pub use cse::CommonSubexpressionEliminationPass;
pub use dce::DeadNodeEliminationPass;
pub use identity::IdentityEliminationPass;
pub use pipeline::{LevelSchedule, LevelStep, PassManager};

/// Statistics returned by a [`GraphPass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the graph.
    pub changed: bool,
    /// Fixed-point iterations executed.
    pub iterations: usize,
    /// Consumer slots rewired to a different tensor.
    pub rewrites_applied: usize,
    pub erased_nodes: usize,
    pub inserted_nodes: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            iterations: self.iterations + other.iterations,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_nodes: self.erased_nodes + other.erased_nodes,
            inserted_nodes: self.inserted_nodes + other.inserted_nodes,
        }
    }
}

/// Optimization tiers, applied cumulatively from `Basic` up to the requested
/// level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationLevel {
    Disabled,
    Basic,
    #[default]
    Extended,
}

impl OptimizationLevel {
    pub const ALL: [OptimizationLevel; 2] = [OptimizationLevel::Basic, OptimizationLevel::Extended];
}

/// Per-run state handed to every pass.
#[derive(Debug, Clone, Default)]
pub struct PassContext {
    protected: HashSet<String>,
}

impl PassContext {
    pub fn new<I, S>(protected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PassContext {
            protected: protected.into_iter().map(Into::into).collect(),
        }
    }

    /// Names passes must neither remove nor rewrite away, such as trainable
    /// weights.
    pub fn is_protected(&self, name: &str) -> bool {
        self.protected.contains(name)
    }

    pub fn protect(&mut self, name: impl Into<String>) {
        self.protected.insert(name.into());
    }
}

/// A rewrite over the whole graph. Passes keep declared inputs and outputs
/// unchanged.
pub trait GraphPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &mut Graph, cx: &mut PassContext) -> GraphResult<PassResult>;
}

/// Ops whose repeated evaluation may produce different values.
pub(crate) fn is_nondeterministic(op_type: &str) -> bool {
    matches!(
        op_type,
        "Dropout"
            | "BiasDropout"
            | "TrainableDropout"
            | "RandomNormal"
            | "RandomNormalLike"
            | "RandomUniform"
            | "RandomUniformLike"
            | "Multinomial"
    )
}

/// Nodes that must survive even when none of their outputs are read.
pub(crate) fn has_effects(node: &Node) -> bool {
    node.op_type == "Yield" || node.output_names().next().is_none()
}
