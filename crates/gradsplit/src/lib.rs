//! Training-graph preparation: differentiate a model graph, optionally insert
//! transformer-layer recompute, then split it into a forward graph and a
//! backward graph connected by explicit hand-off tensors.

pub mod autodiff;
pub mod build;
mod env;
pub mod error;
pub mod graph;
pub mod passes;

pub use autodiff::{ChainRuleDifferentiator, Differentiator, GradientRequest};
pub use build::{BuildConfig, GradientGraphBuilder, SplitGraphsInfo};
pub use error::{BuildError, BuildPhase, GraphError, GraphResult};
pub use graph::model::{Model, ModelCodec, ModelFormat};
pub use graph::{Graph, Node, NodeId, NodeSpec, PassTag};
pub use passes::recompute::{RecomputeConfig, RecomputePass, TransformerLayerBoundaries};
pub use passes::{OptimizationLevel, PassManager};
