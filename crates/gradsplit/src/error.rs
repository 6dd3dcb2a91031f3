use std::fmt;

use thiserror::Error;

use crate::graph::NodeId;

pub type GraphResult<T> = Result<T, GraphError>;

/// Failures raised by graph construction, validation, passes and the codecs.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("failed to load model: {0}")]
    ModelLoad(String),
    #[error("failed to serialize model: {0}")]
    Serialization(String),
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("graph contains a cycle through nodes [{}]", nodes.join(", "))]
    CycleDetected { nodes: Vec<String> },
    #[error("found {starts} layer start boundaries but {ends} layer end boundaries")]
    UnbalancedLayerBoundaries { starts: usize, ends: usize },
    #[error("split inconsistency on `{name}`: {reason}")]
    SplitInconsistency { name: String, reason: String },
    #[error("required gradient `{name}` is not produced by the gradient graph")]
    MissingRequiredGradient { name: String },
    #[error("no gradient rule for op `{op_type}` used by node `{node}`")]
    NoGradientRule { op_type: String, node: String },
    #[error("expected {expected} input shapes, got {found}")]
    InvalidShapeRequest { expected: usize, found: usize },
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GraphError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        GraphError::InvalidGraph(message.into())
    }

    pub(crate) fn split(name: impl Into<String>, reason: impl Into<String>) -> Self {
        GraphError::SplitInconsistency {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Build stage that was running when a [`BuildError::Phase`] was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildPhase {
    Initialize,
    Specialize,
    Optimize,
    Differentiate,
    Recompute,
    Split,
    Yield,
    Serialize,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BuildPhase::Initialize => "initialize",
            BuildPhase::Specialize => "shape specialization",
            BuildPhase::Optimize => "graph optimization",
            BuildPhase::Differentiate => "differentiation",
            BuildPhase::Recompute => "recompute insertion",
            BuildPhase::Split => "split",
            BuildPhase::Yield => "yield insertion",
            BuildPhase::Serialize => "serialization",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{phase} failed: {source}")]
    Phase {
        phase: BuildPhase,
        #[source]
        source: GraphError,
    },
    #[error("builder has not been initialized")]
    NotInitialized,
    #[error("the {0} model has not been built")]
    NotBuilt(&'static str),
}

impl BuildError {
    pub fn phase(&self) -> Option<BuildPhase> {
        match self {
            BuildError::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    pub fn graph_error(&self) -> Option<&GraphError> {
        match self {
            BuildError::Phase { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub(crate) trait InPhase<T> {
    fn in_phase(self, phase: BuildPhase) -> Result<T, BuildError>;
}

impl<T> InPhase<T> for GraphResult<T> {
    fn in_phase(self, phase: BuildPhase) -> Result<T, BuildError> {
        self.map_err(|source| BuildError::Phase { phase, source })
    }
}
