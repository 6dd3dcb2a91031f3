use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::graph::model::ModelFormat;
use crate::passes::recompute::RecomputeConfig;
use crate::passes::OptimizationLevel;

/// Options for one [`GradientGraphBuilder`](super::GradientGraphBuilder) session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Initializers to train, in the order their gradients are reported.
    pub initializer_names_to_train: Vec<String>,
    /// User inputs whose gradients are reported.
    pub input_names_require_grad: Vec<String>,
    pub use_invertible_layernorm_grad: bool,
    pub enable_recompute: bool,
    pub recompute: RecomputeConfig,
    pub model_format: ModelFormat,
    pub optimization_level: OptimizationLevel,
    /// Write the gradient model here after `build()`.
    pub dump_gradient_model: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            initializer_names_to_train: Vec::new(),
            input_names_require_grad: Vec::new(),
            use_invertible_layernorm_grad: false,
            enable_recompute: false,
            recompute: RecomputeConfig::default(),
            model_format: ModelFormat::default(),
            optimization_level: OptimizationLevel::default(),
            dump_gradient_model: None,
        }
    }
}

impl BuildConfig {
    pub fn with_trainable_initializers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.initializer_names_to_train = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_inputs_requiring_grad<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_names_require_grad = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_invertible_layernorm_grad(mut self, enabled: bool) -> Self {
        self.use_invertible_layernorm_grad = enabled;
        self
    }

    pub fn with_recompute(mut self, enabled: bool) -> Self {
        self.enable_recompute = enabled;
        self
    }

    pub fn with_recompute_config(mut self, config: RecomputeConfig) -> Self {
        self.recompute = config;
        self
    }

    pub fn with_model_format(mut self, format: ModelFormat) -> Self {
        self.model_format = format;
        self
    }

    pub fn with_optimization_level(mut self, level: OptimizationLevel) -> Self {
        self.optimization_level = level;
        self
    }

    pub fn with_gradient_dump(mut self, path: impl Into<PathBuf>) -> Self {
        self.dump_gradient_model = Some(path.into());
        self
    }

    /// Trainable initializers followed by grad-requiring inputs, without
    /// repeats.
    pub(crate) fn gradient_targets(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in self
            .initializer_names_to_train
            .iter()
            .chain(self.input_names_require_grad.iter())
        {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    pub(crate) fn recompute_enabled(&self) -> bool {
        crate::env::recompute_override().unwrap_or(self.enable_recompute)
    }
}
