use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Names the host needs to drive the forward and backward graphs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitGraphsInfo {
    pub user_input_names: Vec<String>,
    /// User input name to its gradient name, for inputs that require grad.
    pub user_input_grad_names: BTreeMap<String, String>,
    /// Trainable initializers in configuration order.
    pub initializer_names_to_train: Vec<String>,
    pub initializer_grad_names_to_train: Vec<String>,
    pub user_output_names: Vec<String>,
    /// Gradients of user outputs that some gradient node reads.
    pub user_output_grad_names: Vec<String>,
    /// Output gradients the host feeds, i.e. not produced inside the graph.
    pub backward_output_grad_names: Vec<String>,
    /// Forward activations handed to the backward graph.
    pub intermediate_tensor_names: Vec<String>,
    pub backward_user_input_names: Vec<String>,
    pub backward_initializer_names_as_input: Vec<String>,
    /// User outputs a backward node reads, handed over after the activations.
    pub backward_user_output_names: Vec<String>,
    /// Trainable initializers in forward order, as captured by yield nodes.
    pub ordered_initializer_names: Vec<String>,
}

impl SplitGraphsInfo {
    pub fn requires_grad(&self, input: &str) -> bool {
        self.user_input_grad_names.contains_key(input)
    }
}
