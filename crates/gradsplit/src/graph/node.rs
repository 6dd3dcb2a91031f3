use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::Attribute;

/// Stable node identifier. Never reused within a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Which half of the training step a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PassTag {
    #[default]
    Forward,
    Backward,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op_type: String,
    #[serde(default)]
    pub domain: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub pass: PassTag,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub recompute_of: Option<NodeId>,
}

impl Node {
    pub fn is_backward(&self) -> bool {
        self.pass == PassTag::Backward
    }

    pub fn is_recompute(&self) -> bool {
        self.recompute_of.is_some()
    }

    /// Non-empty input names in slot order.
    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(String::as_str).filter(|n| !n.is_empty())
    }

    /// Non-empty output names in slot order.
    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(String::as_str).filter(|n| !n.is_empty())
    }

    pub fn attribute(&self, key: &str) -> Option<&Attribute> {
        self.attributes.get(key)
    }

    pub fn int_attribute(&self, key: &str) -> Option<i64> {
        match self.attributes.get(key) {
            Some(Attribute::Int(value)) => Some(*value),
            _ => None,
        }
    }
}

/// Everything needed to insert a node; the graph assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub name: String,
    pub op_type: String,
    pub domain: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: BTreeMap<String, Attribute>,
    pub description: String,
    pub pass: PassTag,
    pub priority: i32,
    pub recompute_of: Option<NodeId>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, op_type: impl Into<String>) -> Self {
        NodeSpec {
            name: name.into(),
            op_type: op_type.into(),
            domain: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attributes: BTreeMap::new(),
            description: String::new(),
            pass: PassTag::Forward,
            priority: 0,
            recompute_of: None,
        }
    }

    pub fn inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn attr(mut self, key: impl Into<String>, value: Attribute) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn attributes(mut self, attributes: BTreeMap<String, Attribute>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn pass(mut self, pass: PassTag) -> Self {
        self.pass = pass;
        self
    }

    pub fn backward(self) -> Self {
        self.pass(PassTag::Backward)
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn recompute_of(mut self, original: NodeId) -> Self {
        self.recompute_of = Some(original);
        self
    }

    pub(crate) fn into_node(self, id: NodeId) -> Node {
        Node {
            id,
            name: self.name,
            op_type: self.op_type,
            domain: self.domain,
            inputs: self.inputs,
            outputs: self.outputs,
            attributes: self.attributes,
            description: self.description,
            pass: self.pass,
            priority: self.priority,
            recompute_of: self.recompute_of,
        }
    }
}

impl From<&Node> for NodeSpec {
    fn from(node: &Node) -> Self {
        NodeSpec {
            name: node.name.clone(),
            op_type: node.op_type.clone(),
            domain: node.domain.clone(),
            inputs: node.inputs.clone(),
            outputs: node.outputs.clone(),
            attributes: node.attributes.clone(),
            description: node.description.clone(),
            pass: node.pass,
            priority: node.priority,
            recompute_of: node.recompute_of,
        }
    }
}
