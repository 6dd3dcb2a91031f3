use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;

use super::node::{Node, NodeId, NodeSpec};
use crate::error::{GraphError, GraphResult};

/// Structural lookups over a graph's nodes, keyed by tensor and node name.
///
/// `consumers` records one entry per consuming input slot, so a node that reads
/// the same tensor twice appears twice. Empty names are never indexed.
#[derive(Debug, Clone, Default)]
pub struct GraphIndices {
    producers: HashMap<String, NodeId>,
    consumers: HashMap<String, SmallVec<[NodeId; 4]>>,
    names: HashMap<String, NodeId>,
}

impl GraphIndices {
    /// Indexes the given nodes, rejecting duplicate node names and tensors
    /// with more than one producer.
    pub fn build<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> GraphResult<Self> {
        let mut indices = GraphIndices::default();
        for node in nodes {
            indices.check_insert(&node.name, &node.outputs)?;
            indices.insert(node);
        }
        Ok(indices)
    }

    pub(crate) fn check_spec(&self, spec: &NodeSpec) -> GraphResult<()> {
        self.check_insert(&spec.name, &spec.outputs)
    }

    fn check_insert(&self, name: &str, outputs: &[String]) -> GraphResult<()> {
        if name.is_empty() {
            return Err(GraphError::invalid("node names must not be empty"));
        }
        if self.names.contains_key(name) {
            return Err(GraphError::invalid(format!(
                "node name `{name}` is already in use"
            )));
        }
        let mut seen = HashSet::new();
        for output in outputs.iter().filter(|o| !o.is_empty()) {
            if !seen.insert(output.as_str()) {
                return Err(GraphError::invalid(format!(
                    "node `{name}` lists output `{output}` twice"
                )));
            }
            if let Some(existing) = self.producers.get(output) {
                return Err(GraphError::invalid(format!(
                    "tensor `{output}` of node `{name}` is already produced by {existing}"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn insert(&mut self, node: &Node) {
        self.names.insert(node.name.clone(), node.id);
        for output in node.output_names() {
            self.producers.insert(output.to_string(), node.id);
        }
        for input in node.input_names() {
            self.consumers
                .entry(input.to_string())
                .or_default()
                .push(node.id);
        }
    }

    pub(crate) fn remove(&mut self, node: &Node) {
        self.names.remove(&node.name);
        for output in node.output_names() {
            if self.producers.get(output) == Some(&node.id) {
                self.producers.remove(output);
            }
        }
        for input in node.input_names() {
            self.drop_consumer_slot(input, node.id);
        }
    }

    /// Moves a single consumer slot of `id` from `old` to `new`.
    pub(crate) fn move_consumer_slot(&mut self, id: NodeId, old: &str, new: &str) {
        if !old.is_empty() {
            self.drop_consumer_slot(old, id);
        }
        if !new.is_empty() {
            self.consumers.entry(new.to_string()).or_default().push(id);
        }
    }

    fn drop_consumer_slot(&mut self, name: &str, id: NodeId) {
        if let Some(users) = self.consumers.get_mut(name) {
            if let Some(pos) = users.iter().position(|user| *user == id) {
                users.remove(pos);
            }
            if users.is_empty() {
                self.consumers.remove(name);
            }
        }
    }

    pub fn producer(&self, name: &str) -> Option<NodeId> {
        self.producers.get(name).copied()
    }

    /// One entry per consuming input slot, in insertion order.
    pub fn consumer_slots(&self, name: &str) -> &[NodeId] {
        self.consumers
            .get(name)
            .map(|users| users.as_slice())
            .unwrap_or(&[])
    }

    pub fn node_named(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    pub fn produced_names(&self) -> impl Iterator<Item = &str> {
        self.producers.keys().map(String::as_str)
    }
}
