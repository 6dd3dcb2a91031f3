//! Mutable dataflow graph shared by every stage of the build.
//!
//! Nodes are addressed by stable [`NodeId`]s and connected through named tensor
//! references. Producer and consumer lookups go through [`GraphIndices`], which
//! `add_node`/`remove_node`/`replace_input` keep current and `resolve` rebuilds.

mod index;
pub mod model;
mod node;
pub mod text;
mod topology;
mod types;

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, GraphResult};
pub use index::GraphIndices;
pub use node::{Node, NodeId, NodeSpec, PassTag};
use topology::ReadyOrder;
pub use types::{Attribute, DType, Dimension, Initializer, Shape, TypeInfo, ValueInfo};

/// Domain used by the training-only contrib operators.
pub const MS_DOMAIN: &str = "com.microsoft";
/// Description stamped on every node emitted by a differentiator.
pub const BACKWARD_DESCRIPTION: &str = "Backward pass";
/// Scheduling priority of recompute duplicates; lower runs later.
pub const RECOMPUTE_PRIORITY: i32 = -10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "GraphRepr", into = "GraphRepr")]
pub struct Graph {
    name: String,
    nodes: BTreeMap<NodeId, Node>,
    values: BTreeMap<String, ValueInfo>,
    initializers: BTreeMap<String, Initializer>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    next_node_id: u32,
    recompute_twins: BTreeMap<String, String>,
    indices: GraphIndices,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Graph {
            name: name.into(),
            ..Graph::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn indices(&self) -> &GraphIndices {
        &self.indices
    }

    // ---- nodes ----

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.indices.node_named(name).and_then(|id| self.nodes.get(&id))
    }

    /// Nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Inserts a node, creating references for names seen for the first time.
    /// Nothing is inserted when the name is taken or an output already has a
    /// producer.
    pub fn add_node(&mut self, spec: NodeSpec) -> GraphResult<NodeId> {
        self.indices.check_spec(&spec)?;
        let id = NodeId(self.next_node_id);
        self.next_node_id = next_id_after(id)?;
        for name in spec.inputs.iter().chain(spec.outputs.iter()) {
            if !name.is_empty() && !self.values.contains_key(name) {
                self.values.insert(name.clone(), ValueInfo::new(name.clone()));
            }
        }
        let node = spec.into_node(id);
        self.indices.insert(&node);
        self.nodes.insert(id, node);
        Ok(id)
    }

    /// Removes a node. Its outputs lose their producer; consumers keep
    /// referring to the names.
    pub fn remove_node(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        self.indices.remove(&node);
        Some(node)
    }

    /// Points input slot `slot` of node `id` at `name`.
    pub fn replace_input(&mut self, id: NodeId, slot: usize, name: &str) -> GraphResult<()> {
        let node = self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))?;
        let Some(current) = node.inputs.get_mut(slot) else {
            return Err(GraphError::invalid(format!(
                "node `{}` has no input slot {slot}",
                node.name
            )));
        };
        let old = std::mem::replace(current, name.to_string());
        self.indices.move_consumer_slot(id, &old, name);
        if !name.is_empty() && !self.values.contains_key(name) {
            self.values.insert(name.to_string(), ValueInfo::new(name));
        }
        Ok(())
    }

    /// Points every consuming slot of `from` at `to` and returns how many
    /// slots moved.
    pub fn replace_all_uses(&mut self, from: &str, to: &str) -> GraphResult<usize> {
        let mut rewired = 0;
        for consumer in self.consumer_ids(from) {
            let slots: Vec<usize> = self
                .nodes
                .get(&consumer)
                .map(|node| input_slots_of(node, from))
                .unwrap_or_default();
            for slot in slots {
                self.replace_input(consumer, slot, to)?;
                rewired += 1;
            }
        }
        Ok(rewired)
    }

    pub fn producer_of(&self, name: &str) -> Option<&Node> {
        self.indices.producer(name).and_then(|id| self.nodes.get(&id))
    }

    /// Distinct consumers of `name`, ordered by node id.
    pub fn consumers_of(&self, name: &str) -> Vec<&Node> {
        self.consumer_ids(name)
            .into_iter()
            .filter_map(|id| self.nodes.get(&id))
            .collect()
    }

    pub fn consumer_ids(&self, name: &str) -> Vec<NodeId> {
        let ids: BTreeSet<NodeId> = self.indices.consumer_slots(name).iter().copied().collect();
        ids.into_iter().collect()
    }

    /// Number of consuming input slots across all outputs of `id`.
    pub fn consumer_edge_count(&self, id: NodeId) -> usize {
        self.nodes.get(&id).map_or(0, |node| {
            node.output_names()
                .map(|name| self.indices.consumer_slots(name).len())
                .sum()
        })
    }

    /// Kahn order with ties broken by node id.
    pub fn topological_order(&self) -> GraphResult<Vec<NodeId>> {
        topology::kahn(self, ReadyOrder::ById)
    }

    /// Kahn order preferring higher-priority ready nodes.
    pub fn execution_order(&self) -> GraphResult<Vec<NodeId>> {
        topology::kahn(self, ReadyOrder::ByPriority)
    }

    // ---- tensor references ----

    pub fn value(&self, name: &str) -> Option<&ValueInfo> {
        self.values.get(name)
    }

    pub fn values(&self) -> impl Iterator<Item = &ValueInfo> {
        self.values.values()
    }

    pub fn get_or_create_value(&mut self, name: &str, hint: Option<&TypeInfo>) -> &ValueInfo {
        self.values.entry(name.to_string()).or_insert_with(|| {
            ValueInfo::with_type(name, hint.cloned().unwrap_or_default())
        })
    }

    /// Overwrites the recorded type of `name`, creating the reference if needed.
    pub fn set_value_type(&mut self, name: &str, ty: TypeInfo) {
        self.values
            .entry(name.to_string())
            .or_insert_with(|| ValueInfo::new(name))
            .ty = ty;
    }

    pub fn type_of(&self, name: &str) -> Option<&TypeInfo> {
        self.values.get(name).map(|v| &v.ty)
    }

    /// Returns `base` if no node output, reference or initializer uses it,
    /// otherwise the first free `base_<n>`.
    pub fn unique_value_name(&self, base: &str) -> String {
        first_free(base, |name| self.value_name_in_use(name))
    }

    pub fn value_name_in_use(&self, name: &str) -> bool {
        self.values.contains_key(name)
            || self.initializers.contains_key(name)
            || self.indices.producer(name).is_some()
    }

    pub fn unique_node_name(&self, base: &str) -> String {
        first_free(base, |name| self.indices.node_named(name).is_some())
    }

    /// Drops reference records and side-table entries no node, declared
    /// input/output or initializer mentions.
    pub fn prune_values(&mut self) {
        let mut live: HashSet<String> = HashSet::new();
        for node in self.nodes.values() {
            live.extend(node.input_names().map(str::to_string));
            live.extend(node.output_names().map(str::to_string));
        }
        live.extend(self.inputs.iter().cloned());
        live.extend(self.outputs.iter().cloned());
        live.extend(self.initializers.keys().cloned());
        self.values.retain(|name, _| live.contains(name));
        self.recompute_twins.retain(|_, twin| live.contains(twin));
    }

    // ---- initializers ----

    pub fn initializer(&self, name: &str) -> Option<&Initializer> {
        self.initializers.get(name)
    }

    pub fn initializers(&self) -> impl Iterator<Item = (&str, &Initializer)> {
        self.initializers.iter().map(|(name, init)| (name.as_str(), init))
    }

    pub fn is_initializer(&self, name: &str) -> bool {
        self.initializers.contains_key(name)
    }

    pub fn add_initializer(&mut self, name: impl Into<String>, init: Initializer) {
        let name = name.into();
        self.set_value_type(&name, init.type_info());
        self.initializers.insert(name, init);
    }

    /// Removes the constant and returns it. The reference record stays.
    pub fn demote_initializer(&mut self, name: &str) -> Option<Initializer> {
        self.initializers.remove(name)
    }

    /// Turns a constant into a declared graph input appended after the
    /// existing inputs and hands the removed constant back to the caller.
    pub fn promote_initializer_to_input(&mut self, name: &str) -> GraphResult<Initializer> {
        let init = self.initializers.remove(name).ok_or_else(|| {
            GraphError::ModelLoad(format!("`{name}` is not an initializer of the model"))
        })?;
        self.set_value_type(name, init.type_info());
        if !self.inputs.iter().any(|input| input == name) {
            self.inputs.push(name.to_string());
        }
        Ok(init)
    }

    /// Keeps only the constants whose names are in `keep`.
    pub fn retain_initializers(&mut self, keep: &HashSet<String>) {
        self.initializers.retain(|name, _| keep.contains(name));
    }

    // ---- declared boundary ----

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn set_inputs(&mut self, inputs: Vec<String>) {
        for name in &inputs {
            self.get_or_create_value(name, None);
        }
        self.inputs = inputs;
    }

    pub fn set_outputs(&mut self, outputs: Vec<String>) {
        for name in &outputs {
            self.get_or_create_value(name, None);
        }
        self.outputs = outputs;
    }

    pub fn is_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|input| input == name)
    }

    pub fn is_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|output| output == name)
    }

    // ---- recompute side table ----

    pub fn recompute_twin(&self, name: &str) -> Option<&str> {
        self.recompute_twins.get(name).map(String::as_str)
    }

    pub fn record_recompute_twin(&mut self, original: &str, twin: &str) {
        self.recompute_twins
            .insert(original.to_string(), twin.to_string());
    }

    pub fn recompute_twins(&self) -> impl Iterator<Item = (&str, &str)> {
        self.recompute_twins
            .iter()
            .map(|(original, twin)| (original.as_str(), twin.as_str()))
    }

    // ---- validation ----

    /// Rebuilds the indices and checks the structural invariants: single
    /// producers, no produced graph inputs, every consumed name defined, every
    /// output defined, acyclic.
    pub fn resolve(&mut self) -> GraphResult<()> {
        self.indices = GraphIndices::build(self.nodes.values())?;

        let mut seen_inputs = HashSet::new();
        for input in &self.inputs {
            if !seen_inputs.insert(input.as_str()) {
                return Err(GraphError::invalid(format!(
                    "graph input `{input}` is declared twice"
                )));
            }
            if let Some(producer) = self.producer_of(input) {
                return Err(GraphError::invalid(format!(
                    "graph input `{input}` is also produced by node `{}`",
                    producer.name
                )));
            }
        }

        for node in self.nodes.values() {
            for input in node.input_names() {
                if !self.is_defined(input) {
                    return Err(GraphError::invalid(format!(
                        "input `{input}` of node `{}` has no producer and is neither a graph input nor an initializer",
                        node.name
                    )));
                }
            }
        }

        for output in &self.outputs {
            if !self.is_defined(output) {
                return Err(GraphError::invalid(format!(
                    "graph output `{output}` is never defined"
                )));
            }
        }

        let names: Vec<String> = self
            .nodes
            .values()
            .flat_map(|node| node.inputs.iter().chain(node.outputs.iter()))
            .filter(|name| !name.is_empty())
            .cloned()
            .collect();
        for name in names {
            self.get_or_create_value(&name, None);
        }

        self.topological_order()?;
        Ok(())
    }

    fn is_defined(&self, name: &str) -> bool {
        self.indices.producer(name).is_some() || self.is_input(name) || self.is_initializer(name)
    }
}

/// Input slots of `node` that read `name`.
pub(crate) fn input_slots_of(node: &Node, name: &str) -> Vec<usize> {
    node.inputs
        .iter()
        .enumerate()
        .filter(|(_, input)| *input == name)
        .map(|(slot, _)| slot)
        .collect()
}

fn next_id_after(id: NodeId) -> GraphResult<u32> {
    id.0
        .checked_add(1)
        .ok_or_else(|| GraphError::invalid(format!("node id {id} exhausts the id space")))
}

pub(crate) fn first_free(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Serialized layout of a [`Graph`]; indices are rebuilt on load.
#[derive(Serialize, Deserialize)]
struct GraphRepr {
    name: String,
    nodes: Vec<Node>,
    #[serde(default)]
    values: Vec<ValueInfo>,
    #[serde(default)]
    initializers: BTreeMap<String, Initializer>,
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(default)]
    next_node_id: u32,
    #[serde(default)]
    recompute_twins: BTreeMap<String, String>,
}

impl From<Graph> for GraphRepr {
    fn from(graph: Graph) -> Self {
        GraphRepr {
            name: graph.name,
            nodes: graph.nodes.into_values().collect(),
            values: graph.values.into_values().collect(),
            initializers: graph.initializers,
            inputs: graph.inputs,
            outputs: graph.outputs,
            next_node_id: graph.next_node_id,
            recompute_twins: graph.recompute_twins,
        }
    }
}

impl TryFrom<GraphRepr> for Graph {
    type Error = GraphError;

    fn try_from(repr: GraphRepr) -> Result<Self, Self::Error> {
        let mut nodes = BTreeMap::new();
        let mut next_node_id = repr.next_node_id;
        for node in repr.nodes {
            next_node_id = next_node_id.max(next_id_after(node.id)?);
            let id = node.id;
            if nodes.insert(id, node).is_some() {
                return Err(GraphError::invalid(format!("node id {id} appears twice")));
            }
        }
        let indices = GraphIndices::build(nodes.values())?;
        Ok(Graph {
            name: repr.name,
            nodes,
            values: repr
                .values
                .into_iter()
                .map(|value| (value.name.clone(), value))
                .collect(),
            initializers: repr.initializers,
            inputs: repr.inputs,
            outputs: repr.outputs,
            next_node_id,
            recompute_twins: repr.recompute_twins,
            indices,
        })
    }
}
