//! Dataflow graph: nodes, tensor values and initializers.
//!
//! Nodes live in an arena indexed by [`NodeId`]. Removing a node leaves a
//! hole, so ids held by a pass stay valid (or resolve to `None`) for the
//! lifetime of the graph. Edges are implicit: a node input that names the
//! same [`ValueId`] as another node's output is an edge.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::error::IrError;
use crate::op::OpType;
use crate::tensor::{DataType, Tensor};

/// Stable identity of a node within its graph.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identity of a tensor value within its graph.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ValueId(pub u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A single tensor dimension.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum Dimension {
    /// Known size.
    Fixed(i64),
    /// Unknown size, optionally named.
    Dynamic(Option<String>),
}

/// Metadata about a tensor value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValueInfo {
    /// Name, unique within the graph.
    pub name: String,
    /// Element type, if known.
    pub dtype: Option<DataType>,
    /// Shape, if known.
    pub shape: Option<Vec<Dimension>>,
}

impl ValueInfo {
    /// A value with a name and nothing else known about it.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// A value with a fully known static shape.
    pub fn tensor(name: impl Into<String>, dtype: DataType, dims: &[i64]) -> Self {
        Self {
            name: name.into(),
            dtype: Some(dtype),
            shape: Some(dims.iter().map(|&d| Dimension::Fixed(d)).collect()),
        }
    }
}

/// A node attribute value.
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeValue {
    Float(f32),
    Int(i64),
    String(Vec<u8>),
    Tensor(Tensor),
    /// A nested graph body (`If` branches, `Loop`/`Scan` bodies).
    Graph(Graph),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
    Strings(Vec<Vec<u8>>),
    Tensors(Vec<Tensor>),
    Graphs(Vec<Graph>),
}

/// A named node attribute.
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
}

/// An operator instance.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op: OpType,
    /// Ordered inputs; `None` marks an omitted optional operand.
    pub inputs: Vec<Option<ValueId>>,
    /// Ordered outputs.
    pub outputs: Vec<ValueId>,
    pub attributes: Vec<Attribute>,
    /// Backend the node is assigned to run on. Empty when unassigned.
    pub execution_target: String,
}

impl Node {
    /// The value in input slot `index`, if the slot exists and is filled.
    pub fn input(&self, index: usize) -> Option<ValueId> {
        self.inputs.get(index).copied().flatten()
    }

    /// Looks up an attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| &a.value)
    }

    /// Returns `true` if any attribute holds a nested graph.
    pub fn has_subgraphs(&self) -> bool {
        self.attributes.iter().any(|a| {
            matches!(
                a.value,
                AttributeValue::Graph(_) | AttributeValue::Graphs(_)
            )
        })
    }

    /// Iterates every nested graph owned by this node.
    pub fn subgraphs(&self) -> impl Iterator<Item = &Graph> {
        self.attributes
            .iter()
            .flat_map(|a| match &a.value {
                AttributeValue::Graph(g) => std::slice::from_ref(g),
                AttributeValue::Graphs(gs) => gs.as_slice(),
                _ => &[],
            })
    }

    /// Names the node's nested graphs read from the enclosing scope.
    pub fn outer_scope_references(&self) -> BTreeSet<String> {
        self.subgraphs()
            .flat_map(Graph::outer_scope_references)
            .collect()
    }

    /// Returns `true` if a nested graph reads `name` from the enclosing scope.
    pub fn captures(&self, name: &str) -> bool {
        self.has_subgraphs() && self.outer_scope_references().contains(name)
    }

    /// Iterates every nested graph owned by this node, mutably.
    pub fn subgraphs_mut(&mut self) -> impl Iterator<Item = &mut Graph> {
        self.attributes
            .iter_mut()
            .flat_map(|a| match &mut a.value {
                AttributeValue::Graph(g) => std::slice::from_mut(g),
                AttributeValue::Graphs(gs) => gs.as_mut_slice(),
                _ => &mut [],
            })
    }
}

/// A dataflow graph.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Graph {
    /// Human-readable name.
    pub name: String,
    /// Node arena. Removed nodes leave `None`.
    nodes: Vec<Option<Node>>,
    /// Value table, indexed by [`ValueId`].
    values: Vec<ValueInfo>,
    value_ids: HashMap<String, ValueId>,
    /// Graph-level inputs.
    pub inputs: Vec<ValueId>,
    /// Graph-level outputs.
    pub outputs: Vec<ValueId>,
    /// Constant tensors keyed by value name.
    initializers: BTreeMap<String, Tensor>,
}

impl Graph {
    /// Creates an empty graph.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    // ---- Values ----

    /// Registers a value and returns its id.
    ///
    /// # Panics
    ///
    /// Panics if a value with the same name already exists.
    pub fn add_value(&mut self, info: ValueInfo) -> ValueId {
        assert!(
            !self.value_ids.contains_key(&info.name),
            "add_value: value '{}' already registered",
            info.name,
        );
        let id = ValueId(self.values.len() as u32);
        self.value_ids.insert(info.name.clone(), id);
        self.values.push(info);
        id
    }

    /// Returns the id of the value called `name`, registering it if needed.
    pub fn intern_value(&mut self, name: &str) -> ValueId {
        match self.value_ids.get(name) {
            Some(&id) => id,
            None => self.add_value(ValueInfo::named(name)),
        }
    }

    pub fn value(&self, id: ValueId) -> Option<&ValueInfo> {
        self.values.get(id.index())
    }

    pub fn value_mut(&mut self, id: ValueId) -> Option<&mut ValueInfo> {
        self.values.get_mut(id.index())
    }

    /// Looks up a value id by name.
    pub fn value_id(&self, name: &str) -> Option<ValueId> {
        self.value_ids.get(name).copied()
    }

    /// Number of registered values.
    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if `value` is a graph-level input.
    pub fn is_graph_input(&self, value: ValueId) -> bool {
        self.inputs.contains(&value)
    }

    /// Returns `true` if `value` is a graph-level output.
    pub fn is_graph_output(&self, value: ValueId) -> bool {
        self.outputs.contains(&value)
    }

    // ---- Nodes ----

    /// Adds a node and returns its id.
    ///
    /// # Panics
    ///
    /// Panics if any input or output value has not been registered, or if an
    /// output value already has a producer (each value has at most one).
    pub fn add_node<I>(
        &mut self,
        op: OpType,
        inputs: impl IntoIterator<Item = I>,
        outputs: Vec<ValueId>,
        name: impl Into<String>,
    ) -> NodeId
    where
        I: Into<Option<ValueId>>,
    {
        let name = name.into();
        let inputs: Vec<Option<ValueId>> = inputs.into_iter().map(Into::into).collect();

        for &v in inputs.iter().flatten().chain(outputs.iter()) {
            assert!(
                v.index() < self.values.len(),
                "add_node({name}): ValueId({}) not registered in graph",
                v.0,
            );
        }

        for &out in &outputs {
            if let Some(existing) = self.producer(out) {
                panic!(
                    "add_node({name}): ValueId({}) already produced by node {:?}",
                    out.0, existing.name,
                );
            }
        }

        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(Node {
            id,
            name,
            op,
            inputs,
            outputs,
            attributes: Vec::new(),
            execution_target: String::new(),
        }));
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Live nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().flatten()
    }

    /// A snapshot of the live node ids, safe to iterate while mutating.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes().map(|n| n.id).collect()
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }

    /// Removes a node and returns it.
    ///
    /// Values the node referenced stay registered. A consumer still reading
    /// one of its outputs is left without a producer for that input.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Node, IrError> {
        self.nodes
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or(IrError::UnknownNode(id))
    }

    // ---- Edge queries ----

    /// The node that produces `value`, if any.
    pub fn producer(&self, value: ValueId) -> Option<&Node> {
        self.nodes().find(|n| n.outputs.contains(&value))
    }

    /// Ids of the nodes reading `value`, each listed once, in id order.
    ///
    /// Includes nodes that only read the value implicitly from a nested graph.
    pub fn consumers(&self, value: ValueId) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes()
            .filter(|n| n.inputs.contains(&Some(value)))
            .map(|n| n.id)
            .collect();
        for id in self.implicit_consumers(value) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids.sort();
        ids
    }

    /// Ids of the nodes whose nested graphs capture `value` from this scope.
    pub fn implicit_consumers(&self, value: ValueId) -> Vec<NodeId> {
        let Some(info) = self.value(value) else {
            return Vec::new();
        };
        self.nodes()
            .filter(|n| n.captures(&info.name))
            .map(|n| n.id)
            .collect()
    }

    /// Number of edges leaving any output of `id`.
    ///
    /// Each (consumer, input slot) pair is one edge; a node capturing an
    /// output inside a nested graph adds one more edge per captured value.
    pub fn output_edge_count(&self, id: NodeId) -> usize {
        let Some(node) = self.node(id) else {
            return 0;
        };
        let explicit = self
            .nodes()
            .flat_map(|consumer| consumer.inputs.iter().flatten())
            .filter(|v| node.outputs.contains(*v))
            .count();
        let implicit: usize = node
            .outputs
            .iter()
            .map(|&v| self.implicit_consumers(v).len())
            .sum();
        explicit + implicit
    }

    /// Number of inputs of `id` fed by another node of this graph.
    ///
    /// Initializers and graph inputs have no producer and do not count.
    /// Values captured by the node's nested graphs count once each.
    pub fn input_edge_count(&self, id: NodeId) -> usize {
        let Some(node) = self.node(id) else {
            return 0;
        };
        let explicit = node
            .inputs
            .iter()
            .flatten()
            .filter(|&&v| self.producer(v).is_some())
            .count();
        let implicit = node
            .outer_scope_references()
            .iter()
            .filter_map(|name| self.value_id(name))
            .filter(|&v| self.producer(v).is_some())
            .count();
        explicit + implicit
    }

    /// Names read by this graph's nodes (or nested graphs) that are not
    /// defined here: neither a graph input, an initializer nor a node output.
    pub fn outer_scope_references(&self) -> BTreeSet<String> {
        let mut defined: HashSet<&str> = HashSet::new();
        for &v in &self.inputs {
            defined.insert(&self.values[v.index()].name);
        }
        for name in self.initializers.keys() {
            defined.insert(name);
        }
        for node in self.nodes() {
            for &v in &node.outputs {
                defined.insert(&self.values[v.index()].name);
            }
        }

        let mut referenced = BTreeSet::new();
        for node in self.nodes() {
            for &v in node.inputs.iter().flatten() {
                let name = &self.values[v.index()].name;
                if !defined.contains(name.as_str()) {
                    referenced.insert(name.clone());
                }
            }
            for name in node.outer_scope_references() {
                if !defined.contains(name.as_str()) {
                    referenced.insert(name);
                }
            }
        }
        referenced
    }

    /// Returns `true` if any output of `id` is a graph-level output.
    pub fn produces_graph_output(&self, id: NodeId) -> bool {
        self.node(id)
            .is_some_and(|n| n.outputs.iter().any(|&v| self.is_graph_output(v)))
    }

    // ---- Initializers ----

    /// Looks up an initializer by value name.
    pub fn initializer(&self, name: &str) -> Option<&Tensor> {
        self.initializers.get(name)
    }

    /// Looks up the initializer backing `value`, if it is a constant.
    pub fn initializer_for(&self, value: ValueId) -> Option<&Tensor> {
        self.value(value)
            .and_then(|info| self.initializers.get(&info.name))
    }

    /// All initializers, ordered by name.
    pub fn initializers(&self) -> impl Iterator<Item = &Tensor> {
        self.initializers.values()
    }

    /// Number of initializers.
    pub fn initializer_count(&self) -> usize {
        self.initializers.len()
    }

    /// Inserts an initializer and returns the id of the value it backs.
    ///
    /// The value is registered under the tensor's name if it does not exist
    /// yet. An existing initializer with the same name is overwritten.
    pub fn add_initializer(&mut self, tensor: Tensor) -> ValueId {
        let id = self.intern_value(&tensor.name);
        let info = &mut self.values[id.index()];
        info.dtype = Some(tensor.dtype);
        info.shape = Some(tensor.dims.iter().map(|&d| Dimension::Fixed(d)).collect());
        self.initializers.insert(tensor.name.clone(), tensor);
        id
    }

    /// Removes an initializer by name. The backing value stays registered.
    pub fn remove_initializer(&mut self, name: &str) -> Option<Tensor> {
        self.initializers.remove(name)
    }

    /// Swaps in a new tensor under an existing initializer name.
    ///
    /// Returns the superseded tensor. Nodes reading the value keep reading
    /// it without any rewiring.
    pub fn replace_initializer(&mut self, tensor: Tensor) -> Result<Tensor, IrError> {
        let old = self
            .remove_initializer(&tensor.name)
            .ok_or_else(|| IrError::UnknownInitializer(tensor.name.clone()))?;
        self.add_initializer(tensor);
        Ok(old)
    }

    /// Drops initializers that no node (including nodes of nested graphs)
    /// reads and that are not graph inputs or outputs, here and in every
    /// nested graph. Returns the count.
    pub fn remove_unreferenced_initializers(&mut self) -> usize {
        let mut referenced = HashSet::new();
        self.collect_referenced_names(&mut referenced);
        for &v in self.inputs.iter().chain(self.outputs.iter()) {
            referenced.insert(self.values[v.index()].name.clone());
        }

        let before = self.initializers.len();
        self.initializers.retain(|name, _| referenced.contains(name));
        let mut removed = before - self.initializers.len();
        for node in self.nodes.iter_mut().flatten() {
            for sub in node.subgraphs_mut() {
                removed += sub.remove_unreferenced_initializers();
            }
        }
        removed
    }

    fn collect_referenced_names(&self, names: &mut HashSet<String>) {
        for node in self.nodes() {
            for &v in node.inputs.iter().flatten() {
                names.insert(self.values[v.index()].name.clone());
            }
            for sub in node.subgraphs() {
                sub.collect_referenced_names(names);
            }
        }
    }

    // ---- Ordering ----

    /// Returns nodes in topological order.
    ///
    /// The ordering is deterministic: among ready nodes, the one with the
    /// smaller [`NodeId`] is emitted first. Fails with [`IrError::Cycle`]
    /// if some nodes depend on each other.
    pub fn topological_order(&self) -> Result<Vec<&Node>, IrError> {
        let live: Vec<&Node> = self.nodes().collect();
        let position: HashMap<NodeId, usize> =
            live.iter().enumerate().map(|(i, n)| (n.id, i)).collect();

        let mut value_producer: HashMap<ValueId, usize> = HashMap::new();
        for (i, node) in live.iter().enumerate() {
            for &out in &node.outputs {
                value_producer.insert(out, i);
            }
        }

        let n = live.len();
        let mut in_degree = vec![0usize; n];
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (ci, node) in live.iter().enumerate() {
            for inp in node.inputs.iter().flatten() {
                if let Some(&pi) = value_producer.get(inp) {
                    in_degree[ci] += 1;
                    consumers[pi].push(ci);
                }
            }
        }

        // Kahn's algorithm, ready set ordered by NodeId.
        let mut ready: BTreeSet<NodeId> = live
            .iter()
            .zip(&in_degree)
            .filter(|(_, deg)| **deg == 0)
            .map(|(node, _)| node.id)
            .collect();

        let mut result: Vec<&Node> = Vec::with_capacity(n);
        while let Some(id) = ready.pop_first() {
            let idx = position[&id];
            result.push(live[idx]);
            for &ci in &consumers[idx] {
                in_degree[ci] -= 1;
                if in_degree[ci] == 0 {
                    ready.insert(live[ci].id);
                }
            }
        }

        if result.len() < n {
            return Err(IrError::Cycle {
                graph: self.name.clone(),
                visited: result.len(),
                total: n,
            });
        }
        Ok(result)
    }
}
