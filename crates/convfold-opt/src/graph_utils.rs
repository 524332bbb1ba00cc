//! Graph queries and edits shared by rewrite passes.

use std::collections::BTreeSet;

use convfold_ir::{Graph, IrError, Node, NodeId, ValueId};

/// Returns `true` if `node` may be rewritten by a pass restricted to
/// `targets`. An empty set accepts every execution target.
pub fn is_supported_execution_target(node: &Node, targets: &BTreeSet<String>) -> bool {
    targets.is_empty() || targets.contains(&node.execution_target)
}

/// The single node reading the outputs of `id`, if there is exactly one
/// edge leaving it.
pub fn unique_consumer(graph: &Graph, id: NodeId) -> Option<NodeId> {
    if graph.output_edge_count(id) != 1 {
        return None;
    }
    let node = graph.node(id)?;
    node.outputs
        .iter()
        .flat_map(|&v| graph.consumers(v))
        .next()
}

/// Returns `true` if `value` is read by some node other than `reader`.
pub fn has_other_readers(graph: &Graph, value: ValueId, reader: NodeId) -> bool {
    graph.consumers(value).iter().any(|&id| id != reader)
}

/// Points every explicit input slot reading `from` at `to`.
///
/// Returns the number of slots rewritten. Nested graphs that capture `from`
/// by name are not touched.
pub fn replace_consumer_inputs(
    graph: &mut Graph,
    from: ValueId,
    to: ValueId,
) -> Result<usize, IrError> {
    let readers: Vec<NodeId> = graph
        .nodes()
        .filter(|n| n.inputs.contains(&Some(from)))
        .map(|n| n.id)
        .collect();

    let mut rewritten = 0;
    for id in readers {
        let node = graph.node_mut(id).ok_or(IrError::UnknownNode(id))?;
        for slot in node.inputs.iter_mut().filter(|s| **s == Some(from)) {
            *slot = Some(to);
            rewritten += 1;
        }
    }
    Ok(rewritten)
}
