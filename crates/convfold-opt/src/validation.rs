//! Graph validation pass.
//!
//! Checks structural invariants of a graph and logs warnings for problems
//! found. This pass never modifies the graph.

use convfold_ir::Graph;

use crate::{GraphPass, PassError};

/// Validates graph invariants. Returns `false` (never modifies the graph).
#[derive(Debug, Default)]
pub struct GraphValidation;

impl GraphPass for GraphValidation {
    fn name(&self) -> &str {
        "graph-validation"
    }

    fn apply(&self, graph: &mut Graph, graph_level: usize) -> Result<bool, PassError> {
        let problems = validate_graph(graph, graph_level);
        if problems > 0 {
            log::warn!("graph '{}': {problems} problem(s) found", graph.name);
        }
        Ok(false)
    }
}

/// Walks `graph` and its nested graphs, returning the number of problems.
fn validate_graph(graph: &Graph, graph_level: usize) -> usize {
    let mut problems = 0;

    for tensor in graph.initializers() {
        if let Err(err) = tensor.validate() {
            log::warn!("graph '{}': initializer {err}", graph.name);
            problems += 1;
        }
    }

    if let Err(err) = graph.topological_order() {
        log::warn!("{err}");
        problems += 1;
    }

    for node in graph.nodes() {
        for &v in node.inputs.iter().flatten() {
            let defined = graph.producer(v).is_some()
                || graph.is_graph_input(v)
                || graph.initializer_for(v).is_some();
            // Nested graphs may read names of an enclosing scope.
            if !defined && graph_level == 0 {
                let name = graph.value(v).map_or("<unknown>", |info| info.name.as_str());
                log::warn!(
                    "graph '{}': node '{}' reads undefined value '{name}'",
                    graph.name,
                    node.name
                );
                problems += 1;
            }
        }
        for subgraph in node.subgraphs() {
            problems += validate_graph(subgraph, graph_level + 1);
        }
    }

    for &v in &graph.outputs {
        let defined = graph.producer(v).is_some()
            || graph.is_graph_input(v)
            || graph.initializer_for(v).is_some();
        if !defined && graph_level == 0 {
            let name = graph.value(v).map_or("<unknown>", |info| info.name.as_str());
            log::warn!("graph '{}': output '{name}' has no producer", graph.name);
            problems += 1;
        }
    }

    problems
}
