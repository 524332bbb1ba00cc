//! Error types for the convfold IR.

use crate::graph::NodeId;
use crate::tensor::DataType;

/// Errors that can occur when constructing or mutating a graph.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// A node id does not refer to a live node.
    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),

    /// An initializer was expected under a name that has none.
    #[error("no initializer named '{0}'")]
    UnknownInitializer(String),

    /// A tensor has a negative or overflowing dimension.
    #[error("tensor '{0}' has invalid dims {1:?}")]
    InvalidDims(String, Vec<i64>),

    /// A tensor's declared type disagrees with its buffer.
    #[error("tensor '{tensor}' declared as {declared:?} but stores {stored:?}")]
    DataTypeMismatch {
        tensor: String,
        declared: DataType,
        stored: DataType,
    },

    /// A tensor buffer does not hold as many elements as its dims imply.
    #[error("tensor '{tensor}' expects {expected} elements, found {actual}")]
    ElementCountMismatch {
        tensor: String,
        expected: usize,
        actual: usize,
    },

    /// Nodes depend on each other in a loop.
    #[error("graph '{graph}' contains a cycle ({visited} of {total} nodes ordered)")]
    Cycle {
        graph: String,
        visited: usize,
        total: usize,
    },
}
