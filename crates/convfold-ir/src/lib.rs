//! convfold intermediate representation.
//!
//! A dataflow graph of operator nodes over named tensor values, with
//! constant initializers and nested sub-graphs for control-flow operators.
//! Node storage is an arena keyed by stable [`NodeId`]s so that passes can
//! hold ids across mutations.

mod display;
mod error;
pub mod graph;
mod op;
mod tensor;

pub use display::dump_graph;
pub use error::IrError;
pub use graph::{
    Attribute, AttributeValue, Dimension, Graph, Node, NodeId, ValueId, ValueInfo,
};
pub use op::{ONNX_DOMAIN, ONNX_DOMAIN_ALIAS, OpKind, OpType, is_onnx_domain};
pub use tensor::{DataType, Tensor, TensorData};

pub use half::{bf16, f16};

/// A model: a main graph plus the opset versions it was authored against.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Model {
    /// The main graph.
    pub graph: Graph,
    /// Imported opsets as `(domain, version)` pairs.
    pub opset_imports: Vec<(String, i64)>,
    /// Tool that produced the model.
    pub producer_name: String,
    /// ONNX IR version of the serialized form.
    pub ir_version: i64,
}
